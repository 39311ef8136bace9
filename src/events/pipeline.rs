//! Prioritized Event Pipeline
//!
//! Ingestion: registry lookup, schema validation, per-player token-bucket
//! rate limiting, sanitization, then enqueue into one of four bounded FIFO
//! queues. A single worker drains CRITICAL before HIGH before NORMAL before
//! LOW and releases envelopes in that order to the router channel, so
//! downstream processing preserves strict priority.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

use crate::events::registry::EventRegistry;
use crate::events::{EventEnvelope, EventKind, EventPayload, EventPriority, Origin, Target};
use crate::game::player::PlayerId;
use crate::network::protocol::{BackpressureInfo, ClientMessage, FieldError, ServerMessage};
use crate::now_ms;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Queue capacity per priority, indexed by rank.
    pub queue_caps: [usize; 4],
    /// Capacity of the release channel to the router.
    pub release_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_caps: [256, 1024, 4096, 4096],
            release_buffer: 1024,
        }
    }
}

/// Why a submission did not enter a queue.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    /// No registry entry for this event.
    #[error("unknown event type")]
    UnknownEvent,

    /// Schema validation failed.
    #[error("schema validation failed")]
    Validation(Vec<FieldError>),

    /// Per-player rate limit exceeded.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },

    /// The event was shed under backpressure.
    #[error("dropped under backpressure")]
    Dropped { priority: EventPriority },

    /// The CRITICAL queue is full. The room cannot publish terminal
    /// events and must be force-ended.
    #[error("critical queue overflow")]
    CriticalOverflow,
}

/// Per-player token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    /// Take one token; on failure, return the wait until the next token.
    fn try_take(&mut self, rate: f64, burst: f64) -> Result<(), u64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait_secs = (1.0 - self.tokens) / rate;
            Err((wait_secs * 1000.0).ceil() as u64)
        }
    }
}

/// Exponential moving average, for latency tracking.
#[derive(Debug, Clone, Copy, Default)]
struct Ema {
    value: f64,
    initialized: bool,
}

impl Ema {
    fn record(&mut self, sample: f64) {
        if self.initialized {
            self.value = self.value * 0.9 + sample * 0.1;
        } else {
            self.value = sample;
            self.initialized = true;
        }
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub enqueued: AtomicU64,
    pub released: AtomicU64,
    pub rejected_schema: AtomicU64,
    pub rate_limited: AtomicU64,
    pub dropped_low: AtomicU64,
    pub dropped_normal: AtomicU64,
}

/// Snapshot of pipeline counters plus latency estimates.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub released: u64,
    pub rejected_schema: u64,
    pub rate_limited: u64,
    pub dropped_low: u64,
    pub dropped_normal: u64,
    pub pending: usize,
    /// EMA of worker processing latency in milliseconds.
    pub processing_latency_ms: f64,
}

struct QueueSet {
    queues: [VecDeque<EventEnvelope>; 4],
}

impl QueueSet {
    fn new() -> Self {
        Self {
            queues: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Pop the oldest event of the highest pending priority.
    fn pop_strict(&mut self) -> Option<EventEnvelope> {
        self.queues.iter_mut().find_map(|q| q.pop_front())
    }

    /// Shed one event, LOW first then NORMAL. Returns the shed priority.
    fn shed(&mut self) -> Option<EventPriority> {
        if self.queues[EventPriority::Low.rank()].pop_front().is_some() {
            return Some(EventPriority::Low);
        }
        if self.queues[EventPriority::Normal.rank()].pop_front().is_some() {
            return Some(EventPriority::Normal);
        }
        None
    }
}

/// The prioritized, rate-limited event pipeline.
pub struct EventPipeline {
    registry: EventRegistry,
    config: PipelineConfig,
    queues: Mutex<QueueSet>,
    notify: Notify,
    seq: AtomicU64,
    buckets: Mutex<BTreeMap<(PlayerId, EventKind), TokenBucket>>,
    player_latency: Mutex<BTreeMap<PlayerId, Ema>>,
    processing_latency: Mutex<Ema>,
    pub metrics: PipelineMetrics,
}

impl EventPipeline {
    /// Create the pipeline and spawn its worker. Returns the handle and the
    /// release channel the router consumes; envelopes arrive there in
    /// strict priority order.
    pub fn spawn(
        registry: EventRegistry,
        config: PipelineConfig,
    ) -> (Arc<EventPipeline>, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(config.release_buffer);
        let pipeline = Arc::new(EventPipeline {
            registry,
            config,
            queues: Mutex::new(QueueSet::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(1),
            buckets: Mutex::new(BTreeMap::new()),
            player_latency: Mutex::new(BTreeMap::new()),
            processing_latency: Mutex::new(Ema::default()),
            metrics: PipelineMetrics::default(),
        });

        let worker = pipeline.clone();
        tokio::spawn(async move {
            worker.run_worker(tx).await;
        });

        (pipeline, rx)
    }

    /// Submit a client event: registry lookup, schema validation, rate
    /// limit, sanitization, enqueue.
    pub async fn submit_inbound(
        &self,
        from: PlayerId,
        socket_id: u64,
        mut message: ClientMessage,
        target: Target,
        client_ts: Option<u64>,
    ) -> Result<(), SubmitError> {
        let kind = EventKind::of_client_message(&message).ok_or(SubmitError::UnknownEvent)?;
        let spec = self.registry.spec(kind).ok_or(SubmitError::UnknownEvent)?;

        if let Err(errors) = self.registry.validate(&message) {
            self.metrics.rejected_schema.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::Validation(errors));
        }

        if let Some(rate) = spec.rate_limit {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets
                .entry((from.clone(), kind))
                .or_insert_with(|| TokenBucket::new(spec.burst));
            if let Err(retry_after_ms) = bucket.try_take(rate, spec.burst) {
                self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                return Err(SubmitError::RateLimited { retry_after_ms });
            }
        }

        if spec.sanitize {
            self.registry.sanitize(&mut message);
        }

        // Track a per-player one-way latency estimate from the client's own
        // clock. Skew makes it an estimate, not a measurement.
        if let Some(ts) = client_ts {
            let delta = now_ms().saturating_sub(ts) as f64;
            if delta < 10_000.0 {
                self.player_latency
                    .lock()
                    .await
                    .entry(from.clone())
                    .or_default()
                    .record(delta);
            }
        }

        let envelope = self.envelope(
            kind,
            spec.priority,
            Origin::Player(from),
            target,
            EventPayload::Inbound { socket_id, message },
            client_ts,
        );
        self.enqueue(envelope).await
    }

    /// Submit a system event for fan-out. Skips schema validation and rate
    /// limiting: the origin is trusted.
    pub async fn submit_system(
        &self,
        kind: EventKind,
        message: ServerMessage,
        target: Target,
        exclude_socket: Option<u64>,
    ) -> Result<(), SubmitError> {
        let priority = self
            .registry
            .spec(kind)
            .map(|s| s.priority)
            .ok_or(SubmitError::UnknownEvent)?;
        let envelope = self.envelope(
            kind,
            priority,
            Origin::System,
            target,
            EventPayload::Outbound {
                message,
                exclude_socket,
            },
            None,
        );
        self.enqueue(envelope).await
    }

    fn envelope(
        &self,
        kind: EventKind,
        priority: EventPriority,
        origin: Origin,
        target: Target,
        payload: EventPayload,
        client_ts: Option<u64>,
    ) -> EventEnvelope {
        EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            priority,
            origin,
            target,
            payload,
            client_ts,
            enqueue_ts: now_ms(),
            enqueued_at: Instant::now(),
        }
    }

    async fn enqueue(&self, envelope: EventEnvelope) -> Result<(), SubmitError> {
        let priority = envelope.priority;
        let cap = self.config.queue_caps[priority.rank()];
        {
            let mut queues = self.queues.lock().await;
            if queues.queues[priority.rank()].len() >= cap {
                if priority == EventPriority::Critical {
                    warn!("critical event queue overflow");
                    return Err(SubmitError::CriticalOverflow);
                }
                // Shed load from the bottom up; the incoming event is only
                // dropped when nothing lower-priority is left to shed.
                let shed = queues.shed();
                match shed {
                    Some(EventPriority::Low) => {
                        self.metrics.dropped_low.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(EventPriority::Normal) => {
                        self.metrics.dropped_normal.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
                let incoming_dropped = queues.queues[priority.rank()].len() >= cap;
                if incoming_dropped {
                    let counter = match priority {
                        EventPriority::Low => &self.metrics.dropped_low,
                        _ => &self.metrics.dropped_normal,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }

                // The overflow itself goes on the wire as a backpressure
                // event toward the flooded target
                let dropped = shed.is_some() as u32 + incoming_dropped as u32;
                self.queue_backpressure_notice(
                    &mut queues,
                    envelope.target.clone(),
                    shed.unwrap_or(priority),
                    dropped,
                );

                if incoming_dropped {
                    debug!(priority = priority.name(), "event shed under backpressure");
                    self.notify.notify_one();
                    return Err(SubmitError::Dropped { priority });
                }
            }
            queues.queues[priority.rank()].push_back(envelope);
        }
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue a `backpressure` notice directly into the HIGH queue. Runs
    /// under the queue lock from the shed path, so it must not recurse into
    /// `enqueue`; when even HIGH is full the notice is abandoned.
    fn queue_backpressure_notice(
        &self,
        queues: &mut QueueSet,
        target: Target,
        dropped_priority: EventPriority,
        dropped: u32,
    ) {
        let rank = EventPriority::High.rank();
        if queues.queues[rank].len() >= self.config.queue_caps[rank] {
            return;
        }
        queues.queues[rank].push_back(EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind: EventKind::Backpressure,
            priority: EventPriority::High,
            origin: Origin::System,
            target,
            payload: EventPayload::Outbound {
                message: ServerMessage::Backpressure(BackpressureInfo {
                    dropped,
                    priority: dropped_priority.name().to_string(),
                }),
                exclude_socket: None,
            },
            client_ts: None,
            enqueue_ts: now_ms(),
            enqueued_at: Instant::now(),
        });
    }

    /// Worker: drain in strict priority order, release to the router, then
    /// sleep until the next enqueue.
    async fn run_worker(self: Arc<Self>, tx: mpsc::Sender<EventEnvelope>) {
        loop {
            let next = { self.queues.lock().await.pop_strict() };
            match next {
                Some(envelope) => {
                    let waited_ms = envelope.enqueued_at.elapsed().as_secs_f64() * 1000.0;
                    self.processing_latency.lock().await.record(waited_ms);
                    self.metrics.released.fetch_add(1, Ordering::Relaxed);
                    if tx.send(envelope).await.is_err() {
                        // Router gone: the server is shutting down
                        return;
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Latest one-way latency estimate for a player, in milliseconds.
    pub async fn latency_estimate(&self, player: &PlayerId) -> Option<u32> {
        self.player_latency
            .lock()
            .await
            .get(player)
            .filter(|e| e.initialized)
            .map(|e| e.value as u32)
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.metrics.enqueued.load(Ordering::Relaxed),
            released: self.metrics.released.load(Ordering::Relaxed),
            rejected_schema: self.metrics.rejected_schema.load(Ordering::Relaxed),
            rate_limited: self.metrics.rate_limited.load(Ordering::Relaxed),
            dropped_low: self.metrics.dropped_low.load(Ordering::Relaxed),
            dropped_normal: self.metrics.dropped_normal.load(Ordering::Relaxed),
            pending: self.queues.lock().await.pending(),
            processing_latency_ms: self.processing_latency.lock().await.value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{ChatRequest, ChatScope, PingRequest};
    use uuid::Uuid;

    fn ping() -> ClientMessage {
        ClientMessage::Ping(PingRequest { client_time: now_ms() })
    }

    fn chat(text: &str) -> ClientMessage {
        ClientMessage::ChatMessage(ChatRequest {
            message: text.to_string(),
            scope: ChatScope::All,
        })
    }

    #[tokio::test]
    async fn test_submit_and_release() {
        let (pipeline, mut rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        pipeline
            .submit_inbound(PlayerId::new("p1"), 1, ping(), Target::All, None)
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.kind, EventKind::Heartbeat);
        assert_eq!(envelope.priority, EventPriority::High);
    }

    #[tokio::test]
    async fn test_strict_priority_release_order() {
        let (pipeline, mut rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        let room = Target::Room(Uuid::new_v4());

        // Enqueue low before critical; critical must release first.
        pipeline
            .submit_system(
                EventKind::GameCleanup,
                ServerMessage::GameCleanupStarting,
                room.clone(),
                None,
            )
            .await
            .unwrap();
        pipeline
            .submit_system(
                EventKind::GameEnded,
                ServerMessage::GameCleanupStarting,
                room,
                None,
            )
            .await
            .unwrap();

        // Give the worker a moment to observe both
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        // Either the worker drained the low one before the critical arrived,
        // or the critical jumped the queue. Both released events must be
        // ordered by priority at each release point.
        if first.kind == EventKind::GameCleanup {
            assert_eq!(second.kind, EventKind::GameEnded);
        } else {
            assert_eq!(first.kind, EventKind::GameEnded);
            assert_eq!(second.kind, EventKind::GameCleanup);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let (pipeline, mut rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        let p = PlayerId::new("spammer");

        // chat: 1/s with burst 3
        let mut rejected = 0;
        for _ in 0..6 {
            if let Err(SubmitError::RateLimited { retry_after_ms }) = pipeline
                .submit_inbound(p.clone(), 1, chat("hi"), Target::All, None)
                .await
            {
                assert!(retry_after_ms > 0);
                rejected += 1;
            }
        }
        assert_eq!(rejected, 3);

        // Admitted ones are all released
        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        assert_eq!(pipeline.stats().await.rate_limited, 3);
    }

    #[tokio::test]
    async fn test_schema_rejection_counted() {
        let (pipeline, _rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        let result = pipeline
            .submit_inbound(PlayerId::new("p1"), 1, chat("   "), Target::All, None)
            .await;
        assert!(matches!(result, Err(SubmitError::Validation(_))));
        assert_eq!(pipeline.stats().await.rejected_schema, 1);
    }

    #[tokio::test]
    async fn test_unknown_event_rejected() {
        let (pipeline, _rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        let auth = ClientMessage::Authenticate(crate::network::protocol::AuthRequest {
            player_id: "p".into(),
            username: "u".into(),
            token: None,
        });
        let result = pipeline
            .submit_inbound(PlayerId::new("p1"), 1, auth, Target::All, None)
            .await;
        assert!(matches!(result, Err(SubmitError::UnknownEvent)));
    }

    #[tokio::test]
    async fn test_critical_overflow_reported() {
        let config = PipelineConfig {
            queue_caps: [1, 8, 8, 8],
            // Tiny release buffer and no reader: the worker stalls and
            // queues fill up.
            release_buffer: 1,
        };
        let (pipeline, rx) = EventPipeline::spawn(EventRegistry::standard(), config);
        // Keep rx alive but never read
        let _rx = rx;

        let room = Target::Room(Uuid::new_v4());
        let mut overflowed = false;
        for _ in 0..8 {
            if let Err(SubmitError::CriticalOverflow) = pipeline
                .submit_system(
                    EventKind::GameEnded,
                    ServerMessage::GameCleanupStarting,
                    room.clone(),
                    None,
                )
                .await
            {
                overflowed = true;
                break;
            }
        }
        assert!(overflowed);
    }

    #[tokio::test]
    async fn test_shed_emits_backpressure_event() {
        let config = PipelineConfig {
            queue_caps: [256, 8, 8, 1],
            release_buffer: 1,
        };
        let (pipeline, mut rx) = EventPipeline::spawn(EventRegistry::standard(), config);
        let room = Target::Room(Uuid::new_v4());

        // The LOW queue holds one event, the release buffer one more, and
        // the worker one in flight; the fourth submission must shed.
        for _ in 0..4 {
            let _ = pipeline
                .submit_system(
                    EventKind::GameCleanup,
                    ServerMessage::GameCleanupStarting,
                    room.clone(),
                    None,
                )
                .await;
        }
        assert!(pipeline.stats().await.dropped_low >= 1);

        // A backpressure envelope was queued at HIGH for the same target
        let mut found = None;
        for _ in 0..6 {
            let envelope = rx.recv().await.unwrap();
            if envelope.kind == EventKind::Backpressure {
                found = Some(envelope);
                break;
            }
        }
        let envelope = found.expect("backpressure event released");
        assert_eq!(envelope.priority, EventPriority::High);
        assert_eq!(envelope.target, room);
        match envelope.payload {
            EventPayload::Outbound {
                message: ServerMessage::Backpressure(info),
                ..
            } => {
                assert!(info.dropped >= 1);
                assert_eq!(info.priority, "LOW");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sanitization_applied_before_enqueue() {
        let (pipeline, mut rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        pipeline
            .submit_inbound(
                PlayerId::new("p1"),
                1,
                chat("<b>hey</b>"),
                Target::All,
                None,
            )
            .await
            .unwrap();
        let envelope = rx.recv().await.unwrap();
        if let EventPayload::Inbound { message, .. } = envelope.payload {
            if let ClientMessage::ChatMessage(c) = message {
                assert_eq!(c.message, "hey");
            } else {
                panic!("wrong payload");
            }
        } else {
            panic!("expected inbound payload");
        }
    }

    #[tokio::test]
    async fn test_latency_estimate_recorded() {
        let (pipeline, mut rx) =
            EventPipeline::spawn(EventRegistry::standard(), PipelineConfig::default());
        let p = PlayerId::new("p1");
        let sent_at = now_ms().saturating_sub(40);
        pipeline
            .submit_inbound(p.clone(), 1, ping(), Target::All, Some(sent_at))
            .await
            .unwrap();
        let _ = rx.recv().await;

        let estimate = pipeline.latency_estimate(&p).await.unwrap();
        assert!(estimate >= 30, "estimate {estimate}");
    }
}
