//! Matchmaker Queue
//!
//! FIFO queue with a skill gate that widens the longer a player waits.
//! A periodic pass pairs compatible entries oldest-first, expires entries
//! that waited too long, and purges disconnected players.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::game::player::PlayerId;
use crate::game::room::GameMode;

/// Matchmaker configuration.
#[derive(Debug, Clone)]
pub struct MatchmakerConfig {
    /// Maximum queued entries.
    pub max_queue_size: usize,
    /// Wait budget before an entry is expired with `queue_timeout`.
    pub max_wait_time: Duration,
    /// Starting Elo tolerance.
    pub skill_tolerance: i32,
    /// Tolerance added per `tolerance_step` of waiting.
    pub skill_tolerance_increase: i32,
    /// How often the tolerance widens.
    pub tolerance_step: Duration,
    /// Cap on simultaneously active rooms.
    pub max_concurrent_rooms: usize,
    /// Interval between pairing passes.
    pub pass_interval: Duration,
}

impl Default for MatchmakerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_wait_time: Duration::from_secs(120),
            skill_tolerance: 200,
            skill_tolerance_increase: 25,
            tolerance_step: Duration::from_secs(30),
            max_concurrent_rooms: 500,
            pass_interval: Duration::from_secs(1),
        }
    }
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,

    #[error("already queued")]
    AlreadyQueued,

    #[error("not queued")]
    NotQueued,

    #[error("room capacity reached")]
    RoomCapacity,
}

/// One waiting player.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player_id: PlayerId,
    pub display_name: String,
    pub elo: i32,
    pub mode: GameMode,
    pub region: Option<String>,
    pub joined_at: Instant,
    pub connected: bool,
}

impl QueueEntry {
    pub fn new(
        player_id: PlayerId,
        display_name: impl Into<String>,
        elo: i32,
        mode: GameMode,
        region: Option<String>,
    ) -> Self {
        Self {
            player_id,
            display_name: display_name.into(),
            elo,
            mode,
            region,
            joined_at: Instant::now(),
            connected: true,
        }
    }

    fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.joined_at)
    }
}

/// A completed pairing.
#[derive(Debug, Clone)]
pub struct PairedMatch {
    pub first: QueueEntry,
    pub second: QueueEntry,
    pub mode: GameMode,
    pub average_elo: i32,
    pub elo_difference: i32,
}

/// Outcome of a pairing pass.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub pairs: Vec<PairedMatch>,
    /// Entries expired after waiting past the budget.
    pub expired: Vec<QueueEntry>,
    /// Disconnected players purged from the queue.
    pub purged: Vec<PlayerId>,
}

/// Queue counters.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub size: usize,
    pub total_enqueued: u64,
    pub total_paired: u64,
    pub total_timeouts: u64,
}

/// The matchmaker.
pub struct Matchmaker {
    config: MatchmakerConfig,
    entries: RwLock<Vec<QueueEntry>>,
    total_enqueued: AtomicU64,
    total_paired: AtomicU64,
    total_timeouts: AtomicU64,
}

impl Matchmaker {
    pub fn new(config: MatchmakerConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(Vec::new()),
            total_enqueued: AtomicU64::new(0),
            total_paired: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MatchmakerConfig {
        &self.config
    }

    /// Enqueue a player. Returns the zero-based queue position.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<usize, QueueError> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull);
        }
        if entries.iter().any(|e| e.player_id == entry.player_id) {
            return Err(QueueError::AlreadyQueued);
        }
        debug!(player = %entry.player_id, mode = %entry.mode, "queued for matchmaking");
        entries.push(entry);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(entries.len() - 1)
    }

    /// Re-insert a player at the head of the queue (ready-up rewind).
    pub async fn enqueue_front(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull);
        }
        if entries.iter().any(|e| e.player_id == entry.player_id) {
            return Err(QueueError::AlreadyQueued);
        }
        entries.insert(0, entry);
        Ok(())
    }

    /// Remove a player from the queue.
    pub async fn dequeue(&self, player_id: &PlayerId) -> Result<QueueEntry, QueueError> {
        let mut entries = self.entries.write().await;
        let index = entries
            .iter()
            .position(|e| &e.player_id == player_id)
            .ok_or(QueueError::NotQueued)?;
        Ok(entries.remove(index))
    }

    /// Zero-based position in the queue.
    pub async fn position_of(&self, player_id: &PlayerId) -> Option<usize> {
        self.entries
            .read()
            .await
            .iter()
            .position(|e| &e.player_id == player_id)
    }

    /// Update an entry's connected flag; disconnected entries are purged
    /// on the next pass.
    pub async fn set_connected(&self, player_id: &PlayerId, connected: bool) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| &e.player_id == player_id) {
            entry.connected = connected;
        }
    }

    /// Current tolerance for an entry: the base plus one increase per full
    /// tolerance step waited.
    fn tolerance_of(&self, entry: &QueueEntry, now: Instant) -> i32 {
        let steps = (entry.waited(now).as_secs() / self.config.tolerance_step.as_secs().max(1))
            as i32;
        self.config.skill_tolerance + steps * self.config.skill_tolerance_increase
    }

    fn compatible(a: &QueueEntry, b: &QueueEntry, tol_a: i32, tol_b: i32) -> bool {
        if a.mode != b.mode {
            return false;
        }
        if let (Some(ra), Some(rb)) = (&a.region, &b.region) {
            if ra != rb {
                return false;
            }
        }
        (a.elo - b.elo).abs() <= tol_a.min(tol_b)
    }

    /// One pairing pass: purge disconnected entries, expire stale ones,
    /// then pair oldest-first while room capacity remains.
    pub async fn pass(&self, active_rooms: usize) -> PassOutcome {
        let now = Instant::now();
        let mut outcome = PassOutcome::default();
        let mut entries = self.entries.write().await;

        // Purge disconnected players first
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.connected {
                kept.push(entry);
            } else {
                outcome.purged.push(entry.player_id.clone());
            }
        }
        *entries = kept;

        // Expire entries that waited past the budget
        let max_wait = self.config.max_wait_time;
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.waited(now) >= max_wait {
                outcome.expired.push(entry);
            } else {
                kept.push(entry);
            }
        }
        *entries = kept;
        self.total_timeouts
            .fetch_add(outcome.expired.len() as u64, Ordering::Relaxed);

        // Pair oldest-first within the room budget
        let mut room_budget = self
            .config
            .max_concurrent_rooms
            .saturating_sub(active_rooms);
        let mut taken = vec![false; entries.len()];
        for i in 0..entries.len() {
            if taken[i] || room_budget == 0 {
                continue;
            }
            let tol_i = self.tolerance_of(&entries[i], now);
            for j in (i + 1)..entries.len() {
                if taken[j] {
                    continue;
                }
                let tol_j = self.tolerance_of(&entries[j], now);
                if Self::compatible(&entries[i], &entries[j], tol_i, tol_j) {
                    taken[i] = true;
                    taken[j] = true;
                    room_budget -= 1;
                    let first = entries[i].clone();
                    let second = entries[j].clone();
                    outcome.pairs.push(PairedMatch {
                        mode: first.mode,
                        average_elo: (first.elo + second.elo) / 2,
                        elo_difference: (first.elo - second.elo).abs(),
                        first,
                        second,
                    });
                    break;
                }
            }
        }

        // Remove paired entries, oldest-first ordering preserved
        let mut index = 0;
        entries.retain(|_| {
            let keep = !taken[index];
            index += 1;
            keep
        });

        self.total_paired
            .fetch_add(outcome.pairs.len() as u64, Ordering::Relaxed);
        outcome
    }

    pub async fn queue_size(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn snapshot_stats(&self) -> QueueStats {
        QueueStats {
            size: self.entries.read().await.len(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_paired: self.total_paired.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }
}
