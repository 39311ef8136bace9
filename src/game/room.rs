//! Room / Game Session
//!
//! The room state machine and authoritative tick orchestration. A room owns
//! its `WorldState` and RNG exclusively: only the room's ticker task calls
//! `run_tick`. Transport concerns (sockets, broadcast) stay outside; the
//! ticker forwards the returned snapshots and events.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::game::physics::{self, InputFrame, PhysicsConfig, TickInputs};
use crate::game::player::{PlayerId, Side};
use crate::game::rng::{derive_match_seed, GameRng};
use crate::game::world::{Vec2, WorldSnapshot, WorldState};
use crate::{SNAPSHOT_DIVISOR, TICK_RATE};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Unique room identifier.
pub type RoomId = Uuid;

/// Bounded length of the append-only room event log.
const EVENT_LOG_CAP: usize = 512;

/// Room lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Waiting,
    Ready,
    Playing,
    Paused,
    Finished,
}

/// Match mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Casual,
    Ranked,
    Tournament,
}

impl GameMode {
    /// Goals needed to win; 0 means no score limit.
    pub fn score_limit(self) -> u32 {
        match self {
            GameMode::Casual => 3,
            GameMode::Ranked => 5,
            GameMode::Tournament => 0,
        }
    }

    /// Wall-clock limit on played time, in seconds.
    pub fn time_limit_secs(self) -> u64 {
        match self {
            GameMode::Casual => 300,
            GameMode::Ranked => 600,
            GameMode::Tournament => 900,
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameMode::Casual => f.write_str("casual"),
            GameMode::Ranked => f.write_str("ranked"),
            GameMode::Tournament => f.write_str("tournament"),
        }
    }
}

/// Why a match reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    ScoreLimit,
    TimeLimit,
    Forfeit,
    Disconnect,
    Forced,
    MutualAgreement,
}

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Simulation rate in Hz.
    pub tick_rate: u32,
    /// Dead time after a goal before positions reset.
    pub goal_cooldown: Duration,
    /// How long a room may stay paused before it is ended.
    pub pause_timeout: Duration,
    /// Physics constants.
    pub physics: PhysicsConfig,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            tick_rate: TICK_RATE,
            goal_cooldown: Duration::from_secs(3),
            pause_timeout: Duration::from_secs(30),
            physics: PhysicsConfig::default(),
        }
    }
}

/// Room errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room is full")]
    RoomFull,

    #[error("already in room")]
    AlreadyInRoom,

    #[error("player not found")]
    PlayerNotFound,

    #[error("invalid room state")]
    InvalidState,

    #[error("match not in progress")]
    NotPlaying,
}

/// A player slot inside a room.
#[derive(Debug, Clone)]
pub struct RoomPlayer {
    pub player_id: PlayerId,
    pub display_name: String,
    pub elo: i32,
    pub side: Side,
    pub ready: bool,
    pub connected: bool,
    /// Held keys, persisted across ticks until a newer frame arrives.
    pub held_input: InputFrame,
    /// Frame received since the last tick, if any (latest wins).
    pub pending_input: Option<InputFrame>,
    /// Highest accepted input sequence id.
    pub last_sequence: u64,
    /// Moving latency estimate from ping round-trips.
    pub latency_ms: u32,
    /// When the player's socket dropped, if currently disconnected.
    pub disconnected_at: Option<Instant>,
}

impl RoomPlayer {
    fn new(player_id: PlayerId, display_name: String, elo: i32, side: Side) -> Self {
        Self {
            player_id,
            display_name,
            elo,
            side,
            ready: false,
            connected: true,
            held_input: InputFrame::NEUTRAL,
            pending_input: None,
            last_sequence: 0,
            latency_ms: 0,
            disconnected_at: None,
        }
    }
}

/// Room metadata recorded at pairing time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomMeta {
    pub average_elo: i32,
    pub elo_difference: i32,
    /// Reason string when the room was force-ended.
    pub forced_end: Option<String>,
}

/// Entry in the append-only room event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomEvent {
    pub tick: u64,
    pub kind: RoomEventKind,
}

/// Room event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomEventKind {
    PlayerJoined { player_id: PlayerId, side: Side },
    GameStarted,
    GoalScored { side: Side, left: u32, right: u32 },
    Paused { waiting_for: PlayerId },
    Resumed,
    PlayerDisconnected { player_id: PlayerId },
    PlayerReconnected { player_id: PlayerId },
    GameEnded { reason: EndReason },
}

/// Result of one orchestrated tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Events raised this tick, already appended to the room log.
    pub events: Vec<RoomEvent>,
    /// Snapshot to broadcast, present every `SNAPSHOT_DIVISOR` ticks.
    pub snapshot: Option<WorldSnapshot>,
    /// Terminal condition reached this tick, if any.
    pub terminal: Option<EndReason>,
}

/// An active match room.
pub struct Room {
    pub id: RoomId,
    pub state: RoomState,
    pub mode: GameMode,
    pub config: RoomConfig,
    pub meta: RoomMeta,
    /// Slots indexed left, right.
    slots: [Option<RoomPlayer>; 2],
    /// Authoritative world. Mutated only by `run_tick` and validated claims.
    pub world: WorldState,
    rng: GameRng,
    /// Goals needed to end the match; 0 disables the limit.
    score_limit: u32,
    /// Played-tick budget; the clock stops while paused.
    time_limit_ticks: u64,
    /// Ticks left in the post-goal dead time.
    goal_cooldown_ticks: u64,
    goal_cooldown_remaining: u64,
    pub started_at: Option<DateTime<Utc>>,
    created_at: Instant,
    paused_since: Option<Instant>,
    event_log: VecDeque<RoomEvent>,
    /// Set when the pipeline could not publish a critical event.
    pub unhealthy: bool,
    /// Taken exactly once by the game-end processor.
    end_taken: bool,
}

impl Room {
    pub fn new(id: RoomId, mode: GameMode, config: RoomConfig) -> Self {
        let goal_cooldown_ticks =
            config.goal_cooldown.as_millis() as u64 * config.tick_rate as u64 / 1000;
        let time_limit_ticks = mode.time_limit_secs() * config.tick_rate as u64;
        Self {
            id,
            state: RoomState::Waiting,
            mode,
            meta: RoomMeta::default(),
            slots: [None, None],
            world: WorldState::new(),
            rng: GameRng::new(0),
            score_limit: mode.score_limit(),
            time_limit_ticks,
            goal_cooldown_ticks,
            goal_cooldown_remaining: 0,
            started_at: None,
            created_at: Instant::now(),
            paused_since: None,
            event_log: VecDeque::new(),
            unhealthy: false,
            end_taken: false,
            config,
        }
    }

    fn slot_index(side: Side) -> usize {
        match side {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    fn log_event(&mut self, kind: RoomEventKind) -> RoomEvent {
        let event = RoomEvent {
            tick: self.world.tick,
            kind,
        };
        if self.event_log.len() >= EVENT_LOG_CAP {
            self.event_log.pop_front();
        }
        self.event_log.push_back(event.clone());
        event
    }

    /// Add a player to the first free slot. Left fills first.
    pub fn add_player(
        &mut self,
        player_id: PlayerId,
        display_name: impl Into<String>,
        elo: i32,
    ) -> Result<Side, RoomError> {
        if self.state != RoomState::Waiting {
            return Err(RoomError::InvalidState);
        }
        if self.player(&player_id).is_some() {
            return Err(RoomError::AlreadyInRoom);
        }
        let side = if self.slots[0].is_none() {
            Side::Left
        } else if self.slots[1].is_none() {
            Side::Right
        } else {
            return Err(RoomError::RoomFull);
        };

        self.slots[Self::slot_index(side)] = Some(RoomPlayer::new(
            player_id.clone(),
            display_name.into(),
            elo,
            side,
        ));
        self.log_event(RoomEventKind::PlayerJoined { player_id, side });

        // Both slots filled: record pairing metadata
        if let (Some(left), Some(right)) = (&self.slots[0], &self.slots[1]) {
            self.meta.average_elo = (left.elo + right.elo) / 2;
            self.meta.elo_difference = (left.elo - right.elo).abs();
        }
        Ok(side)
    }

    pub fn player(&self, player_id: &PlayerId) -> Option<&RoomPlayer> {
        self.slots
            .iter()
            .flatten()
            .find(|p| &p.player_id == player_id)
    }

    pub fn player_mut(&mut self, player_id: &PlayerId) -> Option<&mut RoomPlayer> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| &p.player_id == player_id)
    }

    pub fn side_of(&self, player_id: &PlayerId) -> Option<Side> {
        self.player(player_id).map(|p| p.side)
    }

    pub fn slot(&self, side: Side) -> Option<&RoomPlayer> {
        self.slots[Self::slot_index(side)].as_ref()
    }

    pub fn players(&self) -> impl Iterator<Item = &RoomPlayer> {
        self.slots.iter().flatten()
    }

    pub fn player_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Mark a player ready. When both confirm, the room becomes READY.
    pub fn set_ready(&mut self, player_id: &PlayerId, ready: bool) -> Result<bool, RoomError> {
        let player = self
            .player_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        player.ready = ready;

        let all_ready = self.player_count() == 2 && self.players().all(|p| p.ready && p.connected);
        if all_ready && self.state == RoomState::Waiting {
            self.state = RoomState::Ready;
        }
        Ok(all_ready)
    }

    /// Transition READY -> PLAYING, seed the RNG, stamp the start time.
    pub fn start_game(&mut self) -> Result<(), RoomError> {
        if self.state != RoomState::Ready {
            return Err(RoomError::InvalidState);
        }
        let ids: Vec<&str> = self.players().map(|p| p.player_id.as_str()).collect();
        let seed = derive_match_seed(self.id.as_bytes(), &ids);
        self.rng = GameRng::new(seed);
        self.state = RoomState::Playing;
        self.started_at = Some(Utc::now());
        self.log_event(RoomEventKind::GameStarted);
        Ok(())
    }

    /// Ingest an input frame. Frames with a stale or duplicate sequence id
    /// are discarded (returns false). Latest frame wins within a tick.
    pub fn process_input(
        &mut self,
        player_id: &PlayerId,
        frame: InputFrame,
        sequence_id: u64,
    ) -> Result<bool, RoomError> {
        if !matches!(self.state, RoomState::Playing | RoomState::Paused) {
            return Err(RoomError::NotPlaying);
        }
        let player = self
            .player_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        if sequence_id <= player.last_sequence {
            return Ok(false);
        }
        player.last_sequence = sequence_id;
        player.pending_input = Some(frame);
        Ok(true)
    }

    /// Apply a validated (and lag-compensated) position claim to the
    /// authoritative body.
    pub fn apply_claim(
        &mut self,
        player_id: &PlayerId,
        position: Vec2,
        velocity: Vec2,
    ) -> Result<(), RoomError> {
        let side = self.side_of(player_id).ok_or(RoomError::PlayerNotFound)?;
        let body = self.world.body_mut(side);
        body.position = position;
        body.velocity = velocity;
        Ok(())
    }

    /// Record a latency estimate for lag compensation.
    pub fn record_latency(&mut self, player_id: &PlayerId, latency_ms: u32) {
        if let Some(player) = self.player_mut(player_id) {
            player.latency_ms = latency_ms;
        }
    }

    /// Run one authoritative tick. Only the room's ticker task calls this.
    pub fn run_tick(&mut self) -> Result<TickOutcome, RoomError> {
        if self.state != RoomState::Playing {
            return Err(RoomError::NotPlaying);
        }
        let mut outcome = TickOutcome::default();

        // 1. Merge inputs: the freshest frame replaces the held keys;
        //    disconnected players coast on neutral input.
        let mut inputs = TickInputs::default();
        for slot in self.slots.iter_mut().flatten() {
            if let Some(frame) = slot.pending_input.take() {
                slot.held_input = frame;
            }
            if !slot.connected {
                slot.held_input = InputFrame::NEUTRAL;
            }
            match slot.side {
                Side::Left => inputs.left = slot.held_input,
                Side::Right => inputs.right = slot.held_input,
            }
        }

        // 2-4. Physics
        let step = physics::step(&mut self.world, &inputs, &mut self.rng, &self.config.physics);

        // 5. Goal accounting, gated by the post-goal dead time
        if self.goal_cooldown_remaining > 0 {
            self.goal_cooldown_remaining -= 1;
            if self.goal_cooldown_remaining == 0 {
                self.world.reset_positions();
            }
        } else if let Some(side) = step.goal {
            self.world.score.credit(side);
            self.goal_cooldown_remaining = self.goal_cooldown_ticks;
            let event = self.log_event(RoomEventKind::GoalScored {
                side,
                left: self.world.score.left,
                right: self.world.score.right,
            });
            outcome.events.push(event);
        }

        // 6. Terminal conditions
        if self.score_limit > 0
            && (self.world.score.left >= self.score_limit
                || self.world.score.right >= self.score_limit)
        {
            outcome.terminal = Some(EndReason::ScoreLimit);
        } else if self.world.tick >= self.time_limit_ticks {
            outcome.terminal = Some(EndReason::TimeLimit);
        }

        // 7. Snapshot cadence: at most a third of the tick rate
        if self.world.tick % SNAPSHOT_DIVISOR == 0 {
            outcome.snapshot = Some(self.world.snapshot());
        }

        Ok(outcome)
    }

    /// Pause on disconnect while PLAYING. The tick loop skips paused rooms,
    /// so the time-limit clock stops too.
    pub fn pause(&mut self, waiting_for: &PlayerId) -> Result<(), RoomError> {
        if self.state != RoomState::Playing {
            return Err(RoomError::InvalidState);
        }
        self.state = RoomState::Paused;
        self.paused_since = Some(Instant::now());
        self.log_event(RoomEventKind::Paused {
            waiting_for: waiting_for.clone(),
        });
        Ok(())
    }

    /// Resume from PAUSED.
    pub fn resume(&mut self) -> Result<(), RoomError> {
        if self.state != RoomState::Paused {
            return Err(RoomError::InvalidState);
        }
        self.state = RoomState::Playing;
        self.paused_since = None;
        self.log_event(RoomEventKind::Resumed);
        Ok(())
    }

    /// True when the pause has outlived its budget.
    pub fn pause_expired(&self) -> bool {
        match self.paused_since {
            Some(since) => since.elapsed() >= self.config.pause_timeout,
            None => false,
        }
    }

    /// Record a player's socket loss.
    pub fn mark_disconnected(&mut self, player_id: &PlayerId) -> Result<(), RoomError> {
        let player = self
            .player_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        player.connected = false;
        player.disconnected_at = Some(Instant::now());
        player.held_input = InputFrame::NEUTRAL;
        player.pending_input = None;
        let id = player.player_id.clone();
        self.log_event(RoomEventKind::PlayerDisconnected { player_id: id });
        Ok(())
    }

    /// Restore a player after an authenticated reconnect.
    pub fn reconnect_player(&mut self, player_id: &PlayerId) -> Result<(), RoomError> {
        let player = self
            .player_mut(player_id)
            .ok_or(RoomError::PlayerNotFound)?;
        player.connected = true;
        player.disconnected_at = None;
        let id = player.player_id.clone();
        self.log_event(RoomEventKind::PlayerReconnected { player_id: id });
        Ok(())
    }

    /// Connected sides, in slot order.
    pub fn connected_sides(&self) -> Vec<Side> {
        self.players()
            .filter(|p| p.connected)
            .map(|p| p.side)
            .collect()
    }

    /// Take exclusive end ownership. The first caller gets true; later
    /// callers must treat the end as already handled.
    pub fn take_end_guard(&mut self) -> bool {
        if self.end_taken {
            return false;
        }
        self.end_taken = true;
        true
    }

    /// Move to FINISHED and log the reason.
    pub fn finish(&mut self, reason: EndReason) {
        self.state = RoomState::Finished;
        self.log_event(RoomEventKind::GameEnded { reason });
    }

    pub fn event_log(&self) -> impl Iterator<Item = &RoomEvent> {
        self.event_log.iter()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Played time in seconds, derived from the tick counter so pauses do
    /// not count.
    pub fn played_secs(&self) -> u64 {
        self.world.tick / self.config.tick_rate as u64
    }
}

// =============================================================================
// ROOM MANAGER
// =============================================================================

/// Owns all active rooms and the player-to-room index.
pub struct RoomManager {
    rooms: RwLock<BTreeMap<RoomId, Arc<RwLock<Room>>>>,
    player_rooms: RwLock<BTreeMap<PlayerId, RoomId>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            player_rooms: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a new room in WAITING state.
    pub async fn create_room(&self, mode: GameMode, config: RoomConfig) -> RoomId {
        let id = Uuid::new_v4();
        let room = Room::new(id, mode, config);
        self.rooms.write().await.insert(id, Arc::new(RwLock::new(room)));
        id
    }

    pub async fn get_room(&self, id: &RoomId) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn room_for_player(&self, player_id: &PlayerId) -> Option<Arc<RwLock<Room>>> {
        let room_id = { self.player_rooms.read().await.get(player_id).copied() };
        match room_id {
            Some(id) => self.get_room(&id).await,
            None => None,
        }
    }

    pub async fn register_player(&self, player_id: PlayerId, room_id: RoomId) {
        self.player_rooms.write().await.insert(player_id, room_id);
    }

    pub async fn unregister_player(&self, player_id: &PlayerId) {
        self.player_rooms.write().await.remove(player_id);
    }

    pub async fn remove_room(&self, id: &RoomId) {
        self.rooms.write().await.remove(id);
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop rooms that have reached FINISHED.
    pub async fn cleanup(&self) {
        let mut rooms = self.rooms.write().await;
        let mut stale = Vec::new();
        for (id, room) in rooms.iter() {
            if room.read().await.state == RoomState::Finished {
                stale.push(*id);
            }
        }
        for id in stale {
            rooms.remove(&id);
        }
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_player_room() -> Room {
        let mut room = Room::new(Uuid::new_v4(), GameMode::Casual, RoomConfig::default());
        room.add_player(PlayerId::new("p1"), "One", 1200).unwrap();
        room.add_player(PlayerId::new("p2"), "Two", 1250).unwrap();
        room
    }

    fn playing_room() -> Room {
        let mut room = two_player_room();
        room.set_ready(&PlayerId::new("p1"), true).unwrap();
        room.set_ready(&PlayerId::new("p2"), true).unwrap();
        room.start_game().unwrap();
        room
    }

    #[test]
    fn test_slots_fill_left_then_right() {
        let room = two_player_room();
        assert_eq!(room.side_of(&PlayerId::new("p1")), Some(Side::Left));
        assert_eq!(room.side_of(&PlayerId::new("p2")), Some(Side::Right));
        assert_eq!(room.meta.average_elo, 1225);
        assert_eq!(room.meta.elo_difference, 50);
    }

    #[test]
    fn test_third_player_rejected() {
        let mut room = two_player_room();
        let err = room
            .add_player(PlayerId::new("p3"), "Three", 1200)
            .unwrap_err();
        assert_eq!(err, RoomError::RoomFull);
    }

    #[test]
    fn test_duplicate_player_rejected() {
        let mut room = Room::new(Uuid::new_v4(), GameMode::Casual, RoomConfig::default());
        room.add_player(PlayerId::new("p1"), "One", 1200).unwrap();
        let err = room
            .add_player(PlayerId::new("p1"), "One", 1200)
            .unwrap_err();
        assert_eq!(err, RoomError::AlreadyInRoom);
    }

    #[test]
    fn test_ready_transitions_room() {
        let mut room = two_player_room();
        assert_eq!(room.state, RoomState::Waiting);
        room.set_ready(&PlayerId::new("p1"), true).unwrap();
        assert_eq!(room.state, RoomState::Waiting);
        room.set_ready(&PlayerId::new("p2"), true).unwrap();
        assert_eq!(room.state, RoomState::Ready);
    }

    #[test]
    fn test_start_requires_ready() {
        let mut room = two_player_room();
        assert_eq!(room.start_game(), Err(RoomError::InvalidState));
    }

    #[test]
    fn test_tick_advances_world() {
        let mut room = playing_room();
        let outcome = room.run_tick().unwrap();
        assert_eq!(room.world.tick, 1);
        assert!(outcome.terminal.is_none());
    }

    #[test]
    fn test_snapshot_every_third_tick() {
        let mut room = playing_room();
        let mut snapshots = 0;
        for _ in 0..9 {
            if room.run_tick().unwrap().snapshot.is_some() {
                snapshots += 1;
            }
        }
        assert_eq!(snapshots, 3);
    }

    #[test]
    fn test_stale_sequence_is_noop() {
        let mut room = playing_room();
        let p1 = PlayerId::new("p1");
        let frame = InputFrame {
            right: true,
            ..Default::default()
        };
        assert!(room.process_input(&p1, frame, 5).unwrap());
        // Same sequence again: dropped
        assert!(!room.process_input(&p1, frame, 5).unwrap());
        // Older sequence: dropped
        assert!(!room.process_input(&p1, frame, 3).unwrap());
        assert!(room.process_input(&p1, frame, 6).unwrap());
    }

    #[test]
    fn test_latest_input_wins_within_tick() {
        let mut room = playing_room();
        let p1 = PlayerId::new("p1");
        room.process_input(
            &p1,
            InputFrame {
                left: true,
                ..Default::default()
            },
            1,
        )
        .unwrap();
        room.process_input(
            &p1,
            InputFrame {
                right: true,
                ..Default::default()
            },
            2,
        )
        .unwrap();
        room.run_tick().unwrap();
        assert!(room.world.left.velocity.x > 0.0);
    }

    #[test]
    fn test_goal_enters_cooldown_and_resets() {
        let mut room = playing_room();
        // Park the ball inside the right goal mouth
        room.world.ball.position = Vec2::new(
            crate::game::world::FIELD_WIDTH - 30.0,
            crate::game::world::GROUND_Y - 50.0,
        );
        room.world.ball.velocity = Vec2::ZERO;

        let outcome = room.run_tick().unwrap();
        assert_eq!(room.world.score.left, 1);
        assert!(outcome
            .events
            .iter()
            .any(|e| matches!(e.kind, RoomEventKind::GoalScored { side: Side::Left, .. })));

        // During cooldown further goals do not count
        room.world.ball.position = Vec2::new(
            crate::game::world::FIELD_WIDTH - 30.0,
            crate::game::world::GROUND_Y - 50.0,
        );
        room.run_tick().unwrap();
        assert_eq!(room.world.score.left, 1);

        // Drain the cooldown; positions reset afterwards
        for _ in 0..200 {
            room.run_tick().unwrap();
        }
        assert_eq!(room.world.score.left, 1);
        let spawn_x = crate::game::world::BALL_SPAWN.x;
        // Ball was re-centered at cooldown end (it falls freely afterwards)
        assert!((room.world.ball.position.x - spawn_x).abs() < 1.0);
    }

    #[test]
    fn test_score_limit_terminates() {
        let mut room = playing_room();
        room.world.score.credit(Side::Left);
        room.world.score.credit(Side::Left);
        room.world.score.credit(Side::Left);
        let outcome = room.run_tick().unwrap();
        assert_eq!(outcome.terminal, Some(EndReason::ScoreLimit));
    }

    #[test]
    fn test_tournament_has_no_score_limit() {
        let mut room = Room::new(Uuid::new_v4(), GameMode::Tournament, RoomConfig::default());
        room.add_player(PlayerId::new("p1"), "One", 1200).unwrap();
        room.add_player(PlayerId::new("p2"), "Two", 1200).unwrap();
        room.set_ready(&PlayerId::new("p1"), true).unwrap();
        room.set_ready(&PlayerId::new("p2"), true).unwrap();
        room.start_game().unwrap();

        for _ in 0..20 {
            room.world.score.credit(Side::Left);
        }
        let outcome = room.run_tick().unwrap();
        assert_eq!(outcome.terminal, None);
    }

    #[test]
    fn test_time_limit_terminates() {
        let mut room = playing_room();
        room.world.tick = room.time_limit_ticks - 1;
        let outcome = room.run_tick().unwrap();
        assert_eq!(outcome.terminal, Some(EndReason::TimeLimit));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let mut room = playing_room();
        let p1 = PlayerId::new("p1");
        room.mark_disconnected(&p1).unwrap();
        room.pause(&p1).unwrap();
        assert_eq!(room.state, RoomState::Paused);
        assert!(room.run_tick().is_err());

        room.reconnect_player(&p1).unwrap();
        room.resume().unwrap();
        assert_eq!(room.state, RoomState::Playing);
        assert!(room.run_tick().is_ok());
    }

    #[test]
    fn test_disconnected_player_coasts_neutral() {
        let mut room = playing_room();
        let p2 = PlayerId::new("p2");
        room.process_input(
            &p2,
            InputFrame {
                left: true,
                ..Default::default()
            },
            1,
        )
        .unwrap();
        room.mark_disconnected(&p2).unwrap();
        room.run_tick().unwrap();
        // Neutral input: friction only, no held direction
        assert!(room.world.right.velocity.x.abs() < PhysicsConfig::default().move_speed);
    }

    #[test]
    fn test_end_guard_single_owner() {
        let mut room = playing_room();
        assert!(room.take_end_guard());
        assert!(!room.take_end_guard());
    }

    #[test]
    fn test_event_log_bounded() {
        let mut room = playing_room();
        for _ in 0..(EVENT_LOG_CAP + 100) {
            room.log_event(RoomEventKind::Resumed);
        }
        assert_eq!(room.event_log().count(), EVENT_LOG_CAP);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn frame_from_bits(bits: u8) -> InputFrame {
            InputFrame {
                left: bits & 1 != 0,
                right: bits & 2 != 0,
                jump: bits & 4 != 0,
                kick: bits & 8 != 0,
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            // Score is componentwise monotonic over any input stream.
            #[test]
            fn prop_score_monotonic(frames in proptest::collection::vec((0u8..16, 0u8..16), 1..200)) {
                let mut room = playing_room();
                let p1 = PlayerId::new("p1");
                let p2 = PlayerId::new("p2");
                let mut last = (0, 0);
                for (seq, (a, b)) in frames.into_iter().enumerate() {
                    let seq = seq as u64 + 1;
                    room.process_input(&p1, frame_from_bits(a), seq).unwrap();
                    room.process_input(&p2, frame_from_bits(b), seq).unwrap();
                    room.run_tick().unwrap();
                    let score = (room.world.score.left, room.world.score.right);
                    prop_assert!(score.0 >= last.0 && score.1 >= last.1);
                    last = score;
                }
            }

            // Stale sequence ids never mutate held input.
            #[test]
            fn prop_stale_sequences_ignored(seqs in proptest::collection::vec(1u64..50, 1..50)) {
                let mut room = playing_room();
                let p1 = PlayerId::new("p1");
                let mut highest = 0;
                for seq in seqs {
                    let accepted = room
                        .process_input(&p1, InputFrame { right: true, ..Default::default() }, seq)
                        .unwrap();
                    prop_assert_eq!(accepted, seq > highest);
                    highest = highest.max(seq);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_room_manager_lifecycle() {
        let manager = RoomManager::new();
        let id = manager
            .create_room(GameMode::Casual, RoomConfig::default())
            .await;
        assert_eq!(manager.room_count().await, 1);

        let p1 = PlayerId::new("p1");
        manager.register_player(p1.clone(), id).await;
        assert!(manager.room_for_player(&p1).await.is_some());

        manager.unregister_player(&p1).await;
        assert!(manager.room_for_player(&p1).await.is_none());

        manager.remove_room(&id).await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_finished_rooms() {
        let manager = RoomManager::new();
        let id = manager
            .create_room(GameMode::Casual, RoomConfig::default())
            .await;
        {
            let room = manager.get_room(&id).await.unwrap();
            room.write().await.finish(EndReason::Forced);
        }
        manager.cleanup().await;
        assert_eq!(manager.room_count().await, 0);
    }
}
