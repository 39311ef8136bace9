//! Game-End Processor
//!
//! Owns the terminal phase of a room exactly once: result computation,
//! the broadcast choreography (ended, celebration, detailed results),
//! asynchronous persistence, and cleanup. Persistence failures never block
//! or cancel anything the players see.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::events::pipeline::EventPipeline;
use crate::events::{EventKind, Target};
use crate::game::player::{PlayerId, Side};
use crate::game::room::{EndReason, GameMode, Room, RoomId, RoomManager};
use crate::network::connection::ConnectionManager;
use crate::network::protocol::{CelebrationInfo, ServerMessage};
use crate::persist::SessionStore;

/// Elo K-factor.
const ELO_K: f64 = 32.0;
/// Rating floor after adjustment.
pub const ELO_FLOOR: i32 = 800;
/// Rating ceiling after adjustment.
pub const ELO_CEILING: i32 = 3000;

/// Game-end configuration.
#[derive(Debug, Clone)]
pub struct GameEndConfig {
    /// Delay between `game_ended` and `winner_celebration`.
    pub winner_delay: Duration,
    /// Celebration length; `detailed_results` follows it.
    pub celebration_duration: Duration,
    /// Delay before cleanup starts.
    pub post_game_delay: Duration,
    /// Gap between `game_cleanup_starting` and the purge.
    pub cleanup_notice: Duration,
}

impl Default for GameEndConfig {
    fn default() -> Self {
        Self {
            winner_delay: Duration::from_millis(500),
            celebration_duration: Duration::from_secs(3),
            post_game_delay: Duration::from_secs(5),
            cleanup_notice: Duration::from_secs(2),
        }
    }
}

/// Per-player outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Loss,
    Draw,
}

/// How the result should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Completed,
    Forfeit,
    DoubleForfeit,
    Disconnect,
    Forced,
}

/// One player's slice of the final result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    pub player_id: PlayerId,
    pub display_name: String,
    pub side: Side,
    pub score: u32,
    pub outcome: Outcome,
    pub connected_at_end: bool,
    pub elo_before: i32,
    /// Signed rating change; the persistence adapter applies the clamp.
    pub elo_change: i32,
}

/// The final, authoritative match result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub room_id: RoomId,
    pub mode: GameMode,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub reason: EndReason,
    pub result_type: ResultType,
    /// Winning side; `None` is a draw.
    pub winner: Option<Side>,
    pub players: Vec<PlayerResult>,
    pub total_goals: u32,
    /// Left score minus right score.
    pub goal_difference: i32,
}

impl MatchResult {
    pub fn player(&self, side: Side) -> Option<&PlayerResult> {
        self.players.iter().find(|p| p.side == side)
    }

    pub fn winner_id(&self) -> Option<&PlayerId> {
        self.winner
            .and_then(|side| self.player(side))
            .map(|p| &p.player_id)
    }
}

/// Standard Elo expectation for `a` against `b`.
fn elo_expected(a: i32, b: i32) -> f64 {
    1.0 / (1.0 + 10f64.powf((b - a) as f64 / 400.0))
}

/// Rating delta for one player given the actual score (1 win, 0.5 draw, 0 loss).
pub fn elo_delta(own: i32, opponent: i32, actual: f64) -> i32 {
    (ELO_K * (actual - elo_expected(own, opponent))).round() as i32
}

/// Clamp a post-adjustment rating into the permitted band.
pub fn clamp_elo(rating: i32) -> i32 {
    rating.clamp(ELO_FLOOR, ELO_CEILING)
}

/// Compute the final result for a room.
///
/// `forfeited_by` names the conceding side for forfeit ends. Winner rules:
/// forfeit/disconnect award the remaining connected side; a time-limit or
/// forced end goes to the higher score, DRAW on a tie; a score-limit end
/// goes to the side that reached the limit.
pub fn compute_result(room: &Room, reason: EndReason, forfeited_by: Option<Side>) -> MatchResult {
    let score = room.world.score;
    let connected = room.connected_sides();

    let (winner, result_type) = match reason {
        EndReason::Forfeit => match forfeited_by {
            Some(side) if !connected.is_empty() => (Some(side.opponent()), ResultType::Forfeit),
            _ if connected.is_empty() => (None, ResultType::DoubleForfeit),
            _ => (None, ResultType::Forfeit),
        },
        EndReason::Disconnect => {
            if connected.len() == 1 {
                (Some(connected[0]), ResultType::Disconnect)
            } else if connected.is_empty() {
                (None, ResultType::DoubleForfeit)
            } else {
                // Everyone came back but the pause expired: score decides
                (score_winner(score.left, score.right), ResultType::Disconnect)
            }
        }
        EndReason::ScoreLimit | EndReason::TimeLimit | EndReason::MutualAgreement => {
            (score_winner(score.left, score.right), ResultType::Completed)
        }
        EndReason::Forced => (score_winner(score.left, score.right), ResultType::Forced),
    };

    let started_at = room.started_at.unwrap_or_else(Utc::now);
    let ended_at = Utc::now();

    let players: Vec<PlayerResult> = room
        .players()
        .map(|p| {
            let outcome = match winner {
                Some(side) if side == p.side => Outcome::Win,
                Some(_) => Outcome::Loss,
                None => Outcome::Draw,
            };
            let actual = match outcome {
                Outcome::Win => 1.0,
                Outcome::Draw => 0.5,
                Outcome::Loss => 0.0,
            };
            let opponent_elo = room
                .slot(p.side.opponent())
                .map(|o| o.elo)
                .unwrap_or(p.elo);
            PlayerResult {
                player_id: p.player_id.clone(),
                display_name: p.display_name.clone(),
                side: p.side,
                score: score.for_side(p.side),
                outcome,
                connected_at_end: p.connected,
                elo_before: p.elo,
                elo_change: elo_delta(p.elo, opponent_elo, actual),
            }
        })
        .collect();

    MatchResult {
        room_id: room.id,
        mode: room.mode,
        started_at,
        ended_at,
        duration_secs: room.played_secs(),
        reason,
        result_type,
        winner,
        players,
        total_goals: score.total(),
        goal_difference: score.left as i32 - score.right as i32,
    }
}

fn score_winner(left: u32, right: u32) -> Option<Side> {
    match left.cmp(&right) {
        std::cmp::Ordering::Greater => Some(Side::Left),
        std::cmp::Ordering::Less => Some(Side::Right),
        std::cmp::Ordering::Equal => None,
    }
}

/// Drives the terminal phase of every room.
pub struct GameEndProcessor {
    rooms: Arc<RoomManager>,
    connections: Arc<ConnectionManager>,
    pipeline: Arc<EventPipeline>,
    store: SessionStore,
    config: GameEndConfig,
    /// Matches fully processed.
    pub completed: AtomicU64,
}

impl GameEndProcessor {
    pub fn new(
        rooms: Arc<RoomManager>,
        connections: Arc<ConnectionManager>,
        pipeline: Arc<EventPipeline>,
        store: SessionStore,
        config: GameEndConfig,
    ) -> Self {
        Self {
            rooms,
            connections,
            pipeline,
            store,
            config,
            completed: AtomicU64::new(0),
        }
    }

    /// Handle a terminal condition. Idempotent: the second and later calls
    /// for the same room are no-ops.
    pub async fn handle_game_end(
        self: &Arc<Self>,
        room_id: RoomId,
        reason: EndReason,
        forfeited_by: Option<Side>,
    ) {
        let room = match self.rooms.get_room(&room_id).await {
            Some(room) => room,
            None => return,
        };

        let result = {
            let mut room = room.write().await;
            if !room.take_end_guard() {
                return;
            }
            let result = compute_result(&room, reason, forfeited_by);
            room.finish(reason);
            result
        };

        let scoreline = format!(
            "{}-{}",
            result.player(Side::Left).map(|p| p.score).unwrap_or(0),
            result.player(Side::Right).map(|p| p.score).unwrap_or(0)
        );
        info!(
            room = %room_id,
            reason = ?reason,
            winner = ?result.winner,
            score = %scoreline,
            "game ended"
        );

        // Persist off the broadcast path
        self.store.save_match(result.clone()).await;
        self.store.update_player_stats(result.clone()).await;

        // Choreography runs detached so the caller (a tick loop) returns
        // immediately; cleanup runs regardless of broadcast failures.
        let processor = self.clone();
        tokio::spawn(async move {
            processor.run_choreography(room_id, result).await;
            processor.run_cleanup(room_id).await;
            processor.completed.fetch_add(1, Ordering::Relaxed);
        });
    }

    async fn run_choreography(&self, room_id: RoomId, result: MatchResult) {
        let ended = ServerMessage::GameEnded(result.clone());
        if self
            .pipeline
            .submit_system(EventKind::GameEnded, ended, Target::Room(room_id), None)
            .await
            .is_err()
        {
            // The critical queue is gone; deliver directly as a last resort
            warn!(room = %room_id, "pipeline rejected game_ended, broadcasting directly");
            self.connections
                .broadcast_to_room(&room_id, &ServerMessage::GameEnded(result.clone()), None)
                .await;
        }

        tokio::time::sleep(self.config.winner_delay).await;
        self.connections
            .broadcast_to_room(
                &room_id,
                &ServerMessage::WinnerCelebration(CelebrationInfo {
                    winner: result.winner,
                    duration_secs: self.config.celebration_duration.as_secs(),
                }),
                None,
            )
            .await;

        tokio::time::sleep(self.config.celebration_duration).await;
        self.connections
            .broadcast_to_room(&room_id, &ServerMessage::DetailedResults(result), None)
            .await;
    }

    async fn run_cleanup(&self, room_id: RoomId) {
        tokio::time::sleep(self.config.post_game_delay).await;
        self.connections
            .broadcast_to_room(&room_id, &ServerMessage::GameCleanupStarting, None)
            .await;
        tokio::time::sleep(self.config.cleanup_notice).await;

        // Unregister players, purge the room, release sockets
        if let Some(room) = self.rooms.get_room(&room_id).await {
            let player_ids: Vec<PlayerId> = {
                let room = room.read().await;
                room.players().map(|p| p.player_id.clone()).collect()
            };
            for player_id in player_ids {
                self.rooms.unregister_player(&player_id).await;
                let _ = self
                    .connections
                    .with_player(&player_id, |p| {
                        p.clear_session();
                        if p.status != crate::game::player::PlayerStatus::Disconnected {
                            p.status = crate::game::player::PlayerStatus::Idle;
                        }
                    })
                    .await;
            }
        }
        self.rooms.remove_room(&room_id).await;
        self.connections.clear_room(&room_id).await;

        if let Err(err) = self
            .pipeline
            .submit_system(
                EventKind::GameCleanup,
                ServerMessage::GameCleanupStarting,
                Target::Room(room_id),
                None,
            )
            .await
        {
            error!(room = %room_id, %err, "cleanup event not queued");
        }
        info!(room = %room_id, "room cleaned up");
    }
}
