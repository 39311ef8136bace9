//! Session Persistence Adapter
//!
//! Writes match results and cumulative player stats to an external
//! database behind the `MatchDatabase` trait; the core never names a
//! vendor. All writes go through a single background task (commands over a
//! channel), with exponential-backoff retries for transient errors. After
//! the retry budget the write is abandoned and a failure counter bumped;
//! nothing user-visible ever waits on this path.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::game::end::{clamp_elo, MatchResult, Outcome, PlayerResult, ResultType};
use crate::game::player::{PlayerId, Side};
use crate::game::room::{EndReason, GameMode, RoomId};

/// Database errors, split by retryability.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// Worth retrying (connection loss, timeout, deadlock).
    #[error("transient database error: {0}")]
    Transient(String),

    /// Retrying will not help (constraint violation, bad data).
    #[error("permanent database error: {0}")]
    Permanent(String),
}

impl DbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Transient(_))
    }
}

/// One row in the games table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRow {
    pub game_id: RoomId,
    pub left_player_id: PlayerId,
    pub right_player_id: PlayerId,
    pub left_score: u32,
    pub right_score: u32,
    pub winner_id: Option<PlayerId>,
    pub mode: GameMode,
    pub duration_secs: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end_reason: EndReason,
    pub result_type: ResultType,
    pub status: String,
}

impl GameRow {
    /// Flatten a match result into its games-table row.
    pub fn from_result(result: &MatchResult) -> Option<GameRow> {
        let left = result.player(Side::Left)?;
        let right = result.player(Side::Right)?;
        Some(GameRow {
            game_id: result.room_id,
            left_player_id: left.player_id.clone(),
            right_player_id: right.player_id.clone(),
            left_score: left.score,
            right_score: right.score,
            winner_id: result.winner_id().cloned(),
            mode: result.mode,
            duration_secs: result.duration_secs,
            started_at: result.started_at,
            ended_at: result.ended_at,
            end_reason: result.reason,
            result_type: result.result_type,
            status: "completed".to_string(),
        })
    }
}

/// One row in the player_stats table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatsRow {
    pub player_id: PlayerId,
    pub games_played: u64,
    pub games_won: u64,
    pub games_lost: u64,
    pub games_drawn: u64,
    pub goals_scored: u64,
    pub goals_conceded: u64,
    pub total_playtime_secs: u64,
    pub last_played: DateTime<Utc>,
    pub win_streak: u32,
    pub best_win_streak: u32,
    pub elo: i32,
}

impl PlayerStatsRow {
    fn fresh(player_id: PlayerId, elo: i32) -> Self {
        Self {
            player_id,
            games_played: 0,
            games_won: 0,
            games_lost: 0,
            games_drawn: 0,
            goals_scored: 0,
            goals_conceded: 0,
            total_playtime_secs: 0,
            last_played: Utc::now(),
            win_streak: 0,
            best_win_streak: 0,
            elo,
        }
    }
}

/// The external database surface the adapter needs. Backends live inside
/// the adapter task, so they must be shareable across awaits.
pub trait MatchDatabase: Send + Sync + 'static {
    fn insert_game(&self, row: GameRow) -> impl Future<Output = Result<(), DbError>> + Send;

    fn fetch_player_stats(
        &self,
        player_id: &PlayerId,
    ) -> impl Future<Output = Result<Option<PlayerStatsRow>, DbError>> + Send;

    fn save_player_stats(
        &self,
        row: PlayerStatsRow,
    ) -> impl Future<Output = Result<(), DbError>> + Send;
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Retry budget per write.
    pub max_retries: u32,
    /// First backoff; doubles per attempt.
    pub backoff_base: Duration,
    /// Command channel depth.
    pub queue_depth: usize,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            queue_depth: 256,
        }
    }
}

/// Adapter counters.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub matches_saved: AtomicU64,
    pub stats_updated: AtomicU64,
    pub save_failures: AtomicU64,
    pub stats_failures: AtomicU64,
    pub retries: AtomicU64,
}

enum StoreCommand {
    SaveMatch(Box<MatchResult>),
    UpdateStats(Box<MatchResult>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persistence task.
#[derive(Clone)]
pub struct SessionStore {
    tx: mpsc::Sender<StoreCommand>,
    pub metrics: Arc<StoreMetrics>,
}

impl SessionStore {
    /// Spawn the adapter task over a concrete database backend.
    pub fn spawn<D: MatchDatabase>(db: D, config: PersistConfig) -> SessionStore {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        let metrics = Arc::new(StoreMetrics::default());
        let backend = Backend {
            db,
            config,
            metrics: metrics.clone(),
        };
        tokio::spawn(backend.run(rx));
        SessionStore { tx, metrics }
    }

    /// Queue the games-table insert for a completed match.
    pub async fn save_match(&self, result: MatchResult) {
        if self
            .tx
            .send(StoreCommand::SaveMatch(Box::new(result)))
            .await
            .is_err()
        {
            self.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue the per-player stats upsert. Callers invoke this at most once
    /// per completed match; the write is not idempotent.
    pub async fn update_player_stats(&self, result: MatchResult) {
        if self
            .tx
            .send(StoreCommand::UpdateStats(Box::new(result)))
            .await
            .is_err()
        {
            self.metrics.stats_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until every queued write was attempted. Used on shutdown and
    /// in tests.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Backend<D: MatchDatabase> {
    db: D,
    config: PersistConfig,
    metrics: Arc<StoreMetrics>,
}

impl<D: MatchDatabase> Backend<D> {
    async fn run(self, mut rx: mpsc::Receiver<StoreCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                StoreCommand::SaveMatch(result) => self.save_match(&result).await,
                StoreCommand::UpdateStats(result) => self.update_stats(&result).await,
                StoreCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Run one write with exponential backoff on transient errors.
    async fn with_retries<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    let backoff = self.config.backoff_base * 2u32.pow(attempt);
                    attempt += 1;
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(%label, attempt, ?backoff, %err, "transient write failure, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn save_match(&self, result: &MatchResult) {
        let row = match GameRow::from_result(result) {
            Some(row) => row,
            None => {
                error!(room = %result.room_id, "result missing a player slot, not persisted");
                self.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match self
            .with_retries("insert_game", || self.db.insert_game(row.clone()))
            .await
        {
            Ok(()) => {
                self.metrics.matches_saved.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(room = %result.room_id, %err, "match not persisted");
                self.metrics.save_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn update_stats(&self, result: &MatchResult) {
        for pr in &result.players {
            let outcome = self
                .with_retries("upsert_stats", || async {
                    let existing = self.db.fetch_player_stats(&pr.player_id).await?;
                    let merged = merge_stats(existing, pr, result);
                    self.db.save_player_stats(merged).await
                })
                .await;
            match outcome {
                Ok(()) => {
                    self.metrics.stats_updated.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    error!(player = %pr.player_id, %err, "stats not persisted");
                    self.metrics.stats_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Fold one match into a player's cumulative counters.
fn merge_stats(
    existing: Option<PlayerStatsRow>,
    pr: &PlayerResult,
    result: &MatchResult,
) -> PlayerStatsRow {
    let mut row =
        existing.unwrap_or_else(|| PlayerStatsRow::fresh(pr.player_id.clone(), pr.elo_before));

    row.games_played += 1;
    match pr.outcome {
        Outcome::Win => row.games_won += 1,
        Outcome::Loss => row.games_lost += 1,
        Outcome::Draw => row.games_drawn += 1,
    }

    let conceded = result
        .player(pr.side.opponent())
        .map(|o| o.score)
        .unwrap_or(0);
    row.goals_scored += pr.score as u64;
    row.goals_conceded += conceded as u64;
    row.total_playtime_secs += result.duration_secs;
    row.last_played = result.ended_at;

    row.win_streak = match pr.outcome {
        Outcome::Win => row.win_streak + 1,
        _ => 0,
    };
    row.best_win_streak = row.best_win_streak.max(row.win_streak);

    row.elo = clamp_elo(row.elo + pr.elo_change);
    row
}

/// In-memory backend used when no external database is wired up (the
/// development default).
#[derive(Default)]
pub struct MemoryDatabase {
    games: tokio::sync::Mutex<Vec<GameRow>>,
    stats: tokio::sync::Mutex<std::collections::BTreeMap<PlayerId, PlayerStatsRow>>,
}

impl MemoryDatabase {
    pub async fn game_count(&self) -> usize {
        self.games.lock().await.len()
    }

    pub async fn stats_for(&self, player_id: &PlayerId) -> Option<PlayerStatsRow> {
        self.stats.lock().await.get(player_id).cloned()
    }
}

impl MatchDatabase for MemoryDatabase {
    async fn insert_game(&self, row: GameRow) -> Result<(), DbError> {
        self.games.lock().await.push(row);
        Ok(())
    }

    async fn fetch_player_stats(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<PlayerStatsRow>, DbError> {
        Ok(self.stats.lock().await.get(player_id).cloned())
    }

    async fn save_player_stats(&self, row: PlayerStatsRow) -> Result<(), DbError> {
        self.stats.lock().await.insert(row.player_id.clone(), row);
        Ok(())
    }
}

impl MatchDatabase for Arc<MemoryDatabase> {
    async fn insert_game(&self, row: GameRow) -> Result<(), DbError> {
        self.as_ref().insert_game(row).await
    }

    async fn fetch_player_stats(
        &self,
        player_id: &PlayerId,
    ) -> Result<Option<PlayerStatsRow>, DbError> {
        self.as_ref().fetch_player_stats(player_id).await
    }

    async fn save_player_stats(&self, row: PlayerStatsRow) -> Result<(), DbError> {
        self.as_ref().save_player_stats(row).await
    }
}
