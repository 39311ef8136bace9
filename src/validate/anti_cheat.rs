//! Anti-Cheat Validator
//!
//! Statistical and temporal plausibility checks on post-game result
//! submissions. Each rule raises a flag with a severity; the summed
//! severity is the suspicion score (capped), and crossing the threshold
//! rejects the submission outright. Rejected submissions are never
//! persisted.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::game::player::PlayerId;

/// Validator configuration: one entry per rule plus the reject threshold.
#[derive(Debug, Clone)]
pub struct AntiCheatConfig {
    /// Summed severity at or above this rejects the submission.
    pub reject_threshold: u8,
    /// Suspicion score cap.
    pub suspicion_cap: u8,
    /// Goals per minute beyond which scoring is implausible.
    pub max_goals_per_minute: f64,
    /// Shortest plausible match.
    pub min_duration_secs: u64,
    /// Longest plausible match.
    pub max_duration_secs: u64,
    /// A match shorter than this with more than `short_game_goal_cap`
    /// goals is impossible.
    pub short_game_secs: u64,
    pub short_game_goal_cap: u32,
    /// Per-side score ceiling.
    pub max_player_score: u32,
    /// Margin beyond which the scoreline is implausible.
    pub max_score_difference: u32,
    /// Minimum gap between submissions from one player.
    pub rapid_submission_window: Duration,
    /// Consecutive wins in the history window beyond which streaks flag.
    pub max_win_streak: u32,
    /// Identical scorelines tolerated in recent history.
    pub scoreline_repeat_limit: usize,
    /// Recent-vs-older win-rate ratio beyond which improvement flags.
    pub improvement_factor: f64,
    /// How far back history counts.
    pub history_window: Duration,
    /// Hard cap on retained records per player.
    pub history_cap: usize,
}

impl Default for AntiCheatConfig {
    fn default() -> Self {
        Self {
            reject_threshold: 4,
            suspicion_cap: 10,
            max_goals_per_minute: 2.0,
            min_duration_secs: 30,
            max_duration_secs: 1800,
            short_game_secs: 120,
            short_game_goal_cap: 10,
            max_player_score: 25,
            max_score_difference: 20,
            rapid_submission_window: Duration::from_secs(10),
            max_win_streak: 50,
            scoreline_repeat_limit: 3,
            improvement_factor: 2.0,
            history_window: Duration::from_secs(24 * 3600),
            history_cap: 100,
        }
    }
}

/// Outcome the submitter declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredOutcome {
    Win,
    Loss,
    Draw,
}

/// A result submission under scrutiny.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubmission {
    pub player_id: PlayerId,
    pub opponent_id: PlayerId,
    pub player_score: u32,
    pub opponent_score: u32,
    pub duration_secs: u64,
    pub declared: DeclaredOutcome,
}

/// Flags a submission can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheatFlag {
    ResultScoreMismatch,
    UnrealisticScoringRate,
    ImpossibleScoreTimeRatio,
    GameTooShort,
    GameTooLong,
    PlayerScoreTooHigh,
    ExcessiveScoreDifference,
    RapidSubmission,
    ExcessiveWinStreak,
    IdenticalScorePattern,
    UnrealisticImprovement,
}

impl CheatFlag {
    /// Rule severity. The sum across raised flags is the suspicion score.
    pub fn severity(self) -> u8 {
        match self {
            CheatFlag::ResultScoreMismatch => 4,
            CheatFlag::UnrealisticScoringRate => 4,
            CheatFlag::ImpossibleScoreTimeRatio => 5,
            CheatFlag::GameTooShort => 2,
            CheatFlag::GameTooLong => 2,
            CheatFlag::PlayerScoreTooHigh => 3,
            CheatFlag::ExcessiveScoreDifference => 2,
            CheatFlag::RapidSubmission => 3,
            CheatFlag::ExcessiveWinStreak => 4,
            CheatFlag::IdenticalScorePattern => 4,
            CheatFlag::UnrealisticImprovement => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheatFlag::ResultScoreMismatch => "RESULT_SCORE_MISMATCH",
            CheatFlag::UnrealisticScoringRate => "UNREALISTIC_SCORING_RATE",
            CheatFlag::ImpossibleScoreTimeRatio => "IMPOSSIBLE_SCORE_TIME_RATIO",
            CheatFlag::GameTooShort => "GAME_TOO_SHORT",
            CheatFlag::GameTooLong => "GAME_TOO_LONG",
            CheatFlag::PlayerScoreTooHigh => "PLAYER_SCORE_TOO_HIGH",
            CheatFlag::ExcessiveScoreDifference => "EXCESSIVE_SCORE_DIFFERENCE",
            CheatFlag::RapidSubmission => "RAPID_SUBMISSION",
            CheatFlag::ExcessiveWinStreak => "EXCESSIVE_WIN_STREAK",
            CheatFlag::IdenticalScorePattern => "IDENTICAL_SCORE_PATTERN",
            CheatFlag::UnrealisticImprovement => "UNREALISTIC_IMPROVEMENT",
        }
    }
}

/// Aggregate verdict on a submission.
#[derive(Debug, Clone)]
pub struct SubmissionVerdict {
    pub accepted: bool,
    pub flags: Vec<CheatFlag>,
    /// Summed severity, capped.
    pub suspicion: u8,
}

impl SubmissionVerdict {
    pub fn flag_names(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.as_str().to_string()).collect()
    }
}

#[derive(Debug, Clone)]
struct SubmissionRecord {
    at: Instant,
    player_score: u32,
    opponent_score: u32,
    won: bool,
}

/// The validator, with per-player submission history.
pub struct AntiCheatValidator {
    config: AntiCheatConfig,
    history: RwLock<BTreeMap<PlayerId, VecDeque<SubmissionRecord>>>,
    pub rejected_total: AtomicU64,
}

impl AntiCheatValidator {
    pub fn new(config: AntiCheatConfig) -> Self {
        Self {
            config,
            history: RwLock::new(BTreeMap::new()),
            rejected_total: AtomicU64::new(0),
        }
    }

    /// Validate a submission and record it into the player's history.
    pub async fn validate(&self, submission: &ResultSubmission) -> SubmissionVerdict {
        let mut flags = Vec::new();

        self.check_stateless(submission, &mut flags);
        self.check_temporal(submission, &mut flags).await;

        let raw: u32 = flags.iter().map(|f| f.severity() as u32).sum();
        let suspicion = raw.min(self.config.suspicion_cap as u32) as u8;
        let accepted = raw < self.config.reject_threshold as u32;

        if !accepted {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            warn!(
                player = %submission.player_id,
                suspicion,
                flags = ?flags,
                "result submission rejected"
            );
        }

        self.record(submission).await;

        SubmissionVerdict {
            accepted,
            flags,
            suspicion,
        }
    }

    fn check_stateless(&self, s: &ResultSubmission, flags: &mut Vec<CheatFlag>) {
        let cfg = &self.config;

        // Declared outcome must agree with the scores
        let consistent = match s.declared {
            DeclaredOutcome::Win => s.player_score > s.opponent_score,
            DeclaredOutcome::Loss => s.player_score < s.opponent_score,
            DeclaredOutcome::Draw => s.player_score == s.opponent_score,
        };
        if !consistent {
            flags.push(CheatFlag::ResultScoreMismatch);
        }

        let total_goals = s.player_score + s.opponent_score;
        if s.duration_secs > 0 {
            let per_minute = total_goals as f64 * 60.0 / s.duration_secs as f64;
            if per_minute > cfg.max_goals_per_minute {
                flags.push(CheatFlag::UnrealisticScoringRate);
            }
        }

        if s.duration_secs < cfg.short_game_secs && total_goals > cfg.short_game_goal_cap {
            flags.push(CheatFlag::ImpossibleScoreTimeRatio);
        }

        if s.duration_secs < cfg.min_duration_secs {
            flags.push(CheatFlag::GameTooShort);
        }
        if s.duration_secs > cfg.max_duration_secs {
            flags.push(CheatFlag::GameTooLong);
        }

        if s.player_score > cfg.max_player_score || s.opponent_score > cfg.max_player_score {
            flags.push(CheatFlag::PlayerScoreTooHigh);
        }

        let diff = s.player_score.abs_diff(s.opponent_score);
        if diff > cfg.max_score_difference {
            flags.push(CheatFlag::ExcessiveScoreDifference);
        }
    }

    async fn check_temporal(&self, s: &ResultSubmission, flags: &mut Vec<CheatFlag>) {
        let cfg = &self.config;
        let history = self.history.read().await;
        let records = match history.get(&s.player_id) {
            Some(r) => r,
            None => return,
        };
        let now = Instant::now();
        let window = cfg.history_window;

        // Rapid re-submission
        if let Some(last) = records.back() {
            if now.duration_since(last.at) < cfg.rapid_submission_window {
                flags.push(CheatFlag::RapidSubmission);
            }
        }

        // Consecutive win streak within the window, counting this result
        let won_now = s.player_score > s.opponent_score;
        if won_now {
            let mut streak = 1u32;
            for record in records.iter().rev() {
                if now.duration_since(record.at) > window || !record.won {
                    break;
                }
                streak += 1;
            }
            if streak > cfg.max_win_streak {
                flags.push(CheatFlag::ExcessiveWinStreak);
            }
        }

        // Identical scoreline repetition
        let repeats = records
            .iter()
            .filter(|r| {
                now.duration_since(r.at) <= window
                    && r.player_score == s.player_score
                    && r.opponent_score == s.opponent_score
            })
            .count();
        if repeats >= cfg.scoreline_repeat_limit {
            flags.push(CheatFlag::IdenticalScorePattern);
        }

        // Recent vs older five-game win rate
        if records.len() >= 10 {
            let recent: Vec<_> = records.iter().rev().take(5).collect();
            let older: Vec<_> = records.iter().rev().skip(5).take(5).collect();
            let recent_rate = recent.iter().filter(|r| r.won).count() as f64 / 5.0;
            let older_rate = (older.iter().filter(|r| r.won).count() as f64 / 5.0).max(0.1);
            if recent_rate / older_rate > cfg.improvement_factor {
                flags.push(CheatFlag::UnrealisticImprovement);
            }
        }
    }

    async fn record(&self, s: &ResultSubmission) {
        let mut history = self.history.write().await;
        let records = history.entry(s.player_id.clone()).or_default();
        records.push_back(SubmissionRecord {
            at: Instant::now(),
            player_score: s.player_score,
            opponent_score: s.opponent_score,
            won: s.player_score > s.opponent_score,
        });
        while records.len() > self.config.history_cap {
            records.pop_front();
        }
    }

    /// Evict records older than the history window. Run periodically.
    pub async fn sweep(&self) {
        let window = self.config.history_window;
        let now = Instant::now();
        let mut history = self.history.write().await;
        history.retain(|_, records| {
            while let Some(front) = records.front() {
                if now.duration_since(front.at) > window {
                    records.pop_front();
                } else {
                    break;
                }
            }
            !records.is_empty()
        });
    }

    pub async fn history_len(&self, player_id: &PlayerId) -> usize {
        self.history
            .read()
            .await
            .get(player_id)
            .map(|r| r.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> AntiCheatValidator {
        AntiCheatValidator::new(AntiCheatConfig::default())
    }

    fn submission(player: u32, opponent: u32, duration: u64, declared: DeclaredOutcome) -> ResultSubmission {
        ResultSubmission {
            player_id: PlayerId::new("p1"),
            opponent_id: PlayerId::new("p2"),
            player_score: player,
            opponent_score: opponent,
            duration_secs: duration,
            declared,
        }
    }

    #[tokio::test]
    async fn test_plausible_result_accepted() {
        let v = validator();
        let verdict = v
            .validate(&submission(3, 1, 240, DeclaredOutcome::Win))
            .await;
        assert!(verdict.accepted, "flags: {:?}", verdict.flags);
        assert_eq!(verdict.suspicion, 0);
    }

    #[tokio::test]
    async fn test_blowout_in_a_minute_rejected() {
        let v = validator();
        let verdict = v
            .validate(&submission(15, 0, 60, DeclaredOutcome::Win))
            .await;
        assert!(!verdict.accepted);
        assert!(verdict.flags.contains(&CheatFlag::UnrealisticScoringRate));
        assert!(verdict.flags.contains(&CheatFlag::ImpossibleScoreTimeRatio));
        assert!(verdict.suspicion >= 5);
        assert_eq!(v.rejected_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_score_mismatch_rejected() {
        let v = validator();
        let verdict = v
            .validate(&submission(1, 3, 240, DeclaredOutcome::Win))
            .await;
        assert!(!verdict.accepted);
        assert!(verdict.flags.contains(&CheatFlag::ResultScoreMismatch));
    }

    #[tokio::test]
    async fn test_draw_declaration_consistent() {
        let v = validator();
        let verdict = v
            .validate(&submission(2, 2, 300, DeclaredOutcome::Draw))
            .await;
        assert!(verdict.accepted);
    }

    #[tokio::test]
    async fn test_short_game_alone_is_accepted() {
        let v = validator();
        // Severity 2 alone stays under the threshold of 4
        let verdict = v.validate(&submission(0, 0, 20, DeclaredOutcome::Draw)).await;
        assert!(verdict.accepted);
        assert!(verdict.flags.contains(&CheatFlag::GameTooShort));
        assert_eq!(verdict.suspicion, 2);
    }

    #[tokio::test]
    async fn test_severities_accumulate_to_rejection() {
        let v = validator();
        // Too short (2) + absurd margin (2) crosses the threshold
        let verdict = v
            .validate(&submission(22, 0, 20, DeclaredOutcome::Win))
            .await;
        assert!(!verdict.accepted);
        assert!(verdict.flags.contains(&CheatFlag::GameTooShort));
        assert!(verdict.flags.contains(&CheatFlag::ExcessiveScoreDifference));
    }

    #[tokio::test]
    async fn test_rapid_submission_flagged() {
        let v = validator();
        v.validate(&submission(3, 1, 240, DeclaredOutcome::Win)).await;
        let verdict = v
            .validate(&submission(3, 2, 260, DeclaredOutcome::Win))
            .await;
        assert!(verdict.flags.contains(&CheatFlag::RapidSubmission));
        // Severity 3 alone is still under the threshold
        assert!(verdict.accepted);
    }

    #[tokio::test]
    async fn test_identical_scoreline_flagged() {
        let mut config = AntiCheatConfig::default();
        // Rapid-submission noise would muddy the test
        config.rapid_submission_window = Duration::from_secs(0);
        let v = AntiCheatValidator::new(config);

        for _ in 0..3 {
            v.validate(&submission(5, 2, 300, DeclaredOutcome::Win)).await;
        }
        let verdict = v
            .validate(&submission(5, 2, 300, DeclaredOutcome::Win))
            .await;
        assert!(verdict.flags.contains(&CheatFlag::IdenticalScorePattern));
        assert!(!verdict.accepted);
    }

    #[tokio::test]
    async fn test_improvement_spike_flagged() {
        let mut config = AntiCheatConfig::default();
        config.rapid_submission_window = Duration::from_secs(0);
        let v = AntiCheatValidator::new(config);

        // Five losses with varied scorelines, then five wins
        for i in 0..5u32 {
            v.validate(&submission(i % 2, 3 + i, 300, DeclaredOutcome::Loss))
                .await;
        }
        for i in 0..5u32 {
            v.validate(&submission(4 + i, i % 3, 300 + i as u64, DeclaredOutcome::Win))
                .await;
        }
        let verdict = v
            .validate(&submission(3, 0, 280, DeclaredOutcome::Win))
            .await;
        assert!(verdict.flags.contains(&CheatFlag::UnrealisticImprovement));
    }

    #[tokio::test]
    async fn test_suspicion_capped() {
        let v = validator();
        // Mismatch(4) + rate(4) + ratio(5) + too-high(3) + margin(2) = 18
        let verdict = v
            .validate(&submission(30, 0, 60, DeclaredOutcome::Loss))
            .await;
        assert_eq!(verdict.suspicion, 10);
    }

    #[tokio::test]
    async fn test_history_capped_and_swept() {
        let mut config = AntiCheatConfig::default();
        config.history_cap = 10;
        config.rapid_submission_window = Duration::from_secs(0);
        let v = AntiCheatValidator::new(config);

        for i in 0..20u32 {
            v.validate(&submission(3, i % 3, 240, DeclaredOutcome::Win))
                .await;
        }
        assert_eq!(v.history_len(&PlayerId::new("p1")).await, 10);

        v.sweep().await;
        // Nothing is older than the window yet
        assert_eq!(v.history_len(&PlayerId::new("p1")).await, 10);
    }
}
