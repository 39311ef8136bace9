//! Player Entity
//!
//! Identity, connection bookkeeping, and the per-session status machine.
//! Connection fields are mutated only by the connection manager; session
//! fields only by the player's current owner (queue entry or room).

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default rating for players we have never seen before.
pub const DEFAULT_ELO: i32 = 1200;

/// Stable external player identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which half of the field a player defends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// Session status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Idle,
    InQueue,
    InRoom,
    InGame,
    Disconnected,
}

/// Player entity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    /// A different role is already assigned.
    #[error("role already assigned")]
    AlreadyAssigned,

    /// Reconnect attempted with no room or queue entry to return to.
    #[error("no session found")]
    NoSessionFound,

    /// Status transition not allowed.
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PlayerStatus,
        to: PlayerStatus,
    },
}

/// A connected (or recently connected) player.
#[derive(Debug, Clone)]
pub struct Player {
    /// Stable external identifier.
    pub id: PlayerId,
    /// Display name shown to the opponent.
    pub display_name: String,
    /// Socket currently bound to this player, if any.
    pub socket_id: Option<u64>,
    /// Live connection flag.
    pub connected: bool,
    /// Last inbound activity, for heartbeat sweeps.
    pub last_activity: Instant,
    /// Successful socket takeovers.
    pub reconnects: u32,
    /// Assigned role once placed in a room.
    pub role: Option<Side>,
    /// When the player first authenticated this session.
    pub joined_at: DateTime<Utc>,
    /// Ready flag for the current pairing.
    pub ready: bool,
    /// Integer Elo rating.
    pub elo: i32,
    /// Session status.
    pub status: PlayerStatus,
    /// Status to restore on reconnect within the grace period.
    resume_status: Option<PlayerStatus>,
}

impl Player {
    pub fn new(id: PlayerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            socket_id: None,
            connected: false,
            last_activity: Instant::now(),
            reconnects: 0,
            role: None,
            joined_at: Utc::now(),
            ready: false,
            elo: DEFAULT_ELO,
            status: PlayerStatus::Idle,
            resume_status: None,
        }
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Assign a field role. Idempotent for the same side.
    pub fn assign_role(&mut self, side: Side) -> Result<(), PlayerError> {
        match self.role {
            None => {
                self.role = Some(side);
                Ok(())
            }
            Some(current) if current == side => Ok(()),
            Some(_) => Err(PlayerError::AlreadyAssigned),
        }
    }

    /// Move to a new session status, checking the allowed edges.
    pub fn transition(&mut self, to: PlayerStatus) -> Result<(), PlayerError> {
        use PlayerStatus::*;
        let from = self.status;
        let allowed = matches!(
            (from, to),
            (Idle, InQueue)
                | (InQueue, InRoom)
                | (InQueue, Idle)
                | (InRoom, InGame)
                | (InRoom, Idle)
                | (InGame, Idle)
                | (_, Disconnected)
        );
        if !allowed {
            return Err(PlayerError::InvalidTransition { from, to });
        }
        self.status = to;
        Ok(())
    }

    /// Record a socket loss. The prior status is remembered so a reconnect
    /// within the grace period can resume the session.
    pub fn mark_disconnected(&mut self) {
        if self.status != PlayerStatus::Disconnected {
            self.resume_status = Some(self.status);
        }
        self.status = PlayerStatus::Disconnected;
        self.connected = false;
        self.socket_id = None;
    }

    /// Bind a new socket after a disconnect, restoring the prior status.
    pub fn reconnect(&mut self, new_socket: u64) -> Result<PlayerStatus, PlayerError> {
        let resumed = match self.resume_status.take() {
            Some(s @ (PlayerStatus::InRoom | PlayerStatus::InGame | PlayerStatus::InQueue)) => s,
            _ => {
                self.resume_status = None;
                return Err(PlayerError::NoSessionFound);
            }
        };
        self.status = resumed;
        self.connected = true;
        self.socket_id = Some(new_socket);
        self.reconnects += 1;
        self.touch();
        Ok(resumed)
    }

    /// Bind the first socket for this session.
    pub fn bind_socket(&mut self, socket_id: u64) {
        self.socket_id = Some(socket_id);
        self.connected = true;
        self.touch();
    }

    /// Clear per-match fields when a session ends.
    pub fn clear_session(&mut self) {
        self.role = None;
        self.ready = false;
        self.resume_status = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> Player {
        Player::new(PlayerId::new("p1"), "Player One")
    }

    #[test]
    fn test_defaults() {
        let p = player();
        assert_eq!(p.elo, DEFAULT_ELO);
        assert_eq!(p.status, PlayerStatus::Idle);
        assert!(!p.connected);
        assert!(p.role.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut p = player();
        p.transition(PlayerStatus::InQueue).unwrap();
        p.transition(PlayerStatus::InRoom).unwrap();
        p.transition(PlayerStatus::InGame).unwrap();
        p.transition(PlayerStatus::Idle).unwrap();
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut p = player();
        let err = p.transition(PlayerStatus::InGame).unwrap_err();
        assert!(matches!(err, PlayerError::InvalidTransition { .. }));
        assert_eq!(p.status, PlayerStatus::Idle);
    }

    #[test]
    fn test_role_assignment() {
        let mut p = player();
        p.assign_role(Side::Left).unwrap();
        // Same side is idempotent
        p.assign_role(Side::Left).unwrap();
        assert_eq!(
            p.assign_role(Side::Right),
            Err(PlayerError::AlreadyAssigned)
        );
    }

    #[test]
    fn test_disconnect_then_reconnect_resumes() {
        let mut p = player();
        p.bind_socket(1);
        p.transition(PlayerStatus::InQueue).unwrap();
        p.transition(PlayerStatus::InRoom).unwrap();
        p.transition(PlayerStatus::InGame).unwrap();

        p.mark_disconnected();
        assert_eq!(p.status, PlayerStatus::Disconnected);
        assert!(!p.connected);

        let resumed = p.reconnect(2).unwrap();
        assert_eq!(resumed, PlayerStatus::InGame);
        assert_eq!(p.socket_id, Some(2));
        assert_eq!(p.reconnects, 1);
    }

    #[test]
    fn test_reconnect_without_session_fails() {
        let mut p = player();
        p.mark_disconnected();
        // Was Idle before the drop: nothing to resume
        assert_eq!(p.reconnect(2), Err(PlayerError::NoSessionFound));
    }

    #[test]
    fn test_double_disconnect_keeps_resume_status() {
        let mut p = player();
        p.transition(PlayerStatus::InQueue).unwrap();
        p.transition(PlayerStatus::InRoom).unwrap();
        p.mark_disconnected();
        p.mark_disconnected();
        assert_eq!(p.reconnect(3).unwrap(), PlayerStatus::InRoom);
    }
}
