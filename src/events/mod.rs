//! Event Pipeline
//!
//! Every admissible event is described by a typed registry entry; validated
//! events flow through four bounded priority queues drained in strict order
//! by a single worker, then fan out to room, player, or global targets.

pub mod pipeline;
pub mod registry;

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::game::player::PlayerId;
use crate::game::room::RoomId;
use crate::network::protocol::{ClientMessage, ServerMessage};

/// Processing priority. Lower rank drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl EventPriority {
    pub const ALL: [EventPriority; 4] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
    ];

    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            EventPriority::Critical => "CRITICAL",
            EventPriority::High => "HIGH",
            EventPriority::Normal => "NORMAL",
            EventPriority::Low => "LOW",
        }
    }
}

/// Registry key for an admissible event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Client-originated
    PlayerMovement,
    BallUpdate,
    GoalAttempt,
    ChatMessage,
    Heartbeat,
    JoinMatchmaking,
    LeaveMatchmaking,
    ReadyUp,
    ForfeitGame,
    RequestGameEnd,
    PauseRequest,
    ResumeRequest,
    // System-originated
    StateUpdate,
    GoalScored,
    LagCompensation,
    GameEnded,
    GameCleanup,
    Backpressure,
}

impl EventKind {
    /// Registry key for an inbound message, if the pipeline handles it.
    /// Authentication happens before the pipeline and has no entry.
    pub fn of_client_message(msg: &ClientMessage) -> Option<EventKind> {
        Some(match msg {
            ClientMessage::PlayerMovement(_) => EventKind::PlayerMovement,
            ClientMessage::BallUpdate(_) => EventKind::BallUpdate,
            ClientMessage::GoalAttempt(_) => EventKind::GoalAttempt,
            ClientMessage::ChatMessage(_) => EventKind::ChatMessage,
            ClientMessage::Ping(_) => EventKind::Heartbeat,
            ClientMessage::JoinMatchmaking(_) => EventKind::JoinMatchmaking,
            ClientMessage::LeaveMatchmaking => EventKind::LeaveMatchmaking,
            ClientMessage::ReadyUp(_) => EventKind::ReadyUp,
            ClientMessage::ForfeitGame => EventKind::ForfeitGame,
            ClientMessage::RequestGameEnd(_) => EventKind::RequestGameEnd,
            ClientMessage::PauseRequest => EventKind::PauseRequest,
            ClientMessage::ResumeRequest => EventKind::ResumeRequest,
            ClientMessage::Authenticate(_)
            | ClientMessage::JoinRoom(_)
            | ClientMessage::LeaveRoom(_) => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::PlayerMovement => "player_movement",
            EventKind::BallUpdate => "ball_update",
            EventKind::GoalAttempt => "goal_attempt",
            EventKind::ChatMessage => "chat_message",
            EventKind::Heartbeat => "heartbeat",
            EventKind::JoinMatchmaking => "join_matchmaking",
            EventKind::LeaveMatchmaking => "leave_matchmaking",
            EventKind::ReadyUp => "ready_up",
            EventKind::ForfeitGame => "forfeit_game",
            EventKind::RequestGameEnd => "request_game_end",
            EventKind::PauseRequest => "pause_request",
            EventKind::ResumeRequest => "resume_request",
            EventKind::StateUpdate => "state_update",
            EventKind::GoalScored => "goal_scored",
            EventKind::LagCompensation => "lag_compensation",
            EventKind::GameEnded => "game_ended",
            EventKind::GameCleanup => "game_cleanup",
            EventKind::Backpressure => "backpressure",
        }
    }
}

/// Who produced an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Player(PlayerId),
    System,
}

/// Where an event fans out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Room(RoomId),
    Player(PlayerId),
    All,
}

/// What the envelope carries.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A validated client message awaiting routing.
    Inbound {
        socket_id: u64,
        message: ClientMessage,
    },
    /// An outbound message awaiting fan-out. `exclude_socket` omits the
    /// origin socket for input echoes.
    Outbound {
        message: ServerMessage,
        exclude_socket: Option<u64>,
    },
}

/// A queued event.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Monotonic sequence id assigned at enqueue.
    pub seq: u64,
    pub kind: EventKind,
    pub priority: EventPriority,
    pub origin: Origin,
    pub target: Target,
    pub payload: EventPayload,
    /// Client wall-clock when the client produced the event.
    pub client_ts: Option<u64>,
    /// Server wall-clock milliseconds at enqueue.
    pub enqueue_ts: u64,
    /// Monotonic enqueue instant, for processing-latency metrics.
    pub enqueued_at: Instant,
}
