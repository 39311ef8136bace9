//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every frame
//! is one JSON object `{event, data, ts}`; `ts` is server wall-clock
//! milliseconds on outbound frames and optional on inbound ones.

use serde::{Deserialize, Serialize};

use crate::game::end::MatchResult;
use crate::game::physics::InputFrame;
use crate::game::player::{PlayerId, Side};
use crate::game::room::{GameMode, RoomId};
use crate::game::world::{Vec2, WorldSnapshot};
use crate::now_ms;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this socket to a player identity.
    Authenticate(AuthRequest),

    /// Join an existing room by id.
    JoinRoom(RoomRef),

    /// Leave the given room.
    LeaveRoom(RoomRef),

    /// Latency probe.
    Ping(PingRequest),

    /// Enter the matchmaking queue.
    JoinMatchmaking(MatchmakingRequest),

    /// Leave the matchmaking queue.
    LeaveMatchmaking,

    /// Confirm (or withdraw) readiness for a pending pairing.
    ReadyUp(ReadyRequest),

    /// In-room chat.
    ChatMessage(ChatRequest),

    /// Movement claim for the sender's own body.
    PlayerMovement(MovementClaim),

    /// Ball state claim (authoritative state always wins).
    BallUpdate(BallClaim),

    /// Goal claim, cross-checked against the authoritative world.
    GoalAttempt(GoalClaim),

    /// Concede the match.
    ForfeitGame,

    /// Ask the server to end the game early.
    RequestGameEnd(GameEndRequest),

    /// Ask to pause the match.
    PauseRequest,

    /// Ask to resume a paused match.
    ResumeRequest,
}

/// Authentication payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub player_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Room reference payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// Ping payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub client_time: u64,
}

/// Matchmaking payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingRequest {
    pub game_mode: GameMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Ready-up payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequest {
    pub ready: bool,
}

/// Chat scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatScope {
    All,
    Team,
}

/// Chat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(rename = "type")]
    pub scope: ChatScope,
}

/// Movement claim: position and velocity the client believes it has, plus
/// the held keys driving the authoritative kinematics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementClaim {
    pub position: Vec2,
    pub velocity: Vec2,
    #[serde(default)]
    pub keys: InputFrame,
    pub timestamp: u64,
    pub sequence_id: u64,
}

/// Ball claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallClaim {
    pub position: Vec2,
    pub velocity: Vec2,
    pub timestamp: u64,
}

/// Goal claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalClaim {
    pub position: Vec2,
    pub velocity: Vec2,
    pub goal_type: String,
}

/// Early game-end request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndRequest {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Socket accepted; authentication expected next.
    Connected(ConnectedInfo),

    /// Authentication succeeded.
    Authenticated(AuthenticatedInfo),

    /// Authentication failed; the socket will close.
    AuthError(ErrorInfo),

    /// A previous session was resumed on this socket.
    Reconnected(ReconnectedInfo),

    RoomJoined(RoomRef),
    RoomLeft(RoomRef),
    JoinRoomError(ErrorInfo),

    Pong(PongInfo),

    MatchmakingJoined(MatchmakingJoinedInfo),
    MatchmakingLeft,
    MatchmakingError(ErrorInfo),

    /// Queue wait exceeded the limit; the entry was expired.
    QueueTimeout,

    /// Two players were paired; ready-up window is open.
    MatchCreated(MatchCreatedInfo),

    ReadyStateChanged(ReadyStateInfo),

    GameStarted(GameStartedInfo),

    /// Authoritative world snapshot.
    StateUpdate(WorldSnapshot),

    /// A goal was counted.
    GoalScored(GoalScoredInfo),

    /// Echo of another player's accepted movement.
    PlayerMoved(PlayerMovedInfo),

    /// Corrective payload after a rejected claim: snap back to this state.
    PositionCorrection(PositionCorrectionInfo),

    ChatMessage(ChatBroadcast),

    GamePaused(GamePausedInfo),
    GameResumed,

    GameEnded(MatchResult),
    WinnerCelebration(CelebrationInfo),
    DetailedResults(MatchResult),
    GameCleanupStarting,

    /// Early-end request was rejected (anti-cheat or policy).
    GameEndRejected(GameEndRejectedInfo),

    RateLimitExceeded(RateLimitInfo),
    ValidationError(ValidationErrorInfo),
    RoomError(ErrorInfo),

    /// Low-priority queues overflowed and events were dropped.
    Backpressure(BackpressureInfo),

    ServerShutdown(ShutdownInfo),

    /// Opaque internal failure.
    InternalError(ErrorInfo),
}

/// Machine-readable error codes crossing the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailed,
    NotAuthenticated,
    TokenExpired,
    InvalidToken,
    InvalidInput,
    RoomNotFound,
    AlreadyInRoom,
    NotInRoom,
    QueueFull,
    AlreadyQueued,
    RateLimited,
    Capacity,
    Timeout,
    Unhealthy,
    InternalError,
}

/// Error payload: a code plus a short human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedInfo {
    pub player_id: PlayerId,
    pub username: String,
    pub elo: i32,
    pub reconnected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectedInfo {
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongInfo {
    pub server_time: u64,
    pub client_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingJoinedInfo {
    pub position: usize,
    pub game_mode: GameMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPlayerInfo {
    pub player_id: PlayerId,
    pub username: String,
    pub side: Side,
    pub elo: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCreatedInfo {
    pub room_id: RoomId,
    pub mode: GameMode,
    pub players: Vec<MatchPlayerInfo>,
    pub average_elo: i32,
    pub elo_difference: i32,
    pub ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyStateInfo {
    pub player_id: PlayerId,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartedInfo {
    pub room_id: RoomId,
    pub mode: GameMode,
    pub score_limit: u32,
    pub time_limit_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalScoredInfo {
    pub side: Side,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMovedInfo {
    pub player_id: PlayerId,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Milliseconds of extrapolation applied by lag compensation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_compensation_ms: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionCorrectionInfo {
    pub position: Vec2,
    pub velocity: Vec2,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub player_id: PlayerId,
    pub username: String,
    pub message: String,
    #[serde(rename = "type")]
    pub scope: ChatScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamePausedInfo {
    pub waiting_for: PlayerId,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CelebrationInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Side>,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndRejectedInfo {
    pub flags: Vec<String>,
    pub suspicion_level: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub event: String,
    pub retry_after_ms: u64,
}

/// One field-level schema failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationErrorInfo {
    pub event: String,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackpressureInfo {
    pub dropped: u32,
    pub priority: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownInfo {
    pub reason: String,
}

// =============================================================================
// FRAMING
// =============================================================================

/// Outbound frame: the tagged message plus a server timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub ts: u64,
}

impl Frame {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            ts: now_ms(),
        }
    }
}

impl ClientMessage {
    /// Deserialize from a JSON text frame. Tolerates an extra `ts` field.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Short event name for registry lookup and logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate(_) => "authenticate",
            ClientMessage::JoinRoom(_) => "join_room",
            ClientMessage::LeaveRoom(_) => "leave_room",
            ClientMessage::Ping(_) => "ping",
            ClientMessage::JoinMatchmaking(_) => "join_matchmaking",
            ClientMessage::LeaveMatchmaking => "leave_matchmaking",
            ClientMessage::ReadyUp(_) => "ready_up",
            ClientMessage::ChatMessage(_) => "chat_message",
            ClientMessage::PlayerMovement(_) => "player_movement",
            ClientMessage::BallUpdate(_) => "ball_update",
            ClientMessage::GoalAttempt(_) => "goal_attempt",
            ClientMessage::ForfeitGame => "forfeit_game",
            ClientMessage::RequestGameEnd(_) => "request_game_end",
            ClientMessage::PauseRequest => "pause_request",
            ClientMessage::ResumeRequest => "resume_request",
        }
    }
}

impl ServerMessage {
    /// Serialize as a complete `{event, data, ts}` frame.
    pub fn to_frame_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Frame::new(self.clone()))
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Binary helpers for the snapshot hot path. Tagged enums do not survive
/// bincode, so only the flat snapshot struct goes binary.
pub fn snapshot_to_bytes(snapshot: &WorldSnapshot) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(snapshot)
}

pub fn snapshot_from_bytes(data: &[u8]) -> Result<WorldSnapshot, bincode::Error> {
    bincode::deserialize(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::world::WorldState;

    #[test]
    fn test_client_message_roundtrip() {
        let msg = ClientMessage::PlayerMovement(MovementClaim {
            position: Vec2::new(400.0, 840.0),
            velocity: Vec2::new(8.0, 0.0),
            keys: InputFrame {
                right: true,
                ..Default::default()
            },
            timestamp: 1234,
            sequence_id: 7,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"event\":\"player_movement\""));
        assert!(json.contains("sequenceId"));

        let parsed = ClientMessage::from_json(&json).unwrap();
        if let ClientMessage::PlayerMovement(claim) = parsed {
            assert_eq!(claim.sequence_id, 7);
            assert!(claim.keys.right);
        } else {
            panic!("wrong message type");
        }
    }

    #[test]
    fn test_inbound_camel_case_fields() {
        let json = r#"{"event":"authenticate","data":{"playerId":"p1","username":"One"}}"#;
        let msg = ClientMessage::from_json(json).unwrap();
        if let ClientMessage::Authenticate(auth) = msg {
            assert_eq!(auth.player_id, "p1");
            assert!(auth.token.is_none());
        } else {
            panic!("wrong message type");
        }
    }

    #[test]
    fn test_unit_variant_without_data() {
        let msg = ClientMessage::from_json(r#"{"event":"forfeit_game"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ForfeitGame));
    }

    #[test]
    fn test_outbound_frame_has_ts() {
        let msg = ServerMessage::Pong(PongInfo {
            server_time: 10,
            client_time: 5,
        });
        let json = msg.to_frame_json().unwrap();
        assert!(json.contains("\"event\":\"pong\""));
        assert!(json.contains("\"ts\":"));

        let frame: Frame = serde_json::from_str(&json).unwrap();
        assert!(matches!(frame.message, ServerMessage::Pong(_)));
    }

    #[test]
    fn test_error_code_names() {
        let msg = ServerMessage::AuthError(ErrorInfo::new(ErrorCode::AuthFailed, "bad token"));
        let json = msg.to_frame_json().unwrap();
        assert!(json.contains("auth_failed"));
    }

    #[test]
    fn test_snapshot_binary_roundtrip() {
        let snapshot = WorldState::new().snapshot();
        let bytes = snapshot_to_bytes(&snapshot).unwrap();
        let parsed = snapshot_from_bytes(&bytes).unwrap();
        assert_eq!(parsed.tick, snapshot.tick);
        assert_eq!(parsed.state_hash, snapshot.state_hash);
    }

    #[test]
    fn test_event_names_cover_inbound_surface() {
        let samples = vec![
            ClientMessage::LeaveMatchmaking,
            ClientMessage::ForfeitGame,
            ClientMessage::PauseRequest,
            ClientMessage::ResumeRequest,
        ];
        for msg in samples {
            let json = msg.to_json().unwrap();
            let parsed = ClientMessage::from_json(&json).unwrap();
            assert_eq!(parsed.event_name(), msg.event_name());
        }
    }

    #[test]
    fn test_chat_type_field_name() {
        let json = r#"{"event":"chat_message","data":{"message":"gg","type":"all"}}"#;
        let msg = ClientMessage::from_json(json).unwrap();
        if let ClientMessage::ChatMessage(chat) = msg {
            assert_eq!(chat.scope, ChatScope::All);
        } else {
            panic!("wrong message type");
        }
    }
}
