//! Typed Event Registry
//!
//! One entry per admissible event: priority, per-player rate limit, payload
//! bounds, and whether the payload gets text sanitization. Unknown or
//! malformed events never reach a queue.

use std::collections::BTreeMap;

use crate::events::{EventKind, EventPriority};
use crate::game::world::{Vec2, FIELD_HEIGHT, FIELD_WIDTH};
use crate::network::protocol::{ClientMessage, FieldError};

/// Maximum chat message length after sanitization.
const CHAT_MAX_LEN: usize = 200;
/// Broad velocity cap for schema checks; fine-grained caps are the
/// game-state validator's concern.
const SCHEMA_SPEED_CAP: f32 = 100.0;
/// Slack around the field for claimed positions; the game-state validator
/// rejects anything the schema lets through here.
const FIELD_SLACK: f32 = 50.0;

/// Registry entry for one event kind.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub kind: EventKind,
    pub priority: EventPriority,
    /// Admitted events per second per player; `None` = unlimited.
    pub rate_limit: Option<f64>,
    /// Token bucket burst size.
    pub burst: f64,
    /// Strip markup / clamp text payloads.
    pub sanitize: bool,
    /// Recorded in the room's append-only log.
    pub persistent: bool,
}

impl EventSpec {
    fn new(kind: EventKind, priority: EventPriority) -> Self {
        Self {
            kind,
            priority,
            rate_limit: None,
            burst: 1.0,
            sanitize: false,
            persistent: false,
        }
    }

    fn rate(mut self, per_sec: f64, burst: f64) -> Self {
        self.rate_limit = Some(per_sec);
        self.burst = burst;
        self
    }

    fn sanitized(mut self) -> Self {
        self.sanitize = true;
        self
    }

    fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// The registry of every admissible event.
pub struct EventRegistry {
    specs: BTreeMap<EventKind, EventSpec>,
}

impl EventRegistry {
    /// The standard production registry.
    pub fn standard() -> Self {
        use EventKind::*;
        use EventPriority::*;

        let specs = [
            EventSpec::new(PlayerMovement, Normal).rate(60.0, 90.0),
            EventSpec::new(BallUpdate, Normal).rate(60.0, 90.0),
            EventSpec::new(GoalAttempt, High).rate(2.0, 4.0).persistent(),
            EventSpec::new(ChatMessage, Low).rate(1.0, 3.0).sanitized(),
            EventSpec::new(Heartbeat, High).rate(2.0, 4.0),
            EventSpec::new(JoinMatchmaking, Normal).rate(1.0, 2.0),
            EventSpec::new(LeaveMatchmaking, Normal).rate(1.0, 2.0),
            EventSpec::new(ReadyUp, High).rate(2.0, 4.0),
            EventSpec::new(ForfeitGame, Critical).rate(0.2, 1.0).persistent(),
            EventSpec::new(RequestGameEnd, Critical).rate(0.2, 1.0).persistent(),
            EventSpec::new(PauseRequest, High).rate(0.5, 2.0),
            EventSpec::new(ResumeRequest, High).rate(0.5, 2.0),
            // System events: no rate limit
            EventSpec::new(StateUpdate, Normal),
            EventSpec::new(GoalScored, High).persistent(),
            EventSpec::new(LagCompensation, Normal),
            EventSpec::new(GameEnded, Critical).persistent(),
            EventSpec::new(GameCleanup, Low),
            EventSpec::new(Backpressure, High),
        ];

        Self {
            specs: specs.into_iter().map(|s| (s.kind, s)).collect(),
        }
    }

    pub fn spec(&self, kind: EventKind) -> Option<&EventSpec> {
        self.specs.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Schema validation: field ranges and enumerations. Returns every
    /// failing field, not just the first.
    pub fn validate(&self, msg: &ClientMessage) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        match msg {
            ClientMessage::PlayerMovement(claim) => {
                check_position("position", &claim.position, &mut errors);
                check_velocity("velocity", &claim.velocity, &mut errors);
                if claim.sequence_id == 0 {
                    errors.push(field_error("sequenceId", "must be positive"));
                }
            }
            ClientMessage::BallUpdate(claim) => {
                check_position("position", &claim.position, &mut errors);
                check_velocity("velocity", &claim.velocity, &mut errors);
            }
            ClientMessage::GoalAttempt(claim) => {
                check_position("position", &claim.position, &mut errors);
                check_velocity("velocity", &claim.velocity, &mut errors);
                if claim.goal_type.is_empty() || claim.goal_type.len() > 32 {
                    errors.push(field_error("goalType", "length must be 1..=32"));
                }
            }
            ClientMessage::ChatMessage(chat) => {
                if chat.message.trim().is_empty() {
                    errors.push(field_error("message", "must not be empty"));
                }
                if chat.message.len() > 2000 {
                    errors.push(field_error("message", "too long"));
                }
            }
            ClientMessage::RequestGameEnd(req) => {
                if req.reason.is_empty() || req.reason.len() > 64 {
                    errors.push(field_error("reason", "length must be 1..=64"));
                }
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Text sanitization for events whose spec requests it.
    pub fn sanitize(&self, msg: &mut ClientMessage) {
        if let ClientMessage::ChatMessage(chat) = msg {
            chat.message = sanitize_text(&chat.message, CHAT_MAX_LEN);
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn field_error(field: &str, reason: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn check_position(field: &str, position: &Vec2, errors: &mut Vec<FieldError>) {
    if !position.x.is_finite() || !position.y.is_finite() {
        errors.push(field_error(field, "must be finite"));
        return;
    }
    if position.x < -FIELD_SLACK
        || position.x > FIELD_WIDTH + FIELD_SLACK
        || position.y < -FIELD_SLACK
        || position.y > FIELD_HEIGHT + FIELD_SLACK
    {
        errors.push(field_error(field, "outside the field"));
    }
}

fn check_velocity(field: &str, velocity: &Vec2, errors: &mut Vec<FieldError>) {
    if !velocity.x.is_finite() || !velocity.y.is_finite() {
        errors.push(field_error(field, "must be finite"));
        return;
    }
    if velocity.magnitude() > SCHEMA_SPEED_CAP {
        errors.push(field_error(field, "speed exceeds cap"));
    }
}

/// Strip markup, collapse control characters, trim, and clamp length.
pub fn sanitize_text(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if in_tag => {}
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    let trimmed = out.trim();
    trimmed.chars().take(max_len).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::InputFrame;
    use crate::network::protocol::{ChatRequest, ChatScope, MovementClaim};

    fn movement(x: f32, y: f32, vx: f32, vy: f32, seq: u64) -> ClientMessage {
        ClientMessage::PlayerMovement(MovementClaim {
            position: Vec2::new(x, y),
            velocity: Vec2::new(vx, vy),
            keys: InputFrame::default(),
            timestamp: 0,
            sequence_id: seq,
        })
    }

    #[test]
    fn test_registry_covers_all_kinds() {
        let registry = EventRegistry::standard();
        assert_eq!(registry.len(), 18);
        assert!(registry.spec(EventKind::PlayerMovement).is_some());
        assert!(registry.spec(EventKind::GameCleanup).is_some());
    }

    #[test]
    fn test_terminal_events_are_critical() {
        let registry = EventRegistry::standard();
        assert_eq!(
            registry.spec(EventKind::GameEnded).unwrap().priority,
            EventPriority::Critical
        );
        assert_eq!(
            registry.spec(EventKind::ForfeitGame).unwrap().priority,
            EventPriority::Critical
        );
        assert_eq!(
            registry.spec(EventKind::GameCleanup).unwrap().priority,
            EventPriority::Low
        );
    }

    #[test]
    fn test_valid_movement_passes() {
        let registry = EventRegistry::standard();
        assert!(registry.validate(&movement(400.0, 800.0, 8.0, 0.0, 1)).is_ok());
    }

    #[test]
    fn test_movement_out_of_field_fails_with_field_reason() {
        let registry = EventRegistry::standard();
        let err = registry
            .validate(&movement(9000.0, 800.0, 8.0, 0.0, 1))
            .unwrap_err();
        assert!(err.iter().any(|e| e.field == "position"));
    }

    #[test]
    fn test_non_finite_values_fail() {
        let registry = EventRegistry::standard();
        let err = registry
            .validate(&movement(f32::NAN, 800.0, 8.0, 0.0, 1))
            .unwrap_err();
        assert_eq!(err[0].reason, "must be finite");
    }

    #[test]
    fn test_zero_sequence_fails() {
        let registry = EventRegistry::standard();
        let err = registry
            .validate(&movement(400.0, 800.0, 8.0, 0.0, 0))
            .unwrap_err();
        assert!(err.iter().any(|e| e.field == "sequenceId"));
    }

    #[test]
    fn test_multiple_field_errors_reported() {
        let registry = EventRegistry::standard();
        let err = registry
            .validate(&movement(9000.0, 800.0, 500.0, 0.0, 0))
            .unwrap_err();
        assert_eq!(err.len(), 3);
    }

    #[test]
    fn test_chat_sanitization() {
        let registry = EventRegistry::standard();
        let mut msg = ClientMessage::ChatMessage(ChatRequest {
            message: "  hello <script>alert(1)</script> world  ".to_string(),
            scope: ChatScope::All,
        });
        registry.sanitize(&mut msg);
        if let ClientMessage::ChatMessage(chat) = msg {
            assert_eq!(chat.message, "hello alert(1) world");
        } else {
            panic!("wrong message type");
        }
    }

    #[test]
    fn test_sanitize_clamps_length() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_text(&long, CHAT_MAX_LEN).len(), CHAT_MAX_LEN);
    }

    #[test]
    fn test_empty_chat_rejected() {
        let registry = EventRegistry::standard();
        let msg = ClientMessage::ChatMessage(ChatRequest {
            message: "   ".to_string(),
            scope: ChatScope::All,
        });
        assert!(registry.validate(&msg).is_err());
    }
}
