//! Game-State Validator
//!
//! Per-tick checks on client movement and goal claims against the
//! authoritative world, with latency-proportional tolerance and bounded
//! lag compensation. Verdicts are tagged results; rejection carries the
//! corrective state the client should snap back to.

use crate::game::player::Side;
use crate::game::world::{
    PlayerBody, Vec2, WorldState, FIELD_HEIGHT, FIELD_WIDTH, GROUND_Y, PLAYER_HALF_HEIGHT,
    PLAYER_HALF_WIDTH,
};
use crate::network::protocol::MovementClaim;
use crate::TICK_RATE;

/// Validator tuning.
#[derive(Debug, Clone)]
pub struct MovementConfig {
    /// Cap on claimed player speed (units/tick).
    pub player_speed_cap: f32,
    /// Cap on claimed ball speed (units/tick).
    pub ball_speed_cap: f32,
    /// Base positional tolerance in units.
    pub base_tolerance: f32,
    /// Extra tolerance per millisecond of estimated latency.
    pub tolerance_per_latency_ms: f32,
    /// Upper bound on lag-compensation extrapolation.
    pub max_compensation_ms: u32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            player_speed_cap: 25.0,
            ball_speed_cap: 40.0,
            base_tolerance: 5.0,
            tolerance_per_latency_ms: 0.5,
            max_compensation_ms: 150,
        }
    }
}

/// Why a claim was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OutOfBounds,
    SpeedExceeded,
    Inconsistent,
    NotInGoalMouth,
    NoTouch,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::OutOfBounds => "out_of_bounds",
            RejectReason::SpeedExceeded => "speed_exceeded",
            RejectReason::Inconsistent => "inconsistent_delta",
            RejectReason::NotInGoalMouth => "not_in_goal_mouth",
            RejectReason::NoTouch => "no_touch",
        }
    }
}

/// Verdict on a movement claim.
#[derive(Debug, Clone)]
pub enum MovementVerdict {
    /// Claim folded into the authoritative state, possibly extrapolated.
    Accepted {
        position: Vec2,
        velocity: Vec2,
        /// Milliseconds of extrapolation applied; zero when none.
        compensation_ms: u32,
    },
    /// Claim rejected; the client should snap back to the corrective state.
    Rejected {
        reason: RejectReason,
        corrected_position: Vec2,
        corrected_velocity: Vec2,
    },
}

impl MovementVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MovementVerdict::Accepted { .. })
    }
}

/// Verdict on a goal claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalVerdict {
    Valid,
    Rejected(RejectReason),
}

/// Validate a movement claim against the authoritative body.
///
/// `elapsed_ticks` is the simulation distance since the authoritative body
/// was last reconciled with this player's claims.
pub fn validate_movement(
    claim: &MovementClaim,
    authoritative: &PlayerBody,
    latency_ms: u32,
    elapsed_ticks: u64,
    config: &MovementConfig,
) -> MovementVerdict {
    let reject = |reason| MovementVerdict::Rejected {
        reason,
        corrected_position: authoritative.position,
        corrected_velocity: authoritative.velocity,
    };

    // Position inside the field
    let p = &claim.position;
    if p.x < PLAYER_HALF_WIDTH
        || p.x > FIELD_WIDTH - PLAYER_HALF_WIDTH
        || p.y < PLAYER_HALF_HEIGHT
        || p.y > FIELD_HEIGHT
    {
        return reject(RejectReason::OutOfBounds);
    }

    // Speed cap
    if claim.velocity.magnitude() > config.player_speed_cap {
        return reject(RejectReason::SpeedExceeded);
    }

    // Delta consistency: the claim may not be further from the
    // authoritative body than its velocity could carry it, plus a
    // latency-proportional slack.
    let travel_budget = config.player_speed_cap * elapsed_ticks.max(1) as f32;
    let tolerance = config.base_tolerance + latency_ms as f32 * config.tolerance_per_latency_ms;
    if authoritative.position.distance(&claim.position) > travel_budget + tolerance {
        return reject(RejectReason::Inconsistent);
    }

    // Lag compensation: extrapolate along the claimed velocity by the
    // bounded latency estimate.
    let compensation_ms = latency_ms.min(config.max_compensation_ms);
    let ticks = compensation_ms as f32 * TICK_RATE as f32 / 1000.0;
    let mut position = claim.position.add(&claim.velocity.scale(ticks));
    position.x = position.x.clamp(PLAYER_HALF_WIDTH, FIELD_WIDTH - PLAYER_HALF_WIDTH);
    position.y = position.y.clamp(PLAYER_HALF_HEIGHT, GROUND_Y - PLAYER_HALF_HEIGHT);

    MovementVerdict::Accepted {
        position,
        velocity: claim.velocity,
        compensation_ms,
    }
}

/// Validate a goal claim: the authoritative ball must sit inside the mouth
/// the scoring side attacks, and somebody must have touched the ball since
/// the last reset.
pub fn validate_goal(world: &WorldState, scoring: Side) -> GoalVerdict {
    if !WorldState::in_goal_mouth(&world.ball.position, scoring.opponent()) {
        return GoalVerdict::Rejected(RejectReason::NotInGoalMouth);
    }
    if world.last_touch.is_none() {
        return GoalVerdict::Rejected(RejectReason::NoTouch);
    }
    GoalVerdict::Valid
}

/// Validate a claimed ball velocity (the authoritative ball always wins;
/// this only gates echoes of implausible claims).
pub fn validate_ball_speed(velocity: &Vec2, config: &MovementConfig) -> bool {
    velocity.magnitude() <= config.ball_speed_cap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::InputFrame;
    use crate::game::world::BallBody;

    fn claim(x: f32, y: f32, vx: f32, vy: f32) -> MovementClaim {
        MovementClaim {
            position: Vec2::new(x, y),
            velocity: Vec2::new(vx, vy),
            keys: InputFrame::default(),
            timestamp: 0,
            sequence_id: 1,
        }
    }

    fn body(x: f32, y: f32) -> PlayerBody {
        PlayerBody {
            position: Vec2::new(x, y),
            velocity: Vec2::ZERO,
            on_ground: true,
            kick_cooldown: 0,
            kicking: false,
        }
    }

    #[test]
    fn test_consistent_claim_accepted() {
        let config = MovementConfig::default();
        let auth = body(400.0, 840.0);
        let verdict = validate_movement(&claim(405.0, 840.0, 8.0, 0.0), &auth, 0, 1, &config);
        assert!(verdict.is_accepted());
    }

    #[test]
    fn test_out_of_bounds_rejected_with_correction() {
        let config = MovementConfig::default();
        let auth = body(400.0, 840.0);
        let verdict = validate_movement(&claim(-50.0, 840.0, 0.0, 0.0), &auth, 0, 1, &config);
        match verdict {
            MovementVerdict::Rejected {
                reason,
                corrected_position,
                ..
            } => {
                assert_eq!(reason, RejectReason::OutOfBounds);
                assert_eq!(corrected_position, auth.position);
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_speed_cap_rejected() {
        let config = MovementConfig::default();
        let auth = body(400.0, 840.0);
        let verdict = validate_movement(&claim(400.0, 840.0, 80.0, 0.0), &auth, 0, 1, &config);
        assert!(matches!(
            verdict,
            MovementVerdict::Rejected {
                reason: RejectReason::SpeedExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_teleport_rejected() {
        let config = MovementConfig::default();
        let auth = body(200.0, 840.0);
        // 900 units away after one tick with zero latency slack
        let verdict = validate_movement(&claim(1100.0, 840.0, 8.0, 0.0), &auth, 0, 1, &config);
        assert!(matches!(
            verdict,
            MovementVerdict::Rejected {
                reason: RejectReason::Inconsistent,
                ..
            }
        ));
    }

    #[test]
    fn test_latency_widens_tolerance() {
        let config = MovementConfig::default();
        let auth = body(200.0, 840.0);
        let c = claim(260.0, 840.0, 8.0, 0.0);
        // 60 units in one tick: too far with no latency...
        assert!(!validate_movement(&c, &auth, 0, 1, &config).is_accepted());
        // ...but plausible for a 100 ms laggard
        assert!(validate_movement(&c, &auth, 100, 1, &config).is_accepted());
    }

    #[test]
    fn test_compensation_bounded_at_cap() {
        let config = MovementConfig::default();
        let auth = body(400.0, 840.0);
        let verdict = validate_movement(&claim(400.0, 840.0, 8.0, 0.0), &auth, 500, 1, &config);
        match verdict {
            MovementVerdict::Accepted {
                compensation_ms,
                position,
                ..
            } => {
                assert_eq!(compensation_ms, config.max_compensation_ms);
                // Extrapolated forward along +x
                assert!(position.x > 400.0);
            }
            _ => panic!("expected acceptance"),
        }
    }

    #[test]
    fn test_goal_requires_mouth_and_touch() {
        let mut world = WorldState::new();
        // Ball in the right-hand mouth, touched by left
        world.ball = BallBody {
            position: Vec2::new(FIELD_WIDTH - 30.0, GROUND_Y - 40.0),
            velocity: Vec2::ZERO,
        };
        world.last_touch = Some(Side::Left);
        assert_eq!(validate_goal(&world, Side::Left), GoalVerdict::Valid);

        // Untouched ball cannot score
        world.last_touch = None;
        assert_eq!(
            validate_goal(&world, Side::Left),
            GoalVerdict::Rejected(RejectReason::NoTouch)
        );

        // Ball at midfield is not a goal
        world.last_touch = Some(Side::Left);
        world.ball.position = Vec2::new(800.0, 400.0);
        assert_eq!(
            validate_goal(&world, Side::Left),
            GoalVerdict::Rejected(RejectReason::NotInGoalMouth)
        );
    }

    #[test]
    fn test_ball_speed_gate() {
        let config = MovementConfig::default();
        assert!(validate_ball_speed(&Vec2::new(30.0, 10.0), &config));
        assert!(!validate_ball_speed(&Vec2::new(50.0, 20.0), &config));
    }
}
