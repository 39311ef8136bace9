//! Authoritative World State
//!
//! The per-room simulation state: two player bodies, the ball, the score,
//! and the tick counter. Only the owning room's tick loop mutates this;
//! everything else sees immutable snapshots.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::game::player::Side;

// =============================================================================
// FIELD GEOMETRY
// =============================================================================

/// Field width in world units.
pub const FIELD_WIDTH: f32 = 1600.0;
/// Field height in world units.
pub const FIELD_HEIGHT: f32 = 900.0;
/// Gap between the field bottom edge and the ground plane.
pub const GROUND_GAP: f32 = 20.0;
/// Y coordinate of the ground plane (y grows downward).
pub const GROUND_Y: f32 = FIELD_HEIGHT - GROUND_GAP;

/// Ball radius.
pub const BALL_RADIUS: f32 = 25.0;
/// Player half-width (50 wide).
pub const PLAYER_HALF_WIDTH: f32 = 25.0;
/// Player half-height (80 tall).
pub const PLAYER_HALF_HEIGHT: f32 = 40.0;

/// Goal mouth height, measured up from the ground plane.
pub const GOAL_HEIGHT: f32 = 200.0;
/// Goal mouth depth, measured in from each back wall.
pub const GOAL_DEPTH: f32 = 60.0;

/// Starting x for the left player.
pub const LEFT_SPAWN_X: f32 = 400.0;
/// Starting x for the right player.
pub const RIGHT_SPAWN_X: f32 = 1200.0;
/// Ball spawn position (field center, above the players).
pub const BALL_SPAWN: Vec2 = Vec2 { x: FIELD_WIDTH / 2.0, y: 300.0 };

// =============================================================================
// VECTORS AND BODIES
// =============================================================================

/// 2D vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn scale(&self, scalar: f32) -> Vec2 {
        Vec2 {
            x: self.x * scalar,
            y: self.y * scalar,
        }
    }

    pub fn add(&self, other: &Vec2) -> Vec2 {
        Vec2 {
            x: self.x + other.x,
            y: self.y + other.y,
        }
    }
}

/// A player's physical body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlayerBody {
    /// Center position.
    pub position: Vec2,
    /// Velocity in units per tick.
    pub velocity: Vec2,
    /// Standing on the ground plane.
    pub on_ground: bool,
    /// Ticks until the next kick is accepted.
    pub kick_cooldown: u16,
    /// Kick is active this tick.
    pub kicking: bool,
}

impl PlayerBody {
    /// Spawn a body at its side's starting position, feet on the ground.
    pub fn spawn(side: Side) -> Self {
        let x = match side {
            Side::Left => LEFT_SPAWN_X,
            Side::Right => RIGHT_SPAWN_X,
        };
        Self {
            position: Vec2::new(x, GROUND_Y - PLAYER_HALF_HEIGHT),
            velocity: Vec2::ZERO,
            on_ground: true,
            kick_cooldown: 0,
            kicking: false,
        }
    }
}

/// The ball's physical body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BallBody {
    pub position: Vec2,
    pub velocity: Vec2,
}

impl BallBody {
    pub fn spawn() -> Self {
        Self {
            position: BALL_SPAWN,
            velocity: Vec2::ZERO,
        }
    }
}

/// Match score. Componentwise monotonic: there is no way to decrement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    pub left: u32,
    pub right: u32,
}

impl Score {
    /// Increment the scoring side.
    pub fn credit(&mut self, side: Side) {
        match side {
            Side::Left => self.left += 1,
            Side::Right => self.right += 1,
        }
    }

    pub fn for_side(&self, side: Side) -> u32 {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub fn total(&self) -> u32 {
        self.left + self.right
    }
}

// =============================================================================
// WORLD STATE
// =============================================================================

/// Authoritative per-room snapshot of the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    /// Simulation tick counter.
    pub tick: u64,
    /// Left player body.
    pub left: PlayerBody,
    /// Right player body.
    pub right: PlayerBody,
    /// Ball body.
    pub ball: BallBody,
    /// Current score.
    pub score: Score,
    /// Last side to touch the ball, if any.
    pub last_touch: Option<Side>,
}

impl WorldState {
    /// Fresh world with both players at their spawns and the ball centered.
    pub fn new() -> Self {
        Self {
            tick: 0,
            left: PlayerBody::spawn(Side::Left),
            right: PlayerBody::spawn(Side::Right),
            ball: BallBody::spawn(),
            score: Score::default(),
            last_touch: None,
        }
    }

    pub fn body(&self, side: Side) -> &PlayerBody {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn body_mut(&mut self, side: Side) -> &mut PlayerBody {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Reset ball and players after a goal cooldown ends. Score and tick
    /// counter are preserved.
    pub fn reset_positions(&mut self) {
        self.left = PlayerBody::spawn(Side::Left);
        self.right = PlayerBody::spawn(Side::Right);
        self.ball = BallBody::spawn();
        self.last_touch = None;
    }

    /// Hash the authoritative state for desync triage.
    ///
    /// Float coordinates are hashed by bit pattern, so two states hash
    /// equal exactly when their simulations agree bit-for-bit.
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.tick.to_le_bytes());
        for body in [&self.left, &self.right] {
            hasher.update(body.position.x.to_bits().to_le_bytes());
            hasher.update(body.position.y.to_bits().to_le_bytes());
            hasher.update(body.velocity.x.to_bits().to_le_bytes());
            hasher.update(body.velocity.y.to_bits().to_le_bytes());
            hasher.update([body.on_ground as u8, body.kicking as u8]);
            hasher.update(body.kick_cooldown.to_le_bytes());
        }
        hasher.update(self.ball.position.x.to_bits().to_le_bytes());
        hasher.update(self.ball.position.y.to_bits().to_le_bytes());
        hasher.update(self.ball.velocity.x.to_bits().to_le_bytes());
        hasher.update(self.ball.velocity.y.to_bits().to_le_bytes());
        hasher.update(self.score.left.to_le_bytes());
        hasher.update(self.score.right.to_le_bytes());
        hasher.finalize().into()
    }

    /// Serialized snapshot for broadcast to room members.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            left: self.left,
            right: self.right,
            ball: self.ball,
            score: self.score,
            state_hash: hex::encode(self.compute_hash()),
        }
    }

    /// True when the given point lies inside the field rectangle.
    pub fn in_field(position: &Vec2) -> bool {
        position.x >= 0.0
            && position.x <= FIELD_WIDTH
            && position.y >= 0.0
            && position.y <= FIELD_HEIGHT
    }

    /// True when `position` is inside the goal mouth that `side` defends.
    pub fn in_goal_mouth(position: &Vec2, defending: Side) -> bool {
        let in_height = position.y >= GROUND_Y - GOAL_HEIGHT && position.y <= GROUND_Y;
        let in_depth = match defending {
            Side::Left => position.x <= GOAL_DEPTH,
            Side::Right => position.x >= FIELD_WIDTH - GOAL_DEPTH,
        };
        in_height && in_depth
    }
}

impl Default for WorldState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire-friendly snapshot of the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub left: PlayerBody,
    pub right: PlayerBody,
    pub ball: BallBody,
    pub score: Score,
    /// Hex-encoded sha256 of the authoritative state.
    pub state_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_geometry() {
        let world = WorldState::new();
        assert!(world.left.on_ground);
        assert!(world.right.on_ground);
        assert_eq!(world.left.position.x, LEFT_SPAWN_X);
        assert_eq!(world.right.position.x, RIGHT_SPAWN_X);
        // Feet exactly on the ground plane
        assert_eq!(world.left.position.y + PLAYER_HALF_HEIGHT, GROUND_Y);
    }

    #[test]
    fn test_score_credit() {
        let mut score = Score::default();
        score.credit(Side::Left);
        score.credit(Side::Left);
        score.credit(Side::Right);
        assert_eq!(score.left, 2);
        assert_eq!(score.right, 1);
        assert_eq!(score.total(), 3);
        assert_eq!(score.for_side(Side::Left), 2);
    }

    #[test]
    fn test_goal_mouth_bounds() {
        // Just inside the left mouth
        let p = Vec2::new(30.0, GROUND_Y - 50.0);
        assert!(WorldState::in_goal_mouth(&p, Side::Left));
        assert!(!WorldState::in_goal_mouth(&p, Side::Right));

        // Above the crossbar
        let high = Vec2::new(30.0, GROUND_Y - GOAL_HEIGHT - 1.0);
        assert!(!WorldState::in_goal_mouth(&high, Side::Left));

        // Right mouth
        let r = Vec2::new(FIELD_WIDTH - 10.0, GROUND_Y - 10.0);
        assert!(WorldState::in_goal_mouth(&r, Side::Right));
    }

    #[test]
    fn test_hash_tracks_state() {
        let mut a = WorldState::new();
        let b = WorldState::new();
        assert_eq!(a.compute_hash(), b.compute_hash());

        a.ball.position.x += 1.0;
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_reset_preserves_score() {
        let mut world = WorldState::new();
        world.score.credit(Side::Left);
        world.ball.position = Vec2::new(10.0, 10.0);
        world.tick = 500;

        world.reset_positions();
        assert_eq!(world.score.left, 1);
        assert_eq!(world.tick, 500);
        assert_eq!(world.ball.position, BALL_SPAWN);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let world = WorldState::new();
        let snap = world.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let parsed: WorldSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tick, 0);
        assert_eq!(parsed.state_hash, hex::encode(world.compute_hash()));
    }
}
