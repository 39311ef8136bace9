//! Fixed-Tick Kinematics
//!
//! One simulation step for a room's world: player movement, ball flight,
//! ball-player contact, and goal detection. Pure over
//! (state, inputs, rng, config), so a recorded input stream replays to the
//! same state hash.

use serde::{Deserialize, Serialize};

use crate::game::player::Side;
use crate::game::rng::GameRng;
use crate::game::world::{
    Vec2, WorldState, BALL_RADIUS, FIELD_WIDTH, GROUND_Y, PLAYER_HALF_HEIGHT, PLAYER_HALF_WIDTH,
};

/// Held keys for one player, merged per tick (latest input wins).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputFrame {
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub kick: bool,
}

impl InputFrame {
    pub const NEUTRAL: InputFrame = InputFrame {
        left: false,
        right: false,
        jump: false,
        kick: false,
    };
}

/// Inputs for both sides this tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickInputs {
    pub left: InputFrame,
    pub right: InputFrame,
}

impl TickInputs {
    pub fn for_side(&self, side: Side) -> &InputFrame {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

/// Tunable physics constants.
#[derive(Debug, Clone)]
pub struct PhysicsConfig {
    /// Horizontal speed while a direction key is held (units/tick).
    pub move_speed: f32,
    /// Horizontal velocity multiplier when no direction key is held.
    pub friction: f32,
    /// Downward acceleration per tick.
    pub gravity: f32,
    /// Upward impulse applied on jump.
    pub jump_impulse: f32,
    /// Velocity retained on floor and wall reflection.
    pub bounce: f32,
    /// Minimum impulse imparted on ball contact.
    pub kick_force_min: f32,
    /// Maximum impulse imparted on ball contact.
    pub kick_force_max: f32,
    /// Multiplier applied to every imparted impulse.
    pub bounce_multiplier: f32,
    /// Ticks between accepted kicks.
    pub kick_cooldown_ticks: u16,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            move_speed: 8.0,
            friction: 0.85,
            gravity: 0.5,
            jump_impulse: 12.0,
            bounce: 0.95,
            kick_force_min: 18.0,
            kick_force_max: 25.0,
            bounce_multiplier: 1.1,
            kick_cooldown_ticks: 15,
        }
    }
}

/// Outcome of one simulation step.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepResult {
    /// Side that scored this tick, if the ball entered a goal mouth.
    pub goal: Option<Side>,
    /// Side that touched the ball this tick, if any.
    pub touched: Option<Side>,
}

/// Run one simulation step.
///
/// Order matters: players move first, then the ball, then contacts,
/// then goal detection on the settled positions.
pub fn step(
    world: &mut WorldState,
    inputs: &TickInputs,
    rng: &mut GameRng,
    config: &PhysicsConfig,
) -> StepResult {
    let mut result = StepResult::default();

    world.tick += 1;

    // 1. Player kinematics (left before right: deterministic order)
    for side in [Side::Left, Side::Right] {
        step_player(world, side, inputs.for_side(side), config);
    }

    // 2. Ball kinematics
    step_ball(world, config);

    // 3. Ball-player contact
    for side in [Side::Left, Side::Right] {
        if resolve_contact(world, side, rng, config) {
            world.last_touch = Some(side);
            result.touched = Some(side);
        }
    }

    // 4. Goal detection: ball in the mouth a side defends scores for the
    //    opponent. Cooldown gating is the room's concern.
    for defending in [Side::Left, Side::Right] {
        if WorldState::in_goal_mouth(&world.ball.position, defending) {
            result.goal = Some(defending.opponent());
            break;
        }
    }

    result
}

fn step_player(world: &mut WorldState, side: Side, input: &InputFrame, config: &PhysicsConfig) {
    let body = world.body_mut(side);

    // Horizontal: held direction wins, otherwise friction decay
    if input.left {
        body.velocity.x = -config.move_speed;
    } else if input.right {
        body.velocity.x = config.move_speed;
    } else {
        body.velocity.x *= config.friction;
    }

    // Jump only from the ground
    if input.jump && body.on_ground {
        body.velocity.y = -config.jump_impulse;
        body.on_ground = false;
    }

    body.velocity.y += config.gravity;
    body.position = body.position.add(&body.velocity);

    // Clamp to field bounds
    body.position.x = body
        .position
        .x
        .clamp(PLAYER_HALF_WIDTH, FIELD_WIDTH - PLAYER_HALF_WIDTH);
    if body.position.y < PLAYER_HALF_HEIGHT {
        body.position.y = PLAYER_HALF_HEIGHT;
        body.velocity.y = body.velocity.y.max(0.0);
    }

    // Landing
    if body.position.y + PLAYER_HALF_HEIGHT >= GROUND_Y {
        body.position.y = GROUND_Y - PLAYER_HALF_HEIGHT;
        body.velocity.y = 0.0;
        body.on_ground = true;
    } else {
        body.on_ground = false;
    }

    // Kick state: pressing starts the cooldown; the flag holds for the tick
    if body.kick_cooldown > 0 {
        body.kick_cooldown -= 1;
    }
    if input.kick && body.kick_cooldown == 0 {
        body.kicking = true;
        body.kick_cooldown = config.kick_cooldown_ticks;
    } else {
        body.kicking = false;
    }
}

fn step_ball(world: &mut WorldState, config: &PhysicsConfig) {
    let ball = &mut world.ball;

    ball.velocity.y += config.gravity;
    ball.position = ball.position.add(&ball.velocity);

    // Floor
    if ball.position.y + BALL_RADIUS >= GROUND_Y {
        ball.position.y = GROUND_Y - BALL_RADIUS;
        ball.velocity.y = -ball.velocity.y * config.bounce;
    }
    // Ceiling
    if ball.position.y - BALL_RADIUS <= 0.0 {
        ball.position.y = BALL_RADIUS;
        ball.velocity.y = -ball.velocity.y * config.bounce;
    }
    // Side walls. The goal mouths sit inside the reflection depth, so a
    // shot on target still registers before the rebound is visible.
    if ball.position.x - BALL_RADIUS <= 0.0 {
        ball.position.x = BALL_RADIUS;
        ball.velocity.x = -ball.velocity.x * config.bounce;
    }
    if ball.position.x + BALL_RADIUS >= FIELD_WIDTH {
        ball.position.x = FIELD_WIDTH - BALL_RADIUS;
        ball.velocity.x = -ball.velocity.x * config.bounce;
    }
}

/// Resolve a ball-player contact, if any. Returns true on contact.
fn resolve_contact(
    world: &mut WorldState,
    side: Side,
    rng: &mut GameRng,
    config: &PhysicsConfig,
) -> bool {
    let player = *world.body(side);
    let contact_distance = PLAYER_HALF_WIDTH + BALL_RADIUS;
    if player.position.distance(&world.ball.position) > contact_distance {
        return false;
    }

    let angle = (world.ball.position.y - player.position.y)
        .atan2(world.ball.position.x - player.position.x);
    let direction = Vec2::new(angle.cos(), angle.sin());

    // Separate along the contact normal, then keep the ball inside the
    // field (a grounded player can otherwise push it through the floor)
    world.ball.position = player.position.add(&direction.scale(contact_distance));
    world.ball.position.x = world
        .ball
        .position
        .x
        .clamp(BALL_RADIUS, FIELD_WIDTH - BALL_RADIUS);
    world.ball.position.y = world.ball.position.y.clamp(BALL_RADIUS, GROUND_Y - BALL_RADIUS);

    let mut force = rng.next_range(config.kick_force_min, config.kick_force_max);
    if player.kicking {
        force *= 2.0;
    }
    force *= config.bounce_multiplier;

    world.ball.velocity = direction.scale(force);
    true
}
