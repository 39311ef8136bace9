//! Validation: per-tick game-state checks and post-game result plausibility.

pub mod anti_cheat;
pub mod movement;
