//! Game logic: players, rooms, and the authoritative simulation.

pub mod end;
pub mod physics;
pub mod player;
pub mod rng;
pub mod room;
pub mod world;
