//! Matchmaking: the skill-tolerant FIFO queue and the ready-up flow.

pub mod lobby;
pub mod queue;
