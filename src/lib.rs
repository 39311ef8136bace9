//! # Headball Game Server
//!
//! Authoritative server for real-time 1v1 head-soccer matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     HEADBALL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Authoritative simulation                  │
//! │  ├── player.rs   - Player entity and session state machine   │
//! │  ├── world.rs    - World state, bodies, snapshot hashing     │
//! │  ├── physics.rs  - Fixed-tick kinematics and goal detection  │
//! │  ├── rng.rs      - Per-room Xorshift128+ PRNG                │
//! │  ├── room.rs     - Room state machine and tick loop          │
//! │  └── end.rs      - Game-end results, choreography, cleanup   │
//! │                                                              │
//! │  events/         - Validated event pipeline                  │
//! │  ├── registry.rs - Typed event registry + schema checks      │
//! │  └── pipeline.rs - Prioritized queues, rate limits, fan-out  │
//! │                                                              │
//! │  matchmaking/    - Queue and ready-up flow                   │
//! │  ├── queue.rs    - Skill-tolerant FIFO matchmaker            │
//! │  └── lobby.rs    - Ready-up window and pairing rewind        │
//! │                                                              │
//! │  validate/       - Input and result validation               │
//! │  ├── movement.rs - Per-tick movement/goal checks, lag comp   │
//! │  └── anti_cheat.rs - Result submission plausibility          │
//! │                                                              │
//! │  network/        - Transport and connection ownership        │
//! │  ├── server.rs   - WebSocket accept loop and routing         │
//! │  ├── connection.rs - Socket registry, heartbeats, rooms      │
//! │  ├── protocol.rs - Wire messages                             │
//! │  └── auth.rs     - Token validation                          │
//! │                                                              │
//! │  persist/        - Match and stats persistence adapter       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Model
//!
//! Each room owns its `WorldState` exclusively: only the room's tick task
//! mutates it, at a fixed 60 Hz. Client claims (movement, goals) are
//! validated against the authoritative state and either folded in with lag
//! compensation or answered with a corrective snapshot. Randomness (kick
//! impulses) comes from a per-room seeded Xorshift128+, so a recorded input
//! stream replays to an identical state hash.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod events;
pub mod game;
pub mod matchmaking;
pub mod network;
pub mod persist;
pub mod validate;

// Re-export commonly used types
pub use game::player::{Player, PlayerId, PlayerStatus, Side};
pub use game::room::{Room, RoomId, RoomManager, RoomState};
pub use game::world::WorldState;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;

/// Snapshot broadcast divisor: one authoritative snapshot every N ticks.
pub const SNAPSHOT_DIVISOR: u64 = 3;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
