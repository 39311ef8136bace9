//! Connection Manager
//!
//! Owns every socket and every player record: authentication binding,
//! socket takeover on reconnect, room membership sets, heartbeat sweeps,
//! and fan-out primitives. All player connection state is mutated here and
//! nowhere else.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::game::player::{Player, PlayerId, PlayerStatus};
use crate::game::room::RoomId;
use crate::network::protocol::ServerMessage;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Idle interval after which a socket is pinged.
    pub heartbeat_interval: Duration,
    /// Idle interval after which a socket is force-closed.
    pub connection_timeout: Duration,
    /// Hard cap on concurrent sockets.
    pub max_connections: usize,
    /// How long a disconnected player's session survives.
    pub reconnect_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            max_connections: 1000,
            reconnect_grace: Duration::from_secs(10),
        }
    }
}

/// Why the server closed a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Timeout,
    Capacity,
    Replaced,
    AuthFailed,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Timeout => "TIMEOUT",
            CloseReason::Capacity => "CAPACITY",
            CloseReason::Replaced => "REPLACED",
            CloseReason::AuthFailed => "AUTH_FAILED",
            CloseReason::Shutdown => "SHUTDOWN",
        }
    }
}

/// What the per-socket writer task receives.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(ServerMessage),
    /// WebSocket-level ping for heartbeat.
    Ping,
    Close(CloseReason),
}

/// Connection errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection capacity reached")]
    Capacity,

    #[error("socket not found")]
    SocketNotFound,

    #[error("player not found")]
    PlayerNotFound,

    #[error("socket not authenticated")]
    NotAuthenticated,
}

struct SocketEntry {
    addr: SocketAddr,
    player_id: Option<PlayerId>,
    room: Option<RoomId>,
    authenticated: bool,
    connected_at: Instant,
    last_activity: Instant,
    sender: mpsc::Sender<Outbound>,
}

/// Counters the manager maintains.
#[derive(Debug, Default)]
struct Counters {
    total_accepted: AtomicU64,
    timed_out: AtomicU64,
    reconnected: AtomicU64,
    rejected_capacity: AtomicU64,
}

/// Snapshot of connection counters.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub current: usize,
    pub total_accepted: u64,
    pub timed_out: u64,
    pub reconnected: u64,
    pub rejected_capacity: u64,
}

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub player_id: PlayerId,
    pub username: String,
    pub elo: i32,
    /// True when this socket took over an existing session.
    pub reconnected: bool,
    /// Room the resumed session belongs to, if any.
    pub room_id: Option<RoomId>,
    /// Socket that was displaced, if any.
    pub replaced_socket: Option<u64>,
}

/// Result of a heartbeat sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Sockets idle past the heartbeat interval; a ping was queued.
    pub pinged: Vec<u64>,
    /// Sockets idle past the timeout; a close was queued.
    pub closed: Vec<(u64, Option<PlayerId>)>,
}

/// The connection manager.
pub struct ConnectionManager {
    config: ConnectionConfig,
    sockets: RwLock<BTreeMap<u64, SocketEntry>>,
    players: RwLock<BTreeMap<PlayerId, Player>>,
    player_sockets: RwLock<BTreeMap<PlayerId, u64>>,
    rooms: RwLock<BTreeMap<RoomId, BTreeSet<u64>>>,
    /// Disconnect instants, for grace-period purges.
    disconnected_at: RwLock<BTreeMap<PlayerId, Instant>>,
    next_socket_id: AtomicU64,
    counters: Counters,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            sockets: RwLock::new(BTreeMap::new()),
            players: RwLock::new(BTreeMap::new()),
            player_sockets: RwLock::new(BTreeMap::new()),
            rooms: RwLock::new(BTreeMap::new()),
            disconnected_at: RwLock::new(BTreeMap::new()),
            next_socket_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Register a fresh socket. Fails with `Capacity` beyond the cap.
    pub async fn register_socket(
        &self,
        addr: SocketAddr,
        sender: mpsc::Sender<Outbound>,
    ) -> Result<u64, ConnectionError> {
        let mut sockets = self.sockets.write().await;
        if sockets.len() >= self.config.max_connections {
            self.counters
                .rejected_capacity
                .fetch_add(1, Ordering::Relaxed);
            let _ = sender.try_send(Outbound::Close(CloseReason::Capacity));
            return Err(ConnectionError::Capacity);
        }

        let socket_id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
        sockets.insert(
            socket_id,
            SocketEntry {
                addr,
                player_id: None,
                room: None,
                authenticated: false,
                connected_at: Instant::now(),
                last_activity: Instant::now(),
                sender,
            },
        );
        self.counters.total_accepted.fetch_add(1, Ordering::Relaxed);
        debug!(socket = socket_id, %addr, "socket registered");
        Ok(socket_id)
    }

    /// Refresh a socket's activity timestamp.
    pub async fn touch(&self, socket_id: u64) {
        let mut sockets = self.sockets.write().await;
        if let Some(entry) = sockets.get_mut(&socket_id) {
            entry.last_activity = Instant::now();
            if let Some(player_id) = entry.player_id.clone() {
                drop(sockets);
                let mut players = self.players.write().await;
                if let Some(player) = players.get_mut(&player_id) {
                    player.touch();
                }
            }
        }
    }

    /// Bind a socket to a player identity. A second live socket for the
    /// same player takes over: the prior socket is closed with REPLACED and
    /// membership transfers.
    pub async fn authenticate(
        &self,
        socket_id: u64,
        player_id: PlayerId,
        username: &str,
    ) -> Result<AuthOutcome, ConnectionError> {
        // Displace any prior socket for this player
        let prior_socket = { self.player_sockets.read().await.get(&player_id).copied() };
        let mut transferred_room = None;
        if let Some(prior) = prior_socket.filter(|p| *p != socket_id) {
            let mut sockets = self.sockets.write().await;
            if let Some(entry) = sockets.remove(&prior) {
                transferred_room = entry.room;
                let _ = entry.sender.try_send(Outbound::Close(CloseReason::Replaced));
            }
            if let Some(room_id) = transferred_room {
                let mut rooms = self.rooms.write().await;
                if let Some(members) = rooms.get_mut(&room_id) {
                    members.remove(&prior);
                    members.insert(socket_id);
                }
            }
        }

        // Resume or create the player record
        let (reconnected, elo, room_id) = {
            let mut players = self.players.write().await;
            let mut grace = self.disconnected_at.write().await;
            match players.get_mut(&player_id) {
                Some(player) => {
                    let within_grace = grace
                        .get(&player_id)
                        .map(|at| at.elapsed() <= self.config.reconnect_grace)
                        .unwrap_or(true);
                    let resumed = if prior_socket.is_some() || within_grace {
                        player.reconnect(socket_id).is_ok()
                    } else {
                        false
                    };
                    if !resumed {
                        // Session lapsed: rebind as a fresh session
                        player.clear_session();
                        player.status = PlayerStatus::Idle;
                        player.bind_socket(socket_id);
                    }
                    grace.remove(&player_id);
                    self.counters.reconnected.fetch_add(resumed as u64, Ordering::Relaxed);
                    (resumed, player.elo, transferred_room)
                }
                None => {
                    let mut player = Player::new(player_id.clone(), username);
                    player.bind_socket(socket_id);
                    players.insert(player_id.clone(), player);
                    (false, crate::game::player::DEFAULT_ELO, None)
                }
            }
        };

        // Bind the socket entry
        {
            let mut sockets = self.sockets.write().await;
            let entry = sockets
                .get_mut(&socket_id)
                .ok_or(ConnectionError::SocketNotFound)?;
            entry.player_id = Some(player_id.clone());
            entry.authenticated = true;
            entry.last_activity = Instant::now();
            if entry.room.is_none() {
                entry.room = room_id;
            }
        }
        self.player_sockets
            .write()
            .await
            .insert(player_id.clone(), socket_id);

        if reconnected {
            info!(player = %player_id, socket = socket_id, "player reconnected");
        } else {
            info!(player = %player_id, socket = socket_id, "player authenticated");
        }

        Ok(AuthOutcome {
            player_id,
            username: username.to_string(),
            elo,
            reconnected,
            room_id,
            replaced_socket: prior_socket.filter(|p| *p != socket_id),
        })
    }

    /// Tear down a socket after its connection closed. The player record
    /// survives for the reconnect grace period.
    pub async fn unbind_socket(&self, socket_id: u64) -> Option<PlayerId> {
        let (player_id, room) = {
            let mut sockets = self.sockets.write().await;
            match sockets.remove(&socket_id) {
                Some(entry) => (entry.player_id, entry.room),
                None => return None,
            }
        };

        if let Some(room_id) = room {
            let mut rooms = self.rooms.write().await;
            if let Some(members) = rooms.get_mut(&room_id) {
                members.remove(&socket_id);
            }
        }

        let player_id = player_id?;
        {
            let current = self.player_sockets.read().await.get(&player_id).copied();
            // A takeover already rebound the player to a newer socket;
            // this teardown must not disturb the resumed session.
            if current != Some(socket_id) {
                return None;
            }
        }
        self.player_sockets.write().await.remove(&player_id);
        {
            let mut players = self.players.write().await;
            if let Some(player) = players.get_mut(&player_id) {
                player.mark_disconnected();
            }
        }
        self.disconnected_at
            .write()
            .await
            .insert(player_id.clone(), Instant::now());
        debug!(player = %player_id, socket = socket_id, "socket unbound");
        Some(player_id)
    }

    /// Join a socket to a room, leaving any previous room first.
    pub async fn join_room(&self, socket_id: u64, room_id: RoomId) -> Result<(), ConnectionError> {
        let previous = {
            let mut sockets = self.sockets.write().await;
            let entry = sockets
                .get_mut(&socket_id)
                .ok_or(ConnectionError::SocketNotFound)?;
            if !entry.authenticated {
                return Err(ConnectionError::NotAuthenticated);
            }
            let previous = entry.room.replace(room_id);
            previous.filter(|p| *p != room_id)
        };

        let mut rooms = self.rooms.write().await;
        if let Some(previous) = previous {
            if let Some(members) = rooms.get_mut(&previous) {
                members.remove(&socket_id);
            }
        }
        rooms.entry(room_id).or_default().insert(socket_id);
        Ok(())
    }

    /// Remove a socket from its room.
    pub async fn leave_room(&self, socket_id: u64) -> Option<RoomId> {
        let room = {
            let mut sockets = self.sockets.write().await;
            sockets.get_mut(&socket_id)?.room.take()
        };
        let room_id = room?;
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&room_id) {
            members.remove(&socket_id);
        }
        Some(room_id)
    }

    /// Sockets currently joined to a room.
    pub async fn sockets_in_room(&self, room_id: &RoomId) -> Vec<u64> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop a room's membership set.
    pub async fn clear_room(&self, room_id: &RoomId) {
        let members = self.rooms.write().await.remove(room_id);
        if let Some(members) = members {
            let mut sockets = self.sockets.write().await;
            for socket_id in members {
                if let Some(entry) = sockets.get_mut(&socket_id) {
                    entry.room = None;
                }
            }
        }
    }

    /// Fan a message out to every socket in a room, optionally skipping the
    /// origin socket (input echoes).
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        message: &ServerMessage,
        exclude_socket: Option<u64>,
    ) -> usize {
        let members = self.sockets_in_room(room_id).await;
        let sockets = self.sockets.read().await;
        let mut delivered = 0;
        for socket_id in members {
            if Some(socket_id) == exclude_socket {
                continue;
            }
            if let Some(entry) = sockets.get(&socket_id) {
                if entry
                    .sender
                    .try_send(Outbound::Message(message.clone()))
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send to a single player's live socket.
    pub async fn send_to_player(&self, player_id: &PlayerId, message: &ServerMessage) -> bool {
        let socket_id = { self.player_sockets.read().await.get(player_id).copied() };
        match socket_id {
            Some(socket_id) => self.send_to_socket(socket_id, message).await,
            None => false,
        }
    }

    /// Send to a specific socket.
    pub async fn send_to_socket(&self, socket_id: u64, message: &ServerMessage) -> bool {
        let sockets = self.sockets.read().await;
        match sockets.get(&socket_id) {
            Some(entry) => entry
                .sender
                .try_send(Outbound::Message(message.clone()))
                .is_ok(),
            None => false,
        }
    }

    /// Fan a message out to every authenticated socket.
    pub async fn broadcast_to_all(&self, message: &ServerMessage) -> usize {
        let sockets = self.sockets.read().await;
        let mut delivered = 0;
        for entry in sockets.values() {
            if entry.authenticated
                && entry
                    .sender
                    .try_send(Outbound::Message(message.clone()))
                    .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Heartbeat sweep: ping idle sockets, close dead ones. Run every
    /// heartbeat interval.
    pub async fn heartbeat_sweep(&self) -> SweepOutcome {
        let now = Instant::now();
        let ping_after = self.config.heartbeat_interval;
        let close_after = self.config.connection_timeout;
        let mut outcome = SweepOutcome::default();

        let stale: Vec<u64> = {
            let sockets = self.sockets.read().await;
            for (id, entry) in sockets.iter() {
                let idle = now.duration_since(entry.last_activity);
                if idle >= close_after {
                    outcome.closed.push((*id, entry.player_id.clone()));
                } else if idle >= ping_after {
                    let _ = entry.sender.try_send(Outbound::Ping);
                    outcome.pinged.push(*id);
                }
            }
            outcome.closed.iter().map(|(id, _)| *id).collect()
        };

        for socket_id in stale {
            {
                let sockets = self.sockets.read().await;
                if let Some(entry) = sockets.get(&socket_id) {
                    let _ = entry.sender.try_send(Outbound::Close(CloseReason::Timeout));
                }
            }
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(socket = socket_id, "socket timed out");
            self.unbind_socket(socket_id).await;
        }
        outcome
    }

    /// Drop player records whose reconnect grace elapsed. Returns the
    /// purged ids so the caller can end their rooms.
    pub async fn purge_expired_grace(&self) -> Vec<PlayerId> {
        let grace = self.config.reconnect_grace;
        let now = Instant::now();
        let expired: Vec<PlayerId> = {
            let disconnected = self.disconnected_at.read().await;
            disconnected
                .iter()
                .filter(|(_, at)| now.duration_since(**at) > grace)
                .map(|(id, _)| id.clone())
                .collect()
        };

        if !expired.is_empty() {
            let mut players = self.players.write().await;
            let mut disconnected = self.disconnected_at.write().await;
            for id in &expired {
                players.remove(id);
                disconnected.remove(id);
                debug!(player = %id, "grace period expired, record purged");
            }
        }
        expired
    }

    /// Read a copy of a player record.
    pub async fn get_player(&self, player_id: &PlayerId) -> Option<Player> {
        self.players.read().await.get(player_id).cloned()
    }

    /// Apply a mutation to a player record under the write lock.
    pub async fn with_player<R>(
        &self,
        player_id: &PlayerId,
        f: impl FnOnce(&mut Player) -> R,
    ) -> Result<R, ConnectionError> {
        let mut players = self.players.write().await;
        let player = players
            .get_mut(player_id)
            .ok_or(ConnectionError::PlayerNotFound)?;
        Ok(f(player))
    }

    pub async fn player_for_socket(&self, socket_id: u64) -> Option<PlayerId> {
        self.sockets
            .read()
            .await
            .get(&socket_id)
            .and_then(|e| e.player_id.clone())
    }

    pub async fn room_for_socket(&self, socket_id: u64) -> Option<RoomId> {
        self.sockets.read().await.get(&socket_id).and_then(|e| e.room)
    }

    pub async fn socket_for_player(&self, player_id: &PlayerId) -> Option<u64> {
        self.player_sockets.read().await.get(player_id).copied()
    }

    pub async fn connection_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Counter snapshot.
    pub async fn snapshot_stats(&self) -> ConnectionStats {
        ConnectionStats {
            current: self.sockets.read().await.len(),
            total_accepted: self.counters.total_accepted.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            reconnected: self.counters.reconnected.load(Ordering::Relaxed),
            rejected_capacity: self.counters.rejected_capacity.load(Ordering::Relaxed),
        }
    }

    /// Queue a close for one socket and unbind it.
    pub async fn close_socket(&self, socket_id: u64, reason: CloseReason) -> Option<PlayerId> {
        {
            let sockets = self.sockets.read().await;
            if let Some(entry) = sockets.get(&socket_id) {
                let _ = entry.sender.try_send(Outbound::Close(reason));
            }
        }
        self.unbind_socket(socket_id).await
    }

    /// Broadcast shutdown and close every socket.
    pub async fn shutdown_all(&self, reason: &str) {
        let message = ServerMessage::ServerShutdown(crate::network::protocol::ShutdownInfo {
            reason: reason.to_string(),
        });
        let sockets = self.sockets.read().await;
        for entry in sockets.values() {
            let _ = entry.sender.try_send(Outbound::Message(message.clone()));
            let _ = entry.sender.try_send(Outbound::Close(CloseReason::Shutdown));
        }
    }
}
