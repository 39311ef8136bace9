//! WebSocket Game Server
//!
//! The accept loop, per-socket tasks, and the router that turns released
//! pipeline events into game actions and broadcasts. One task per socket,
//! one ticker per active room, one matchmaking pass loop, one heartbeat
//! sweep, one pipeline worker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::events::pipeline::{EventPipeline, PipelineConfig, SubmitError};
use crate::events::registry::EventRegistry;
use crate::events::{EventEnvelope, EventKind, EventPayload, Origin, Target};
use crate::game::end::{GameEndConfig, GameEndProcessor};
use crate::game::player::{PlayerId, PlayerStatus, Side};
use crate::game::room::{
    EndReason, GameMode, RoomConfig, RoomEventKind, RoomId, RoomManager, RoomState,
};
use crate::matchmaking::lobby::{ConfirmOutcome, LobbyConfig, LobbyManager, RewindOutcome};
use crate::matchmaking::queue::{Matchmaker, MatchmakerConfig, QueueEntry, QueueError};
use crate::network::auth::{authorize, AuthConfig, AuthError};
use crate::network::connection::{
    CloseReason, ConnectionConfig, ConnectionError, ConnectionManager, Outbound,
};
use crate::network::protocol::{
    AuthenticatedInfo, ChatBroadcast, ClientMessage, ConnectedInfo, ErrorCode, ErrorInfo,
    GamePausedInfo, GameStartedInfo, GoalScoredInfo, MatchCreatedInfo, MatchPlayerInfo,
    MatchmakingJoinedInfo, MovementClaim, PlayerMovedInfo, PositionCorrectionInfo, PongInfo,
    RateLimitInfo, ReadyStateInfo, ReconnectedInfo, RoomRef, ServerMessage, ValidationErrorInfo,
};
use crate::persist::SessionStore;
use crate::validate::anti_cheat::{
    AntiCheatConfig, AntiCheatValidator, ResultSubmission, SubmissionVerdict,
};
use crate::validate::movement::{
    validate_goal, validate_movement, GoalVerdict, MovementConfig, MovementVerdict,
};
use crate::{now_ms, VERSION};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Server version string.
    pub version: String,
    pub auth: AuthConfig,
    pub connection: ConnectionConfig,
    pub matchmaker: MatchmakerConfig,
    pub lobby: LobbyConfig,
    pub room: RoomConfig,
    pub pipeline: PipelineConfig,
    pub movement: MovementConfig,
    pub anti_cheat: AntiCheatConfig,
    pub game_end: GameEndConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            version: VERSION.to_string(),
            auth: AuthConfig::default(),
            connection: ConnectionConfig::default(),
            matchmaker: MatchmakerConfig::default(),
            lobby: LobbyConfig::default(),
            room: RoomConfig::default(),
            pipeline: PipelineConfig::default(),
            movement: MovementConfig::default(),
            anti_cheat: AntiCheatConfig::default(),
            game_end: GameEndConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read overrides from the environment.
    pub fn from_env() -> Self {
        let mut config = Self {
            auth: AuthConfig::from_env(),
            ..Default::default()
        };
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            if let Ok(addr) = addr.parse() {
                config.bind_addr = addr;
            }
        }
        if let Ok(max) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                config.connection.max_connections = max;
            }
        }
        config
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Event pipeline could not be initialized.
    #[error("pipeline initialization failed")]
    PipelineInit,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    pub connections: Arc<ConnectionManager>,
    pub rooms: Arc<RoomManager>,
    pub matchmaker: Arc<Matchmaker>,
    pub lobby: Arc<LobbyManager>,
    pub pipeline: Arc<EventPipeline>,
    pub anti_cheat: Arc<AntiCheatValidator>,
    pub end_processor: Arc<GameEndProcessor>,
    /// Router intake, taken once by `run`.
    router_rx: Mutex<Option<mpsc::Receiver<EventEnvelope>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Build the server and its component graph.
    pub fn new(config: ServerConfig, store: SessionStore) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let connections = Arc::new(ConnectionManager::new(config.connection.clone()));
        let rooms = Arc::new(RoomManager::new());
        let matchmaker = Arc::new(Matchmaker::new(config.matchmaker.clone()));
        let lobby = Arc::new(LobbyManager::new(config.lobby.clone()));
        let (pipeline, router_rx) =
            EventPipeline::spawn(EventRegistry::standard(), config.pipeline.clone());
        let anti_cheat = Arc::new(AntiCheatValidator::new(config.anti_cheat.clone()));
        let end_processor = Arc::new(GameEndProcessor::new(
            rooms.clone(),
            connections.clone(),
            pipeline.clone(),
            store,
            config.game_end.clone(),
        ));

        Arc::new(Self {
            config,
            connections,
            rooms,
            matchmaker,
            lobby,
            pipeline,
            anti_cheat,
            end_processor,
            router_rx: Mutex::new(Some(router_rx)),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    #[instrument(skip(self))]
    pub async fn run(self: &Arc<Self>) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("headball server v{} listening on {}", VERSION, self.config.bind_addr);

        let router_rx = self
            .router_rx
            .lock()
            .await
            .take()
            .ok_or(GameServerError::PipelineInit)?;

        let router = self.clone();
        let router_handle = tokio::spawn(async move {
            router.run_router(router_rx).await;
        });

        let matchmaking = self.clone();
        let matchmaking_handle = tokio::spawn(async move {
            matchmaking.run_matchmaking_loop().await;
        });

        let heartbeat = self.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.run_heartbeat_loop().await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.clone().handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        self.connections.shutdown_all("server shutting down").await;
        router_handle.abort();
        matchmaking_handle.abort();
        heartbeat_handle.abort();
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    // =========================================================================
    // SOCKET LIFECYCLE
    // =========================================================================

    fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(64);

            let socket_id = match self.connections.register_socket(addr, out_tx.clone()).await {
                Ok(id) => id,
                Err(_) => {
                    // Over capacity: say goodbye and drop the stream
                    let _ = ws_sender.close().await;
                    return;
                }
            };

            // Writer task: frames outbound messages, handles pings and closes
            let writer = tokio::spawn(async move {
                while let Some(out) = out_rx.recv().await {
                    match out {
                        Outbound::Message(msg) => {
                            let text = match msg.to_frame_json() {
                                Ok(t) => t,
                                Err(e) => {
                                    error!("failed to serialize frame: {}", e);
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Outbound::Ping => {
                            if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        Outbound::Close(reason) => {
                            let _ = ws_sender
                                .send(Message::Text(
                                    ServerMessage::ServerShutdown(
                                        crate::network::protocol::ShutdownInfo {
                                            reason: reason.as_str().to_string(),
                                        },
                                    )
                                    .to_frame_json()
                                    .unwrap_or_default(),
                                ))
                                .await;
                            let _ = ws_sender.close().await;
                            break;
                        }
                    }
                }
            });

            self.connections
                .send_to_socket(
                    socket_id,
                    &ServerMessage::Connected(ConnectedInfo {
                        server_version: self.config.version.clone(),
                    }),
                )
                .await;

            // Reader loop
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.connections.touch(socket_id).await;
                                match ClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        self.handle_client_message(socket_id, client_msg).await;
                                    }
                                    Err(e) => {
                                        debug!("invalid message from {}: {}", addr, e);
                                        self.connections.send_to_socket(
                                            socket_id,
                                            &ServerMessage::ValidationError(ValidationErrorInfo {
                                                event: "unknown".to_string(),
                                                errors: vec![crate::network::protocol::FieldError {
                                                    field: "$".to_string(),
                                                    reason: "invalid message format".to_string(),
                                                }],
                                            }),
                                        ).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Pong(_))) => {
                                self.connections.touch(socket_id).await;
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                self.connections.touch(socket_id).await;
                                let _ = out_tx.send(Outbound::Ping).await;
                                let _ = payload;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("socket {} closed", socket_id);
                                break;
                            }
                            Some(Err(e)) => {
                                debug!("websocket error on {}: {}", socket_id, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = out_tx.send(Outbound::Close(CloseReason::Shutdown)).await;
                        break;
                    }
                }
            }

            // Teardown: player record stays for the grace period
            if let Some(player_id) = self.connections.unbind_socket(socket_id).await {
                self.handle_player_disconnected(&player_id).await;
            }
            writer.abort();
            debug!("socket {} cleaned up", socket_id);
        });
    }

    /// React to a player's socket loss: purge queue presence, rewind any
    /// pending pairing, pause a live game.
    async fn handle_player_disconnected(&self, player_id: &PlayerId) {
        self.matchmaker.set_connected(player_id, false).await;

        if let Some(room_id) = self.lobby.pending_for(player_id).await {
            if let Some(rewind) = self.lobby.remove(&room_id).await {
                self.apply_rewind(rewind).await;
            }
            self.dispose_room(&room_id).await;
        }

        if let Some(room) = self.rooms.room_for_player(player_id).await {
            let (room_id, pause_timeout, should_pause) = {
                let mut room = room.write().await;
                let _ = room.mark_disconnected(player_id);
                let should_pause = room.state == RoomState::Playing;
                if should_pause {
                    let _ = room.pause(player_id);
                }
                (room.id, room.config.pause_timeout, should_pause)
            };
            if should_pause {
                info!(room = %room_id, player = %player_id, "game paused on disconnect");
                self.connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::GamePaused(GamePausedInfo {
                            waiting_for: player_id.clone(),
                            timeout_secs: pause_timeout.as_secs(),
                        }),
                        None,
                    )
                    .await;
            }
        }
    }

    // =========================================================================
    // INBOUND DISPATCH
    // =========================================================================

    /// First hop for every parsed client message: authentication and room
    /// membership are handled directly, everything else goes through the
    /// pipeline.
    async fn handle_client_message(self: &Arc<Self>, socket_id: u64, msg: ClientMessage) {
        match msg {
            ClientMessage::Authenticate(auth) => {
                self.handle_authenticate(socket_id, auth).await;
            }
            ClientMessage::JoinRoom(room_ref) => {
                self.handle_join_room(socket_id, room_ref.room_id).await;
            }
            ClientMessage::LeaveRoom(_) => {
                if let Some(room_id) = self.connections.leave_room(socket_id).await {
                    self.connections
                        .send_to_socket(socket_id, &ServerMessage::RoomLeft(RoomRef { room_id }))
                        .await;
                }
            }
            other => {
                let player_id = match self.connections.player_for_socket(socket_id).await {
                    Some(id) => id,
                    None => {
                        self.connections
                            .send_to_socket(
                                socket_id,
                                &ServerMessage::AuthError(ErrorInfo::new(
                                    ErrorCode::NotAuthenticated,
                                    "authenticate first",
                                )),
                            )
                            .await;
                        return;
                    }
                };

                let target = match self.connections.room_for_socket(socket_id).await {
                    Some(room_id) => Target::Room(room_id),
                    None => Target::Player(player_id.clone()),
                };
                let client_ts = match &other {
                    ClientMessage::PlayerMovement(claim) => Some(claim.timestamp),
                    ClientMessage::BallUpdate(claim) => Some(claim.timestamp),
                    ClientMessage::Ping(ping) => Some(ping.client_time),
                    _ => None,
                };
                let event_name = other.event_name();

                if let Err(err) = self
                    .pipeline
                    .submit_inbound(player_id, socket_id, other, target.clone(), client_ts)
                    .await
                {
                    self.report_submit_error(socket_id, event_name, target, err)
                        .await;
                }
            }
        }
    }

    async fn report_submit_error(
        self: &Arc<Self>,
        socket_id: u64,
        event: &str,
        target: Target,
        err: SubmitError,
    ) {
        match err {
            SubmitError::Validation(errors) => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::ValidationError(ValidationErrorInfo {
                            event: event.to_string(),
                            errors,
                        }),
                    )
                    .await;
            }
            SubmitError::RateLimited { retry_after_ms } => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::RateLimitExceeded(RateLimitInfo {
                            event: event.to_string(),
                            retry_after_ms,
                        }),
                    )
                    .await;
            }
            SubmitError::Dropped { priority } => {
                // The pipeline already queued a backpressure notice for
                // the flooded target
                debug!(%event, priority = priority.name(), "inbound event shed");
            }
            SubmitError::CriticalOverflow => {
                // The room cannot publish terminal events: force-end it
                if let Target::Room(room_id) = target {
                    warn!(room = %room_id, "critical overflow, forcing game end");
                    if let Some(room) = self.rooms.get_room(&room_id).await {
                        room.write().await.unhealthy = true;
                    }
                    self.end_processor
                        .handle_game_end(room_id, EndReason::Forced, None)
                        .await;
                }
            }
            SubmitError::UnknownEvent => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::InternalError(ErrorInfo::new(
                            ErrorCode::InvalidInput,
                            "unhandled event type",
                        )),
                    )
                    .await;
            }
        }
    }

    async fn handle_authenticate(
        self: &Arc<Self>,
        socket_id: u64,
        auth: crate::network::protocol::AuthRequest,
    ) {
        if let Err(err) = authorize(&auth, &self.config.auth) {
            let code = match err {
                AuthError::Expired => ErrorCode::TokenExpired,
                AuthError::MissingToken => ErrorCode::AuthFailed,
                _ => ErrorCode::InvalidToken,
            };
            self.connections
                .send_to_socket(
                    socket_id,
                    &ServerMessage::AuthError(ErrorInfo::new(code, err.to_string())),
                )
                .await;
            // Auth failures terminate the socket
            self.connections
                .close_socket(socket_id, CloseReason::AuthFailed)
                .await;
            return;
        }

        let player_id = PlayerId::new(auth.player_id.clone());
        match self
            .connections
            .authenticate(socket_id, player_id.clone(), &auth.username)
            .await
        {
            Ok(outcome) => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::Authenticated(AuthenticatedInfo {
                            player_id: outcome.player_id.clone(),
                            username: outcome.username.clone(),
                            elo: outcome.elo,
                            reconnected: outcome.reconnected,
                        }),
                    )
                    .await;

                if outcome.reconnected {
                    self.resume_session(socket_id, &player_id).await;
                }
            }
            Err(ConnectionError::SocketNotFound) => {
                debug!(socket = socket_id, "socket vanished during auth");
            }
            Err(err) => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::AuthError(ErrorInfo::new(
                            ErrorCode::InternalError,
                            err.to_string(),
                        )),
                    )
                    .await;
            }
        }
    }

    /// Rejoin a reconnected player to their session: queue presence is
    /// revived, a paused room resumes.
    async fn resume_session(self: &Arc<Self>, socket_id: u64, player_id: &PlayerId) {
        self.matchmaker.set_connected(player_id, true).await;

        let room = match self.rooms.room_for_player(player_id).await {
            Some(room) => room,
            None => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::Reconnected(ReconnectedInfo {
                            player_id: player_id.clone(),
                            room_id: None,
                        }),
                    )
                    .await;
                return;
            }
        };

        let (room_id, resumed) = {
            let mut room = room.write().await;
            let _ = room.reconnect_player(player_id);
            let resumed = if room.state == RoomState::Paused {
                room.resume().is_ok()
            } else {
                false
            };
            (room.id, resumed)
        };

        let _ = self.connections.join_room(socket_id, room_id).await;
        self.connections
            .send_to_socket(
                socket_id,
                &ServerMessage::Reconnected(ReconnectedInfo {
                    player_id: player_id.clone(),
                    room_id: Some(room_id),
                }),
            )
            .await;
        if resumed {
            info!(room = %room_id, player = %player_id, "game resumed after reconnect");
            self.connections
                .broadcast_to_room(&room_id, &ServerMessage::GameResumed, None)
                .await;
        }
    }

    async fn handle_join_room(self: &Arc<Self>, socket_id: u64, room_id: RoomId) {
        if self.rooms.get_room(&room_id).await.is_none() {
            self.connections
                .send_to_socket(
                    socket_id,
                    &ServerMessage::JoinRoomError(ErrorInfo::new(
                        ErrorCode::RoomNotFound,
                        "no such room",
                    )),
                )
                .await;
            return;
        }
        match self.connections.join_room(socket_id, room_id).await {
            Ok(()) => {
                self.connections
                    .send_to_socket(socket_id, &ServerMessage::RoomJoined(RoomRef { room_id }))
                    .await;
            }
            Err(err) => {
                let code = match err {
                    ConnectionError::NotAuthenticated => ErrorCode::NotAuthenticated,
                    _ => ErrorCode::InternalError,
                };
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::JoinRoomError(ErrorInfo::new(code, err.to_string())),
                    )
                    .await;
            }
        }
    }

    // =========================================================================
    // ROUTER
    // =========================================================================

    /// Consume released envelopes in pipeline order.
    async fn run_router(self: Arc<Self>, mut rx: mpsc::Receiver<EventEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope.payload {
                EventPayload::Inbound { socket_id, message } => {
                    let origin = match &envelope.origin {
                        Origin::Player(id) => id.clone(),
                        Origin::System => continue,
                    };
                    self.route_inbound(origin, socket_id, message, envelope.target)
                        .await;
                }
                EventPayload::Outbound {
                    message,
                    exclude_socket,
                } => {
                    self.fan_out(&envelope.target, &message, exclude_socket).await;
                }
            }
        }
    }

    async fn fan_out(&self, target: &Target, message: &ServerMessage, exclude: Option<u64>) {
        match target {
            Target::Room(room_id) => {
                self.connections
                    .broadcast_to_room(room_id, message, exclude)
                    .await;
            }
            Target::Player(player_id) => {
                self.connections.send_to_player(player_id, message).await;
            }
            Target::All => {
                self.connections.broadcast_to_all(message).await;
            }
        }
    }

    async fn route_inbound(
        self: &Arc<Self>,
        origin: PlayerId,
        socket_id: u64,
        message: ClientMessage,
        target: Target,
    ) {
        match message {
            ClientMessage::Ping(ping) => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::Pong(PongInfo {
                            server_time: now_ms(),
                            client_time: ping.client_time,
                        }),
                    )
                    .await;
                // Feed the latency estimate into the player's room
                if let (Some(latency), Target::Room(room_id)) = (
                    self.pipeline.latency_estimate(&origin).await,
                    &target,
                ) {
                    if let Some(room) = self.rooms.get_room(room_id).await {
                        room.write().await.record_latency(&origin, latency);
                    }
                }
            }
            ClientMessage::JoinMatchmaking(req) => {
                self.handle_join_matchmaking(origin, socket_id, req).await;
            }
            ClientMessage::LeaveMatchmaking => {
                match self.matchmaker.dequeue(&origin).await {
                    Ok(_) => {
                        let _ = self
                            .connections
                            .with_player(&origin, |p| {
                                let _ = p.transition(PlayerStatus::Idle);
                            })
                            .await;
                        self.connections
                            .send_to_socket(socket_id, &ServerMessage::MatchmakingLeft)
                            .await;
                    }
                    Err(err) => {
                        self.connections
                            .send_to_socket(
                                socket_id,
                                &ServerMessage::MatchmakingError(ErrorInfo::new(
                                    ErrorCode::InvalidInput,
                                    err.to_string(),
                                )),
                            )
                            .await;
                    }
                }
            }
            ClientMessage::ReadyUp(ready) => {
                self.handle_ready_up(origin, ready.ready).await;
            }
            ClientMessage::ChatMessage(chat) => {
                if let Target::Room(room_id) = target {
                    let username = self
                        .connections
                        .get_player(&origin)
                        .await
                        .map(|p| p.display_name)
                        .unwrap_or_else(|| origin.to_string());
                    self.connections
                        .broadcast_to_room(
                            &room_id,
                            &ServerMessage::ChatMessage(ChatBroadcast {
                                player_id: origin,
                                username,
                                message: chat.message,
                                scope: chat.scope,
                            }),
                            None,
                        )
                        .await;
                }
            }
            ClientMessage::PlayerMovement(claim) => {
                if let Target::Room(room_id) = target {
                    self.handle_movement(origin, socket_id, room_id, claim).await;
                }
            }
            ClientMessage::BallUpdate(claim) => {
                // The server's ball is authoritative; implausible claims are
                // just dropped, plausible ones are ignored in favor of the
                // next snapshot.
                if !crate::validate::movement::validate_ball_speed(
                    &claim.velocity,
                    &self.config.movement,
                ) {
                    debug!(player = %origin, "implausible ball claim dropped");
                }
            }
            ClientMessage::GoalAttempt(_) => {
                if let Target::Room(room_id) = target {
                    self.handle_goal_attempt(origin, socket_id, room_id).await;
                }
            }
            ClientMessage::ForfeitGame => {
                if let Target::Room(room_id) = target {
                    let side = match self.rooms.get_room(&room_id).await {
                        Some(room) => room.read().await.side_of(&origin),
                        None => None,
                    };
                    self.end_processor
                        .handle_game_end(room_id, EndReason::Forfeit, side)
                        .await;
                }
            }
            ClientMessage::RequestGameEnd(req) => {
                if let Target::Room(room_id) = target {
                    if req.confirmed.unwrap_or(false) {
                        self.end_processor
                            .handle_game_end(room_id, EndReason::MutualAgreement, None)
                            .await;
                    } else {
                        self.connections
                            .send_to_socket(
                                socket_id,
                                &ServerMessage::GameEndRejected(
                                    crate::network::protocol::GameEndRejectedInfo {
                                        flags: Vec::new(),
                                        suspicion_level: 0,
                                        message: "confirmation required".to_string(),
                                    },
                                ),
                            )
                            .await;
                    }
                }
            }
            ClientMessage::PauseRequest => {
                if let Target::Room(room_id) = target {
                    if let Some(room) = self.rooms.get_room(&room_id).await {
                        let paused = {
                            let mut room = room.write().await;
                            room.pause(&origin).is_ok()
                        };
                        if paused {
                            self.connections
                                .broadcast_to_room(
                                    &room_id,
                                    &ServerMessage::GamePaused(GamePausedInfo {
                                        waiting_for: origin,
                                        timeout_secs: self.config.room.pause_timeout.as_secs(),
                                    }),
                                    None,
                                )
                                .await;
                        }
                    }
                }
            }
            ClientMessage::ResumeRequest => {
                if let Target::Room(room_id) = target {
                    if let Some(room) = self.rooms.get_room(&room_id).await {
                        let resumed = { room.write().await.resume().is_ok() };
                        if resumed {
                            self.connections
                                .broadcast_to_room(&room_id, &ServerMessage::GameResumed, None)
                                .await;
                        }
                    }
                }
            }
            ClientMessage::Authenticate(_)
            | ClientMessage::JoinRoom(_)
            | ClientMessage::LeaveRoom(_) => {
                // Handled before the pipeline
            }
        }
    }

    async fn handle_join_matchmaking(
        self: &Arc<Self>,
        origin: PlayerId,
        socket_id: u64,
        req: crate::network::protocol::MatchmakingRequest,
    ) {
        let player = match self.connections.get_player(&origin).await {
            Some(p) => p,
            None => return,
        };
        if player.status != PlayerStatus::Idle {
            self.connections
                .send_to_socket(
                    socket_id,
                    &ServerMessage::MatchmakingError(ErrorInfo::new(
                        ErrorCode::AlreadyQueued,
                        "already in a queue or room",
                    )),
                )
                .await;
            return;
        }

        let entry = QueueEntry::new(
            origin.clone(),
            player.display_name.clone(),
            player.elo,
            req.game_mode,
            req.region,
        );
        match self.matchmaker.enqueue(entry).await {
            Ok(position) => {
                let _ = self
                    .connections
                    .with_player(&origin, |p| {
                        let _ = p.transition(PlayerStatus::InQueue);
                    })
                    .await;
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::MatchmakingJoined(MatchmakingJoinedInfo {
                            position,
                            game_mode: req.game_mode,
                        }),
                    )
                    .await;
                // Pair eagerly instead of waiting for the next pass
                self.run_matchmaking_pass().await;
            }
            Err(err) => {
                let code = match err {
                    QueueError::QueueFull => ErrorCode::QueueFull,
                    QueueError::AlreadyQueued => ErrorCode::AlreadyQueued,
                    _ => ErrorCode::InvalidInput,
                };
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::MatchmakingError(ErrorInfo::new(code, err.to_string())),
                    )
                    .await;
            }
        }
    }

    async fn handle_ready_up(self: &Arc<Self>, origin: PlayerId, ready: bool) {
        match self.lobby.confirm(&origin, ready).await {
            ConfirmOutcome::Waiting { room_id } => {
                if let Some(room) = self.rooms.get_room(&room_id).await {
                    let _ = room.write().await.set_ready(&origin, ready);
                }
                self.connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::ReadyStateChanged(ReadyStateInfo {
                            player_id: origin,
                            ready,
                        }),
                        None,
                    )
                    .await;
            }
            ConfirmOutcome::AllConfirmed { room_id } => {
                if let Some(room) = self.rooms.get_room(&room_id).await {
                    let started = {
                        let mut room = room.write().await;
                        let _ = room.set_ready(&origin, true);
                        room.start_game().is_ok()
                    };
                    if started {
                        let (mode, score_limit, time_limit, player_ids) = {
                            let room = room.read().await;
                            (
                                room.mode,
                                room.mode.score_limit(),
                                room.mode.time_limit_secs(),
                                room.players().map(|p| p.player_id.clone()).collect::<Vec<_>>(),
                            )
                        };
                        for player_id in player_ids {
                            let _ = self
                                .connections
                                .with_player(&player_id, |p| {
                                    let _ = p.transition(PlayerStatus::InGame);
                                })
                                .await;
                        }
                        info!(room = %room_id, %mode, "game started");
                        self.connections
                            .broadcast_to_room(
                                &room_id,
                                &ServerMessage::GameStarted(GameStartedInfo {
                                    room_id,
                                    mode,
                                    score_limit,
                                    time_limit_secs: time_limit,
                                }),
                                None,
                            )
                            .await;
                        self.clone().spawn_room_loop(room_id);
                    }
                }
            }
            ConfirmOutcome::Rewound(rewind) => {
                let room_id = rewind.room_id;
                self.apply_rewind(rewind).await;
                self.dispose_room(&room_id).await;
            }
            ConfirmOutcome::NotPending => {
                // Mid-game ready toggles are meaningless; ignore
            }
        }
    }

    /// Undo a pairing: confirmed players rejoin the queue head, the rest
    /// are withdrawn.
    async fn apply_rewind(&self, rewind: RewindOutcome) {
        for entry in rewind.requeue {
            let player_id = entry.player_id.clone();
            let mode = entry.mode;
            let _ = self
                .connections
                .with_player(&player_id, |p| {
                    p.clear_session();
                    let _ = p.transition(PlayerStatus::Idle);
                    let _ = p.transition(PlayerStatus::InQueue);
                })
                .await;
            if self.matchmaker.enqueue_front(entry).await.is_ok() {
                self.connections
                    .send_to_player(
                        &player_id,
                        &ServerMessage::MatchmakingJoined(MatchmakingJoinedInfo {
                            position: 0,
                            game_mode: mode,
                        }),
                    )
                    .await;
            }
        }
        for player_id in rewind.withdrawn {
            let _ = self
                .connections
                .with_player(&player_id, |p| {
                    let _ = p.transition(PlayerStatus::Idle);
                    p.clear_session();
                })
                .await;
            self.connections
                .send_to_player(&player_id, &ServerMessage::QueueTimeout)
                .await;
        }
    }

    async fn dispose_room(&self, room_id: &RoomId) {
        if let Some(room) = self.rooms.get_room(room_id).await {
            let player_ids: Vec<PlayerId> = {
                let room = room.read().await;
                room.players().map(|p| p.player_id.clone()).collect()
            };
            for player_id in player_ids {
                self.rooms.unregister_player(&player_id).await;
            }
        }
        self.rooms.remove_room(room_id).await;
        self.connections.clear_room(room_id).await;
    }

    async fn handle_movement(
        self: &Arc<Self>,
        origin: PlayerId,
        socket_id: u64,
        room_id: RoomId,
        claim: MovementClaim,
    ) {
        let room = match self.rooms.get_room(&room_id).await {
            Some(room) => room,
            None => return,
        };

        let verdict = {
            let mut room = room.write().await;
            let side = match room.side_of(&origin) {
                Some(side) => side,
                None => return,
            };
            // Stale or duplicate sequence ids are a silent no-op
            match room.process_input(&origin, claim.keys, claim.sequence_id) {
                Ok(true) => {}
                Ok(false) => return,
                Err(_) => return,
            }
            let latency = room.player(&origin).map(|p| p.latency_ms).unwrap_or(0);
            let elapsed = crate::SNAPSHOT_DIVISOR; // claims arrive at most a few ticks apart
            let verdict = validate_movement(
                &claim,
                room.world.body(side),
                latency,
                elapsed,
                &self.config.movement,
            );
            if let MovementVerdict::Accepted {
                position, velocity, ..
            } = &verdict
            {
                let _ = room.apply_claim(&origin, *position, *velocity);
            }
            verdict
        };

        match verdict {
            MovementVerdict::Accepted {
                position,
                velocity,
                compensation_ms,
            } => {
                // Echo to the rest of the room, origin excluded
                self.connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::PlayerMoved(PlayerMovedInfo {
                            player_id: origin,
                            position,
                            velocity,
                            lag_compensation_ms: (compensation_ms > 0)
                                .then_some(compensation_ms),
                        }),
                        Some(socket_id),
                    )
                    .await;
            }
            MovementVerdict::Rejected {
                reason,
                corrected_position,
                corrected_velocity,
            } => {
                self.connections
                    .send_to_socket(
                        socket_id,
                        &ServerMessage::PositionCorrection(PositionCorrectionInfo {
                            position: corrected_position,
                            velocity: corrected_velocity,
                            reason: reason.as_str().to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    async fn handle_goal_attempt(
        self: &Arc<Self>,
        origin: PlayerId,
        socket_id: u64,
        room_id: RoomId,
    ) {
        let room = match self.rooms.get_room(&room_id).await {
            Some(room) => room,
            None => return,
        };
        let verdict = {
            let room = room.read().await;
            match room.side_of(&origin) {
                Some(side) => validate_goal(&room.world, side),
                None => return,
            }
        };
        // Valid claims need no reply: the authoritative tick counts the
        // goal itself. Implausible ones get a structured rejection.
        if let GoalVerdict::Rejected(reason) = verdict {
            self.connections
                .send_to_socket(
                    socket_id,
                    &ServerMessage::ValidationError(ValidationErrorInfo {
                        event: "goal_attempt".to_string(),
                        errors: vec![crate::network::protocol::FieldError {
                            field: "position".to_string(),
                            reason: reason.as_str().to_string(),
                        }],
                    }),
                )
                .await;
        }
    }

    // =========================================================================
    // BACKGROUND LOOPS
    // =========================================================================

    /// Periodic matchmaking pass plus ready-up expiry.
    async fn run_matchmaking_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.matchmaker.pass_interval);
        loop {
            ticker.tick().await;
            self.run_matchmaking_pass().await;

            for rewind in self.lobby.expire().await {
                let room_id = rewind.room_id;
                self.apply_rewind(rewind).await;
                self.dispose_room(&room_id).await;
            }
        }
    }

    /// One pairing pass: form rooms, open ready-up windows, expire waits.
    pub async fn run_matchmaking_pass(self: &Arc<Self>) {
        let active_rooms = self.rooms.room_count().await;
        let outcome = self.matchmaker.pass(active_rooms).await;

        for pair in outcome.pairs {
            let room_id = self
                .rooms
                .create_room(pair.mode, self.config.room.clone())
                .await;
            let room = match self.rooms.get_room(&room_id).await {
                Some(room) => room,
                None => continue,
            };

            let mut players_info = Vec::with_capacity(2);
            {
                let mut room = room.write().await;
                for entry in [&pair.first, &pair.second] {
                    match room.add_player(
                        entry.player_id.clone(),
                        entry.display_name.clone(),
                        entry.elo,
                    ) {
                        Ok(side) => {
                            players_info.push(MatchPlayerInfo {
                                player_id: entry.player_id.clone(),
                                username: entry.display_name.clone(),
                                side,
                                elo: entry.elo,
                            });
                        }
                        Err(err) => {
                            error!(room = %room_id, %err, "failed to seat paired player");
                        }
                    }
                }
            }

            for info in &players_info {
                self.rooms
                    .register_player(info.player_id.clone(), room_id)
                    .await;
                let side: Side = info.side;
                let _ = self
                    .connections
                    .with_player(&info.player_id, |p| {
                        let _ = p.transition(PlayerStatus::InRoom);
                        let _ = p.assign_role(side);
                    })
                    .await;
                if let Some(socket) = self.connections.socket_for_player(&info.player_id).await {
                    let _ = self.connections.join_room(socket, room_id).await;
                }
            }

            self.lobby
                .open(room_id, pair.mode, pair.first.clone(), pair.second.clone())
                .await;

            let created = ServerMessage::MatchCreated(MatchCreatedInfo {
                room_id,
                mode: pair.mode,
                players: players_info,
                average_elo: pair.average_elo,
                elo_difference: pair.elo_difference,
                ready_timeout_secs: self.config.lobby.ready_timeout.as_secs(),
            });
            info!(room = %room_id, mode = %pair.mode, avg_elo = pair.average_elo, "match created");
            self.connections.broadcast_to_room(&room_id, &created, None).await;
        }

        for entry in outcome.expired {
            let _ = self
                .connections
                .with_player(&entry.player_id, |p| {
                    let _ = p.transition(PlayerStatus::Idle);
                })
                .await;
            self.connections
                .send_to_player(&entry.player_id, &ServerMessage::QueueTimeout)
                .await;
        }
    }

    /// Heartbeat sweep, grace purges, stale-room cleanup.
    async fn run_heartbeat_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.connection.heartbeat_interval);
        loop {
            ticker.tick().await;
            let sweep = self.connections.heartbeat_sweep().await;
            for (_, player_id) in sweep.closed {
                if let Some(player_id) = player_id {
                    self.handle_player_disconnected(&player_id).await;
                }
            }

            for player_id in self.connections.purge_expired_grace().await {
                if let Some(room) = self.rooms.room_for_player(&player_id).await {
                    let (room_id, paused) = {
                        let room = room.read().await;
                        (room.id, room.state == RoomState::Paused)
                    };
                    if paused {
                        self.end_processor
                            .handle_game_end(room_id, EndReason::Disconnect, None)
                            .await;
                    }
                }
            }

            self.rooms.cleanup().await;
            self.anti_cheat.sweep().await;
        }
    }

    /// Spawn the authoritative 60 Hz ticker for a room.
    fn spawn_room_loop(self: Arc<Self>, room_id: RoomId) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let tick_duration =
                Duration::from_micros(1_000_000 / self.config.room.tick_rate as u64);
            let mut ticker = interval(tick_duration);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                let room = match self.rooms.get_room(&room_id).await {
                    Some(room) => room,
                    None => break,
                };

                let (state, pause_expired, unhealthy) = {
                    let room = room.read().await;
                    (room.state, room.pause_expired(), room.unhealthy)
                };

                if unhealthy {
                    self.end_processor
                        .handle_game_end(room_id, EndReason::Forced, None)
                        .await;
                    break;
                }

                match state {
                    RoomState::Playing => {
                        let outcome = { room.write().await.run_tick() };
                        let outcome = match outcome {
                            Ok(outcome) => outcome,
                            // State changed between the peek and the tick
                            // (a pause raced in); keep the ticker alive.
                            Err(_) => continue,
                        };

                        for event in &outcome.events {
                            if let RoomEventKind::GoalScored { side, left, right } = event.kind {
                                let msg = ServerMessage::GoalScored(GoalScoredInfo {
                                    side,
                                    left,
                                    right,
                                });
                                if let Err(SubmitError::CriticalOverflow) = self
                                    .pipeline
                                    .submit_system(
                                        EventKind::GoalScored,
                                        msg,
                                        Target::Room(room_id),
                                        None,
                                    )
                                    .await
                                {
                                    room.write().await.unhealthy = true;
                                }
                            }
                        }

                        if let Some(snapshot) = outcome.snapshot {
                            let _ = self
                                .pipeline
                                .submit_system(
                                    EventKind::StateUpdate,
                                    ServerMessage::StateUpdate(snapshot),
                                    Target::Room(room_id),
                                    None,
                                )
                                .await;
                        }

                        if let Some(reason) = outcome.terminal {
                            self.end_processor
                                .handle_game_end(room_id, reason, None)
                                .await;
                            break;
                        }
                    }
                    RoomState::Paused => {
                        if pause_expired {
                            info!(room = %room_id, "pause expired, ending game");
                            self.end_processor
                                .handle_game_end(room_id, EndReason::Disconnect, None)
                                .await;
                            break;
                        }
                    }
                    RoomState::Finished => break,
                    RoomState::Waiting | RoomState::Ready => {}
                }
            }
            debug!(room = %room_id, "room ticker stopped");
        });
    }

    // =========================================================================
    // RESULT SUBMISSIONS (REST boundary)
    // =========================================================================

    /// Validate a result submission from the HTTP boundary. Rejected
    /// submissions never reach the database.
    pub async fn submit_result(&self, submission: ResultSubmission) -> SubmissionVerdict {
        self.anti_cheat.validate(&submission).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.connection_count().await
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub async fn queue_size(&self) -> usize {
        self.matchmaker.queue_size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{DbError, GameRow, MatchDatabase, PersistConfig, PlayerStatsRow};
    use tokio::sync::mpsc as tokio_mpsc;

    struct NullDb;

    impl MatchDatabase for NullDb {
        async fn insert_game(&self, _row: GameRow) -> Result<(), DbError> {
            Ok(())
        }
        async fn fetch_player_stats(
            &self,
            _player_id: &PlayerId,
        ) -> Result<Option<PlayerStatsRow>, DbError> {
            Ok(None)
        }
        async fn save_player_stats(&self, _row: PlayerStatsRow) -> Result<(), DbError> {
            Ok(())
        }
    }

    fn test_server() -> Arc<GameServer> {
        let store = SessionStore::spawn(NullDb, PersistConfig::default());
        GameServer::new(ServerConfig::default(), store)
    }

    async fn connect_player(server: &Arc<GameServer>, id: &str) -> (u64, tokio_mpsc::Receiver<Outbound>) {
        let (tx, rx) = tokio_mpsc::channel(64);
        let socket = server
            .connections
            .register_socket("127.0.0.1:9999".parse().unwrap(), tx)
            .await
            .unwrap();
        server
            .connections
            .authenticate(socket, PlayerId::new(id), id)
            .await
            .unwrap();
        (socket, rx)
    }

    fn drain(rx: &mut tokio_mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Message(msg) = msg {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.room.tick_rate, 60);
        assert_eq!(config.connection.max_connections, 1000);
        assert_eq!(config.matchmaker.skill_tolerance, 200);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server();
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
    }

    #[tokio::test]
    async fn test_pairing_creates_room_and_notifies() {
        let server = test_server();
        let (s1, mut rx1) = connect_player(&server, "p1").await;
        let (s2, mut rx2) = connect_player(&server, "p2").await;

        for (socket, id) in [(s1, "p1"), (s2, "p2")] {
            server
                .route_inbound(
                    PlayerId::new(id),
                    socket,
                    ClientMessage::JoinMatchmaking(
                        crate::network::protocol::MatchmakingRequest {
                            game_mode: GameMode::Casual,
                            region: None,
                        },
                    ),
                    Target::Player(PlayerId::new(id)),
                )
                .await;
        }

        assert_eq!(server.queue_size().await, 0, "queue drained by pairing");
        assert_eq!(server.room_count().await, 1);

        let p1 = server
            .connections
            .get_player(&PlayerId::new("p1"))
            .await
            .unwrap();
        assert_eq!(p1.status, PlayerStatus::InRoom);
        assert_eq!(p1.role, Some(Side::Left));

        let msgs = drain(&mut rx1);
        let created = msgs.iter().find_map(|m| match m {
            ServerMessage::MatchCreated(info) => Some(info.clone()),
            _ => None,
        });
        let created = created.expect("match_created delivered");
        assert_eq!(created.average_elo, 1200);
        assert_eq!(created.elo_difference, 0);
        assert!(drain(&mut rx2)
            .iter()
            .any(|m| matches!(m, ServerMessage::MatchCreated(_))));
    }

    #[tokio::test]
    async fn test_ready_up_starts_game() {
        let server = test_server();
        let (s1, mut rx1) = connect_player(&server, "p1").await;
        let (s2, _rx2) = connect_player(&server, "p2").await;

        for (socket, id) in [(s1, "p1"), (s2, "p2")] {
            server
                .route_inbound(
                    PlayerId::new(id),
                    socket,
                    ClientMessage::JoinMatchmaking(
                        crate::network::protocol::MatchmakingRequest {
                            game_mode: GameMode::Casual,
                            region: None,
                        },
                    ),
                    Target::Player(PlayerId::new(id)),
                )
                .await;
        }

        server.handle_ready_up(PlayerId::new("p1"), true).await;
        server.handle_ready_up(PlayerId::new("p2"), true).await;

        let room = server
            .rooms
            .room_for_player(&PlayerId::new("p1"))
            .await
            .unwrap();
        assert_eq!(room.read().await.state, RoomState::Playing);

        let p1 = server
            .connections
            .get_player(&PlayerId::new("p1"))
            .await
            .unwrap();
        assert_eq!(p1.status, PlayerStatus::InGame);
        assert!(drain(&mut rx1)
            .iter()
            .any(|m| matches!(m, ServerMessage::GameStarted(_))));
    }

    #[tokio::test]
    async fn test_decline_rewinds_to_queue_head() {
        let server = test_server();
        let (s1, _rx1) = connect_player(&server, "p1").await;
        let (s2, mut rx2) = connect_player(&server, "p2").await;

        for (socket, id) in [(s1, "p1"), (s2, "p2")] {
            server
                .route_inbound(
                    PlayerId::new(id),
                    socket,
                    ClientMessage::JoinMatchmaking(
                        crate::network::protocol::MatchmakingRequest {
                            game_mode: GameMode::Casual,
                            region: None,
                        },
                    ),
                    Target::Player(PlayerId::new(id)),
                )
                .await;
        }

        server.handle_ready_up(PlayerId::new("p1"), true).await;
        server.handle_ready_up(PlayerId::new("p2"), false).await;

        // p1 returns to the queue head, p2 is withdrawn, the room is gone
        assert_eq!(
            server.matchmaker.position_of(&PlayerId::new("p1")).await,
            Some(0)
        );
        assert_eq!(server.room_count().await, 0);
        let p2 = server
            .connections
            .get_player(&PlayerId::new("p2"))
            .await
            .unwrap();
        assert_eq!(p2.status, PlayerStatus::Idle);
        assert!(drain(&mut rx2)
            .iter()
            .any(|m| matches!(m, ServerMessage::QueueTimeout)));
    }

    #[tokio::test]
    async fn test_disconnect_pauses_room() {
        let server = test_server();
        let (s1, _rx1) = connect_player(&server, "p1").await;
        let (s2, mut rx2) = connect_player(&server, "p2").await;

        for (socket, id) in [(s1, "p1"), (s2, "p2")] {
            server
                .route_inbound(
                    PlayerId::new(id),
                    socket,
                    ClientMessage::JoinMatchmaking(
                        crate::network::protocol::MatchmakingRequest {
                            game_mode: GameMode::Casual,
                            region: None,
                        },
                    ),
                    Target::Player(PlayerId::new(id)),
                )
                .await;
        }
        server.handle_ready_up(PlayerId::new("p1"), true).await;
        server.handle_ready_up(PlayerId::new("p2"), true).await;

        // p1's socket drops
        server.connections.unbind_socket(s1).await;
        server.handle_player_disconnected(&PlayerId::new("p1")).await;

        let room = server
            .rooms
            .room_for_player(&PlayerId::new("p2"))
            .await
            .unwrap();
        assert_eq!(room.read().await.state, RoomState::Paused);
        assert!(drain(&mut rx2)
            .iter()
            .any(|m| matches!(m, ServerMessage::GamePaused(_))));

        // p1 reconnects within grace: the game resumes with score intact
        let (tx, _rx) = tokio_mpsc::channel(64);
        let s1b = server
            .connections
            .register_socket("127.0.0.1:9999".parse().unwrap(), tx)
            .await
            .unwrap();
        let outcome = server
            .connections
            .authenticate(s1b, PlayerId::new("p1"), "p1")
            .await
            .unwrap();
        assert!(outcome.reconnected);
        server.resume_session(s1b, &PlayerId::new("p1")).await;

        assert_eq!(room.read().await.state, RoomState::Playing);
    }

    #[tokio::test]
    async fn test_movement_rejection_sends_correction() {
        let server = test_server();
        let (s1, mut rx1) = connect_player(&server, "p1").await;
        let (s2, _rx2) = connect_player(&server, "p2").await;

        for (socket, id) in [(s1, "p1"), (s2, "p2")] {
            server
                .route_inbound(
                    PlayerId::new(id),
                    socket,
                    ClientMessage::JoinMatchmaking(
                        crate::network::protocol::MatchmakingRequest {
                            game_mode: GameMode::Casual,
                            region: None,
                        },
                    ),
                    Target::Player(PlayerId::new(id)),
                )
                .await;
        }
        server.handle_ready_up(PlayerId::new("p1"), true).await;
        server.handle_ready_up(PlayerId::new("p2"), true).await;
        let room_id = {
            let room = server
                .rooms
                .room_for_player(&PlayerId::new("p1"))
                .await
                .unwrap();
            let id = room.read().await.id;
            id
        };
        drain(&mut rx1);

        // A teleport across the field gets snapped back
        let claim = MovementClaim {
            position: crate::game::world::Vec2::new(1500.0, 840.0),
            velocity: crate::game::world::Vec2::new(8.0, 0.0),
            keys: crate::game::physics::InputFrame::default(),
            timestamp: now_ms(),
            sequence_id: 1,
        };
        server
            .handle_movement(PlayerId::new("p1"), s1, room_id, claim)
            .await;

        assert!(drain(&mut rx1)
            .iter()
            .any(|m| matches!(m, ServerMessage::PositionCorrection(_))));
    }

    #[tokio::test]
    async fn test_result_submission_gate() {
        let server = test_server();
        let verdict = server
            .submit_result(ResultSubmission {
                player_id: PlayerId::new("p1"),
                opponent_id: PlayerId::new("p2"),
                player_score: 15,
                opponent_score: 0,
                duration_secs: 60,
                declared: crate::validate::anti_cheat::DeclaredOutcome::Win,
            })
            .await;
        assert!(!verdict.accepted);
        assert!(verdict.suspicion >= 5);
    }
}
