//! Reactor loop: accepts sockets, dispatches messages and drives every
//! periodic task from one `select!`.
//!
//! The reactor task exclusively owns the connection registry, the session
//! directory and the world state, so none of them need locking. Per-socket
//! read/write tasks and the store worker only talk to it over channels:
//! inbound traffic arrives as [`ConnEvent`]s, datastore completions as
//! [`StoreEvent`]s, and outbound messages leave through each connection's
//! bounded outbox. A failed or refused write is treated as a disconnect.

use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use shared::{ClientEnvelope, ClientMessage, ServerMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::directory::SessionDirectory;
use crate::frame;
use crate::handshake;
use crate::registry::{ConnState, ConnectionRegistry};
use crate::store::{spawn_store_worker, StoreEvent, StoreRequest, UserStore};
use crate::world::{UpdateOutcome, WorldState};

/// Upper bound on the HTTP header block during the upgrade handshake.
const MAX_HEADER_LEN: usize = 8 * 1024;

/// Per-connection outbox depth. A client that cannot drain this many
/// pending messages is considered dead.
const OUTBOX_DEPTH: usize = 64;

/// Tick cadences and timeouts. Defaults mirror the production deployment:
/// broadcast every second, keepalive every ten, a thirty second pong
/// timeout, and pull/push persistence cycles of thirty and twenty seconds.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of the session cookie issued by the upstream login flow.
    pub session_cookie: String,
    pub broadcast_interval: Duration,
    pub keepalive_interval: Duration,
    pub client_timeout: Duration,
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_cookie: "sessionid".to_string(),
            broadcast_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(10),
            client_timeout: Duration::from_secs(30),
            pull_interval: Duration::from_secs(30),
            push_interval: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(3),
        }
    }
}

/// Events from connection tasks to the reactor.
#[derive(Debug)]
enum ConnEvent {
    /// Handshake completed; the connection is live.
    Opened {
        id: u64,
        session_id: Option<String>,
        outbox: mpsc::Sender<ServerMessage>,
    },
    /// One decoded, recognizable JSON message.
    Message { id: u64, envelope: ClientEnvelope },
    /// Socket error, EOF or client-side close.
    Closed { id: u64 },
}

/// The synchronization server: one bound listener plus the reactor state.
pub struct SyncServer {
    listener: TcpListener,
    config: ServerConfig,
    store: Arc<dyn UserStore>,
}

impl SyncServer {
    /// Binds the listening socket. The reactor does not run until
    /// [`SyncServer::run`] is awaited.
    pub async fn bind(
        addr: &str,
        config: ServerConfig,
        store: Arc<dyn UserStore>,
    ) -> Result<Self, Box<dyn Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            store,
        })
    }

    /// The actual address bound, useful when the port was 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Box<dyn Error>> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the reactor until the process is killed.
    pub async fn run(self) -> Result<(), Box<dyn Error>> {
        let (conn_tx, mut conn_rx) = mpsc::channel::<ConnEvent>(256);
        let (store_event_tx, mut store_event_rx) = mpsc::channel::<StoreEvent>(256);
        let store_requests = spawn_store_worker(Arc::clone(&self.store), store_event_tx);

        let mut reactor = Reactor::new(self.config.clone(), store_requests, conn_tx);

        let mut broadcast_tick = interval(self.config.broadcast_interval);
        let mut keepalive_tick = interval(self.config.keepalive_interval);
        let mut pull_tick = interval(self.config.pull_interval);
        let mut push_tick = interval(self.config.push_interval);
        for tick in [
            &mut broadcast_tick,
            &mut keepalive_tick,
            &mut pull_tick,
            &mut push_tick,
        ] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip the first tick since it fires immediately.
            tick.tick().await;
        }

        info!("Server started successfully");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            reactor.spawn_connection(stream);
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                },
                Some(event) = conn_rx.recv() => {
                    reactor.handle_conn_event(event);
                },
                Some(event) = store_event_rx.recv() => {
                    reactor.handle_store_event(event);
                },
                _ = broadcast_tick.tick() => {
                    reactor.broadcast();
                },
                _ = keepalive_tick.tick() => {
                    reactor.keepalive();
                },
                _ = pull_tick.tick() => {
                    reactor.request_store(StoreRequest::PullRecent);
                },
                _ = push_tick.tick() => {
                    reactor.push_dirty();
                },
            }
        }
    }
}

/// Reactor state: the three keyed collections plus channel handles. Only
/// the reactor task ever touches this.
struct Reactor {
    config: ServerConfig,
    registry: ConnectionRegistry,
    directory: SessionDirectory,
    world: WorldState,
    store_requests: mpsc::Sender<StoreRequest>,
    conn_tx: mpsc::Sender<ConnEvent>,
    next_conn_id: Arc<AtomicU64>,
}

impl Reactor {
    fn new(
        config: ServerConfig,
        store_requests: mpsc::Sender<StoreRequest>,
        conn_tx: mpsc::Sender<ConnEvent>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            directory: SessionDirectory::new(),
            world: WorldState::new(),
            store_requests,
            conn_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Hands a fresh socket to its own handshake + read task.
    fn spawn_connection(&self, stream: TcpStream) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let events = self.conn_tx.clone();
        let cookie = self.config.session_cookie.clone();
        let handshake_timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            run_connection(id, stream, cookie, handshake_timeout, events).await;
        });
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Opened {
                id,
                session_id,
                outbox,
            } => {
                self.registry.insert(id, outbox, session_id);
            }
            ConnEvent::Message { id, envelope } => {
                self.dispatch(id, envelope);
            }
            ConnEvent::Closed { id } => {
                info!("Connection {} closed", id);
                self.remove_connection(id);
            }
        }
    }

    /// Routes one client message. Errors on one message never abort the
    /// handling of traffic from other connections in the same tick.
    fn dispatch(&mut self, id: u64, envelope: ClientEnvelope) {
        let Some(conn) = self.registry.get_mut(id) else {
            // Evicted while the message was in flight.
            return;
        };
        // A session id in the message body overrides the handshake cookie.
        if let Some(session_id) = envelope.session_id {
            conn.session_id = Some(session_id);
        }

        match envelope.msg {
            ClientMessage::Hello => self.handle_hello(id),
            ClientMessage::UpdateUserPos { lat, lon, alt } => {
                self.handle_update(id, lat, lon, alt)
            }
            ClientMessage::ChatMessage { message, camera } => {
                self.handle_chat(id, message, camera)
            }
            ClientMessage::Refresh => self.handle_refresh(id),
            ClientMessage::Pong => self.handle_pong(id),
            ClientMessage::Disconnect => {
                info!("Connection {} requested disconnect", id);
                self.remove_connection(id);
            }
        }
    }

    fn handle_hello(&mut self, id: u64) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        let Some(session_id) = conn.session_id.clone() else {
            self.reply_error(id, "Missing session_id");
            return;
        };

        if let Some(user_id) = self.directory.resolve(&session_id) {
            self.complete_hello(id, &session_id, user_id);
        } else {
            // Only hello may fall back to the datastore; the reply comes
            // back through the store worker.
            if let Some(conn) = self.registry.get_mut(id) {
                conn.awaiting_session = Some(session_id.clone());
            }
            self.request_store(StoreRequest::ResolveSession { session_id });
        }
    }

    /// Binds the connection to its user and replies with the user's own
    /// record, loading it from the datastore first if needed.
    fn complete_hello(&mut self, id: u64, session_id: &str, user_id: i64) {
        if let Some(conn) = self.registry.get_mut(id) {
            conn.user_id = Some(user_id);
            conn.session_id = Some(session_id.to_string());
            conn.state = ConnState::Authenticated;
        } else {
            return;
        }
        self.world.set_connected(user_id, true);

        if self.world.contains(user_id) {
            self.send_own_user_data(id, user_id);
        } else {
            info!("Loading user {} for connection {}", user_id, id);
            if let Some(conn) = self.registry.get_mut(id) {
                conn.awaiting_user = Some(user_id);
            }
            self.request_store(StoreRequest::LoadUser { user_id });
        }
    }

    /// The hello reply: the client gets its own record back, stamped with
    /// the current clock, and the session's cursor starts there.
    fn send_own_user_data(&mut self, id: u64, user_id: i64) {
        let clock = self.world.clock();
        let Some(user) = self.world.user(user_id) else {
            return;
        };
        let msg = ServerMessage::UserData {
            user_id,
            lat: user.lat,
            lon: user.lon,
            alt: user.alt,
            version: clock,
        };
        let session_id = self
            .registry
            .get(id)
            .and_then(|conn| conn.session_id.clone());
        if self.send_to(id, msg) {
            if let Some(session_id) = session_id {
                self.directory.record_seen(&session_id, user_id, clock);
            }
        }
    }

    fn handle_update(
        &mut self,
        id: u64,
        lat: Option<f64>,
        lon: Option<f64>,
        alt: Option<f64>,
    ) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let Some(user_id) = conn.user_id else {
            self.reply_error(id, "Not identified");
            return;
        };
        if conn.state == ConnState::Authenticated {
            conn.state = ConnState::Active;
        }
        let (Some(lat), Some(lon), Some(alt)) = (lat, lon, alt) else {
            self.reply_error(id, "Missing position data");
            return;
        };

        let claimed = self.world.clock();
        match self.world.apply_position_update(user_id, lat, lon, alt, claimed) {
            UpdateOutcome::Applied(version) | UpdateOutcome::Created(version) => {
                debug!(
                    "User {} moved to ({}, {}, {}) at version {}",
                    user_id, lat, lon, alt, version
                );
            }
            UpdateOutcome::Unchanged => {
                debug!("User {} position unchanged", user_id);
            }
            UpdateOutcome::Stale => {
                // Already logged by the world store.
            }
        }
    }

    fn handle_chat(
        &mut self,
        id: u64,
        message: Option<String>,
        camera: Option<serde_json::Value>,
    ) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let Some(user_id) = conn.user_id else {
            self.reply_error(id, "Not identified");
            return;
        };
        if conn.state == ConnState::Authenticated {
            conn.state = ConnState::Active;
        }
        let Some(message) = message else {
            self.reply_error(id, "Missing chat message");
            return;
        };

        let nick = self
            .world
            .user(user_id)
            .map(|user| user.nick.trim())
            .filter(|nick| !nick.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "unknown".to_string());
        let broadcast = ServerMessage::ChatMessage {
            user_id,
            nick,
            message,
            camera,
            timestamp: unix_timestamp(),
        };

        // Chat is pushed to every live connection immediately; it is not
        // version-gated like position data.
        let ids: Vec<u64> = self.registry.iter().map(|conn| conn.id).collect();
        for conn_id in ids {
            self.send_to(conn_id, broadcast.clone());
        }
    }

    fn handle_refresh(&mut self, id: u64) {
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        let Some(session_id) = conn.session_id.clone() else {
            self.reply_error(id, "Missing session_id");
            return;
        };
        debug!("Connection {} requested refresh", id);
        self.directory.reset(&session_id);
    }

    fn handle_pong(&mut self, id: u64) {
        self.registry.mark_pong(id);
        let Some(conn) = self.registry.get(id) else {
            return;
        };
        if let Some(session_id) = conn.session_id.clone() {
            self.directory.touch(&session_id);
        }
        if let Some(user_id) = conn.user_id {
            self.world.touch(user_id);
        }
    }

    fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::SessionResolved {
                session_id,
                user_id,
            } => {
                let waiting = self.registry.awaiting_session(&session_id);
                for id in waiting {
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.awaiting_session = None;
                    }
                    match user_id {
                        Some(user_id) => {
                            if !self.directory.contains(&session_id) {
                                self.directory.bind(&session_id, user_id);
                            }
                            self.complete_hello(id, &session_id, user_id);
                        }
                        None => {
                            warn!("Invalid session {} on connection {}", session_id, id);
                            self.reply_error(id, "Invalid session_id");
                        }
                    }
                }
            }
            StoreEvent::UserLoaded { user_id, record } => {
                if let Some(record) = &record {
                    self.world.insert_loaded(record);
                    if self.registry.user_still_connected(user_id) {
                        self.world.set_connected(user_id, true);
                    }
                }
                let waiting = self.registry.awaiting_user(user_id);
                for id in waiting {
                    if let Some(conn) = self.registry.get_mut(id) {
                        conn.awaiting_user = None;
                    }
                    if record.is_some() {
                        self.send_own_user_data(id, user_id);
                    } else {
                        warn!("User {} vanished from datastore", user_id);
                        self.reply_error(id, "Invalid session_id");
                    }
                }
            }
            StoreEvent::RecentPulled { records } => {
                let connected = self.registry.connected_user_ids();
                self.world.merge_pulled(&records, &connected);
            }
            StoreEvent::UserSaved { user_id, version } => {
                debug!("User {} persisted at version {}", user_id, version);
                self.world.mark_persisted(user_id, version);
            }
        }
    }

    /// Broadcast tick: push every user whose stored version is ahead of the
    /// session's cursor, then advance the cursors and the watermark.
    fn broadcast(&mut self) {
        if !self.world.needs_broadcast() {
            return;
        }

        let mut planned = Vec::new();
        for conn in self.registry.iter() {
            let Some(session_id) = conn.session_id.as_deref() else {
                continue;
            };
            if !self.directory.contains(session_id) {
                continue;
            }
            for (user_id, user) in self.world.iter() {
                let seen = self.directory.seen_version(session_id, user_id);
                if user.version > seen {
                    planned.push((
                        conn.id,
                        session_id.to_string(),
                        user_id,
                        user.version,
                        ServerMessage::UserData {
                            user_id,
                            lat: user.lat,
                            lon: user.lon,
                            alt: user.alt,
                            version: user.version,
                        },
                    ));
                }
            }
        }

        for (conn_id, session_id, user_id, version, msg) in planned {
            if self.send_to(conn_id, msg) {
                self.directory.record_seen(&session_id, user_id, version);
            }
        }
        self.world.finish_broadcast();
    }

    /// Keepalive tick: evict the silent, ping the rest.
    fn keepalive(&mut self) {
        for id in self.registry.timed_out(self.config.client_timeout) {
            info!("Connection {} timed out, evicting", id);
            self.remove_connection(id);
        }
        let ids: Vec<u64> = self.registry.iter().map(|conn| conn.id).collect();
        for id in ids {
            self.send_to(id, ServerMessage::Ping);
        }
    }

    /// Push tick: queue a save for every dirty user.
    fn push_dirty(&mut self) {
        if !self.world.needs_push() {
            return;
        }
        for dirty in self.world.dirty_snapshot() {
            self.request_store(StoreRequest::SaveUser {
                user_id: dirty.user_id,
                lat: dirty.lat,
                lon: dirty.lon,
                alt: dirty.alt,
                version: dirty.version,
            });
        }
    }

    /// Queues a store request without blocking the loop. A full queue drops
    /// the request; periodic work retries on its next tick and a client
    /// retries its own hello.
    fn request_store(&mut self, request: StoreRequest) {
        if let Err(e) = self.store_requests.try_send(request) {
            warn!("Store queue unavailable, dropping request: {}", e);
        }
    }

    /// Best-effort send. Returns false (and evicts) when the connection's
    /// outbox is gone or full.
    fn send_to(&mut self, id: u64, msg: ServerMessage) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        if conn.outbox.try_send(msg).is_err() {
            warn!("Connection {} cannot accept writes, evicting", id);
            self.remove_connection(id);
            return false;
        }
        true
    }

    fn reply_error(&mut self, id: u64, message: &str) {
        self.send_to(
            id,
            ServerMessage::Error {
                message: message.to_string(),
            },
        );
    }

    /// Final teardown of one connection. Dropping the outbox ends the
    /// writer task, which shuts the socket down.
    fn remove_connection(&mut self, id: u64) {
        if let Some(conn) = self.registry.remove(id) {
            if let Some(user_id) = conn.user_id {
                if !self.registry.user_still_connected(user_id) {
                    self.world.set_connected(user_id, false);
                }
            }
        }
    }
}

/// Seconds since the Unix epoch, for chat timestamps.
fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

/// Per-connection task: upgrade handshake, then the frame read loop. The
/// paired writer task is spawned once the handshake succeeds.
async fn run_connection(
    id: u64,
    mut stream: TcpStream,
    cookie_name: String,
    handshake_timeout: Duration,
    events: mpsc::Sender<ConnEvent>,
) {
    // Header phase: accumulate bytes until the blank line, bounded in both
    // time and size. Anything read past the terminator is frame data.
    let mut buf = Vec::new();
    let header_end = loop {
        let mut chunk = [0u8; 1024];
        let read = match timeout(handshake_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => {
                debug!("Connection {} dropped during handshake", id);
                return;
            }
            Ok(Ok(n)) => n,
        };
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_HEADER_LEN {
            warn!("Connection {} sent an oversized header block", id);
            return;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let reply = match handshake::respond(&headers, &cookie_name) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Handshake failed on connection {}: {}", id, e);
            return;
        }
    };
    if stream.write_all(reply.response.as_bytes()).await.is_err() {
        return;
    }
    info!("Connection {} handshake done", id);

    let leftover = buf[header_end..].to_vec();
    let (read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel::<ServerMessage>(OUTBOX_DEPTH);

    if events
        .send(ConnEvent::Opened {
            id,
            session_id: reply.session_id,
            outbox: outbox_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(write_loop(id, write_half, outbox_rx, events.clone()));
    read_loop(id, read_half, leftover, events).await;
}

/// Serializes and frames outbound messages. Exits when the reactor drops
/// the outbox (eviction) or the socket refuses a write.
async fn write_loop(
    id: u64,
    mut half: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<ServerMessage>,
    events: mpsc::Sender<ConnEvent>,
) {
    while let Some(msg) = outbox.recv().await {
        let payload = match serde_json::to_string(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize message for connection {}: {}", id, e);
                continue;
            }
        };
        if half.write_all(&frame::encode_text(&payload)).await.is_err() {
            debug!("Write failed on connection {}", id);
            let _ = events.send(ConnEvent::Closed { id }).await;
            return;
        }
    }
    // Evicted: signal the peer we are done writing.
    let _ = half.shutdown().await;
}

/// Decodes frames off the socket and forwards recognizable messages.
/// Undecodable frames and unrecognized JSON are logged and skipped; the
/// connection stays open.
async fn read_loop(
    id: u64,
    mut half: OwnedReadHalf,
    mut buf: Vec<u8>,
    events: mpsc::Sender<ConnEvent>,
) {
    let mut chunk = [0u8; 2048];
    loop {
        // Drain every complete frame already buffered.
        loop {
            match frame::decode_text(&buf) {
                Ok(Some(decoded)) => {
                    buf.drain(..decoded.consumed);
                    match ClientEnvelope::parse(&decoded.payload) {
                        Some(envelope) => {
                            if events
                                .send(ConnEvent::Message { id, envelope })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        None => {
                            warn!("Connection {} sent an unrecognizable message", id);
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Treat the junk as a no-op and resynchronize.
                    warn!("Connection {} sent an undecodable frame: {}", id, e);
                    buf.clear();
                    break;
                }
            }
        }

        match half.read(&mut chunk).await {
            Ok(0) | Err(_) => {
                let _ = events.send(ConnEvent::Closed { id }).await;
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}
