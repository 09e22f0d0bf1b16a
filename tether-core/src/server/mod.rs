//! The tether server: accept loop, per-connection receive loops, queued
//! packet processing, request correlation, broadcast, and the ban and idle
//! maintenance tasks.
//!
//! ```text
//!  accept ──► admission ──► receive loop ──► queue (keyed by connection)
//!                                                  │
//!                          pending reply? ◄────────┤
//!                                                  ▼
//!                                          OnDataReceived ──► command dispatch
//!                                                         └─► heartbeat reply
//! ```

pub mod admission;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ban::{BanStore, JsonFileBanStore, MemoryBanStore};
use crate::buffer::BufferPool;
use crate::codec::FrameCodec;
use crate::components::{ClientComponent, PermissionGroup, Verify};
use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionReader};
use crate::error::TetherError;
use crate::message::{PacketType, body_keys};
use crate::packet::Packet;
use crate::queue::{QueuePool, QueueStatistics, StopReport};
use crate::state::{PendingRequests, ServerPhase};
use crate::systems::{CommandSystem, EventSystem, HandlerId, NetworkEvent, ServerEvent, Systems, TaskSystem};

pub use admission::{AdmissionPolicy, Rejection};

/// Listen backlog used when the configuration does not set one.
pub const LISTEN_BACKLOG: u32 = 1024;

/// Pause after a failed `accept` so a persistent error cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Longest ban `ban_client` records, about a thousand years. Keeps ban
/// timestamps inside four-digit RFC 3339 years.
pub const MAX_BAN_HOURS: i64 = 24 * 365 * 1000;

const TASK_CHECK_BANNED: &str = "check_banned_client";
const TASK_VERIFY_CLIENT: &str = "verify_client";
const LISTENER_COMMANDS: &str = "command_dispatch";
const LISTENER_HEARTBEAT: &str = "verify_client_heartbeat";

/// Outcome of [`Server::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

// ── Server ───────────────────────────────────────────────────────

/// Cloneable handle to a running (or not yet started) server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Non-owning handle for the server's own tasks, listeners and commands.
/// Anything stored inside the server should hold one of these, not a
/// [`Server`].
#[derive(Clone)]
pub struct WeakServer(Weak<ServerInner>);

impl WeakServer {
    pub fn upgrade(&self) -> Option<Server> {
        self.0.upgrade().map(|inner| Server { inner })
    }
}

struct ServerInner {
    config: ServerConfig,
    systems: Systems,
    clients: DashMap<u64, Connection>,
    pending: PendingRequests,
    queue: QueuePool,
    buffers: BufferPool,
    ban_store: Arc<dyn BanStore>,
    bans: DashMap<String, DateTime<Utc>>,
    admission: RwLock<AdmissionPolicy>,
    idle_timeout: RwLock<Duration>,
    phase: Mutex<ServerPhase>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Server {
    /// Create a server from `config`. Must be called inside a tokio runtime.
    ///
    /// Bans go to the configured JSON file, or stay in memory when no
    /// file is set.
    pub fn new(config: ServerConfig) -> Self {
        let store: Arc<dyn BanStore> = if config.security.ban_file.is_empty() {
            Arc::new(MemoryBanStore::new())
        } else {
            Arc::new(JsonFileBanStore::new(&config.security.ban_file))
        };
        Self::with_ban_store(config, store)
    }

    pub fn with_ban_store(config: ServerConfig, ban_store: Arc<dyn BanStore>) -> Self {
        let queue = QueuePool::new(config.queue.to_queue_config());
        queue.on_item_failed(|failure| {
            warn!(shard = failure.shard, item = failure.item_id, error = %failure.error, "packet processing failed");
        });
        Self {
            inner: Arc::new(ServerInner {
                admission: RwLock::new(AdmissionPolicy::from_config(&config)),
                idle_timeout: RwLock::new(config.maintenance.idle_timeout()),
                config,
                systems: Systems::new(),
                clients: DashMap::new(),
                pending: PendingRequests::new(),
                queue,
                buffers: BufferPool::default(),
                ban_store,
                bans: DashMap::new(),
                phase: Mutex::new(ServerPhase::default()),
                shutdown: CancellationToken::new(),
                accept_task: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer(Arc::downgrade(&self.inner))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn key(&self) -> &str {
        &self.inner.config.security.key
    }

    pub fn phase(&self) -> ServerPhase {
        *self.inner.phase.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.phase.lock().local_addr()
    }

    pub fn systems(&self) -> &Systems {
        &self.inner.systems
    }

    pub fn events(&self) -> &EventSystem {
        &self.inner.systems.events
    }

    pub fn tasks(&self) -> &TaskSystem {
        &self.inner.systems.tasks
    }

    pub fn commands(&self) -> &CommandSystem {
        &self.inner.systems.commands
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.buffers
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        self.inner.queue.statistics()
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_connected(&self, connection: &Connection) -> bool {
        self.inner.clients.contains_key(&connection.id())
    }

    /// The live connection whose [`ClientComponent`] carries `user_id`.
    pub fn client_by_user_id(&self, user_id: &str) -> Option<Connection> {
        self.inner
            .clients
            .iter()
            .find(|entry| {
                entry
                    .value()
                    .components()
                    .get::<ClientComponent>()
                    .and_then(|client| client.user_id())
                    .is_some_and(|uid| uid == user_id)
            })
            .map(|entry| entry.value().clone())
    }

    /// Register a handler for a server event.
    pub fn on<F, Fut>(&self, event: ServerEvent, handler: F) -> HandlerId
    where
        F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.systems.events.add_listener(event.name(), handler)
    }

    pub fn set_admission_policy(&self, policy: AdmissionPolicy) {
        *self.inner.admission.write() = policy;
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        *self.inner.idle_timeout.write() = timeout;
    }

    // ── Events ───────────────────────────────────────────────────

    async fn fire(&self, event: ServerEvent, args: NetworkEvent) {
        self.inner.systems.events.push_event(event.name(), args).await;
    }

    /// Fire without waiting for handlers.
    fn fire_detached(&self, event: ServerEvent, args: NetworkEvent) {
        if self.inner.systems.events.listener_count(event.name()) == 0 {
            return;
        }
        let server = self.clone();
        tokio::spawn(async move { server.fire(event, args).await });
    }

    fn fire_error(&self, connection: Option<&Connection>, error: &TetherError) {
        match connection {
            Some(c) => warn!(connection = c.id(), peer = %c.peer_addr(), %error, "server error"),
            None => warn!(%error, "server error"),
        }
        let args = NetworkEvent {
            connection: connection.cloned(),
            message: Some(error.to_string()),
            ..NetworkEvent::default()
        };
        self.fire_detached(ServerEvent::Error, args);
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Bind `ip:port` and start accepting. Returns the bound address.
    ///
    /// On failure the server fires `OnError` and stays startable.
    pub async fn start(&self, ip: &str, port: u16) -> Result<SocketAddr, TetherError> {
        if *self.inner.phase.lock() != ServerPhase::Created {
            return Err(TetherError::InvalidState("server already started"));
        }
        match self.bind_and_listen(ip, port).await {
            Ok(addr) => {
                info!(%addr, "server listening");
                self.fire(ServerEvent::Started, NetworkEvent::new().with_message(addr.to_string()))
                    .await;
                Ok(addr)
            }
            Err(e) => {
                let _ = self.inner.phase.lock().reset();
                self.fire_error(None, &e);
                Err(e)
            }
        }
    }

    /// [`Server::start`] on the configured address.
    pub async fn start_configured(&self) -> Result<SocketAddr, TetherError> {
        let network = &self.inner.config.network;
        self.start(&network.ip.clone(), network.port).await
    }

    async fn bind_and_listen(&self, ip: &str, port: u16) -> Result<SocketAddr, TetherError> {
        let addr = tokio::net::lookup_host((ip, port))
            .await?
            .next()
            .ok_or_else(|| TetherError::Config(format!("cannot resolve {ip}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let local = socket.local_addr()?;
        self.inner.phase.lock().bind(local)?;

        let backlog = match self.inner.config.network.backlog {
            0 => LISTEN_BACKLOG,
            n => n,
        };
        let listener = socket.listen(backlog)?;
        self.load_bans().await;
        self.inner.phase.lock().listen()?;

        let handle = tokio::spawn(accept_loop(
            self.downgrade(),
            listener,
            self.inner.shutdown.clone(),
        ));
        *self.inner.accept_task.lock() = Some(handle);
        Ok(local)
    }

    async fn load_bans(&self) {
        match self.inner.ban_store.load_ban_records().await {
            Ok(records) => {
                let now = Utc::now();
                let active = records.into_iter().filter(|(_, until)| *until > now);
                for (user_id, until) in active {
                    self.inner.bans.insert(user_id, until);
                }
                debug!(bans = self.inner.bans.len(), "ban records loaded");
            }
            Err(e) => self.fire_error(None, &e),
        }
    }

    /// Stop accepting, drain queued packets for up to `grace`, cancel
    /// server tasks and disconnect every client.
    ///
    /// Only the first call does anything.
    pub async fn stop(&self, grace: Duration) -> StopReport {
        if self.inner.phase.lock().stop().is_err() {
            return StopReport::default();
        }
        info!("server stopping");
        let report = self.inner.queue.stop(grace).await;

        self.inner.shutdown.cancel();
        let accept = self.inner.accept_task.lock().take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }

        self.inner.systems.tasks.cancel_all();
        for connection in self.connections() {
            self.disconnect_client(&connection).await;
        }
        self.inner.clients.clear();
        self.inner.pending.cancel_all();
        info!(flushed = report.flushed, abandoned = report.abandoned, "server stopped");
        report
    }

    // ── Accept / receive ─────────────────────────────────────────

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let verdict = self.inner.admission.read().check(peer, self.inner.clients.len(), |ip| {
            self.inner.bans.get(ip).map(|until| *until.value())
        });
        if let Err(rejection) = verdict {
            info!(%peer, %rejection, "connection refused");
            return;
        }

        let (connection, reader) = match Connection::from_stream(stream, self.inner.buffers.clone()) {
            Ok(pair) => pair,
            Err(e) => {
                self.fire_error(None, &e);
                return;
            }
        };
        let _ = connection.components().add::<Verify>();
        let _ = connection.components().add::<PermissionGroup>();
        self.inner.clients.insert(connection.id(), connection.clone());
        info!(connection = connection.id(), %peer, "client connected");

        let weak = self.downgrade();
        tokio::spawn(async move {
            if let Some(server) = weak.upgrade() {
                server
                    .fire(ServerEvent::ClientConnected, NetworkEvent::for_connection(&connection))
                    .await;
            }
            receive_loop(weak, connection, reader).await;
        });
    }

    /// Decode one inbound frame on the receive task. Replies to pending
    /// requests complete here, so a handler awaiting a reply on its own
    /// connection is never stuck behind itself in the queue. Everything
    /// else is returned for queued processing.
    fn claim(&self, connection: &Connection, frame: &Bytes) -> Option<Packet> {
        let packet = match Packet::unpack(frame, self.key()) {
            Ok(packet) => packet,
            Err(e) => {
                self.fire_error(Some(connection), &e);
                return None;
            }
        };
        if let Some(request_id) = packet.request_id() {
            if self.inner.pending.complete(request_id, frame.clone()) {
                return None;
            }
        }
        Some(packet)
    }

    /// Handle one inbound packet. Runs on a queue worker.
    async fn process(&self, connection: Connection, packet: Packet, frame: Bytes) {
        let args = NetworkEvent::for_connection(&connection)
            .with_packet(Arc::new(packet))
            .with_raw(frame);
        self.fire(ServerEvent::DataReceived, args).await;
    }

    // ── Sending ──────────────────────────────────────────────────

    /// Pack `packet` with the server key and write it to `connection`.
    pub async fn send(&self, connection: &Connection, packet: &Packet) -> Result<(), TetherError> {
        if !self.is_connected(connection) {
            return Err(TetherError::NotConnected);
        }
        let payload = packet.pack(self.key())?;
        self.write(connection, payload).await
    }

    /// Send `reply` carrying the `RequestID` of `request`.
    pub async fn send_reply(
        &self,
        connection: &Connection,
        request: &Packet,
        reply: Packet,
    ) -> Result<(), TetherError> {
        self.send(connection, &reply.reply_to(request)).await
    }

    /// Send `packet` with a fresh `RequestID` and wait for the correlated
    /// reply (raw packed bytes).
    pub async fn send_async(
        &self,
        connection: &Connection,
        mut packet: Packet,
        timeout: Option<Duration>,
    ) -> Result<Bytes, TetherError> {
        let request_id = packet.assign_request_id();
        let waiter = self.inner.pending.register(&request_id);
        self.send(connection, &packet).await?;
        tokio::select! {
            reply = waiter.wait(timeout) => reply,
            _ = connection.closed() => Err(TetherError::ConnectionClosed),
        }
    }

    /// [`Server::send_async`], unpacking the reply.
    pub async fn request(
        &self,
        connection: &Connection,
        packet: Packet,
        timeout: Option<Duration>,
    ) -> Result<Packet, TetherError> {
        let reply = self.send_async(connection, packet, timeout).await?;
        Packet::unpack(&reply, self.key())
    }

    async fn write(&self, connection: &Connection, payload: Bytes) -> Result<(), TetherError> {
        match connection.write_frame(&payload, &self.inner.buffers).await {
            Ok(()) => {
                self.fire_detached(
                    ServerEvent::DataSent,
                    NetworkEvent::for_connection(connection).with_raw(payload),
                );
                Ok(())
            }
            Err(e) => {
                self.fire_error(Some(connection), &e);
                if e.is_disconnect() {
                    self.disconnect_client(connection).await;
                }
                Err(e)
            }
        }
    }

    /// Send `packet`, packed with the server key, to every live connection.
    pub async fn broadcast(&self, packet: &Packet) -> Result<BroadcastReport, TetherError> {
        let key = self.key().to_string();
        self.broadcast_with_key(packet, &key).await
    }

    /// Pack and frame once, write to every live connection concurrently,
    /// then disconnect the ones that failed.
    pub async fn broadcast_with_key(
        &self,
        packet: &Packet,
        key: &str,
    ) -> Result<BroadcastReport, TetherError> {
        let payload = packet.pack(key)?;
        let mut frame = self.inner.buffers.rent();
        FrameCodec::new().encode(&payload[..], &mut *frame)?;

        let targets = self.connections();
        let encoded: &[u8] = &frame;
        let results = join_all(targets.iter().map(|connection| async move {
            (connection, connection.write_encoded(encoded).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (connection, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    failed.push((connection.clone(), e));
                }
            }
        }
        drop(frame);

        for (connection, error) in failed {
            self.fire_error(Some(&connection), &error);
            self.disconnect_client(&connection).await;
        }
        debug!(delivered = report.delivered, failed = report.failed, "broadcast complete");
        Ok(report)
    }

    /// Remove `connection` from the live set and close it. Fires
    /// `OnClientDisconnected` once per connection; returns `false` if it
    /// was already gone.
    pub async fn disconnect_client(&self, connection: &Connection) -> bool {
        let removed = self.inner.clients.remove(&connection.id()).is_some();
        connection.close().await;
        if removed {
            info!(connection = connection.id(), peer = %connection.peer_addr(), "client disconnected");
            self.fire(ServerEvent::ClientDisconnected, NetworkEvent::for_connection(connection))
                .await;
        }
        removed
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Answer `command` packets. Idempotent.
    pub fn begin_receive_command(&self) -> HandlerId {
        let weak = self.downgrade();
        self.inner.systems.events.add_listener_with_id(
            ServerEvent::DataReceived.name(),
            LISTENER_COMMANDS,
            move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(server) = weak.upgrade() {
                        server.dispatch_command(event).await;
                    }
                }
            },
        )
    }

    async fn dispatch_command(&self, event: NetworkEvent) {
        let (Some(connection), Some(packet)) = (event.connection, event.packet) else {
            return;
        };
        if !packet.is_type(&PacketType::Command) {
            return;
        }
        let Some(name) = packet.body_str(body_keys::COMMAND) else {
            warn!(connection = connection.id(), "command packet without a command name");
            return;
        };
        let args = match packet.body_value(body_keys::ARGS) {
            Some(Value::Array(args)) => args.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(single) => vec![single.clone()],
        };

        let (message, result) = match self.inner.systems.commands.execute(name, &args, Some(&connection)) {
            Ok(result) => (String::new(), result),
            Err(TetherError::CommandNotFound(_)) => {
                warn!(command = name, connection = connection.id(), "command not found");
                return;
            }
            Err(e) => {
                warn!(command = name, connection = connection.id(), error = %e, "command failed");
                (e.to_string(), Value::Null)
            }
        };
        debug!(command = name, connection = connection.id(), "command executed");

        let executed = NetworkEvent::for_connection(&connection)
            .with_packet(Arc::clone(&packet))
            .with_message(name);
        self.fire_detached(ServerEvent::CommandExecuted, executed);

        let reply = Packet::command_response(&message, result);
        if let Err(e) = self.send_reply(&connection, &packet, reply).await {
            debug!(command = name, error = %e, "command reply not delivered");
        }
    }

    // ── Bans ─────────────────────────────────────────────────────

    fn user_id(connection: &Connection) -> Option<String> {
        connection
            .components()
            .get::<ClientComponent>()
            .and_then(|client| client.user_id())
    }

    /// Ban key of a connection: its user id, or its peer IP. An IP ban
    /// only refuses new connections; it never reaches other live ones.
    fn ban_key(&self, connection: &Connection) -> String {
        Self::user_id(connection).unwrap_or_else(|| connection.ip().to_string())
    }

    /// Ban the peer behind `connection` for `hours`, persist the ban and
    /// disconnect it. A ban that is already over only clears on the next
    /// ban check.
    pub async fn ban_client(
        &self,
        connection: &Connection,
        hours: i64,
    ) -> Result<DateTime<Utc>, TetherError> {
        let until = ban_deadline(Utc::now(), hours)?;
        let key = self.ban_key(connection);
        connection.components().get_or_add::<Verify>().ban(until);
        self.inner.bans.insert(key.clone(), until);
        let stored = self.inner.ban_store.write_ban_record(&key, until).await;
        info!(user = %key, %until, "client banned");
        if until > Utc::now() {
            self.disconnect_client(connection).await;
        }
        stored.map(|()| until)
    }

    pub async fn unban_client(&self, connection: &Connection) -> Result<(), TetherError> {
        if let Some(verify) = connection.components().get::<Verify>() {
            verify.unban();
        }
        let key = self.ban_key(connection);
        self.unban(&key).await
    }

    /// Lift the ban on a user id or IP.
    pub async fn unban(&self, key: &str) -> Result<(), TetherError> {
        self.inner.bans.remove(key);
        self.inner.ban_store.remove_ban_record(key).await?;
        info!(user = %key, "ban lifted");
        Ok(())
    }

    pub fn banned_until(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.bans.get(key).map(|until| *until.value())
    }

    /// Periodically disconnect banned clients and expire lapsed bans.
    pub fn begin_check_banned_client(&self, interval: Duration) -> Result<String, TetherError> {
        let weak = self.downgrade();
        self.inner.systems.tasks.add_task(TASK_CHECK_BANNED, interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(server) = weak.upgrade() {
                    server.check_banned_clients().await;
                }
            }
        })
    }

    async fn check_banned_clients(&self) {
        let now = Utc::now();
        let lapsed: Vec<String> = self
            .inner
            .bans
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();
        for key in lapsed {
            self.inner.bans.remove(&key);
            if let Err(e) = self.inner.ban_store.remove_ban_record(&key).await {
                self.fire_error(None, &e);
            }
        }

        for connection in self.connections() {
            let verify = connection.components().get_or_add::<Verify>();
            let key = self.ban_key(&connection);
            let cached = Self::user_id(&connection).and_then(|uid| self.banned_until(&uid));
            if let Some(until) = cached {
                verify.ban(until);
            }
            if verify.is_banned() {
                info!(connection = connection.id(), user = %key, "disconnecting banned client");
                self.disconnect_client(&connection).await;
            } else if verify.ban_expired() {
                verify.unban();
                if let Err(e) = self.inner.ban_store.remove_ban_record(&key).await {
                    self.fire_error(Some(&connection), &e);
                }
            }
        }
    }

    // ── Liveness ─────────────────────────────────────────────────

    /// Periodically drop idle connections, and answer heartbeats.
    pub fn begin_verify_client(&self, interval: Duration) -> Result<String, TetherError> {
        let weak = self.downgrade();
        self.inner.systems.events.add_listener_with_id(
            ServerEvent::DataReceived.name(),
            LISTENER_HEARTBEAT,
            {
                let weak = weak.clone();
                move |event| {
                    let weak = weak.clone();
                    async move {
                        if let Some(server) = weak.upgrade() {
                            server.answer_heartbeat(event).await;
                        }
                    }
                }
            },
        );
        self.inner.systems.tasks.add_task(TASK_VERIFY_CLIENT, interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(server) = weak.upgrade() {
                    server.verify_clients().await;
                }
            }
        })
    }

    async fn answer_heartbeat(&self, event: NetworkEvent) {
        let (Some(connection), Some(packet)) = (&event.connection, &event.packet) else {
            return;
        };
        if !packet.is_type(&PacketType::Heartbeat) {
            return;
        }
        connection.components().get_or_add::<Verify>().touch();
        self.fire_detached(ServerEvent::VerifyClient, event.clone());
        if let Err(e) = self.send_reply(connection, packet, Packet::pong()).await {
            debug!(connection = connection.id(), error = %e, "heartbeat reply not delivered");
        }
    }

    async fn verify_clients(&self) {
        let idle_timeout = *self.inner.idle_timeout.read();
        for connection in self.connections() {
            let Some(verify) = connection.components().get::<Verify>() else {
                self.disconnect_client(&connection).await;
                continue;
            };
            let idle = verify.idle_for();
            if idle > idle_timeout {
                info!(connection = connection.id(), ?idle, "disconnecting idle client");
                self.disconnect_client(&connection).await;
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("phase", &self.phase())
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ── Loops ────────────────────────────────────────────────────────

async fn accept_loop(weak: WeakServer, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let Some(server) = weak.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => server.admit(stream, peer),
            Err(e) => {
                server.fire_error(None, &TetherError::from(e));
                drop(server);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop finished");
}

/// End of a ban of `hours` starting at `now`. Lengths beyond
/// `MAX_BAN_HOURS` either way are clamped.
fn ban_deadline(now: DateTime<Utc>, hours: i64) -> Result<DateTime<Utc>, TetherError> {
    let hours = hours.clamp(-MAX_BAN_HOURS, MAX_BAN_HOURS);
    TimeDelta::try_hours(hours)
        .and_then(|length| now.checked_add_signed(length))
        .ok_or_else(|| TetherError::Other(format!("ban of {hours}h is out of range")))
}

async fn receive_loop(weak: WeakServer, connection: Connection, mut reader: ConnectionReader) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                let Some(server) = weak.upgrade() else {
                    break;
                };
                if let Some(verify) = connection.components().get::<Verify>() {
                    verify.touch();
                }
                let Some(packet) = server.claim(&connection, &frame) else {
                    continue;
                };
                let job = {
                    let server = server.clone();
                    let connection = connection.clone();
                    async move {
                        server.process(connection, packet, frame).await;
                        Ok::<(), TetherError>(())
                    }
                };
                if server.inner.queue.push_keyed(connection.id(), job).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if !e.is_disconnect() {
                    if let Some(server) = weak.upgrade() {
                        server.fire_error(Some(&connection), &e);
                    }
                }
                break;
            }
        }
    }

    match weak.upgrade() {
        Some(server) => {
            server.disconnect_client(&connection).await;
        }
        None => {
            connection.close().await;
        }
    }
}
