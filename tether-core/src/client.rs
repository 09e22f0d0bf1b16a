//! The tether client: one connection, one receive loop, correlated
//! requests, and an HTTP GET fallback for packets served over the web.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionReader};
use crate::error::TetherError;
use crate::packet::Packet;
use crate::state::{ClientPhase, PendingRequests};
use crate::systems::{
    ClientEvent, CommandSystem, EventSystem, HandlerId, NetworkEvent, Systems, TaskSystem,
};

/// Cloneable client handle.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Clone)]
struct WeakClient(Weak<ClientInner>);

impl WeakClient {
    fn upgrade(&self) -> Option<Client> {
        self.0.upgrade().map(|inner| Client { inner })
    }
}

struct ClientInner {
    config: ClientConfig,
    systems: Systems,
    phase: Mutex<ClientPhase>,
    connection: Mutex<Option<Connection>>,
    pending: PendingRequests,
    buffers: BufferPool,
    http: reqwest::Client,
    shutdown: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                systems: Systems::new(),
                phase: Mutex::new(ClientPhase::default()),
                connection: Mutex::new(None),
                pending: PendingRequests::new(),
                buffers: BufferPool::default(),
                http: reqwest::Client::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn downgrade(&self) -> WeakClient {
        WeakClient(Arc::downgrade(&self.inner))
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn key(&self) -> &str {
        &self.inner.config.security.key
    }

    pub fn phase(&self) -> ClientPhase {
        *self.inner.phase.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.lock().clone()
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

    pub fn pending_request_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn on<F, Fut>(&self, event: ClientEvent, handler: F) -> HandlerId
    where
        F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.systems.events.add_listener(event.name(), handler)
    }

    // ── Events ───────────────────────────────────────────────────

    async fn fire(&self, event: ClientEvent, args: NetworkEvent) {
        self.inner.systems.events.push_event(event.name(), args).await;
    }

    fn fire_detached(&self, event: ClientEvent, args: NetworkEvent) {
        if self.inner.systems.events.listener_count(event.name()) == 0 {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move { client.fire(event, args).await });
    }

    fn fire_error(&self, connection: Option<&Connection>, error: &TetherError) {
        warn!(%error, "client error");
        let args = NetworkEvent {
            connection: connection.cloned(),
            message: Some(error.to_string()),
            ..NetworkEvent::default()
        };
        self.fire_detached(ClientEvent::Error, args);
    }

    // ── Connect / disconnect ─────────────────────────────────────

    /// Connect to `ip:port` and start the receive loop.
    pub async fn connect(&self, ip: &str, port: u16) -> Result<Connection, TetherError> {
        self.inner.phase.lock().begin_connect()?;

        let (connection, reader) = match self.open(ip, port).await {
            Ok(pair) => pair,
            Err(e) => {
                let _ = self.inner.phase.lock().fail_connect();
                self.fire_error(None, &e);
                return Err(e);
            }
        };
        self.inner.phase.lock().complete_connect(connection.id())?;
        *self.inner.connection.lock() = Some(connection.clone());
        info!(peer = %connection.peer_addr(), connection = connection.id(), "connected");

        self.fire(ClientEvent::Connected, NetworkEvent::for_connection(&connection))
            .await;
        tokio::spawn(receive_loop(
            self.downgrade(),
            connection.clone(),
            reader,
            self.inner.shutdown.clone(),
        ));
        Ok(connection)
    }

    /// [`Client::connect`] to the configured address.
    pub async fn connect_configured(&self) -> Result<Connection, TetherError> {
        let network = &self.inner.config.network;
        self.connect(&network.ip.clone(), network.port).await
    }

    async fn open(&self, ip: &str, port: u16) -> Result<(Connection, ConnectionReader), TetherError> {
        let attempt = TcpStream::connect((ip, port));
        let stream = match self.inner.config.network.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, attempt).await.map_err(|_| {
                io::Error::new(io::ErrorKind::TimedOut, format!("connect timed out after {limit:?}"))
            })??,
            None => attempt.await?,
        };
        Connection::from_stream(stream, self.inner.buffers.clone())
    }

    /// Close the live connection. Returns `false` when there was none.
    pub async fn disconnect(&self) -> bool {
        match self.connection() {
            Some(connection) => self.disconnect_connection(&connection).await,
            None => false,
        }
    }

    /// Close `connection`; only the first call per connection lifetime
    /// fires `OnDisconnected`.
    async fn disconnect_connection(&self, connection: &Connection) -> bool {
        let first = self.inner.phase.lock().disconnect(connection.id());
        connection.close().await;
        if !first {
            return false;
        }
        {
            let mut live = self.inner.connection.lock();
            if live.as_ref().is_some_and(|c| c.id() == connection.id()) {
                *live = None;
            }
        }
        let cancelled = self.inner.pending.cancel_all();
        info!(connection = connection.id(), cancelled, "disconnected");
        self.fire(ClientEvent::Disconnected, NetworkEvent::for_connection(connection))
            .await;
        true
    }

    // ── Receiving ────────────────────────────────────────────────

    async fn process(&self, connection: &Connection, frame: Bytes) {
        let packet = match Packet::unpack(&frame, self.key()) {
            Ok(packet) => packet,
            Err(e) => {
                self.fire_error(Some(connection), &e);
                return;
            }
        };
        if let Some(request_id) = packet.request_id() {
            if self.inner.pending.complete(request_id, frame.clone()) {
                return;
            }
        }
        // Detached so a handler may itself await a reply on this connection.
        self.fire_detached(
            ClientEvent::Received,
            NetworkEvent::for_connection(connection)
                .with_packet(Arc::new(packet))
                .with_raw(frame),
        );
    }

    // ── Sending ──────────────────────────────────────────────────

    pub async fn send(&self, packet: &Packet) -> Result<(), TetherError> {
        let connection = self.connection().ok_or(TetherError::NotConnected)?;
        let payload = packet.pack(self.key())?;
        match connection.write_frame(&payload, &self.inner.buffers).await {
            Ok(()) => {
                self.fire_detached(
                    ClientEvent::DataSent,
                    NetworkEvent::for_connection(&connection).with_raw(payload),
                );
                Ok(())
            }
            Err(e) => {
                self.fire_error(Some(&connection), &e);
                if e.is_disconnect() {
                    self.disconnect_connection(&connection).await;
                }
                Err(e)
            }
        }
    }

    /// Send `packet` under a fresh `RequestID` and wait for the reply's raw
    /// bytes. `None` waits until the reply arrives or the connection drops.
    pub async fn send_async(
        &self,
        mut packet: Packet,
        timeout: Option<Duration>,
    ) -> Result<Bytes, TetherError> {
        let connection = self.connection().ok_or(TetherError::NotConnected)?;
        let request_id = packet.assign_request_id();
        let waiter = self.inner.pending.register(&request_id);
        self.send(&packet).await?;
        tokio::select! {
            reply = waiter.wait(timeout) => reply,
            _ = connection.closed() => Err(TetherError::ConnectionClosed),
        }
    }

    /// [`Client::send_async`], unpacking the reply.
    pub async fn request(&self, packet: Packet, timeout: Option<Duration>) -> Result<Packet, TetherError> {
        let reply = self.send_async(packet, timeout).await?;
        Packet::unpack(&reply, self.key())
    }

    // ── HTTP fallback ────────────────────────────────────────────

    /// GET `url` and decode the body as a base64 packet sealed with `key`.
    ///
    /// Every failure is logged and yields `None`.
    pub async fn try_send_get(&self, url: &str, key: &str) -> Option<Packet> {
        let response = match self
            .inner
            .http
            .get(url)
            .timeout(self.inner.config.network.http_timeout())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(url, error = %e, "http request failed");
                return None;
            }
        };
        let status = response.status();
        if !status.is_success() {
            debug!(url, %status, "http request returned an error status");
            return None;
        }
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                debug!(url, error = %e, "http body unreadable");
                return None;
            }
        };
        if text.trim().is_empty() {
            debug!(url, "http response was empty");
            return None;
        }
        match Packet::unpack_base64(&text, key) {
            Ok(packet) => Some(packet),
            Err(e) => {
                debug!(url, error = %e, "http response is not a packet");
                None
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("phase", &self.phase()).finish()
    }
}

async fn receive_loop(
    weak: WeakClient,
    connection: Connection,
    mut reader: ConnectionReader,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next_frame() => next,
        };
        match next {
            Ok(Some(frame)) => {
                let Some(client) = weak.upgrade() else {
                    break;
                };
                client.process(&connection, frame).await;
            }
            Ok(None) => break,
            Err(e) => {
                if !e.is_disconnect() {
                    if let Some(client) = weak.upgrade() {
                        client.fire_error(Some(&connection), &e);
                    }
                }
                break;
            }
        }
    }

    match weak.upgrade() {
        Some(client) => {
            client.disconnect_connection(&connection).await;
        }
        None => {
            connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    async fn echo_peer() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn replies_complete_requests_and_the_rest_are_events() {
        let (listener, port) = echo_peer().await;
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            framed
                .send(Packet::heartbeat().pack("").unwrap())
                .await
                .unwrap();
            let frame = framed.next().await.unwrap().unwrap();
            let request = Packet::unpack(&frame, "").unwrap();
            let reply = Packet::pong().reply_to(&request);
            framed.send(reply.pack("").unwrap()).await.unwrap();
            // Hold the socket until the client hangs up.
            let _ = framed.next().await;
        });

        let client = Client::new(ClientConfig::default());
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        client.on(ClientEvent::Received, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        client.connect("127.0.0.1", port).await.unwrap();
        assert!(client.is_connected());
        let reply = client
            .request(Packet::heartbeat(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply.body_str("message"), Some("pong"));
        assert_eq!(client.pending_request_count(), 0);

        assert!(client.disconnect().await);
        assert!(!client.disconnect().await);
        assert_eq!(client.phase(), ClientPhase::Disconnected);
        peer.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_fires_once_when_peer_hangs_up() {
        let (listener, port) = echo_peer().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = Client::new(ClientConfig::default());
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disconnects);
        client.on(ClientEvent::Disconnected, move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        client.connect("127.0.0.1", port).await.unwrap();
        for _ in 0..100 {
            if disconnects.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_connected());
        assert!(!client.disconnect().await);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert!(matches!(
            client.send(&Packet::heartbeat()).await,
            Err(TetherError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let (listener, port) = echo_peer().await;
        drop(listener);

        let client = Client::new(ClientConfig::default());
        let result = client.connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(TetherError::Connection(_))));
        assert_eq!(client.phase(), ClientPhase::Disconnected);
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let (listener, port) = echo_peer().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            while let Some(Ok(_)) = framed.next().await {}
        });

        let client = Client::new(ClientConfig::default());
        client.connect("127.0.0.1", port).await.unwrap();
        let result = client
            .send_async(Packet::heartbeat(), Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(TetherError::Timeout(_))));
        assert_eq!(client.pending_request_count(), 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn http_fallback_yields_none_on_failure() {
        let (listener, port) = echo_peer().await;
        drop(listener);
        let client = Client::new(ClientConfig::default());
        let url = format!("http://127.0.0.1:{port}/packet");
        assert!(client.try_send_get(&url, "").await.is_none());
        assert!(client.try_send_get("not a url", "").await.is_none());
    }
}
