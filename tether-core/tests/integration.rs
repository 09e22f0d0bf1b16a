//! Integration tests: a real server and real clients on localhost,
//! exercising heartbeats, commands, correlation, broadcast, bans, idle
//! checks, admission and shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tether_core::message::body_keys;
use tether_core::{
    AdmissionPolicy, BanStore, Client, ClientComponent, ClientConfig, ClientEvent, Connection, FnCommand,
    MemoryBanStore, NetworkEvent, Packet, PacketType, PermissionLevel, Server, ServerConfig,
    ServerEvent, TetherError,
};

// ── Helpers ──────────────────────────────────────────────────────

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn server_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.queue.max_channels = 2;
    config
}

async fn start_server(config: ServerConfig) -> (Server, u16) {
    let server = Server::new(config);
    let addr = server.start("127.0.0.1", 0).await.unwrap();
    (server, addr.port())
}

async fn connect(port: u16) -> Client {
    let client = Client::new(ClientConfig::default());
    client.connect("127.0.0.1", port).await.unwrap();
    client
}

/// Poll `check` every 10ms for up to three seconds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn counter() -> (
    Arc<AtomicUsize>,
    impl Fn(NetworkEvent) -> futures::future::Ready<()> + Send + Sync + 'static,
) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = Arc::clone(&count);
    let handler = move |_: NetworkEvent| {
        handle.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(())
    };
    (count, handler)
}

async fn only_connection(server: &Server) -> Connection {
    assert!(eventually(|| server.connection_count() == 1).await);
    server.connections().pop().unwrap()
}

// ── Heartbeat ────────────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_is_answered_with_pong() {
    let (server, port) = start_server(server_config()).await;
    server.begin_verify_client(Duration::from_secs(60)).unwrap();
    let (verified, on_verify) = counter();
    server.on(ServerEvent::VerifyClient, on_verify);

    let client = connect(port).await;
    let reply = client.request(Packet::heartbeat(), WAIT).await.unwrap();

    assert!(reply.is_type(&PacketType::Heartbeat));
    assert_eq!(reply.body_str(body_keys::HEARTBEAT_MESSAGE), Some("pong"));
    assert!(reply.request_id().is_some());
    assert_eq!(client.pending_request_count(), 0);
    assert!(eventually(|| verified.load(Ordering::SeqCst) == 1).await);

    client.disconnect().await;
    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn encrypted_peers_share_a_key() {
    let mut config = server_config();
    config.security.key = "hunter2".into();
    let (server, port) = start_server(config).await;
    server.begin_verify_client(Duration::from_secs(60)).unwrap();

    let mut good = ClientConfig::default();
    good.security.key = "hunter2".into();
    let client = Client::new(good);
    client.connect("127.0.0.1", port).await.unwrap();
    let reply = client.request(Packet::heartbeat(), WAIT).await.unwrap();
    assert_eq!(reply.body_str(body_keys::HEARTBEAT_MESSAGE), Some("pong"));

    // A client with the wrong key is never understood.
    let mut bad = ClientConfig::default();
    bad.security.key = "letmein".into();
    let stranger = Client::new(bad);
    stranger.connect("127.0.0.1", port).await.unwrap();
    let result = stranger
        .send_async(Packet::heartbeat(), Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(TetherError::Timeout(_))));
    assert!(stranger.is_connected());

    server.stop(Duration::from_secs(1)).await;
}

// ── Commands ─────────────────────────────────────────────────────

#[tokio::test]
async fn command_round_trip() {
    let (server, port) = start_server(server_config()).await;
    server.commands().register_fn("add", |args, _| {
        Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    server.commands().register_command(
        "shutdown",
        FnCommand::new(|_: &[Value], _: Option<&Connection>| Ok(Value::Bool(true))).with_permission(PermissionLevel::Admin),
    );
    server.begin_receive_command();
    let (executed, on_executed) = counter();
    server.on(ServerEvent::CommandExecuted, on_executed);

    let client = connect(port).await;

    let reply = client
        .request(Packet::command("add", vec![json!(2), json!(40)]), WAIT)
        .await
        .unwrap();
    assert!(reply.is_type(&PacketType::CommandResponse));
    assert_eq!(reply.body_str(body_keys::MESSAGE), Some(""));
    assert_eq!(reply.body_value(body_keys::COMMAND_RESPONSE), Some(&json!(42)));

    let denied = client
        .request(Packet::command("shutdown", Vec::new()), WAIT)
        .await
        .unwrap();
    assert_ne!(denied.body_str(body_keys::MESSAGE), Some(""));
    assert_eq!(denied.body_value(body_keys::COMMAND_RESPONSE), Some(&Value::Null));

    // Unknown commands are logged, never answered.
    let unknown = client
        .send_async(Packet::command("nope", Vec::new()), Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(unknown, Err(TetherError::Timeout(_))));
    assert_eq!(client.pending_request_count(), 0);
    assert!(eventually(|| executed.load(Ordering::SeqCst) == 2).await);

    server.stop(Duration::from_secs(1)).await;
}

// ── Correlation ──────────────────────────────────────────────────

#[tokio::test]
async fn server_requests_are_correlated() {
    let (server, port) = start_server(server_config()).await;
    let client = connect(port).await;
    let responder = client.clone();
    client.on(ClientEvent::Received, move |event: NetworkEvent| {
        let responder = responder.clone();
        async move {
            let Some(packet) = event.packet else { return };
            if packet.is_type(&PacketType::from("echo")) {
                let text = packet.body_value("text").cloned().unwrap_or_default();
                let reply = Packet::of_type(PacketType::from("echo"))
                    .with_body("text", text)
                    .reply_to(&packet);
                let _ = responder.send(&reply).await;
            }
        }
    });

    let connection = only_connection(&server).await;
    let request = Packet::of_type(PacketType::from("echo")).with_body("text", "hello");
    let reply = server.request(&connection, request, WAIT).await.unwrap();
    assert_eq!(reply.body_str("text"), Some("hello"));

    let silent = Packet::of_type(PacketType::from("ignored"));
    let result = server
        .send_async(&connection, silent, Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(TetherError::Timeout(_))));
    assert_eq!(server.pending_request_count(), 0);

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn data_handler_can_await_a_reply_on_its_own_connection() {
    let (server, port) = start_server(server_config()).await;
    let client = connect(port).await;
    let responder = client.clone();
    client.on(ClientEvent::Received, move |event: NetworkEvent| {
        let responder = responder.clone();
        async move {
            let Some(packet) = event.packet else { return };
            if packet.is_type(&PacketType::from("echo")) {
                let text = packet.body_value("text").cloned().unwrap_or_default();
                let reply = Packet::of_type(PacketType::from("echo"))
                    .with_body("text", text)
                    .reply_to(&packet);
                let _ = responder.send(&reply).await;
            }
        }
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let asker = server.clone();
    server.on(ServerEvent::DataReceived, move |event: NetworkEvent| {
        let asker = asker.clone();
        let tx = tx.clone();
        async move {
            let (Some(connection), Some(packet)) = (event.connection, event.packet) else {
                return;
            };
            if !packet.is_type(&PacketType::from("hello")) {
                return;
            }
            let question = Packet::of_type(PacketType::from("echo")).with_body("text", "who?");
            let _ = tx.send(asker.request(&connection, question, WAIT).await);
        }
    });

    client
        .send(&Packet::of_type(PacketType::from("hello")))
        .await
        .unwrap();
    let answer = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(answer.body_str("text"), Some("who?"));
    assert_eq!(server.pending_request_count(), 0);

    server.stop(Duration::from_secs(1)).await;
}

// ── Broadcast ────────────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_everyone_and_drops_failures() {
    let (server, port) = start_server(server_config()).await;
    let (disconnected, on_disconnect) = counter();
    server.on(ServerEvent::ClientDisconnected, on_disconnect);

    let first = connect(port).await;
    let second = connect(port).await;
    let (received, on_received) = counter();
    first.on(ClientEvent::Received, on_received);
    assert!(eventually(|| server.connection_count() == 2).await);

    let report = server.broadcast(&Packet::of_type(PacketType::from("news"))).await.unwrap();
    assert_eq!((report.delivered, report.failed), (2, 0));
    assert!(eventually(|| received.load(Ordering::SeqCst) == 1).await);

    // Close one socket server-side without removing it from the live set.
    let broken = server.connections().pop().unwrap();
    let rented = server.buffer_pool().rented();
    broken.close().await;
    let report = server.broadcast(&Packet::of_type(PacketType::from("news"))).await.unwrap();
    assert_eq!(report.delivered + report.failed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(server.buffer_pool().rented(), rented + 1);

    assert!(eventually(|| server.connection_count() == 1).await);
    assert!(eventually(|| disconnected.load(Ordering::SeqCst) == 1).await);
    // The broadcast frame is back; only the live reader's read buffer is out.
    assert!(eventually(|| server.buffer_pool().outstanding() == 1).await);

    drop((first, second));
    server.stop(Duration::from_secs(1)).await;
}

// ── Bans ─────────────────────────────────────────────────────────

#[tokio::test]
async fn banned_user_is_disconnected_and_expired_ban_is_cleared() {
    let store = Arc::new(MemoryBanStore::new());
    let server = Server::with_ban_store(server_config(), store.clone());
    let port = server.start("127.0.0.1", 0).await.unwrap().port();

    let banned = connect(port).await;
    let connection = only_connection(&server).await;
    connection
        .components()
        .add_instance(ClientComponent::new("u-1", "mallory"))
        .unwrap();
    let until = server.ban_client(&connection, 2).await.unwrap();
    assert_eq!(server.banned_until("u-1"), Some(until));
    assert_eq!(server.connection_count(), 0);
    assert!(eventually(|| !banned.is_connected()).await);
    assert!(store.load_ban_records().await.unwrap().contains_key("u-1"));

    server.begin_check_banned_client(Duration::from_millis(50)).unwrap();

    // A lapsed ban is lifted without disconnecting.
    let lapsed = connect(port).await;
    let connection = only_connection(&server).await;
    connection
        .components()
        .add_instance(ClientComponent::new("u-2", "bob"))
        .unwrap();
    server.ban_client(&connection, 0).await.unwrap();
    assert!(eventually(|| server.banned_until("u-2").is_none()).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(lapsed.is_connected());

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn banning_one_anonymous_peer_spares_its_neighbours() {
    let (server, port) = start_server(server_config()).await;
    server.begin_check_banned_client(Duration::from_millis(50)).unwrap();
    let target = connect(port).await;
    let target_connection = only_connection(&server).await;
    let neighbour = connect(port).await;
    assert!(eventually(|| server.connection_count() == 2).await);

    server.ban_client(&target_connection, 1).await.unwrap();
    assert!(eventually(|| !target.is_connected()).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(neighbour.is_connected());
    assert!(server.connections()[0].id() != target_connection.id());

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn permanent_ban_is_clamped_not_fatal() {
    let (server, port) = start_server(server_config()).await;
    let client = connect(port).await;
    let connection = only_connection(&server).await;
    connection
        .components()
        .add_instance(ClientComponent::new("u-3", "eve"))
        .unwrap();

    let until = server.ban_client(&connection, 10_000_000_000).await.unwrap();
    assert!(until.timestamp() > chrono::Utc::now().timestamp());
    assert_eq!(server.banned_until("u-3"), Some(until));
    assert!(eventually(|| !client.is_connected()).await);
    assert_eq!(server.connection_count(), 0);

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ip_ban_refuses_reconnect() {
    let (server, port) = start_server(server_config()).await;
    let client = connect(port).await;
    let connection = only_connection(&server).await;
    server.ban_client(&connection, 1).await.unwrap();
    assert!(server.banned_until("127.0.0.1").is_some());
    assert!(!server.disconnect_client(&connection).await);
    assert!(eventually(|| !client.is_connected()).await);

    let retry = connect(port).await;
    assert!(eventually(|| !retry.is_connected()).await);
    assert_eq!(server.connection_count(), 0);

    server.unban("127.0.0.1").await.unwrap();
    let welcome = connect(port).await;
    only_connection(&server).await;
    assert!(welcome.is_connected());

    server.stop(Duration::from_secs(1)).await;
}

// ── Liveness ─────────────────────────────────────────────────────

#[tokio::test]
async fn idle_client_is_disconnected_once() {
    let (server, port) = start_server(server_config()).await;
    server.set_idle_timeout(Duration::from_millis(100));
    let (disconnected, on_disconnect) = counter();
    server.on(ServerEvent::ClientDisconnected, on_disconnect);
    server.begin_verify_client(Duration::from_millis(40)).unwrap();

    let client = connect(port).await;
    assert!(eventually(|| disconnected.load(Ordering::SeqCst) == 1).await);
    assert_eq!(server.connection_count(), 0);
    assert!(eventually(|| !client.is_connected()).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(disconnected.load(Ordering::SeqCst), 1);

    server.stop(Duration::from_secs(1)).await;
}

// ── Admission ────────────────────────────────────────────────────

#[tokio::test]
async fn connection_limit_is_enforced() {
    let (server, port) = start_server(server_config()).await;
    server.set_admission_policy(AdmissionPolicy::new().with_max_connections(1));
    let (connected, on_connect) = counter();
    server.on(ServerEvent::ClientConnected, on_connect);

    let first = connect(port).await;
    only_connection(&server).await;
    let second = connect(port).await;
    assert!(eventually(|| !second.is_connected()).await);
    assert!(first.is_connected());
    assert_eq!(server.connection_count(), 1);
    assert!(eventually(|| connected.load(Ordering::SeqCst) == 1).await);

    server.stop(Duration::from_secs(1)).await;
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn stop_disconnects_every_client() {
    let (server, port) = start_server(server_config()).await;
    let (disconnected, on_disconnect) = counter();
    server.on(ServerEvent::ClientDisconnected, on_disconnect);

    let clients = vec![connect(port).await, connect(port).await, connect(port).await];
    assert!(eventually(|| server.connection_count() == 3).await);

    let report = server.stop(Duration::from_secs(1)).await;
    assert_eq!(report.abandoned, 0);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(disconnected.load(Ordering::SeqCst), 3);
    for client in &clients {
        assert!(eventually(|| !client.is_connected()).await);
    }

    let late = Client::new(ClientConfig::default());
    assert!(late.connect("127.0.0.1", port).await.is_err());
}

#[tokio::test]
async fn http_fallback_returns_none_without_a_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Client::new(ClientConfig::default());
    let url = format!("http://127.0.0.1:{port}/packet");
    assert!(client.try_send_get(&url, "").await.is_none());
}

/// Serve `body` as a plain HTTP/1.1 200 response to every request.
async fn serve_http(body: String) -> u16 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut chunk = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&chunk[..n]),
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

#[tokio::test]
async fn http_fallback_unpacks_a_served_packet() {
    let packet = Packet::of_type(PacketType::from("status")).with_body("text", "ready");
    let port = serve_http(packet.pack_base64("k1").unwrap()).await;
    let url = format!("http://127.0.0.1:{port}/packet");
    let client = Client::new(ClientConfig::default());

    let fetched = client.try_send_get(&url, "k1").await.unwrap();
    assert!(fetched.is_type(&PacketType::from("status")));
    assert_eq!(fetched.body_str("text"), Some("ready"));

    assert!(client.try_send_get(&url, "k2").await.is_none());
}
