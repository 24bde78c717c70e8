//! End-to-end tests: a real `ChatServer` on an ephemeral port with real
//! client sessions: join, relay, capacity refusal, leave and reconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nyaya_chat::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(3);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server(config: ServerConfig) -> TestServer {
    let server = ChatServer::bind(ServerConfig { port: 0, ..config }).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.run_until(async {
        let _ = rx.await;
    }));
    TestServer {
        addr,
        registry,
        _shutdown: tx,
    }
}

async fn start(capacity: usize) -> TestServer {
    start_server(ServerConfig {
        capacity,
        handshake_timeout_ms: 300,
        ..ServerConfig::default()
    })
    .await
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..ClientConfig::default()
    }
}

async fn join(addr: SocketAddr, name: &str) -> ClientSession {
    ClientSession::connect(&client_config(addr), name).await.unwrap()
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn texts(session: &ClientSession) -> Vec<String> {
    session.messages().into_iter().map(|m| m.message).collect()
}

fn texts_of(client: &ChatClient) -> Vec<String> {
    client.messages().into_iter().map(|m| m.message).collect()
}

// ---------------------------------------------------------------------------
// Two-party scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_two_party_scenario() {
    let server = start(2).await;

    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let welcome = &alice.messages()[0];
    assert_eq!(welcome.sender, "Server");
    assert_eq!(welcome.message, "Welcome alice! There are 1 user(s) connected.");
    assert_eq!(server.registry.names(), vec!["alice"]);

    let bob = join(server.addr, "bob").await;
    assert!(bob.buffer().wait_for_len(1, WAIT).await);
    assert!(alice.buffer().wait_for_len(2, WAIT).await);
    let bob_welcome = "Welcome bob! There are 2 user(s) connected.";
    assert_eq!(bob.messages()[0].message, bob_welcome);
    assert_eq!(alice.messages()[1].message, bob_welcome);
    assert_eq!(server.registry.names(), vec!["alice", "bob"]);

    assert!(alice.send("hello").await);
    assert!(alice.buffer().wait_for_len(3, WAIT).await);
    assert!(bob.buffer().wait_for_len(2, WAIT).await);
    for got in [&alice.messages()[2], &bob.messages()[1]] {
        assert_eq!(got.sender, "alice");
        assert_eq!(got.message, "hello");
        assert_eq!(got.timestamp.len(), 8);
    }

    // Third participant is turned away; existing sessions untouched.
    let carol = join(server.addr, "carol").await;
    assert!(carol.buffer().wait_for_len(1, WAIT).await);
    assert!(carol.messages()[0].message.starts_with("Server is full"));
    assert!(wait_until(|| !carol.is_connected()).await);
    assert!(!carol.send("let me in").await);
    assert_eq!(server.registry.names(), vec!["alice", "bob"]);
    assert!(alice.is_connected());
    assert!(bob.is_connected());

    bob.disconnect().await;
    assert!(alice.buffer().wait_for_len(4, WAIT).await);
    let leave = &alice.messages()[3];
    assert_eq!(leave.sender, "Server");
    assert_eq!(leave.message, "bob has left the chat!");
    assert!(wait_until(|| server.registry.names() == vec!["alice".to_string()]).await);
}

#[tokio::test]
async fn test_leave_broadcast_exactly_once() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let bob = join(server.addr, "bob").await;
    assert!(alice.buffer().wait_for_len(2, WAIT).await);

    drop(bob);
    assert!(alice.buffer().wait_for_len(3, WAIT).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let leaves = texts(&alice)
        .into_iter()
        .filter(|t| t == "bob has left the chat!")
        .count();
    assert_eq!(leaves, 1);
    assert_eq!(server.registry.len(), 1);
}

#[tokio::test]
async fn test_payload_survives_relay_verbatim() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let bob = join(server.addr, "bob").await;
    assert!(alice.buffer().wait_for_len(2, WAIT).await);
    assert!(bob.buffer().wait_for_len(1, WAIT).await);

    let tricky = "line one\nline two \"quoted\" {braces} § धारा 420 \u{1F600}";
    assert!(bob.send(tricky).await);
    assert!(alice.buffer().wait_for_len(3, WAIT).await);
    assert!(bob.buffer().wait_for_len(2, WAIT).await);
    assert_eq!(alice.messages()[2].message, tricky);
    assert_eq!(bob.messages()[1].message, tricky);
    assert_eq!(alice.messages()[2].sender, "bob");
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let bob = join(server.addr, "bob").await;
    assert!(bob.buffer().wait_for_len(1, WAIT).await);

    for i in 0..20 {
        assert!(alice.send(&format!("msg {}", i)).await);
    }
    assert!(bob.buffer().wait_for_len(21, WAIT).await);
    let relayed: Vec<String> = texts(&bob).into_iter().skip(1).collect();
    let expected: Vec<String> = (0..20).map(|i| format!("msg {}", i)).collect();
    assert_eq!(relayed, expected);
}

// ---------------------------------------------------------------------------
// Capacity and slots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_slot_freed_after_leave_allows_reconnect() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let bob = join(server.addr, "bob").await;
    assert!(alice.buffer().wait_for_len(2, WAIT).await);

    bob.disconnect().await;
    assert!(wait_until(|| server.registry.len() == 1).await);

    let carol = join(server.addr, "carol").await;
    assert!(carol.buffer().wait_for_len(1, WAIT).await);
    assert_eq!(carol.messages()[0].message, "Welcome carol! There are 2 user(s) connected.");
    assert_eq!(server.registry.names(), vec!["alice", "carol"]);
    assert!(alice.buffer().wait_for_len(4, WAIT).await);
    assert_eq!(alice.messages()[3].message, "Welcome carol! There are 2 user(s) connected.");
}

#[tokio::test]
async fn test_stalled_leave_broadcast_does_not_hold_slot() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    let bob = join(server.addr, "bob").await;
    assert!(alice.buffer().wait_for_len(2, WAIT).await);
    assert!(bob.buffer().wait_for_len(1, WAIT).await);

    // Alice's write half stays locked, so bob's leave broadcast stalls on her.
    let alice_session = server.registry.snapshot().remove(0);
    assert_eq!(alice_session.name, "alice");
    let stalled = alice_session.writer().lock().await;

    bob.disconnect().await;
    assert!(wait_until(|| server.registry.names() == vec!["alice".to_string()]).await);

    let carol = join(server.addr, "carol").await;
    assert!(wait_until(|| server.registry.names() == vec!["alice".to_string(), "carol".to_string()]).await);
    assert!(carol.is_connected());

    drop(stalled);
    assert!(carol.buffer().wait_for_len(1, WAIT).await);
    assert_eq!(carol.messages()[0].message, "Welcome carol! There are 2 user(s) connected.");
    assert!(alice.buffer().wait_for_len(4, WAIT).await);
    let tail = texts(&alice)[2..].to_vec();
    assert!(tail.contains(&"bob has left the chat!".to_string()));
    assert!(tail.contains(&"Welcome carol! There are 2 user(s) connected.".to_string()));
}

#[tokio::test]
async fn test_queue_mode_waits_for_free_slot() {
    let server = start_server(ServerConfig {
        capacity: 1,
        refuse_when_full: false,
        ..ServerConfig::default()
    })
    .await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);

    let bob = join(server.addr, "bob").await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(bob.messages().is_empty());
    assert_eq!(server.registry.names(), vec!["alice"]);

    alice.disconnect().await;
    assert!(bob.buffer().wait_for_len(1, WAIT).await);
    assert_eq!(bob.messages()[0].message, "Welcome bob! There are 1 user(s) connected.");
}

#[tokio::test]
async fn test_registry_size_tracks_handshakes() {
    let server = start(3).await;
    let mut sessions = Vec::new();
    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        let s = join(server.addr, name).await;
        assert!(s.buffer().wait_for_len(1, WAIT).await);
        sessions.push(s);
        assert_eq!(server.registry.len(), i + 1);
    }
    assert_eq!(server.registry.names(), vec!["a", "b", "c"]);

    // Every registered name is reachable by a broadcast.
    assert!(sessions[2].send("ping").await);
    for s in &sessions {
        assert!(wait_until(|| texts(s).iter().any(|t| t == "ping")).await);
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_silent_connection_times_out_and_frees_slot() {
    let server = start(1).await;
    let mut raw = TcpStream::connect(server.addr).await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "server should close a silent connection");
    assert!(server.registry.is_empty());

    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    assert_eq!(alice.messages()[0].message, "Welcome alice! There are 1 user(s) connected.");
}

#[tokio::test]
async fn test_empty_username_gets_placeholder() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);

    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(b"{\"username\":\"\"}\n").await.unwrap();
    assert!(alice.buffer().wait_for_len(2, WAIT).await);
    assert_eq!(alice.messages()[1].message, "Welcome User-2! There are 2 user(s) connected.");
    assert_eq!(server.registry.names(), vec!["alice", "User-2"]);
}

#[tokio::test]
async fn test_garbage_frames_do_not_end_session() {
    let server = start(2).await;
    let alice = join(server.addr, "alice").await;
    assert!(alice.buffer().wait_for_len(1, WAIT).await);

    let mut raw = TcpStream::connect(server.addr).await.unwrap();
    raw.write_all(b"{\"username\":\"mallory\"}\nnot json\n{\"message\":").await.unwrap();
    raw.write_all(b"\"split frame\"}\n").await.unwrap();
    assert!(alice.buffer().wait_for_len(3, WAIT).await);
    let relayed = &alice.messages()[2];
    assert_eq!(relayed.sender, "mallory");
    assert_eq!(relayed.message, "split frame");
    assert_eq!(server.registry.len(), 2);
}

// ---------------------------------------------------------------------------
// Client connector
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_marks_disconnected_when_relay_drops() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let _ = stream.read(&mut buf).await;
        // Relay vanishes right after the handshake.
    });

    let mut client = ChatClient::new(client_config(addr));
    assert!(client.connect("alice").await);
    assert_eq!(client.username(), Some("alice"));
    assert!(wait_until(|| !client.is_connected()).await);
    assert!(!client.send("anyone?").await);
    assert!(client.messages().is_empty());
}

#[tokio::test]
async fn test_disconnect_keeps_frames_sent_before_relay_closes() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        // Read until the client half-closes, then answer and close.
        while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
        let farewell = codec::encode(&MessageEnvelope::system("see you")).unwrap();
        stream.write_all(&farewell).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let mut client = ChatClient::new(client_config(addr));
    assert!(client.connect("alice").await);
    client.disconnect().await;
    assert!(!client.is_connected());
    assert_eq!(texts_of(&client), vec!["see you"]);
}

#[tokio::test]
async fn test_chat_client_facade_roundtrip() {
    let server = start(2).await;
    let mut alice = ChatClient::new(client_config(server.addr));
    let mut bob = ChatClient::new(client_config(server.addr));
    assert!(alice.connect("alice").await);
    assert!(alice.buffer().wait_for_len(1, WAIT).await);
    assert!(bob.connect("bob").await);
    assert!(alice.buffer().wait_for_len(2, WAIT).await);

    assert!(bob.send("hi alice").await);
    assert!(alice.buffer().wait_for_len(3, WAIT).await);
    assert_eq!(alice.messages()[2].sender, "bob");

    bob.disconnect().await;
    assert!(!bob.is_connected());
    assert!(!bob.send("gone").await);
    assert!(alice.buffer().wait_for_len(4, WAIT).await);
    assert_eq!(alice.messages()[3].message, "bob has left the chat!");
}
