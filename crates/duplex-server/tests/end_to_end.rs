//! End-to-end exercises over real listeners: echo request/response,
//! fire-and-forget, the authentication gate, broadcast fan-out, and the
//! TLS and WebSocket listener flavors.

use std::path::PathBuf;
use std::time::Duration;

use ciborium::value::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use duplex_client::{ClientConfig, DuplexClient, TlsClientOptions};
use duplex_core::{ConnectionStatus, DuplexError, EventKind, Message};
use duplex_server::{AuthContext, DuplexServer, ServerConfig, TransportKind};

fn tcp_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> DuplexServer {
    let server = DuplexServer::bind(config).await.unwrap();
    server.start();
    server
}

async fn connect_tcp(server: &DuplexServer) -> DuplexClient {
    let addr = server.local_addr().unwrap();
    let client = DuplexClient::tcp(addr.to_string(), ClientConfig::default());
    client.connect().await.unwrap();
    wait_for_identity(&client).await;
    client
}

/// The server assigns the identity right after accept; wait until it lands.
async fn wait_for_identity(client: &DuplexClient) {
    for _ in 0..400 {
        if !client.client_id().is_nil() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("client identity was never assigned");
}

#[tokio::test]
async fn echo_request_round_trip() {
    let server = start_server(tcp_config()).await;
    server.handle("echo", |message: Message| async move {
        Ok(Some(Message::reply(&message, message.data.clone())))
    });

    let client = connect_tcp(&server).await;
    let request = Message::new("echo", Some(Value::Text("hi".into())));
    let request_id = request.message_id;
    let reply = client.send_request(request).await.unwrap();

    assert_eq!(reply.channel, Message::reply_channel("echo", request_id));
    assert_eq!(reply.reply_to, Some(request_id));
    assert_eq!(reply.data, Some(Value::Text("hi".into())));
    assert_eq!(reply.sender_id, Uuid::nil());
    assert_eq!(reply.target_id, Some(client.client_id()));

    server.shutdown().await;
}

#[tokio::test]
async fn fire_and_forget_never_replies() {
    let server = start_server(tcp_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    server.observe("log", move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok(())
        }
    });

    let client = connect_tcp(&server).await;
    let payload = Value::Map(vec![
        (Value::Text("level".into()), Value::Text("info".into())),
        (Value::Text("msg".into()), Value::Text("x".into())),
    ]);
    client
        .send(Message::new("log", Some(payload.clone())))
        .await
        .unwrap();

    let received = rx.recv().await.unwrap();
    assert_eq!(received.data, Some(payload));
    assert_eq!(received.sender_id, client.client_id());
    // No reply channel is ever exercised on the client.
    assert_eq!(
        client
            .socket()
            .handler_count(&Message::reply_channel("log", received.message_id)),
        0
    );

    server.shutdown().await;
}

#[tokio::test]
async fn anonymous_traffic_is_dropped_until_authenticated() {
    let server = start_server(ServerConfig {
        disallow_anonymous: true,
        ..tcp_config()
    })
    .await;
    server.set_auth_handler(|id, key, _scope| async move {
        if key == "k" {
            AuthContext::granted(id, ["admin"], None::<String>)
        } else {
            AuthContext::denied(true)
        }
    });

    let guard_server = server.clone();
    server.handle("secure", move |message: Message| {
        let server = guard_server.clone();
        async move {
            let caller = server
                .client(message.sender_id)
                .ok_or_else(|| DuplexError::Handler("unknown caller".into()))?;
            caller.require_role("admin", None)?;
            Ok(Some(Message::reply(
                &message,
                Some(Value::Text("granted".into())),
            )))
        }
    });

    let client = connect_tcp(&server).await;

    // Before auth the gate silently drops the request; the client times out.
    let early = client
        .send_request_timeout(Message::new("secure", None), Duration::from_millis(200))
        .await;
    assert!(matches!(early, Err(DuplexError::Timeout)));

    assert!(client.authenticate("u", "k", None).await.unwrap());

    let reply = client
        .send_request(Message::new("secure", None))
        .await
        .unwrap();
    assert_eq!(reply.data, Some(Value::Text("granted".into())));

    server.shutdown().await;
}

#[tokio::test]
async fn auth_failure_with_disallowed_connection_closes() {
    let server = start_server(tcp_config()).await;
    server.set_auth_handler(|_id, _key, _scope| async move { AuthContext::denied(false) });

    let client = connect_tcp(&server).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionStatus>();
    client.on_event_typed::<ConnectionStatus, _, _>(
        EventKind::ConnectionStatusChanged,
        move |status| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(status);
            }
        },
    );

    let verdict = client.authenticate("u", "bad", None).await.unwrap();
    assert!(!verdict);

    // The server delivers the failure reply, then drops the connection.
    let disconnected = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(status) = rx.recv().await {
            if status == ConnectionStatus::Disconnected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(disconnected);
}

#[tokio::test]
async fn request_timeout_when_nothing_answers() {
    let server = start_server(tcp_config()).await;
    let client = connect_tcp(&server).await;

    let request = Message::new("slow", None);
    let reply_channel = Message::reply_channel("slow", request.message_id);
    let started = std::time::Instant::now();
    let result = client
        .send_request_timeout(request, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(DuplexError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.socket().handler_count(&reply_channel), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client_once() {
    let server = start_server(tcp_config()).await;
    let c1 = connect_tcp(&server).await;
    let c2 = connect_tcp(&server).await;
    assert_eq!(server.client_count(), 2);

    let (tx1, mut rx1) = mpsc::unbounded_channel::<Message>();
    c1.observe("news", move |message: Message| {
        let tx = tx1.clone();
        async move {
            let _ = tx.send(message);
            Ok(())
        }
    });
    let (tx2, mut rx2) = mpsc::unbounded_channel::<Message>();
    c2.observe("news", move |message: Message| {
        let tx = tx2.clone();
        async move {
            let _ = tx.send(message);
            Ok(())
        }
    });

    server
        .broadcast(Message::new("news", Some(Value::Integer(42i64.into()))))
        .await;

    let m1 = rx1.recv().await.unwrap();
    let m2 = rx2.recv().await.unwrap();
    for m in [&m1, &m2] {
        assert_eq!(m.data, Some(Value::Integer(42i64.into())));
        assert_eq!(m.sender_id, Uuid::nil());
    }
    // Exactly one copy each.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_sends_never_interleave_frames() {
    let server = start_server(tcp_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<i128>();
    server.observe("burst", move |message: Message| {
        let tx = tx.clone();
        async move {
            let n = message
                .data
                .as_ref()
                .and_then(|v| v.as_array())
                .and_then(|slots| slots.first())
                .and_then(|v| v.as_integer());
            if let Some(n) = n {
                let _ = tx.send(i128::from(n));
            }
            Ok(())
        }
    });

    let client = connect_tcp(&server).await;
    let big = "x".repeat(64 * 1024);
    let m1 = Message::new(
        "burst",
        Some(Value::Array(vec![
            Value::Integer(1i64.into()),
            Value::Text(big.clone()),
        ])),
    );
    let m2 = Message::new(
        "burst",
        Some(Value::Array(vec![
            Value::Integer(2i64.into()),
            Value::Text(big),
        ])),
    );

    // Large payloads written concurrently; the peer must decode both
    // cleanly, in some order, with no framing error in between.
    let (r1, r2) = tokio::join!(client.send(m1), client.send(m2));
    r1.unwrap();
    r2.unwrap();

    let a = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let mut seen = [a, b];
    seen.sort_unstable();
    assert_eq!(seen, [1, 2]);

    server.shutdown().await;
}

#[tokio::test]
async fn client_id_event_carries_assigned_identity() {
    let server = start_server(tcp_config()).await;
    let addr = server.local_addr().unwrap();
    let client = DuplexClient::tcp(addr.to_string(), ClientConfig::default());

    let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();
    client.on_event_typed::<Uuid, _, _>(EventKind::ClientIdReceived, move |id| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(id);
        }
    });

    client.connect().await.unwrap();
    let assigned = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!assigned.is_nil());
    assert_eq!(assigned, client.client_id());
    assert!(server.client(assigned).is_some());

    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_removes_registry_entry() {
    let server = start_server(tcp_config()).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();
    server.on_client_disconnected(move |id| {
        let _ = tx.send(id);
    });

    let client = connect_tcp(&server).await;
    let id = client.client_id();
    assert_eq!(server.client_count(), 1);

    client.disconnect().await;
    let gone = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone, id);
    assert_eq!(server.client_count(), 0);

    server.shutdown().await;
}

// ── Listener flavors ────────────────────────────────────────────────────

fn write_self_signed_cert() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("duplex-test-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    let mut params =
        rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "duplex test cert");
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (cert_path, key_path)
}

#[tokio::test]
async fn tls_echo_round_trip() {
    let (cert_path, key_path) = write_self_signed_cert();
    let server = start_server(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        transport: TransportKind::Tls,
        cert_path: Some(cert_path),
        key_path: Some(key_path),
        ..Default::default()
    })
    .await;
    server.handle("echo", |message: Message| async move {
        Ok(Some(Message::reply(&message, message.data.clone())))
    });

    let addr = server.local_addr().unwrap();
    let client = DuplexClient::tls(
        addr.to_string(),
        TlsClientOptions::insecure("localhost"),
        ClientConfig::default(),
    )
    .unwrap();
    client.connect().await.unwrap();
    wait_for_identity(&client).await;

    let reply = client
        .send_request(Message::new("echo", Some(Value::Text("over tls".into()))))
        .await
        .unwrap();
    assert_eq!(reply.data, Some(Value::Text("over tls".into())));

    server.shutdown().await;
}

#[tokio::test]
async fn websocket_echo_round_trip() {
    let server = start_server(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        transport: TransportKind::WebSocket,
        ..Default::default()
    })
    .await;
    server.handle("echo", |message: Message| async move {
        Ok(Some(Message::reply(&message, message.data.clone())))
    });

    let addr = server.local_addr().unwrap();
    let client = DuplexClient::websocket(
        &format!("ws://{addr}/"),
        None,
        ClientConfig::default(),
    )
    .unwrap();
    client.connect().await.unwrap();
    wait_for_identity(&client).await;

    let reply = client
        .send_request(Message::new("echo", Some(Value::Text("over ws".into()))))
        .await
        .unwrap();
    assert_eq!(reply.data, Some(Value::Text("over ws".into())));

    server.shutdown().await;
}

#[tokio::test]
async fn websocket_listener_rejects_plain_http_with_400() {
    let server = start_server(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        transport: TransportKind::WebSocket,
        ..Default::default()
    })
    .await;
    let addr = server.local_addr().unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let response = String::from_utf8_lossy(&response);
    assert!(
        response.starts_with("HTTP/1.1 400"),
        "unexpected response: {response}"
    );

    server.shutdown().await;
}
