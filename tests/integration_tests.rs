/// End-to-end tests: real gateway, real backends, real WebSocket clients
mod common;

use common::{
    access_records, access_statuses, gateway_config, log_capture, next_payload, start_gateway,
    wait_until, TEST_SECRET,
};
use futures::SinkExt;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, Connector};
use ws_gateway::config::FrameFormat;
use ws_gateway::server::SessionEntry;
use ws_gateway::{
    AddressCodec, BackendKind, BufferPool, ProxyProtocolVersion, ServerDependencies,
    SessionRegistry,
};

fn encrypted_token(addr: SocketAddr) -> String {
    let token = AddressCodec::new(TEST_SECRET).encrypt(&addr.to_string());
    url::form_urlencoded::byte_serialize(token.as_bytes()).collect()
}

/// A port nothing listens on
async fn closed_port_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_encrypted_token_echo() {
    let echo = common::start_echo_server().await;
    let gateway = start_gateway(gateway_config()).await;

    let url = gateway.ws_url(&format!("/?token={}", encrypted_token(echo)));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    ws.send(Message::binary(b"ping".to_vec())).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"ping"),
        other => panic!("unexpected reply: {:?}", other),
    }

    let registry = gateway.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.count() == 1).await);

    ws.close(None).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || registry.count() == 0).await);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_token_and_text_frames() {
    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.frame_format = FrameFormat::Text;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    ws.send(Message::binary("héllo".as_bytes().to_vec())).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), "héllo"),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_payload_larger_than_buffer() {
    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.buffer_size = 16;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    let mut payload = vec![0u8; 4096];
    rand::rng().fill_bytes(&mut payload);
    ws.send(Message::binary(payload.clone())).await.unwrap();

    let mut received = Vec::new();
    while received.len() < payload.len() {
        match next_payload(&mut ws).await {
            Some(Message::Binary(chunk)) => {
                assert!(chunk.len() <= 16);
                received.extend_from_slice(&chunk);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_custom_token_key_and_split() {
    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.token_key = "addr".to_string();
    config.token_split = Some("|,1".parse().unwrap());
    let gateway = start_gateway(config).await;

    let token = format!("ignored|{}", echo);
    let query: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    let url = gateway.ws_url(&format!("/?addr={}", query));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    ws.send(Message::binary(b"split".to_vec())).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"split"),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_capacity_full_rejects_with_json() {
    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.max_connections = 1;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (_first, _) = connect_async(url.clone()).await.expect("Failed to connect");
    let registry = gateway.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.count() == 1).await);

    let (mut second, _) = connect_async(url).await.expect("Upgrade should still succeed");
    match next_payload(&mut second).await {
        Some(Message::Text(text)) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["error"], "too many connections");
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert!(matches!(
        next_payload(&mut second).await,
        None | Some(Message::Close(_))
    ));
    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn test_injected_registry_is_shared() {
    let echo = common::start_echo_server().await;
    let config = gateway_config();
    let registry = Arc::new(SessionRegistry::new(1));
    let held = SessionEntry::new(
        BackendKind::Stream,
        "192.0.2.1:4000".parse().unwrap(),
        "x:1",
    );
    assert!(registry.try_register("held-elsewhere", held));

    let deps = ServerDependencies {
        registry: registry.clone(),
        pool: BufferPool::new(config.buffer_size, 4),
    };
    let gateway = common::start_gateway_with(config, deps).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
    assert!(matches!(next_payload(&mut ws).await, Some(Message::Text(_))));

    registry.deregister("held-elsewhere");
    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
    ws.send(Message::binary(b"free".to_vec())).await.unwrap();
    assert!(matches!(next_payload(&mut ws).await, Some(Message::Binary(_))));
    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn test_dial_failure_closes_client() {
    let target = closed_port_addr().await;
    let gateway = start_gateway(gateway_config()).await;

    let url = gateway.ws_url(&format!("/?token={}", target));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));
    assert_eq!(gateway.registry.count(), 0);
}

#[tokio::test]
async fn test_plain_token_rejected_when_encryption_required() {
    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.require_encrypted = true;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));
    assert_eq!(gateway.registry.count(), 0);

    // the encrypted form of the same address still works
    let url = gateway.ws_url(&format!("/?token={}", encrypted_token(echo)));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
    ws.send(Message::binary(b"ok".to_vec())).await.unwrap();
    assert!(matches!(next_payload(&mut ws).await, Some(Message::Binary(_))));
}

#[tokio::test]
async fn test_missing_token_closes_client() {
    let gateway = start_gateway(gateway_config()).await;
    let (mut ws, _) = connect_async(gateway.ws_url("/")).await.expect("Failed to connect");
    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));
}

#[tokio::test]
async fn test_proxy_protocol_header_reaches_backend() {
    let (backend, mut chunks) = common::start_capture_server().await;
    let mut config = gateway_config();
    config.proxy_protocol = true;
    config.proxy_protocol_version = ProxyProtocolVersion::V1;
    let gateway = start_gateway(config).await;

    let mut request = gateway
        .ws_url(&format!("/?token={}", backend))
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("X-Forwarded-For", "203.0.113.9, 10.0.0.1".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.expect("Failed to connect");
    ws.send(Message::binary(b"payload".to_vec())).await.unwrap();

    let mut received = Vec::new();
    while !received.ends_with(b"payload") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), chunks.recv())
            .await
            .expect("Timeout waiting for backend data")
            .expect("Capture server stopped");
        received.extend_from_slice(&chunk);
    }

    let text = String::from_utf8(received).unwrap();
    let (header, rest) = text.split_once("\r\n").unwrap();
    assert!(header.starts_with("PROXY TCP4 203.0.113.9 127.0.0.1 "));
    assert!(header.ends_with(&format!(" {}", backend.port())));
    assert_eq!(rest, "payload");
}

#[tokio::test]
async fn test_udp_backend() {
    let echo = common::start_udp_echo_server().await;
    let gateway = start_gateway(gateway_config()).await;

    let url = gateway.ws_url(&format!("/udp?token={}", encrypted_token(echo)));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    for datagram in [&b"first"[..], &b"second"[..]] {
        ws.send(Message::binary(datagram.to_vec())).await.unwrap();
        match next_payload(&mut ws).await {
            Some(Message::Binary(data)) => assert_eq!(&data[..], datagram),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_tunnel_backend_keeps_frame_types() {
    let peer = common::start_ws_echo_server().await;
    let gateway = start_gateway(gateway_config()).await;

    let url = gateway.ws_url(&format!("/ws?token={}", peer));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    ws.send(Message::text("over the tunnel")).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), "over the tunnel"),
        other => panic!("unexpected reply: {:?}", other),
    }

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], &[1, 2, 3]),
        other => panic!("unexpected reply: {:?}", other),
    }

    let registry = gateway.registry.clone();
    let snapshot = registry.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].1.kind, BackendKind::Tunnel);
}

#[tokio::test]
async fn test_backend_close_ends_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(socket);
        }
    });

    let gateway = start_gateway(gateway_config()).await;
    let url = gateway.ws_url(&format!("/?token={}", backend));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));
    let registry = gateway.registry.clone();
    assert!(wait_until(Duration::from_secs(5), || registry.count() == 0).await);
}

#[tokio::test]
async fn test_status_and_health_pages() {
    let gateway = start_gateway(gateway_config()).await;

    let status = common::http_get(gateway.addr, "/status").await;
    assert!(status.starts_with("HTTP/1.1 200"));
    assert!(status.contains("Hello ws-gateway!"));
    assert!(status.contains("Conns available: 65536"));

    let json = common::http_get(gateway.addr, "/status?format=json").await;
    let (_, body) = json.split_once("\r\n\r\n").unwrap();
    let value: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(value["sessions"], 0);
    assert_eq!(value["capacity"], 65536);

    let health = common::http_get(gateway.addr, "/ok").await;
    assert!(health.starts_with("HTTP/1.1 200"));
    assert!(health.ends_with("ws-gateway is OK!"));
}

#[tokio::test]
async fn test_plain_http_on_upgrade_route_gets_400() {
    let gateway = start_gateway(gateway_config()).await;
    let response = common::http_get(gateway.addr, "/?token=127.0.0.1:1").await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert_eq!(gateway.registry.count(), 0);
}

#[tokio::test]
async fn test_tls_listener() {
    let (cert_path, key_path) = common::generate_test_certs();
    let _cleanup = common::TestCleanup::new(cert_path.clone(), key_path.clone());

    let echo = common::start_echo_server().await;
    let mut config = gateway_config();
    config.cert_path = Some(cert_path.clone());
    config.key_path = Some(key_path);
    let gateway = start_gateway(config).await;

    let client_config = ws_gateway::tls::load_client_config(&cert_path).unwrap();
    let url = format!(
        "wss://localhost:{}/?token={}",
        gateway.addr.port(),
        encrypted_token(echo)
    );
    let (mut ws, _) =
        connect_async_tls_with_config(url, None, false, Some(Connector::Rustls(client_config)))
            .await
            .expect("Failed to connect over TLS");

    ws.send(Message::binary(b"secure".to_vec())).await.unwrap();
    match next_payload(&mut ws).await {
        Some(Message::Binary(data)) => assert_eq!(&data[..], b"secure"),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let gateway = start_gateway(gateway_config()).await;
    let addr = gateway.addr;
    gateway.stop().await.unwrap();

    let result = tokio::net::TcpStream::connect(addr).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_concurrent_sessions() {
    let echo = common::start_echo_server().await;
    let gateway = start_gateway(gateway_config()).await;
    let url = gateway.ws_url(&format!("/?token={}", encrypted_token(echo)));

    let mut clients = Vec::new();
    for i in 0..8u8 {
        let url = url.clone();
        clients.push(tokio::spawn(async move {
            let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
            ws.send(Message::binary(vec![i; 32])).await.unwrap();
            let mut received = Vec::new();
            while received.len() < 32 {
                match next_payload(&mut ws).await {
                    Some(Message::Binary(data)) => received.extend_from_slice(&data),
                    other => panic!("unexpected reply: {:?}", other),
                }
            }
            assert_eq!(received, vec![i; 32]);
            ws
        }));
    }

    let mut sockets = Vec::new();
    for client in clients {
        sockets.push(client.await.unwrap());
    }
    assert_eq!(gateway.registry.count(), 8);

    for mut ws in sockets {
        ws.close(None).await.unwrap();
    }
    let registry = gateway.registry.clone();
    assert!(wait_until(Duration::from_secs(5), || registry.count() == 0).await);

}

#[tokio::test]
async fn test_dial_timeout_records_504() {
    let capture = log_capture();
    let stalled = common::start_stalled_backend().await;
    let mut config = gateway_config();
    config.dial_timeout_secs = 1;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", stalled.addr));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");

    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));
    assert_eq!(gateway.registry.count(), 0);
    assert!(
        wait_until(Duration::from_secs(2), || {
            access_statuses(&capture, stalled.addr) == vec![504]
        })
        .await
    );
}

#[tokio::test]
async fn test_capacity_full_does_not_dial() {
    let (echo, accepted) = common::start_counting_echo_server().await;
    let mut config = gateway_config();
    config.max_connections = 1;
    let gateway = start_gateway(config).await;

    let url = gateway.ws_url(&format!("/?token={}", echo));
    let (_first, _) = connect_async(url.clone()).await.expect("Failed to connect");
    assert!(wait_until(Duration::from_secs(2), || accepted.load(Ordering::SeqCst) == 1).await);

    let (mut second, _) = connect_async(url).await.expect("Upgrade should still succeed");
    assert!(matches!(next_payload(&mut second).await, Some(Message::Text(_))));
    assert!(matches!(
        next_payload(&mut second).await,
        None | Some(Message::Close(_))
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.registry.count(), 1);
}

#[tokio::test]
async fn test_one_access_record_per_session() {
    let capture = log_capture();
    let (echo, _) = common::start_counting_echo_server().await;
    let gateway = start_gateway(gateway_config()).await;
    let registry = gateway.registry.clone();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let url = gateway.ws_url(&format!("/?token={}", echo));
        let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
        ws.send(Message::binary(b"ping".to_vec())).await.unwrap();
        assert!(matches!(next_payload(&mut ws).await, Some(Message::Binary(_))));
        clients.push(ws);
    }
    assert!(wait_until(Duration::from_secs(2), || registry.count() == 3).await);

    let mut keys: Vec<String> = registry.snapshot().into_iter().map(|(key, _)| key).collect();
    let mut logged: Vec<String> = access_records(&capture, echo)
        .iter()
        .filter_map(|line| line.rsplit("User-Id:").next())
        .map(|key| key.trim_end_matches('"').to_string())
        .collect();
    keys.sort();
    logged.sort();
    assert_eq!(logged, keys);

    for mut ws in clients {
        ws.close(None).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || registry.count() == 0).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(access_statuses(&capture, echo), vec![200, 200, 200]);
}

#[tokio::test]
async fn test_backend_reset_logs_error_and_503() {
    let capture = log_capture();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            tokio::time::sleep(Duration::from_millis(100)).await;
            // zero linger turns the close into a reset
            socket2::SockRef::from(&socket)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(socket);
        }
    });

    let gateway = start_gateway(gateway_config()).await;
    let url = gateway.ws_url(&format!("/?token={}", backend));
    let (mut ws, _) = connect_async(url).await.expect("Failed to connect");
    assert!(matches!(
        next_payload(&mut ws).await,
        None | Some(Message::Close(_))
    ));

    assert!(
        wait_until(Duration::from_secs(5), || {
            access_statuses(&capture, backend).contains(&503)
        })
        .await
    );
    assert_eq!(access_statuses(&capture, backend)[0], 200);

    let record = access_records(&capture, backend)
        .into_iter()
        .find(|line| line.split('"').nth(4).map(str::trim) == Some("503"))
        .unwrap();
    let key = record
        .rsplit("User-Id:")
        .next()
        .unwrap()
        .trim_end_matches('"')
        .to_string();
    let user_id = format!("User-Id:{}", key);
    assert!(capture.lines().iter().any(|line| {
        line.contains("ERROR") && line.contains("backend error") && line.ends_with(&user_id)
    }));
    assert_eq!(gateway.registry.count(), 0);
}
