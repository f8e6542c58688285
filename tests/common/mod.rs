//! Common utilities for integration tests
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use ws_gateway::{Gateway, GatewayConfig, ServerDependencies, SessionRegistry};

pub const TEST_SECRET: &str = "integration-secret";

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};
    use ws_gateway::tls;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", uuid::Uuid::new_v4(), counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}

/// Base configuration bound to an ephemeral loopback port
pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        secret: TEST_SECRET.to_string(),
        pid_file: None,
        ..Default::default()
    }
}

/// A gateway running on a background task
pub struct TestGateway {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    pub fn ws_url(&self, path_and_query: &str) -> String {
        format!("ws://{}{}", self.addr, path_and_query)
    }

    /// Stop accepting and wait for the accept loop to return
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.handle).await?
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let deps = ServerDependencies::new(&config);
    start_gateway_with(config, deps).await
}

/// Start a gateway around externally owned registry and pool
pub async fn start_gateway_with(config: GatewayConfig, deps: ServerDependencies) -> TestGateway {
    let gateway = Gateway::bind_with_dependencies(config, deps)
        .await
        .expect("Failed to bind gateway");
    let addr = gateway.local_addr().expect("Failed to get gateway addr");
    let registry = gateway.registry();

    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(gateway.serve_with_shutdown(async move {
        let _ = rx.await;
    }));

    TestGateway {
        addr,
        registry,
        shutdown: Some(tx),
        handle,
    }
}

/// Create a simple echo server for testing
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) => break, // Connection closed
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    });

    addr
}

/// TCP server that reports every chunk it receives and never answers
pub async fn start_capture_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind capture server");
    let addr = listener.local_addr().expect("Failed to get capture addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, rx)
}

/// UDP echo server
pub async fn start_udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind udp echo server");
    let addr = socket.local_addr().expect("Failed to get udp echo addr");

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            if socket.send_to(&buf[..n], from).await.is_err() {
                break;
            }
        }
    });

    addr
}

/// WebSocket echo server used as a tunnel peer
pub async fn start_ws_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind ws echo server");
    let addr = listener.local_addr().expect("Failed to get ws echo addr");

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if (msg.is_text() || msg.is_binary()) && ws.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Plain HTTP/1.1 request; returns the raw response
pub async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to gateway");
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, addr);
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Failed to write request");

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("Timeout waiting for response")
        .expect("Failed to read response");
    String::from_utf8_lossy(&response).into_owned()
}

/// Poll `check` until it holds or the timeout passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Next text or binary payload from a client socket
pub async fn next_payload<S>(ws: &mut S) -> Option<Message>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .ok()??
            .ok()?;
        match msg {
            Message::Text(_) | Message::Binary(_) | Message::Close(_) => return Some(msg),
            _ => continue,
        }
    }
}

/// Process-wide log sink shared by every test in the binary
#[derive(Clone, Default)]
pub struct LogCapture(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl LogCapture {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Install the capturing subscriber once and hand back the shared sink
pub fn log_capture() -> LogCapture {
    static CAPTURE: std::sync::OnceLock<LogCapture> = std::sync::OnceLock::new();
    CAPTURE
        .get_or_init(|| {
            let capture = LogCapture::default();
            let _ = tracing_subscriber::fmt()
                .with_env_filter("info")
                .with_writer(capture.clone())
                .with_ansi(false)
                .without_time()
                .try_init();
            capture
        })
        .clone()
}

/// Status codes of the access records naming `target` as their backend
pub fn access_statuses(capture: &LogCapture, target: SocketAddr) -> Vec<u16> {
    access_records(capture, target)
        .iter()
        .filter_map(|line| line.split('"').nth(4)?.trim().parse().ok())
        .collect()
}

/// Access record lines naming `target` as their backend
pub fn access_records(capture: &LogCapture, target: SocketAddr) -> Vec<String> {
    let needle = format!("->{}\"", target);
    capture
        .lines()
        .into_iter()
        .filter(|line| line.contains(" access: ") && line.contains(&needle))
        .collect()
}

/// Echo server that also counts accepted connections
pub async fn start_counting_echo_server() -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().expect("Failed to get echo addr");
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });

    (addr, accepted)
}

/// A listener whose accept queue is full, so new connects hang until they time out
pub struct StalledBackend {
    pub addr: SocketAddr,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

pub async fn start_stalled_backend() -> StalledBackend {
    let socket = tokio::net::TcpSocket::new_v4().expect("Failed to create socket");
    socket
        .bind("127.0.0.1:0".parse().expect("valid addr"))
        .expect("Failed to bind stalled backend");
    let listener = socket.listen(1).expect("Failed to listen");
    let addr = listener.local_addr().expect("Failed to get stalled addr");

    // never accepted; once the queue is full further SYNs are dropped
    let mut queued = Vec::new();
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }

    StalledBackend {
        addr,
        _listener: listener,
        _queued: queued,
    }
}
