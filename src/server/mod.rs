pub mod dispatch;
pub mod handshake;
pub mod registry;
pub mod status;

pub use dispatch::{Accepted, DispatchOutcome, Dispatcher};
pub use registry::{SessionEntry, SessionRegistry};
pub use status::StatusReport;

use crate::buffer_pool::BufferPool;
use crate::codec::AddressCodec;
use crate::config::{GatewayConfig, RouteConfig};
use crate::error::GatewayError;
use crate::session::{BackendKind, DialOptions};
use crate::transport::{create_acceptor, ClientAcceptor};
use anyhow::{Context, Result};
use http::StatusCode;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 暂时性 accept 错误后的等待时间
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 服务器依赖（用于依赖注入）
pub struct ServerDependencies {
    pub registry: Arc<SessionRegistry>,
    pub pool: BufferPool,
}

impl ServerDependencies {
    /// 按配置创建默认依赖
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(config.max_connections)),
            pool: BufferPool::new(config.buffer_size, config.max_idle_buffers),
        }
    }
}

/// 服务器状态管理（避免过度克隆）
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<SessionRegistry>,
    pub pool: BufferPool,
    pub codec: AddressCodec,
    pub dial: DialOptions,
    pub server_id: Uuid,
    pub started: Instant,
}

impl ServerState {
    /// 从配置创建状态（使用默认依赖）
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let deps = ServerDependencies::new(&config);
        Self::with_dependencies(config, deps)
    }

    /// 从配置和依赖创建状态
    pub fn with_dependencies(config: GatewayConfig, deps: ServerDependencies) -> Result<Self> {
        let tunnel_tls = match &config.tunnel.ca_cert_path {
            Some(path) => Some(
                crate::tls::load_client_config(path).context("Failed to load tunnel CA")?,
            ),
            None => None,
        };

        let dial = DialOptions {
            timeout: config.dial_timeout(),
            keepalive: config.backend_keepalive(),
            tunnel: config.tunnel.clone(),
            tunnel_tls,
        };
        let codec = AddressCodec::new(config.secret.clone()).with_split(config.token_split.clone());

        Ok(Self {
            config: Arc::new(config),
            registry: deps.registry,
            pool: deps.pool,
            codec,
            dial,
            server_id: Uuid::new_v4(),
            started: Instant::now(),
        })
    }
}

/// 请求路径对应的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Status,
    Health,
    Upgrade(BackendKind),
}

/// 按路径分发；未匹配的路径全部交给 TCP 后端
pub fn route(routes: &RouteConfig, path: &str) -> Route {
    if path == routes.status {
        Route::Status
    } else if path == routes.health {
        Route::Health
    } else if path == routes.datagram {
        Route::Upgrade(BackendKind::Datagram)
    } else if path == routes.tunnel {
        Route::Upgrade(BackendKind::Tunnel)
    } else {
        Route::Upgrade(BackendKind::Stream)
    }
}

/// WebSocket 网关服务器
pub struct Gateway {
    listener: TcpListener,
    acceptor: Arc<dyn ClientAcceptor>,
    state: Arc<ServerState>,
}

impl Gateway {
    /// 绑定监听地址（使用默认依赖）
    pub async fn bind(config: GatewayConfig) -> Result<Self> {
        let deps = ServerDependencies::new(&config);
        Self::bind_with_dependencies(config, deps).await
    }

    /// 绑定监听地址（带自定义依赖，用于测试）
    pub async fn bind_with_dependencies(
        config: GatewayConfig,
        deps: ServerDependencies,
    ) -> Result<Self> {
        let acceptor = create_acceptor(&config)?;
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
        let state = Arc::new(ServerState::with_dependencies(config, deps)?);

        Ok(Self {
            listener,
            acceptor,
            state,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.state.registry.clone()
    }

    /// 启动信息（不包含口令）
    pub fn banner(&self, pid: Option<u32>) -> String {
        let config = &self.state.config;
        let proxy_proto = if config.proxy_protocol {
            format!("enable ({})", config.proxy_protocol_version)
        } else {
            "disable".to_string()
        };

        format!(
            "============= ws-gateway running =============\n\
             UUID:          {}\n\
             Version:       {}\n\
             Address:       {}://{}\n\
             SSL/TLS:       {}\n\
             Proxy Proto:   {}\n\
             Dial Timeout:  {:?}\n\
             Max Connects:  {}\n\
             Buffer Size:   {}\n\
             Stream Format: {}\n\
             URL Request:   /?{}=\n\
             Process ID:    {}\n\
             ==============================================",
            self.state.server_id,
            env!("CARGO_PKG_VERSION"),
            self.acceptor.scheme(),
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| config.bind_addr.clone()),
            if config.tls_enabled() { "support" } else { "disable" },
            proxy_proto,
            config.dial_timeout(),
            config.max_connections,
            config.buffer_size,
            config.frame_format,
            config.token_key,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        )
    }

    /// 运行直到收到 SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// 运行直到 `shutdown` 完成
    ///
    /// 停止接受新连接后等待进行中的握手结束；已建立的会话不会被中断
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Gateway {
            listener,
            acceptor,
            state,
        } = self;

        info!(
            "Gateway listening on {}://{}",
            acceptor.scheme(),
            listener.local_addr()?
        );

        let tracker = TaskTracker::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            tracker.spawn(handle_connection(
                                stream,
                                peer,
                                acceptor.clone(),
                                state.clone(),
                            ));
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            warn!("Transient accept error: {}", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            return Err(e).context("Listener failed");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal, stopping gateway...");
                    break;
                }
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;

        info!(
            "Gateway stopped gracefully ({} sessions still running)",
            state.registry.count()
        );
        Ok(())
    }
}

/// 运行网关（阻塞直到收到终止信号）
pub async fn run_server(config: GatewayConfig) -> Result<()> {
    Gateway::bind(config).await?.run().await
}

/// 等待 SIGINT 或 SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}

/// 连接被重置、中断或文件描述符耗尽时可以继续 accept
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE / EMFILE
}

/// 处理单个入站连接：TLS 握手、读取请求头、路由
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<dyn ClientAcceptor>,
    state: Arc<ServerState>,
) {
    let accepted = Accepted::now(peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let timeout = state.config.handshake_timeout();
    let handshake = async {
        let mut io = acceptor.accept(stream).await?;
        let (head, leftover) =
            handshake::read_request_head(&mut io, handshake::DEFAULT_MAX_HEADER_SIZE).await?;
        Ok::<_, GatewayError>((io, head, leftover))
    };

    let (mut io, head, leftover) = match tokio::time::timeout(timeout, handshake).await {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            debug!("Handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("Handshake with {} failed: {}", peer, GatewayError::timeout(timeout));
            return;
        }
    };

    match route(&state.config.routes, head.path()) {
        Route::Status => {
            info!("{} {}", peer, head.request_line());
            let report = StatusReport::collect(&state.server_id, state.started, &state.registry);
            let (content_type, body) = match head.query_param("format").as_deref() {
                Some("json") => ("application/json", report.to_json()),
                _ => ("text/plain; charset=utf-8", report.to_text()),
            };
            if let Err(e) =
                handshake::write_response(&mut io, StatusCode::OK, content_type, &body).await
            {
                error!("Status write error to {}: {}", peer, e);
            }
            let _ = io.shutdown().await;
        }
        Route::Health => {
            info!("{} {}", peer, head.request_line());
            if let Err(e) = handshake::write_response(
                &mut io,
                StatusCode::OK,
                "text/plain; charset=utf-8",
                status::health_text(),
            )
            .await
            {
                error!("Health write error to {}: {}", peer, e);
            }
            let _ = io.shutdown().await;
        }
        Route::Upgrade(kind) => {
            let outcome = Dispatcher::new(state)
                .dispatch(io, head, leftover, kind, accepted)
                .await;
            debug!("Dispatch for {} finished: {:?}", peer, outcome);
        }
    }
}
