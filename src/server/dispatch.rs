use super::handshake::{accept_websocket, RequestHead};
use super::registry::{session_key, SessionEntry};
use super::ServerState;
use crate::access_log::{AccessRecord, STATUS_BAD_TOKEN, STATUS_OK};
use crate::proxy_header::build_preamble;
use crate::session::{Backend, BackendKind, ClientSocket, RelayContext, Session};
use crate::transport::ClientIo;
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// Sent to clients that arrive while every session slot is taken.
pub const TOO_MANY_CONNECTIONS: &str = r#"{"error":"too many connections"}"#;

/// 单次升级请求的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// 升级失败（非 WebSocket 请求）
    NotUpgraded,
    /// 注册表已满
    Full,
    /// 令牌无法解码
    BadToken,
    /// 拨号失败，携带访问日志状态码
    DialFailed(u16),
    /// 注册失败（容量竞争或 key 冲突）
    Rejected,
    /// 会话已启动
    Started(String),
}

/// 连接被接受时的对端地址与时间
#[derive(Debug, Clone, Copy)]
pub struct Accepted {
    pub peer: SocketAddr,
    pub at: Instant,
    /// 会话 key 的种子
    pub wall: SystemTime,
}

impl Accepted {
    pub fn now(peer: SocketAddr) -> Self {
        Self {
            peer,
            at: Instant::now(),
            wall: SystemTime::now(),
        }
    }

    /// 由接受时刻决定，与握手耗时无关
    pub fn session_key(&self) -> String {
        session_key(&self.peer, self.wall)
    }
}

/// 处理 WebSocket 升级并建立会话
pub struct Dispatcher {
    state: Arc<ServerState>,
}

impl Dispatcher {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self { state }
    }

    pub async fn dispatch(
        &self,
        io: ClientIo,
        head: RequestHead,
        leftover: Vec<u8>,
        kind: BackendKind,
        accepted: Accepted,
    ) -> DispatchOutcome {
        let peer = accepted.peer;
        let state = &self.state;
        let config = &state.config;

        let mut client = match accept_websocket(io, &head, leftover).await {
            Ok(client) => client,
            Err(e) => {
                warn!("WebSocket upgrade from {} failed: {}", peer, e);
                return DispatchOutcome::NotUpgraded;
            }
        };

        if state.registry.is_full() {
            warn!(
                "Rejecting {}: {} sessions already active",
                peer,
                state.registry.count()
            );
            let _ = client.send(Message::text(TOO_MANY_CONNECTIONS)).await;
            close_client(&mut client).await;
            return DispatchOutcome::Full;
        }

        let key = accepted.session_key();
        let request = Arc::new(head.request_info(peer, accepted.at));

        let token = head.query_param(&config.token_key).unwrap_or_default();
        let target = match state.codec.resolve(&token, config.require_encrypted) {
            Ok(target) => target,
            Err(e) => {
                error!("Decrypt an error occurred: {}, Token: {}", e, token);
                AccessRecord::new(&request, STATUS_BAD_TOKEN, &key).emit();
                close_client(&mut client).await;
                return DispatchOutcome::BadToken;
            }
        };

        let mut backend = match Backend::dial(kind, &target, &state.dial).await {
            Ok(backend) => backend,
            Err(e) => {
                error!(
                    "Dial {} backend failed after {:?}: {}, User-Id:{}",
                    kind,
                    request.elapsed(),
                    e,
                    key
                );
                AccessRecord::new(&request, e.status_code(), &key)
                    .target(&target)
                    .emit();
                close_client(&mut client).await;
                return DispatchOutcome::DialFailed(e.status_code());
            }
        };

        if config.proxy_protocol {
            if let Some(transport) = kind.header_transport() {
                let source = head
                    .forwarded_client()
                    .map(str::to_string)
                    .unwrap_or_else(|| peer.to_string());
                write_preamble(
                    &mut backend,
                    transport,
                    &source,
                    peer.port(),
                    &target,
                    state,
                )
                .await;
            }
        }

        let backend_local = backend.local_addr();
        let entry = SessionEntry::new(kind, peer, target.as_str());
        if !state.registry.try_register(&key, entry) {
            warn!(
                "Session {} could not be registered ({} of {} slots used)",
                key,
                state.registry.count(),
                state.registry.capacity()
            );
            close_client(&mut client).await;
            backend.close().await;
            return DispatchOutcome::Rejected;
        }

        let ctx = RelayContext {
            registry: state.registry.clone(),
            pool: state.pool.clone(),
            frame_format: config.frame_format,
        };
        Session::new(key.clone(), target.clone(), request.clone(), client, backend)
            .start(&ctx);

        AccessRecord::new(&request, STATUS_OK, &key)
            .backend_local(backend_local)
            .target(&target)
            .emit();

        DispatchOutcome::Started(key)
    }
}

async fn write_preamble(
    backend: &mut Backend,
    transport: crate::proxy_header::HeaderTransport,
    source: &str,
    source_port: u16,
    target: &str,
    state: &ServerState,
) -> bool {
    let version = state.config.proxy_protocol_version;
    let Some(preamble) = build_preamble(version, transport, source, source_port, target).await
    else {
        warn!(
            "PROXY header skipped: cannot resolve {} -> {}",
            source, target
        );
        return false;
    };

    match backend.write_preamble(&preamble).await {
        Ok(()) => {
            debug!("PROXY {} header written for {} -> {}", version, source, target);
            true
        }
        Err(e) => {
            warn!("Failed to write PROXY header to {}: {}", target, e);
            false
        }
    }
}

async fn close_client(client: &mut ClientSocket) {
    if let Err(e) = client.close(None).await {
        debug!("Closing client socket: {}", e);
    }
}
