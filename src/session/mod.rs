//! A session joins one upgraded client WebSocket with one dialed backend.
//!
//! Two tasks relay the two directions independently. Whichever stops first tears the session
//! down: it cancels its sibling, and the session leaves the registry exactly once.

mod backend;
mod framer;

pub use backend::{
    with_dial_timeout, Backend, BackendKind, BackendReader, BackendWriter, DialOptions, Inbound,
    TunnelStream,
};
pub use framer::Framer;

use crate::access_log::{AccessRecord, RequestInfo, STATUS_BACKEND_CLOSED};
use crate::buffer_pool::BufferPool;
use crate::config::FrameFormat;
use crate::error::RelayError;
use crate::server::registry::SessionRegistry;
use crate::transport::ClientIo;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};

/// Upgraded client connection.
pub type ClientSocket = WebSocketStream<ClientIo>;

/// Shared pieces every session needs.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    pub pool: BufferPool,
    pub frame_format: FrameFormat,
}

/// Which endpoint produced the terminal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Backend,
}

#[derive(Debug)]
struct Termination {
    side: Side,
    error: RelayError,
}

impl Termination {
    fn client(error: RelayError) -> Self {
        Self {
            side: Side::Client,
            error,
        }
    }

    fn backend(error: RelayError) -> Self {
        Self {
            side: Side::Backend,
            error,
        }
    }

    /// Expected closes are informational; resets and I/O errors on either side are errors.
    fn level(&self) -> Level {
        if self.error.is_expected() {
            Level::INFO
        } else {
            Level::ERROR
        }
    }
}

/// Runs once, no matter how many directions ask for it.
#[derive(Debug)]
pub struct Teardown {
    key: String,
    registry: Arc<SessionRegistry>,
    done: AtomicBool,
    cancel: CancellationToken,
}

impl Teardown {
    pub fn new(key: impl Into<String>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            key: key.into(),
            registry,
            done: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns true for the caller that actually tore the session down.
    pub fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.registry.deregister(&self.key);
        debug!("Session {} torn down", self.key);
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Session facts used for logging once relaying has started.
#[derive(Debug)]
struct SessionInfo {
    key: String,
    target: String,
    backend_local: Option<SocketAddr>,
    request: Arc<RequestInfo>,
}

impl SessionInfo {
    fn report(&self, direction: &str, term: &Termination) {
        let side = match term.side {
            Side::Client => "client",
            Side::Backend => "backend",
        };
        if term.level() == Level::INFO {
            info!("[{}] {}, User-Id:{}", direction, term.error, self.key);
            return;
        }

        error!(
            "[{}] {} error: {}, User-Id:{}",
            direction, side, term.error, self.key
        );
        if term.side == Side::Backend {
            AccessRecord::new(&self.request, STATUS_BACKEND_CLOSED, &self.key)
                .backend_local(self.backend_local)
                .target(&self.target)
                .emit();
        }
    }
}

/// A registered session ready to relay.
pub struct Session {
    key: String,
    target: String,
    request: Arc<RequestInfo>,
    client: ClientSocket,
    backend: Backend,
}

impl Session {
    pub fn new(
        key: impl Into<String>,
        target: impl Into<String>,
        request: Arc<RequestInfo>,
        client: ClientSocket,
        backend: Backend,
    ) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            request,
            client,
            backend,
        }
    }

    /// Spawn both relay directions.
    pub fn start(self, ctx: &RelayContext) -> SessionHandle {
        let info = Arc::new(SessionInfo {
            key: self.key.clone(),
            target: self.target,
            backend_local: self.backend.local_addr(),
            request: self.request,
        });
        let teardown = Arc::new(Teardown::new(self.key, ctx.registry.clone()));

        let (client_tx, client_rx) = self.client.split();
        let (backend_rx, backend_tx) = self.backend.split();

        let frontend = tokio::spawn(client_to_backend(
            client_rx,
            backend_tx,
            info.clone(),
            teardown.clone(),
        ));
        let backend = tokio::spawn(backend_to_client(
            backend_rx,
            client_tx,
            ctx.pool.clone(),
            ctx.frame_format,
            info,
            teardown.clone(),
        ));

        SessionHandle {
            teardown,
            tasks: vec![frontend, backend],
        }
    }
}

/// Handle to a running session.
#[allow(dead_code)]
pub struct SessionHandle {
    teardown: Arc<Teardown>,
    tasks: Vec<JoinHandle<()>>,
}

#[cfg(test)]
impl SessionHandle {
    /// Tear the session down from outside.
    pub(crate) fn close(&self) {
        self.teardown.run();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.teardown.is_done()
    }

    /// Wait for both directions to finish.
    pub(crate) async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Client messages to the backend.
async fn client_to_backend(
    mut client_rx: SplitStream<ClientSocket>,
    mut backend_tx: BackendWriter,
    info: Arc<SessionInfo>,
    teardown: Arc<Teardown>,
) {
    let pump = async {
        loop {
            let msg = match backend::next_data_message(&mut client_rx).await {
                Ok(msg) => msg,
                Err(e) => return Termination::client(e),
            };
            if let Err(e) = backend_tx.send(msg).await {
                return Termination::backend(e);
            }
        }
    };

    tokio::select! {
        term = pump => info.report("client -> backend", &term),
        _ = teardown.cancelled() => {}
    }

    backend_tx.close().await;
    teardown.run();
}

/// Backend data to the client.
async fn backend_to_client(
    mut backend_rx: BackendReader,
    mut client_tx: SplitSink<ClientSocket, Message>,
    pool: BufferPool,
    format: FrameFormat,
    info: Arc<SessionInfo>,
    teardown: Arc<Teardown>,
) {
    let mut buf = pool.acquire();
    let mut framer = Framer::new(format);

    let pump = async {
        loop {
            let msg = match backend_rx.recv(&mut buf).await {
                Ok(Inbound::Bytes(n)) => match framer.frame(&buf[..n]) {
                    Some(msg) => msg,
                    None => continue,
                },
                Ok(Inbound::Message(msg)) => msg,
                Err(e) => {
                    if let Some(rest) = framer.finish() {
                        let _ = client_tx.send(rest).await;
                    }
                    return Termination::backend(e);
                }
            };
            if let Err(e) = client_tx.send(msg).await {
                return Termination::client(e.into());
            }
        }
    };

    tokio::select! {
        term = pump => info.report("backend -> client", &term),
        _ = teardown.cancelled() => {}
    }

    let _ = client_tx.close().await;
    drop(buf);
    teardown.run();
}
