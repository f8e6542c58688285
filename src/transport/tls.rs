use super::{ClientAcceptor, ClientIo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsAcceptor};
use tracing::debug;

/// TLS（wss://）接入
pub struct TlsClientAcceptor {
    acceptor: TlsAcceptor,
}

impl TlsClientAcceptor {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl ClientAcceptor for TlsClientAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<ClientIo> {
        let peer_addr = stream.peer_addr().ok();

        let tls_stream = self
            .acceptor
            .accept(stream)
            .await
            .context("TLS handshake failed")?;

        debug!("TLS handshake completed with {:?}", peer_addr);
        Ok(Box::pin(tls_stream))
    }

    fn scheme(&self) -> &'static str {
        "wss"
    }
}
