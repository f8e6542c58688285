use super::{ClientAcceptor, ClientIo};
use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

/// 明文 ws:// 接入
#[derive(Debug, Default)]
pub struct PlainAcceptor;

#[async_trait]
impl ClientAcceptor for PlainAcceptor {
    async fn accept(&self, stream: TcpStream) -> Result<ClientIo> {
        Ok(Box::pin(stream))
    }

    fn scheme(&self) -> &'static str {
        "ws"
    }
}
