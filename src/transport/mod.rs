mod factory;
mod plain;
mod tls;

pub use factory::create_acceptor;
pub use plain::PlainAcceptor;
pub use tls::TlsClientAcceptor;

use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// 传输层连接抽象
///
/// 统一封装明文 TCP 与 TLS 连接，握手与 WebSocket 会话都只看到这个类型
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 客户端一侧的连接
pub type ClientIo = Pin<Box<dyn Transport>>;

/// 入站连接包装接口
///
/// 监听循环只负责 accept TCP，包装（TLS 握手）在每个连接自己的任务里进行
#[async_trait]
pub trait ClientAcceptor: Send + Sync {
    /// 将新接受的 TCP 连接包装为传输层连接
    async fn accept(&self, stream: TcpStream) -> Result<ClientIo>;

    /// 对外的 URL scheme（ws / wss）
    fn scheme(&self) -> &'static str;
}
