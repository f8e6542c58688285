use crate::config::TunnelConfig;
use crate::error::{DialError, RelayError};
use crate::proxy_header::HeaderTransport;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::rustls;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// 拨号到另一个网关得到的 WebSocket 连接
pub type TunnelStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 后端类型，由请求路径决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// TCP
    Stream,
    /// UDP
    Datagram,
    /// WebSocket 隧道
    Tunnel,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Stream => write!(f, "tcp"),
            BackendKind::Datagram => write!(f, "udp"),
            BackendKind::Tunnel => write!(f, "ws"),
        }
    }
}

impl BackendKind {
    /// PROXY 协议头中使用的传输类型，隧道后端不写协议头
    pub fn header_transport(&self) -> Option<HeaderTransport> {
        match self {
            BackendKind::Stream => Some(HeaderTransport::Stream),
            BackendKind::Datagram => Some(HeaderTransport::Datagram),
            BackendKind::Tunnel => None,
        }
    }
}

/// 拨号参数
#[derive(Clone)]
pub struct DialOptions {
    pub timeout: Duration,
    pub keepalive: Option<Duration>,
    pub tunnel: TunnelConfig,
    /// wss:// 对端使用的 TLS 配置，缺省使用系统根证书
    pub tunnel_tls: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialOptions")
            .field("timeout", &self.timeout)
            .field("keepalive", &self.keepalive)
            .field("tunnel", &self.tunnel)
            .field("tunnel_tls", &self.tunnel_tls.is_some())
            .finish()
    }
}

impl DialOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            keepalive: None,
            tunnel: TunnelConfig::default(),
            tunnel_tls: None,
        }
    }
}

/// 一个已建立的后端连接
pub enum Backend {
    Stream(TcpStream),
    Datagram(UdpSocket),
    Tunnel(Box<TunnelStream>),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("kind", &self.kind())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Backend {
    /// 按类型拨号，超过 `options.timeout` 视为超时
    pub async fn dial(
        kind: BackendKind,
        addr: &str,
        options: &DialOptions,
    ) -> Result<Self, DialError> {
        match kind {
            BackendKind::Stream => {
                with_dial_timeout(addr, options.timeout, dial_stream(addr, options.keepalive)).await
            }
            BackendKind::Datagram => {
                with_dial_timeout(addr, options.timeout, dial_datagram(addr)).await
            }
            BackendKind::Tunnel => {
                with_dial_timeout(addr, options.timeout, dial_tunnel(addr, options)).await
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Stream(_) => BackendKind::Stream,
            Backend::Datagram(_) => BackendKind::Datagram,
            Backend::Tunnel(_) => BackendKind::Tunnel,
        }
    }

    /// 本端地址，用于访问日志
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Backend::Stream(s) => s.local_addr().ok(),
            Backend::Datagram(s) => s.local_addr().ok(),
            Backend::Tunnel(ws) => match ws.get_ref() {
                MaybeTlsStream::Plain(s) => s.local_addr().ok(),
                MaybeTlsStream::Rustls(s) => s.get_ref().0.local_addr().ok(),
                _ => None,
            },
        }
    }

    /// 在转发任何数据之前写入 PROXY 协议头（单次写入）
    pub async fn write_preamble(&mut self, preamble: &[u8]) -> io::Result<()> {
        match self {
            Backend::Stream(s) => {
                s.write_all(preamble).await?;
                s.flush().await
            }
            Backend::Datagram(s) => {
                let n = s.send(preamble).await?;
                if n < preamble.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("preamble truncated: {} of {} bytes", n, preamble.len()),
                    ));
                }
                Ok(())
            }
            Backend::Tunnel(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "tunnel backends carry no preamble",
            )),
        }
    }

    /// 关闭后端连接（未启动转发时使用）
    pub async fn close(self) {
        match self {
            Backend::Stream(mut s) => {
                let _ = s.shutdown().await;
            }
            Backend::Datagram(_) => {}
            Backend::Tunnel(mut ws) => {
                let _ = (*ws).close(None).await;
            }
        }
    }

    /// 拆分为读写两半，分别交给两个转发方向
    pub fn split(self) -> (BackendReader, BackendWriter) {
        match self {
            Backend::Stream(s) => {
                let (r, w) = s.into_split();
                (BackendReader::Stream(r), BackendWriter::Stream(w))
            }
            Backend::Datagram(s) => {
                let s = Arc::new(s);
                (BackendReader::Datagram(s.clone()), BackendWriter::Datagram(s))
            }
            Backend::Tunnel(ws) => {
                let (sink, stream) = (*ws).split();
                (BackendReader::Tunnel(stream), BackendWriter::Tunnel(sink))
            }
        }
    }
}

/// 为拨号加上超时；内部返回的 TimedOut 也归类为超时
pub async fn with_dial_timeout<T, F>(addr: &str, timeout: Duration, fut: F) -> Result<T, DialError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(DialError::timeout(addr, timeout)),
        Ok(Err(e)) => Err(DialError::failed(addr, e)),
        Err(_) => Err(DialError::timeout(addr, timeout)),
    }
}

async fn dial_stream(addr: &str, keepalive: Option<Duration>) -> io::Result<Backend> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    if let Some(time) = keepalive {
        let keepalive = TcpKeepalive::new().with_time(time);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }

    debug!("Connected TCP backend {}", addr);
    Ok(Backend::Stream(stream))
}

async fn dial_datagram(addr: &str) -> io::Result<Backend> {
    let target = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;

    let bind: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().map_err(io::Error::other)?
    } else {
        "[::]:0".parse().map_err(io::Error::other)?
    };

    let socket = UdpSocket::bind(bind).await?;
    socket.connect(target).await?;

    debug!("Connected UDP backend {}", target);
    Ok(Backend::Datagram(socket))
}

async fn dial_tunnel(addr: &str, options: &DialOptions) -> io::Result<Backend> {
    let url = options.tunnel.url_for(addr);
    let connector = options.tunnel_tls.clone().map(Connector::Rustls);

    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Io(io) => io,
                other => io::Error::other(other),
            })?;

    debug!("Connected tunnel backend {}", url);
    Ok(Backend::Tunnel(Box::new(ws)))
}

/// 从后端读到的一个单位
#[derive(Debug)]
pub enum Inbound {
    /// 读入缓冲区的字节数（TCP/UDP）
    Bytes(usize),
    /// 完整消息（隧道）
    Message(Message),
}

/// 后端读半部
pub enum BackendReader {
    Stream(OwnedReadHalf),
    Datagram(Arc<UdpSocket>),
    Tunnel(SplitStream<TunnelStream>),
}

impl BackendReader {
    /// 读取一个单位：TCP 最多一个缓冲区，UDP 一个数据报，隧道一条数据消息
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<Inbound, RelayError> {
        match self {
            BackendReader::Stream(r) => match r.read(buf).await? {
                0 => Err(RelayError::Eof),
                n => Ok(Inbound::Bytes(n)),
            },
            BackendReader::Datagram(s) => Ok(Inbound::Bytes(s.recv(buf).await?)),
            BackendReader::Tunnel(stream) => next_data_message(stream).await.map(Inbound::Message),
        }
    }
}

/// 后端写半部
pub enum BackendWriter {
    Stream(OwnedWriteHalf),
    Datagram(Arc<UdpSocket>),
    Tunnel(SplitSink<TunnelStream, Message>),
}

impl BackendWriter {
    /// 写入一条客户端消息；TCP/UDP 只写负载，隧道原样转发消息类型
    pub async fn send(&mut self, msg: Message) -> Result<(), RelayError> {
        match self {
            BackendWriter::Stream(w) => {
                let data = msg.into_data();
                write_fully(w, &data).await
            }
            BackendWriter::Datagram(s) => {
                let data = msg.into_data();
                let written = s.send(&data).await?;
                if written < data.len() {
                    return Err(RelayError::ShortWrite {
                        written,
                        expected: data.len(),
                    });
                }
                Ok(())
            }
            BackendWriter::Tunnel(sink) => Ok(sink.send(msg).await?),
        }
    }

    /// 关闭写方向
    pub async fn close(&mut self) {
        match self {
            BackendWriter::Stream(w) => {
                let _ = w.shutdown().await;
            }
            BackendWriter::Datagram(_) => {}
            BackendWriter::Tunnel(sink) => {
                let _ = sink.close().await;
            }
        }
    }
}

/// 写入全部字节，写入停止推进时视为短写
async fn write_fully<W>(writer: &mut W, data: &[u8]) -> Result<(), RelayError>
where
    W: AsyncWriteExt + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        match writer.write(&data[written..]).await {
            Ok(0) => {
                return Err(RelayError::ShortWrite {
                    written,
                    expected: data.len(),
                })
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    writer.flush().await?;
    Ok(())
}

/// 读取下一条数据消息，跳过控制帧
pub(crate) async fn next_data_message<S>(stream: &mut S) -> Result<Message, RelayError>
where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return Ok(msg),
            Some(Ok(Message::Close(frame))) => return Err(RelayError::closed(frame.as_ref())),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(RelayError::Eof),
        }
    }
}
