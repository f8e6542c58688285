/// PROXY 协议头（v1 文本 / v2 二进制）
///
/// 新拨号的 TCP/UDP 后端在转发任何数据之前先收到一条 PROXY 记录，
/// 让后端得知真实的客户端地址。
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// v2 签名
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";
/// v2 + PROXY 命令
const V2_VERSION_COMMAND: u8 = 0x21;

/// PROXY 协议版本
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocolVersion {
    /// 文本格式
    #[default]
    V1,
    /// 二进制格式
    V2,
}

impl std::fmt::Display for ProxyProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyProtocolVersion::V1 => write!(f, "v1"),
            ProxyProtocolVersion::V2 => write!(f, "v2"),
        }
    }
}

impl std::str::FromStr for ProxyProtocolVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "1" | "v1" => Ok(Self::V1),
            "2" | "v2" => Ok(Self::V2),
            _ => anyhow::bail!("Unknown PROXY protocol version: {}", s),
        }
    }
}

/// 被代理连接的传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTransport {
    Stream,
    Datagram,
}

/// 一条 PROXY 记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: ProxyProtocolVersion,
    pub transport: HeaderTransport,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl ProxyHeader {
    pub fn new(
        version: ProxyProtocolVersion,
        transport: HeaderTransport,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Self {
            version,
            transport,
            source,
            destination,
        }
    }

    /// 编码为线上格式
    pub fn encode(&self) -> Vec<u8> {
        match self.version {
            ProxyProtocolVersion::V1 => self.encode_v1(),
            ProxyProtocolVersion::V2 => self.encode_v2(),
        }
    }

    /// 地址族不一致时两端都映射为 IPv6
    fn addresses(&self) -> (IpAddr, IpAddr) {
        match (self.source.ip(), self.destination.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => (IpAddr::V4(src), IpAddr::V4(dst)),
            (src, dst) => (IpAddr::V6(to_ipv6(src)), IpAddr::V6(to_ipv6(dst))),
        }
    }

    // v1 只定义了 TCP，数据报也使用 TCP 族
    fn encode_v1(&self) -> Vec<u8> {
        let (src, dst) = self.addresses();
        let family = if src.is_ipv4() { "TCP4" } else { "TCP6" };
        format!(
            "PROXY {} {} {} {} {}\r\n",
            family,
            src,
            dst,
            self.source.port(),
            self.destination.port()
        )
        .into_bytes()
    }

    fn encode_v2(&self) -> Vec<u8> {
        let (src, dst) = self.addresses();
        let family = match (src, self.transport) {
            (IpAddr::V4(_), HeaderTransport::Stream) => 0x11,
            (IpAddr::V4(_), HeaderTransport::Datagram) => 0x12,
            (IpAddr::V6(_), HeaderTransport::Stream) => 0x21,
            (IpAddr::V6(_), HeaderTransport::Datagram) => 0x22,
        };

        let mut body = Vec::with_capacity(36);
        match (src, dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                body.extend_from_slice(&s.octets());
                body.extend_from_slice(&d.octets());
            }
            (s, d) => {
                body.extend_from_slice(&to_ipv6(s).octets());
                body.extend_from_slice(&to_ipv6(d).octets());
            }
        }
        body.extend_from_slice(&self.source.port().to_be_bytes());
        body.extend_from_slice(&self.destination.port().to_be_bytes());

        let mut out = Vec::with_capacity(16 + body.len());
        out.extend_from_slice(&V2_SIGNATURE);
        out.push(V2_VERSION_COMMAND);
        out.push(family);
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }
}

fn to_ipv6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// 将地址字符串解析为 SocketAddr
///
/// 接受 `ip:port`、`[v6]:port`、可解析的 `host:port`，以及只有 IP 的形式
/// （例如 X-Forwarded-For 中的条目，此时使用 `fallback_port`）
pub async fn resolve_addr(addr: &str, fallback_port: u16) -> Option<SocketAddr> {
    let addr = addr.trim();
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock);
    }

    let bare = addr.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, fallback_port));
    }

    match tokio::net::lookup_host(addr).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!("Failed to resolve {}: {}", addr, e);
            None
        }
    }
}

/// 解析源地址与目的地址并编码 PROXY 记录，任一地址无法解析时返回 None
pub async fn build_preamble(
    version: ProxyProtocolVersion,
    transport: HeaderTransport,
    source: &str,
    source_port: u16,
    destination: &str,
) -> Option<Vec<u8>> {
    let source = resolve_addr(source, source_port).await?;
    let destination = resolve_addr(destination, 0).await?;
    Some(ProxyHeader::new(version, transport, source, destination).encode())
}
