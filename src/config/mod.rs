// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::GatewayConfigBuilder;
pub use validator::ConfigValidator;

use crate::error::DecodeError;
use crate::proxy_header::ProxyProtocolVersion;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 后端字节流转发给客户端时使用的帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FrameFormat {
    /// WebSocket 文本帧
    #[serde(rename = "text")]
    Text,
    /// WebSocket 二进制帧
    #[default]
    #[serde(rename = "bin", alias = "binary")]
    Binary,
}

impl std::fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFormat::Text => write!(f, "text"),
            FrameFormat::Binary => write!(f, "bin"),
        }
    }
}

impl std::str::FromStr for FrameFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "bin" | "binary" => Ok(Self::Binary),
            _ => anyhow::bail!("Unsupported stream format '{}' (expected bin or text)", s),
        }
    }
}

/// 令牌切分规则，例如 `?t=xeR7Lp...?v=4693225` 配合 `?v=,0` 取出 `xeR7Lp...`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSplit {
    /// 切分标记
    pub marker: String,
    /// 取第几段（从 0 开始）
    #[serde(default)]
    pub index: usize,
}

impl TokenSplit {
    /// 标记存在时返回指定片段，否则原样返回
    pub fn apply<'a>(&self, token: &'a str) -> Result<&'a str, DecodeError> {
        if self.marker.is_empty() || !token.contains(self.marker.as_str()) {
            return Ok(token);
        }

        let segments: Vec<&str> = token.split(self.marker.as_str()).collect();
        segments
            .get(self.index)
            .copied()
            .ok_or(DecodeError::SplitOutOfRange {
                index: self.index,
                segments: segments.len(),
            })
    }
}

impl std::str::FromStr for TokenSplit {
    type Err = anyhow::Error;

    /// 解析 `<marker>,<index>` 形式
    fn from_str(s: &str) -> anyhow::Result<Self> {
        let compact: String = s.chars().filter(|c| *c != ' ').collect();
        let (marker, index) = compact
            .rsplit_once(',')
            .with_context(|| format!("Split rule '{}' must look like '<marker>,<index>'", s))?;

        if marker.is_empty() {
            anyhow::bail!("Split rule '{}' has an empty marker", s);
        }

        let index = index
            .parse::<usize>()
            .with_context(|| format!("Split rule '{}' has an invalid index", s))?;

        Ok(Self {
            marker: marker.to_string(),
            index,
        })
    }
}

/// 路由配置：请求路径到后端类型的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// TCP 后端（同时兜底所有未匹配的路径）
    #[serde(default = "default_stream_route")]
    pub stream: String,
    /// UDP 后端
    #[serde(default = "default_datagram_route")]
    pub datagram: String,
    /// WebSocket 隧道后端
    #[serde(default = "default_tunnel_route")]
    pub tunnel: String,
    /// 运行状态页面
    #[serde(default = "default_status_route")]
    pub status: String,
    /// 健康检查
    #[serde(default = "default_health_route")]
    pub health: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            stream: default_stream_route(),
            datagram: default_datagram_route(),
            tunnel: default_tunnel_route(),
            status: default_status_route(),
            health: default_health_route(),
        }
    }
}

/// 拨号到另一个 WebSocket 网关时使用的参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// 使用 wss:// 拨号
    #[serde(default)]
    pub secure: bool,
    /// 对端路径
    #[serde(default = "default_tunnel_path")]
    pub path: String,
    /// 校验对端证书使用的 CA（缺省使用系统根证书）
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            secure: false,
            path: default_tunnel_path(),
            ca_cert_path: None,
        }
    }
}

impl TunnelConfig {
    /// 拼出对端 URL
    pub fn url_for(&self, addr: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}{}", scheme, addr, path)
    }
}

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 监听地址（host:port）
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 解密目标地址使用的口令
    #[serde(default)]
    pub secret: String,
    /// 拨号后端超时（秒）
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
    /// 单次读写的块大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 缓冲池最多保留的空闲缓冲区数量
    #[serde(default = "default_max_idle_buffers")]
    pub max_idle_buffers: usize,
    /// 最大并发会话数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// TCP/UDP 后端数据转发给客户端的帧类型
    #[serde(default)]
    pub frame_format: FrameFormat,
    /// URL 中携带令牌的参数名
    #[serde(default = "default_token_key")]
    pub token_key: String,
    /// 令牌切分规则（可选）
    #[serde(default)]
    pub token_split: Option<TokenSplit>,
    /// 只接受加密令牌
    #[serde(default)]
    pub require_encrypted: bool,
    /// 向 TCP/UDP 后端写入 PROXY 协议头
    #[serde(default)]
    pub proxy_protocol: bool,
    /// PROXY 协议版本
    #[serde(default)]
    pub proxy_protocol_version: ProxyProtocolVersion,
    /// TLS 证书路径
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// TLS 私钥路径
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// 读取请求头（含 TLS 握手）的超时（秒）
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// TCP 后端 keepalive 探测时间（秒，可选）
    #[serde(default)]
    pub backend_keepalive_secs: Option<u64>,
    /// 路由配置
    #[serde(default)]
    pub routes: RouteConfig,
    /// WebSocket 隧道后端配置
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// PID 文件路径
    #[serde(default = "default_pid_file")]
    pub pid_file: Option<PathBuf>,
    /// 日志文件路径（缺省输出到标准输出）
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            secret: String::new(),
            dial_timeout_secs: default_dial_timeout_secs(),
            buffer_size: default_buffer_size(),
            max_idle_buffers: default_max_idle_buffers(),
            max_connections: default_max_connections(),
            frame_format: FrameFormat::default(),
            token_key: default_token_key(),
            token_split: None,
            require_encrypted: false,
            proxy_protocol: false,
            proxy_protocol_version: ProxyProtocolVersion::default(),
            cert_path: None,
            key_path: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            backend_keepalive_secs: None,
            routes: RouteConfig::default(),
            tunnel: TunnelConfig::default(),
            pid_file: default_pid_file(),
            log_file: None,
        }
    }
}

impl GatewayConfig {
    /// 创建 Builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_gateway_config(self)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn backend_keepalive(&self) -> Option<Duration> {
        self.backend_keepalive_secs.map(Duration::from_secs)
    }

    /// 证书与私钥同时配置时启用 TLS
    pub fn tls_enabled(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// 从 TOML 文件加载（`[gateway]` 段）
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        #[derive(Deserialize)]
        struct GatewayConfigWrapper {
            gateway: GatewayConfig,
        }

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {:?}", path))?;
        let wrapper: GatewayConfigWrapper =
            toml::from_str(&content).context("Failed to parse gateway configuration")?;
        Ok(wrapper.gateway)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:1443".to_string()
}

fn default_dial_timeout_secs() -> u64 {
    3
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_idle_buffers() -> usize {
    4096
}

fn default_max_connections() -> usize {
    64 * 1024
}

fn default_token_key() -> String {
    "token".to_string()
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_stream_route() -> String {
    "/".to_string()
}

fn default_datagram_route() -> String {
    "/udp".to_string()
}

fn default_tunnel_route() -> String {
    "/ws".to_string()
}

fn default_status_route() -> String {
    "/status".to_string()
}

fn default_health_route() -> String {
    "/ok".to_string()
}

fn default_tunnel_path() -> String {
    "/".to_string()
}

fn default_pid_file() -> Option<PathBuf> {
    Some(PathBuf::from("gateway.pid"))
}
