use anyhow::Result;
use std::path::PathBuf;

use crate::proxy_header::ProxyProtocolVersion;

use super::{validator::ConfigValidator, FrameFormat, GatewayConfig, TokenSplit};

/// GatewayConfig Builder
///
/// 未设置的字段保留默认值；也可以从已加载的配置开始，用命令行参数覆盖其中的字段
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl From<GatewayConfig> for GatewayConfigBuilder {
    fn from(config: GatewayConfig) -> Self {
        Self { config }
    }
}

impl GatewayConfigBuilder {
    /// 创建新的 Builder
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.bind_addr = addr.into();
        self
    }

    /// 设置解密口令
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = secret.into();
        self
    }

    /// 设置拨号超时（秒）
    pub fn dial_timeout_secs(mut self, secs: u64) -> Self {
        self.config.dial_timeout_secs = secs;
        self
    }

    /// 设置读写块大小
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// 设置缓冲池保留的空闲缓冲区上限
    pub fn max_idle_buffers(mut self, count: usize) -> Self {
        self.config.max_idle_buffers = count;
        self
    }

    /// 设置最大并发会话数
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// 设置帧类型
    pub fn frame_format(mut self, format: FrameFormat) -> Self {
        self.config.frame_format = format;
        self
    }

    /// 设置令牌参数名（统一转换为小写）
    pub fn token_key(mut self, key: impl Into<String>) -> Self {
        self.config.token_key = key.into().to_lowercase();
        self
    }

    /// 设置令牌切分规则
    pub fn token_split(mut self, split: TokenSplit) -> Self {
        self.config.token_split = Some(split);
        self
    }

    /// 只接受加密令牌
    pub fn require_encrypted(mut self, required: bool) -> Self {
        self.config.require_encrypted = required;
        self
    }

    /// 启用 PROXY 协议头
    pub fn proxy_protocol(mut self, enabled: bool) -> Self {
        self.config.proxy_protocol = enabled;
        self
    }

    /// 设置 PROXY 协议版本
    pub fn proxy_protocol_version(mut self, version: ProxyProtocolVersion) -> Self {
        self.config.proxy_protocol_version = version;
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cert_path = Some(path.into());
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.key_path = Some(path.into());
        self
    }

    /// 设置握手超时（秒）
    pub fn handshake_timeout_secs(mut self, secs: u64) -> Self {
        self.config.handshake_timeout_secs = secs;
        self
    }

    /// 设置 TCP 后端 keepalive
    pub fn backend_keepalive_secs(mut self, secs: u64) -> Self {
        self.config.backend_keepalive_secs = Some(secs);
        self
    }

    /// 设置 TCP 后端路由
    pub fn stream_route(mut self, path: impl Into<String>) -> Self {
        self.config.routes.stream = path.into();
        self
    }

    /// 设置 UDP 后端路由
    pub fn datagram_route(mut self, path: impl Into<String>) -> Self {
        self.config.routes.datagram = path.into();
        self
    }

    /// 设置 WebSocket 隧道后端路由
    pub fn tunnel_route(mut self, path: impl Into<String>) -> Self {
        self.config.routes.tunnel = path.into();
        self
    }

    /// 隧道后端使用 wss:// 拨号
    pub fn tunnel_secure(mut self, secure: bool) -> Self {
        self.config.tunnel.secure = secure;
        self
    }

    /// 设置隧道对端路径
    pub fn tunnel_path(mut self, path: impl Into<String>) -> Self {
        self.config.tunnel.path = path.into();
        self
    }

    /// 设置 PID 文件路径，`None` 表示不写 PID 文件
    pub fn pid_file(mut self, path: Option<PathBuf>) -> Self {
        self.config.pid_file = path;
        self
    }

    /// 设置日志文件路径
    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_file = Some(path.into());
        self
    }

    /// 构建 GatewayConfig 并验证
    pub fn build(mut self) -> Result<GatewayConfig> {
        self.config.token_key = self.config.token_key.trim().to_lowercase();

        // 验证配置
        ConfigValidator::validate_gateway_config(&self.config)?;

        Ok(self.config)
    }
}
