use anyhow::{bail, Result};
use std::collections::HashSet;
use std::net::ToSocketAddrs;
use tracing::warn;

use super::{GatewayConfig, RouteConfig};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证解密口令
    pub fn validate_secret(secret: &str) -> Result<()> {
        if secret.is_empty() {
            bail!("secret cannot be empty: it is required to decrypt address tokens");
        }
        if secret.len() < 8 {
            warn!(
                "secret is only {} characters long, tokens may be easy to forge",
                secret.len()
            );
        }
        Ok(())
    }

    /// 验证令牌参数名：小写字母开头，其后为小写字母、数字或下划线
    pub fn validate_token_key(key: &str) -> Result<()> {
        let lowered = key.to_lowercase();
        let mut chars = lowered.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

        if !valid {
            bail!(
                "token_key '{}' is invalid: must start with a letter and contain only letters, digits or '_'",
                key
            );
        }
        Ok(())
    }

    /// 验证监听地址
    pub fn validate_bind_addr(addr: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("bind_addr cannot be empty");
        }
        match addr.to_socket_addrs().map(|mut addrs| addrs.next().is_some()) {
            Ok(true) => Ok(()),
            _ => bail!("bind_addr '{}' is not a valid host:port", addr),
        }
    }

    /// 验证路由：必须是绝对路径且互不相同
    pub fn validate_routes(routes: &RouteConfig) -> Result<()> {
        let all = [
            ("routes.stream", &routes.stream),
            ("routes.datagram", &routes.datagram),
            ("routes.tunnel", &routes.tunnel),
            ("routes.status", &routes.status),
            ("routes.health", &routes.health),
        ];

        let mut seen = HashSet::new();
        for (name, path) in all {
            if !path.starts_with('/') {
                bail!("{} must be an absolute path (got '{}')", name, path);
            }
            if !seen.insert(path.as_str()) {
                bail!("{} '{}' is already used by another route", name, path);
            }
        }
        Ok(())
    }

    /// 验证网关配置
    pub fn validate_gateway_config(config: &GatewayConfig) -> Result<()> {
        Self::validate_bind_addr(&config.bind_addr)?;
        Self::validate_secret(&config.secret)?;
        Self::validate_token_key(&config.token_key)?;

        if config.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }
        if config.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }
        if config.dial_timeout_secs == 0 {
            bail!("dial_timeout_secs must be greater than 0");
        }
        if config.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be greater than 0");
        }

        if let Some(ref split) = config.token_split {
            if split.marker.is_empty() {
                bail!("token_split.marker cannot be empty");
            }
        }

        // 验证证书配置
        match (&config.cert_path, &config.key_path) {
            (Some(_), Some(_)) | (None, None) => {}
            _ => bail!("cert_path and key_path must both be set, or both omitted to serve plain ws://"),
        }

        Self::validate_routes(&config.routes)?;

        if config.buffer_size > 1024 * 1024 {
            warn!(
                "buffer_size is very large ({} bytes), every session holds one pooled buffer of this size",
                config.buffer_size
            );
        }

        Ok(())
    }
}
