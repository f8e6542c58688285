// 传输层工厂 - 根据配置创建接入实例

use crate::config::GatewayConfig;
use crate::transport::{ClientAcceptor, PlainAcceptor, TlsClientAcceptor};
use anyhow::{Context, Result};
use std::sync::Arc;

/// 创建入站连接接入器：配置了证书和私钥时使用 TLS，否则明文
pub fn create_acceptor(config: &GatewayConfig) -> Result<Arc<dyn ClientAcceptor>> {
    let acceptor: Arc<dyn ClientAcceptor> = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => {
            let tls_config = crate::tls::load_server_config(cert, key)
                .context("Failed to load TLS certificate")?;
            Arc::new(TlsClientAcceptor::new(tls_config))
        }
        _ => Arc::new(PlainAcceptor),
    };

    Ok(acceptor)
}
