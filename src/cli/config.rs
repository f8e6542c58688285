use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::GatewayConfig;

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &Path) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path).with_context(|| {
        format!(
            "Failed to read metadata for config file: {}",
            config_path.display()
        )
    })?;
    let mode = metadata.permissions().mode();

    // 口令以明文保存在配置文件中
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}). \
             It contains the token secret; consider chmod 600 {}",
            config_path.display(),
            mode & 0o777,
            config_path.display()
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &Path) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

impl CheckResult {
    fn print(&self, format: &str) -> Result<()> {
        if format == "json" {
            println!("{}", serde_json::to_string_pretty(self)?);
            return Ok(());
        }

        if let Some(error) = &self.error {
            println!("✗ {}", error);
            return Ok(());
        }
        if let Some(fields) = self.details.as_object() {
            for (name, value) in fields {
                println!("✓ {}: {}", name, value);
            }
        }
        for warning in &self.warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Gateway configuration is valid!");
        Ok(())
    }
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);
    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let result = inspect(path);
    result.print(format)?;

    match result.error {
        Some(error) => anyhow::bail!(error),
        None => Ok(()),
    }
}

fn inspect(path: &Path) -> CheckResult {
    if !path.exists() {
        return CheckResult::failed(format!("Configuration file not found: {}", path.display()));
    }

    let config = match GatewayConfig::load(path) {
        Ok(config) => config,
        Err(e) => return CheckResult::failed(format!("{:#}", e)),
    };
    if let Err(e) = config.validate() {
        return CheckResult::failed(format!("{:#}", e));
    }

    let mut warnings = Vec::new();
    let mut details = serde_json::json!({
        "bind_addr": config.bind_addr,
        "secret_length": config.secret.len(),
        "dial_timeout_secs": config.dial_timeout_secs,
        "buffer_size": config.buffer_size,
        "max_connections": config.max_connections,
        "frame_format": config.frame_format.to_string(),
        "token_key": config.token_key,
        "require_encrypted": config.require_encrypted,
        "proxy_protocol": config.proxy_protocol,
        "routes": config.routes,
    });

    if let Some(split) = &config.token_split {
        details["token_split"] = serde_json::json!(split);
    }

    if let (Some(cert), Some(key)) = (&config.cert_path, &config.key_path) {
        details["cert_path"] = serde_json::json!(cert);
        details["key_path"] = serde_json::json!(key);
        if !cert.exists() {
            warnings.push(format!("Certificate file not found: {}", cert.display()));
        }
        if !key.exists() {
            warnings.push(format!("Key file not found: {}", key.display()));
        }
    }

    if let Some(ca) = &config.tunnel.ca_cert_path {
        if !ca.exists() {
            warnings.push(format!("Tunnel CA file not found: {}", ca.display()));
        }
    }

    CheckResult {
        valid: true,
        warnings,
        error: None,
        details,
    }
}

impl CheckResult {
    fn failed(error: String) -> Self {
        Self {
            valid: false,
            warnings: Vec::new(),
            error: Some(error),
            details: serde_json::json!({}),
        }
    }
}
