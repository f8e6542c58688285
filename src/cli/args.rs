use crate::config::{FrameFormat, GatewayConfig, GatewayConfigBuilder, TokenSplit};
use crate::proxy_header::ProxyProtocolVersion;
use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ws-gateway")]
#[command(author, version, about = "WebSocket to TCP/UDP/WebSocket tunneling gateway", long_about = None)]
pub struct Cli {
    /// 日志详细程度（-v debug，-vv trace）
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// 日志文件路径：命令行优先，其次配置文件
    pub fn log_file(&self) -> Option<PathBuf> {
        match &self.command {
            Commands::Serve(args) => args.log_file.clone().or_else(|| {
                args.config
                    .as_ref()
                    .and_then(|path| GatewayConfig::load(path).ok())
                    .and_then(|config| config.log_file)
            }),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行网关
    Serve(ServeArgs),
    /// 将目标地址加密为令牌
    Encrypt {
        /// 口令
        #[arg(short, long)]
        secret: String,

        /// 目标地址（host:port）
        addr: String,
    },
    /// 解密令牌
    Decrypt {
        /// 口令
        #[arg(short, long)]
        secret: String,

        /// 令牌
        token: String,
    },
    /// 生成自签名证书
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// 配置文件路径（TOML，`[gateway]` 段）
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 监听地址
    #[arg(long, value_name = "HOST:PORT")]
    pub addr: Option<String>,

    /// 解密令牌使用的口令
    #[arg(long)]
    pub secret: Option<String>,

    /// 拨号后端超时（秒）
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// 读写块大小（字节）
    #[arg(long, value_name = "BYTES")]
    pub buffer: Option<usize>,

    /// 最大并发会话数
    #[arg(long)]
    pub max_conns: Option<usize>,

    /// 后端数据转发给客户端的帧类型 (bin, text)
    #[arg(long, value_name = "FORMAT")]
    pub stream: Option<FrameFormat>,

    /// 令牌切分规则 "<marker>,<index>"
    #[arg(long, value_name = "MARKER,INDEX")]
    pub fsplit: Option<TokenSplit>,

    /// URL 中携带令牌的参数名
    #[arg(long, value_name = "KEY")]
    pub frkey: Option<String>,

    /// TLS 证书路径
    #[arg(long, value_name = "PATH")]
    pub ssl_cert: Option<PathBuf>,

    /// TLS 私钥路径
    #[arg(long, value_name = "PATH")]
    pub ssl_key: Option<PathBuf>,

    /// 只接受加密令牌
    #[arg(long)]
    pub aes_only: bool,

    /// 向 TCP/UDP 后端写入 PROXY 协议头
    #[arg(long)]
    pub proxyproto: bool,

    /// PROXY 协议版本 (1, 2)
    #[arg(long, value_name = "VERSION")]
    pub proxyproto_version: Option<ProxyProtocolVersion>,

    /// PID 文件路径
    #[arg(long, value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// 不写 PID 文件
    #[arg(long, conflicts_with = "pid_file")]
    pub no_pid_file: bool,

    /// 日志文件路径
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

impl ServeArgs {
    /// 加载配置文件（如有）并应用命令行覆盖项
    pub fn into_builder(self) -> Result<GatewayConfigBuilder> {
        let base = match &self.config {
            Some(path) => GatewayConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        let mut builder = GatewayConfigBuilder::from(base);
        if let Some(addr) = self.addr {
            builder = builder.bind_addr(addr);
        }
        if let Some(secret) = self.secret {
            builder = builder.secret(secret);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.dial_timeout_secs(timeout);
        }
        if let Some(buffer) = self.buffer {
            builder = builder.buffer_size(buffer);
        }
        if let Some(max) = self.max_conns {
            builder = builder.max_connections(max);
        }
        if let Some(format) = self.stream {
            builder = builder.frame_format(format);
        }
        if let Some(split) = self.fsplit {
            builder = builder.token_split(split);
        }
        if let Some(key) = self.frkey {
            builder = builder.token_key(key);
        }
        if let Some(cert) = self.ssl_cert {
            builder = builder.cert_path(cert);
        }
        if let Some(key) = self.ssl_key {
            builder = builder.key_path(key);
        }
        if self.aes_only {
            builder = builder.require_encrypted(true);
        }
        if self.proxyproto {
            builder = builder.proxy_protocol(true);
        }
        if let Some(version) = self.proxyproto_version {
            builder = builder.proxy_protocol_version(version);
        }
        if self.no_pid_file {
            builder = builder.pid_file(None);
        } else if let Some(path) = self.pid_file {
            builder = builder.pid_file(Some(path));
        }
        if let Some(path) = self.log_file {
            builder = builder.log_file(path);
        }

        Ok(builder)
    }

    /// 生成最终配置（含校验）
    pub fn resolve(self) -> Result<GatewayConfig> {
        self.into_builder()?.build()
    }
}
