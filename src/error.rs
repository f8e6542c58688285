/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，网关各阶段（解码、拨号、转发）各自有独立的错误枚举，
/// 调用者据此区分日志级别与访问日志状态码
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// 网关的主要错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    /// HTTP 请求头读取或解析失败
    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// 请求头超过大小限制
    #[error("Request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    /// WebSocket 升级失败
    #[error("WebSocket upgrade failed: {0}")]
    UpgradeFailed(String),

    /// 超时错误
    #[error("Operation timeout after {duration:?}")]
    Timeout { duration: Duration },

    /// 地址令牌解码失败
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// 后端拨号失败
    #[error(transparent)]
    Dial(#[from] DialError),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// 创建请求解析错误
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// 创建升级失败错误
    pub fn upgrade_failed(msg: impl Into<String>) -> Self {
        Self::UpgradeFailed(msg.into())
    }

    /// 创建超时错误
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// 地址令牌解码错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// 令牌为空
    #[error("empty token")]
    Empty,

    /// 切分标记后的片段不存在
    #[error("split segment {index} out of range ({segments} segments)")]
    SplitOutOfRange { index: usize, segments: usize },

    /// 无法解密
    #[error("undecryptable: {reason}")]
    Undecryptable { reason: String },

    /// 解码结果不是合法的 host:port
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
}

impl DecodeError {
    pub fn undecryptable(reason: impl Into<String>) -> Self {
        Self::Undecryptable {
            reason: reason.into(),
        }
    }

    pub fn is_undecryptable(&self) -> bool {
        matches!(self, Self::Undecryptable { .. })
    }
}

/// 后端拨号错误
#[derive(Error, Debug)]
pub enum DialError {
    /// 在拨号超时内没有建立连接
    #[error("dial {addr} timed out after {duration:?}")]
    Timeout { addr: String, duration: Duration },

    /// 连接被拒绝、不可达或解析失败
    #[error("dial {addr} failed: {reason}")]
    Failed { addr: String, reason: String },
}

impl DialError {
    pub fn timeout(addr: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            addr: addr.into(),
            duration,
        }
    }

    pub fn failed(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Failed {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 访问日志中使用的状态码：超时 504，其余 502
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => crate::access_log::STATUS_DIAL_TIMEOUT,
            Self::Failed { .. } => crate::access_log::STATUS_DIAL_FAILED,
        }
    }
}

/// 会话转发过程中的终止原因
///
/// 所有变体对会话的处理都相同（拆除会话），区别只在日志级别
#[derive(Error, Debug)]
pub enum RelayError {
    /// 对端正常结束流（EOF）
    #[error("end of stream")]
    Eof,

    /// 收到 WebSocket 关闭帧
    #[error("closed with code {code}")]
    Closed { code: u16 },

    /// 写入字节数少于请求写入的字节数
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// WebSocket 协议层错误
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// 未携带状态码的关闭帧（RFC 6455 1005）
pub const CLOSE_NO_STATUS: u16 = 1005;

impl RelayError {
    /// 由关闭帧构造，缺少关闭帧视为 1005
    pub fn closed(frame: Option<&CloseFrame>) -> Self {
        let code = frame
            .map(|f| u16::from(f.code))
            .unwrap_or(CLOSE_NO_STATUS);
        Self::Closed { code }
    }

    /// 是否属于预期内的断开（正常关闭、离开、无状态码、EOF）
    pub fn is_expected(&self) -> bool {
        match self {
            Self::Eof => true,
            Self::Closed { code } => is_expected_close_code(*code),
            Self::WebSocket(tungstenite::Error::ConnectionClosed)
            | Self::WebSocket(tungstenite::Error::AlreadyClosed) => true,
            _ => false,
        }
    }
}

/// 1000 / 1001 / 1005 属于客户端主动断开
pub fn is_expected_close_code(code: u16) -> bool {
    matches!(
        CloseCode::from(code),
        CloseCode::Normal | CloseCode::Away | CloseCode::Status
    )
}
