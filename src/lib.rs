/// ws-gateway 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod access_log;
pub mod buffer_pool;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod pidfile;
pub mod proxy_header;
pub mod server;
pub mod session;
pub mod tls;
pub mod transport;

// 重新导出常用类型
pub use buffer_pool::{BufferPool, PooledBuf};
pub use codec::AddressCodec;
pub use config::{FrameFormat, GatewayConfig, GatewayConfigBuilder, TokenSplit};
pub use error::{DecodeError, DialError, GatewayError, RelayError, Result};
pub use proxy_header::{ProxyHeader, ProxyProtocolVersion};
pub use server::{Gateway, ServerDependencies, ServerState, SessionRegistry};
pub use session::{Backend, BackendKind, DialOptions};
