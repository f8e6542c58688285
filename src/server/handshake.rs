/// HTTP/1.1 请求头读取与 WebSocket 升级
///
/// 请求头大小有上限（默认 8KB），防止慢速或超大请求耗尽内存。
/// 升级响应写出后，已经读入但属于 WebSocket 帧的字节交还给 WebSocket 流。
use crate::access_log::RequestInfo;
use crate::error::{GatewayError, Result};
use crate::session::ClientSocket;
use crate::transport::ClientIo;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

/// HTTP 请求头最大大小（默认 8KB）
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// 超过该数量的请求头按请求头过大处理
const MAX_HEADERS: usize = 128;
const READ_CHUNK: usize = 1024;

/// `Server` 响应头
pub fn server_header() -> String {
    format!("ws-gateway/{}", env!("CARGO_PKG_VERSION"))
}

/// 解析后的请求头
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// 查询参数（按 application/x-www-form-urlencoded 解码，`+` 变为空格）
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `X-Forwarded-For` 中的第一个地址
    pub fn forwarded_client(&self) -> Option<&str> {
        self.header("x-forwarded-for")?
            .split(',')
            .map(str::trim)
            .find(|s| !s.is_empty())
    }

    /// `GET /path?query HTTP/1.1`
    pub fn request_line(&self) -> String {
        format!("{} {} {:?}", self.method, self.uri, self.version)
    }

    /// 是否为合法的 WebSocket 升级请求
    pub fn is_websocket_upgrade(&self) -> bool {
        let has_token = |name: &str, token: &str| {
            self.headers.get_all(name).iter().any(|v| {
                v.to_str()
                    .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                    .unwrap_or(false)
            })
        };

        self.method == Method::GET
            && self.version >= Version::HTTP_11
            && has_token("connection", "upgrade")
            && has_token("upgrade", "websocket")
            && self.header("sec-websocket-version") == Some("13")
            && self.header("sec-websocket-key").is_some()
    }

    /// 访问日志需要的请求信息
    pub fn request_info(&self, peer: SocketAddr, accepted_at: Instant) -> RequestInfo {
        RequestInfo {
            peer,
            request_line: self.request_line(),
            user_agent: self.header("user-agent").map(str::to_string),
            forwarded_for: self.header("x-forwarded-for").map(str::to_string),
            real_ip: self.header("x-real-ip").map(str::to_string),
            accepted_at,
        }
    }
}

/// 读取并解析请求头，返回请求头和多读的字节
pub async fn read_request_head<R>(io: &mut R, limit: usize) -> Result<(RequestHead, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(GatewayError::bad_request(
                "connection closed before the request head was complete",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head, consumed)) = parse_head(&buf, limit)? {
            let leftover = buf.split_off(consumed);
            return Ok((head, leftover));
        }

        if buf.len() >= limit {
            return Err(GatewayError::HeadTooLarge { limit });
        }
    }
}

fn parse_head(buf: &[u8], limit: usize) -> Result<Option<(RequestHead, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(GatewayError::HeadTooLarge { limit }),
        Err(e) => return Err(GatewayError::bad_request(e.to_string())),
    };

    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| GatewayError::bad_request("invalid method"))?;
    let uri = req
        .path
        .and_then(|p| p.parse::<Uri>().ok())
        .ok_or_else(|| GatewayError::bad_request("invalid request target"))?;
    let version = match req.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut map = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| GatewayError::bad_request(format!("invalid header name '{}'", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| GatewayError::bad_request(format!("invalid value for '{}'", h.name)))?;
        map.append(name, value);
    }

    Ok(Some((
        RequestHead {
            method,
            uri,
            version,
            headers: map,
        },
        consumed,
    )))
}

/// 写一个简单的 HTTP 响应并刷新
pub async fn write_response<W>(
    io: &mut W,
    status: StatusCode,
    content_type: &str,
    body: &str,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Server: {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        server_header(),
        content_type,
        body.len(),
        body
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await
}

/// 完成 WebSocket 升级；不是升级请求时回复 400
pub async fn accept_websocket(
    mut io: ClientIo,
    head: &RequestHead,
    leftover: Vec<u8>,
) -> Result<ClientSocket> {
    let key = match head.header("sec-websocket-key") {
        Some(key) if head.is_websocket_upgrade() => key,
        _ => {
            let _ = write_response(
                &mut io,
                StatusCode::BAD_REQUEST,
                "text/plain; charset=utf-8",
                "Bad Request\n",
            )
            .await;
            let _ = io.shutdown().await;
            return Err(GatewayError::upgrade_failed(format!(
                "not a websocket handshake: {}",
                head.request_line()
            )));
        }
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Server: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         \r\n",
        server_header(),
        derive_accept_key(key.as_bytes())
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await?;

    Ok(WebSocketStream::from_partially_read(io, leftover, Role::Server, None).await)
}
