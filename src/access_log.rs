//! One line per upgrade outcome, emitted under the `access` tracing target.
//!
//! Layout:
//! `$elapsed $remote_host "net:$backend_local->$target" "$request" $status "$user_agent" $x_forwarded_for $x_real_ip "User-Id:$key"`

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Handshake finished and the session was started.
pub const STATUS_OK: u16 = 200;
/// The token could not be turned into a dial target.
pub const STATUS_BAD_TOKEN: u16 = 400;
/// Backend refused or unreachable.
pub const STATUS_DIAL_FAILED: u16 = 502;
/// Backend dropped an established session abnormally.
pub const STATUS_BACKEND_CLOSED: u16 = 503;
/// Backend did not answer within the dial timeout.
pub const STATUS_DIAL_TIMEOUT: u16 = 504;

/// Request facts captured once when the handshake is read.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub peer: SocketAddr,
    pub request_line: String,
    pub user_agent: Option<String>,
    pub forwarded_for: Option<String>,
    pub real_ip: Option<String>,
    pub accepted_at: Instant,
}

impl RequestInfo {
    pub fn elapsed(&self) -> Duration {
        self.accepted_at.elapsed()
    }
}

/// A single access record.
#[derive(Debug)]
pub struct AccessRecord<'a> {
    pub request: &'a RequestInfo,
    pub elapsed: Duration,
    pub backend_local: Option<SocketAddr>,
    pub target: Option<&'a str>,
    pub status: u16,
    pub key: &'a str,
}

impl<'a> AccessRecord<'a> {
    pub fn new(request: &'a RequestInfo, status: u16, key: &'a str) -> Self {
        Self {
            request,
            elapsed: request.elapsed(),
            backend_local: None,
            target: None,
            status,
            key,
        }
    }

    pub fn backend_local(mut self, addr: Option<SocketAddr>) -> Self {
        self.backend_local = addr;
        self
    }

    pub fn target(mut self, target: &'a str) -> Self {
        self.target = Some(target);
        self
    }

    pub fn emit(&self) {
        info!(target: "access", "{}", self);
    }
}

fn or_dash(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "-",
    }
}

impl fmt::Display for AccessRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self
            .backend_local
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-:nil".to_string());
        let target = match self.target {
            Some(t) if !t.is_empty() => t,
            _ => "-:nil",
        };

        write!(
            f,
            "{:?} {} \"net:{}->{}\" \"{}\" {} \"{}\" {} {} \"User-Id:{}\"",
            self.elapsed,
            self.request.peer.ip(),
            local,
            target,
            self.request.request_line,
            self.status,
            or_dash(self.request.user_agent.as_deref()),
            or_dash(self.request.forwarded_for.as_deref()),
            or_dash(self.request.real_ip.as_deref()),
            or_dash(Some(self.key)),
        )
    }
}
