use super::registry::SessionRegistry;
use crate::session::BackendKind;
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

/// 运行状态快照
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub uuid: String,
    pub version: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub capacity: usize,
    pub available: usize,
    pub tcp: usize,
    pub udp: usize,
    pub ws: usize,
}

impl StatusReport {
    pub fn collect(server_id: &Uuid, started: Instant, registry: &SessionRegistry) -> Self {
        let snapshot = registry.snapshot();
        let count_kind =
            |kind: BackendKind| snapshot.iter().filter(|(_, e)| e.kind == kind).count();

        Self {
            uuid: server_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: started.elapsed().as_secs(),
            sessions: snapshot.len(),
            capacity: registry.capacity(),
            available: registry.available(),
            tcp: count_kind(BackendKind::Stream),
            udp: count_kind(BackendKind::Datagram),
            ws: count_kind(BackendKind::Tunnel),
        }
    }

    /// 文本格式的状态页面
    pub fn to_text(&self) -> String {
        format!(
            "====== Hello ws-gateway! ======\n\
             UUID: {}\n\
             Version: {}\n\
             Uptime: {}\n\
             Conns active: {} (tcp {}, udp {}, ws {})\n\
             Conns available: {} of {}\n",
            self.uuid,
            self.version,
            format_duration(self.uptime_secs),
            self.sessions,
            self.tcp,
            self.udp,
            self.ws,
            self.available,
            self.capacity,
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// 健康检查响应
pub fn health_text() -> &'static str {
    "ws-gateway is OK!"
}

/// 格式化持续时间
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}
