use crate::session::BackendKind;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 注册表中记录的会话信息
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub kind: BackendKind,
    pub client_addr: SocketAddr,
    pub target: String,
    pub started_at: Instant,
}

impl SessionEntry {
    pub fn new(kind: BackendKind, client_addr: SocketAddr, target: impl Into<String>) -> Self {
        Self {
            kind,
            client_addr,
            target: target.into(),
            started_at: Instant::now(),
        }
    }
}

/// 活跃会话注册表，容量在创建时固定
///
/// 所有操作只在锁内做 map 操作，不做任何 I/O
#[derive(Debug)]
pub struct SessionRegistry {
    capacity: usize,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 注册会话；已满或 key 已存在时返回 false
    pub fn try_register(&self, key: &str, entry: SessionEntry) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.capacity || sessions.contains_key(key) {
            return false;
        }
        sessions.insert(key.to_string(), entry);
        true
    }

    /// 移除会话，不存在时什么都不做
    pub fn deregister(&self, key: &str) -> bool {
        self.sessions.lock().remove(key).is_some()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 剩余可用会话数
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.count())
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// 当前会话列表的拷贝
    pub fn snapshot(&self) -> Vec<(String, SessionEntry)> {
        self.sessions
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }
}

/// 由客户端地址和接受时间生成会话 key（CRC-32 IEEE 的十进制表示）
pub fn session_key(peer: &SocketAddr, accepted_at: SystemTime) -> String {
    let nanos = accepted_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seed = format!("{}_{}-", peer, nanos);
    crc32fast::hash(seed.as_bytes()).to_string()
}
