/// 会话读写缓冲池
///
/// 每个会话两个方向各借用一个固定大小的缓冲区，会话结束后归还以供复用。
/// 缓冲区在复用之间不清零，调用者只读取最近一次读入的前 n 个字节。
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct PoolInner {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Vec<u8>>>,
    allocated: AtomicUsize,
}

/// 固定大小缓冲区池，克隆共享同一个空闲列表
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("max_idle", &self.inner.max_idle)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl BufferPool {
    /// 创建缓冲池，`max_idle` 为最多保留的空闲缓冲区数量
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_idle,
                idle: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// 借出一个缓冲区，空闲列表为空时直接分配，从不阻塞
    pub fn acquire(&self) -> PooledBuf {
        let reused = self.inner.idle.lock().pop();
        let buf = reused.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.inner.buffer_size]
        });

        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// 归还缓冲区；尺寸不符或空闲列表已满时直接丢弃
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.inner.buffer_size {
            return;
        }
        buf.resize(self.inner.buffer_size, 0);

        let mut idle = self.inner.idle.lock();
        if idle.len() < self.inner.max_idle {
            idle.push(buf);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// 当前空闲缓冲区数量
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// 累计分配过的缓冲区数量
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}

/// 借出的缓冲区，Drop 时自动归还
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
