use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 进程 ID 文件，离开作用域时删除
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// 写入当前进程 ID
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_pid(path, std::process::id())
    }

    fn create_with_pid(path: impl AsRef<Path>, pid: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to write pid file: {}", path.display()))?;
        debug!("Wrote pid {} to {}", pid, path.display());
        Ok(Self { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}
