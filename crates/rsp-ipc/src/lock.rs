//! 跨进程设备开启锁
//!
//! sdrplay 服务同一时刻只能容忍一个在途的设备选定操作。所有共享该服务的
//! 进程（代理、worker、普通宿主进程）在打开设备的临界区内持有这把
//! 建议性文件锁；释放后的冷却间隔通过锁文件 mtime 度量，防止背靠背的
//! 选定操作压垮服务。进程内可重入（深度计数）。

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::IpcError;

/// 默认锁文件（worker 的 Configure/Start 临界区）
pub const DEFAULT_LOCK_PATH: &str = "/tmp/soapy_sdrplay.lock";
/// 代理侧设备开启门的锁文件
pub const PROXY_OPEN_LOCK_PATH: &str = "/tmp/soapy_sdrplay_proxy.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

struct LockState {
    file: Option<File>,
    depth: u32,
}

/// 跨进程文件锁 + 冷却
pub struct CrossProcessLock {
    path: PathBuf,
    state: Mutex<LockState>,
}

impl CrossProcessLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(LockState {
                file: None,
                depth: 0,
            }),
        }
    }

    /// 获取锁。`timeout` 为 0 表示无限等待；`cooldown` 为距离上次释放的
    /// 最小间隔（从锁文件 mtime 推算）。
    pub fn acquire(&self, timeout: Duration, cooldown: Duration) -> Result<(), IpcError> {
        let mut st = self.state.lock();

        // 进程内重入
        if st.depth > 0 {
            st.depth += 1;
            return Ok(());
        }

        if st.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&self.path)?;
            st.file = Some(file);
        }
        let file = st.file.as_ref().unwrap();

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if !timeout.is_zero() && start.elapsed() >= timeout {
                warn!(
                    "cross-process lock timed out after {} ms: {}",
                    timeout.as_millis(),
                    self.path.display()
                );
                return Err(IpcError::LockTimeout(timeout.as_millis() as u64));
            }
            std::thread::sleep(RETRY_INTERVAL);
        }

        // 冷却：距上次释放（mtime）不足 cooldown 时补足等待
        if !cooldown.is_zero()
            && let Some(wait) = self.cooldown_remaining(file, cooldown)
        {
            debug!("cross-process lock cooldown wait {} ms", wait.as_millis());
            std::thread::sleep(wait);
        }

        st.depth = 1;
        debug!("cross-process lock acquired: {}", self.path.display());
        Ok(())
    }

    /// 释放锁（刷新 mtime 供后续冷却计算）
    pub fn release(&self) {
        let mut st = self.state.lock();
        if st.depth == 0 {
            return;
        }
        st.depth -= 1;
        if st.depth > 0 {
            return;
        }
        if let Some(file) = st.file.as_ref() {
            if let Err(e) = file.set_modified(SystemTime::now()) {
                warn!("failed to touch lock file mtime: {e}");
            }
            if let Err(e) = FileExt::unlock(file) {
                warn!("failed to unlock {}: {e}", self.path.display());
            }
        }
        debug!("cross-process lock released: {}", self.path.display());
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().depth > 0
    }

    fn cooldown_remaining(&self, file: &File, cooldown: Duration) -> Option<Duration> {
        let mtime = file.metadata().ok()?.modified().ok()?;
        let elapsed = SystemTime::now().duration_since(mtime).ok()?;
        (elapsed < cooldown).then(|| cooldown - elapsed)
    }
}

/// RAII 凭证
pub struct CrossProcessLockGuard<'a> {
    lock: &'a CrossProcessLock,
}

impl<'a> CrossProcessLockGuard<'a> {
    pub fn acquire(
        lock: &'a CrossProcessLock,
        timeout: Duration,
        cooldown: Duration,
    ) -> Result<Self, IpcError> {
        lock.acquire(timeout, cooldown)?;
        Ok(Self { lock })
    }
}

impl Drop for CrossProcessLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reentrant_acquire_release() {
        let dir = TempDir::new().unwrap();
        let lock = CrossProcessLock::new(dir.path().join("gate.lock"));

        lock.acquire(Duration::from_secs(1), Duration::ZERO).unwrap();
        lock.acquire(Duration::from_secs(1), Duration::ZERO).unwrap();
        assert!(lock.is_held());
        lock.release();
        assert!(lock.is_held());
        lock.release();
        assert!(!lock.is_held());
    }

    #[test]
    fn test_exclusive_between_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.lock");
        let a = CrossProcessLock::new(&path);
        let b = CrossProcessLock::new(&path);

        a.acquire(Duration::from_secs(1), Duration::ZERO).unwrap();
        let err = b
            .acquire(Duration::from_millis(120), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, IpcError::LockTimeout(_)));

        a.release();
        b.acquire(Duration::from_secs(1), Duration::ZERO).unwrap();
        b.release();
    }

    #[test]
    fn test_cooldown_delays_reacquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.lock");
        let lock = CrossProcessLock::new(&path);

        lock.acquire(Duration::from_secs(1), Duration::ZERO).unwrap();
        lock.release();

        let start = Instant::now();
        lock.acquire(Duration::from_secs(1), Duration::from_millis(300))
            .unwrap();
        // 刚释放过：冷却必须生效（留出文件系统 mtime 精度余量）
        assert!(start.elapsed() >= Duration::from_millis(150));
        lock.release();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gate.lock");
        let lock = CrossProcessLock::new(&path);
        {
            let _g =
                CrossProcessLockGuard::acquire(&lock, Duration::from_secs(1), Duration::ZERO)
                    .unwrap();
            assert!(lock.is_held());
        }
        assert!(!lock.is_held());
    }
}
