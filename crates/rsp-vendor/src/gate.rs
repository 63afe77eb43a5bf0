//! 厂商 API 门闸
//!
//! 进程内唯一的厂商调用串行化点：
//! - 线程内可重入（thread-local 深度计数，0→1 时才真正拿厂商全局锁）
//! - 每次调用带墙钟超时；超时后调用线程被脱离，输入经闭包所有权存活到
//!   厂商调用最终返回为止
//! - 连续超时达到阈值后拒绝后续调用，并请求外部脚本重启服务
//! - API open/close 为进程级单例，open 永久失败后快速失败直到进程重启

use std::cell::RefCell;
use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::api::VendorApi;
use crate::error::VendorError;

/// 厂商调用默认超时（毫秒）。服务失去响应时防止调用线程无限挂起。
pub const SDRPLAY_API_TIMEOUT_MS: u64 = 10_000;

/// 连续超时阈值：达到后拒绝调用并请求外部重启
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// 服务重启脚本（退出码 0 表示请求被接受）
const SERVICE_RESTART_COMMAND: &str = "sdrplay-service-restart";

thread_local! {
    // 每线程、每 gate 实例的重入深度
    static LOCK_DEPTH: RefCell<HashMap<usize, u32>> = RefCell::new(HashMap::new());
}

/// 厂商 API 门闸
pub struct ApiGate {
    api: Arc<dyn VendorApi>,
    timeout: Duration,
    consecutive_timeouts: AtomicU32,
    api_opened: AtomicBool,
    open_failed: AtomicBool,
}

/// 厂商锁的线程内深度计数持有：0→1 的跃迁才真正拿厂商全局锁，
/// 归零才释放。`lock()` 与 `call()` 的调用线程共用这一个原语。
struct DepthGuard {
    key: usize,
    api: Arc<dyn VendorApi>,
}

impl DepthGuard {
    fn acquire(key: usize, api: Arc<dyn VendorApi>) -> Self {
        let depth = LOCK_DEPTH.with(|m| {
            let mut m = m.borrow_mut();
            let e = m.entry(key).or_insert(0);
            *e += 1;
            *e
        });
        if depth == 1 {
            api.lock_device_api();
        }
        Self { key, api }
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        let depth = LOCK_DEPTH.with(|m| {
            let mut m = m.borrow_mut();
            match m.get_mut(&self.key) {
                Some(e) if *e > 0 => {
                    *e -= 1;
                    let d = *e;
                    if d == 0 {
                        m.remove(&self.key);
                    }
                    d
                }
                _ => 0,
            }
        });
        if depth == 0 {
            self.api.unlock_device_api();
        }
    }
}

/// 门闸持有凭证。Drop 时在深度归零的线程上释放厂商锁。
pub struct GateGuard<'a> {
    _gate: &'a ApiGate,
    _depth: DepthGuard,
}

impl ApiGate {
    pub fn new(api: Arc<dyn VendorApi>) -> Self {
        Self::with_timeout(api, Duration::from_millis(SDRPLAY_API_TIMEOUT_MS))
    }

    pub fn with_timeout(api: Arc<dyn VendorApi>, timeout: Duration) -> Self {
        Self {
            api,
            timeout,
            consecutive_timeouts: AtomicU32::new(0),
            api_opened: AtomicBool::new(false),
            open_failed: AtomicBool::new(false),
        }
    }

    pub fn api(&self) -> &Arc<dyn VendorApi> {
        &self.api
    }

    fn key(&self) -> usize {
        self as *const _ as usize
    }

    /// 获取门闸（同线程可重入）
    pub fn lock(&self) -> GateGuard<'_> {
        GateGuard {
            _gate: self,
            _depth: DepthGuard::acquire(self.key(), Arc::clone(&self.api)),
        }
    }

    /// 打开厂商 API（进程级单例）
    ///
    /// 永久失败后（open 超时或出错）在进程重启前一律快速失败。
    pub fn open(&self) -> Result<(), VendorError> {
        if self.open_failed.load(Ordering::Acquire) {
            return Err(VendorError::OpenPermanentlyFailed);
        }
        if self.api_opened.load(Ordering::Acquire) {
            return Ok(());
        }

        let api = Arc::clone(&self.api);
        let result = self.call_detached("sdrplay_api_Open", move || api.open());

        match result {
            Ok(Ok(())) => {
                self.api_opened.store(true, Ordering::Release);
            }
            Ok(Err(e)) => {
                error!("sdrplay_api_Open failed: {e}");
                self.open_failed.store(true, Ordering::Release);
                return Err(e);
            }
            Err(e) => {
                error!("sdrplay_api_Open timed out - the vendor service may be unresponsive");
                self.open_failed.store(true, Ordering::Release);
                return Err(e);
            }
        }

        // 版本核对，不匹配仅告警
        let api = Arc::clone(&self.api);
        match self.call_detached("sdrplay_api_ApiVersion", move || api.api_version()) {
            Ok(Ok(ver)) => {
                debug!("vendor API version {ver:.3}");
            }
            Ok(Err(e)) => {
                warn!("api_version check failed: {e}");
            }
            Err(e) => {
                self.open_failed.store(true, Ordering::Release);
                self.api_opened.store(false, Ordering::Release);
                return Err(e);
            }
        }

        Ok(())
    }

    /// 关闭厂商 API（超时后脱离清理）
    pub fn close(&self) {
        if !self.api_opened.swap(false, Ordering::AcqRel) {
            return;
        }
        let api = Arc::clone(&self.api);
        match self.call_detached("sdrplay_api_Close", move || api.close()) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("sdrplay_api_Close failed: {e}"),
            Err(_) => error!("sdrplay_api_Close timed out - service may be unresponsive"),
        }
    }

    pub fn is_open(&self) -> bool {
        self.api_opened.load(Ordering::Acquire)
    }

    /// 带墙钟超时执行厂商调用（调用线程经深度计数门闸持锁）
    ///
    /// 超时返回 `ServiceUnresponsive`；挂起的调用线程保留输入的所有权，
    /// 厂商最终返回后自行退出，不泄漏进程线程之外的资源。
    pub fn call<T, F>(&self, name: &'static str, f: F) -> Result<T, VendorError>
    where
        T: Send + 'static,
        F: FnOnce(&Arc<dyn VendorApi>) -> T + Send + 'static,
    {
        self.ensure_service_responsive()?;

        let api = Arc::clone(&self.api);
        let gate_key = self.key();
        let timeout = self.timeout;

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("vendor-{name}"))
            .spawn(move || {
                // 厂商锁必须由发起调用的线程持有：与 lock() 共用同一个
                // 深度计数原语获取，脱离后由本线程在归零时释放。
                // 注意：调用方不得在持有 gate.lock() 的状态下进入 call()。
                let lock = DepthGuard::acquire(gate_key, Arc::clone(&api));
                let out = f(&api);
                drop(lock);
                // 即便接收端已超时放弃，send 失败也只意味着结果被丢弃
                let _ = tx.send(out);
            });

        if let Err(e) = spawned {
            return Err(VendorError::Call {
                call: name,
                message: format!("failed to spawn call thread: {e}"),
            });
        }

        match rx.recv_timeout(timeout) {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(RecvTimeoutError::Timeout) => {
                self.record_timeout(name);
                Err(VendorError::ServiceUnresponsive(name))
            }
            Err(RecvTimeoutError::Disconnected) => Err(VendorError::Call {
                call: name,
                message: "vendor call thread terminated unexpectedly".into(),
            }),
        }
    }

    // 与 call() 相同，但不经过健康检查（open/close 路径自己管理状态）
    fn call_detached<T, F>(&self, name: &'static str, f: F) -> Result<T, VendorError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("vendor-{name}"))
            .spawn(move || {
                let _ = tx.send(f());
            });
        if let Err(e) = spawned {
            return Err(VendorError::Call {
                call: name,
                message: format!("failed to spawn call thread: {e}"),
            });
        }
        match rx.recv_timeout(self.timeout) {
            Ok(v) => Ok(v),
            Err(RecvTimeoutError::Timeout) => {
                self.record_timeout(name);
                Err(VendorError::ServiceUnresponsive(name))
            }
            Err(RecvTimeoutError::Disconnected) => Err(VendorError::Call {
                call: name,
                message: "vendor call thread terminated unexpectedly".into(),
            }),
        }
    }

    /// 连续超时计数（看门狗用）
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts.load(Ordering::Relaxed)
    }

    pub fn is_service_responsive(&self) -> bool {
        self.consecutive_timeouts() < MAX_CONSECUTIVE_TIMEOUTS
    }

    pub fn reset_health_tracking(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
    }

    fn record_timeout(&self, name: &'static str) {
        let n = self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("vendor call {name} timed out ({n} consecutive)");
    }

    // 阈值之上先尝试外部重启；重启被接受则复位计数，否则判定服务不可用
    fn ensure_service_responsive(&self) -> Result<(), VendorError> {
        let n = self.consecutive_timeouts();
        if n < MAX_CONSECUTIVE_TIMEOUTS {
            return Ok(());
        }
        warn!("vendor service unresponsive after {n} consecutive timeouts, requesting restart");
        if request_service_restart() {
            self.reset_health_tracking();
            Ok(())
        } else {
            Err(VendorError::ServiceDown {
                consecutive_timeouts: n,
            })
        }
    }
}

/// 请求外部服务重启（opaque 副作用，退出码 0 = 接受）
pub fn request_service_restart() -> bool {
    let direct = Command::new(SERVICE_RESTART_COMMAND).status();
    let ok = match direct {
        Ok(status) if status.success() => true,
        _ => {
            // 非 root 场景：脚本可能登记在 sudoers 中
            Command::new("sudo")
                .args(["-n", SERVICE_RESTART_COMMAND])
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }
    };
    if ok {
        info!("vendor service restart requested");
        thread::sleep(Duration::from_secs(3));
    } else {
        error!("vendor service restart failed - check {SERVICE_RESTART_COMMAND} and sudoers");
    }
    ok
}

/// 请求外部 USB 复位（opaque 副作用，退出码 0 = 接受）
pub fn request_usb_reset(serial: &str) -> bool {
    let ok = Command::new("sdrplay-usb-reset")
        .arg(serial)
        .status()
        .map(|s| s.success())
        .unwrap_or_else(|_| {
            Command::new("sudo")
                .args(["-n", "sdrplay-usb-reset", serial])
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        });
    if ok {
        info!("USB reset requested for {serial}, waiting for re-enumeration");
        thread::sleep(Duration::from_secs(5));
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockVendorApi;
    use std::time::Instant;

    #[test]
    fn test_gate_reentrant_same_thread() {
        let api: Arc<dyn VendorApi> = Arc::new(MockVendorApi::new());
        let gate = ApiGate::new(Arc::clone(&api));

        let g1 = gate.lock();
        // 同线程重入不会死锁
        let g2 = gate.lock();
        drop(g2);
        drop(g1);
        // 释放后其它线程可获取
        let gate = Arc::new(gate);
        let g = Arc::clone(&gate);
        let h = thread::spawn(move || {
            let _guard = g.lock();
        });
        h.join().unwrap();
    }

    #[test]
    fn test_call_serializes_with_held_lock() {
        // lock() 与 call() 走同一个深度计数门闸：锁被持有时 call 必须等待
        let api: Arc<dyn VendorApi> = Arc::new(MockVendorApi::new());
        let gate = Arc::new(ApiGate::new(api));

        let guard = gate.lock();
        let g = Arc::clone(&gate);
        let h = thread::spawn(move || g.call("while_locked", |_| 5).unwrap());
        thread::sleep(Duration::from_millis(100));
        drop(guard);
        assert_eq!(h.join().unwrap(), 5);
    }

    #[test]
    fn test_call_success_resets_timeouts() {
        let api: Arc<dyn VendorApi> = Arc::new(MockVendorApi::new());
        let gate = ApiGate::new(api);
        let out = gate.call("test_call", |_| 42).unwrap();
        assert_eq!(out, 42);
        assert_eq!(gate.consecutive_timeouts(), 0);
    }

    #[test]
    fn test_call_timeout_detaches_and_counts() {
        let api: Arc<dyn VendorApi> = Arc::new(MockVendorApi::new());
        let gate = ApiGate::with_timeout(api, Duration::from_millis(50));

        let started = Instant::now();
        let err = gate
            .call("hung_call", |_| {
                thread::sleep(Duration::from_millis(300));
                7
            })
            .unwrap_err();
        // 调用方在超时内返回，不等挂起的线程
        assert!(started.elapsed() < Duration::from_millis(250));
        assert!(matches!(err, VendorError::ServiceUnresponsive(_)));
        assert_eq!(gate.consecutive_timeouts(), 1);

        // 挂起调用最终完成后，后续调用恢复正常并复位计数
        thread::sleep(Duration::from_millis(350));
        let out = gate.call("ok_call", |_| 1).unwrap();
        assert_eq!(out, 1);
        assert_eq!(gate.consecutive_timeouts(), 0);
    }

    #[test]
    fn test_open_is_idempotent() {
        let api: Arc<dyn VendorApi> = Arc::new(MockVendorApi::new());
        let gate = ApiGate::new(api);
        gate.open().unwrap();
        assert!(gate.is_open());
        gate.open().unwrap();
        gate.close();
        assert!(!gate.is_open());
    }
}
