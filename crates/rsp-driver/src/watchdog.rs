//! 看门狗与健康监控
//!
//! 后台线程按固定间隔检查回调活性：tick 计数停滞超过阈值的流标记为
//! stale，触发健康状态迁移与（可选的）带指数退避的自动恢复。恢复尝试
//! 发现厂商服务无响应时请求外部重启脚本；连续失败达到上限后状态闩锁到
//! Failed。设置缓存保存全部可调参数，重初始化后由恢复路径重放。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, select, tick};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rsp_vendor::gate::{request_service_restart, request_usb_reset};

use crate::antenna::current_antenna;
use crate::device::{DeviceShared, RspDevice};

/// 设备健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// 流活跃，回调正常到达
    Healthy,
    /// 轻微异常（回调变慢、超时偏多）
    Warning,
    /// 回调停止到达
    Stale,
    /// 恢复进行中
    Recovering,
    /// 厂商 API 调用超时
    ServiceUnresponsive,
    /// USB 设备被拔出
    DeviceRemoved,
    /// 不可恢复失败
    Failed,
}

/// 健康详情
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub callback_count: u64,
    /// 回调速率（次/秒，滚动）
    pub callback_rate: f64,
    /// 检测到的样本序号断档总数
    pub sample_gaps: u64,
    pub consecutive_timeouts: u32,
    pub recovery_attempts: u32,
    pub successful_recoveries: u32,
    pub last_error: String,
    pub last_healthy: Option<Instant>,
}

impl Default for HealthInfo {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            callback_count: 0,
            callback_rate: 0.0,
            sample_gaps: 0,
            consecutive_timeouts: 0,
            recovery_attempts: 0,
            successful_recoveries: 0,
            last_error: String::new(),
            last_healthy: None,
        }
    }
}

/// 看门狗配置
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// 回调静默判定阈值
    pub callback_timeout: Duration,
    /// 健康检查间隔
    pub check_interval: Duration,
    /// 单会话最大恢复尝试数
    pub max_recovery_attempts: u32,
    /// 首次恢复退避（指数翻倍）
    pub recovery_backoff: Duration,
    pub auto_recover: bool,
    pub restart_service_on_failure: bool,
    pub usb_reset_on_failure: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            callback_timeout: Duration::from_millis(2000),
            check_interval: Duration::from_millis(500),
            max_recovery_attempts: 3,
            recovery_backoff: Duration::from_millis(1000),
            auto_recover: true,
            restart_service_on_failure: true,
            usb_reset_on_failure: false,
        }
    }
}

/// 恢复结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryResult {
    Success,
    FailedUninit,
    FailedInit,
    FailedSettings,
    MaxAttemptsExceeded,
    ServiceDown,
    InProgress,
}

/// 恢复用的设置快照
#[derive(Debug, Clone)]
pub struct SettingsCache {
    pub rf_frequency_hz: f64,
    pub ppm_correction: f64,
    pub lna_state: u8,
    pub if_gain_reduction: i32,
    pub agc_enabled: bool,
    pub agc_set_point: i32,
    pub sample_rate: f64,
    pub decimation_enabled: bool,
    pub decimation_factor: u32,
    pub dc_correction_enabled: bool,
    pub iq_correction_enabled: bool,
    pub bias_t_enabled: bool,
    pub rf_notch_enabled: bool,
    pub dab_notch_enabled: bool,
    pub ext_ref_enabled: bool,
    pub hdr_enabled: bool,
    pub antenna_name: String,
    pub saved_at: Option<Instant>,
    pub is_valid: bool,
}

impl Default for SettingsCache {
    fn default() -> Self {
        Self {
            rf_frequency_hz: 200_000_000.0,
            ppm_correction: 0.0,
            lna_state: 4,
            if_gain_reduction: 40,
            agc_enabled: false,
            agc_set_point: -30,
            sample_rate: 2_000_000.0,
            decimation_enabled: false,
            decimation_factor: 1,
            dc_correction_enabled: true,
            iq_correction_enabled: true,
            bias_t_enabled: false,
            rf_notch_enabled: false,
            dab_notch_enabled: false,
            ext_ref_enabled: false,
            hdr_enabled: false,
            antenna_name: String::new(),
            saved_at: None,
            is_valid: false,
        }
    }
}

/// 看门狗线程控制块
#[derive(Default)]
pub(crate) struct WatchdogControl {
    pub running: std::sync::atomic::AtomicBool,
    pub stop_tx: Mutex<Option<Sender<()>>>,
    pub thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceShared {
    pub(crate) fn start_watchdog(self: &Arc<Self>) {
        if self.watchdog.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        *self.watchdog.stop_tx.lock() = Some(stop_tx);

        let interval = self.watchdog_config.lock().check_interval;
        let shared = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rsp-watchdog".into())
            .spawn(move || {
                debug!("watchdog thread running");
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => shared.watchdog_tick(),
                    }
                }
                debug!("watchdog thread exiting");
            })
            .ok();
        *self.watchdog.thread.lock() = handle;
    }

    pub(crate) fn stop_watchdog(&self) {
        if !self.watchdog.running.load(Ordering::SeqCst) {
            return;
        }
        // 丢弃发送端：接收侧 select 立即以 Err 返回并退出
        self.watchdog.stop_tx.lock().take();
        if let Some(handle) = self.watchdog.thread.lock().take() {
            let _ = handle.join();
        }
        self.watchdog.running.store(false, Ordering::SeqCst);
        debug!("watchdog thread stopped");
    }

    fn watchdog_tick(&self) {
        if !self.stream_active.load(Ordering::Acquire)
            || self.device_unavailable.load(Ordering::Acquire)
        {
            if self.device_unavailable.load(Ordering::Acquire) {
                self.update_health_status(HealthStatus::DeviceRemoved);
            }
            return;
        }

        let config = self.watchdog_config.lock().clone();

        let mut any_stale = false;
        let mut total_ticks = 0u64;
        let mut total_gaps = 0u64;
        for slot in self.streams.iter() {
            let Some(stream) = slot.load_full() else {
                continue;
            };
            total_ticks += stream.last_callback_ticks.load(Ordering::Relaxed);
            total_gaps += stream.sample_gap_count.load(Ordering::Relaxed);
            if stream.watchdog_stale(config.callback_timeout) {
                any_stale = true;
                warn!(
                    "stream {}: no callbacks for over {} ms - stream may be stale",
                    stream.channel,
                    config.callback_timeout.as_millis()
                );
            }
        }

        {
            let mut health = self.health.lock();
            let prev = health.callback_count;
            health.callback_count = total_ticks;
            health.sample_gaps = total_gaps;
            health.consecutive_timeouts = self.gate.consecutive_timeouts();
            let secs = config.check_interval.as_secs_f64();
            if secs > 0.0 && total_ticks >= prev {
                health.callback_rate = (total_ticks - prev) as f64 / secs;
            }
        }

        if any_stale {
            self.update_health_status(HealthStatus::Stale);
            if config.auto_recover {
                self.handle_stale_stream(&config);
            }
        } else if !self.gate.is_service_responsive() {
            self.update_health_status(HealthStatus::ServiceUnresponsive);
        } else {
            self.update_health_status(HealthStatus::Healthy);
        }
    }

    pub(crate) fn update_health_status(&self, new_status: HealthStatus) {
        let old = {
            let mut health = self.health.lock();
            let old = health.status;
            health.status = new_status;
            if new_status == HealthStatus::Healthy {
                health.last_healthy = Some(Instant::now());
            }
            old
        };
        if old != new_status {
            // 先拷出再调用，监听者可以安全地再注册或查询健康状态
            let listeners = self.health_listeners.lock().clone();
            for listener in &listeners {
                listener(new_status);
            }
        }
    }

    fn handle_stale_stream(&self, config: &WatchdogConfig) {
        let attempts = self.recovery_attempts.load(Ordering::Relaxed);
        if attempts >= config.max_recovery_attempts {
            error!("max recovery attempts exceeded - manual intervention required");
            self.update_health_status(HealthStatus::Failed);
            return;
        }

        // 指数退避：initial_backoff × 2^attempts
        if let Some(last) = *self.last_recovery_attempt.lock() {
            let backoff = config.recovery_backoff * 2u32.saturating_pow(attempts);
            if last.elapsed() < backoff {
                return;
            }
        }

        let result = self.attempt_stream_recovery(config);
        match result {
            RecoveryResult::Success => {
                info!("stream recovery successful");
                self.recovery_attempts.store(0, Ordering::Relaxed);
            }
            RecoveryResult::ServiceDown if config.restart_service_on_failure => {
                warn!("attempting service restart...");
                if request_service_restart() {
                    std::thread::sleep(Duration::from_secs(2));
                    self.attempt_stream_recovery(config);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn attempt_stream_recovery(&self, config: &WatchdogConfig) -> RecoveryResult {
        if self.recovery_in_progress.swap(true, Ordering::AcqRel) {
            return RecoveryResult::InProgress;
        }

        warn!("attempting stream recovery...");
        self.update_health_status(HealthStatus::Recovering);

        // 恢复前保存当前设置，重初始化后据此重放
        self.save_current_settings();

        // 厂商回调在 Init 时注册，不关闭设备无法重注册：这里检测并把
        // 状态暴露给应用，由应用 close/reopen 完成闭环
        warn!("stream appears stale. Application should close and reopen the stream to recover.");
        self.update_health_status(HealthStatus::Stale);

        let result = if !self.gate.is_service_responsive() {
            warn!("vendor service appears unresponsive");
            if config.restart_service_on_failure {
                if request_service_restart() {
                    self.gate.reset_health_tracking();
                    RecoveryResult::Success
                } else {
                    RecoveryResult::ServiceDown
                }
            } else {
                RecoveryResult::ServiceDown
            }
        } else {
            // 服务正常但流停滞：需要应用层重开
            RecoveryResult::FailedInit
        };

        self.recovery_in_progress.store(false, Ordering::Release);
        let attempts = self.recovery_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_recovery_attempt.lock() = Some(Instant::now());

        {
            let mut health = self.health.lock();
            health.recovery_attempts = attempts;
            if result == RecoveryResult::Success {
                health.successful_recoveries += 1;
            }
        }
        result
    }

    pub(crate) fn save_current_settings(&self) {
        let mut cache = self.settings_cache.lock();
        let st = self.general.lock();
        let ch = st.ch();

        cache.rf_frequency_hz = ch.tuner.rf_hz;
        if let Some(dev) = st.params.dev.as_ref() {
            cache.ppm_correction = dev.ppm;
            cache.sample_rate = dev.fs_hz;
            cache.ext_ref_enabled = match st.info.hw_ver {
                rsp_vendor::HwVariant::Rsp2 => dev.rsp2.ext_ref_output_en,
                rsp_vendor::HwVariant::RspDuo => dev.rsp_duo.ext_ref_output_en,
                _ => false,
            };
            cache.hdr_enabled = dev.rsp_dx.hdr_enable;
        }

        cache.lna_state = ch.tuner.gain.lna_state;
        cache.if_gain_reduction = ch.tuner.gain.gr_db;
        cache.agc_enabled = ch.ctrl.agc.enable;
        cache.agc_set_point = ch.ctrl.agc.set_point_dbfs;

        cache.decimation_enabled = ch.ctrl.decimation.enable;
        cache.decimation_factor = ch.ctrl.decimation.factor;
        cache.dc_correction_enabled = ch.ctrl.dc_offset.dc_enable;
        cache.iq_correction_enabled = ch.ctrl.dc_offset.iq_enable;

        match st.info.hw_ver {
            rsp_vendor::HwVariant::Rsp2 => {
                cache.bias_t_enabled = ch.rsp2.bias_t_enable;
                cache.rf_notch_enabled = ch.rsp2.rf_notch_enable;
            }
            rsp_vendor::HwVariant::RspDuo => {
                cache.bias_t_enabled = ch.rsp_duo.bias_t_enable;
                cache.rf_notch_enabled = ch.rsp_duo.rf_notch_enable;
                cache.dab_notch_enabled = ch.rsp_duo.rf_dab_notch_enable;
            }
            rsp_vendor::HwVariant::Rsp1a | rsp_vendor::HwVariant::Rsp1b => {
                cache.bias_t_enabled = ch.rsp1a.bias_t_enable;
                if let Some(dev) = st.params.dev.as_ref() {
                    cache.rf_notch_enabled = dev.rsp1a.rf_notch_enable;
                    cache.dab_notch_enabled = dev.rsp1a.rf_dab_notch_enable;
                }
            }
            rsp_vendor::HwVariant::RspDx | rsp_vendor::HwVariant::RspDxR2 => {
                if let Some(dev) = st.params.dev.as_ref() {
                    cache.bias_t_enabled = dev.rsp_dx.bias_t_enable;
                    cache.rf_notch_enabled = dev.rsp_dx.rf_notch_enable;
                    cache.dab_notch_enabled = dev.rsp_dx.rf_dab_notch_enable;
                }
            }
            rsp_vendor::HwVariant::Rsp1 => {}
        }

        cache.antenna_name = current_antenna(&st, 0);
        cache.saved_at = Some(Instant::now());
        cache.is_valid = true;

        debug!("settings saved to cache for recovery");
    }
}

impl RspDevice {
    pub fn health_status(&self) -> HealthStatus {
        self.shared.health.lock().status
    }

    pub fn health_info(&self) -> HealthInfo {
        self.shared.health.lock().clone()
    }

    /// 注册健康状态迁移监听者
    pub fn register_health_callback(
        &self,
        callback: impl Fn(HealthStatus) + Send + Sync + 'static,
    ) {
        self.shared.health_listeners.lock().push(Arc::new(callback));
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        self.shared.watchdog_config.lock().clone()
    }

    pub fn set_watchdog_config(&self, config: WatchdogConfig) {
        *self.shared.watchdog_config.lock() = config;
    }

    /// 手动触发一次恢复
    pub fn trigger_recovery(&self) -> bool {
        let config = self.watchdog_config();
        self.shared.attempt_stream_recovery(&config) == RecoveryResult::Success
    }

    /// 请求外部服务重启脚本
    pub fn restart_service(&self) -> bool {
        request_service_restart()
    }

    /// 请求外部 USB 复位脚本（看门狗配置允许时）
    pub fn reset_usb_device(&self) -> bool {
        if !self.watchdog_config().usb_reset_on_failure {
            warn!("USB reset is disabled in watchdog config");
            return false;
        }
        let serial = self.serial();
        request_usb_reset(&serial)
    }

    /// 保存当前设置到恢复缓存
    pub fn save_settings(&self) {
        self.shared.save_current_settings();
    }

    pub fn invalidate_settings_cache(&self) {
        self.shared.settings_cache.lock().is_valid = false;
    }

    pub fn settings_cache(&self) -> SettingsCache {
        self.shared.settings_cache.lock().clone()
    }

    /// 从恢复缓存重放设置（重初始化后调用）
    pub fn restore_settings(&self) -> bool {
        let cache = self.shared.settings_cache.lock().clone();
        if !cache.is_valid {
            warn!("cannot restore settings - cache is not valid");
            return false;
        }

        self.set_frequency_element_impl(0, "RF", cache.rf_frequency_hz);
        self.set_frequency_element_impl(0, "CORR", cache.ppm_correction);

        self.set_gain_mode_impl(0, cache.agc_enabled);
        if !cache.agc_enabled {
            self.set_gain_element_impl(0, "IFGR", cache.if_gain_reduction as f64);
            self.set_gain_element_impl(0, "RFGR", cache.lna_state as f64);
        }
        self.write_setting_inner("agc_setpoint", &cache.agc_set_point.to_string());

        if !cache.antenna_name.is_empty() {
            self.set_antenna_impl(0, &cache.antenna_name);
        }

        let bool_str = |b: bool| if b { "true" } else { "false" };
        self.write_setting_inner("biasT_ctrl", bool_str(cache.bias_t_enabled));
        self.write_setting_inner("rfnotch_ctrl", bool_str(cache.rf_notch_enabled));
        self.write_setting_inner("dabnotch_ctrl", bool_str(cache.dab_notch_enabled));
        if matches!(
            self.hw_variant(),
            rsp_vendor::HwVariant::RspDx | rsp_vendor::HwVariant::RspDxR2
        ) {
            self.write_setting_inner("hdr_ctrl", bool_str(cache.hdr_enabled));
        }

        info!("settings restored from cache");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watchdog_config_defaults() {
        let c = WatchdogConfig::default();
        assert!(c.enabled);
        assert_eq!(c.callback_timeout, Duration::from_millis(2000));
        assert_eq!(c.check_interval, Duration::from_millis(500));
        assert_eq!(c.max_recovery_attempts, 3);
        assert_eq!(c.recovery_backoff, Duration::from_millis(1000));
        assert!(c.auto_recover);
        assert!(!c.usb_reset_on_failure);
    }

    #[test]
    fn test_settings_cache_starts_invalid() {
        let cache = SettingsCache::default();
        assert!(!cache.is_valid);
        assert!(cache.saved_at.is_none());
    }
}
