//! 设备会话
//!
//! 一个 `RspDevice` 对应一个选定的厂商设备句柄及其参数快照。选定、参数
//! 下发、释放都经过 [`ApiGate`] 串行化；(serial, sub-mode) 构成 cache
//! key，进程级的已占用集合拒绝双开。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use rsp_vendor::{
    ApiGate, ChannelParams, DeviceInfo, DeviceParams, Event, HwVariant, PowerOverload, RspDuoMode,
    StreamCallbacks, StreamCbParams, TunerSelect, UpdateExt1, UpdateReason, VendorError,
};
use rsp_vendor::api::DeviceHandle;

use crate::device_api::DeviceArgs;
use crate::error::DriverError;
use crate::stream::{BUFFER_SAMPLES, StreamRing, StreamSlot};
use crate::watchdog::{HealthInfo, SettingsCache, WatchdogConfig, WatchdogControl};

/// 进程级已占用 cache key 集合
fn claimed_keys() -> &'static Mutex<HashSet<String>> {
    static CLAIMED: std::sync::LazyLock<Mutex<HashSet<String>>> =
        std::sync::LazyLock::new(|| Mutex::new(HashSet::new()));
    &CLAIMED
}

/// 当前进程占用的 cache key 快照（枚举补全用）
pub fn claimed_cache_keys() -> Vec<String> {
    claimed_keys().lock().iter().cloned().collect()
}

pub(crate) fn claim_key(key: &str) -> bool {
    claimed_keys().lock().insert(key.to_string())
}

pub(crate) fn release_key(key: &str) {
    claimed_keys().lock().remove(key);
}

/// 参数更新后等待哪个回调确认标志
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChangeFlag {
    Gr,
    Rf,
    Fs,
}

/// 设备描述 + 参数快照（general-state 锁保护）
pub(crate) struct GeneralState {
    pub info: DeviceInfo,
    pub params: DeviceParams,
    pub cache_key: String,
    pub rsp_device_id: String,
}

impl GeneralState {
    /// 活动调谐器的通道参数
    pub fn ch(&self) -> &ChannelParams {
        if self.info.tuner == TunerSelect::B {
            self.params.rx_channel_b.as_ref().unwrap_or(&self.params.rx_channel_a)
        } else {
            &self.params.rx_channel_a
        }
    }

    pub fn ch_mut(&mut self) -> &mut ChannelParams {
        if self.info.tuner == TunerSelect::B {
            self.params.rx_channel_b.get_or_insert_with(ChannelParams::default)
        } else {
            &mut self.params.rx_channel_a
        }
    }

    /// 指定通道的参数（双调谐器时 1 → B 通道）
    pub fn ch_at(&self, channel: usize) -> Option<&ChannelParams> {
        match channel {
            0 => Some(self.ch()),
            1 if self.info.duo_mode == RspDuoMode::DualTuner => self.params.rx_channel_b.as_ref(),
            _ => None,
        }
    }
}

/// 会话与回调/看门狗线程共享的内核
pub(crate) struct DeviceShared {
    pub gate: Arc<ApiGate>,
    pub general: Mutex<GeneralState>,

    // 流槽位：会话在 activate 发布、close 清除；回调 acquire-load 解引用
    pub streams: [ArcSwapOption<StreamRing>; 2],
    pub streams_store: Mutex<[StreamSlot; 2]>,
    pub stream_active: AtomicBool,
    pub device_unavailable: AtomicBool,
    /// 缓冲切换阈值（样本），= BUFFER_SAMPLES / 抽取因子（热路径免除法）
    pub cached_buffer_threshold: AtomicUsize,

    // 回调确认标志 + 等待方
    pub gr_changed: AtomicU32,
    pub rf_changed: AtomicU32,
    pub fs_changed: AtomicU32,
    pub update_lock: Mutex<()>,
    pub update_cv: Condvar,
    // sdrplay_api_Update 串行化（短超时 try-lock，忙时跳过）
    pub api_update_lock: Mutex<()>,

    pub uninit_retry_delay: Mutex<Duration>,

    // 健康监控（watchdog.rs）
    pub health: Mutex<HealthInfo>,
    pub health_listeners: Mutex<Vec<Arc<dyn Fn(crate::watchdog::HealthStatus) + Send + Sync>>>,
    pub watchdog_config: Mutex<WatchdogConfig>,
    pub watchdog: WatchdogControl,
    pub settings_cache: Mutex<SettingsCache>,
    pub recovery_in_progress: AtomicBool,
    pub recovery_attempts: AtomicU32,
    pub last_recovery_attempt: Mutex<Option<Instant>>,

    // 天线持久化
    pub persistent_antenna: Mutex<[PersistentAntenna; 2]>,
    pub config_dir_override: Mutex<Option<std::path::PathBuf>>,
}

#[derive(Default, Clone)]
pub(crate) struct PersistentAntenna {
    pub enabled: bool,
    pub name: Option<String>,
}

/// 进程内 RSP 设备
pub struct RspDevice {
    pub(crate) shared: Arc<DeviceShared>,
}

/// 参数更新确认的等待时限
pub(crate) const UPDATE_TIMEOUT: Duration = Duration::from_millis(500);

impl RspDevice {
    /// 按 make 参数打开设备
    ///
    /// 需要 `serial`；RSPduo 额外接受 `mode`（ST/DT/MA/MA8/SL）与
    /// `antenna`。其余键值在选定后作为设置写入。
    pub fn new(gate: Arc<ApiGate>, args: &DeviceArgs) -> Result<Self, DriverError> {
        Self::new_with_config_dir(gate, args, None)
    }

    /// 同 [`RspDevice::new`]，但显式指定配置目录（测试与嵌入场景用）
    pub fn new_with_config_dir(
        gate: Arc<ApiGate>,
        args: &DeviceArgs,
        config_dir: Option<std::path::PathBuf>,
    ) -> Result<Self, DriverError> {
        let serial = args.get("serial").cloned().ok_or(DriverError::NoSerial)?;
        let mode = args.get("mode").cloned().unwrap_or_default();
        let antenna = args.get("antenna").cloned().unwrap_or_default();

        gate.open()?;

        let state = select_initial(&gate, &serial, &mode, &antenna)?;

        // cache key：(serial) 或 duo 的 (serial, sub-mode)
        let cache_key = state.cache_key.clone();
        if !claim_key(&cache_key) {
            let info = state.info.clone();
            let _ = gate.call("sdrplay_api_ReleaseDevice", move |api| {
                api.release_device(&info)
            });
            return Err(DriverError::AlreadyClaimed(cache_key));
        }

        let shared = Arc::new(DeviceShared {
            gate,
            general: Mutex::new(state),
            streams: [ArcSwapOption::const_empty(), ArcSwapOption::const_empty()],
            streams_store: Mutex::new([StreamSlot::default(), StreamSlot::default()]),
            stream_active: AtomicBool::new(false),
            device_unavailable: AtomicBool::new(false),
            cached_buffer_threshold: AtomicUsize::new(BUFFER_SAMPLES),
            gr_changed: AtomicU32::new(0),
            rf_changed: AtomicU32::new(0),
            fs_changed: AtomicU32::new(0),
            update_lock: Mutex::new(()),
            update_cv: Condvar::new(),
            api_update_lock: Mutex::new(()),
            uninit_retry_delay: Mutex::new(Duration::from_secs(10)),
            health: Mutex::new(HealthInfo::default()),
            health_listeners: Mutex::new(Vec::new()),
            watchdog_config: Mutex::new(WatchdogConfig::default()),
            watchdog: WatchdogControl::default(),
            settings_cache: Mutex::new(SettingsCache::default()),
            recovery_in_progress: AtomicBool::new(false),
            recovery_attempts: AtomicU32::new(0),
            last_recovery_attempt: Mutex::new(None),
            persistent_antenna: Mutex::new([PersistentAntenna::default(), PersistentAntenna::default()]),
            config_dir_override: Mutex::new(None),
        });

        let device = Self { shared };
        *device.shared.config_dir_override.lock() = config_dir;

        // 默认 AGC 设定点改为 -30dBfs
        device.shared.general.lock().params.rx_channel_a.ctrl.agc.set_point_dbfs = -30;

        // 其余 make 参数作为设置键应用
        for (key, value) in args {
            if matches!(key.as_str(), "driver" | "label" | "mode" | "serial" | "soapy" | "antenna")
            {
                continue;
            }
            device.write_setting_inner(key, value);
        }

        // 重放持久化的天线选择
        device.reapply_persisted_antennas();

        let rsp_device_id = device.shared.general.lock().rsp_device_id.clone();
        info!("device session opened: {cache_key} (rsp device id {rsp_device_id})");
        Ok(device)
    }

    /// 测试辅助：覆盖配置目录与 uninit 重试间隔
    pub fn set_config_dir_override(&self, dir: Option<std::path::PathBuf>) {
        *self.shared.config_dir_override.lock() = dir;
    }

    pub fn set_uninit_retry_delay(&self, delay: Duration) {
        *self.shared.uninit_retry_delay.lock() = delay;
    }

    pub(crate) fn hw_variant(&self) -> HwVariant {
        self.shared.general.lock().info.hw_ver
    }

    pub fn cache_key(&self) -> String {
        self.shared.general.lock().cache_key.clone()
    }

    pub fn serial(&self) -> String {
        self.shared.general.lock().info.serial.clone()
    }
}

impl Drop for RspDevice {
    fn drop(&mut self) {
        self.shared.stop_watchdog();

        let st = self.shared.general.lock();
        release_key(&st.cache_key);
        let info = st.info.clone();
        drop(st);

        let result = self
            .shared
            .gate
            .call("sdrplay_api_ReleaseDevice", move |api| {
                api.release_device(&info)
            });
        match result {
            Ok(Ok(())) => debug!("device released"),
            Ok(Err(e)) => error!("ReleaseDevice failed: {e}"),
            Err(e) => error!("ReleaseDevice failed: {e}"),
        }

        self.shared.streams[0].store(None);
        self.shared.streams[1].store(None);
    }
}

/// 初次选定：按序列号（duo 时加 sub-mode/调谐器）匹配枚举结果并取句柄
fn select_initial(
    gate: &Arc<ApiGate>,
    serial: &str,
    mode: &str,
    antenna: &str,
) -> Result<GeneralState, DriverError> {
    let (duo_mode, mut tuner, duo_sample_freq) =
        RspDuoMode::parse(mode).ok_or_else(|| DriverError::InvalidMode(mode.to_string()))?;

    // 指定了天线时据此决定 RSPduo 调谐器
    if !matches!(duo_mode, RspDuoMode::Unknown | RspDuoMode::DualTuner) && !antenna.is_empty() {
        tuner = match antenna {
            "Tuner 1 50 ohm" | "Tuner 1 Hi-Z" => TunerSelect::A,
            "Tuner 2 50 ohm" => TunerSelect::B,
            other => return Err(DriverError::InvalidAntenna(other.to_string())),
        };
    }

    let rsp_device_id = if duo_mode == RspDuoMode::Slave {
        format!("{serial}/S")
    } else {
        serial.to_string()
    };

    let (info, params) = select_on_vendor(gate, serial, tuner, duo_mode, duo_sample_freq, None)?;

    let cache_key = if info.hw_ver == HwVariant::RspDuo {
        format!("{serial}@{mode}")
    } else {
        serial.to_string()
    };

    Ok(GeneralState {
        info,
        params,
        cache_key,
        rsp_device_id,
    })
}

/// 厂商侧选定（gate 串行化 + 超时）。`preserve` 给出要带入的参数快照
/// （调谐器切换时保留配置）。
pub(crate) fn select_on_vendor(
    gate: &Arc<ApiGate>,
    serial: &str,
    tuner: TunerSelect,
    duo_mode: RspDuoMode,
    duo_sample_freq: f64,
    preserve: Option<DeviceParams>,
) -> Result<(DeviceInfo, DeviceParams), DriverError> {
    let serial_owned = serial.to_string();
    let result = gate.call("sdrplay_api_SelectDevice", move |api| {
        let devices = api.get_devices()?;
        let mut info = devices
            .into_iter()
            .find(|d| d.valid && d.serial == serial_owned)
            .ok_or(VendorError::NoMatchingDevice(serial_owned.clone()))?;

        if info.hw_ver == HwVariant::RspDuo && duo_mode != RspDuoMode::Slave {
            if duo_mode != RspDuoMode::Unknown && !info.supports_duo_mode(duo_mode) {
                return Err(VendorError::DuoModeUnavailable("mode not available"));
            }
            info.duo_mode = duo_mode;
            info.tuner = tuner;
            if duo_sample_freq != 0.0 {
                info.duo_sample_freq = duo_sample_freq;
            }
        } else if info.hw_ver == HwVariant::RspDuo {
            // 从机：跟随主机已经确定的模式
            info.duo_mode = RspDuoMode::Slave;
            if tuner != TunerSelect::Neither {
                info.tuner = tuner;
            }
        } else if duo_mode != RspDuoMode::Unknown || tuner != TunerSelect::Neither {
            return Err(VendorError::DuoModeUnavailable(
                "device does not support RSPduo modes",
            ));
        }

        api.select_device(&mut info)?;
        let params = match api.get_device_params(info.handle) {
            Ok(p) => p,
            Err(e) => {
                let _ = api.release_device(&info);
                return Err(e);
            }
        };
        Ok((info, params))
    });

    let (info, fresh_params) = match result {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(e.into()),
        Err(e) => return Err(e.into()),
    };

    // 调谐器切换保留原有配置快照
    let params = match preserve {
        Some(mut prev) => {
            if prev.dev.is_none() {
                prev.dev = fresh_params.dev;
            }
            prev
        }
        None => fresh_params,
    };

    Ok((info, params))
}

impl DeviceShared {
    pub(crate) fn change_flag(&self, which: ChangeFlag) -> &AtomicU32 {
        match which {
            ChangeFlag::Gr => &self.gr_changed,
            ChangeFlag::Rf => &self.rf_changed,
            ChangeFlag::Fs => &self.fs_changed,
        }
    }

    /// 串行化 sdrplay_api_Update 并可选等待回调确认
    ///
    /// 短超时 try-lock：另一个更新在途时直接跳过（返回 false），避免
    /// UI 事件风暴排队压垮服务。
    pub(crate) fn execute_api_update(
        &self,
        st: &GeneralState,
        reason: UpdateReason,
        ext: UpdateExt1,
        wait: Option<ChangeFlag>,
        name: &'static str,
    ) -> bool {
        let Some(_busy) = self.api_update_lock.try_lock_for(Duration::from_millis(50)) else {
            debug!("skipping {name} update - another update in progress");
            return false;
        };

        let flag = wait.map(|w| self.change_flag(w));
        if let Some(f) = flag {
            f.store(0, Ordering::Relaxed);
        }

        let handle = st.info.handle;
        let tuner = st.info.tuner;
        let params = st.params.clone();
        let result = self.gate.call("sdrplay_api_Update", move |api| {
            api.update(handle, tuner, &params, reason, ext)
        });
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("sdrplay_api_Update({name}) failed: {e}");
                return false;
            }
            Err(e) => {
                warn!("sdrplay_api_Update({name}) failed: {e}");
                return false;
            }
        }

        if let Some(f) = flag {
            let deadline = Instant::now() + UPDATE_TIMEOUT;
            let mut guard = self.update_lock.lock();
            while f.load(Ordering::Relaxed) == 0 {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    warn!("{name} update timeout");
                    break;
                };
                if self.update_cv.wait_for(&mut guard, remaining).timed_out() {
                    warn!("{name} update timeout");
                    break;
                }
            }
        }
        true
    }

    /// 设备消失（拔出 / master 流消失）：置标志并唤醒所有等待者
    fn mark_device_unavailable(&self) {
        self.device_unavailable.store(true, Ordering::Release);
        self.update_cv.notify_all();
        for slot in &self.streams {
            if let Some(stream) = slot.load_full() {
                stream.notify_all();
            }
        }
    }

    /// 过载事件应答（回调线程直接走 gate）
    fn ack_overload(&self) {
        let (handle, tuner, params) = {
            let st = self.general.lock();
            (st.info.handle, st.info.tuner, st.params.clone())
        };
        let result = self.gate.call("sdrplay_api_Update", move |api| {
            api.update(
                handle,
                tuner,
                &params,
                UpdateReason::CTRL_OVERLOAD_MSG_ACK,
                UpdateExt1::NONE,
            )
        });
        if let Ok(Err(e)) | Err(e) = result {
            warn!("sdrplay_api_Update(Ctrl_OverloadMsgAck) failed: {e}");
        }
    }
}

// 厂商线程入口：记录状态并返回，绝不失败
impl StreamCallbacks for DeviceShared {
    fn stream_a(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams) {
        self.rx_callback(0, xi, xq, params);
    }

    fn stream_b(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams) {
        self.rx_callback(1, xi, xq, params);
    }

    fn event(&self, event: Event, _tuner: TunerSelect) {
        match event {
            Event::GainChange => {}
            Event::PowerOverloadChange(change) => {
                // 必须应答，否则厂商服务停止投递
                self.ack_overload();
                match change {
                    PowerOverload::Detected => warn!("power overload detected"),
                    PowerOverload::Corrected => info!("power overload corrected"),
                }
            }
            Event::DeviceRemoved => {
                error!("device has been removed. Stopping.");
                self.mark_device_unavailable();
            }
            Event::RspDuoModeChange(duo) => {
                use rsp_vendor::DuoEvent::*;
                match duo {
                    MasterInitialised => info!("RSPduo: master initialised"),
                    SlaveAttached => info!("RSPduo: slave attached"),
                    SlaveDetached => info!("RSPduo: slave detached"),
                    SlaveInitialised => info!("RSPduo: slave initialised"),
                    SlaveUninitialised => info!("RSPduo: slave uninitialised"),
                    MasterDllDisappeared => {
                        error!("RSPduo: master stream has disappeared. Stopping.");
                        self.mark_device_unavailable();
                    }
                    SlaveDllDisappeared => warn!("RSPduo: slave stream has disappeared"),
                }
            }
        }
    }
}

/// 供测试/上层检视的设备句柄访问
impl RspDevice {
    pub fn vendor_handle(&self) -> DeviceHandle {
        self.shared.general.lock().info.handle
    }

    pub fn device_unavailable(&self) -> bool {
        self.shared.device_unavailable.load(Ordering::Acquire)
    }
}
