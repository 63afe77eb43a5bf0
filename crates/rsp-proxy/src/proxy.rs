//! 代理设备
//!
//! 宿主侧的设备门面：第一次建流时在跨进程开启门内创建共享环、生成
//! worker 并完成 Ready → Configure → Configured 握手，此后宿主读取直接
//! 走环。`write_idx` 在连续若干次超时读取中不动即判定 worker 停滞：
//! 终止、重建环、重生成，再按设置缓存重放 Configure + Start。

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use num_complex::Complex;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rsp_driver::{
    DeviceArgs, DirectBuf, DriverError, ReadOutcome, SdrDevice, StreamBuf, StreamError,
    StreamFormat, StreamId,
};
use rsp_ipc::{
    ControlMessage, CrossProcessLock, CrossProcessLockGuard, DEFAULT_RING_SAMPLES, MessageType,
    PROXY_OPEN_LOCK_PATH, PipePair, SharedRing, shm_name_for,
};

use crate::worker::WorkerSpawner;

/// 连续多少次零进展的超时读取后判定 worker 停滞
const MAX_STALE_READS: u32 = 10;

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIGURE_TIMEOUT: Duration = Duration::from_secs(15);
const START_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const OPEN_GATE_TIMEOUT: Duration = Duration::from_secs(60);

/// 代理实例之间串行化设备开启（厂商服务吃不消并发选定）
static PROXY_OPEN_LOCK: LazyLock<CrossProcessLock> =
    LazyLock::new(|| CrossProcessLock::new(PROXY_OPEN_LOCK_PATH));

#[derive(Debug, Clone)]
struct ProxySettings {
    center_hz: f64,
    sample_rate: f64,
    bandwidth: f64,
    gain: f64,
    if_gr: f64,
    rf_gr: f64,
    agc_enabled: bool,
    antenna: String,
    dc_offset_mode: bool,
    ppm: f64,
    extra: BTreeMap<String, String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            center_hz: 100e6,
            sample_rate: 2e6,
            bandwidth: 0.0,
            gain: 40.0,
            if_gr: 40.0,
            rf_gr: 0.0,
            agc_enabled: true,
            antenna: String::new(),
            dc_offset_mode: true,
            ppm: 0.0,
            extra: BTreeMap::new(),
        }
    }
}

/// worker 进程与其管道
#[derive(Default)]
struct WorkerLink {
    child: Option<std::process::Child>,
    pipes: Option<PipePair>,
    ready: bool,
}

/// 代理侧的流状态
struct ProxyStream {
    use_cs16: bool,
    /// CF32 → CS16 转换缓冲（工作集缩小时回收容量）
    conversion: Vec<Complex<f32>>,
    last_seen_write_idx: u64,
    stale_count: u32,
}

/// 宿主进程内的代理设备
pub struct ProxyDevice {
    serial: String,
    shm_name: String,
    // 锁序：stream → worker → ring
    stream: Mutex<Option<ProxyStream>>,
    worker: Mutex<WorkerLink>,
    ring: Mutex<Option<SharedRing>>,
    settings: Mutex<ProxySettings>,
    stream_active: AtomicBool,
}

impl ProxyDevice {
    pub fn new(args: &DeviceArgs) -> Result<Self, DriverError> {
        let serial = args.get("serial").cloned().ok_or(DriverError::NoSerial)?;
        let shm_name = shm_name_for(&serial);
        info!("creating proxy for device {serial}");
        Ok(Self {
            serial,
            shm_name,
            stream: Mutex::new(None),
            worker: Mutex::new(WorkerLink::default()),
            ring: Mutex::new(None),
            settings: Mutex::new(ProxySettings::default()),
            stream_active: AtomicBool::new(false),
        })
    }

    fn send_command(link: &mut WorkerLink, cmd: &ControlMessage) -> bool {
        let Some(pipes) = link.pipes.as_mut() else {
            return false;
        };
        if let Err(e) = pipes.to_child.send(cmd, ACK_TIMEOUT) {
            error!("failed to send command: {e}");
            return false;
        }
        true
    }

    /// 等待指定状态（Ack 同样视为确认；Error 终止等待；其它状态丢弃）
    fn wait_for_status(link: &mut WorkerLink, expected: MessageType, timeout: Duration) -> bool {
        let Some(pipes) = link.pipes.as_mut() else {
            return false;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                error!("timeout waiting for status {expected:?}");
                return false;
            };
            let status = match pipes.from_child.receive(remaining) {
                Ok(s) => s,
                Err(e) => {
                    error!("timeout waiting for status {expected:?}: {e}");
                    return false;
                }
            };
            match status.msg_type {
                MessageType::Error => {
                    error!("worker error: {}", status.param_or("message", "unknown"));
                    return false;
                }
                t if t == expected || t == MessageType::Ack => return true,
                t => {
                    debug!("discarding unexpected status {t:?} while waiting for {expected:?}");
                }
            }
        }
    }

    fn configure_message(settings: &ProxySettings) -> ControlMessage {
        ControlMessage::new(MessageType::Configure)
            .with_param("center_hz", settings.center_hz)
            .with_param("sample_rate", settings.sample_rate)
            .with_param("bandwidth", settings.bandwidth)
            .with_param("gain", settings.gain)
            .with_param("agc", settings.agc_enabled as i64)
            .with_param("antenna", settings.antenna.as_str())
    }

    /// 保证 worker 活着且完成 Ready 握手（调用方持 worker 锁）
    fn ensure_worker(
        &self,
        link: &mut WorkerLink,
        ring_slot: &mut Option<SharedRing>,
    ) -> Result<(), DriverError> {
        if link.ready {
            return Ok(());
        }

        if let Some(mut child) = link.child.take() {
            // 半死不活的 worker：收尸重来
            WorkerSpawner::terminate(&mut child);
            link.pipes = None;
        }

        // 环由消费者（代理）创建，worker 打开
        *ring_slot = Some(
            SharedRing::create(&self.shm_name, DEFAULT_RING_SAMPLES)
                .map_err(|e| DriverError::Worker(format!("failed to create shared memory: {e}")))?,
        );

        let (child, mut pipes) = WorkerSpawner::spawn(&self.serial, &self.shm_name)
            .map_err(|e| DriverError::Worker(format!("failed to spawn worker: {e}")))?;

        if !WorkerSpawner::wait_for_ready(&mut pipes.from_child, READY_TIMEOUT) {
            let mut child = child;
            WorkerSpawner::terminate(&mut child);
            *ring_slot = None;
            return Err(DriverError::Worker("worker failed to start".into()));
        }

        link.child = Some(child);
        link.pipes = Some(pipes);
        link.ready = true;
        info!("worker ready for device {}", self.serial);
        Ok(())
    }

    /// 停滞恢复：终止 worker、重建环、重生成并重放 Configure(+Start)
    fn restart_worker(
        &self,
        link: &mut WorkerLink,
        ring_slot: &mut Option<SharedRing>,
    ) -> Result<(), DriverError> {
        let was_streaming = self.stream_active.swap(false, Ordering::AcqRel);
        link.ready = false;

        if let Some(mut child) = link.child.take() {
            info!("terminating stalled worker PID {}", child.id());
            WorkerSpawner::terminate(&mut child);
        }
        link.pipes = None;
        *ring_slot = None; // 旧环 unlink

        self.ensure_worker(link, ring_slot)?;

        info!("configuring device in restarted worker");
        let cmd = Self::configure_message(&self.settings.lock());
        if !Self::send_command(link, &cmd)
            || !Self::wait_for_status(link, MessageType::Configured, CONFIGURE_TIMEOUT)
        {
            return Err(DriverError::Worker(
                "configure failed in restarted worker".into(),
            ));
        }

        if was_streaming {
            info!("restarting stream");
            let start = ControlMessage::new(MessageType::Start);
            if Self::send_command(link, &start)
                && Self::wait_for_status(link, MessageType::Started, START_TIMEOUT)
            {
                self.stream_active.store(true, Ordering::Release);
            } else {
                warn!("failed to restart stream after worker recovery");
            }
        }

        info!("worker restart complete");
        Ok(())
    }

    /// 转发一个单值设置命令并等 Ack
    fn forward_setter(&self, msg_type: MessageType, value: impl Into<rsp_ipc::message::ParamValue>) {
        let mut link = self.worker.lock();
        if !link.ready {
            return; // 尚未生成 worker：只缓存，Configure 时一并下发
        }
        let cmd = ControlMessage::new(msg_type).with_param("value", value);
        if Self::send_command(&mut link, &cmd) {
            Self::wait_for_status(&mut link, MessageType::Ack, ACK_TIMEOUT);
        }
    }
}

impl Drop for ProxyDevice {
    fn drop(&mut self) {
        let mut link = self.worker.lock();

        if self.stream_active.load(Ordering::Acquire) {
            let stop = ControlMessage::new(MessageType::Stop);
            if Self::send_command(&mut link, &stop) {
                Self::wait_for_status(&mut link, MessageType::Stopped, STOP_TIMEOUT);
            }
        }

        if link.child.is_some() {
            let shutdown = ControlMessage::new(MessageType::Shutdown);
            let _ = Self::send_command(&mut link, &shutdown);
            if let Some(mut child) = link.child.take() {
                WorkerSpawner::terminate(&mut child);
            }
        }
        link.pipes = None;
        *self.ring.lock() = None;

        info!("proxy destroyed for device {}", self.serial);
    }
}

impl SdrDevice for ProxyDevice {
    fn driver_key(&self) -> String {
        "sdrplay".to_string()
    }

    fn hardware_key(&self) -> String {
        "RSP".to_string()
    }

    fn hardware_info(&self) -> DeviceArgs {
        let mut info = DeviceArgs::new();
        info.insert("serial".to_string(), self.serial.clone());
        info.insert("proxy".to_string(), "true".to_string());
        info
    }

    fn num_channels(&self) -> usize {
        1
    }

    fn native_stream_format(&self) -> (&'static str, f64) {
        // 环里是 CF32：这是代理的原生格式
        ("CF32", 1.0)
    }

    fn setup_stream(
        &self,
        format: StreamFormat,
        channels: &[usize],
    ) -> Result<StreamId, DriverError> {
        if channels.len() > 1 || channels.first().is_some_and(|&c| c != 0) {
            return Err(DriverError::InvalidChannels);
        }
        let use_cs16 = format == StreamFormat::Cs16;

        {
            // 所有代理实例（含跨进程）串行通过设备开启门
            debug!("acquiring device open lock...");
            let _gate =
                CrossProcessLockGuard::acquire(&PROXY_OPEN_LOCK, OPEN_GATE_TIMEOUT, Duration::ZERO)
                    .map_err(|e| DriverError::Worker(format!("device open gate: {e}")))?;
            debug!("device open lock acquired");

            let mut link = self.worker.lock();
            let mut ring_slot = self.ring.lock();
            self.ensure_worker(&mut link, &mut ring_slot)?;

            let cmd = Self::configure_message(&self.settings.lock());
            if !Self::send_command(&mut link, &cmd) {
                return Err(DriverError::Worker("failed to send configure command".into()));
            }
            if !Self::wait_for_status(&mut link, MessageType::Configured, CONFIGURE_TIMEOUT) {
                return Err(DriverError::Worker("configure failed".into()));
            }
            debug!("device configured, releasing open lock");
        }

        let mut conversion = Vec::new();
        if use_cs16 {
            conversion.reserve(self.stream_mtu());
        }
        *self.stream.lock() = Some(ProxyStream {
            use_cs16,
            conversion,
            last_seen_write_idx: 0,
            stale_count: 0,
        });
        Ok(StreamId(0))
    }

    fn close_stream(&self, stream: StreamId) {
        if self.stream_active.load(Ordering::Acquire) {
            let _ = self.deactivate_stream(stream);
        }
        *self.stream.lock() = None;
    }

    fn stream_mtu(&self) -> usize {
        65536
    }

    fn activate_stream(&self, _stream: StreamId) -> Result<(), StreamError> {
        let mut link = self.worker.lock();
        let cmd = ControlMessage::new(MessageType::Start);
        if !Self::send_command(&mut link, &cmd) {
            return Err(StreamError::Fault);
        }
        if !Self::wait_for_status(&mut link, MessageType::Started, START_TIMEOUT) {
            return Err(StreamError::Fault);
        }
        self.stream_active.store(true, Ordering::Release);
        Ok(())
    }

    fn deactivate_stream(&self, _stream: StreamId) -> Result<(), StreamError> {
        if !self.stream_active.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut link = self.worker.lock();
        let cmd = ControlMessage::new(MessageType::Stop);
        if !Self::send_command(&mut link, &cmd) {
            return Err(StreamError::Fault);
        }
        Self::wait_for_status(&mut link, MessageType::Stopped, STOP_TIMEOUT);
        self.stream_active.store(false, Ordering::Release);
        Ok(())
    }

    fn read_stream(
        &self,
        _stream: StreamId,
        buf: StreamBuf<'_>,
        timeout: Duration,
    ) -> Result<ReadOutcome, StreamError> {
        let mut stream_guard = self.stream.lock();
        let Some(stream) = stream_guard.as_mut() else {
            return Err(StreamError::NotSupported);
        };

        let count = {
            let mut ring_guard = self.ring.lock();
            let Some(ring) = ring_guard.as_mut() else {
                return Err(StreamError::NotSupported);
            };

            match buf {
                StreamBuf::Cs16(out) => {
                    let want = (out.len() / 2).min(self.stream_mtu());
                    if stream.conversion.len() < want {
                        stream.conversion.resize(want, Complex::new(0.0, 0.0));
                    } else if stream.conversion.capacity() > want * 4
                        && stream.conversion.capacity() > 65536
                    {
                        // 容量远超工作集时收缩，防止偶发大读取后的驻留增长
                        stream.conversion.resize(want, Complex::new(0.0, 0.0));
                        stream.conversion.shrink_to_fit();
                    }
                    let n = ring.read(&mut stream.conversion[..want], timeout);
                    for (i, s) in stream.conversion[..n].iter().enumerate() {
                        let re = (s.re * 32767.0).clamp(-32768.0, 32767.0);
                        let im = (s.im * 32767.0).clamp(-32768.0, 32767.0);
                        out[2 * i] = re as i16;
                        out[2 * i + 1] = im as i16;
                    }
                    n
                }
                StreamBuf::Cf32(out) => {
                    let want = out.len().min(self.stream_mtu());
                    ring.read(&mut out[..want], timeout)
                }
            }
        };

        if count == 0 {
            // 停滞检测：写索引连续多次无进展就认定 worker 卡死
            let current_write_idx = {
                let ring_guard = self.ring.lock();
                ring_guard.as_ref().map(|r| r.write_index()).unwrap_or(0)
            };
            if current_write_idx == stream.last_seen_write_idx {
                stream.stale_count += 1;
                if stream.stale_count >= MAX_STALE_READS {
                    warn!(
                        "ring stalled (write index {current_write_idx} unchanged for {} reads), restarting worker",
                        stream.stale_count
                    );
                    let mut link = self.worker.lock();
                    let mut ring_slot = self.ring.lock();
                    if let Err(e) = self.restart_worker(&mut link, &mut ring_slot) {
                        error!("worker restart failed: {e}");
                    }
                    stream.stale_count = 0;
                    stream.last_seen_write_idx = 0;
                }
            } else {
                stream.last_seen_write_idx = current_write_idx;
                stream.stale_count = 0;
            }
            return Err(StreamError::Timeout);
        }

        stream.last_seen_write_idx = {
            let ring_guard = self.ring.lock();
            ring_guard.as_ref().map(|r| r.write_index()).unwrap_or(0)
        };
        stream.stale_count = 0;

        Ok(ReadOutcome {
            samples: count,
            more_fragments: false,
        })
    }

    fn acquire_read_buffer(
        &self,
        _stream: StreamId,
        timeout: Duration,
    ) -> Result<(usize, DirectBuf<'_>), StreamError> {
        // 零拷贝只对 CF32 有意义（环的原生格式）
        {
            let stream = self.stream.lock();
            match stream.as_ref() {
                None => return Err(StreamError::NotSupported),
                Some(s) if s.use_cs16 => return Err(StreamError::NotSupported),
                Some(_) => {}
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let ring_guard = self.ring.lock();
            let Some(ring) = ring_guard.as_ref() else {
                return Err(StreamError::NotSupported);
            };
            let slice = ring.read_slice();
            if !slice.is_empty() {
                let len = slice.len();
                let ptr = slice.as_ptr();
                // SAFETY: 环映射存活期由 self.ring 持有；SPSC 协议保证
                // [read_idx, write_idx) 区间在 advance_read 前不被复用
                let extended = unsafe { std::slice::from_raw_parts(ptr, len) };
                return Ok((len, DirectBuf::Cf32(extended)));
            }
            drop(ring_guard);
            if deadline.checked_duration_since(Instant::now()).is_none() {
                return Err(StreamError::Timeout);
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    fn release_read_buffer(&self, _stream: StreamId, handle: usize) {
        let mut ring_guard = self.ring.lock();
        if let Some(ring) = ring_guard.as_mut() {
            ring.advance_read(handle);
        }
    }

    fn antennas(&self, _channel: usize) -> Vec<String> {
        let current = self.settings.lock().antenna.clone();
        if current.is_empty() {
            vec!["RX".to_string()]
        } else {
            vec![current]
        }
    }

    fn set_antenna(&self, _channel: usize, name: &str) {
        self.settings.lock().antenna = name.to_string();
        self.forward_setter(MessageType::SetAntenna, name);
    }

    fn antenna(&self, _channel: usize) -> String {
        let antenna = self.settings.lock().antenna.clone();
        if antenna.is_empty() {
            "RX".to_string()
        } else {
            antenna
        }
    }

    fn set_antenna_persistent(&self, channel: usize, name: &str, persistent: bool) {
        // 持久化由 worker 内的驱动会话负责；代理只转发选择
        let _ = persistent;
        self.set_antenna(channel, name);
    }

    fn antenna_persistent(&self, _channel: usize) -> bool {
        false
    }

    fn set_dc_offset_mode(&self, _channel: usize, automatic: bool) {
        self.settings.lock().dc_offset_mode = automatic;
    }

    fn dc_offset_mode(&self, _channel: usize) -> bool {
        self.settings.lock().dc_offset_mode
    }

    fn set_frequency_correction(&self, _channel: usize, ppm: f64) {
        self.settings.lock().ppm = ppm;
    }

    fn frequency_correction(&self, _channel: usize) -> f64 {
        self.settings.lock().ppm
    }

    fn set_gain_mode(&self, _channel: usize, automatic: bool) {
        self.settings.lock().agc_enabled = automatic;
        self.forward_setter(MessageType::SetAgc, automatic as i64);
    }

    fn gain_mode(&self, _channel: usize) -> bool {
        self.settings.lock().agc_enabled
    }

    fn set_gain_element(&self, _channel: usize, name: &str, value: f64) {
        // 代理按总增益协议工作；元件值缓存在本地供读回
        let mut settings = self.settings.lock();
        match name {
            "IFGR" => settings.if_gr = value,
            "RFGR" => settings.rf_gr = value,
            _ => return,
        }
        drop(settings);
        let gain = self.settings.lock().gain;
        self.forward_setter(MessageType::SetGain, gain);
    }

    fn gain_element(&self, _channel: usize, name: &str) -> f64 {
        let settings = self.settings.lock();
        match name {
            "IFGR" => settings.if_gr,
            "RFGR" => settings.rf_gr,
            _ => 0.0,
        }
    }

    fn gain_element_range(&self, _channel: usize, name: &str) -> (f64, f64) {
        match name {
            "RFGR" => (0.0, 27.0),
            _ => (20.0, 59.0),
        }
    }

    fn set_gain(&self, _channel: usize, value: f64) {
        self.settings.lock().gain = value;
        self.forward_setter(MessageType::SetGain, value);
    }

    fn gain(&self, _channel: usize) -> f64 {
        self.settings.lock().gain
    }

    fn gain_range(&self, _channel: usize) -> (f64, f64) {
        (0.0, 66.0)
    }

    fn set_frequency_element(&self, _channel: usize, name: &str, value: f64) {
        match name {
            "RF" => {
                self.settings.lock().center_hz = value;
                self.forward_setter(MessageType::SetFrequency, value);
            }
            "CORR" => {
                self.settings.lock().ppm = value;
            }
            _ => {}
        }
    }

    fn frequency_element(&self, _channel: usize, name: &str) -> f64 {
        let settings = self.settings.lock();
        match name {
            "RF" => settings.center_hz,
            "CORR" => settings.ppm,
            _ => 0.0,
        }
    }

    fn frequency_range(&self, _channel: usize) -> (f64, f64) {
        (1_000.0, 2_000_000_000.0)
    }

    fn set_sample_rate(&self, _channel: usize, rate: f64) {
        self.settings.lock().sample_rate = rate;
        self.forward_setter(MessageType::SetSampleRate, rate);
    }

    fn sample_rate(&self, _channel: usize) -> f64 {
        self.settings.lock().sample_rate
    }

    fn sample_rates(&self, _channel: usize) -> Vec<f64> {
        rsp_driver::sample_rate::list_sample_rates(
            rsp_vendor::HwVariant::Rsp1a,
            rsp_vendor::RspDuoMode::Unknown,
        )
    }

    fn set_bandwidth(&self, _channel: usize, bw: f64) {
        self.settings.lock().bandwidth = bw;
        self.forward_setter(MessageType::SetBandwidth, bw);
    }

    fn bandwidth(&self, _channel: usize) -> f64 {
        self.settings.lock().bandwidth
    }

    fn bandwidths(&self, _channel: usize) -> Vec<f64> {
        rsp_driver::sample_rate::list_bandwidths(
            rsp_vendor::HwVariant::Rsp1a,
            rsp_vendor::RspDuoMode::Unknown,
        )
    }

    fn write_setting(&self, key: &str, value: &str) {
        self.settings
            .lock()
            .extra
            .insert(key.to_string(), value.to_string());
    }

    fn read_setting(&self, key: &str) -> String {
        self.settings.lock().extra.get(key).cloned().unwrap_or_default()
    }
}
