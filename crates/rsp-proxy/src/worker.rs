//! Worker 子进程
//!
//! 每个 worker 持有恰好一个设备会话 + 流引擎：打开代理创建好的共享环，
//! 经继承的管道收命令/回状态，专用采样线程把 CF32 突发从流引擎搬进环。
//! Configure 与 Start 是厂商服务对并发设备选定敏感的两个点，跨进程锁
//! 只在这两处持有。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use num_complex::Complex;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use rsp_driver::{DeviceArgs, SdrDevice, StreamBuf, StreamError, StreamFormat, StreamId};
use rsp_ipc::{
    ControlMessage, CrossProcessLock, CrossProcessLockGuard, DEFAULT_LOCK_PATH, IpcError, IpcPipe,
    MessageType, PipePair, RingFlags, SharedRing,
};

/// 命令轮询间隔
const COMMAND_POLL: Duration = Duration::from_millis(100);
/// Configure/Start 临界区的锁超时与冷却
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_COOLDOWN: Duration = Duration::from_millis(250);
/// 采样线程单次读取的样本数
const STREAM_CHUNK: usize = 65536;

/// 设备构造器：worker 二进制注入真实驱动，测试注入 mock 后端
pub type DeviceFactory =
    Box<dyn Fn(&DeviceArgs) -> Result<Arc<dyn SdrDevice>, rsp_driver::DriverError> + Send>;

/// worker 侧缓存的调参（Configure 载荷与逐项设置共用）
#[derive(Debug, Clone)]
struct WorkerSettings {
    center_hz: f64,
    sample_rate: f64,
    bandwidth: f64,
    gain: f64,
    agc_enabled: bool,
    antenna: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            center_hz: 100e6,
            sample_rate: 2e6,
            bandwidth: 0.0,
            gain: 40.0,
            agc_enabled: true,
            antenna: String::new(),
        }
    }
}

/// Worker 主体
pub struct Worker {
    cmd_pipe: IpcPipe,
    status_pipe: Arc<Mutex<IpcPipe>>,
    ring: Arc<Mutex<SharedRing>>,
    lock: CrossProcessLock,
    factory: DeviceFactory,
    device_args: DeviceArgs,

    device: Option<Arc<dyn SdrDevice>>,
    stream: Option<StreamId>,
    settings: WorkerSettings,

    running: bool,
    streaming: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(
        cmd_pipe: IpcPipe,
        status_pipe: IpcPipe,
        ring: SharedRing,
        factory: DeviceFactory,
        device_args: DeviceArgs,
    ) -> Self {
        Self {
            cmd_pipe,
            status_pipe: Arc::new(Mutex::new(status_pipe)),
            ring: Arc::new(Mutex::new(ring)),
            lock: CrossProcessLock::new(DEFAULT_LOCK_PATH),
            factory,
            device_args,
            device: None,
            stream: None,
            settings: WorkerSettings::default(),
            running: false,
            streaming: Arc::new(AtomicBool::new(false)),
            stream_thread: None,
        }
    }

    /// 测试用：自定义跨进程锁路径
    pub fn with_lock_path(mut self, path: impl AsRef<std::path::Path>) -> Self {
        self.lock = CrossProcessLock::new(path);
        self
    }

    /// 命令主循环，直到 Shutdown 或代理断开
    pub fn run(&mut self) -> i32 {
        info!(
            "worker starting for device {}",
            self.device_args.get("serial").map(String::as_str).unwrap_or("?")
        );

        self.send_status(MessageType::Ready, None);
        self.running = true;

        while self.running {
            let cmd = match self.cmd_pipe.receive(COMMAND_POLL) {
                Ok(cmd) => cmd,
                Err(IpcError::Timeout) => continue,
                Err(IpcError::Disconnected) => {
                    warn!("command pipe disconnected, shutting down");
                    break;
                }
                Err(e) => {
                    error!("command pipe error: {e}");
                    break;
                }
            };

            match cmd.msg_type {
                MessageType::Configure => self.handle_configure(&cmd),
                MessageType::Start => self.handle_start(),
                MessageType::Stop => self.handle_stop(),
                MessageType::Shutdown => {
                    self.running = false;
                    self.send_ack();
                }
                MessageType::SetFrequency => self.handle_set_frequency(&cmd),
                MessageType::SetSampleRate => self.handle_set_sample_rate(&cmd),
                MessageType::SetGain => self.handle_set_gain(&cmd),
                MessageType::SetAgc => self.handle_set_agc(&cmd),
                MessageType::SetAntenna => self.handle_set_antenna(&cmd),
                MessageType::SetBandwidth => self.handle_set_bandwidth(&cmd),
                MessageType::GetStatus => self.handle_get_status(),
                other => {
                    warn!("unknown command type {:?}", other);
                }
            }
        }

        self.stop_streaming();
        if let (Some(device), Some(stream)) = (self.device.as_ref(), self.stream.take()) {
            let _ = device.deactivate_stream(stream);
            device.close_stream(stream);
        }
        self.ring.lock().set_flag(RingFlags::SHUTDOWN);
        info!("worker exiting");
        0
    }

    fn handle_configure(&mut self, cmd: &ControlMessage) {
        debug!("handling configure");

        self.settings.center_hz = cmd.param_f64("center_hz", self.settings.center_hz);
        self.settings.sample_rate = cmd.param_f64("sample_rate", self.settings.sample_rate);
        self.settings.bandwidth = cmd.param_f64("bandwidth", self.settings.bandwidth);
        self.settings.gain = cmd.param_f64("gain", self.settings.gain);
        self.settings.agc_enabled =
            cmd.param_i64("agc", self.settings.agc_enabled as i64) != 0;
        self.settings.antenna = cmd
            .param_or("antenna", &self.settings.antenna)
            .to_string();

        // 设备选定对并发敏感：跨进程锁覆盖整个 Configure
        let guard = CrossProcessLockGuard::acquire(&self.lock, LOCK_TIMEOUT, LOCK_COOLDOWN);
        if guard.is_err() {
            self.send_error("configure failed: cross-process lock timed out");
            return;
        }

        if self.device.is_none() {
            info!(
                "opening device {}",
                self.device_args.get("serial").map(String::as_str).unwrap_or("?")
            );
            match (self.factory)(&self.device_args) {
                Ok(device) => {
                    self.device = Some(device);
                    self.send_status(MessageType::Opened, None);
                }
                Err(e) => {
                    self.send_error(&format!("failed to open device: {e}"));
                    return;
                }
            }
        }

        let device = self.device.as_ref().unwrap();
        if !self.settings.antenna.is_empty() {
            device.set_antenna(0, &self.settings.antenna);
        }
        device.set_sample_rate(0, self.settings.sample_rate);
        device.set_frequency(0, self.settings.center_hz);
        if self.settings.bandwidth > 0.0 {
            device.set_bandwidth(0, self.settings.bandwidth);
        }
        device.set_gain_mode(0, self.settings.agc_enabled);
        if !self.settings.agc_enabled {
            device.set_gain(0, self.settings.gain);
        }

        self.ring
            .lock()
            .set_sample_rate(self.settings.sample_rate as u32);

        self.send_status(MessageType::Configured, None);
    }

    fn handle_start(&mut self) {
        debug!("handling start");

        if self.device.is_none() {
            self.send_error("device not configured");
            return;
        }
        if self.streaming.load(Ordering::Acquire) {
            self.send_ack();
            return;
        }

        let guard = CrossProcessLockGuard::acquire(&self.lock, LOCK_TIMEOUT, LOCK_COOLDOWN);
        if guard.is_err() {
            self.send_error("start failed: cross-process lock timed out");
            return;
        }

        let device = self.device.as_ref().unwrap().clone();
        let stream = match self.stream {
            Some(s) => s,
            None => match device.setup_stream(StreamFormat::Cf32, &[0]) {
                Ok(s) => {
                    self.stream = Some(s);
                    s
                }
                Err(e) => {
                    self.send_error(&format!("failed to setup stream: {e}"));
                    return;
                }
            },
        };

        if let Err(e) = device.activate_stream(stream) {
            self.send_error(&format!("failed to activate stream: {e}"));
            return;
        }

        self.streaming.store(true, Ordering::Release);
        self.ring.lock().set_flag(RingFlags::RUNNING);

        let streaming = Arc::clone(&self.streaming);
        let ring = Arc::clone(&self.ring);
        let status = Arc::clone(&self.status_pipe);
        let handle = std::thread::Builder::new()
            .name("rsp-worker-stream".into())
            .spawn(move || streaming_loop(device, stream, ring, streaming, status))
            .ok();
        self.stream_thread = handle;

        self.send_status(MessageType::Started, None);
    }

    fn handle_stop(&mut self) {
        debug!("handling stop");

        if !self.streaming.load(Ordering::Acquire) {
            self.send_ack();
            return;
        }

        self.stop_streaming();
        if let (Some(device), Some(stream)) = (self.device.as_ref(), self.stream) {
            let _ = device.deactivate_stream(stream);
        }
        self.send_status(MessageType::Stopped, None);
    }

    fn stop_streaming(&mut self) {
        self.streaming.store(false, Ordering::Release);
        self.ring.lock().clear_flag(RingFlags::RUNNING);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }

    fn handle_set_frequency(&mut self, cmd: &ControlMessage) {
        let freq = cmd.param_f64("value", self.settings.center_hz);
        self.settings.center_hz = freq;
        if let Some(device) = self.device.as_ref() {
            device.set_frequency(0, freq);
        }
        self.send_ack();
    }

    fn handle_set_sample_rate(&mut self, cmd: &ControlMessage) {
        let rate = cmd.param_f64("value", self.settings.sample_rate);
        self.settings.sample_rate = rate;
        if let Some(device) = self.device.as_ref() {
            device.set_sample_rate(0, rate);
            self.ring.lock().set_sample_rate(rate as u32);
        }
        self.send_ack();
    }

    fn handle_set_gain(&mut self, cmd: &ControlMessage) {
        let gain = cmd.param_f64("value", self.settings.gain);
        self.settings.gain = gain;
        if let Some(device) = self.device.as_ref() {
            device.set_gain(0, gain);
        }
        self.send_ack();
    }

    fn handle_set_agc(&mut self, cmd: &ControlMessage) {
        let enabled = cmd.param_i64("value", self.settings.agc_enabled as i64) != 0;
        self.settings.agc_enabled = enabled;
        if let Some(device) = self.device.as_ref() {
            device.set_gain_mode(0, enabled);
        }
        self.send_ack();
    }

    fn handle_set_antenna(&mut self, cmd: &ControlMessage) {
        let antenna = cmd.param_or("value", &self.settings.antenna).to_string();
        self.settings.antenna = antenna.clone();
        if let Some(device) = self.device.as_ref() {
            device.set_antenna(0, &antenna);
        }
        self.send_ack();
    }

    fn handle_set_bandwidth(&mut self, cmd: &ControlMessage) {
        let bw = cmd.param_f64("value", self.settings.bandwidth);
        self.settings.bandwidth = bw;
        if let Some(device) = self.device.as_ref() {
            device.set_bandwidth(0, bw);
        }
        self.send_ack();
    }

    fn handle_get_status(&mut self) {
        let ring = self.ring.lock();
        let msg = ControlMessage::new(MessageType::Stats)
            .with_param(
                "streaming",
                if self.streaming.load(Ordering::Acquire) {
                    "true"
                } else {
                    "false"
                },
            )
            .with_param("center_hz", self.settings.center_hz)
            .with_param("sample_rate", self.settings.sample_rate)
            .with_param("gain", self.settings.gain)
            .with_param("agc", self.settings.agc_enabled as i64)
            .with_param("sample_count", ring.sample_count())
            .with_param("overflow_count", ring.overflow_count());
        drop(ring);
        self.send(msg);
    }

    fn send(&self, msg: ControlMessage) {
        if let Err(e) = self.status_pipe.lock().send(&msg, Duration::from_secs(5)) {
            warn!("failed to send status: {e}");
        }
    }

    fn send_status(&self, msg_type: MessageType, message: Option<&str>) {
        let mut msg = ControlMessage::new(msg_type);
        if let Some(text) = message {
            msg.set_param("message", text);
        }
        self.send(msg);
    }

    fn send_error(&self, message: &str) {
        error!("worker: {message}");
        self.ring.lock().set_flag(RingFlags::ERROR);
        let msg = ControlMessage::new(MessageType::Error).with_param("message", message);
        self.send(msg);
    }

    fn send_ack(&self) {
        self.send(ControlMessage::new(MessageType::Ack));
    }
}

/// 采样线程：流引擎 → 共享环
fn streaming_loop(
    device: Arc<dyn SdrDevice>,
    stream: StreamId,
    ring: Arc<Mutex<SharedRing>>,
    streaming: Arc<AtomicBool>,
    status: Arc<Mutex<IpcPipe>>,
) {
    info!("streaming loop started");
    let mut buffer = vec![Complex::new(0.0f32, 0.0); STREAM_CHUNK];

    while streaming.load(Ordering::Acquire) {
        match device.read_stream(
            stream,
            StreamBuf::Cf32(&mut buffer),
            Duration::from_millis(100),
        ) {
            Ok(outcome) if outcome.samples > 0 => {
                let written = ring.lock().write(&buffer[..outcome.samples]);
                if written < outcome.samples {
                    let dropped = (outcome.samples - written) as u64;
                    let msg = ControlMessage::new(MessageType::Overflow)
                        .with_param("dropped", dropped);
                    if let Err(e) = status.lock().send(&msg, Duration::from_millis(500)) {
                        warn!("failed to report overflow: {e}");
                    }
                }
            }
            Ok(_) => {}
            Err(StreamError::Timeout) => {} // 超时是常态
            Err(StreamError::Overflow) => {
                ring.lock().record_overflow();
            }
            Err(e) => {
                warn!("read_stream error in streaming loop: {e}");
            }
        }
    }
    info!("streaming loop ended");
}

/// worker 进程的生成与终止（代理侧）
pub struct WorkerSpawner;

impl WorkerSpawner {
    /// 定位 worker 可执行文件：环境变量覆盖 → 标准安装路径
    pub fn find_worker_executable() -> Option<std::path::PathBuf> {
        use std::path::PathBuf;

        if let Ok(path) = std::env::var("SOAPY_SDRPLAY_WORKER") {
            let p = PathBuf::from(path);
            if is_executable(&p) {
                return Some(p);
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            let p = PathBuf::from(home).join(".local/lib/SoapySDR/modules0.8-3/sdrplay_worker");
            if is_executable(&p) {
                return Some(p);
            }
        }

        for path in [
            "/usr/local/lib/SoapySDR/modules0.8-3/sdrplay_worker",
            "/usr/lib/SoapySDR/modules0.8-3/sdrplay_worker",
            "/opt/homebrew/lib/SoapySDR/modules0.8/sdrplay_worker",
        ] {
            let p = PathBuf::from(path);
            if is_executable(&p) {
                return Some(p);
            }
        }
        None
    }

    /// 生成 worker 子进程；返回 (child, 管道对)
    pub fn spawn(
        serial: &str,
        shm_name: &str,
    ) -> Result<(std::process::Child, PipePair), IpcError> {
        let Some(worker_path) = Self::find_worker_executable() else {
            error!(
                "cannot find sdrplay_worker executable. Set SOAPY_SDRPLAY_WORKER or install to a standard location."
            );
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "sdrplay_worker executable not found",
            )));
        };
        info!("using worker executable: {}", worker_path.display());

        let mut pipes = PipePair::create()?;
        let cmd_fd = pipes.child_cmd_raw().expect("fresh pipe pair");
        let status_fd = pipes.child_status_raw().expect("fresh pipe pair");

        let child = std::process::Command::new(&worker_path)
            .arg("--sdrplay-worker")
            .arg("--cmd-fd")
            .arg(cmd_fd.to_string())
            .arg("--status-fd")
            .arg(status_fd.to_string())
            .arg("--shm-name")
            .arg(shm_name)
            .arg("--serial")
            .arg(serial)
            // worker 自身绝不能再进代理模式
            .env_remove("SOAPY_SDRPLAY_MULTIDEV")
            .spawn()?;

        pipes.drop_child_side();
        info!("spawned worker PID {} for device {serial}", child.id());
        Ok((child, pipes))
    }

    /// 等待 worker 的 Ready 握手
    pub fn wait_for_ready(status_pipe: &mut IpcPipe, timeout: Duration) -> bool {
        match status_pipe.receive(timeout) {
            Ok(msg) if msg.msg_type == MessageType::Ready => {
                debug!("worker is ready");
                true
            }
            Ok(msg) if msg.msg_type == MessageType::Error => {
                error!(
                    "worker reported error: {}",
                    msg.param_or("message", "unknown")
                );
                false
            }
            Ok(msg) => {
                warn!("unexpected status {:?} while waiting for ready", msg.msg_type);
                false
            }
            Err(e) => {
                error!("timeout waiting for worker ready: {e}");
                false
            }
        }
    }

    /// 终止 worker：先 SIGTERM，宽限后 SIGKILL
    pub fn terminate(child: &mut std::process::Child) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);

        for _ in 0..10 {
            match child.try_wait() {
                Ok(Some(_)) => {
                    debug!("worker {pid} terminated");
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(_) => return,
            }
        }

        warn!("force killing worker {pid}");
        let _ = kill(pid, Signal::SIGKILL);
        let _ = child.wait();
    }
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
