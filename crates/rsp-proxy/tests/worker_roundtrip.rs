//! worker 协议回归测试
//!
//! 在单进程内用真实管道 + 真实共享环 + mock 厂商后端跑完整的
//! Ready → Configure → Start → 采样 → Stop → Shutdown 握手，
//! 校验环里样本与状态消息。

use std::sync::Arc;
use std::time::Duration;

use num_complex::Complex;
use tempfile::TempDir;

use rsp_driver::{DeviceArgs, RspDevice, SdrDevice};
use rsp_ipc::{ControlMessage, MessageType, PipePair, RingFlags, SharedRing};
use rsp_proxy::worker::Worker;
use rsp_vendor::api::DeviceHandle;
use rsp_vendor::mock::MockVendorApi;
use rsp_vendor::{ApiGate, HwVariant, VendorApi};

struct WorkerHarness {
    mock: Arc<MockVendorApi>,
    consumer: SharedRing,
    pipes: PipePair,
    worker_thread: Option<std::thread::JoinHandle<i32>>,
    _lock_dir: TempDir,
}

impl WorkerHarness {
    fn start(serial: &str) -> Self {
        let mock = Arc::new(MockVendorApi::new());
        mock.push_device(serial, HwVariant::Rsp1a);
        let api: Arc<dyn VendorApi> = mock.clone();
        let gate = Arc::new(ApiGate::new(api));

        let shm_name = format!("/rsp_worker_test_{}_{}", serial, std::process::id());
        let consumer = SharedRing::create(&shm_name, 1 << 17).unwrap();
        let producer_ring = SharedRing::open(&shm_name).unwrap();

        let mut pipes = PipePair::create().unwrap();
        let (worker_cmd, worker_status) = pipes.take_child_side().unwrap();

        let lock_dir = TempDir::new().unwrap();
        let lock_path = lock_dir.path().join("worker.lock");

        let gate_for_factory = gate.clone();
        let factory: rsp_proxy::worker::DeviceFactory = Box::new(move |args: &DeviceArgs| {
            let dev = RspDevice::new(gate_for_factory.clone(), args)?;
            dev.set_uninit_retry_delay(Duration::from_millis(10));
            Ok(Arc::new(dev) as Arc<dyn SdrDevice>)
        });

        let mut args = DeviceArgs::new();
        args.insert("serial".to_string(), serial.to_string());

        let mut worker =
            Worker::new(worker_cmd, worker_status, producer_ring, factory, args)
                .with_lock_path(&lock_path);
        let worker_thread = std::thread::spawn(move || worker.run());

        Self {
            mock,
            consumer,
            pipes,
            worker_thread: Some(worker_thread),
            _lock_dir: lock_dir,
        }
    }

    fn send(&mut self, msg: ControlMessage) {
        self.pipes.to_child.send(&msg, Duration::from_secs(2)).unwrap();
    }

    fn recv(&mut self) -> ControlMessage {
        self.pipes.from_child.receive(Duration::from_secs(5)).unwrap()
    }

    /// 等待指定状态，丢弃中间状态（Error 直接失败）
    fn expect_status(&mut self, expected: MessageType) -> ControlMessage {
        loop {
            let msg = self.recv();
            if msg.msg_type == expected {
                return msg;
            }
            assert_ne!(
                msg.msg_type,
                MessageType::Error,
                "worker error: {:?}",
                msg.param("message")
            );
        }
    }

    fn shutdown(mut self) {
        self.send(ControlMessage::new(MessageType::Shutdown));
        let _ = self.expect_status(MessageType::Ack);
        if let Some(handle) = self.worker_thread.take() {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert!(self.consumer.flags().contains(RingFlags::SHUTDOWN));
    }
}

#[test]
fn test_worker_full_lifecycle() {
    let mut h = WorkerHarness::start("WRKLIFE");

    // 握手：spawn 后第一条必须是 Ready
    let ready = h.recv();
    assert_eq!(ready.msg_type, MessageType::Ready);

    // Configure → Opened → Configured
    let configure = ControlMessage::new(MessageType::Configure)
        .with_param("center_hz", 7_100_000.0)
        .with_param("sample_rate", 2_000_000.0)
        .with_param("gain", 30.0)
        .with_param("agc", 0i64);
    h.send(configure);
    h.expect_status(MessageType::Configured);

    // Start → Started；采样线程开始喂环
    h.send(ControlMessage::new(MessageType::Start));
    h.expect_status(MessageType::Started);

    // Init 把配置快照下发到了"硬件"
    let params = h.mock.device_params(DeviceHandle(1)).unwrap();
    assert_eq!(params.rx_channel_a.tuner.rf_hz, 7_100_000.0);
    assert!(!params.rx_channel_a.ctrl.agc.enable);

    // 让采样线程吃掉激活时的 reset，再投样本
    std::thread::sleep(Duration::from_millis(300));
    h.mock.feed_samples_a(
        DeviceHandle(1),
        &[16384, -16384, 8192, -8192],
        &[8192, -8192, 16384, -16384],
        0,
    );
    let zeros = vec![0i16; rsp_driver::BUFFER_SAMPLES - 4];
    h.mock.feed_samples_a(DeviceHandle(1), &zeros, &zeros, 4);

    let mut out = vec![Complex::new(0.0f32, 0.0); 4];
    let got = h.consumer.read(&mut out, Duration::from_secs(5));
    assert_eq!(got, 4);
    assert!((out[0].re - 0.5).abs() < 1e-6);
    assert!((out[0].im - 0.25).abs() < 1e-6);
    assert!((out[1].re + 0.5).abs() < 1e-6);
    assert!((out[2].re - 0.25).abs() < 1e-6);

    // GetStatus 报告环计数
    h.send(ControlMessage::new(MessageType::GetStatus));
    let stats = h.expect_status(MessageType::Stats);
    assert_eq!(stats.param("streaming"), Some("true"));
    assert!(stats.param_i64("sample_count", 0) >= 4);

    // Stop → Stopped，RUNNING 标志清除
    h.send(ControlMessage::new(MessageType::Stop));
    h.expect_status(MessageType::Stopped);
    assert!(!h.consumer.flags().contains(RingFlags::RUNNING));

    h.shutdown();
}

#[test]
fn test_worker_setters_acknowledged() {
    let mut h = WorkerHarness::start("WRKSET");
    let _ready = h.recv();

    let configure = ControlMessage::new(MessageType::Configure)
        .with_param("sample_rate", 2_000_000.0)
        .with_param("agc", 0i64);
    h.send(configure);
    h.expect_status(MessageType::Configured);

    // 流运行中：设置经 Update 下发到"硬件"并以 Ack 确认
    h.send(ControlMessage::new(MessageType::Start));
    h.expect_status(MessageType::Started);

    h.send(ControlMessage::new(MessageType::SetFrequency).with_param("value", 14_200_000.0));
    h.expect_status(MessageType::Ack);
    let params = h.mock.device_params(DeviceHandle(1)).unwrap();
    assert_eq!(params.rx_channel_a.tuner.rf_hz, 14_200_000.0);

    h.send(ControlMessage::new(MessageType::SetSampleRate).with_param("value", 500_000.0));
    h.expect_status(MessageType::Ack);
    assert_eq!(h.consumer.sample_rate(), 500_000);

    h.send(ControlMessage::new(MessageType::SetAgc).with_param("value", 1i64));
    h.expect_status(MessageType::Ack);
    let params = h.mock.device_params(DeviceHandle(1)).unwrap();
    assert!(params.rx_channel_a.ctrl.agc.enable);

    h.send(ControlMessage::new(MessageType::Stop));
    h.expect_status(MessageType::Stopped);
    h.shutdown();
}

#[test]
fn test_worker_start_without_configure_errors() {
    let mut h = WorkerHarness::start("WRKERR");
    let _ready = h.recv();

    h.send(ControlMessage::new(MessageType::Start));
    let reply = h.recv();
    assert_eq!(reply.msg_type, MessageType::Error);
    assert!(reply.param("message").unwrap().contains("not configured"));

    h.shutdown();
}

#[test]
fn test_worker_stop_configure_restores_state() {
    let mut h = WorkerHarness::start("WRKREDO");
    let _ready = h.recv();

    let configure = ControlMessage::new(MessageType::Configure)
        .with_param("center_hz", 7_100_000.0)
        .with_param("sample_rate", 2_000_000.0)
        .with_param("gain", 24.0)
        .with_param("agc", 0i64);
    h.send(configure.clone());
    h.expect_status(MessageType::Configured);

    h.send(ControlMessage::new(MessageType::Start));
    h.expect_status(MessageType::Started);
    h.send(ControlMessage::new(MessageType::Stop));
    h.expect_status(MessageType::Stopped);

    // Configure → Start → Stop → Configure：工作状态可完全重建
    h.send(configure);
    h.expect_status(MessageType::Configured);
    let params = h.mock.device_params(DeviceHandle(1)).unwrap();
    assert_eq!(params.rx_channel_a.tuner.rf_hz, 7_100_000.0);

    h.shutdown();
}
