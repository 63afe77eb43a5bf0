//! 驱动层集成测试
//!
//! 用 MockVendorApi 驱动完整路径：选定 → 配置 → 激活 → 回调投递 →
//! 宿主读取。覆盖 CS16/CF32 采样路径、溢出一次性上报、AGC 语义、
//! 无效参数拒绝与设置缓存恢复。

use std::sync::Arc;
use std::time::{Duration, Instant};

use num_complex::Complex;
use tempfile::TempDir;

use rsp_driver::{
    RspDevice, SdrDevice, StreamBuf, StreamError, StreamFormat,
};
use rsp_vendor::mock::MockVendorApi;
use rsp_vendor::{ApiGate, Event, HwVariant, TunerSelect, VendorApi};

struct Fixture {
    mock: Arc<MockVendorApi>,
    gate: Arc<ApiGate>,
    _config_dir: TempDir,
    config_path: std::path::PathBuf,
}

impl Fixture {
    fn new(serial: &str, variant: HwVariant) -> Self {
        let mock = Arc::new(MockVendorApi::new());
        mock.push_device(serial, variant);
        let api: Arc<dyn VendorApi> = mock.clone();
        let gate = Arc::new(ApiGate::new(api));
        let config_dir = TempDir::new().unwrap();
        let config_path = config_dir.path().to_path_buf();
        Self {
            mock,
            gate,
            _config_dir: config_dir,
            config_path,
        }
    }

    fn open(&self, serial: &str) -> RspDevice {
        let mut args = rsp_driver::DeviceArgs::new();
        args.insert("serial".to_string(), serial.to_string());
        let dev = RspDevice::new_with_config_dir(
            self.gate.clone(),
            &args,
            Some(self.config_path.clone()),
        )
        .unwrap();
        dev.set_uninit_retry_delay(Duration::from_millis(10));
        dev
    }
}

/// 投递一个足以关闭当前填充缓冲的零突发
fn flush_ring(mock: &MockVendorApi, handle: rsp_vendor::api::DeviceHandle, already: usize) {
    let n = rsp_driver::BUFFER_SAMPLES - already;
    let zeros = vec![0i16; n];
    mock.feed_samples_a(handle, &zeros, &zeros, already as u32);
}

/// 吃掉 activate 置位的 reset（第一次读取按约定排空重启序列）
fn absorb_reset(dev: &RspDevice, stream: rsp_driver::StreamId) {
    let mut out = [0i16; 2];
    let _ = dev.read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_millis(5));
}

#[test]
fn test_cs16_path_end_to_end() {
    let fx = Fixture::new("CS16DEV", HwVariant::Rsp1a);
    let dev = fx.open("CS16DEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    absorb_reset(&dev, stream);
    let handle = dev.vendor_handle();

    // 4 个样本，随后补零推进环
    fx.mock
        .feed_samples_a(handle, &[1, 2, 3, 4], &[5, 6, 7, 8], 0);
    flush_ring(&fx.mock, handle, 4);

    let mut out = [0i16; 8];
    let outcome = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_secs(1))
        .unwrap();
    assert_eq!(outcome.samples, 4);
    assert!(!outcome.more_fragments);
    assert_eq!(out, [1, 5, 2, 6, 3, 7, 4, 8]);

    dev.close_stream(stream);
}

#[test]
fn test_cf32_path_scales_by_reciprocal() {
    let fx = Fixture::new("CF32DEV", HwVariant::Rsp1a);
    let dev = fx.open("CF32DEV");

    let stream = dev.setup_stream(StreamFormat::Cf32, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    absorb_reset(&dev, stream);
    let handle = dev.vendor_handle();

    fx.mock
        .feed_samples_a(handle, &[16384, -16384], &[8192, -8192], 0);
    flush_ring(&fx.mock, handle, 2);

    let mut out = [Complex::new(0.0f32, 0.0); 4];
    let outcome = dev
        .read_stream(stream, StreamBuf::Cf32(&mut out), Duration::from_secs(1))
        .unwrap();
    assert_eq!(outcome.samples, 2);
    assert!((out[0].re - 0.5).abs() < 1e-6);
    assert!((out[0].im - 0.25).abs() < 1e-6);
    assert!((out[1].re + 0.5).abs() < 1e-6);
    assert!((out[1].im + 0.25).abs() < 1e-6);

    dev.close_stream(stream);
}

#[test]
fn test_fragmented_read_sets_flag() {
    let fx = Fixture::new("FRAGDEV", HwVariant::Rsp1a);
    let dev = fx.open("FRAGDEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    absorb_reset(&dev, stream);
    let handle = dev.vendor_handle();

    fx.mock
        .feed_samples_a(handle, &[10, 20, 30, 40], &[11, 21, 31, 41], 0);
    flush_ring(&fx.mock, handle, 4);

    // 宿主缓冲一次只装 2 个样本：分片读取
    let mut out = [0i16; 4];
    let first = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_secs(1))
        .unwrap();
    assert_eq!(first.samples, 2);
    assert!(first.more_fragments);
    assert_eq!(out, [10, 11, 20, 21]);

    let second = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_secs(1))
        .unwrap();
    assert_eq!(second.samples, 2);
    assert!(!second.more_fragments);
    assert_eq!(out[..4], [30, 31, 40, 41]);

    dev.close_stream(stream);
}

#[test]
fn test_overflow_surfaces_exactly_once_then_resumes() {
    let fx = Fixture::new("OVFDEV", HwVariant::Rsp1a);
    let dev = fx.open("OVFDEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    absorb_reset(&dev, stream);
    let handle = dev.vendor_handle();

    // 8 个满缓冲把在途计数推到 N
    let full = vec![7i16; rsp_driver::BUFFER_SAMPLES];
    for i in 0..8 {
        fx.mock.feed_samples_a(
            handle,
            &full,
            &full,
            (i * rsp_driver::BUFFER_SAMPLES) as u32,
        );
    }
    // 再来一个突发：触发溢出丢弃
    fx.mock
        .feed_samples_a(handle, &[9, 9], &[9, 9], (8 * rsp_driver::BUFFER_SAMPLES) as u32);

    // 下一次读取恰好上报一次 OVERFLOW
    let mut out = vec![0i16; 16];
    let err = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(err, StreamError::Overflow);

    // 溢出排空之后恢复正常
    fx.mock.feed_samples_a(handle, &[1, 2], &[3, 4], 0);
    flush_ring(&fx.mock, handle, 2);
    let outcome = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_secs(1))
        .unwrap();
    assert_eq!(outcome.samples, 2);

    dev.close_stream(stream);
}

#[test]
fn test_read_with_zero_timeout_never_blocks() {
    let fx = Fixture::new("ZTODEV", HwVariant::Rsp1a);
    let dev = fx.open("ZTODEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();

    let mut out = [0i16; 8];
    let start = Instant::now();
    let err = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::ZERO)
        .unwrap_err();
    assert_eq!(err, StreamError::Timeout);
    assert!(start.elapsed() < Duration::from_millis(100));

    dev.close_stream(stream);
}

#[test]
fn test_direct_buffer_access() {
    let fx = Fixture::new("DIRDEV", HwVariant::Rsp1a);
    let dev = fx.open("DIRDEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    absorb_reset(&dev, stream);
    let vendor = dev.vendor_handle();

    fx.mock.feed_samples_a(vendor, &[1, 2], &[3, 4], 0);
    flush_ring(&fx.mock, vendor, 2);

    let (handle, buf) = dev
        .acquire_read_buffer(stream, Duration::from_secs(1))
        .unwrap();
    match buf {
        rsp_driver::DirectBuf::Cs16(data) => {
            assert_eq!(&data[..4], &[1, 3, 2, 4]);
        }
        _ => panic!("expected CS16 direct buffer"),
    }
    dev.release_read_buffer(stream, handle);

    dev.close_stream(stream);
}

#[test]
fn test_device_removed_fails_stream_ops() {
    let fx = Fixture::new("GONEDEV", HwVariant::Rsp1a);
    let dev = fx.open("GONEDEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();
    let handle = dev.vendor_handle();

    fx.mock
        .emit_event(handle, Event::DeviceRemoved, TunerSelect::A);
    assert!(dev.device_unavailable());

    let mut out = [0i16; 8];
    let err = dev
        .read_stream(stream, StreamBuf::Cs16(&mut out), Duration::from_millis(200))
        .unwrap_err();
    assert_eq!(err, StreamError::NotSupported);

    dev.close_stream(stream);
}

#[test]
fn test_agc_refuses_ifgr_but_accepts_rfgr() {
    let fx = Fixture::new("AGCDEV", HwVariant::Rsp1a);
    let dev = fx.open("AGCDEV");

    dev.set_gain_mode(0, true);
    assert!(dev.gain_mode(0));

    let ifgr_before = dev.gain_element(0, "IFGR");
    dev.set_gain_element(0, "IFGR", 25.0);
    assert_eq!(dev.gain_element(0, "IFGR"), ifgr_before);

    dev.set_gain_element(0, "RFGR", 3.0);
    assert_eq!(dev.gain_element(0, "RFGR"), 3.0);

    // AGC 设定点仍可写
    dev.write_setting("agc_setpoint", "-42");
    assert_eq!(dev.read_setting("agc_setpoint"), "-42");
}

#[test]
fn test_scalar_gain_round_trip() {
    let fx = Fixture::new("GAINDEV", HwVariant::RspDx);
    let dev = fx.open("GAINDEV");
    dev.set_gain_mode(0, false);

    let (lo, hi) = dev.gain_range(0);
    assert_eq!(lo, 0.0);
    let mut g = lo;
    while g <= hi {
        dev.set_gain(0, g);
        let back = dev.gain(0);
        assert!(
            (back - g).abs() <= 12.0,
            "gain round trip too far off: set {g} got {back}"
        );
        g += 5.0;
    }
}

#[test]
fn test_unsupported_sample_rate_rejected() {
    let fx = Fixture::new("RATEDEV", HwVariant::Rsp1a);
    let dev = fx.open("RATEDEV");

    let before = dev.sample_rate(0);
    dev.set_sample_rate(0, 1_234_567.0);
    assert_eq!(dev.sample_rate(0), before);

    dev.set_sample_rate(0, 96_000.0);
    assert_eq!(dev.sample_rate(0), 96_000.0);

    dev.set_sample_rate(0, 2_000_000.0);
    assert_eq!(dev.sample_rate(0), 2_000_000.0);
}

#[test]
fn test_corr_on_slave_reads_zero_and_rejects_writes() {
    let fx = Fixture::new("DUOSLV", HwVariant::RspDuo);
    let mut args = rsp_driver::DeviceArgs::new();
    args.insert("serial".to_string(), "DUOSLV".to_string());
    args.insert("mode".to_string(), "SL".to_string());
    let dev =
        RspDevice::new_with_config_dir(fx.gate.clone(), &args, Some(fx.config_path.clone()))
            .unwrap();

    assert_eq!(dev.frequency_correction(0), 0.0);
    dev.set_frequency_correction(0, 3.5);
    assert_eq!(dev.frequency_correction(0), 0.0);
}

#[test]
fn test_double_open_same_key_refused() {
    let fx = Fixture::new("DUPDEV", HwVariant::Rsp1a);
    let _first = fx.open("DUPDEV");

    let mut args = rsp_driver::DeviceArgs::new();
    args.insert("serial".to_string(), "DUPDEV".to_string());
    let second =
        RspDevice::new_with_config_dir(fx.gate.clone(), &args, Some(fx.config_path.clone()));
    assert!(second.is_err());
}

#[test]
fn test_antenna_persistence_across_reopen() {
    let fx = Fixture::new("ANTDEV", HwVariant::Rsp2);

    {
        let dev = fx.open("ANTDEV");
        dev.set_antenna(0, "Antenna B");
        assert_eq!(dev.antenna(0), "Antenna B");
    }

    // 同一 cache key 重新打开：持久化的选择被重放
    let dev = fx.open("ANTDEV");
    assert_eq!(dev.antenna(0), "Antenna B");
}

#[test]
fn test_settings_cache_save_restore() {
    let fx = Fixture::new("CACHEDEV", HwVariant::Rsp1a);
    let dev = fx.open("CACHEDEV");
    dev.set_gain_mode(0, false);

    dev.set_frequency(0, 145_500_000.0);
    dev.set_gain_element(0, "IFGR", 32.0);
    dev.set_gain_element(0, "RFGR", 2.0);
    dev.write_setting("biasT_ctrl", "true");
    dev.save_settings();

    // 改掉所有值
    dev.set_frequency(0, 100_000_000.0);
    dev.set_gain_element(0, "IFGR", 50.0);
    dev.set_gain_element(0, "RFGR", 0.0);
    dev.write_setting("biasT_ctrl", "false");

    assert!(dev.restore_settings());
    assert_eq!(dev.frequency(0), 145_500_000.0);
    assert_eq!(dev.gain_element(0, "IFGR"), 32.0);
    assert_eq!(dev.gain_element(0, "RFGR"), 2.0);
    assert_eq!(dev.read_setting("biasT_ctrl"), "true");
}

#[test]
fn test_uninit_stop_pending_retries() {
    let fx = Fixture::new("PENDDEV", HwVariant::Rsp1a);
    let dev = fx.open("PENDDEV");

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();

    fx.mock.set_uninit_stop_pending(2);
    let start = Instant::now();
    dev.close_stream(stream);
    // 两次 StopPending 重试（每次 10ms 延迟）后完成
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(!fx.mock.is_inited(dev.vendor_handle()));
}

#[test]
fn test_frequency_range_enforced() {
    let fx = Fixture::new("FREQDEV", HwVariant::Rsp1a);
    let dev = fx.open("FREQDEV");

    let before = dev.frequency(0);
    dev.set_frequency(0, 500.0); // 低于 1kHz
    assert_eq!(dev.frequency(0), before);

    dev.set_frequency(0, 7_100_000.0);
    assert_eq!(dev.frequency(0), 7_100_000.0);

    let (lo, hi) = dev.frequency_range(0);
    assert_eq!(lo, 1_000.0);
    assert_eq!(hi, 2_000_000_000.0);
}

#[test]
fn test_setter_confirmation_via_callback_flags() {
    let fx = Fixture::new("CONFDEV", HwVariant::Rsp1a);
    let dev = fx.open("CONFDEV");
    dev.set_gain_mode(0, false);

    let stream = dev.setup_stream(StreamFormat::Cs16, &[0]).unwrap();
    dev.activate_stream(stream).unwrap();

    // mock 在 update 时同步投递确认回调：设置器不因等待确认而超时
    let start = Instant::now();
    dev.set_gain_element(0, "IFGR", 30.0);
    assert!(start.elapsed() < Duration::from_millis(400));
    assert_eq!(dev.gain_element(0, "IFGR"), 30.0);

    let applied = fx.mock.device_params(dev.vendor_handle()).unwrap();
    assert_eq!(applied.rx_channel_a.tuner.gain.gr_db, 30);

    dev.close_stream(stream);
}

#[test]
fn test_invalid_channel_setters_ignored_getters_default() {
    let fx = Fixture::new("CHDEV", HwVariant::Rsp1a);
    let dev = fx.open("CHDEV");

    assert_eq!(dev.num_channels(), 1);
    dev.set_frequency(5, 7_000_000.0); // 越界：静默
    assert_eq!(dev.frequency(5), 0.0); // 越界：默认
    assert_eq!(dev.gain_element(5, "IFGR"), 0.0);
}

#[test]
fn test_hardware_identification() {
    let fx = Fixture::new("IDDEV", HwVariant::RspDx);
    let dev = fx.open("IDDEV");
    assert_eq!(dev.driver_key(), "sdrplay");
    assert_eq!(dev.hardware_key(), "RSPdx");
    assert_eq!(dev.hardware_info().get("serial").unwrap(), "IDDEV");
    let (fmt, full_scale) = dev.native_stream_format();
    assert_eq!(fmt, "CS16");
    assert_eq!(full_scale, 32767.0);
}
