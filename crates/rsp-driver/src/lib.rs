//! 进程内 SDRplay RSP 驱动
//!
//! 把进程级全局的厂商 API 适配成按设备的统一流接口：按序列号打开、
//! 配置频率/速率/增益/天线、激活流、拉取交错 I/Q 样本。三个核心子系统：
//!
//! - **流引擎**（[`stream`]）：厂商回调到宿主读取的实时生产者/消费者路径
//! - **设备会话**（[`device`] 及各设置模块）：选定/参数下发/释放的状态机
//! - **看门狗**（[`watchdog`]）：回调活性监控与恢复
//!
//! 进程外隔离（代理/worker）在 `rsp-proxy` crate。

pub mod antenna;
pub mod device;
pub mod device_api;
pub mod error;
pub mod frequency;
pub mod gain;
pub mod sample_rate;
pub mod settings;
pub mod stream;
pub mod tables;
pub mod watchdog;

pub use device::RspDevice;
pub use device_api::{
    DeviceArgs, DirectBuf, ReadOutcome, SdrDevice, StreamBuf, StreamFormat, StreamId,
};
pub use error::{DriverError, StreamError};
pub use stream::BUFFER_SAMPLES;
pub use watchdog::{HealthInfo, HealthStatus, RecoveryResult, SettingsCache, WatchdogConfig};

use std::time::Duration;

impl SdrDevice for RspDevice {
    fn driver_key(&self) -> String {
        "sdrplay".to_string()
    }

    fn hardware_key(&self) -> String {
        self.hw_variant().model_name().to_string()
    }

    fn hardware_info(&self) -> DeviceArgs {
        let mut info = DeviceArgs::new();
        info.insert("serial".to_string(), self.serial());
        info
    }

    fn num_channels(&self) -> usize {
        let st = self.shared.general.lock();
        if st.info.duo_mode == rsp_vendor::RspDuoMode::DualTuner {
            2
        } else {
            1
        }
    }

    fn native_stream_format(&self) -> (&'static str, f64) {
        ("CS16", 32767.0)
    }

    fn setup_stream(
        &self,
        format: StreamFormat,
        channels: &[usize],
    ) -> Result<StreamId, DriverError> {
        self.setup_stream_impl(format, channels)
    }

    fn close_stream(&self, stream: StreamId) {
        self.close_stream_impl(stream)
    }

    fn stream_mtu(&self) -> usize {
        BUFFER_SAMPLES
    }

    fn activate_stream(&self, stream: StreamId) -> Result<(), StreamError> {
        self.activate_stream_impl(stream)
    }

    fn deactivate_stream(&self, _stream: StreamId) -> Result<(), StreamError> {
        // 可重复调用；拆除发生在 close
        Ok(())
    }

    fn read_stream(
        &self,
        stream: StreamId,
        buf: StreamBuf<'_>,
        timeout: Duration,
    ) -> Result<ReadOutcome, StreamError> {
        self.read_stream_impl(stream, buf, timeout)
    }

    fn acquire_read_buffer(
        &self,
        stream: StreamId,
        timeout: Duration,
    ) -> Result<(usize, DirectBuf<'_>), StreamError> {
        self.acquire_read_buffer_impl(stream, timeout)
    }

    fn release_read_buffer(&self, stream: StreamId, handle: usize) {
        self.release_read_buffer_impl(stream, handle)
    }

    fn antennas(&self, channel: usize) -> Vec<String> {
        self.antennas_impl(channel)
    }

    fn set_antenna(&self, channel: usize, name: &str) {
        self.set_antenna_impl(channel, name)
    }

    fn antenna(&self, channel: usize) -> String {
        self.antenna_name_impl(channel)
    }

    fn set_antenna_persistent(&self, channel: usize, name: &str, persistent: bool) {
        self.set_antenna_persistent_impl(channel, name, persistent)
    }

    fn antenna_persistent(&self, channel: usize) -> bool {
        self.antenna_persistent_impl(channel)
    }

    fn set_dc_offset_mode(&self, channel: usize, automatic: bool) {
        self.set_dc_offset_mode_impl(channel, automatic)
    }

    fn dc_offset_mode(&self, channel: usize) -> bool {
        self.dc_offset_mode_impl(channel)
    }

    fn set_frequency_correction(&self, channel: usize, ppm: f64) {
        self.set_frequency_element_impl(channel, "CORR", ppm)
    }

    fn frequency_correction(&self, channel: usize) -> f64 {
        self.frequency_element_impl(channel, "CORR")
    }

    fn set_gain_mode(&self, channel: usize, automatic: bool) {
        self.set_gain_mode_impl(channel, automatic)
    }

    fn gain_mode(&self, channel: usize) -> bool {
        self.gain_mode_impl(channel)
    }

    fn set_gain_element(&self, channel: usize, name: &str, value: f64) {
        self.set_gain_element_impl(channel, name, value)
    }

    fn gain_element(&self, channel: usize, name: &str) -> f64 {
        self.gain_element_impl(channel, name)
    }

    fn gain_element_range(&self, _channel: usize, name: &str) -> (f64, f64) {
        self.gain_element_range_impl(name)
    }

    fn set_gain(&self, channel: usize, value: f64) {
        self.set_gain_impl(channel, value)
    }

    fn gain(&self, channel: usize) -> f64 {
        self.gain_impl(channel)
    }

    fn gain_range(&self, _channel: usize) -> (f64, f64) {
        self.gain_range_impl()
    }

    fn set_frequency_element(&self, channel: usize, name: &str, value: f64) {
        self.set_frequency_element_impl(channel, name, value)
    }

    fn frequency_element(&self, channel: usize, name: &str) -> f64 {
        self.frequency_element_impl(channel, name)
    }

    fn frequency_range(&self, _channel: usize) -> (f64, f64) {
        self.frequency_range_impl()
    }

    fn set_sample_rate(&self, channel: usize, rate: f64) {
        self.set_sample_rate_impl(channel, rate)
    }

    fn sample_rate(&self, channel: usize) -> f64 {
        self.sample_rate_impl(channel)
    }

    fn sample_rates(&self, _channel: usize) -> Vec<f64> {
        self.sample_rates_impl()
    }

    fn set_bandwidth(&self, channel: usize, bw: f64) {
        self.set_bandwidth_impl(channel, bw)
    }

    fn bandwidth(&self, channel: usize) -> f64 {
        self.bandwidth_impl(channel)
    }

    fn bandwidths(&self, _channel: usize) -> Vec<f64> {
        self.bandwidths_impl()
    }

    fn write_setting(&self, key: &str, value: &str) {
        self.write_setting_inner(key, value)
    }

    fn read_setting(&self, key: &str) -> String {
        self.read_setting_inner(key)
    }
}
