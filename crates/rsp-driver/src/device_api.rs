//! 宿主设备接口
//!
//! 进程内驱动（`RspDevice`）与代理设备实现同一个 trait，宿主应用对二者
//! 无感。所有方法取 `&self`：实现内部用锁保证一致性（同厂商驱动的
//! const-方法 + mutable-mutex 约定）。
//!
//! 通道越界的约定（统一规则）：设置器静默返回，读取器返回默认值。

use std::collections::BTreeMap;
use std::time::Duration;

use num_complex::Complex;

use crate::error::{DriverError, StreamError};

/// make/enumerate 的键值参数（serial、mode、antenna、以及任意设置键）
pub type DeviceArgs = BTreeMap<String, String>;

/// 流格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// 交错 16 位有符号 I/Q，满量程 32767
    Cs16,
    /// 交错 32 位浮点 I/Q，满量程 1.0
    Cf32,
}

impl StreamFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "CS16" => Some(StreamFormat::Cs16),
            "CF32" => Some(StreamFormat::Cf32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamFormat::Cs16 => "CS16",
            StreamFormat::Cf32 => "CF32",
        }
    }
}

/// 流句柄（通道号）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub usize);

/// read_stream 的宿主缓冲
pub enum StreamBuf<'a> {
    Cs16(&'a mut [i16]),
    Cf32(&'a mut [Complex<f32>]),
}

impl StreamBuf<'_> {
    /// 容量（样本数）
    pub fn capacity(&self) -> usize {
        match self {
            StreamBuf::Cs16(b) => b.len() / 2,
            StreamBuf::Cf32(b) => b.len(),
        }
    }
}

/// 直接缓冲访问的只读视图
pub enum DirectBuf<'a> {
    Cs16(&'a [i16]),
    Cf32(&'a [Complex<f32>]),
}

impl DirectBuf<'_> {
    pub fn samples(&self) -> usize {
        match self {
            DirectBuf::Cs16(b) => b.len() / 2,
            DirectBuf::Cf32(b) => b.len(),
        }
    }
}

/// read_stream 结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// 写入宿主缓冲的样本数
    pub samples: usize,
    /// 当前内部缓冲还有剩余（宿主缓冲小于内部块时置位）
    pub more_fragments: bool,
}

/// 宿主设备接口（进程内驱动与代理共同实现）
pub trait SdrDevice: Send + Sync {
    // ==================== 标识 ====================

    fn driver_key(&self) -> String;
    fn hardware_key(&self) -> String;
    fn hardware_info(&self) -> DeviceArgs;

    /// RX 通道数（RSPduo 双调谐器为 2，其余 1）
    fn num_channels(&self) -> usize;

    // ==================== 流 ====================

    fn stream_formats(&self) -> Vec<&'static str> {
        vec!["CS16", "CF32"]
    }

    /// 原生格式与满量程
    fn native_stream_format(&self) -> (&'static str, f64);

    fn setup_stream(&self, format: StreamFormat, channels: &[usize])
    -> Result<StreamId, DriverError>;

    fn close_stream(&self, stream: StreamId);

    /// 单次读取的最大样本数
    fn stream_mtu(&self) -> usize;

    fn activate_stream(&self, stream: StreamId) -> Result<(), StreamError>;

    /// 设计上是 no-op：可以被多次调用，拆除在 close 时发生
    fn deactivate_stream(&self, stream: StreamId) -> Result<(), StreamError>;

    fn read_stream(
        &self,
        stream: StreamId,
        buf: StreamBuf<'_>,
        timeout: Duration,
    ) -> Result<ReadOutcome, StreamError>;

    /// 直接缓冲访问：取得下一个就绪缓冲（零拷贝）
    ///
    /// 返回 (handle, 视图)。读完必须用同一 handle 调用
    /// [`SdrDevice::release_read_buffer`]，视图在 release 后失效。
    fn acquire_read_buffer(
        &self,
        stream: StreamId,
        timeout: Duration,
    ) -> Result<(usize, DirectBuf<'_>), StreamError>;

    fn release_read_buffer(&self, stream: StreamId, handle: usize);

    // ==================== 天线 ====================

    fn antennas(&self, channel: usize) -> Vec<String>;
    fn set_antenna(&self, channel: usize, name: &str);
    fn antenna(&self, channel: usize) -> String;

    /// 持久化天线选择：写入配置目录，下次打开同一 cache key 时重放
    fn set_antenna_persistent(&self, channel: usize, name: &str, persistent: bool);
    fn antenna_persistent(&self, channel: usize) -> bool;

    // ==================== 前端校正 ====================

    fn has_dc_offset_mode(&self) -> bool {
        true
    }
    fn set_dc_offset_mode(&self, channel: usize, automatic: bool);
    fn dc_offset_mode(&self, channel: usize) -> bool;

    fn has_frequency_correction(&self) -> bool {
        true
    }
    fn set_frequency_correction(&self, channel: usize, ppm: f64);
    fn frequency_correction(&self, channel: usize) -> f64;

    // ==================== 增益 ====================

    fn gain_elements(&self, channel: usize) -> Vec<String> {
        let _ = channel;
        vec!["IFGR".to_string(), "RFGR".to_string()]
    }

    fn has_gain_mode(&self) -> bool {
        true
    }
    /// AGC 开关
    fn set_gain_mode(&self, channel: usize, automatic: bool);
    fn gain_mode(&self, channel: usize) -> bool;

    fn set_gain_element(&self, channel: usize, name: &str, value: f64);
    fn gain_element(&self, channel: usize, name: &str) -> f64;
    fn gain_element_range(&self, channel: usize, name: &str) -> (f64, f64);

    /// 总标量增益（dB），内部映射到 LNA 状态 + IF 衰减
    fn set_gain(&self, channel: usize, value: f64);
    fn gain(&self, channel: usize) -> f64;
    fn gain_range(&self, channel: usize) -> (f64, f64);

    // ==================== 频率 ====================

    fn frequency_elements(&self, channel: usize) -> Vec<String> {
        let _ = channel;
        vec!["RF".to_string(), "CORR".to_string()]
    }

    fn set_frequency(&self, channel: usize, hz: f64) {
        self.set_frequency_element(channel, "RF", hz);
    }
    fn frequency(&self, channel: usize) -> f64 {
        self.frequency_element(channel, "RF")
    }
    fn set_frequency_element(&self, channel: usize, name: &str, value: f64);
    fn frequency_element(&self, channel: usize, name: &str) -> f64;
    fn frequency_range(&self, channel: usize) -> (f64, f64);

    // ==================== 采样率 / 带宽 ====================

    fn set_sample_rate(&self, channel: usize, rate: f64);
    fn sample_rate(&self, channel: usize) -> f64;
    fn sample_rates(&self, channel: usize) -> Vec<f64>;

    fn set_bandwidth(&self, channel: usize, bw: f64);
    fn bandwidth(&self, channel: usize) -> f64;
    fn bandwidths(&self, channel: usize) -> Vec<f64>;

    // ==================== 设置键 ====================

    fn write_setting(&self, key: &str, value: &str);
    fn read_setting(&self, key: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_format_parse() {
        assert_eq!(StreamFormat::parse("CS16"), Some(StreamFormat::Cs16));
        assert_eq!(StreamFormat::parse("CF32"), Some(StreamFormat::Cf32));
        assert_eq!(StreamFormat::parse("CU8"), None);
        assert_eq!(StreamFormat::Cs16.as_str(), "CS16");
    }

    #[test]
    fn test_stream_buf_capacity_in_samples() {
        let mut shorts = [0i16; 8];
        assert_eq!(StreamBuf::Cs16(&mut shorts).capacity(), 4);
        let mut floats = [Complex::new(0.0f32, 0.0); 8];
        assert_eq!(StreamBuf::Cf32(&mut floats).capacity(), 8);
    }
}
