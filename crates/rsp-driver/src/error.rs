//! 驱动层错误类型定义
//!
//! 错误分两族：构造期的致命错误（[`DriverError`]，唯一允许以 `Err` 终止
//! 的表面）和流操作错误码（[`StreamError`]，对应宿主 API 的语义码）。
//! 设置器既不 panic 也不返回 `Err`：无效参数记日志后忽略。

use rsp_vendor::VendorError;
use thiserror::Error;

/// 致命错误（设备构造 / 流建立）
#[derive(Error, Debug)]
pub enum DriverError {
    /// 厂商层错误
    #[error("vendor error: {0}")]
    Vendor(#[from] VendorError),

    /// make 参数缺少序列号
    #[error("no available RSP devices found")]
    NoSerial,

    /// (serial, sub-mode) 已被本进程内其它会话占用
    #[error("device {0} already claimed by this process")]
    AlreadyClaimed(String),

    /// RSPduo 模式字符串不合法
    #[error("invalid RSPduo mode '{0}'")]
    InvalidMode(String),

    /// RSPduo 天线名不合法（make 参数中）
    #[error("invalid RSPduo antenna '{0}'")]
    InvalidAntenna(String),

    /// 流通道选择不合法
    #[error("invalid channel selection")]
    InvalidChannels,

    /// 不支持的流格式
    #[error("invalid stream format '{0}' - only CS16 or CF32 are supported")]
    InvalidFormat(String),

    /// 流运行中不允许 setup_stream
    #[error("setup_stream cannot be called while streaming is active")]
    StreamActive,

    /// 代理模式下 worker 进程故障
    #[error("worker process failure: {0}")]
    Worker(String),
}

/// 宿主流操作错误码
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// 限期内没有数据
    #[error("timeout")]
    Timeout,

    /// 环溢出，样本被丢弃（下一次读取恢复）
    #[error("overflow")]
    Overflow,

    /// 操作不受支持（含设备被拔出后的所有流操作）
    #[error("not supported")]
    NotSupported,

    /// 流内部故障
    #[error("stream error")]
    Fault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_error_converts() {
        let e: DriverError = VendorError::NoMatchingDevice("ABC".into()).into();
        assert!(matches!(e, DriverError::Vendor(_)));
        assert!(e.to_string().contains("ABC"));
    }

    #[test]
    fn test_stream_error_display() {
        assert_eq!(StreamError::Timeout.to_string(), "timeout");
        assert_eq!(StreamError::Overflow.to_string(), "overflow");
        assert_eq!(StreamError::NotSupported.to_string(), "not supported");
    }
}
