//! 厂商层错误类型定义

use thiserror::Error;

/// 厂商 API 错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VendorError {
    /// 服务调用超时（调用已脱离挂起，由清理任务收尾）
    #[error("vendor service unresponsive: {0} timed out")]
    ServiceUnresponsive(&'static str),

    /// 连续超时超过阈值且外部重启失败，服务判定为不可用
    #[error("vendor service down (restart failed after {consecutive_timeouts} consecutive timeouts)")]
    ServiceDown { consecutive_timeouts: u32 },

    /// API 打开曾永久失败，进程重启前拒绝重试
    #[error("vendor API previously failed to open - restart process to retry")]
    OpenPermanentlyFailed,

    /// 设备枚举中没有匹配的序列号
    #[error("no device matches serial {0}")]
    NoMatchingDevice(String),

    /// 设备已被其它会话选定（瞬态，可重试）
    #[error("device {0} already selected")]
    AlreadySelected(String),

    /// RSPduo 模式/调谐器组合不可用
    #[error("RSPduo mode not available: {0}")]
    DuoModeUnavailable(&'static str),

    /// Uninit 返回 StopPending（RSPduo 从机仍在运行）
    #[error("uninit pending: slave device still attached")]
    StopPending,

    /// 其它非 Success 返回码
    #[error("vendor call {call} failed: {message}")]
    Call {
        call: &'static str,
        message: String,
    },
}

impl VendorError {
    /// 瞬态错误：调用方可以在退避后重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VendorError::AlreadySelected(_) | VendorError::StopPending
        )
    }
}

#[cfg(test)]
mod tests {
    use super::VendorError;

    #[test]
    fn test_display_formats() {
        let e = VendorError::ServiceUnresponsive("sdrplay_api_Update");
        assert!(e.to_string().contains("sdrplay_api_Update"));

        let e = VendorError::ServiceDown {
            consecutive_timeouts: 3,
        };
        assert!(e.to_string().contains('3'));

        let e = VendorError::NoMatchingDevice("1234ABCD".into());
        assert!(e.to_string().contains("1234ABCD"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(VendorError::AlreadySelected("x".into()).is_transient());
        assert!(VendorError::StopPending.is_transient());
        assert!(!VendorError::OpenPermanentlyFailed.is_transient());
        assert!(
            !VendorError::ServiceDown {
                consecutive_timeouts: 3
            }
            .is_transient()
        );
    }
}
