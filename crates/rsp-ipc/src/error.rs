//! IPC 层错误类型定义

use thiserror::Error;

/// IPC 错误
#[derive(Error, Debug)]
pub enum IpcError {
    /// 底层 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 系统调用错误（poll/shm/signal）
    #[error("syscall error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// 管道读写在限期内未完成
    #[error("pipe operation timed out")]
    Timeout,

    /// 对端关闭
    #[error("pipe disconnected")]
    Disconnected,

    /// 帧超过消息上限（接收方断开连接）
    #[error("oversized frame: {0} bytes (max {max})", max = super::pipe::MAX_MESSAGE_BYTES)]
    OversizedFrame(u32),

    /// 载荷不是合法消息
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),

    /// 共享内存段尺寸不合法
    #[error("invalid shared memory size: {0} bytes")]
    InvalidShmSize(usize),

    /// 锁获取超时
    #[error("cross-process lock timed out after {0} ms")]
    LockTimeout(u64),
}

#[cfg(test)]
mod tests {
    use super::IpcError;

    #[test]
    fn test_display() {
        assert!(
            IpcError::OversizedFrame(2 * 1024 * 1024)
                .to_string()
                .contains("2097152")
        );
        assert!(IpcError::LockTimeout(500).to_string().contains("500"));
    }
}
