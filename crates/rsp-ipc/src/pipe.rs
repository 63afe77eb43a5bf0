//! 控制管道
//!
//! 非阻塞匿名管道上的长度前缀消息流。读写都走 poll-with-timeout 循环，
//! `EAGAIN` 重试；超过 1MiB 的帧视为协议破坏，接收方断开。

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{F_GETFL, F_SETFL, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::error;

use crate::error::IpcError;
use crate::message::ControlMessage;

/// 单条消息上限（1 MiB）
pub const MAX_MESSAGE_BYTES: u32 = 1024 * 1024;

fn poll_timeout_ms(ms: u64) -> PollTimeout {
    PollTimeout::try_from(ms.min(i32::MAX as u64) as i32).unwrap_or(PollTimeout::MAX)
}

fn set_nonblocking(fd: RawFd) -> Result<(), IpcError> {
    // SAFETY: fd 在调用期间有效，BorrowedFd 仅存活于本函数
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let flags = OFlag::from_bits_truncate(fcntl(borrowed, F_GETFL)?);
    fcntl(borrowed, F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// 管道的一端（读或写）
pub struct IpcPipe {
    file: File,
}

impl IpcPipe {
    /// 接管一个已打开的描述符
    pub fn from_fd(fd: OwnedFd) -> Result<Self, IpcError> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            file: File::from(fd),
        })
    }

    /// 从 exec 继承的裸描述符构造（worker 进程入口用）
    ///
    /// # Safety
    /// 调用方保证 `fd` 有效且此后所有权归本对象。
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self, IpcError> {
        set_nonblocking(fd)?;
        // SAFETY: 见函数契约
        Ok(Self {
            file: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// 是否有数据可读（最多等待 `timeout`）
    pub fn has_data(&self, timeout: Duration) -> bool {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, poll_timeout_ms(timeout.as_millis() as u64)) {
            Ok(n) if n > 0 => fds[0]
                .revents()
                .map(|r| r.contains(PollFlags::POLLIN))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// 发送一条消息：4 字节小端长度 + 载荷
    pub fn send(&mut self, msg: &ControlMessage, timeout: Duration) -> Result<(), IpcError> {
        let payload = msg.serialize();
        let len = payload.len() as u32;
        let deadline = Instant::now() + timeout;
        self.write_exact(&len.to_le_bytes(), deadline)?;
        self.write_exact(&payload, deadline)
    }

    /// 接收一条消息；超时返回 [`IpcError::Timeout`]
    pub fn receive(&mut self, timeout: Duration) -> Result<ControlMessage, IpcError> {
        let deadline = Instant::now() + timeout;
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf, deadline)?;
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_MESSAGE_BYTES {
            error!("oversized IPC frame: {len} bytes, disconnecting");
            return Err(IpcError::OversizedFrame(len));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_exact(&mut payload, deadline)?;
        ControlMessage::deserialize(&payload)
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), IpcError> {
        let mut done = 0usize;
        while done < buf.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(IpcError::Timeout)?;
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            let n = poll(&mut fds, poll_timeout_ms(remaining.as_millis() as u64))?;
            if n == 0 {
                return Err(IpcError::Timeout);
            }
            match self.file.read(&mut buf[done..]) {
                Ok(0) => return Err(IpcError::Disconnected),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IpcError::Io(e)),
            }
        }
        Ok(())
    }

    fn write_exact(&mut self, buf: &[u8], deadline: Instant) -> Result<(), IpcError> {
        let mut done = 0usize;
        while done < buf.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(IpcError::Timeout)?;
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLOUT)];
            let n = poll(&mut fds, poll_timeout_ms(remaining.as_millis() as u64))?;
            if n == 0 {
                return Err(IpcError::Timeout);
            }
            match self.file.write(&buf[done..]) {
                Ok(0) => return Err(IpcError::Disconnected),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // 对端读端关闭时 write 返回 EPIPE
                    if e.raw_os_error() == Some(nix::errno::Errno::EPIPE as i32) {
                        return Err(IpcError::Disconnected);
                    }
                    return Err(IpcError::Io(e));
                }
            }
        }
        Ok(())
    }
}

/// 双向管道对（代理端持有）
///
/// 子进程端的描述符不带 CLOEXEC，exec 后由 worker 经
/// [`IpcPipe::from_raw_fd`] 接管；spawn 成功后父进程必须调用
/// [`PipePair::drop_child_side`] 释放自己的副本。
pub struct PipePair {
    /// 代理 → worker 命令
    pub to_child: IpcPipe,
    /// worker → 代理 状态
    pub from_child: IpcPipe,
    child_cmd_fd: Option<OwnedFd>,
    child_status_fd: Option<OwnedFd>,
}

impl PipePair {
    pub fn create() -> Result<Self, IpcError> {
        // 命令管道：父写子读
        let (cmd_read, cmd_write) = nix::unistd::pipe()?;
        // 状态管道：子写父读
        let (status_read, status_write) = nix::unistd::pipe()?;

        Ok(Self {
            to_child: IpcPipe::from_fd(cmd_write)?,
            from_child: IpcPipe::from_fd(status_read)?,
            child_cmd_fd: Some(cmd_read),
            child_status_fd: Some(status_write),
        })
    }

    /// 子进程命令端裸 fd（作为 `--cmd-fd` 传给 worker）
    pub fn child_cmd_raw(&self) -> Option<RawFd> {
        self.child_cmd_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// 子进程状态端裸 fd（作为 `--status-fd` 传给 worker）
    pub fn child_status_raw(&self) -> Option<RawFd> {
        self.child_status_fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// spawn 之后关闭父进程持有的子端副本
    ///
    /// 不关闭的话 worker 退出时父进程读不到 EOF。
    pub fn drop_child_side(&mut self) {
        self.child_cmd_fd.take();
        self.child_status_fd.take();
    }

    /// 进程内测试用：把子端也包成管道对象
    pub fn take_child_side(&mut self) -> Option<(IpcPipe, IpcPipe)> {
        let cmd = self.child_cmd_fd.take()?;
        let status = self.child_status_fd.take()?;
        let cmd_pipe = IpcPipe::from_fd(cmd).ok()?;
        let status_pipe = IpcPipe::from_fd(status).ok()?;
        Some((cmd_pipe, status_pipe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::thread;

    #[test]
    fn test_send_receive_roundtrip() {
        let mut pair = PipePair::create().unwrap();
        let (mut child_cmd, mut child_status) = pair.take_child_side().unwrap();

        let msg = ControlMessage::new(MessageType::Configure)
            .with_param("center_hz", 1.45e8)
            .with_param("antenna", "RX");
        pair.to_child.send(&msg, Duration::from_secs(1)).unwrap();
        let got = child_cmd.receive(Duration::from_secs(1)).unwrap();
        assert_eq!(got, msg);

        let reply = ControlMessage::new(MessageType::Configured);
        child_status.send(&reply, Duration::from_secs(1)).unwrap();
        let got = pair.from_child.receive(Duration::from_secs(1)).unwrap();
        assert_eq!(got.msg_type, MessageType::Configured);
    }

    #[test]
    fn test_receive_times_out() {
        let mut pair = PipePair::create().unwrap();
        let (_child_cmd, _child_status) = pair.take_child_side().unwrap();
        let err = pair.from_child.receive(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, IpcError::Timeout));
    }

    #[test]
    fn test_disconnect_on_peer_close() {
        let mut pair = PipePair::create().unwrap();
        let (child_cmd, child_status) = pair.take_child_side().unwrap();
        drop(child_cmd);
        drop(child_status);
        let err = pair.from_child.receive(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, IpcError::Disconnected));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut pair = PipePair::create().unwrap();
        let (mut child_cmd, _child_status) = pair.take_child_side().unwrap();

        // 伪造超限长度前缀
        let bogus = (MAX_MESSAGE_BYTES + 1).to_le_bytes();
        let deadline = Instant::now() + Duration::from_secs(1);
        pair.to_child.write_exact(&bogus, deadline).unwrap();

        let err = child_cmd.receive(Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, IpcError::OversizedFrame(_)));
    }

    #[test]
    fn test_large_message_crosses_pipe_buffer() {
        // 超过内核管道缓冲（64KiB）的消息依赖写侧 poll 循环
        let mut pair = PipePair::create().unwrap();
        let (mut child_cmd, _child_status) = pair.take_child_side().unwrap();

        let big = "x".repeat(300 * 1024);
        let msg = ControlMessage::new(MessageType::Error).with_param("message", big.as_str());

        let reader = thread::spawn(move || child_cmd.receive(Duration::from_secs(5)).unwrap());
        pair.to_child.send(&msg, Duration::from_secs(5)).unwrap();
        let got = reader.join().unwrap();
        assert_eq!(got.param("message").unwrap().len(), big.len());
    }

    #[test]
    fn test_has_data() {
        let mut pair = PipePair::create().unwrap();
        let (mut child_cmd, _child_status) = pair.take_child_side().unwrap();
        assert!(!child_cmd.has_data(Duration::from_millis(10)));
        pair.to_child
            .send(
                &ControlMessage::new(MessageType::GetStatus),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(child_cmd.has_data(Duration::from_millis(200)));
        let _ = child_cmd.receive(Duration::from_secs(1)).unwrap();
    }
}
