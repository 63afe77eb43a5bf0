//! 代理/worker 进程间通信
//!
//! 三个相互独立的原语：
//! - [`message`] / [`pipe`]：长度前缀的类型化控制消息 + poll 驱动的非阻塞管道
//! - [`ring`]：共享内存 SPSC 采样环（复数浮点样本，原子索引）
//! - [`lock`]：跨进程文件锁 + 冷却间隔（共享同一 sdrplay 服务的进程用）

pub mod error;
pub mod lock;
pub mod message;
pub mod pipe;
pub mod ring;

pub use error::IpcError;
pub use lock::{
    CrossProcessLock, CrossProcessLockGuard, DEFAULT_LOCK_PATH, PROXY_OPEN_LOCK_PATH,
};
pub use message::{ControlMessage, MessageType};
pub use pipe::{IpcPipe, MAX_MESSAGE_BYTES, PipePair};
pub use ring::{DEFAULT_RING_SAMPLES, RingFlags, SharedRing, shm_name_for};
