//! 共享内存采样环
//!
//! 进程间单生产者/单消费者的复数浮点采样环。布局：
//!
//! ```text
//! [头部 64 字节（原子计数器）][样本区 M * sizeof(Complex<f32>)]
//! ```
//!
//! 写侧以 release 序发布 `write_idx`，读侧以 acquire 序装载，保证消费者
//! 看到的样本已经完整写入。索引只增不减；`write_idx - read_idx <= M`。
//! 环由消费者（代理）创建并在销毁时 unlink，生产者（worker）只 open。

use std::fs::File;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use num_complex::Complex;
use tracing::{debug, error, info};

use crate::error::IpcError;

/// 默认环容量：32Mi 样本（256MB）
pub const DEFAULT_RING_SAMPLES: usize = 32 * 1024 * 1024;

const SAMPLE_SIZE: usize = std::mem::size_of::<Complex<f32>>();

/// 环状态标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFlags(pub u32);

impl RingFlags {
    pub const DATA_READY: u32 = 0x01;
    pub const OVERFLOW: u32 = 0x02;
    pub const ERROR: u32 = 0x04;
    pub const RUNNING: u32 = 0x08;
    pub const SHUTDOWN: u32 = 0x10;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// 头部：偏移 0 处的原子计数器组
///
/// `align(64)` 把头部补齐到 64 字节，样本区从固定偏移开始。
#[repr(C, align(64))]
struct RingHeader {
    /// 生产者已写入的样本总数
    write_idx: AtomicU64,
    /// 消费者已读取的样本总数（信息性）
    read_idx: AtomicU64,
    /// 累计传输样本数（统计）
    sample_count: AtomicU64,
    /// 溢出次数
    overflow_count: AtomicU64,
    /// 当前采样率
    sample_rate: AtomicU32,
    /// 状态标志
    flags: AtomicU32,
    /// 最近一次写入时间（单调时钟，纳秒）
    timestamp_ns: AtomicI64,
}

const HEADER_SIZE: usize = std::mem::size_of::<RingHeader>();

/// 共享内存采样环
pub struct SharedRing {
    name: String,
    mmap: MmapMut,
    num_samples: usize,
    /// 创建者负责 unlink
    owner: bool,
    // 消费者本地读游标（不经过共享头部往返）
    last_read_idx: u64,
    last_overflow_count: u64,
}

// SAFETY: 所有共享状态都经过头部原子量访问；样本区遵循 SPSC 索引协议
unsafe impl Send for SharedRing {}

impl SharedRing {
    /// 创建新环（消费者/代理侧）。`num_samples` 必须是 2 的幂。
    pub fn create(name: &str, num_samples: usize) -> Result<Self, IpcError> {
        if num_samples == 0 || !num_samples.is_power_of_two() {
            return Err(IpcError::InvalidShmSize(num_samples));
        }
        let total = HEADER_SIZE + num_samples * SAMPLE_SIZE;

        // 清理上一次异常退出的残留段
        let _ = shm_unlink(name);

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o666),
        )?;
        let file = File::from(fd);
        file.set_len(total as u64)?;

        // SAFETY: 映射长度与文件长度一致；并发访问由头部原子量约束
        let mmap = unsafe { MmapOptions::new().len(total).map_mut(&file)? };

        let ring = Self {
            name: name.to_string(),
            mmap,
            num_samples,
            owner: true,
            last_read_idx: 0,
            last_overflow_count: 0,
        };
        let h = ring.header();
        h.write_idx.store(0, Ordering::Release);
        h.read_idx.store(0, Ordering::Release);
        h.sample_count.store(0, Ordering::Release);
        h.overflow_count.store(0, Ordering::Release);
        h.sample_rate.store(0, Ordering::Release);
        h.flags.store(0, Ordering::Release);
        h.timestamp_ns.store(0, Ordering::Release);

        info!(
            "shared ring created: {} ({} samples, {:.1} MB)",
            name,
            num_samples,
            total as f64 / (1024.0 * 1024.0)
        );
        Ok(ring)
    }

    /// 打开已存在的环（生产者/worker 侧）
    pub fn open(name: &str) -> Result<Self, IpcError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::from_bits_truncate(0o666))?;
        let file = File::from(fd);
        let total = file.metadata()?.len() as usize;
        if total < HEADER_SIZE {
            return Err(IpcError::InvalidShmSize(total));
        }
        let num_samples = (total - HEADER_SIZE) / SAMPLE_SIZE;

        // SAFETY: 同 create()
        let mmap = unsafe { MmapOptions::new().len(total).map_mut(&file)? };

        debug!("shared ring opened: {name} ({num_samples} samples)");
        Ok(Self {
            name: name.to_string(),
            mmap,
            num_samples,
            owner: false,
            last_read_idx: 0,
            last_overflow_count: 0,
        })
    }

    /// 重新映射同名段（worker 崩溃后旧映射失效时由消费者调用）
    pub fn reattach(&mut self) -> Result<(), IpcError> {
        let fd = shm_open(
            self.name.as_str(),
            OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )?;
        let file = File::from(fd);
        let total = HEADER_SIZE + self.num_samples * SAMPLE_SIZE;
        // SAFETY: 同 create()
        self.mmap = unsafe { MmapOptions::new().len(total).map_mut(&file)? };
        debug!("shared ring reattached: {}", self.name);
        Ok(())
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: 映射首 64 字节即头部，repr(C) 且映射对齐到页
        unsafe { &*(self.mmap.as_ptr() as *const RingHeader) }
    }

    fn data_ptr(&self) -> *mut Complex<f32> {
        // SAFETY: 样本区紧随头部
        unsafe { self.mmap.as_ptr().add(HEADER_SIZE) as *mut Complex<f32> }
    }

    // ==================== 生产者 API ====================

    /// 写入样本；空间不足时截断并记一次溢出。返回实际写入数。
    pub fn write(&mut self, samples: &[Complex<f32>]) -> usize {
        let h = self.header();
        let write_idx = h.write_idx.load(Ordering::Relaxed);
        let read_idx = h.read_idx.load(Ordering::Acquire);

        let used = (write_idx - read_idx) as usize;
        let free = self.num_samples - used;

        let mut count = samples.len();
        if count > free {
            self.record_overflow();
            count = free;
        }
        if count == 0 {
            return 0;
        }

        let mask = self.num_samples - 1;
        let write_pos = (write_idx as usize) & mask;
        let first = count.min(self.num_samples - write_pos);

        // SAFETY: SPSC 协议保证 [write_idx, write_idx+count) 区间当前无读者
        unsafe {
            std::ptr::copy_nonoverlapping(samples.as_ptr(), self.data_ptr().add(write_pos), first);
            if count > first {
                std::ptr::copy_nonoverlapping(
                    samples.as_ptr().add(first),
                    self.data_ptr(),
                    count - first,
                );
            }
        }

        let h = self.header();
        h.write_idx.store(write_idx + count as u64, Ordering::Release);
        h.sample_count.fetch_add(count as u64, Ordering::Relaxed);
        h.timestamp_ns.store(monotonic_ns(), Ordering::Relaxed);
        count
    }

    /// CS16 交错样本写入：按 4096 样本分块转换成 CF32 再入环
    pub fn write_cs16(&mut self, interleaved: &[i16]) -> usize {
        const CHUNK: usize = 4096;
        const SCALE: f32 = 1.0 / 32768.0;

        let mut buffer = [Complex::new(0.0f32, 0.0f32); CHUNK];
        let mut remaining = interleaved.len() / 2;
        let mut offset = 0usize;
        let mut total = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(CHUNK);
            for (i, slot) in buffer[..chunk].iter_mut().enumerate() {
                let re = interleaved[(offset + i) * 2] as f32 * SCALE;
                let im = interleaved[(offset + i) * 2 + 1] as f32 * SCALE;
                *slot = Complex::new(re, im);
            }
            let written = self.write(&buffer[..chunk]);
            total += written;
            if written < chunk {
                break; // 环已满
            }
            offset += chunk;
            remaining -= chunk;
        }
        total
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.header().sample_rate.store(rate, Ordering::Release);
    }

    pub fn set_flag(&self, flag: u32) {
        self.header().flags.fetch_or(flag, Ordering::Release);
    }

    pub fn clear_flag(&self, flag: u32) {
        self.header().flags.fetch_and(!flag, Ordering::Release);
    }

    pub fn record_overflow(&self) {
        self.header().overflow_count.fetch_add(1, Ordering::Relaxed);
        self.set_flag(RingFlags::OVERFLOW);
    }

    // ==================== 消费者 API ====================

    /// 读取样本，最多等待 `timeout`（0 表示非阻塞）。返回实际读取数。
    pub fn read(&mut self, out: &mut [Complex<f32>], timeout: Duration) -> usize {
        let start = Instant::now();
        loop {
            let write_idx = self.header().write_idx.load(Ordering::Acquire);
            let avail = (write_idx - self.last_read_idx) as usize;

            if avail > 0 {
                let count = avail.min(out.len());
                let mask = self.num_samples - 1;
                let read_pos = (self.last_read_idx as usize) & mask;
                let first = count.min(self.num_samples - read_pos);

                // SAFETY: acquire 读取 write_idx 后，[read_idx, write_idx) 的样本已完整发布
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.data_ptr().add(read_pos),
                        out.as_mut_ptr(),
                        first,
                    );
                    if count > first {
                        std::ptr::copy_nonoverlapping(
                            self.data_ptr(),
                            out.as_mut_ptr().add(first),
                            count - first,
                        );
                    }
                }

                self.last_read_idx += count as u64;
                self.header()
                    .read_idx
                    .store(self.last_read_idx, Ordering::Release);
                return count;
            }

            if timeout.is_zero() || start.elapsed() >= timeout {
                return 0;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    /// 可读样本数
    pub fn available(&self) -> usize {
        let write_idx = self.header().write_idx.load(Ordering::Acquire);
        (write_idx - self.last_read_idx) as usize
    }

    /// 零拷贝读取：返回下一段连续区域（最多到环尾）
    pub fn read_slice(&self) -> &[Complex<f32>] {
        let write_idx = self.header().write_idx.load(Ordering::Acquire);
        let avail = (write_idx - self.last_read_idx) as usize;
        if avail == 0 {
            return &[];
        }
        let mask = self.num_samples - 1;
        let read_pos = (self.last_read_idx as usize) & mask;
        let contiguous = avail.min(self.num_samples - read_pos);
        // SAFETY: 区间已发布且生产者不会在消费者推进 read_idx 前复用它
        unsafe { std::slice::from_raw_parts(self.data_ptr().add(read_pos), contiguous) }
    }

    /// 零拷贝消费后推进读索引
    pub fn advance_read(&mut self, count: usize) {
        self.last_read_idx += count as u64;
        self.header()
            .read_idx
            .store(self.last_read_idx, Ordering::Release);
    }

    /// 自上次调用以来是否出现过溢出（消费者侧一次性事件）
    pub fn take_overflow_event(&mut self) -> bool {
        let current = self.header().overflow_count.load(Ordering::Relaxed);
        if current > self.last_overflow_count {
            self.last_overflow_count = current;
            true
        } else {
            false
        }
    }

    // ==================== 公共状态 ====================

    pub fn flags(&self) -> RingFlags {
        RingFlags(self.header().flags.load(Ordering::Acquire))
    }

    pub fn overflow_count(&self) -> u64 {
        self.header().overflow_count.load(Ordering::Acquire)
    }

    pub fn sample_count(&self) -> u64 {
        self.header().sample_count.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.header().sample_rate.load(Ordering::Acquire)
    }

    /// 当前写索引（代理端的停滞检测用）
    pub fn write_index(&self) -> u64 {
        self.header().write_idx.load(Ordering::Acquire)
    }

    /// 最近写入时间（单调纳秒）
    pub fn last_write_timestamp_ns(&self) -> i64 {
        self.header().timestamp_ns.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.num_samples
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedRing {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                error!("shm_unlink {} failed: {e}", self.name);
            } else {
                debug!("shared ring unlinked: {}", self.name);
            }
        }
    }
}

fn monotonic_ns() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * 1_000_000_000 + ts.tv_nsec(),
        Err(_) => 0,
    }
}

/// 设备对应的共享段名：`/sdrplay_<serial>_<pid>`
pub fn shm_name_for(serial: &str) -> String {
    format!("/sdrplay_{}_{}", serial, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/rsp_ring_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_header_is_64_bytes() {
        assert_eq!(HEADER_SIZE, 64);
    }

    #[test]
    fn test_create_rejects_non_power_of_two() {
        assert!(SharedRing::create("/rsp_bad", 1000).is_err());
        assert!(SharedRing::create("/rsp_bad", 0).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let name = unique_name("rw");
        let mut consumer = SharedRing::create(&name, 1024).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        let samples: Vec<Complex<f32>> =
            (0..100).map(|i| Complex::new(i as f32, -(i as f32))).collect();
        assert_eq!(producer.write(&samples), 100);
        assert_eq!(consumer.available(), 100);

        let mut out = vec![Complex::new(0.0, 0.0); 100];
        assert_eq!(consumer.read(&mut out, Duration::ZERO), 100);
        assert_eq!(out, samples);
        assert_eq!(consumer.sample_count(), 100);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let name = unique_name("wrap");
        let mut consumer = SharedRing::create(&name, 64).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        let mut next = 0f32;
        let mut expected = 0f32;
        for _ in 0..10 {
            let burst: Vec<Complex<f32>> = (0..48)
                .map(|_| {
                    let s = Complex::new(next, 0.0);
                    next += 1.0;
                    s
                })
                .collect();
            assert_eq!(producer.write(&burst), 48);

            let mut out = vec![Complex::new(0.0, 0.0); 48];
            assert_eq!(consumer.read(&mut out, Duration::ZERO), 48);
            for s in out {
                assert_eq!(s.re, expected);
                expected += 1.0;
            }
        }
    }

    #[test]
    fn test_overflow_truncates_and_counts() {
        let name = unique_name("ovf");
        let mut consumer = SharedRing::create(&name, 64).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        let burst = vec![Complex::new(1.0f32, 0.0); 100];
        // 只有 64 个槽位：写入被截断
        assert_eq!(producer.write(&burst), 64);
        assert_eq!(producer.overflow_count(), 1);
        assert!(producer.flags().contains(RingFlags::OVERFLOW));

        // 不变量：write_idx - read_idx <= M
        assert!(consumer.available() <= 64);

        // 消费者一次性感知溢出
        assert!(consumer.take_overflow_event());
        assert!(!consumer.take_overflow_event());

        let mut out = vec![Complex::new(0.0, 0.0); 64];
        assert_eq!(consumer.read(&mut out, Duration::ZERO), 64);
        // 腾出空间后写入恢复
        assert_eq!(producer.write(&burst[..10]), 10);
    }

    #[test]
    fn test_monotone_counters() {
        let name = unique_name("mono");
        let mut consumer = SharedRing::create(&name, 128).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        let mut last_count = 0;
        let mut last_overflow = 0;
        for _ in 0..20 {
            producer.write(&vec![Complex::new(0.0f32, 0.0); 100]);
            let mut out = vec![Complex::new(0.0, 0.0); 50];
            consumer.read(&mut out, Duration::ZERO);

            let c = producer.sample_count();
            let o = producer.overflow_count();
            assert!(c >= last_count);
            assert!(o >= last_overflow);
            last_count = c;
            last_overflow = o;
        }
    }

    #[test]
    fn test_write_cs16_scales() {
        let name = unique_name("cs16");
        let mut consumer = SharedRing::create(&name, 1024).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        let interleaved: [i16; 4] = [16384, 8192, -16384, -8192];
        assert_eq!(producer.write_cs16(&interleaved), 2);

        let mut out = vec![Complex::new(0.0f32, 0.0); 2];
        consumer.read(&mut out, Duration::ZERO);
        assert!((out[0].re - 0.5).abs() < 1e-6);
        assert!((out[0].im - 0.25).abs() < 1e-6);
        assert!((out[1].re + 0.5).abs() < 1e-6);
        assert!((out[1].im + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_zero_copy_read() {
        let name = unique_name("zc");
        let mut consumer = SharedRing::create(&name, 64).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        producer.write(&[Complex::new(7.0f32, 8.0), Complex::new(9.0, 10.0)]);
        {
            let slice = consumer.read_slice();
            assert_eq!(slice.len(), 2);
            assert_eq!(slice[0], Complex::new(7.0, 8.0));
        }
        consumer.advance_read(2);
        assert_eq!(consumer.available(), 0);
        assert!(consumer.read_slice().is_empty());
    }

    #[test]
    fn test_read_timeout_zero_never_blocks() {
        let name = unique_name("nb");
        let mut consumer = SharedRing::create(&name, 64).unwrap();
        let mut out = vec![Complex::new(0.0f32, 0.0); 16];
        let start = Instant::now();
        assert_eq!(consumer.read(&mut out, Duration::ZERO), 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_reattach_preserves_data() {
        let name = unique_name("reat");
        let mut consumer = SharedRing::create(&name, 64).unwrap();
        let mut producer = SharedRing::open(&name).unwrap();

        producer.write(&[Complex::new(5.0f32, 6.0)]);
        consumer.reattach().unwrap();

        let mut out = vec![Complex::new(0.0f32, 0.0); 1];
        assert_eq!(consumer.read(&mut out, Duration::ZERO), 1);
        assert_eq!(out[0], Complex::new(5.0, 6.0));
    }

    #[test]
    fn test_shm_name_format() {
        let name = shm_name_for("1000ABCD");
        assert!(name.starts_with("/sdrplay_1000ABCD_"));
        assert!(name[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
