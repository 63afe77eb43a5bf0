//! 流引擎
//!
//! 厂商回调（生产者）与宿主读取（消费者）之间的 SPSC 缓冲环。每通道
//! N=8 个预留缓冲；回调绝不重新分配——当前缓冲吃不下突发就记溢出并丢弃，
//! 这是保住回调实时性的不变量。结构性变更（建立/拆除）由每流互斥量
//! 串行化；回调经由 ArcSwap 槽位取流指针，拆除不会与在途回调竞争。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use num_complex::Complex;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use rsp_vendor::StreamCbParams;
use rsp_vendor::params::DcOffsetTunerParams;
use rsp_vendor::{RspDuoMode, StreamCallbacks};

use crate::device::{DeviceShared, RspDevice};
use crate::device_api::{DirectBuf, ReadOutcome, StreamBuf, StreamFormat, StreamId};
use crate::error::{DriverError, StreamError};

/// 每通道缓冲数（必须是 2 的幂，游标用按位与回绕）
pub(crate) const NUM_BUFFERS: usize = 8;
const _: () = assert!(NUM_BUFFERS & (NUM_BUFFERS - 1) == 0);

/// 单个缓冲的容量（样本）；也是流 MTU
pub const BUFFER_SAMPLES: usize = 65536;

const SCALE: f32 = 1.0 / 32768.0;

/// 样本缓冲组（格式在 setup 时固定）
enum SampleBank {
    /// 交错 i16，容量 2*BUFFER_SAMPLES 元素
    Short(Vec<Vec<i16>>),
    /// 复数浮点，容量 BUFFER_SAMPLES 样本
    Float(Vec<Vec<Complex<f32>>>),
}

impl SampleBank {
    fn new(use_short: bool) -> Self {
        if use_short {
            SampleBank::Short(
                (0..NUM_BUFFERS)
                    .map(|_| Vec::with_capacity(BUFFER_SAMPLES * 2))
                    .collect(),
            )
        } else {
            SampleBank::Float(
                (0..NUM_BUFFERS)
                    .map(|_| Vec::with_capacity(BUFFER_SAMPLES))
                    .collect(),
            )
        }
    }

    /// 缓冲当前长度（样本）
    fn len_at(&self, idx: usize) -> usize {
        match self {
            SampleBank::Short(b) => b[idx].len() / 2,
            SampleBank::Float(b) => b[idx].len(),
        }
    }

    /// 在预留容量内追加一个突发；容量不够返回 false（调用方记溢出）
    fn append(&mut self, idx: usize, xi: &[i16], xq: &[i16]) -> bool {
        let n = xi.len().min(xq.len());
        match self {
            SampleBank::Short(b) => {
                let buf = &mut b[idx];
                if buf.len() + n * 2 > buf.capacity() {
                    return false;
                }
                for i in 0..n {
                    buf.push(xi[i]);
                    buf.push(xq[i]);
                }
                true
            }
            SampleBank::Float(b) => {
                let buf = &mut b[idx];
                if buf.len() + n > buf.capacity() {
                    return false;
                }
                // 热路径用乘法而不是除法
                for i in 0..n {
                    buf.push(Complex::new(xi[i] as f32 * SCALE, xq[i] as f32 * SCALE));
                }
                true
            }
        }
    }

    fn clear_at(&mut self, idx: usize) {
        match self {
            SampleBank::Short(b) => b[idx].clear(),
            SampleBank::Float(b) => b[idx].clear(),
        }
    }

    fn clear_all(&mut self) {
        match self {
            SampleBank::Short(b) => b.iter_mut().for_each(|v| v.clear()),
            SampleBank::Float(b) => b.iter_mut().for_each(|v| v.clear()),
        }
    }

    fn is_short(&self) -> bool {
        matches!(self, SampleBank::Short(_))
    }
}

struct RingState {
    bank: SampleBank,
    head: usize,
    tail: usize,
    /// 在途（已关闭未消费）缓冲数，0 ≤ count ≤ N
    count: usize,
    overflow_event: bool,
    /// 丢样检测：下一个期望的样本序号
    next_sample_num: u32,
    have_sample_num: bool,
    // 看门狗跟踪
    last_watchdog_ticks: u64,
    last_callback_time: Instant,
}

/// 宿主读游标（跨 read_stream 调用的分片状态）
#[derive(Default)]
struct ReadCursor {
    handle: usize,
    offset: usize,
    remaining: usize,
}

/// 每通道的流记录
pub(crate) struct StreamRing {
    pub channel: usize,
    use_short: bool,
    state: Mutex<RingState>,
    cond: Condvar,
    /// 串行化多个消费者的 read_stream（与缓冲锁分离避免死锁）
    read_cursor: Mutex<ReadCursor>,
    /// 回调活性计数（看门狗的 stale 检测）
    pub last_callback_ticks: AtomicU64,
    pub sample_gap_count: AtomicU64,
    /// 速率/格式变更或恢复时置位：下一次读取先排空重启序列
    pub reset: AtomicBool,
}

/// 通道槽位：ring + 引用计数（多次 setup 共享同一缓冲区）
#[derive(Default)]
pub(crate) struct StreamSlot {
    pub ring: Option<Arc<StreamRing>>,
    pub refcount: u32,
}

impl StreamRing {
    pub fn new(channel: usize, use_short: bool) -> Self {
        Self {
            channel,
            use_short,
            state: Mutex::new(RingState {
                bank: SampleBank::new(use_short),
                head: 0,
                tail: 0,
                count: 0,
                overflow_event: false,
                next_sample_num: 0,
                have_sample_num: false,
                last_watchdog_ticks: 0,
                last_callback_time: Instant::now(),
            }),
            cond: Condvar::new(),
            read_cursor: Mutex::new(ReadCursor::default()),
            last_callback_ticks: AtomicU64::new(0),
            sample_gap_count: AtomicU64::new(0),
            reset: AtomicBool::new(false),
        }
    }

    pub fn is_short(&self) -> bool {
        self.use_short
    }

    /// 生产者路径（厂商回调线程）
    fn produce(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams, threshold: usize) {
        let n = xi.len().min(xq.len());
        let mut st = self.state.lock();

        // 丢样检测
        if st.have_sample_num && params.first_sample_num != st.next_sample_num {
            self.sample_gap_count.fetch_add(1, Ordering::Relaxed);
        }
        st.have_sample_num = true;
        st.next_sample_num = params.first_sample_num.wrapping_add(n as u32);

        if st.count == NUM_BUFFERS {
            st.overflow_event = true;
            return;
        }

        // 当前填充缓冲越过阈值就关闭它，突发进入下一个缓冲
        if st.bank.len_at(st.tail) + n >= threshold {
            st.tail = (st.tail + 1) & (NUM_BUFFERS - 1);
            st.count += 1;

            let next_len = st.bank.len_at(st.tail);
            if st.count == NUM_BUFFERS && n > BUFFER_SAMPLES - next_len {
                st.overflow_event = true;
                return;
            }
            self.cond.notify_one();
        }

        let tail = st.tail;
        if !st.bank.append(tail, xi, xq) {
            st.overflow_event = true;
        }
    }

    /// 消费者：等待一个就绪缓冲
    ///
    /// 返回 (handle, 样本数)。`overflow`/`reset` 先排空并按约定发信号。
    fn acquire(
        &self,
        timeout: Duration,
        device_unavailable: &AtomicBool,
        stream_active: bool,
    ) -> Result<(usize, usize), StreamError> {
        let mut st = self.state.lock();

        if self.reset.load(Ordering::Acquire) || st.overflow_event {
            st.head = 0;
            st.tail = 0;
            st.count = 0;
            st.bank.clear_all();
            st.overflow_event = false;
            if !self.reset.swap(false, Ordering::AcqRel) {
                debug!("O");
                return Err(StreamError::Overflow);
            }
        }

        if st.count == 0 {
            let ticks_before = self.last_callback_ticks.load(Ordering::Relaxed);
            let deadline = Instant::now() + timeout;
            loop {
                if st.count > 0 || device_unavailable.load(Ordering::Acquire) {
                    break;
                }
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    if self.last_callback_ticks.load(Ordering::Relaxed) == ticks_before
                        && stream_active
                    {
                        warn!("no callbacks received during timeout period - stream may be stale");
                    }
                    return Err(StreamError::Timeout);
                };
                let _ = self.cond.wait_for(&mut st, remaining);
            }
        }

        if device_unavailable.load(Ordering::Acquire) {
            error!("device is unavailable");
            return Err(StreamError::NotSupported);
        }

        let handle = st.head;
        st.head = (st.head + 1) & (NUM_BUFFERS - 1);
        let samples = st.bank.len_at(handle);
        Ok((handle, samples))
    }

    /// 归还缓冲：清空并递减在途计数
    fn release(&self, handle: usize) {
        if handle >= NUM_BUFFERS {
            return;
        }
        let mut st = self.state.lock();
        if st.count == 0 {
            return;
        }
        st.bank.clear_at(handle);
        st.count -= 1;
    }

    /// 在途缓冲的稳定指针（容量预留，永不再分配）
    ///
    /// 调用方负责在 release 之前使用完切片。
    fn raw_parts(&self, handle: usize) -> (*const u8, usize) {
        let st = self.state.lock();
        match &st.bank {
            SampleBank::Short(b) => (b[handle].as_ptr() as *const u8, b[handle].len()),
            SampleBank::Float(b) => (b[handle].as_ptr() as *const u8, b[handle].len()),
        }
    }

    /// 把在途缓冲的一段拷贝进宿主缓冲（每次调用一个 memcpy）
    fn copy_out(
        &self,
        handle: usize,
        offset: usize,
        n: usize,
        out: &mut StreamBuf<'_>,
    ) -> Result<(), StreamError> {
        let st = self.state.lock();
        match (&st.bank, out) {
            (SampleBank::Short(b), StreamBuf::Cs16(dst)) => {
                dst[..n * 2].copy_from_slice(&b[handle][offset * 2..(offset + n) * 2]);
                Ok(())
            }
            (SampleBank::Float(b), StreamBuf::Cf32(dst)) => {
                dst[..n].copy_from_slice(&b[handle][offset..offset + n]);
                Ok(())
            }
            _ => Err(StreamError::NotSupported),
        }
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    fn clear_cursor(&self) {
        *self.read_cursor.lock() = ReadCursor::default();
    }

    /// 等待在途的回调与读取方退出（拆除前）
    fn quiesce(&self) {
        drop(self.state.lock());
        drop(self.read_cursor.lock());
    }

    fn init_watchdog_tracking(&self) {
        let mut st = self.state.lock();
        st.last_watchdog_ticks = 0;
        st.last_callback_time = Instant::now();
    }

    /// 看门狗 tick：回调有推进返回 false，停滞超过 `timeout` 返回 true
    pub(crate) fn watchdog_stale(&self, timeout: Duration) -> bool {
        let current = self.last_callback_ticks.load(Ordering::Relaxed);
        let mut st = self.state.lock();
        if current == st.last_watchdog_ticks {
            st.last_callback_time.elapsed() > timeout
        } else {
            st.last_watchdog_ticks = current;
            st.last_callback_time = Instant::now();
            false
        }
    }
}

impl DeviceShared {
    /// 厂商回调入口
    pub(crate) fn rx_callback(&self, channel: usize, xi: &[i16], xq: &[i16], params: &StreamCbParams) {
        if self.device_unavailable.load(Ordering::Acquire) {
            return;
        }
        let Some(stream) = self.streams.get(channel).and_then(|s| s.load_full()) else {
            return;
        };

        stream.last_callback_ticks.fetch_add(1, Ordering::Relaxed);

        // 参数更新确认：把回调里的 changed 标志搬到会话侧并唤醒等待者
        let mut notify = false;
        if params.gr_changed != 0 && self.gr_changed.load(Ordering::Relaxed) == 0 {
            self.gr_changed.store(params.gr_changed, Ordering::Relaxed);
            notify = true;
        }
        if params.rf_changed != 0 && self.rf_changed.load(Ordering::Relaxed) == 0 {
            self.rf_changed.store(params.rf_changed, Ordering::Relaxed);
            notify = true;
        }
        if params.fs_changed != 0 && self.fs_changed.load(Ordering::Relaxed) == 0 {
            self.fs_changed.store(params.fs_changed, Ordering::Relaxed);
            notify = true;
        }
        if notify {
            self.update_cv.notify_all();
        }

        if xi.is_empty() || xq.is_empty() {
            return; // 纯确认回调
        }

        let mut threshold = self.cached_buffer_threshold.load(Ordering::Relaxed);
        if threshold == 0 {
            threshold = BUFFER_SAMPLES;
        }
        stream.produce(xi, xq, params, threshold);
    }
}

impl RspDevice {
    fn ring_at(&self, stream: StreamId) -> Result<Arc<StreamRing>, StreamError> {
        self.shared
            .streams
            .get(stream.0)
            .and_then(|s| s.load_full())
            .ok_or(StreamError::NotSupported)
    }

    pub(crate) fn setup_stream_impl(
        &self,
        format: StreamFormat,
        channels: &[usize],
    ) -> Result<StreamId, DriverError> {
        let sh = &self.shared;

        // 流运行中禁止变更格式
        if sh.stream_active.load(Ordering::Acquire) {
            return Err(DriverError::StreamActive);
        }

        let nchannels = {
            let st = sh.general.lock();
            if st.info.duo_mode == RspDuoMode::DualTuner { 2 } else { 1 }
        };
        if channels.len() > 1 || channels.first().is_some_and(|&c| c >= nchannels) {
            return Err(DriverError::InvalidChannels);
        }

        let use_short = format == StreamFormat::Cs16;
        info!("using format {}.", format.as_str());

        // 按当前抽取因子缓存切换阈值（热路径免除法）
        let dec = {
            let st = sh.general.lock();
            st.ch().ctrl.decimation.factor.max(1) as usize
        };
        sh.cached_buffer_threshold
            .store(BUFFER_SAMPLES / dec, Ordering::Relaxed);

        let channel = channels.first().copied().unwrap_or(0);
        let mut store = sh.streams_store.lock();
        let slot = &mut store[channel];
        let needs_new = match &slot.ring {
            Some(ring) if ring.is_short() == use_short => false,
            // 挂起的 ring 格式不符：无人引用时重建
            Some(_) if slot.refcount == 0 => true,
            Some(_) => return Err(DriverError::StreamActive),
            None => true,
        };
        if needs_new {
            slot.ring = Some(Arc::new(StreamRing::new(channel, use_short)));
        }
        Ok(StreamId(channel))
    }

    pub(crate) fn activate_stream_impl(&self, stream: StreamId) -> Result<(), StreamError> {
        let sh = &self.shared;
        let channel = stream.0;
        if channel > 1 {
            return Err(StreamError::NotSupported);
        }

        let mut general = sh.general.lock();

        let ring = {
            let mut store = sh.streams_store.lock();
            let slot = &mut store[channel];
            let Some(ring) = slot.ring.clone() else {
                return Err(StreamError::Fault);
            };
            ring.reset.store(true, Ordering::Release);
            ring.clear_cursor();
            slot.refcount += 1;
            sh.streams[channel].store(Some(Arc::clone(&ring)));
            ring
        };

        if sh.stream_active.load(Ordering::Acquire) {
            return Ok(());
        }

        // 激活前固定 DC 校正跟踪参数
        general.ch_mut().tuner.dc_offset_tuner = DcOffsetTunerParams {
            dc_cal: 4,
            speed_up: 0,
            track_time: 63,
        };

        let handle = general.info.handle;
        let params = general.params.clone();
        let callbacks: Arc<dyn StreamCallbacks> = self.shared.clone();
        let result = sh
            .gate
            .call("sdrplay_api_Init", move |api| api.init(handle, &params, callbacks));

        let init_err = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(msg) = init_err {
            error!("error in activate_stream() - Init() failed: {msg}");
            // 回滚激活前设置的流状态，让重试从干净状态开始
            let mut store = sh.streams_store.lock();
            let slot = &mut store[channel];
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount == 0 {
                sh.streams[channel].store(None);
            }
            ring.reset.store(false, Ordering::Release);
            ring.clear_cursor();
            return Err(StreamError::NotSupported);
        }

        sh.stream_active.store(true, Ordering::Release);
        ring.init_watchdog_tracking();

        // 唤醒先于激活调用 read_stream 的线程
        sh.update_cv.notify_all();
        drop(general);

        // 持久化的天线设置在 Init 后重放（部分硬件会在 Init 时复位天线）
        let reapply: Vec<(usize, String)> = {
            let persist = sh.persistent_antenna.lock();
            persist
                .iter()
                .enumerate()
                .filter_map(|(ch, p)| {
                    (p.enabled && p.name.is_some()).then(|| (ch, p.name.clone().unwrap()))
                })
                .collect()
        };

        for (ch, name) in reapply {
            self.set_antenna_impl(ch, &name);
        }

        let watchdog_enabled = sh.watchdog_config.lock().enabled;
        if watchdog_enabled {
            DeviceShared::start_watchdog(&self.shared);
        }

        Ok(())
    }

    pub(crate) fn close_stream_impl(&self, stream: StreamId) {
        let sh = &self.shared;
        let channel = stream.0;
        if channel > 1 {
            return;
        }

        let (closing_ring, active_streams) = {
            let mut store = sh.streams_store.lock();
            let slot = &mut store[channel];
            let mut closing = None;
            if slot.refcount > 0 {
                slot.refcount -= 1;
                if slot.refcount == 0 {
                    closing = slot.ring.take();
                    sh.streams[channel].store(None);
                }
            } else {
                // setup 后未 activate 的挂起 ring
                slot.ring = None;
            }
            let active: u32 = store.iter().map(|s| s.refcount).sum();
            (closing, active)
        };

        if let Some(ring) = &closing_ring {
            // 槽位已清空：唤醒所有等待者并等在途回调/读取退出
            ring.notify_all();
            ring.quiesce();
        }

        if active_streams == 0 && sh.stream_active.load(Ordering::Acquire) {
            sh.stop_watchdog();

            let (handle, retry_delay) = {
                let st = sh.general.lock();
                (st.info.handle, *sh.uninit_retry_delay.lock())
            };

            // 回调必须在释放流内存前停止；StopPending（RSPduo 从机未关）时重试
            loop {
                let result = sh
                    .gate
                    .call("sdrplay_api_Uninit", move |api| api.uninit(handle));
                match result {
                    Ok(Err(rsp_vendor::VendorError::StopPending)) => {
                        warn!(
                            "please close RSPduo slave device first. Trying again in {} seconds",
                            retry_delay.as_secs()
                        );
                        std::thread::sleep(retry_delay);
                    }
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => {
                        warn!("sdrplay_api_Uninit failed: {e}");
                        break;
                    }
                    Err(e) => {
                        warn!("sdrplay_api_Uninit failed: {e}");
                        break;
                    }
                }
            }
            sh.stream_active.store(false, Ordering::Release);
        }
    }

    pub(crate) fn read_stream_impl(
        &self,
        stream: StreamId,
        mut buf: StreamBuf<'_>,
        timeout: Duration,
    ) -> Result<ReadOutcome, StreamError> {
        let sh = &self.shared;

        // 流未激活：在限期内等待激活（条件变量，激活即醒）
        if !sh.stream_active.load(Ordering::Acquire) {
            let deadline = Instant::now() + timeout;
            let mut guard = sh.update_lock.lock();
            while !sh.stream_active.load(Ordering::Acquire)
                && !sh.device_unavailable.load(Ordering::Acquire)
            {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(StreamError::Timeout);
                };
                let _ = sh.update_cv.wait_for(&mut guard, remaining);
            }
            drop(guard);
            if !sh.stream_active.load(Ordering::Acquire) {
                return Err(StreamError::Timeout);
            }
        }

        let ring = self.ring_at(stream)?;

        // 串行化同一流上的多个消费者
        let mut cursor = ring.read_cursor.lock();

        if cursor.remaining == 0 {
            let (handle, samples) = ring.acquire(
                timeout,
                &sh.device_unavailable,
                sh.stream_active.load(Ordering::Acquire),
            )?;
            if samples == 0 {
                ring.release(handle);
                return Ok(ReadOutcome::default());
            }
            cursor.handle = handle;
            cursor.offset = 0;
            cursor.remaining = samples;
        }

        let n = buf.capacity().min(cursor.remaining);
        ring.copy_out(cursor.handle, cursor.offset, n, &mut buf)?;
        cursor.offset += n;
        cursor.remaining -= n;

        let more_fragments = cursor.remaining > 0;
        if !more_fragments {
            ring.release(cursor.handle);
        }
        Ok(ReadOutcome {
            samples: n,
            more_fragments,
        })
    }

    pub(crate) fn acquire_read_buffer_impl(
        &self,
        stream: StreamId,
        timeout: Duration,
    ) -> Result<(usize, DirectBuf<'_>), StreamError> {
        let sh = &self.shared;
        let ring = self.ring_at(stream)?;
        let (handle, _samples) = ring.acquire(
            timeout,
            &sh.device_unavailable,
            sh.stream_active.load(Ordering::Acquire),
        )?;

        let (ptr, len) = ring.raw_parts(handle);
        // SAFETY: 在途缓冲在 release 前不会被生产者触碰，容量预留保证
        // 指针稳定；ring 由槽位的 Arc 持有，存活期覆盖借用
        let buf = if ring.is_short() {
            DirectBuf::Cs16(unsafe { std::slice::from_raw_parts(ptr as *const i16, len) })
        } else {
            DirectBuf::Cf32(unsafe {
                std::slice::from_raw_parts(ptr as *const Complex<f32>, len)
            })
        };
        Ok((handle, buf))
    }

    pub(crate) fn release_read_buffer_impl(&self, stream: StreamId, handle: usize) {
        if let Ok(ring) = self.ring_at(stream) {
            ring.release(handle);
        }
    }

    /// 速率/格式变更后请求流重置（排空 + 序列重启）
    pub(crate) fn request_stream_reset(&self) {
        for slot in &self.shared.streams {
            if let Some(ring) = slot.load_full() {
                ring.reset.store(true, Ordering::Release);
            }
        }
    }
}
