//! 测试用厂商服务
//!
//! 在内存中模拟 sdrplay 服务：设备枚举、选定/释放、参数下发与回调确认。
//! 驱动层与 worker 的测试都建立在它之上，必要时可注入故障。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use parking_lot::lock_api::RawMutex as _;

use crate::api::{DeviceHandle, StreamCallbacks, StreamCbParams, VendorApi};
use crate::error::VendorError;
use crate::params::DeviceParams;
use crate::types::{
    AmPort, DeviceInfo, Event, HwVariant, RspDuoMode, TunerSelect, UpdateExt1, UpdateReason,
};

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceInfo>,
    /// serial -> handle（选定中的设备）
    selected: HashMap<String, DeviceHandle>,
    params: HashMap<DeviceHandle, DeviceParams>,
    callbacks: HashMap<DeviceHandle, Arc<dyn StreamCallbacks>>,
    inited: HashSet<DeviceHandle>,
    /// 接下来 N 次 uninit 返回 StopPending（模拟 RSPduo 从机未关闭）
    uninit_stop_pending: u32,
    fail_select: bool,
    opened: bool,
}

/// 内存厂商服务
pub struct MockVendorApi {
    state: Mutex<MockState>,
    raw_lock: parking_lot::RawMutex,
    next_handle: AtomicU32,
    /// update() 是否以回调方式回报 changed 标志（默认开）
    confirm_updates: AtomicBool,
}

impl Default for MockVendorApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVendorApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            raw_lock: parking_lot::RawMutex::INIT,
            next_handle: AtomicU32::new(1),
            confirm_updates: AtomicBool::new(true),
        }
    }

    /// 注册一台设备
    pub fn push_device(&self, serial: &str, hw_ver: HwVariant) {
        let available_duo_modes = if hw_ver == HwVariant::RspDuo {
            vec![
                RspDuoMode::SingleTuner,
                RspDuoMode::DualTuner,
                RspDuoMode::Master,
            ]
        } else {
            Vec::new()
        };
        self.state.lock().devices.push(DeviceInfo {
            serial: serial.to_string(),
            hw_ver,
            valid: true,
            available_duo_modes,
            duo_mode: RspDuoMode::Unknown,
            tuner: TunerSelect::Neither,
            duo_sample_freq: 0.0,
            handle: DeviceHandle(0),
        });
    }

    /// 设定接下来 N 次 uninit 返回 StopPending
    pub fn set_uninit_stop_pending(&self, count: u32) {
        self.state.lock().uninit_stop_pending = count;
    }

    pub fn set_fail_select(&self, fail: bool) {
        self.state.lock().fail_select = fail;
    }

    pub fn set_confirm_updates(&self, on: bool) {
        self.confirm_updates.store(on, Ordering::Relaxed);
    }

    /// 当前下发到"硬件"的参数快照
    pub fn device_params(&self, dev: DeviceHandle) -> Option<DeviceParams> {
        self.state.lock().params.get(&dev).cloned()
    }

    pub fn is_inited(&self, dev: DeviceHandle) -> bool {
        self.state.lock().inited.contains(&dev)
    }

    fn callbacks_for(&self, dev: DeviceHandle) -> Option<Arc<dyn StreamCallbacks>> {
        self.state.lock().callbacks.get(&dev).cloned()
    }

    /// 模拟厂商线程投递一个调谐器 A 的 I/Q 突发
    pub fn feed_samples_a(&self, dev: DeviceHandle, xi: &[i16], xq: &[i16], first_sample_num: u32) {
        if let Some(cb) = self.callbacks_for(dev) {
            let params = StreamCbParams {
                first_sample_num,
                ..StreamCbParams::default()
            };
            cb.stream_a(xi, xq, &params);
        }
    }

    /// 模拟厂商线程投递一个调谐器 B 的 I/Q 突发
    pub fn feed_samples_b(&self, dev: DeviceHandle, xi: &[i16], xq: &[i16], first_sample_num: u32) {
        if let Some(cb) = self.callbacks_for(dev) {
            let params = StreamCbParams {
                first_sample_num,
                ..StreamCbParams::default()
            };
            cb.stream_b(xi, xq, &params);
        }
    }

    /// 模拟设备事件
    pub fn emit_event(&self, dev: DeviceHandle, event: Event, tuner: TunerSelect) {
        if let Some(cb) = self.callbacks_for(dev) {
            cb.event(event, tuner);
        }
    }
}

impl VendorApi for MockVendorApi {
    fn open(&self) -> Result<(), VendorError> {
        self.state.lock().opened = true;
        Ok(())
    }

    fn close(&self) -> Result<(), VendorError> {
        self.state.lock().opened = false;
        Ok(())
    }

    fn api_version(&self) -> Result<f32, VendorError> {
        Ok(3.15)
    }

    fn lock_device_api(&self) {
        self.raw_lock.lock();
    }

    fn unlock_device_api(&self) {
        unsafe { self.raw_lock.unlock() };
    }

    fn get_devices(&self) -> Result<Vec<DeviceInfo>, VendorError> {
        Ok(self.state.lock().devices.clone())
    }

    fn select_device(&self, info: &mut DeviceInfo) -> Result<(), VendorError> {
        let mut st = self.state.lock();
        if st.fail_select {
            return Err(VendorError::Call {
                call: "select_device",
                message: "injected failure".into(),
            });
        }
        let exists = st
            .devices
            .iter()
            .any(|d| d.valid && d.serial == info.serial);
        if !exists {
            return Err(VendorError::NoMatchingDevice(info.serial.clone()));
        }
        if st.selected.contains_key(&info.serial) {
            return Err(VendorError::AlreadySelected(info.serial.clone()));
        }
        let handle = DeviceHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        info.handle = handle;
        st.selected.insert(info.serial.clone(), handle);

        let params = match (info.hw_ver, info.duo_mode) {
            (HwVariant::RspDuo, RspDuoMode::Slave) => DeviceParams::slave_default(),
            (HwVariant::RspDuo, RspDuoMode::DualTuner) => DeviceParams::dual_default(),
            _ => DeviceParams::default(),
        };
        st.params.insert(handle, params);
        Ok(())
    }

    fn release_device(&self, info: &DeviceInfo) -> Result<(), VendorError> {
        let mut st = self.state.lock();
        st.selected.remove(&info.serial);
        st.params.remove(&info.handle);
        st.callbacks.remove(&info.handle);
        st.inited.remove(&info.handle);
        Ok(())
    }

    fn get_device_params(&self, dev: DeviceHandle) -> Result<DeviceParams, VendorError> {
        self.state
            .lock()
            .params
            .get(&dev)
            .cloned()
            .ok_or(VendorError::Call {
                call: "get_device_params",
                message: "unknown handle".into(),
            })
    }

    fn init(
        &self,
        dev: DeviceHandle,
        params: &DeviceParams,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<(), VendorError> {
        let mut st = self.state.lock();
        st.params.insert(dev, params.clone());
        st.callbacks.insert(dev, callbacks);
        st.inited.insert(dev);
        Ok(())
    }

    fn uninit(&self, dev: DeviceHandle) -> Result<(), VendorError> {
        let mut st = self.state.lock();
        if st.uninit_stop_pending > 0 {
            st.uninit_stop_pending -= 1;
            return Err(VendorError::StopPending);
        }
        st.inited.remove(&dev);
        st.callbacks.remove(&dev);
        Ok(())
    }

    fn update(
        &self,
        dev: DeviceHandle,
        _tuner: TunerSelect,
        params: &DeviceParams,
        reason: UpdateReason,
        _ext: UpdateExt1,
    ) -> Result<(), VendorError> {
        let cb = {
            let mut st = self.state.lock();
            st.params.insert(dev, params.clone());
            if st.inited.contains(&dev) {
                st.callbacks.get(&dev).cloned()
            } else {
                None
            }
        };

        // 硬件经回调确认变更：投递一个零样本突发携带 changed 标志
        if self.confirm_updates.load(Ordering::Relaxed)
            && let Some(cb) = cb
        {
            let cb_params = StreamCbParams {
                first_sample_num: 0,
                gr_changed: reason.contains(UpdateReason::TUNER_GR) as u32,
                rf_changed: reason.contains(UpdateReason::TUNER_FRF) as u32,
                fs_changed: reason.contains(UpdateReason::DEV_FS) as u32,
            };
            if cb_params.gr_changed | cb_params.rf_changed | cb_params.fs_changed != 0 {
                cb.stream_a(&[], &[], &cb_params);
            }
        }
        Ok(())
    }

    fn swap_duo_active_tuner(
        &self,
        _dev: DeviceHandle,
        current: TunerSelect,
        _am_port: AmPort,
    ) -> Result<TunerSelect, VendorError> {
        Ok(match current {
            TunerSelect::A => TunerSelect::B,
            _ => TunerSelect::A,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_select_is_transient_error() {
        let mock = MockVendorApi::new();
        mock.push_device("1000A", HwVariant::Rsp1a);

        let mut info = mock.get_devices().unwrap()[0].clone();
        mock.select_device(&mut info).unwrap();
        assert_ne!(info.handle, DeviceHandle(0));

        let mut second = mock.get_devices().unwrap()[0].clone();
        let err = mock.select_device(&mut second).unwrap_err();
        assert!(err.is_transient());

        mock.release_device(&info).unwrap();
        mock.select_device(&mut second).unwrap();
    }

    #[test]
    fn test_update_confirms_via_callback() {
        use std::sync::atomic::AtomicU32;

        struct Recorder {
            gr: AtomicU32,
        }
        impl StreamCallbacks for Recorder {
            fn stream_a(&self, _xi: &[i16], _xq: &[i16], p: &StreamCbParams) {
                self.gr.fetch_add(p.gr_changed, Ordering::Relaxed);
            }
            fn stream_b(&self, _xi: &[i16], _xq: &[i16], _p: &StreamCbParams) {}
            fn event(&self, _event: Event, _tuner: TunerSelect) {}
        }

        let mock = MockVendorApi::new();
        mock.push_device("2000B", HwVariant::Rsp2);
        let mut info = mock.get_devices().unwrap()[0].clone();
        mock.select_device(&mut info).unwrap();

        let rec = Arc::new(Recorder {
            gr: AtomicU32::new(0),
        });
        let params = DeviceParams::default();
        mock.init(info.handle, &params, rec.clone()).unwrap();

        mock.update(
            info.handle,
            TunerSelect::A,
            &params,
            UpdateReason::TUNER_GR,
            UpdateExt1::NONE,
        )
        .unwrap();
        assert_eq!(rec.gr.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_uninit_stop_pending_injection() {
        let mock = MockVendorApi::new();
        mock.push_device("DUO1", HwVariant::RspDuo);
        let mut info = mock.get_devices().unwrap()[0].clone();
        info.duo_mode = RspDuoMode::Master;
        mock.select_device(&mut info).unwrap();
        mock.set_uninit_stop_pending(2);

        assert!(matches!(
            mock.uninit(info.handle),
            Err(VendorError::StopPending)
        ));
        assert!(matches!(
            mock.uninit(info.handle),
            Err(VendorError::StopPending)
        ));
        assert!(mock.uninit(info.handle).is_ok());
    }
}
