//! 频率控制
//!
//! RF 中心频率与晶振漂移校正（CORR，ppm）。范围依型号（RSP1 下限
//! 10kHz，其余 1kHz）；越界请求告警后忽略，宿主状态不变。

use tracing::warn;

use rsp_vendor::{UpdateExt1, UpdateReason};

use crate::device::{ChangeFlag, RspDevice};

impl RspDevice {
    pub(crate) fn set_frequency_element_impl(&self, channel: usize, name: &str, value: f64) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }

        match name {
            "RF" => {
                let min = st.info.hw_ver.min_frequency_hz();
                let max = st.info.hw_ver.max_frequency_hz();
                if !(value >= min && value <= max) {
                    warn!("RF center frequency out of range - frequency={value}");
                    return;
                }
                // 厂商以整数 Hz 工作
                let rf = value as u64 as f64;
                if st.ch().tuner.rf_hz != rf {
                    st.ch_mut().tuner.rf_hz = rf;
                    if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
                        sh.execute_api_update(
                            &st,
                            UpdateReason::TUNER_FRF,
                            UpdateExt1::NONE,
                            Some(ChangeFlag::Rf),
                            "Tuner_Frf",
                        );
                    }
                }
            }
            // RSPduo 从机没有设备级参数：ppm 写入静默拒绝
            "CORR" => {
                if st.params.dev.is_some() && st.params.dev.as_ref().unwrap().ppm != value {
                    st.params.dev.as_mut().unwrap().ppm = value;
                    if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
                        sh.execute_api_update(
                            &st,
                            UpdateReason::DEV_PPM,
                            UpdateExt1::NONE,
                            None,
                            "Dev_Ppm",
                        );
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn frequency_element_impl(&self, channel: usize, name: &str) -> f64 {
        let st = self.shared.general.lock();
        if st.ch_at(channel).is_none() {
            return 0.0;
        }
        match name {
            "RF" => st.ch().tuner.rf_hz,
            "CORR" => st.params.dev.as_ref().map(|d| d.ppm).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub(crate) fn frequency_range_impl(&self) -> (f64, f64) {
        let st = self.shared.general.lock();
        (
            st.info.hw_ver.min_frequency_hz(),
            st.info.hw_ver.max_frequency_hz(),
        )
    }
}
