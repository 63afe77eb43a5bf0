//! 设置键
//!
//! 字符串键值形式的设备设置。键不存在或型号不支持时：写入静默忽略，
//! 读取返回空串；布尔值 "false" 为假，其余为真（与厂商驱动一致）。

use tracing::debug;

use rsp_vendor::{AmPort, HwVariant, TunerSelect, UpdateExt1, UpdateReason};

use crate::device::{ChangeFlag, RspDevice};
use crate::sample_rate;

fn parse_bool(value: &str) -> bool {
    value != "false"
}

impl RspDevice {
    pub(crate) fn write_setting_inner(&self, key: &str, value: &str) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        let active = sh.stream_active.load(std::sync::atomic::Ordering::Acquire);
        let variant = st.info.hw_ver;

        match key {
            "rfgain_sel" => {
                if let Ok(state) = value.parse::<u8>() {
                    st.ch_mut().tuner.gain.lna_state = state;
                    if active {
                        sh.execute_api_update(
                            &st,
                            UpdateReason::TUNER_GR,
                            UpdateExt1::NONE,
                            Some(ChangeFlag::Gr),
                            "Tuner_Gr",
                        );
                    }
                }
            }
            "iqcorr_ctrl" => {
                let enable = parse_bool(value);
                st.ch_mut().ctrl.dc_offset.iq_enable = enable;
                st.ch_mut().ctrl.dc_offset.dc_enable = true;
                if active {
                    sh.execute_api_update(
                        &st,
                        UpdateReason::CTRL_DC_OFFSET_IQ_IMBALANCE,
                        UpdateExt1::NONE,
                        None,
                        "Ctrl_DCoffsetIQimbalance",
                    );
                }
            }
            "agc_setpoint" => {
                if let Ok(set_point) = value.parse::<i32>() {
                    st.ch_mut().ctrl.agc.set_point_dbfs = set_point;
                    if active {
                        sh.execute_api_update(
                            &st,
                            UpdateReason::CTRL_AGC,
                            UpdateExt1::NONE,
                            None,
                            "Ctrl_Agc",
                        );
                    }
                }
            }
            "extref_ctrl" => {
                let enable = parse_bool(value);
                match variant {
                    HwVariant::Rsp2 => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp2.ext_ref_output_en = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP2_EXT_REF_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "Rsp2_ExtRefControl",
                                );
                            }
                        }
                    }
                    HwVariant::RspDuo => {
                        // 从机拿不到设备级参数
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp_duo.ext_ref_output_en = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP_DUO_EXT_REF_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "RspDuo_ExtRefControl",
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
            "biasT_ctrl" => {
                let enable = parse_bool(value);
                match variant {
                    HwVariant::Rsp2 => {
                        st.ch_mut().rsp2.bias_t_enable = enable;
                        if active {
                            sh.execute_api_update(
                                &st,
                                UpdateReason::RSP2_BIAS_T_CONTROL,
                                UpdateExt1::NONE,
                                None,
                                "Rsp2_BiasTControl",
                            );
                        }
                    }
                    HwVariant::RspDuo => {
                        st.ch_mut().rsp_duo.bias_t_enable = enable;
                        if active {
                            sh.execute_api_update(
                                &st,
                                UpdateReason::RSP_DUO_BIAS_T_CONTROL,
                                UpdateExt1::NONE,
                                None,
                                "RspDuo_BiasTControl",
                            );
                        }
                    }
                    HwVariant::Rsp1a | HwVariant::Rsp1b => {
                        st.ch_mut().rsp1a.bias_t_enable = enable;
                        if active {
                            sh.execute_api_update(
                                &st,
                                UpdateReason::RSP1A_BIAS_T_CONTROL,
                                UpdateExt1::NONE,
                                None,
                                "Rsp1a_BiasTControl",
                            );
                        }
                    }
                    HwVariant::RspDx | HwVariant::RspDxR2 => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp_dx.bias_t_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::NONE,
                                    UpdateExt1::RSP_DX_BIAS_T_CONTROL,
                                    None,
                                    "RspDx_BiasTControl",
                                );
                            }
                        }
                    }
                    HwVariant::Rsp1 => {}
                }
            }
            "rfnotch_ctrl" => {
                let enable = parse_bool(value);
                match variant {
                    HwVariant::Rsp2 => {
                        st.ch_mut().rsp2.rf_notch_enable = enable;
                        if active {
                            sh.execute_api_update(
                                &st,
                                UpdateReason::RSP2_RF_NOTCH_CONTROL,
                                UpdateExt1::NONE,
                                None,
                                "Rsp2_RfNotchControl",
                            );
                        }
                    }
                    HwVariant::RspDuo => {
                        // Hi-Z 口在用时是 AM 陷波器，50Ω 口是宽带 RF 陷波器
                        let am_port = st.ch().rsp_duo.tuner1_am_port_sel;
                        if st.info.tuner == TunerSelect::A && am_port == AmPort::HiZ {
                            st.ch_mut().rsp_duo.tuner1_am_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP_DUO_TUNER1_AM_NOTCH_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "RspDuo_Tuner1AmNotchControl",
                                );
                            }
                        }
                        if am_port == AmPort::FiftyOhm {
                            st.ch_mut().rsp_duo.rf_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP_DUO_RF_NOTCH_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "RspDuo_RfNotchControl",
                                );
                            }
                        }
                    }
                    HwVariant::Rsp1a | HwVariant::Rsp1b => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp1a.rf_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP1A_RF_NOTCH_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "Rsp1a_RfNotchControl",
                                );
                            }
                        }
                    }
                    HwVariant::RspDx | HwVariant::RspDxR2 => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp_dx.rf_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::NONE,
                                    UpdateExt1::RSP_DX_RF_NOTCH_CONTROL,
                                    None,
                                    "RspDx_RfNotchControl",
                                );
                            }
                        }
                    }
                    HwVariant::Rsp1 => {}
                }
            }
            "dabnotch_ctrl" => {
                let enable = parse_bool(value);
                match variant {
                    HwVariant::RspDuo => {
                        st.ch_mut().rsp_duo.rf_dab_notch_enable = enable;
                        if active {
                            sh.execute_api_update(
                                &st,
                                UpdateReason::RSP_DUO_RF_DAB_NOTCH_CONTROL,
                                UpdateExt1::NONE,
                                None,
                                "RspDuo_RfDabNotchControl",
                            );
                        }
                    }
                    HwVariant::Rsp1a | HwVariant::Rsp1b => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp1a.rf_dab_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::RSP1A_RF_DAB_NOTCH_CONTROL,
                                    UpdateExt1::NONE,
                                    None,
                                    "Rsp1a_RfDabNotchControl",
                                );
                            }
                        }
                    }
                    HwVariant::RspDx | HwVariant::RspDxR2 => {
                        if let Some(dev) = st.params.dev.as_mut() {
                            dev.rsp_dx.rf_dab_notch_enable = enable;
                            if active {
                                sh.execute_api_update(
                                    &st,
                                    UpdateReason::NONE,
                                    UpdateExt1::RSP_DX_RF_DAB_NOTCH_CONTROL,
                                    None,
                                    "RspDx_RfDabNotchControl",
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
            "hdr_ctrl" => {
                let enable = parse_bool(value);
                if matches!(variant, HwVariant::RspDx | HwVariant::RspDxR2)
                    && let Some(dev) = st.params.dev.as_mut()
                {
                    dev.rsp_dx.hdr_enable = enable;
                    debug!("rsp_dx.hdr_enable={enable}");
                    if active {
                        sh.execute_api_update(
                            &st,
                            UpdateReason::NONE,
                            UpdateExt1::RSP_DX_HDR_ENABLE,
                            None,
                            "RspDx_HdrEnable",
                        );
                    }
                }
            }
            _ => {}
        }
    }

    pub(crate) fn read_setting_inner(&self, key: &str) -> String {
        let st = self.shared.general.lock();
        let variant = st.info.hw_ver;

        let bool_str = |b: bool| if b { "true" } else { "false" }.to_string();

        match key {
            "rfgain_sel" => st.ch().tuner.gain.lna_state.to_string(),
            "iqcorr_ctrl" => bool_str(st.ch().ctrl.dc_offset.iq_enable),
            "agc_setpoint" => st.ch().ctrl.agc.set_point_dbfs.to_string(),
            "extref_ctrl" => match (&st.params.dev, variant) {
                (None, _) => "unknown".to_string(),
                (Some(dev), HwVariant::Rsp2) => bool_str(dev.rsp2.ext_ref_output_en),
                (Some(dev), HwVariant::RspDuo) => bool_str(dev.rsp_duo.ext_ref_output_en),
                _ => bool_str(false),
            },
            "biasT_ctrl" => match variant {
                HwVariant::Rsp2 => bool_str(st.ch().rsp2.bias_t_enable),
                HwVariant::RspDuo => bool_str(st.ch().rsp_duo.bias_t_enable),
                HwVariant::Rsp1a | HwVariant::Rsp1b => bool_str(st.ch().rsp1a.bias_t_enable),
                HwVariant::RspDx | HwVariant::RspDxR2 => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp_dx.bias_t_enable),
                },
                HwVariant::Rsp1 => bool_str(false),
            },
            "rfnotch_ctrl" => match variant {
                HwVariant::Rsp2 => bool_str(st.ch().rsp2.rf_notch_enable),
                HwVariant::RspDuo => {
                    let ch = st.ch();
                    if st.info.tuner == TunerSelect::A
                        && ch.rsp_duo.tuner1_am_port_sel == AmPort::HiZ
                    {
                        bool_str(ch.rsp_duo.tuner1_am_notch_enable)
                    } else {
                        bool_str(ch.rsp_duo.rf_notch_enable)
                    }
                }
                HwVariant::Rsp1a | HwVariant::Rsp1b => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp1a.rf_notch_enable),
                },
                HwVariant::RspDx | HwVariant::RspDxR2 => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp_dx.rf_notch_enable),
                },
                HwVariant::Rsp1 => bool_str(false),
            },
            "dabnotch_ctrl" => match variant {
                HwVariant::RspDuo => bool_str(st.ch().rsp_duo.rf_dab_notch_enable),
                HwVariant::Rsp1a | HwVariant::Rsp1b => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp1a.rf_dab_notch_enable),
                },
                HwVariant::RspDx | HwVariant::RspDxR2 => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp_dx.rf_dab_notch_enable),
                },
                _ => bool_str(false),
            },
            "hdr_ctrl" => match variant {
                HwVariant::RspDx | HwVariant::RspDxR2 => match &st.params.dev {
                    None => "unknown".to_string(),
                    Some(dev) => bool_str(dev.rsp_dx.hdr_enable),
                },
                _ => bool_str(false),
            },
            _ => String::new(),
        }
    }

    // ==================== DC/IQ 校正 ====================

    pub(crate) fn set_dc_offset_mode_impl(&self, channel: usize, automatic: bool) {
        let mut st = self.shared.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }
        st.ch_mut().ctrl.dc_offset.dc_enable = automatic;
        st.ch_mut().ctrl.dc_offset.iq_enable = automatic;
    }

    pub(crate) fn dc_offset_mode_impl(&self, channel: usize) -> bool {
        let st = self.shared.general.lock();
        st.ch_at(channel)
            .map(|c| c.ctrl.dc_offset.dc_enable)
            .unwrap_or(false)
    }

    // ==================== 带宽 ====================

    pub(crate) fn set_bandwidth_impl(&self, channel: usize, bw_in: f64) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }
        // 0 表示"默认"：取与采样率兼容的最大带宽
        let target = if bw_in > 0.0 {
            bw_in
        } else {
            self.current_output_rate(&st)
        };
        let bw_type = sample_rate::bw_enum_for_rate(target);
        if st.ch().tuner.bw_type != bw_type {
            st.ch_mut().tuner.bw_type = bw_type;
            if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
                sh.execute_api_update(
                    &st,
                    UpdateReason::TUNER_BW_TYPE,
                    UpdateExt1::NONE,
                    None,
                    "Tuner_BwType",
                );
            }
        }
    }

    pub(crate) fn bandwidth_impl(&self, channel: usize) -> f64 {
        let st = self.shared.general.lock();
        st.ch_at(channel).map(|c| c.tuner.bw_type.hz()).unwrap_or(0.0)
    }
}
