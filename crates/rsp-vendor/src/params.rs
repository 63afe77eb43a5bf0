//! 设备参数记录
//!
//! 厂商库中这些记录由服务进程持有、经指针暴露；这里改为由会话持有快照，
//! 修改后通过 `VendorApi::update()` 整体下发，回调通过 changed 标志确认。
//!
//! 不变量：
//! - 抽取因子 ∈ {1,2,4,8,16,32}，`enable` 与 `factor != 1` 一致
//! - IFGR ∈ [20,59]；LNA 状态上限由型号与频段决定（见 rsp-driver 的表）

use crate::types::{AmPort, BwType, DxAntenna, IfType, Rsp2Antenna};

/// 增益参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainParams {
    /// IF 级增益衰减（dB），越大增益越低
    pub gr_db: i32,
    /// LNA 状态（离散衰减档位），越大增益越低
    pub lna_state: u8,
}

impl Default for GainParams {
    fn default() -> Self {
        // 厂商默认：50dB 衰减、LNA 状态 0
        Self {
            gr_db: 50,
            lna_state: 0,
        }
    }
}

/// AGC 参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgcParams {
    pub enable: bool,
    /// 目标功率设定点（dBfs，负值）
    pub set_point_dbfs: i32,
}

impl Default for AgcParams {
    fn default() -> Self {
        Self {
            enable: true,
            set_point_dbfs: -60,
        }
    }
}

/// DC/IQ 校正开关
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcOffsetParams {
    pub dc_enable: bool,
    pub iq_enable: bool,
}

impl Default for DcOffsetParams {
    fn default() -> Self {
        Self {
            dc_enable: true,
            iq_enable: true,
        }
    }
}

/// DC 校正跟踪参数（激活流时写入固定值）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DcOffsetTunerParams {
    pub dc_cal: u8,
    pub speed_up: u8,
    pub track_time: u8,
}

/// 抽取参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecimationParams {
    pub enable: bool,
    pub factor: u32,
    /// 宽带信号标志：零 IF 置位，低 IF 清零，不做更多推断
    pub wide_band_signal: bool,
}

impl Default for DecimationParams {
    fn default() -> Self {
        Self {
            enable: false,
            factor: 1,
            wide_band_signal: false,
        }
    }
}

/// 调谐器参数（每通道）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TunerParams {
    pub rf_hz: f64,
    pub bw_type: BwType,
    pub if_type: IfType,
    pub gain: GainParams,
    pub dc_offset_tuner: DcOffsetTunerParams,
}

impl Default for TunerParams {
    fn default() -> Self {
        Self {
            rf_hz: 200_000_000.0,
            bw_type: BwType::Bw0_200,
            if_type: IfType::Zero,
            gain: GainParams::default(),
            dc_offset_tuner: DcOffsetTunerParams::default(),
        }
    }
}

/// 控制参数（每通道）
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CtrlParams {
    pub agc: AgcParams,
    pub dc_offset: DcOffsetParams,
    pub decimation: DecimationParams,
}

/// RSP2 专有通道参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp2TunerParams {
    pub antenna_sel: Rsp2Antenna,
    pub am_port_sel: AmPort,
    pub bias_t_enable: bool,
    pub rf_notch_enable: bool,
}

/// RSPduo 专有通道参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RspDuoTunerParams {
    pub tuner1_am_port_sel: AmPort,
    pub bias_t_enable: bool,
    pub rf_notch_enable: bool,
    pub tuner1_am_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
}

/// RSP1A/RSP1B 专有通道参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp1aTunerParams {
    pub bias_t_enable: bool,
}

/// 通道参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelParams {
    pub tuner: TunerParams,
    pub ctrl: CtrlParams,
    pub rsp2: Rsp2TunerParams,
    pub rsp_duo: RspDuoTunerParams,
    pub rsp1a: Rsp1aTunerParams,
}

/// RSP1A/RSP1B 专有设备参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp1aDevParams {
    pub rf_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
}

/// RSP2 专有设备参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rsp2DevParams {
    pub ext_ref_output_en: bool,
}

/// RSPduo 专有设备参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RspDuoDevParams {
    pub ext_ref_output_en: bool,
}

/// RSPdx / RSPdx-R2 专有设备参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RspDxDevParams {
    pub antenna_sel: DxAntenna,
    pub bias_t_enable: bool,
    pub rf_notch_enable: bool,
    pub rf_dab_notch_enable: bool,
    pub hdr_enable: bool,
}

/// 设备级参数（采样钟、基准输出、型号专有标志）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DevParams {
    /// 输入采样钟（Hz）
    pub fs_hz: f64,
    /// 晶振漂移校正（ppm）
    pub ppm: f64,
    pub rsp1a: Rsp1aDevParams,
    pub rsp2: Rsp2DevParams,
    pub rsp_duo: RspDuoDevParams,
    pub rsp_dx: RspDxDevParams,
}

impl Default for DevParams {
    fn default() -> Self {
        Self {
            fs_hz: 2_000_000.0,
            ppm: 0.0,
            rsp1a: Rsp1aDevParams::default(),
            rsp2: Rsp2DevParams::default(),
            rsp_duo: RspDuoDevParams::default(),
            rsp_dx: RspDxDevParams::default(),
        }
    }
}

/// 完整设备参数快照
///
/// RSPduo 从机没有设备级记录（`dev` 为 `None`），此时 ppm 等设备级
/// 设置读 0、写入静默拒绝。
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceParams {
    pub dev: Option<DevParams>,
    pub rx_channel_a: ChannelParams,
    pub rx_channel_b: Option<ChannelParams>,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            dev: Some(DevParams::default()),
            rx_channel_a: ChannelParams::default(),
            rx_channel_b: None,
        }
    }
}

impl DeviceParams {
    /// RSPduo 从机：无设备级记录
    pub fn slave_default() -> Self {
        Self {
            dev: None,
            rx_channel_a: ChannelParams::default(),
            rx_channel_b: None,
        }
    }

    /// 双调谐器：两个通道记录
    pub fn dual_default() -> Self {
        Self {
            dev: Some(DevParams {
                fs_hz: 6_000_000.0,
                ..DevParams::default()
            }),
            rx_channel_a: ChannelParams::default(),
            rx_channel_b: Some(ChannelParams::default()),
        }
    }
}

/// 抽取因子合法集合
pub const VALID_DECIMATION_FACTORS: [u32; 6] = [1, 2, 4, 8, 16, 32];

impl DecimationParams {
    /// 校验抽取不变量：因子合法且 enable 与 factor!=1 一致
    pub fn is_valid(&self) -> bool {
        VALID_DECIMATION_FACTORS.contains(&self.factor) && self.enable == (self.factor != 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimation_invariant() {
        let mut d = DecimationParams::default();
        assert!(d.is_valid());

        d.factor = 8;
        assert!(!d.is_valid()); // enable 未跟随
        d.enable = true;
        assert!(d.is_valid());

        d.factor = 3;
        assert!(!d.is_valid()); // 非法因子
    }

    #[test]
    fn test_slave_params_have_no_dev_record() {
        let p = DeviceParams::slave_default();
        assert!(p.dev.is_none());
        assert!(p.rx_channel_b.is_none());
    }

    #[test]
    fn test_dual_params() {
        let p = DeviceParams::dual_default();
        assert_eq!(p.dev.unwrap().fs_hz, 6_000_000.0);
        assert!(p.rx_channel_b.is_some());
    }
}
