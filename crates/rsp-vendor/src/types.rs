//! 厂商 API 基础类型
//!
//! 硬件型号、调谐器选择、RSPduo 模式、IF/带宽枚举以及回调事件。
//! 枚举值与厂商头文件保持一一对应，字符串形式与设备枚举参数保持兼容。

use std::fmt;

/// 硬件型号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwVariant {
    Rsp1,
    Rsp1a,
    Rsp1b,
    Rsp2,
    RspDuo,
    RspDx,
    RspDxR2,
}

impl HwVariant {
    /// 型号名（与枚举结果中的 label 一致）
    pub fn model_name(&self) -> &'static str {
        match self {
            HwVariant::Rsp1 => "RSP1",
            HwVariant::Rsp1a => "RSP1A",
            HwVariant::Rsp1b => "RSP1B",
            HwVariant::Rsp2 => "RSP2",
            HwVariant::RspDuo => "RSPduo",
            HwVariant::RspDx => "RSPdx",
            HwVariant::RspDxR2 => "RSPdx-R2",
        }
    }

    /// RF 频率下限（Hz）。RSP1 为 10kHz，其余型号 1kHz。
    pub fn min_frequency_hz(&self) -> f64 {
        match self {
            HwVariant::Rsp1 => 10_000.0,
            _ => 1_000.0,
        }
    }

    /// RF 频率上限（Hz），全型号一致
    pub fn max_frequency_hz(&self) -> f64 {
        2_000_000_000.0
    }
}

impl fmt::Display for HwVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.model_name())
    }
}

/// 调谐器选择（RSPduo 有 A/B 两个前端，其余型号恒为 Neither/A）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunerSelect {
    #[default]
    Neither,
    A,
    B,
    Both,
}

/// RSPduo 子模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RspDuoMode {
    #[default]
    Unknown,
    SingleTuner,
    DualTuner,
    Master,
    Slave,
}

impl RspDuoMode {
    /// 从设备枚举参数的模式字符串解析（`ST`/`DT`/`MA`/`MA8`/`SL`）
    ///
    /// `MA8` 是 8MHz 采样钟的 Master 模式，返回值的第二项是该模式隐含的
    /// RSPduo 采样钟（0 表示不指定）。
    pub fn parse(mode: &str) -> Option<(Self, TunerSelect, f64)> {
        match mode {
            "" => Some((RspDuoMode::Unknown, TunerSelect::Neither, 0.0)),
            "ST" => Some((RspDuoMode::SingleTuner, TunerSelect::A, 0.0)),
            "DT" => Some((RspDuoMode::DualTuner, TunerSelect::Both, 6_000_000.0)),
            "MA" => Some((RspDuoMode::Master, TunerSelect::A, 6_000_000.0)),
            "MA8" => Some((RspDuoMode::Master, TunerSelect::A, 8_000_000.0)),
            "SL" => Some((RspDuoMode::Slave, TunerSelect::Neither, 0.0)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RspDuoMode::Unknown => "",
            RspDuoMode::SingleTuner => "ST",
            RspDuoMode::DualTuner => "DT",
            RspDuoMode::Master => "MA",
            RspDuoMode::Slave => "SL",
        }
    }
}

/// IF 频率类型
///
/// 低 IF（1.620/2.048 MHz）配合抽取用于窄带输出；零 IF 用于宽带输出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfType {
    #[default]
    Zero,
    Khz1620,
    Khz2048,
}

/// 模拟带宽枚举
///
/// 取值必须随请求速率单调不减（见 `rsp-driver` 的映射表）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BwType {
    #[default]
    Bw0_200,
    Bw0_300,
    Bw0_600,
    Bw1_536,
    Bw5_000,
    Bw6_000,
    Bw7_000,
    Bw8_000,
}

impl BwType {
    /// 带宽枚举对应的 Hz 值
    pub fn hz(&self) -> f64 {
        match self {
            BwType::Bw0_200 => 200_000.0,
            BwType::Bw0_300 => 300_000.0,
            BwType::Bw0_600 => 600_000.0,
            BwType::Bw1_536 => 1_536_000.0,
            BwType::Bw5_000 => 5_000_000.0,
            BwType::Bw6_000 => 6_000_000.0,
            BwType::Bw7_000 => 7_000_000.0,
            BwType::Bw8_000 => 8_000_000.0,
        }
    }
}

/// RSP2 天线选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rsp2Antenna {
    #[default]
    A,
    B,
}

/// RSPdx / RSPdx-R2 天线选择
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DxAntenna {
    #[default]
    A,
    B,
    C,
}

/// AM 端口选择（RSP2 与 RSPduo 的 Hi-Z 端口）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmPort {
    /// 端口 1 = Hi-Z
    HiZ,
    /// 端口 2 = 50 欧姆
    #[default]
    FiftyOhm,
}

/// 参数更新原因（位集）
///
/// 会话端按最小变更集合组合原因位，一次 `update()` 下发。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateReason(pub u32);

impl UpdateReason {
    pub const NONE: UpdateReason = UpdateReason(0);
    pub const DEV_FS: UpdateReason = UpdateReason(1 << 0);
    pub const DEV_PPM: UpdateReason = UpdateReason(1 << 1);
    pub const TUNER_GR: UpdateReason = UpdateReason(1 << 2);
    pub const TUNER_FRF: UpdateReason = UpdateReason(1 << 3);
    pub const TUNER_BW_TYPE: UpdateReason = UpdateReason(1 << 4);
    pub const TUNER_IF_TYPE: UpdateReason = UpdateReason(1 << 5);
    pub const CTRL_DC_OFFSET_IQ_IMBALANCE: UpdateReason = UpdateReason(1 << 6);
    pub const CTRL_DECIMATION: UpdateReason = UpdateReason(1 << 7);
    pub const CTRL_AGC: UpdateReason = UpdateReason(1 << 8);
    pub const CTRL_OVERLOAD_MSG_ACK: UpdateReason = UpdateReason(1 << 9);
    pub const RSP2_ANTENNA_CONTROL: UpdateReason = UpdateReason(1 << 10);
    pub const RSP2_AM_PORT_SELECT: UpdateReason = UpdateReason(1 << 11);
    pub const RSP2_BIAS_T_CONTROL: UpdateReason = UpdateReason(1 << 12);
    pub const RSP2_RF_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 13);
    pub const RSP2_EXT_REF_CONTROL: UpdateReason = UpdateReason(1 << 14);
    pub const RSP1A_BIAS_T_CONTROL: UpdateReason = UpdateReason(1 << 15);
    pub const RSP1A_RF_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 16);
    pub const RSP1A_RF_DAB_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 17);
    pub const RSP_DUO_AM_PORT_SELECT: UpdateReason = UpdateReason(1 << 18);
    pub const RSP_DUO_BIAS_T_CONTROL: UpdateReason = UpdateReason(1 << 19);
    pub const RSP_DUO_TUNER1_AM_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 20);
    pub const RSP_DUO_RF_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 21);
    pub const RSP_DUO_RF_DAB_NOTCH_CONTROL: UpdateReason = UpdateReason(1 << 22);
    pub const RSP_DUO_EXT_REF_CONTROL: UpdateReason = UpdateReason(1 << 23);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: UpdateReason) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for UpdateReason {
    type Output = UpdateReason;
    fn bitor(self, rhs: UpdateReason) -> UpdateReason {
        UpdateReason(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UpdateReason {
    fn bitor_assign(&mut self, rhs: UpdateReason) {
        self.0 |= rhs.0;
    }
}

/// 扩展更新原因（RSPdx 系列走独立的扩展字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateExt1(pub u32);

impl UpdateExt1 {
    pub const NONE: UpdateExt1 = UpdateExt1(0);
    pub const RSP_DX_ANTENNA_CONTROL: UpdateExt1 = UpdateExt1(1 << 0);
    pub const RSP_DX_BIAS_T_CONTROL: UpdateExt1 = UpdateExt1(1 << 1);
    pub const RSP_DX_RF_NOTCH_CONTROL: UpdateExt1 = UpdateExt1(1 << 2);
    pub const RSP_DX_RF_DAB_NOTCH_CONTROL: UpdateExt1 = UpdateExt1(1 << 3);
    pub const RSP_DX_HDR_ENABLE: UpdateExt1 = UpdateExt1(1 << 4);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for UpdateExt1 {
    type Output = UpdateExt1;
    fn bitor(self, rhs: UpdateExt1) -> UpdateExt1 {
        UpdateExt1(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UpdateExt1 {
    fn bitor_assign(&mut self, rhs: UpdateExt1) {
        self.0 |= rhs.0;
    }
}

/// 过载事件方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOverload {
    Detected,
    Corrected,
}

/// RSPduo 模式变化事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuoEvent {
    MasterInitialised,
    SlaveAttached,
    SlaveDetached,
    SlaveInitialised,
    SlaveUninitialised,
    /// Master 流消失：从机必须立即停止
    MasterDllDisappeared,
    SlaveDllDisappeared,
}

/// 事件回调载荷
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    GainChange,
    PowerOverloadChange(PowerOverload),
    DeviceRemoved,
    RspDuoModeChange(DuoEvent),
}

/// 枚举得到的设备描述
///
/// `select_device()` 之前是候选，之后 `handle` 有效且归属当前进程。
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub serial: String,
    pub hw_ver: HwVariant,
    pub valid: bool,
    /// RSPduo：可用模式集合（按位或的 `RspDuoMode` 掩码语义由 mock/FFI 侧维护）
    pub available_duo_modes: Vec<RspDuoMode>,
    /// 选定后的工作模式
    pub duo_mode: RspDuoMode,
    pub tuner: TunerSelect,
    /// RSPduo 采样钟（6MHz 或 8MHz；非 duo 为 0）
    pub duo_sample_freq: f64,
    pub handle: super::api::DeviceHandle,
}

impl DeviceInfo {
    pub fn supports_duo_mode(&self, mode: RspDuoMode) -> bool {
        self.available_duo_modes.contains(&mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duo_mode_parse() {
        assert_eq!(
            RspDuoMode::parse("ST"),
            Some((RspDuoMode::SingleTuner, TunerSelect::A, 0.0))
        );
        assert_eq!(
            RspDuoMode::parse("DT"),
            Some((RspDuoMode::DualTuner, TunerSelect::Both, 6_000_000.0))
        );
        assert_eq!(
            RspDuoMode::parse("MA8"),
            Some((RspDuoMode::Master, TunerSelect::A, 8_000_000.0))
        );
        assert_eq!(
            RspDuoMode::parse("SL"),
            Some((RspDuoMode::Slave, TunerSelect::Neither, 0.0))
        );
        assert!(RspDuoMode::parse("XX").is_none());
    }

    #[test]
    fn test_bw_type_ordering_matches_hz() {
        // 枚举排序必须与 Hz 值排序一致（带宽映射的单调性依赖它）
        let all = [
            BwType::Bw0_200,
            BwType::Bw0_300,
            BwType::Bw0_600,
            BwType::Bw1_536,
            BwType::Bw5_000,
            BwType::Bw6_000,
            BwType::Bw7_000,
            BwType::Bw8_000,
        ];
        for pair in all.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].hz() < pair[1].hz());
        }
    }

    #[test]
    fn test_frequency_range_by_variant() {
        assert_eq!(HwVariant::Rsp1.min_frequency_hz(), 10_000.0);
        assert_eq!(HwVariant::Rsp1a.min_frequency_hz(), 1_000.0);
        assert_eq!(HwVariant::RspDx.max_frequency_hz(), 2_000_000_000.0);
    }

    #[test]
    fn test_update_reason_bitops() {
        let r = UpdateReason::DEV_FS | UpdateReason::CTRL_DECIMATION;
        assert!(r.contains(UpdateReason::DEV_FS));
        assert!(r.contains(UpdateReason::CTRL_DECIMATION));
        assert!(!r.contains(UpdateReason::TUNER_GR));
        assert!(!r.is_none());
        assert!(UpdateReason::NONE.is_none());
    }
}
