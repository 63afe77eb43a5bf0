//! 采样率与带宽映射
//!
//! 用户请求的是输出采样率；这里把它映射为输入采样钟 + 抽取因子 + IF
//! 类型。2MHz 以下由低 IF（6/8 MHz 输入）或零 IF + 抽取覆盖，2MHz 以上
//! 零 IF 直通。不在表内的速率拒绝且不改变任何状态。

use rsp_vendor::{HwVariant, IfType, RspDuoMode};

/// 速率映射结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateMapping {
    /// SDR 实际使用的输入采样钟（Hz）
    pub input_rate: f64,
    pub decimation: u32,
    pub if_type: IfType,
}

/// 带宽枚举重导出（映射函数的返回类型）
pub use rsp_vendor::BwType;

/// 输出速率 → 输入钟/抽取/IF
///
/// 返回 `None` 表示该输出速率不受支持（调用方不得改变任何状态）。
pub fn input_rate_and_decimation(
    output_rate: u32,
    variant: HwVariant,
    duo_mode: RspDuoMode,
    duo_sample_freq: f64,
) -> Option<RateMapping> {
    // RSPduo 8MHz 采样钟（MA8）下低 IF 换到 2.048MHz
    let (lif, lif_input) = if variant == HwVariant::RspDuo && duo_sample_freq == 8_000_000.0 {
        (IfType::Khz2048, 8_000_000.0)
    } else {
        (IfType::Khz1620, 6_000_000.0)
    };

    // 全型号支持的低 IF 速率（6/8MHz 的 2 的幂分频）
    let low_if = |dec: u32| {
        Some(RateMapping {
            input_rate: lif_input,
            decimation: dec,
            if_type: lif,
        })
    };
    match output_rate {
        62_500 => return low_if(32),
        125_000 => return low_if(16),
        250_000 => return low_if(8),
        500_000 => return low_if(4),
        1_000_000 => return low_if(2),
        2_000_000 => {
            return Some(RateMapping {
                input_rate: lif_input,
                decimation: 1,
                if_type: lif,
            });
        }
        _ => {}
    }

    // 其余速率只在非 duo 或 duo 单调谐器下可用
    if variant == HwVariant::RspDuo && duo_mode != RspDuoMode::SingleTuner {
        return None;
    }

    if output_rate <= 2_000_000 {
        // 零 IF + 抽取覆盖的特殊速率
        let dec = match output_rate {
            96_000 => 32,
            192_000 => 16,
            384_000 => 8,
            768_000 => 4,
            _ => return None,
        };
        return Some(RateMapping {
            input_rate: (output_rate * dec) as f64,
            decimation: dec,
            if_type: IfType::Zero,
        });
    }

    // > 2MHz：零 IF 直通
    Some(RateMapping {
        input_rate: output_rate as f64,
        decimation: 1,
        if_type: IfType::Zero,
    })
}

/// 输出速率 → 带宽枚举（不超过速率的最大档）
pub fn bw_enum_for_rate(output_rate: f64) -> BwType {
    if output_rate < 300_000.0 {
        BwType::Bw0_200
    } else if output_rate < 600_000.0 {
        BwType::Bw0_300
    } else if output_rate < 1_536_000.0 {
        BwType::Bw0_600
    } else if output_rate < 5_000_000.0 {
        BwType::Bw1_536
    } else if output_rate < 6_000_000.0 {
        BwType::Bw5_000
    } else if output_rate < 7_000_000.0 {
        BwType::Bw6_000
    } else if output_rate < 8_000_000.0 {
        BwType::Bw7_000
    } else {
        BwType::Bw8_000
    }
}

/// 设备可列出的采样率
pub fn list_sample_rates(variant: HwVariant, duo_mode: RspDuoMode) -> Vec<f64> {
    if variant == HwVariant::RspDuo && duo_mode != RspDuoMode::SingleTuner {
        vec![62_500.0, 125_000.0, 250_000.0, 500_000.0, 1_000_000.0, 2_000_000.0]
    } else {
        vec![
            62_500.0,
            96_000.0,
            125_000.0,
            192_000.0,
            250_000.0,
            384_000.0,
            500_000.0,
            768_000.0,
            1_000_000.0,
            2_000_000.0,
            2_048_000.0,
            3_000_000.0,
            4_000_000.0,
            5_000_000.0,
            6_000_000.0,
            7_000_000.0,
            8_000_000.0,
            9_000_000.0,
            10_000_000.0,
        ]
    }
}

/// 设备可列出的带宽
pub fn list_bandwidths(variant: HwVariant, duo_mode: RspDuoMode) -> Vec<f64> {
    let mut out = vec![200_000.0, 300_000.0, 600_000.0, 1_536_000.0];
    let narrow_only = variant == HwVariant::RspDuo
        && matches!(
            duo_mode,
            RspDuoMode::DualTuner | RspDuoMode::Master | RspDuoMode::Slave
        );
    if !narrow_only {
        out.extend([5_000_000.0, 6_000_000.0, 7_000_000.0, 8_000_000.0]);
    }
    out
}

use std::sync::atomic::Ordering;

use tracing::{error, warn};

use rsp_vendor::{UpdateExt1, UpdateReason};

use crate::device::{ChangeFlag, GeneralState, RspDevice};
use crate::stream::BUFFER_SAMPLES;

impl RspDevice {
    pub(crate) fn set_sample_rate_impl(&self, channel: usize, output_rate: f64) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }

        let rate = output_rate as u32;
        let Some(mapping) = input_rate_and_decimation(
            rate,
            st.info.hw_ver,
            st.info.duo_mode,
            st.info.duo_sample_freq,
        ) else {
            warn!("invalid sample rate. Sample rate unchanged.");
            return;
        };
        let bw_type = bw_enum_for_rate(output_rate);

        let mut reason = UpdateReason::NONE;
        let mut wait_for_fs = false;

        if let Some(dev) = st.params.dev.as_mut()
            && dev.fs_hz != mapping.input_rate
        {
            dev.fs_hz = mapping.input_rate;
            reason |= UpdateReason::DEV_FS;
            wait_for_fs = true;
        }
        if st.ch().tuner.if_type != mapping.if_type {
            st.ch_mut().tuner.if_type = mapping.if_type;
            reason |= UpdateReason::TUNER_IF_TYPE;
        }
        if st.ch().ctrl.decimation.factor != mapping.decimation {
            let dec = &mut st.ch_mut().ctrl.decimation;
            dec.enable = mapping.decimation != 1;
            dec.factor = mapping.decimation;
            // 宽带信号标志只跟随速率映射表：零 IF 置位，低 IF 清零
            dec.wide_band_signal = mapping.if_type == rsp_vendor::IfType::Zero;
            // 热路径缓存的缓冲切换阈值跟随抽取因子
            sh.cached_buffer_threshold
                .store(BUFFER_SAMPLES / mapping.decimation as usize, Ordering::Relaxed);
            reason |= UpdateReason::CTRL_DECIMATION;
        }
        if st.ch().tuner.bw_type != bw_type {
            st.ch_mut().tuner.bw_type = bw_type;
            reason |= UpdateReason::TUNER_BW_TYPE;
        }

        if !reason.is_none() {
            // 速率变更会打断样本序列：请求两路流排空重启
            self.request_stream_reset();
            if sh.stream_active.load(Ordering::Acquire) {
                sh.execute_api_update(
                    &st,
                    reason,
                    UpdateExt1::NONE,
                    wait_for_fs.then_some(ChangeFlag::Fs),
                    "SampleRate",
                );
            }
        }
    }

    /// 当前输出采样率（持锁版本，设置器内部共用）
    pub(crate) fn current_output_rate(&self, st: &GeneralState) -> f64 {
        let fs = st
            .params
            .dev
            .as_ref()
            .map(|d| d.fs_hz)
            .unwrap_or(st.info.duo_sample_freq);
        let ch = st.ch();

        let fs = if (fs == 6.0e6 && ch.tuner.if_type == rsp_vendor::IfType::Khz1620)
            || (fs == 8.0e6 && ch.tuner.if_type == rsp_vendor::IfType::Khz2048)
        {
            2.0e6
        } else {
            let zero_if_ok = fs >= 2.0e6
                && ch.tuner.if_type == rsp_vendor::IfType::Zero
                && (st.info.hw_ver != rsp_vendor::HwVariant::RspDuo
                    || st.info.duo_mode == RspDuoMode::SingleTuner);
            if !zero_if_ok {
                error!(
                    "invalid sample rate and/or IF setting - fs={fs} if={:?} duo_mode={:?}",
                    ch.tuner.if_type, st.info.duo_mode
                );
            }
            fs
        };

        if ch.ctrl.decimation.enable {
            fs / ch.ctrl.decimation.factor.max(1) as f64
        } else {
            fs
        }
    }

    pub(crate) fn sample_rate_impl(&self, channel: usize) -> f64 {
        let st = self.shared.general.lock();
        if st.ch_at(channel).is_none() {
            return 0.0;
        }
        self.current_output_rate(&st)
    }

    pub(crate) fn sample_rates_impl(&self) -> Vec<f64> {
        let st = self.shared.general.lock();
        list_sample_rates(st.info.hw_ver, st.info.duo_mode)
    }

    pub(crate) fn bandwidths_impl(&self) -> Vec<f64> {
        let st = self.shared.general.lock();
        list_bandwidths(st.info.hw_ver, st.info.duo_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_if_ladder() {
        for (rate, dec) in [
            (62_500u32, 32u32),
            (125_000, 16),
            (250_000, 8),
            (500_000, 4),
            (1_000_000, 2),
        ] {
            let m = input_rate_and_decimation(rate, HwVariant::Rsp1a, RspDuoMode::Unknown, 0.0)
                .unwrap();
            assert_eq!(m.input_rate, 6_000_000.0);
            assert_eq!(m.decimation, dec);
            assert_eq!(m.if_type, IfType::Khz1620);
        }
        let m =
            input_rate_and_decimation(2_000_000, HwVariant::Rsp1a, RspDuoMode::Unknown, 0.0)
                .unwrap();
        assert_eq!(m.decimation, 1);
        assert_eq!(m.if_type, IfType::Khz1620);
    }

    #[test]
    fn test_duo_alt_rate_uses_2048_if() {
        let m = input_rate_and_decimation(
            2_000_000,
            HwVariant::RspDuo,
            RspDuoMode::Master,
            8_000_000.0,
        )
        .unwrap();
        assert_eq!(m.input_rate, 8_000_000.0);
        assert_eq!(m.if_type, IfType::Khz2048);
    }

    #[test]
    fn test_zero_if_decimated_rates() {
        for (rate, dec) in [(96_000u32, 32u32), (192_000, 16), (384_000, 8), (768_000, 4)] {
            let m = input_rate_and_decimation(rate, HwVariant::Rsp2, RspDuoMode::Unknown, 0.0)
                .unwrap();
            assert_eq!(m.if_type, IfType::Zero);
            assert_eq!(m.decimation, dec);
            assert_eq!(m.input_rate, (rate * dec) as f64);
        }
    }

    #[test]
    fn test_wideband_passthrough() {
        let m = input_rate_and_decimation(8_000_000, HwVariant::RspDx, RspDuoMode::Unknown, 0.0)
            .unwrap();
        assert_eq!(m.input_rate, 8_000_000.0);
        assert_eq!(m.decimation, 1);
        assert_eq!(m.if_type, IfType::Zero);
    }

    #[test]
    fn test_unsupported_rates_rejected() {
        assert!(
            input_rate_and_decimation(100_000, HwVariant::Rsp1a, RspDuoMode::Unknown, 0.0)
                .is_none()
        );
        assert!(
            input_rate_and_decimation(1_234_567, HwVariant::Rsp1a, RspDuoMode::Unknown, 0.0)
                .is_none()
        );
    }

    #[test]
    fn test_duo_dual_tuner_rejects_zero_if_rates() {
        // 双调谐器：96kHz 族与 >2MHz 都不可用
        assert!(
            input_rate_and_decimation(96_000, HwVariant::RspDuo, RspDuoMode::DualTuner, 6e6)
                .is_none()
        );
        assert!(
            input_rate_and_decimation(3_000_000, HwVariant::RspDuo, RspDuoMode::Master, 6e6)
                .is_none()
        );
        // 低 IF 速率仍可用
        assert!(
            input_rate_and_decimation(500_000, HwVariant::RspDuo, RspDuoMode::DualTuner, 6e6)
                .is_some()
        );
    }

    #[test]
    fn test_bw_enum_concrete_points() {
        // 带宽档的边界样点
        assert_eq!(bw_enum_for_rate(299_999.0), BwType::Bw0_200);
        assert_eq!(bw_enum_for_rate(300_000.0), BwType::Bw0_300);
        assert_eq!(bw_enum_for_rate(5_000_000.0), BwType::Bw5_000);
        assert_eq!(bw_enum_for_rate(10_000_000.0), BwType::Bw8_000);
    }

    #[test]
    fn test_bw_enum_total_and_monotone() {
        let mut last = bw_enum_for_rate(0.0);
        let mut rate = 1_000.0;
        while rate < 20_000_000.0 {
            let bw = bw_enum_for_rate(rate);
            assert!(bw >= last, "bw mapping must be monotone at {rate}");
            last = bw;
            rate += 7_919.0;
        }
    }

    #[test]
    fn test_rate_listing_by_mode() {
        let dual = list_sample_rates(HwVariant::RspDuo, RspDuoMode::DualTuner);
        assert_eq!(dual.last().copied(), Some(2_000_000.0));
        let std = list_sample_rates(HwVariant::Rsp1a, RspDuoMode::Unknown);
        assert!(std.contains(&10_000_000.0));
    }
}
