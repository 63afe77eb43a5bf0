//! LNA 衰减表
//!
//! 来自厂商数据手册的逐档累计衰减（dB），按型号与频段索引。表长即合法
//! LNA 状态数；标量增益与档位的互换、RFGR 的合法范围都由这些表驱动。
//! 数据按手册原样转录，个别频段的非单调行保持原状。

use rsp_vendor::HwVariant;

// ==================== RSP1（每频段 4 档） ====================

const RSP1_0_420: &[u8] = &[0, 24, 19, 43];
const RSP1_420_1000: &[u8] = &[0, 7, 19, 26];
const RSP1_1000_2000: &[u8] = &[0, 5, 19, 24];

// ==================== RSP1A / RSP1B（至多 10 档） ====================

const RSP1A_0_60: &[u8] = &[0, 6, 12, 18, 37, 42, 61];
const RSP1A_60_420: &[u8] = &[0, 6, 12, 18, 20, 26, 32, 38, 57, 62];
const RSP1A_420_1000: &[u8] = &[0, 7, 13, 19, 20, 27, 33, 39, 45, 64];
const RSP1A_1000_2000: &[u8] = &[0, 6, 12, 20, 26, 32, 38, 43, 62];

// ==================== RSP2（至多 9 档，Hi-Z 端口独立表） ====================

const RSP2_0_420: &[u8] = &[0, 10, 15, 21, 24, 34, 39, 45, 64];
const RSP2_420_1000: &[u8] = &[0, 7, 10, 17, 22, 41];
const RSP2_1000_2000: &[u8] = &[0, 5, 21, 15, 15, 34];
const RSP2_HIZ_0_60: &[u8] = &[0, 6, 12, 18, 37];

// ==================== RSPduo（同 RSP1A，Hi-Z 端口独立表） ====================

const RSPDUO_HIZ_0_60: &[u8] = &[0, 6, 12, 18, 37];

// ==================== RSPdx / RSPdx-R2（至多 28 档，7 个频段） ====================

const RSPDX_HDR: &[u8] = &[
    0, 3, 6, 9, 12, 15, 18, 21, 24, 25, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60, 63, 66,
    69, 72, 75, 78,
];
const RSPDX_2_12: &[u8] = &[
    0, 3, 6, 9, 12, 15, 18, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60, 63, 66, 69, 72,
    75, 78, 81, 84,
];
const RSPDX_12_60: &[u8] = &[
    0, 3, 6, 9, 12, 15, 18, 24, 27, 30, 33, 36, 39, 42, 45, 48, 51, 54, 57, 60, 63, 66, 69, 72,
    75, 78, 81, 84,
];
const RSPDX_60_250: &[u8] = &[
    0, 3, 6, 9, 12, 15, 18, 20, 26, 29, 32, 35, 38, 44, 47, 50, 53, 56, 59, 62, 65, 68, 71, 74,
    77, 80, 83, 86,
];
const RSPDX_250_420: &[u8] = &[
    0, 3, 6, 9, 12, 15, 18, 20, 26, 29, 32, 35, 38, 44, 47, 50, 53, 56, 59, 62, 65, 68, 71, 74,
    77, 80, 83, 86,
];
const RSPDX_420_1000: &[u8] = &[
    0, 7, 10, 13, 16, 19, 22, 25, 31, 34, 37, 40, 43, 46, 49, 52, 55, 58, 61, 64, 67, 70, 73, 76,
    79, 82, 85, 88,
];
const RSPDX_1000_2000: &[u8] = &[
    0, 5, 8, 11, 14, 17, 20, 32, 35, 38, 41, 44, 47, 50, 53, 56, 59, 62, 65, 68, 71, 74, 77, 80,
    83, 86, 89, 92,
];

/// 当前工况对应的 LNA 衰减表
///
/// `hi_z`：RSP2/RSPduo 的 Hi-Z 端口在用；`hdr`：RSPdx 系列 HDR 路径
/// （≤2MHz）在用。
pub fn lna_reduction_table(
    variant: HwVariant,
    freq_hz: f64,
    hi_z: bool,
    hdr: bool,
) -> &'static [u8] {
    match variant {
        HwVariant::Rsp1 => {
            if freq_hz < 420e6 {
                RSP1_0_420
            } else if freq_hz < 1000e6 {
                RSP1_420_1000
            } else {
                RSP1_1000_2000
            }
        }
        HwVariant::Rsp1a | HwVariant::Rsp1b => rsp1a_band(freq_hz),
        HwVariant::Rsp2 => {
            if hi_z && freq_hz < 60e6 {
                RSP2_HIZ_0_60
            } else if freq_hz < 420e6 {
                RSP2_0_420
            } else if freq_hz < 1000e6 {
                RSP2_420_1000
            } else {
                RSP2_1000_2000
            }
        }
        HwVariant::RspDuo => {
            if hi_z && freq_hz < 60e6 {
                RSPDUO_HIZ_0_60
            } else {
                rsp1a_band(freq_hz)
            }
        }
        HwVariant::RspDx | HwVariant::RspDxR2 => {
            if hdr && freq_hz < 2e6 {
                RSPDX_HDR
            } else if freq_hz < 12e6 {
                RSPDX_2_12
            } else if freq_hz < 60e6 {
                RSPDX_12_60
            } else if freq_hz < 250e6 {
                RSPDX_60_250
            } else if freq_hz < 420e6 {
                RSPDX_250_420
            } else if freq_hz < 1000e6 {
                RSPDX_420_1000
            } else {
                RSPDX_1000_2000
            }
        }
    }
}

fn rsp1a_band(freq_hz: f64) -> &'static [u8] {
    if freq_hz < 60e6 {
        RSP1A_0_60
    } else if freq_hz < 420e6 {
        RSP1A_60_420
    } else if freq_hz < 1000e6 {
        RSP1A_420_1000
    } else {
        RSP1A_1000_2000
    }
}

/// 当前工况下最大的合法 LNA 状态
pub fn max_lna_state(variant: HwVariant, freq_hz: f64, hi_z: bool, hdr: bool) -> u8 {
    (lna_reduction_table(variant, freq_hz, hi_z, hdr).len() - 1) as u8
}

/// 型号的全局 RFGR 上限（与频率无关，用于范围上报）
pub fn max_lna_state_for_variant(variant: HwVariant) -> u8 {
    match variant {
        HwVariant::Rsp1 => 3,
        HwVariant::Rsp2 => 8,
        HwVariant::Rsp1a | HwVariant::Rsp1b | HwVariant::RspDuo => 9,
        HwVariant::RspDx | HwVariant::RspDxR2 => 27,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [HwVariant; 7] = [
        HwVariant::Rsp1,
        HwVariant::Rsp1a,
        HwVariant::Rsp1b,
        HwVariant::Rsp2,
        HwVariant::RspDuo,
        HwVariant::RspDx,
        HwVariant::RspDxR2,
    ];

    #[test]
    fn test_tables_start_at_zero() {
        for v in ALL {
            for freq in [1e5, 5e6, 30e6, 100e6, 300e6, 500e6, 1.5e9] {
                for hi_z in [false, true] {
                    for hdr in [false, true] {
                        let t = lna_reduction_table(v, freq, hi_z, hdr);
                        assert_eq!(t[0], 0, "{v:?} @ {freq} Hz");
                        assert!(!t.is_empty());
                    }
                }
            }
        }
    }

    #[test]
    fn test_state_counts_per_variant() {
        // 档位数：RSP1 恒 4；RSP2 至多 9；RSP1A/B 与 duo 至多 10；dx 系列至多 28
        assert_eq!(lna_reduction_table(HwVariant::Rsp1, 100e6, false, false).len(), 4);
        assert_eq!(lna_reduction_table(HwVariant::Rsp2, 100e6, false, false).len(), 9);
        assert_eq!(
            lna_reduction_table(HwVariant::Rsp1a, 100e6, false, false).len(),
            10
        );
        assert_eq!(
            lna_reduction_table(HwVariant::RspDuo, 100e6, false, false).len(),
            10
        );
        assert_eq!(
            lna_reduction_table(HwVariant::RspDx, 100e6, false, false).len(),
            28
        );
        assert_eq!(
            lna_reduction_table(HwVariant::RspDxR2, 1.5e9, false, false).len(),
            28
        );
    }

    #[test]
    fn test_hi_z_tables_apply_below_60mhz_only() {
        let hiz = lna_reduction_table(HwVariant::RspDuo, 1e6, true, false);
        assert_eq!(hiz.len(), 5);
        let fifty = lna_reduction_table(HwVariant::RspDuo, 100e6, true, false);
        assert_eq!(fifty.len(), 10);
    }

    #[test]
    fn test_hdr_table_applies_below_2mhz_only() {
        let hdr = lna_reduction_table(HwVariant::RspDx, 1e6, false, true);
        assert_eq!(hdr, RSPDX_HDR);
        let vhf = lna_reduction_table(HwVariant::RspDx, 100e6, false, true);
        assert_eq!(vhf, RSPDX_60_250);
    }

    #[test]
    fn test_max_state_consistent_with_tables() {
        for v in ALL {
            let from_variant = max_lna_state_for_variant(v);
            // 全局上限必须覆盖所有频段的表长
            for freq in [1e5, 5e6, 30e6, 100e6, 300e6, 500e6, 1.5e9] {
                assert!(max_lna_state(v, freq, false, false) <= from_variant);
            }
        }
    }
}
