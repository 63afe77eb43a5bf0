//! 增益控制
//!
//! 两个增益元件：`IFGR`（IF 衰减 dB，20..59，越大增益越低）与 `RFGR`
//! （LNA 状态，0..max，上限由型号和当前频段决定）。标量总增益经频段表
//! 双向映射到 (LNA 状态, IFGR)。AGC 开启时 IFGR 写入拒绝并告警，RFGR
//! 与 AGC 设定点仍可写。

use tracing::{debug, warn};

use rsp_vendor::{AmPort, HwVariant, TunerSelect, UpdateExt1, UpdateReason};

use crate::device::{ChangeFlag, GeneralState, RspDevice};
use crate::tables::{lna_reduction_table, max_lna_state_for_variant};

/// IF 级增益（dB）：59 - IFGR，夹到 [0,39]
fn if_gain_db(gr_db: i32) -> f64 {
    (59 - gr_db).clamp(0, 39) as f64
}

/// 当前工况下的 LNA 衰减表
fn current_table(st: &GeneralState) -> &'static [u8] {
    let ch = st.ch();
    let hi_z = match st.info.hw_ver {
        HwVariant::Rsp2 => ch.rsp2.am_port_sel == AmPort::HiZ,
        HwVariant::RspDuo => {
            ch.rsp_duo.tuner1_am_port_sel == AmPort::HiZ && st.info.tuner != TunerSelect::B
        }
        _ => false,
    };
    let hdr = st
        .params
        .dev
        .as_ref()
        .map(|d| d.rsp_dx.hdr_enable)
        .unwrap_or(false);
    lna_reduction_table(st.info.hw_ver, ch.tuner.rf_hz, hi_z, hdr)
}

/// 表内最大累计衰减（个别频段的表不单调，取最大值而不是末项）
fn max_reduction(table: &[u8]) -> f64 {
    table.iter().copied().max().unwrap_or(0) as f64
}

/// 标量增益 → (LNA 状态, IFGR)：逐档枚举取 |实际-目标| 最小者
fn distribute_gain(table: &[u8], target: f64) -> (u8, i32) {
    let max_red = max_reduction(table);
    let clamped = target.clamp(0.0, max_red + 39.0);

    let mut best = (0u8, 59i32);
    let mut best_err = f64::INFINITY;
    for (state, &red) in table.iter().enumerate() {
        let lna_gain = max_red - red as f64;
        let if_gr = (59.0 - (clamped - lna_gain)).round().clamp(20.0, 59.0) as i32;
        let actual = lna_gain + if_gain_db(if_gr);
        let err = (actual - clamped).abs();
        if err < best_err {
            best_err = err;
            best = (state as u8, if_gr);
        }
    }
    best
}

impl RspDevice {
    pub(crate) fn set_gain_mode_impl(&self, channel: usize, automatic: bool) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }
        if st.ch().ctrl.agc.enable != automatic {
            st.ch_mut().ctrl.agc.enable = automatic;
            if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
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

    pub(crate) fn gain_mode_impl(&self, channel: usize) -> bool {
        let st = self.shared.general.lock();
        st.ch_at(channel).map(|c| c.ctrl.agc.enable).unwrap_or(false)
    }

    pub(crate) fn set_gain_element_impl(&self, channel: usize, name: &str, value: f64) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }

        let mut do_update = false;
        match name {
            "IFGR" => {
                if st.ch().ctrl.agc.enable {
                    warn!("not updating IFGR gain because AGC is enabled");
                } else {
                    let gr = (value as i32).clamp(20, 59);
                    if st.ch().tuner.gain.gr_db != gr {
                        st.ch_mut().tuner.gain.gr_db = gr;
                        do_update = true;
                    }
                }
            }
            "RFGR" => {
                let max = (current_table(&st).len() - 1) as i32;
                let state = (value as i32).clamp(0, max) as u8;
                if st.ch().tuner.gain.lna_state != state {
                    st.ch_mut().tuner.gain.lna_state = state;
                    do_update = true;
                }
            }
            _ => return,
        }

        if do_update {
            debug!(
                "set_gain({name}, {value:.1}) -> LNAstate={}, gRdB={}",
                st.ch().tuner.gain.lna_state,
                st.ch().tuner.gain.gr_db
            );
            if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
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

    pub(crate) fn gain_element_impl(&self, channel: usize, name: &str) -> f64 {
        let st = self.shared.general.lock();
        let Some(ch) = st.ch_at(channel) else {
            return 0.0;
        };
        match name {
            "IFGR" => ch.tuner.gain.gr_db as f64,
            "RFGR" => ch.tuner.gain.lna_state as f64,
            _ => 0.0,
        }
    }

    pub(crate) fn gain_element_range_impl(&self, name: &str) -> (f64, f64) {
        match name {
            "RFGR" => {
                let variant = self.hw_variant();
                (0.0, max_lna_state_for_variant(variant) as f64)
            }
            _ => (20.0, 59.0),
        }
    }

    /// 标量总增益：映射到 (LNA 状态, IFGR) 后一次下发
    pub(crate) fn set_gain_impl(&self, channel: usize, value: f64) {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        if st.ch_at(channel).is_none() {
            return;
        }

        let table = current_table(&st);
        let (lna_state, if_gr) = distribute_gain(table, value);

        let agc_on = st.ch().ctrl.agc.enable;
        let mut changed = false;
        if st.ch().tuner.gain.lna_state != lna_state {
            st.ch_mut().tuner.gain.lna_state = lna_state;
            changed = true;
        }
        // AGC 接管 IFGR 时只应用 LNA 档位
        if !agc_on && st.ch().tuner.gain.gr_db != if_gr {
            st.ch_mut().tuner.gain.gr_db = if_gr;
            changed = true;
        }

        debug!(
            "set_gain({value:.1} dB) -> LNAstate={lna_state}, gRdB={if_gr} (AGC={})",
            if agc_on { "on" } else { "off" }
        );

        if changed && sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
            sh.execute_api_update(
                &st,
                UpdateReason::TUNER_GR,
                UpdateExt1::NONE,
                Some(ChangeFlag::Gr),
                "Tuner_Gr",
            );
        }
    }

    pub(crate) fn gain_impl(&self, channel: usize) -> f64 {
        let st = self.shared.general.lock();
        let Some(ch) = st.ch_at(channel) else {
            return 0.0;
        };
        let table = current_table(&st);
        let max_red = max_reduction(table);
        let state = (ch.tuner.gain.lna_state as usize).min(table.len() - 1);
        let lna_gain = max_red - table[state] as f64;
        lna_gain + if_gain_db(ch.tuner.gain.gr_db)
    }

    pub(crate) fn gain_range_impl(&self) -> (f64, f64) {
        let st = self.shared.general.lock();
        let table = current_table(&st);
        (0.0, max_reduction(table) + 39.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsp_vendor::HwVariant;

    #[test]
    fn test_if_gain_clamps() {
        assert_eq!(if_gain_db(20), 39.0);
        assert_eq!(if_gain_db(59), 0.0);
        assert_eq!(if_gain_db(0), 39.0);
        assert_eq!(if_gain_db(100), 0.0);
    }

    #[test]
    fn test_distribute_roundtrip_within_one_step() {
        // 每个型号、每个频段：标量设置后读回误差不超过表的量化步距
        let variants = [
            HwVariant::Rsp1,
            HwVariant::Rsp1a,
            HwVariant::Rsp2,
            HwVariant::RspDuo,
            HwVariant::RspDx,
        ];
        for v in variants {
            for freq in [1e6, 30e6, 100e6, 300e6, 500e6, 1.5e9] {
                let table = lna_reduction_table(v, freq, false, false);
                let max_red = max_reduction(table);
                // 相邻档位间最大的步距（量化上限）
                let max_step = table
                    .windows(2)
                    .map(|w| (w[1] as i32 - w[0] as i32).unsigned_abs())
                    .max()
                    .unwrap_or(1)
                    .max(1) as f64;

                let mut g = 0.0;
                while g <= max_red + 39.0 {
                    let (state, if_gr) = distribute_gain(table, g);
                    assert!((state as usize) < table.len());
                    assert!((20..=59).contains(&if_gr));
                    let actual =
                        (max_red - table[state as usize] as f64) + if_gain_db(if_gr);
                    assert!(
                        (actual - g).abs() <= max_step,
                        "{v:?} @ {freq}: target {g} got {actual} (step {max_step})"
                    );
                    g += 1.0;
                }
            }
        }
    }

    #[test]
    fn test_distribute_clamps_out_of_range() {
        let table = lna_reduction_table(HwVariant::Rsp1a, 100e6, false, false);
        let (state_low, if_low) = distribute_gain(table, -50.0);
        let max_red = max_reduction(table);
        // 目标 0dB：最深的 LNA 衰减 + 最深的 IF 衰减
        assert_eq!(
            max_red - table[state_low as usize] as f64 + if_gain_db(if_low),
            {
                let (s, i) = distribute_gain(table, 0.0);
                max_red - table[s as usize] as f64 + if_gain_db(i)
            }
        );

        let (state_hi, if_hi) = distribute_gain(table, 500.0);
        assert_eq!(if_hi, 20);
        assert_eq!(table[state_hi as usize], 0);
    }
}
