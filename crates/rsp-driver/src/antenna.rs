//! 天线/端口选择与持久化
//!
//! 天线名是型号相关的枚举；同口型之间切换只改厂商字段（流运行中补发
//! 天线控制更新），RSPduo 单调谐器在 50Ω 与 Hi-Z 之间切换还要换活动
//! 调谐器：流运行中走厂商 swap 调用，空闲时释放后按原参数快照重选。
//!
//! 标记为持久化的选择写入配置目录下的
//! `antenna_<sanitized-key>_ch<N>.txt`，下次打开同一 cache key 时重放。

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use rsp_vendor::{
    AmPort, DxAntenna, HwVariant, Rsp2Antenna, RspDuoMode, TunerSelect, UpdateExt1, UpdateReason,
};

use crate::device::{GeneralState, RspDevice, select_on_vendor};

/// 配置目录：环境覆盖 → 平台默认
pub fn config_dir(override_dir: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(dir) = override_dir {
        return Some(dir.clone());
    }
    if let Ok(dir) = std::env::var("SOAPY_SDRPLAY_CONFIG_DIR")
        && !dir.is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA")
            && !appdata.is_empty()
        {
            return Some(PathBuf::from(appdata).join("SoapySDRPlay"));
        }
        None
    }
    #[cfg(not(windows))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME")
            && !xdg.is_empty()
        {
            return Some(PathBuf::from(xdg).join("SoapySDRPlay"));
        }
        if let Ok(home) = std::env::var("HOME")
            && !home.is_empty()
        {
            return Some(PathBuf::from(home).join(".config").join("SoapySDRPlay"));
        }
        None
    }
}

/// cache key 清洗：`[A-Za-z0-9_.-]` 之外的字符替换为 `_`（幂等）
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn antenna_path(dir: &PathBuf, key: &str, channel: usize) -> PathBuf {
    dir.join(format!("antenna_{}_ch{}.txt", sanitize_key(key), channel))
}

/// 读持久化的天线名
pub(crate) fn load_persisted_antenna(
    override_dir: Option<&PathBuf>,
    key: &str,
    channel: usize,
) -> Option<String> {
    if key.is_empty() {
        return None;
    }
    let dir = config_dir(override_dir)?;
    let path = antenna_path(&dir, key, channel);
    let contents = fs::read_to_string(path).ok()?;
    let name = contents.trim_end_matches(['\n', '\r', ' ', '\t']).to_string();
    (!name.is_empty()).then_some(name)
}

/// 写持久化的天线名（truncate 覆盖写，单行 + 换行）
pub(crate) fn save_persisted_antenna(
    override_dir: Option<&PathBuf>,
    key: &str,
    channel: usize,
    name: &str,
) {
    if key.is_empty() || name.is_empty() {
        return;
    }
    let Some(dir) = config_dir(override_dir) else {
        return;
    };
    if fs::create_dir_all(&dir).is_err() {
        warn!(
            "antenna persistence disabled: cannot create config dir '{}'",
            dir.display()
        );
        return;
    }
    let path = antenna_path(&dir, key, channel);
    match fs::File::create(&path) {
        Ok(mut f) => {
            let _ = writeln!(f, "{name}");
        }
        Err(_) => {
            warn!("antenna persistence disabled: cannot write '{}'", path.display());
        }
    }
}

/// 当前天线名（设置缓存也用它）
pub(crate) fn current_antenna(st: &GeneralState, channel: usize) -> String {
    let ch = st.ch();
    match st.info.hw_ver {
        HwVariant::Rsp2 => {
            if ch.rsp2.am_port_sel == AmPort::HiZ {
                "Hi-Z".to_string()
            } else if ch.rsp2.antenna_sel == Rsp2Antenna::A {
                "Antenna A".to_string()
            } else {
                "Antenna B".to_string()
            }
        }
        HwVariant::RspDuo => {
            let tuner = st.info.tuner;
            if tuner == TunerSelect::A || (tuner == TunerSelect::Both && channel == 0) {
                if ch.rsp_duo.tuner1_am_port_sel == AmPort::HiZ {
                    "Tuner 1 Hi-Z".to_string()
                } else {
                    "Tuner 1 50 ohm".to_string()
                }
            } else {
                "Tuner 2 50 ohm".to_string()
            }
        }
        HwVariant::RspDx | HwVariant::RspDxR2 => {
            match st.params.dev.as_ref().map(|d| d.rsp_dx.antenna_sel) {
                Some(DxAntenna::A) => "Antenna A".to_string(),
                Some(DxAntenna::B) => "Antenna B".to_string(),
                Some(DxAntenna::C) => "Antenna C".to_string(),
                None => "RX".to_string(),
            }
        }
        _ => "RX".to_string(),
    }
}

impl RspDevice {
    pub(crate) fn antennas_impl(&self, channel: usize) -> Vec<String> {
        let st = self.shared.general.lock();
        let names: Vec<&str> = match st.info.hw_ver {
            HwVariant::Rsp1 | HwVariant::Rsp1a | HwVariant::Rsp1b => vec!["RX"],
            HwVariant::Rsp2 => vec!["Antenna A", "Antenna B", "Hi-Z"],
            HwVariant::RspDx | HwVariant::RspDxR2 => {
                vec!["Antenna A", "Antenna B", "Antenna C"]
            }
            HwVariant::RspDuo => match st.info.duo_mode {
                RspDuoMode::SingleTuner | RspDuoMode::Master => {
                    vec!["Tuner 1 50 ohm", "Tuner 1 Hi-Z", "Tuner 2 50 ohm"]
                }
                // 双调谐器没有 Hi-Z：分集接收要求两个输入匹配增益控制
                RspDuoMode::DualTuner => match channel {
                    0 => vec!["Tuner 1 50 ohm"],
                    1 => vec!["Tuner 2 50 ohm"],
                    _ => vec![],
                },
                RspDuoMode::Slave => match st.info.tuner {
                    TunerSelect::A => vec!["Tuner 1 50 ohm", "Tuner 1 Hi-Z"],
                    TunerSelect::B => vec!["Tuner 2 50 ohm"],
                    _ => vec![],
                },
                RspDuoMode::Unknown => vec![],
            },
        };
        names.into_iter().map(String::from).collect()
    }

    pub(crate) fn set_antenna_impl(&self, channel: usize, name: &str) {
        let variant = self.hw_variant();
        // 单天线型号没有可切换的东西
        if matches!(
            variant,
            HwVariant::Rsp1 | HwVariant::Rsp1a | HwVariant::Rsp1b
        ) {
            return;
        }

        let applied = match variant {
            HwVariant::Rsp2 => self.set_antenna_rsp2(name),
            HwVariant::RspDx | HwVariant::RspDxR2 => self.set_antenna_rspdx(name),
            HwVariant::RspDuo => self.set_antenna_duo(name),
            _ => false,
        };

        if applied {
            let (key, override_dir) = {
                let st = self.shared.general.lock();
                (
                    st.cache_key.clone(),
                    self.shared.config_dir_override.lock().clone(),
                )
            };
            save_persisted_antenna(override_dir.as_ref(), &key, channel, name);
        }
    }

    fn set_antenna_rsp2(&self, name: &str) -> bool {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        let active = sh.stream_active.load(std::sync::atomic::Ordering::Acquire);

        let change_to_ab = match name {
            "Antenna A" => {
                st.ch_mut().rsp2.antenna_sel = Rsp2Antenna::A;
                true
            }
            "Antenna B" => {
                st.ch_mut().rsp2.antenna_sel = Rsp2Antenna::B;
                true
            }
            "Hi-Z" => {
                st.ch_mut().rsp2.am_port_sel = AmPort::HiZ;
                if active {
                    sh.execute_api_update(
                        &st,
                        UpdateReason::RSP2_AM_PORT_SELECT,
                        UpdateExt1::NONE,
                        None,
                        "Rsp2_AmPortSelect",
                    );
                }
                false
            }
            _ => return false,
        };

        if change_to_ab {
            // 先离开 Hi-Z 口，再发天线控制
            if st.ch().rsp2.am_port_sel == AmPort::HiZ {
                st.ch_mut().rsp2.am_port_sel = AmPort::FiftyOhm;
                if active {
                    sh.execute_api_update(
                        &st,
                        UpdateReason::RSP2_AM_PORT_SELECT,
                        UpdateExt1::NONE,
                        None,
                        "Rsp2_AmPortSelect",
                    );
                }
            } else if active {
                sh.execute_api_update(
                    &st,
                    UpdateReason::RSP2_ANTENNA_CONTROL,
                    UpdateExt1::NONE,
                    None,
                    "Rsp2_AntennaControl",
                );
            }
        }
        true
    }

    fn set_antenna_rspdx(&self, name: &str) -> bool {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        let Some(dev) = st.params.dev.as_mut() else {
            warn!("set_antenna: device params missing for RSPdx");
            return false;
        };
        dev.rsp_dx.antenna_sel = match name {
            "Antenna A" => DxAntenna::A,
            "Antenna B" => DxAntenna::B,
            "Antenna C" => DxAntenna::C,
            _ => return false,
        };
        if sh.stream_active.load(std::sync::atomic::Ordering::Acquire) {
            sh.execute_api_update(
                &st,
                UpdateReason::NONE,
                UpdateExt1::RSP_DX_ANTENNA_CONTROL,
                None,
                "RspDx_AntennaControl",
            );
        }
        true
    }

    fn set_antenna_duo(&self, name: &str) -> bool {
        let sh = &self.shared;
        let mut st = sh.general.lock();
        let active = sh.stream_active.load(std::sync::atomic::Ordering::Acquire);
        let tuner_change_allowed = matches!(
            st.info.duo_mode,
            RspDuoMode::SingleTuner | RspDuoMode::Master
        );

        let (change_am_port, change_tuner) = match name {
            "Tuner 1 50 ohm" => {
                let change = st.ch().rsp_duo.tuner1_am_port_sel != AmPort::FiftyOhm;
                st.ch_mut().rsp_duo.tuner1_am_port_sel = AmPort::FiftyOhm;
                (
                    change,
                    tuner_change_allowed && st.info.tuner != TunerSelect::A,
                )
            }
            "Tuner 2 50 ohm" => {
                let change = st.ch().rsp_duo.tuner1_am_port_sel != AmPort::FiftyOhm;
                (
                    change,
                    tuner_change_allowed && st.info.tuner != TunerSelect::B,
                )
            }
            "Tuner 1 Hi-Z" => {
                let change = st.ch().rsp_duo.tuner1_am_port_sel != AmPort::HiZ;
                st.ch_mut().rsp_duo.tuner1_am_port_sel = AmPort::HiZ;
                (
                    change,
                    tuner_change_allowed && st.info.tuner != TunerSelect::A,
                )
            }
            _ => return false,
        };

        if !change_tuner {
            if change_am_port && active {
                sh.execute_api_update(
                    &st,
                    UpdateReason::RSP_DUO_AM_PORT_SELECT,
                    UpdateExt1::NONE,
                    None,
                    "RspDuo_AmPortSelect",
                );
            }
            return true;
        }

        if active {
            if st.info.duo_mode == RspDuoMode::SingleTuner {
                // 流运行中：厂商调用切换活动调谐器
                let handle = st.info.handle;
                let current = st.info.tuner;
                let am_port = st.ch().rsp_duo.tuner1_am_port_sel;
                let result = sh.gate.call("sdrplay_api_SwapRspDuoActiveTuner", move |api| {
                    api.swap_duo_active_tuner(handle, current, am_port)
                });
                match result {
                    Ok(Ok(new_tuner)) => {
                        st.info.tuner = new_tuner;
                        true
                    }
                    Ok(Err(e)) => {
                        warn!("SwapRspDuoActiveTuner failed: {e}");
                        false
                    }
                    Err(e) => {
                        warn!("SwapRspDuoActiveTuner failed: {e}");
                        false
                    }
                }
            } else {
                warn!("tuner change not allowed in RSPduo master mode while the device is streaming");
                false
            }
        } else {
            // 空闲：释放并重选另一调谐器，保留参数快照
            let other = if st.info.tuner == TunerSelect::A {
                TunerSelect::B
            } else {
                TunerSelect::A
            };
            let serial = st.info.serial.clone();
            let duo_mode = st.info.duo_mode;
            let duo_freq = st.info.duo_sample_freq;
            let prev_params = st.params.clone();

            let release_info = st.info.clone();
            let released = sh.gate.call("sdrplay_api_ReleaseDevice", move |api| {
                api.release_device(&release_info)
            });
            if !matches!(released, Ok(Ok(()))) {
                warn!("ReleaseDevice failed during tuner switch");
                return false;
            }

            match select_on_vendor(&sh.gate, &serial, other, duo_mode, duo_freq, Some(prev_params))
            {
                Ok((info, params)) => {
                    st.info = info;
                    st.params = params;
                    debug!("RSPduo tuner switched to {:?}", st.info.tuner);
                    true
                }
                Err(e) => {
                    warn!("tuner switch reselect failed: {e}");
                    false
                }
            }
        }
    }

    pub(crate) fn antenna_name_impl(&self, channel: usize) -> String {
        let st = self.shared.general.lock();
        current_antenna(&st, channel)
    }

    pub(crate) fn set_antenna_persistent_impl(
        &self,
        channel: usize,
        name: &str,
        persistent: bool,
    ) {
        if channel > 1 {
            return;
        }
        {
            let mut persist = self.shared.persistent_antenna.lock();
            persist[channel].enabled = persistent;
            persist[channel].name = persistent.then(|| name.to_string());
        }
        self.set_antenna_impl(channel, name);
    }

    pub(crate) fn antenna_persistent_impl(&self, channel: usize) -> bool {
        if channel > 1 {
            return false;
        }
        self.shared.persistent_antenna.lock()[channel].enabled
    }

    /// 打开时重放持久化的天线选择
    pub(crate) fn reapply_persisted_antennas(&self) {
        let (key, override_dir) = {
            let st = self.shared.general.lock();
            (
                st.cache_key.clone(),
                self.shared.config_dir_override.lock().clone(),
            )
        };
        for channel in 0..2 {
            if let Some(name) = load_persisted_antenna(override_dir.as_ref(), &key, channel) {
                debug!("reapplying persisted antenna '{name}' for channel {channel}");
                {
                    let mut persist = self.shared.persistent_antenna.lock();
                    persist[channel].enabled = true;
                    persist[channel].name = Some(name.clone());
                }
                self.set_antenna_impl(channel, &name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_is_idempotent() {
        for key in ["1234ABCD@ST", "a b/c:d", "plain-key_0.9", "天线"] {
            let once = sanitize_key(key);
            assert_eq!(sanitize_key(&once), once);
        }
    }

    #[test]
    fn test_sanitize_merges_forbidden_chars() {
        // 仅在非法字符上有差异的 key 清洗到同一结果
        assert_eq!(sanitize_key("1000@ST"), sanitize_key("1000/ST"));
        assert_eq!(sanitize_key("a:b"), "a_b");
        assert_eq!(sanitize_key("a.b-c_d"), "a.b-c_d");
    }

    #[test]
    fn test_persist_roundtrip() {
        let dir = TempDir::new().unwrap();
        let override_dir = Some(dir.path().to_path_buf());

        save_persisted_antenna(override_dir.as_ref(), "1000A@ST", 0, "Tuner 1 Hi-Z");
        let loaded = load_persisted_antenna(override_dir.as_ref(), "1000A@ST", 0);
        assert_eq!(loaded.as_deref(), Some("Tuner 1 Hi-Z"));

        // 另一通道独立
        assert!(load_persisted_antenna(override_dir.as_ref(), "1000A@ST", 1).is_none());

        // 文件内容是单行 + 换行
        let path = dir.path().join("antenna_1000A_ST_ch0.txt");
        assert_eq!(fs::read_to_string(path).unwrap(), "Tuner 1 Hi-Z\n");
    }

    #[test]
    fn test_persist_overwrites() {
        let dir = TempDir::new().unwrap();
        let override_dir = Some(dir.path().to_path_buf());
        save_persisted_antenna(override_dir.as_ref(), "K", 0, "Antenna A");
        save_persisted_antenna(override_dir.as_ref(), "K", 0, "Antenna B");
        assert_eq!(
            load_persisted_antenna(override_dir.as_ref(), "K", 0).as_deref(),
            Some("Antenna B")
        );
    }

    #[test]
    fn test_empty_key_or_name_ignored() {
        let dir = TempDir::new().unwrap();
        let override_dir = Some(dir.path().to_path_buf());
        save_persisted_antenna(override_dir.as_ref(), "", 0, "Antenna A");
        save_persisted_antenna(override_dir.as_ref(), "K", 0, "");
        assert!(load_persisted_antenna(override_dir.as_ref(), "K", 0).is_none());
    }
}
