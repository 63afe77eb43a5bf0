//! 设备注册表
//!
//! 宿主入口：`enumerate` 列出可见设备（RSPduo 的每个可用子模式各出一个
//! 结果），`make` 按环境变量决定直连驱动还是代理/worker 隔离。厂商后端
//! 经 [`install_vendor_api`] 注入：真实 FFI 后端由部署方提供，测试注入
//! mock。枚举失败时回落到缓存结果，已占用的设备仍然可见。

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, OnceLock};

use tracing::{error, warn};

use rsp_driver::{DeviceArgs, DriverError, RspDevice, SdrDevice};
use rsp_vendor::{ApiGate, HwVariant, RspDuoMode, VendorApi};

use crate::proxy::ProxyDevice;

static VENDOR_GATE: OnceLock<Arc<ApiGate>> = OnceLock::new();

static CACHED_RESULTS: LazyLock<Mutex<HashMap<String, DeviceArgs>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// 安装厂商后端（每进程一次），返回进程级 gate
pub fn install_vendor_api(api: Arc<dyn VendorApi>) -> Arc<ApiGate> {
    VENDOR_GATE
        .get_or_init(|| Arc::new(ApiGate::new(api)))
        .clone()
}

/// 已安装的进程级 gate
pub fn vendor_gate() -> Option<Arc<ApiGate>> {
    VENDOR_GATE.get().cloned()
}

/// 代理模式开关：SOAPY_SDRPLAY_MULTIDEV ∈ {1,true,yes,on}
pub fn multidev_forced() -> bool {
    match std::env::var("SOAPY_SDRPLAY_MULTIDEV") {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

fn duo_mode_label(mode: &str) -> &'static str {
    match mode {
        "ST" => " - Single Tuner",
        "DT" => " - Dual Tuner",
        "MA" => " - Master",
        "MA8" => " - Master (RSPduo sample rate=8Mhz)",
        "SL" => " - Slave",
        _ => "",
    }
}

fn matches_filter(args: &DeviceArgs, dev: &DeviceArgs) -> bool {
    let serial_ok = args
        .get("serial")
        .map(|s| Some(s) == dev.get("serial"))
        .unwrap_or(true);
    let mode_ok = args
        .get("mode")
        .map(|m| Some(m) == dev.get("mode"))
        .unwrap_or(true);
    serial_ok && mode_ok
}

/// 枚举可见设备
pub fn enumerate(args: &DeviceArgs) -> Vec<DeviceArgs> {
    let mut results = Vec::new();
    let mut cache = CACHED_RESULTS.lock().unwrap();

    let listed: Result<Vec<_>, _> = (|| {
        let gate = vendor_gate().ok_or_else(|| {
            DriverError::Worker("no vendor backend installed (install_vendor_api)".into())
        })?;
        gate.open()?;
        let devices = gate
            .call("sdrplay_api_GetDevices", |api| api.get_devices())
            .map_err(DriverError::Vendor)?
            .map_err(DriverError::Vendor)?;
        Ok::<_, DriverError>(devices)
    })();

    match listed {
        Ok(devices) => {
            for info in devices.iter().filter(|d| d.valid) {
                let mut dev = DeviceArgs::new();
                dev.insert("serial".to_string(), info.serial.clone());

                if info.hw_ver != HwVariant::RspDuo {
                    dev.insert(
                        "label".to_string(),
                        format!(
                            "SDRplay Dev{} {} {}",
                            results.len(),
                            info.hw_ver.model_name(),
                            info.serial
                        ),
                    );
                    if matches_filter(args, &dev) {
                        cache.insert(info.serial.clone(), dev.clone());
                        results.push(dev);
                    }
                    continue;
                }

                // RSPduo：每个可用子模式一个结果（MA 额外给出 8MHz 变体）
                let mut modes: Vec<&str> = Vec::new();
                for m in &info.available_duo_modes {
                    match m {
                        RspDuoMode::SingleTuner => modes.push("ST"),
                        RspDuoMode::DualTuner => modes.push("DT"),
                        RspDuoMode::Master => {
                            modes.push("MA");
                            modes.push("MA8");
                        }
                        RspDuoMode::Slave => modes.push("SL"),
                        RspDuoMode::Unknown => {}
                    }
                }
                for mode in modes {
                    let mut dev = dev.clone();
                    dev.insert("mode".to_string(), mode.to_string());
                    dev.insert(
                        "label".to_string(),
                        format!(
                            "SDRplay Dev{} RSPduo {}{}",
                            results.len(),
                            info.serial,
                            duo_mode_label(mode)
                        ),
                    );
                    if matches_filter(args, &dev) {
                        cache.insert(format!("{}@{}", info.serial, mode), dev.clone());
                        results.push(dev);
                    }
                }
            }
        }
        Err(e) => {
            error!("enumeration failed: {e}");
            // 枚举失败：退回缓存（可能为空）
        }
    }

    // 已被本进程占用的句柄补进结果，应用仍能看到自己打开的设备
    for key in rsp_driver::device::claimed_cache_keys() {
        let Some(dev) = cache.get(&key) else { continue };
        if matches_filter(args, dev) && !results.iter().any(|r| r == dev) {
            results.push(dev.clone());
        }
    }

    results
}

/// 打开设备：代理模式走 worker 隔离，否则进程内直连
pub fn make(args: &DeviceArgs) -> Result<Box<dyn SdrDevice>, DriverError> {
    if multidev_forced() {
        warn!("multidev proxy mode forced by environment");
        return Ok(Box::new(ProxyDevice::new(args)?));
    }
    let gate = vendor_gate().ok_or_else(|| {
        DriverError::Worker("no vendor backend installed (install_vendor_api)".into())
    })?;
    Ok(Box::new(RspDevice::new(gate, args)?))
}

/// 始终进程内直连（worker 自己用，绝不能递归进代理模式）
pub fn make_local(args: &DeviceArgs) -> Result<Arc<dyn SdrDevice>, DriverError> {
    let gate = vendor_gate().ok_or_else(|| {
        DriverError::Worker("no vendor backend installed (install_vendor_api)".into())
    })?;
    Ok(Arc::new(RspDevice::new(gate, args)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsp_vendor::mock::MockVendorApi;

    #[test]
    fn test_multidev_env_values() {
        // 环境变量未设时关闭（进程级测试，避免互相污染只测默认分支）
        if std::env::var("SOAPY_SDRPLAY_MULTIDEV").is_err() {
            assert!(!multidev_forced());
        }
    }

    #[test]
    fn test_enumerate_expands_duo_modes() {
        let mock = Arc::new(MockVendorApi::new());
        mock.push_device("ENUM1", HwVariant::Rsp1a);
        mock.push_device("ENUMDUO", HwVariant::RspDuo);
        let api: Arc<dyn VendorApi> = mock;
        install_vendor_api(api);

        let all = enumerate(&DeviceArgs::new());
        let plain: Vec<_> = all
            .iter()
            .filter(|d| d.get("serial").map(String::as_str) == Some("ENUM1"))
            .collect();
        assert_eq!(plain.len(), 1);
        assert!(plain[0].get("label").unwrap().contains("RSP1A"));

        let duo: Vec<_> = all
            .iter()
            .filter(|d| d.get("serial").map(String::as_str) == Some("ENUMDUO"))
            .collect();
        // ST + DT + MA + MA8
        assert_eq!(duo.len(), 4);
        let modes: Vec<_> = duo.iter().filter_map(|d| d.get("mode")).cloned().collect();
        assert!(modes.contains(&"ST".to_string()));
        assert!(modes.contains(&"MA8".to_string()));

        // 序列号过滤
        let mut filter = DeviceArgs::new();
        filter.insert("serial".to_string(), "ENUM1".to_string());
        let filtered = enumerate(&filter);
        assert!(filtered.iter().all(|d| d.get("serial").unwrap() == "ENUM1"));
    }
}
