//! 厂商 API trait
//!
//! 真实后端链接 sdrplay_api 服务；测试后端见 [`crate::mock`]。所有实现必须
//! 是 `Send + Sync`：同一个实例被会话、看门狗与回调线程共享。
//!
//! 与厂商库的差异：参数记录不再经指针共享，而是由会话持有快照并在
//! `update()` 时整体下发；回调以 trait 对象注册，`init()` 后厂商线程开始
//! 调用 `stream_a`/`stream_b`/`event`。

use std::sync::Arc;

use crate::error::VendorError;
use crate::params::DeviceParams;
use crate::types::{AmPort, DeviceInfo, Event, TunerSelect, UpdateExt1, UpdateReason};

/// 厂商设备句柄（SelectDevice 之后有效）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceHandle(pub u32);

/// 采样回调参数
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamCbParams {
    /// 本突发第一个样本的序号（用于丢样检测）
    pub first_sample_num: u32,
    /// 增益衰减变更确认标志（非 0 表示有变更）
    pub gr_changed: u32,
    /// RF 频率变更确认标志
    pub rf_changed: u32,
    /// 采样钟变更确认标志
    pub fs_changed: u32,
}

/// 厂商线程调用的回调集合
///
/// 回调不允许失败：只记录状态并返回。
pub trait StreamCallbacks: Send + Sync {
    /// 调谐器 A 的 I/Q 突发
    fn stream_a(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams);
    /// 调谐器 B 的 I/Q 突发（仅双调谐器模式）
    fn stream_b(&self, xi: &[i16], xq: &[i16], params: &StreamCbParams);
    /// 设备事件
    fn event(&self, event: Event, tuner: TunerSelect);
}

/// 厂商 API 抽象
///
/// 除 `lock_device_api`/`unlock_device_api` 外，所有修改或检查设备状态的
/// 调用都必须在 [`crate::gate::ApiGate`] 持锁状态下进行。
pub trait VendorApi: Send + Sync {
    /// 打开 API（每进程一次）
    fn open(&self) -> Result<(), VendorError>;

    /// 关闭 API
    fn close(&self) -> Result<(), VendorError>;

    /// 服务端 API 版本
    fn api_version(&self) -> Result<f32, VendorError>;

    /// 厂商全局锁（不可重入，重入由 gate 负责）
    fn lock_device_api(&self);
    fn unlock_device_api(&self);

    /// 枚举当前可见设备
    fn get_devices(&self) -> Result<Vec<DeviceInfo>, VendorError>;

    /// 选定设备：`info` 携带期望的 duo 模式/调谐器，成功后 `handle` 生效
    fn select_device(&self, info: &mut DeviceInfo) -> Result<(), VendorError>;

    /// 释放设备
    fn release_device(&self, info: &DeviceInfo) -> Result<(), VendorError>;

    /// 选定后的初始参数快照
    fn get_device_params(&self, dev: DeviceHandle) -> Result<DeviceParams, VendorError>;

    /// 注册回调并启动采样（下发完整参数快照）
    fn init(
        &self,
        dev: DeviceHandle,
        params: &DeviceParams,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> Result<(), VendorError>;

    /// 停止采样。RSPduo 从机仍在运行时返回 [`VendorError::StopPending`]。
    fn uninit(&self, dev: DeviceHandle) -> Result<(), VendorError>;

    /// 参数更新：下发快照并声明变更原因
    fn update(
        &self,
        dev: DeviceHandle,
        tuner: TunerSelect,
        params: &DeviceParams,
        reason: UpdateReason,
        ext: UpdateExt1,
    ) -> Result<(), VendorError>;

    /// RSPduo 单调谐器模式下切换活动调谐器（流运行中）
    fn swap_duo_active_tuner(
        &self,
        dev: DeviceHandle,
        current: TunerSelect,
        am_port: AmPort,
    ) -> Result<TunerSelect, VendorError>;
}
