//! SDRplay 厂商 API 抽象层
//!
//! 厂商库（sdrplay_api 服务）是进程级全局资源，本 crate 提供：
//! - `VendorApi` trait：对厂商调用的统一抽象（真实 FFI 后端在树外实现）
//! - `ApiGate`：进程级可重入串行化 + 调用超时 + 服务健康跟踪
//! - 参数记录（设备级 / 通道级），由会话持有快照、经 `update()` 下发
//! - `MockVendorApi`：测试用的内存厂商服务，可注入回调和故障

pub mod api;
pub mod error;
pub mod gate;
pub mod mock;
pub mod params;
pub mod types;

pub use api::{DeviceHandle, StreamCallbacks, StreamCbParams, VendorApi};
pub use error::VendorError;
pub use gate::{ApiGate, GateGuard, SDRPLAY_API_TIMEOUT_MS};
pub use params::{
    AgcParams, ChannelParams, CtrlParams, DcOffsetParams, DecimationParams, DevParams,
    DeviceParams, GainParams, Rsp1aDevParams, Rsp1aTunerParams, Rsp2DevParams, Rsp2TunerParams,
    RspDuoDevParams, RspDuoTunerParams, RspDxDevParams, TunerParams, VALID_DECIMATION_FACTORS,
};
pub use types::{
    AmPort, BwType, DeviceInfo, DuoEvent, DxAntenna, Event, HwVariant, IfType, PowerOverload,
    Rsp2Antenna, RspDuoMode, TunerSelect, UpdateExt1, UpdateReason,
};
