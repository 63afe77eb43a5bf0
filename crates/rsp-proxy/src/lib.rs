//! 进程外设备隔离
//!
//! sdrplay 服务无法可靠地在一个进程里伺候多台设备：worker 子进程独占
//! 厂商句柄并把样本写进共享内存环，代理在宿主进程里呈现同一套设备接口。
//!
//! - [`worker`]：子进程命令循环 + 采样线程 + 进程生成/终止
//! - [`proxy`]：宿主侧设备门面（停滞检测与 worker 重启）
//! - [`registry`]：`enumerate`/`make` 入口，按环境变量决定直连或代理

pub mod proxy;
pub mod registry;
pub mod worker;

pub use proxy::ProxyDevice;
pub use registry::{enumerate, install_vendor_api, make, make_local, multidev_forced};
pub use worker::{Worker, WorkerSpawner};
