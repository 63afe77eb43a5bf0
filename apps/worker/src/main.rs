//! SDRplay worker 子进程入口
//!
//! 由代理 exec 启动：`sdrplay_worker --sdrplay-worker --cmd-fd <n>
//! --status-fd <n> --shm-name <name> --serial <serial>`。描述符从父进程
//! 继承，共享环由代理预先创建，这里只打开。

use anyhow::{Context, bail};
use clap::Parser;
use tracing::info;

use rsp_driver::DeviceArgs;
use rsp_ipc::{IpcPipe, SharedRing};
use rsp_proxy::worker::{DeviceFactory, Worker};

/// SDRplay worker 子进程
///
/// 持有恰好一个厂商设备会话，把 CF32 样本发布进共享内存环，
/// 经控制管道接受代理的命令。
#[derive(Parser, Debug)]
#[command(name = "sdrplay_worker")]
#[command(about = "SDRplay worker subprocess - owns one RSP device for a proxy", long_about = None)]
struct Args {
    /// worker 模式标记（由代理固定传入）
    #[arg(long = "sdrplay-worker")]
    worker_mode: bool,

    /// 命令管道读端描述符（从父进程继承）
    #[arg(long = "cmd-fd")]
    cmd_fd: i32,

    /// 状态管道写端描述符（从父进程继承）
    #[arg(long = "status-fd")]
    status_fd: i32,

    /// 共享内存环名（代理已创建）
    #[arg(long = "shm-name")]
    shm_name: String,

    /// 设备序列号
    #[arg(long = "serial")]
    serial: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if !args.worker_mode {
        bail!("not started in worker mode (missing --sdrplay-worker)");
    }
    if args.cmd_fd < 0 || args.status_fd < 0 {
        bail!("invalid pipe descriptors");
    }

    // 子进程绝不能再进代理模式
    // SAFETY: 单线程阶段（main 起点）修改环境
    unsafe { std::env::remove_var("SOAPY_SDRPLAY_MULTIDEV") };

    info!("worker starting for serial {}", args.serial);

    // SAFETY: 描述符由父进程传入且此后归本进程所有
    let cmd_pipe = unsafe { IpcPipe::from_raw_fd(args.cmd_fd) }
        .context("failed to wrap command pipe descriptor")?;
    let status_pipe = unsafe { IpcPipe::from_raw_fd(args.status_fd) }
        .context("failed to wrap status pipe descriptor")?;

    let ring = SharedRing::open(&args.shm_name)
        .with_context(|| format!("failed to open shared memory {}", args.shm_name))?;

    let factory: DeviceFactory =
        Box::new(|device_args: &DeviceArgs| rsp_proxy::registry::make_local(device_args));

    let mut device_args = DeviceArgs::new();
    device_args.insert("driver".to_string(), "sdrplay".to_string());
    device_args.insert("serial".to_string(), args.serial.clone());

    let mut worker = Worker::new(cmd_pipe, status_pipe, ring, factory, device_args);
    std::process::exit(worker.run());
}
