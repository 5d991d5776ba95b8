use anyhow::Result;
use clap::Parser;
use kernel::{Args, build_kernel_run_blocking};
use tracing::{Level, info};
use tracing_subscriber::{self, EnvFilter};

fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false) // 不显示目标模块
        .with_thread_names(true) // 用户线程以进程命名
        .init();

    // 解析命令行参数
    let args = Args::parse();

    info!(version = env!("CARGO_PKG_VERSION"), "启动系统调用层");

    build_kernel_run_blocking(args)
}
