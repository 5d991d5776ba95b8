//! 教学操作系统的系统调用边界层
//!
//! 接收用户进程的陷入, 校验其声称的一切, 再分发到受信任的
//! 内核操作; 调度、页表、磁盘文件系统与控制台驱动都是外部协作者

pub mod config;
pub mod filesys;
pub mod kernel;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use config::KernelConfig;
use console::{HostConsole, HostKeyboard, HostPower};
use filesys::RamFileSystem;
use kernel::{Devices, Kernel};

/// 教学 OS 系统调用层
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 初始程序命令行
    #[arg(short, long, default_value = "demo")]
    pub program: String,

    /// 配置文件地址
    #[arg(short, long, default_value = "profile/config.toml")]
    pub config: String,
}

/// 构建内核并阻塞运行初始程序
pub fn build_kernel_run_blocking(args: Args) -> Result<()> {
    let prj_base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let arg_cfg_path = PathBuf::from(&args.config);
    let config_path = if arg_cfg_path.is_absolute() {
        arg_cfg_path
    } else {
        prj_base.join(&args.config)
    };
    let config = KernelConfig::new(config_path)?;

    let devices = Devices {
        console: Arc::new(Mutex::new(HostConsole)),
        keyboard: Arc::new(Mutex::new(HostKeyboard)),
        power: Arc::new(Mutex::new(HostPower)),
    };
    let kernel = Kernel::new(config, Box::new(RamFileSystem::new()), devices);
    register_demo_programs(&kernel);

    let status = kernel::run(&kernel, &args.program)
        .with_context(|| format!("无法装载初始程序 '{}'", args.program))?;
    info!(status, "初始程序退出");
    Ok(())
}

/// 登记演示程序
fn register_demo_programs(kernel: &Arc<Kernel>) {
    // demo: 练习调用、文件读写、派生子进程并等待
    kernel.register_program("demo", |u| {
        u.write_buf(1, b"demo: boot\n");
        if u.practice(41) != 42 {
            u.exit(1);
        }

        u.create("scratch.txt", 0);
        let fileno = u.open("scratch.txt");
        u.write_buf(fileno, b"hello, filesystem\n");
        u.seek(fileno, 0);
        let buffer = u.stage_buffer(32);
        let n = u.read(fileno, buffer, 18);
        let text = u.read_bytes(buffer, n as u32);
        u.write_buf(1, &text);
        u.close(fileno);

        let pid = u.exec("greeter");
        let status = u.wait(pid);
        let line = format!("demo: greeter exited with {}\n", status);
        u.write_buf(1, line.as_bytes());
        u.exit(0);
    });

    // greeter: 被 demo 派生的子进程
    kernel.register_program("greeter", |u| {
        u.write_buf(1, b"hello from child\n");
        u.exit(0);
    });
}
