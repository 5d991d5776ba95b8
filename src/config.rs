//! 内核配置模块

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// 页大小（字节）
pub const PAGE_SIZE: u32 = 4096;

/// 用户/内核地址空间分界: 低于此地址的才是用户空间
pub const PHYS_BASE: u32 = 0xC000_0000;

/// 内存布局配置
#[derive(Deserialize, Debug, Clone)]
pub struct MemoryConfig {
    /// 每个进程初始映射的用户栈页数
    pub stack_pages: u32,
}

/// 调试配置
#[derive(Deserialize, Debug, Clone)]
pub struct DebugConfig {
    /// 在每次系统调用分发时输出 trace 日志
    #[serde(default)]
    pub trace_syscalls: bool,
}

/// 内核主配置（来自 profile/config.toml）
#[derive(Deserialize, Debug, Clone)]
pub struct KernelConfig {
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

impl KernelConfig {
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<KernelConfig> {
        let toml_str = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref().as_os_str()))?;
        let config: KernelConfig = toml::from_str(&toml_str)
            .with_context(|| format!("无法解析配置文件: {:?}", path.as_ref().as_os_str()))?;
        anyhow::Ok(config)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            memory: MemoryConfig { stack_pages: 8 },
            debug: DebugConfig {
                trace_syscalls: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_toml() {
        let config: KernelConfig = toml::from_str(
            "[memory]\nstack_pages = 4\n\n[debug]\ntrace_syscalls = true\n",
        )
        .unwrap();
        assert_eq!(config.memory.stack_pages, 4);
        assert!(config.debug.trace_syscalls);
    }

    #[test]
    fn trace_syscalls_defaults_off() {
        let config: KernelConfig = toml::from_str("[memory]\nstack_pages = 8\n\n[debug]\n").unwrap();
        assert!(!config.debug.trace_syscalls);
    }
}
