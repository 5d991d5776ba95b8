//! 硬件协作者 trait 定义
//!
//! 内核通过这里的 trait 使用控制台、键盘与电源,
//! 具体实现由设备 crate 或测试桩提供

use thiserror::Error;

/// 设备错误类型
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("设备访问错误: {0}")]
    Access(String),
    #[error("设备不支持的操作: {0}")]
    Unsupported(String),
}

/// 控制台输出设备 trait
pub trait ConsoleDevice: Send {
    /// 将整段缓冲区写到控制台
    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// 获取设备名称（用于调试）
    fn name(&self) -> &str {
        "console"
    }
}

/// 键盘输入设备 trait
pub trait KeyboardDevice: Send {
    /// 阻塞读取一个字节
    fn getc(&mut self) -> Result<u8, DeviceError>;

    /// 获取设备名称（用于调试）
    fn name(&self) -> &str {
        "keyboard"
    }
}

/// 电源控制设备 trait
pub trait PowerDevice: Send {
    /// 切断整机电源
    fn shutdown(&mut self);

    /// 获取设备名称（用于调试）
    fn name(&self) -> &str {
        "power"
    }
}
