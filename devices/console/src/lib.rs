//! 主机端设备实现
//!
//! 把标准输入输出当作机器的控制台与键盘

use hal_trait::{ConsoleDevice, DeviceError, KeyboardDevice, PowerDevice};
use std::io::{self, Read, Write};

/// 标准输出控制台
pub struct HostConsole;

impl ConsoleDevice for HostConsole {
    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let mut out = io::stdout();
        out.write_all(data)
            .and_then(|_| out.flush())
            .map_err(|e| DeviceError::Access(format!("标准输出写入失败: {}", e)))
    }

    fn name(&self) -> &str {
        "host-console"
    }
}

/// 标准输入键盘
pub struct HostKeyboard;

impl KeyboardDevice for HostKeyboard {
    fn getc(&mut self) -> Result<u8, DeviceError> {
        let mut byte = [0u8; 1];
        match io::stdin().read(&mut byte) {
            // EOF 时返回 NUL
            Ok(0) => Ok(0),
            Ok(_) => Ok(byte[0]),
            Err(e) => Err(DeviceError::Access(format!("标准输入读取失败: {}", e))),
        }
    }

    fn name(&self) -> &str {
        "host-keyboard"
    }
}

/// 主机上没有真正的电源可断, 只记录断电请求
pub struct HostPower;

impl PowerDevice for HostPower {
    fn shutdown(&mut self) {
        tracing::info!("电源关闭");
    }

    fn name(&self) -> &str {
        "host-power"
    }
}
