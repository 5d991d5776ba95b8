//! 陷入分发模块
//!
//! 维护向量号到处理函数的注册表, 模拟陷入门的登记与进入

use std::sync::Arc;

use super::process::{self, Process};
use crate::kernel::Kernel;

/// 系统调用使用的陷入向量号
pub const SYSCALL_VEC: u8 = 0x30;

/// 陷入帧: 用户线程陷入内核时的寄存器快照
///
/// 分发器只读取保存的用户栈指针, 并向返回值槽写入结果字
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// 保存的用户栈指针
    pub esp: u32,
    /// 返回值槽
    pub eax: u32,
}

impl TrapFrame {
    pub fn new(esp: u32) -> Self {
        Self { esp, eax: 0 }
    }
}

/// 陷入处理结束后用户线程的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapFlow {
    /// 返回用户态继续执行
    Resume,
    /// 当前进程已销毁, 用户线程必须停止
    Exit,
}

/// 陷入处理函数
pub type TrapHandler = fn(&Arc<Kernel>, &Arc<Process>, &mut TrapFrame) -> TrapFlow;

/// 单个陷入门登记项
struct TrapEntry {
    vec_no: u8,
    name: &'static str,
    handler: TrapHandler,
}

/// 陷入注册表, 启动时构建之后不再变化
pub struct TrapTable {
    entries: Vec<TrapEntry>,
}

impl TrapTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 登记陷入向量, 向量号不得重复
    pub fn register(&mut self, vec_no: u8, name: &'static str, handler: TrapHandler) {
        debug_assert!(
            self.entries.iter().all(|e| e.vec_no != vec_no),
            "陷入向量重复登记: {vec_no:#x}"
        );
        tracing::debug!(vec_no, name, "登记陷入向量");
        self.entries.push(TrapEntry {
            vec_no,
            name,
            handler,
        });
    }

    /// 按向量号分发; 未登记的向量直接杀死触发进程
    pub fn dispatch(
        &self,
        kernel: &Arc<Kernel>,
        proc: &Arc<Process>,
        vec_no: u8,
        frame: &mut TrapFrame,
    ) -> TrapFlow {
        match self.entries.iter().find(|e| e.vec_no == vec_no) {
            Some(entry) => (entry.handler)(kernel, proc, frame),
            None => {
                tracing::warn!(vec_no, process = %proc.name(), "未登记的陷入向量");
                process::exit_current(kernel, proc, -1);
                TrapFlow::Exit
            }
        }
    }
}

impl Default for TrapTable {
    fn default() -> Self {
        Self::new()
    }
}
