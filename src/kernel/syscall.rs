//! 系统调用边界模块
//!
//! 内核唯一的安全边界: 进程声称的一切都要先证明无害,
//! 才能分发到受信任的内核操作

use std::sync::{Arc, MutexGuard};

use thiserror::Error;
use tracing::{trace, warn};

use super::fd::{STDIN_FILENO, STDOUT_FILENO};
use super::memory::{MemoryError, UserMemory};
use super::process::{self, Process};
use super::trap::{SYSCALL_VEC, TrapFlow, TrapFrame, TrapTable};
use super::uaccess;
use crate::filesys::FileSystem;
use crate::kernel::Kernel;

/// 系统调用号
pub mod nr {
    pub const SYS_HALT: u32 = 0;
    pub const SYS_EXIT: u32 = 1;
    pub const SYS_EXEC: u32 = 2;
    pub const SYS_WAIT: u32 = 3;
    pub const SYS_CREATE: u32 = 4;
    pub const SYS_REMOVE: u32 = 5;
    pub const SYS_OPEN: u32 = 6;
    pub const SYS_FILESIZE: u32 = 7;
    pub const SYS_READ: u32 = 8;
    pub const SYS_WRITE: u32 = 9;
    pub const SYS_SEEK: u32 = 10;
    pub const SYS_TELL: u32 = 11;
    pub const SYS_CLOSE: u32 = 12;
    pub const SYS_PRACTICE: u32 = 13;
}

/// 致命错误: 进程的自伤行为不做恢复, 一律以 -1 状态终止
#[derive(Debug, Error)]
pub enum Fault {
    #[error("无效用户指针: {addr:#x}")]
    InvalidPointer { addr: u32 },
    #[error("未知系统调用号: {number}")]
    UnknownSyscall { number: u32 },
    #[error("无效文件描述符: {fileno}")]
    InvalidFileno { fileno: i32 },
}

impl From<MemoryError> for Fault {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Unmapped { addr }
            | MemoryError::KernelSpace { addr }
            | MemoryError::Overflow { addr, .. } => Fault::InvalidPointer { addr },
        }
    }
}

/// 处理函数的正常返回去向
pub enum Flow {
    /// 向返回值槽写入一个结果字
    Return(i32),
    /// 进程主动退出
    Exit(i32),
    /// 整机断电
    Shutdown,
}

/// 处理函数签名
type HandlerFn = fn(&mut SyscallCtx<'_>) -> Result<Flow, Fault>;

/// 系统调用描述符: 启动时构建成查找表, 不走虚分派
pub struct SyscallDescriptor {
    pub number: u32,
    pub name: &'static str,
    handler: HandlerFn,
    /// 为真时分发器在调用前持有文件系统访问锁
    pub is_file_op: bool,
}

/// 描述符表, 编号唯一
pub static SYSCALL_TABLE: &[SyscallDescriptor] = &[
    SyscallDescriptor { number: nr::SYS_WRITE, name: "write", handler: sys_write, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_CREATE, name: "create", handler: sys_create, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_REMOVE, name: "remove", handler: sys_remove, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_OPEN, name: "open", handler: sys_open, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_FILESIZE, name: "filesize", handler: sys_filesize, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_READ, name: "read", handler: sys_read, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_SEEK, name: "seek", handler: sys_seek, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_TELL, name: "tell", handler: sys_tell, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_CLOSE, name: "close", handler: sys_close, is_file_op: true },
    SyscallDescriptor { number: nr::SYS_EXIT, name: "exit", handler: sys_exit, is_file_op: false },
    SyscallDescriptor { number: nr::SYS_PRACTICE, name: "practice", handler: sys_practice, is_file_op: false },
    SyscallDescriptor { number: nr::SYS_HALT, name: "halt", handler: sys_halt, is_file_op: false },
    SyscallDescriptor { number: nr::SYS_WAIT, name: "wait", handler: sys_wait, is_file_op: false },
    SyscallDescriptor { number: nr::SYS_EXEC, name: "exec", handler: sys_exec, is_file_op: false },
];

/// 单次系统调用的执行上下文
///
/// 文件系统锁的守卫直接放在这里: 上下文一结束锁必然释放,
/// 处理函数走致命路径时也不例外
pub struct SyscallCtx<'a> {
    kernel: &'a Arc<Kernel>,
    proc: &'a Arc<Process>,
    frame: &'a mut TrapFrame,
    mem: MutexGuard<'a, UserMemory>,
    fs: Option<MutexGuard<'a, Box<dyn FileSystem>>>,
}

impl SyscallCtx<'_> {
    /// 从用户栈读取第 idx 个字, 0 号字是调用号
    fn arg(&self, idx: u32) -> Result<u32, Fault> {
        let addr = self
            .frame
            .esp
            .checked_add(4 * idx)
            .ok_or(Fault::InvalidPointer {
                addr: self.frame.esp,
            })?;
        uaccess::read_user_word(&self.mem, addr)
    }

    /// 描述符表上漏标 is_file_op 属于内核自身的 bug
    fn filesys(&mut self) -> &mut dyn FileSystem {
        self.fs.as_mut().expect("文件系统锁未持有").as_mut()
    }
}

/// 把系统调用分发器挂接到陷入注册表
pub fn register(table: &mut TrapTable) {
    table.register(SYSCALL_VEC, "syscall", handle_trap);
}

/// 陷入入口: 解码并分发, 致命路径汇入统一终止
fn handle_trap(kernel: &Arc<Kernel>, proc: &Arc<Process>, frame: &mut TrapFrame) -> TrapFlow {
    match dispatch(kernel, proc, frame) {
        Ok(Flow::Return(value)) => {
            frame.eax = value as u32;
            TrapFlow::Resume
        }
        Ok(Flow::Exit(status)) => {
            frame.eax = status as u32;
            process::exit_current(kernel, proc, status);
            TrapFlow::Exit
        }
        Ok(Flow::Shutdown) => {
            process::power_off(kernel, proc);
            TrapFlow::Exit
        }
        Err(fault) => {
            warn!(process = %proc.name(), %fault, "系统调用致命错误");
            frame.eax = -1i32 as u32;
            process::exit_current(kernel, proc, -1);
            TrapFlow::Exit
        }
    }
}

/// 分发主体
///
/// 文件系统锁的守卫存活于上下文中, 每条出路上都会释放
fn dispatch(
    kernel: &Arc<Kernel>,
    proc: &Arc<Process>,
    frame: &mut TrapFrame,
) -> Result<Flow, Fault> {
    let mem = proc.memory().lock().unwrap();

    // 先证明栈指针本身可读: 首地址与所在字的末地址各自校验
    uaccess::check_ptr(&mem, frame.esp)?;
    let number = uaccess::read_user_word(&mem, frame.esp)?;

    let desc = SYSCALL_TABLE
        .iter()
        .find(|d| d.number == number)
        .ok_or(Fault::UnknownSyscall { number })?;

    if kernel.config().debug.trace_syscalls {
        trace!(process = %proc.name(), syscall = desc.name, "进入系统调用");
    }

    let fs = if desc.is_file_op {
        Some(kernel.filesys_lock())
    } else {
        None
    };
    let mut ctx = SyscallCtx {
        kernel,
        proc,
        frame,
        mem,
        fs,
    };
    (desc.handler)(&mut ctx)
}

/// halt: 断电, 不返回
fn sys_halt(_ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    Ok(Flow::Shutdown)
}

/// exit: 发布状态并终止, 不返回
fn sys_exit(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let status = ctx.arg(1)? as i32;
    Ok(Flow::Exit(status))
}

/// exec: 从命令行启动新进程, 装载失败返回 -1
fn sys_exec(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let cmd_ptr = ctx.arg(1)?;
    let cmdline = uaccess::read_user_str(&ctx.mem, cmd_ptr)?;
    match process::execute(ctx.kernel, Some(ctx.proc), &cmdline) {
        Some((pid, _)) => Ok(Flow::Return(pid as i32)),
        None => Ok(Flow::Return(-1)),
    }
}

/// wait: 阻塞取回子进程退出状态, 无此子进程立即返回 -1
fn sys_wait(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let pid = ctx.arg(1)?;
    Ok(Flow::Return(process::wait(ctx.proc, pid)))
}

/// practice: 纯算术, 用来验证分发路径
fn sys_practice(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let n = ctx.arg(1)? as i32;
    Ok(Flow::Return(n.wrapping_add(1)))
}

/// create: 委托文件系统新建文件
fn sys_create(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let name_ptr = ctx.arg(1)?;
    let initial_size = ctx.arg(2)?;
    let name = uaccess::read_user_str(&ctx.mem, name_ptr)?;
    let created = ctx.filesys().create(&name, initial_size);
    Ok(Flow::Return(created as i32))
}

/// remove: 委托文件系统删除文件
fn sys_remove(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let name_ptr = ctx.arg(1)?;
    let name = uaccess::read_user_str(&ctx.mem, name_ptr)?;
    let removed = ctx.filesys().remove(&name);
    Ok(Flow::Return(removed as i32))
}

/// open: 打不开是正常结果, 返回 -1 且无任何副作用
fn sys_open(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let name_ptr = ctx.arg(1)?;
    let name = uaccess::read_user_str(&ctx.mem, name_ptr)?;
    match ctx.filesys().open(&name) {
        None => Ok(Flow::Return(-1)),
        Some(file) => {
            let fileno = ctx.proc.fd_table().lock().unwrap().allocate(file);
            Ok(Flow::Return(fileno))
        }
    }
}

/// filesize: 控制台流没有大小, 0/1 一律致命
fn sys_filesize(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    if fileno == STDIN_FILENO || fileno == STDOUT_FILENO {
        return Err(Fault::InvalidFileno { fileno });
    }
    let fd_table = ctx.proc.fd_table().lock().unwrap();
    let entry = fd_table
        .get(fileno)
        .ok_or(Fault::InvalidFileno { fileno })?;
    Ok(Flow::Return(entry.file.length() as i32))
}

/// read: fileno 1 致命; fileno 0 从键盘逐字节读; 其余走查表句柄
fn sys_read(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    let buffer = ctx.arg(2)?;
    let size = ctx.arg(3)?;

    uaccess::check_buffer(&ctx.mem, buffer, size)?;
    if fileno == STDOUT_FILENO {
        return Err(Fault::InvalidFileno { fileno });
    }

    if fileno == STDIN_FILENO {
        for i in 0..size {
            let byte = ctx.kernel.keyboard_getc();
            uaccess::write_user_bytes(&mut ctx.mem, buffer + i, &[byte])?;
        }
        return Ok(Flow::Return(size as i32));
    }

    let mut fd_table = ctx.proc.fd_table().lock().unwrap();
    let entry = fd_table
        .get_mut(fileno)
        .ok_or(Fault::InvalidFileno { fileno })?;
    let mut data = vec![0u8; size as usize];
    let n = entry.file.read(&mut data);
    drop(fd_table);
    uaccess::write_user_bytes(&mut ctx.mem, buffer, &data[..n as usize])?;
    Ok(Flow::Return(n as i32))
}

/// write: fileno 0 致命; fileno 1 整段直写控制台; 其余走查表句柄
fn sys_write(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    let buffer = ctx.arg(2)?;
    let size = ctx.arg(3)?;

    uaccess::check_buffer(&ctx.mem, buffer, size)?;
    if fileno == STDIN_FILENO {
        return Err(Fault::InvalidFileno { fileno });
    }

    let data = uaccess::read_user_bytes(&ctx.mem, buffer, size)?;
    if fileno == STDOUT_FILENO {
        ctx.kernel.console_write(&data);
        return Ok(Flow::Return(size as i32));
    }

    let mut fd_table = ctx.proc.fd_table().lock().unwrap();
    let entry = fd_table
        .get_mut(fileno)
        .ok_or(Fault::InvalidFileno { fileno })?;
    Ok(Flow::Return(entry.file.write(&data) as i32))
}

/// seek: 查表必须先于解引用, 查不到同样致命
fn sys_seek(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    let position = ctx.arg(2)?;
    let mut fd_table = ctx.proc.fd_table().lock().unwrap();
    let entry = fd_table
        .get_mut(fileno)
        .ok_or(Fault::InvalidFileno { fileno })?;
    entry.file.seek(position);
    Ok(Flow::Return(0))
}

/// tell: 返回当前读写位置
fn sys_tell(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    let fd_table = ctx.proc.fd_table().lock().unwrap();
    let entry = fd_table
        .get(fileno)
        .ok_or(Fault::InvalidFileno { fileno })?;
    Ok(Flow::Return(entry.file.tell() as i32))
}

/// close: 释放表项并关闭底层句柄
fn sys_close(ctx: &mut SyscallCtx) -> Result<Flow, Fault> {
    let fileno = ctx.arg(1)? as i32;
    let mut fd_table = ctx.proc.fd_table().lock().unwrap();
    if fd_table.release(fileno).is_none() {
        return Err(Fault::InvalidFileno { fileno });
    }
    Ok(Flow::Return(0))
}
