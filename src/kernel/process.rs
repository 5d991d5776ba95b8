//! 进程管理模块
//!
//! 进程即一条宿主线程: exec 启动, wait 汇合, 一切终止路径
//! 都汇入 exit_current 统一收尾

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Once};

use tracing::{debug, error, info};

use super::fd::FdTable;
use super::memory::UserMemory;
use super::syscall::nr;
use super::trap::{SYSCALL_VEC, TrapFlow, TrapFrame};
use crate::config::PHYS_BASE;
use crate::kernel::Kernel;

/// 进程标识
pub type Pid = u32;

/// 用户程序入口: 以 UserProc 为执行环境的可登记闭包
pub type Program = Arc<dyn Fn(&mut UserProc) + Send + Sync>;

/// 父子共享的退出信息
///
/// 子进程发布退出状态, 父进程的 wait 在这里阻塞;
/// 双方都不再持有时整个结构随 Arc 消亡
pub struct ExitInfo {
    status: Mutex<Option<i32>>,
    exited: Condvar,
}

impl ExitInfo {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(None),
            exited: Condvar::new(),
        })
    }

    /// 发布退出状态并唤醒等待者
    fn publish(&self, status: i32) {
        let mut slot = self.status.lock().unwrap();
        *slot = Some(status);
        self.exited.notify_all();
    }

    /// 阻塞直到退出状态可读
    pub fn wait(&self) -> i32 {
        let mut slot = self.status.lock().unwrap();
        loop {
            if let Some(status) = *slot {
                return status;
            }
            slot = self.exited.wait(slot).unwrap();
        }
    }
}

/// 父进程记录的子进程条目, 成功 wait 一次后即被消费
struct Child {
    pid: Pid,
    info: Arc<ExitInfo>,
}

/// 进程控制块
pub struct Process {
    pid: Pid,
    name: String,
    /// 本进程的用户地址空间, 只有本进程的系统调用路径会碰它
    memory: Mutex<UserMemory>,
    /// 本进程独占的文件描述符表
    fd_table: Mutex<FdTable>,
    /// 自己的退出信息, 与父进程共享
    wait_info: Arc<ExitInfo>,
    /// 尚未被 wait 消费的子进程
    children: Mutex<Vec<Child>>,
}

impl Process {
    fn new(pid: Pid, name: &str, stack_pages: u32) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: name.to_string(),
            memory: Mutex::new(UserMemory::with_stack(stack_pages)),
            fd_table: Mutex::new(FdTable::new()),
            wait_info: ExitInfo::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn memory(&self) -> &Mutex<UserMemory> {
        &self.memory
    }

    pub(super) fn fd_table(&self) -> &Mutex<FdTable> {
        &self.fd_table
    }
}

/// 从命令行启动新进程, 程序名取第一个词
///
/// 装载失败(程序未登记、线程资源耗尽)直接返回 None 且无副作用,
/// 调用返回时装载成败已有定论
pub fn execute(
    kernel: &Arc<Kernel>,
    parent: Option<&Arc<Process>>,
    cmdline: &str,
) -> Option<(Pid, Arc<ExitInfo>)> {
    let name = cmdline.split_whitespace().next().unwrap_or("");
    let program = kernel.lookup_program(name)?;

    let pid = kernel.allocate_pid();
    let proc = Process::new(pid, name, kernel.config().memory.stack_pages);
    let info = proc.wait_info.clone();

    info!(pid, process = name, cmdline, "启动进程");
    spawn_user_thread(kernel, proc, program, cmdline.to_string()).ok()?;

    if let Some(parent) = parent {
        parent.children.lock().unwrap().push(Child {
            pid,
            info: info.clone(),
        });
    }
    Some((pid, info))
}

/// 等待子进程终止并取回退出状态
///
/// pid 不是自己尚未 wait 过的子进程时立即返回 -1;
/// 子进程条目被消费, 对同一 pid 的第二次 wait 返回 -1
pub fn wait(proc: &Arc<Process>, pid: Pid) -> i32 {
    let child = {
        let mut children = proc.children.lock().unwrap();
        let idx = match children.iter().position(|c| c.pid == pid) {
            Some(idx) => idx,
            None => return -1,
        };
        children.remove(idx)
    };
    child.info.wait()
}

/// 统一终止路径: 打印退出行, 清空描述符表, 最后发布退出状态
///
/// 任何终止方式 —— 正常 exit 或致命错误 —— 都必须走到这里
pub fn exit_current(kernel: &Arc<Kernel>, proc: &Arc<Process>, status: i32) {
    kernel.console_write(format!("{}: exit({})\n", proc.name(), status).as_bytes());

    // 回收打开文件同样是文件系统操作, 一样串行化
    {
        let _fs = kernel.filesys_lock();
        let drained = proc.fd_table.lock().unwrap().drain_all();
        if drained > 0 {
            debug!(process = %proc.name(), drained, "回收打开文件");
        }
    }

    proc.wait_info.publish(status);
    debug!(process = %proc.name(), status, "进程终止");
}

/// 断电: 通知电源设备并收尾当前进程, 不打印退出行
pub fn power_off(kernel: &Arc<Kernel>, proc: &Arc<Process>) {
    info!(process = %proc.name(), "系统断电");
    kernel.power_shutdown();
    {
        let _fs = kernel.filesys_lock();
        proc.fd_table.lock().unwrap().drain_all();
    }
    proc.wait_info.publish(0);
}

/// 终止用户线程的回卷载荷, 内核侧清理完成之后才使用
struct Killed;

/// 安装一次性 panic 钩子, 静默 Killed 回卷
fn install_kill_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            if panic_info.payload().downcast_ref::<Killed>().is_none() {
                previous(panic_info);
            }
        }));
    });
}

fn spawn_user_thread(
    kernel: &Arc<Kernel>,
    proc: Arc<Process>,
    program: Program,
    cmdline: String,
) -> std::io::Result<()> {
    install_kill_hook();
    let kernel_for_thread = kernel.clone();
    let handle = std::thread::Builder::new()
        .name(format!("user-{}", proc.name()))
        .spawn(move || run_user(kernel_for_thread, proc, program, cmdline))?;
    kernel.track_thread(handle);
    Ok(())
}

/// 用户线程主体: 程序正常返回等价于 exit(0)
fn run_user(kernel: Arc<Kernel>, proc: Arc<Process>, program: Program, cmdline: String) {
    let mut uproc = UserProc::new(kernel.clone(), proc.clone(), cmdline);
    match panic::catch_unwind(AssertUnwindSafe(|| program(&mut uproc))) {
        Ok(()) => exit_current(&kernel, &proc, 0),
        Err(payload) => {
            if payload.downcast_ref::<Killed>().is_none() {
                // 真正的 panic: 按致命错误收尾
                error!(process = %proc.name(), "用户程序 panic");
                exit_current(&kernel, &proc, -1);
            }
            // Killed: 内核侧清理已经完成, 线程静默结束
        }
    }
}

/// 用户态执行环境, 用户程序唯一可见的句柄
///
/// 程序通过它在自己的用户栈上摆放数据、发起陷入;
/// 进程被内核终止时由这里让线程停下
pub struct UserProc {
    kernel: Arc<Kernel>,
    proc: Arc<Process>,
    sp: u32,
    cmdline: String,
}

impl UserProc {
    fn new(kernel: Arc<Kernel>, proc: Arc<Process>, cmdline: String) -> Self {
        // 初始栈指针放在用户空间顶端下方, 留出对齐余量
        Self {
            kernel,
            proc,
            sp: PHYS_BASE - 16,
            cmdline,
        }
    }

    pub fn pid(&self) -> Pid {
        self.proc.pid()
    }

    /// 启动本进程的完整命令行
    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    /// 把一段字节压到用户栈上, 返回其用户地址（字对齐）
    pub fn stage_bytes(&mut self, data: &[u8]) -> u32 {
        let addr = self
            .sp
            .checked_sub(data.len() as u32)
            .expect("用户栈溢出")
            & !3;
        self.proc
            .memory()
            .lock()
            .unwrap()
            .write_bytes(addr, data)
            .expect("用户栈溢出");
        self.sp = addr;
        addr
    }

    /// 压入以 NUL 结尾的字符串
    pub fn stage_str(&mut self, s: &str) -> u32 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.stage_bytes(&bytes)
    }

    /// 在用户栈上预留一段缓冲区, 返回其用户地址
    pub fn stage_buffer(&mut self, len: u32) -> u32 {
        let addr = self.sp.checked_sub(len).expect("用户栈溢出") & !3;
        self.sp = addr;
        addr
    }

    /// 读回自己内存里的一段数据
    pub fn read_bytes(&self, addr: u32, len: u32) -> Vec<u8> {
        self.proc
            .memory()
            .lock()
            .unwrap()
            .read_bytes(addr, len)
            .expect("读取自身内存失败")
    }

    /// 发起一次系统调用陷入: 参数字压栈, 陷入, 取回返回值槽
    pub fn syscall(&mut self, words: &[u32]) -> i32 {
        let saved_sp = self.sp;
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let esp = self.stage_bytes(&bytes);
        let result = self.syscall_at(esp);
        // 调用约定: 参数由调用方回收
        self.sp = saved_sp;
        result
    }

    /// 以指定的栈指针发起陷入（栈指针是进程自己声称的, 内核负责怀疑）
    pub fn syscall_at(&mut self, esp: u32) -> i32 {
        let mut frame = TrapFrame::new(esp);
        let flow = self
            .kernel
            .trap_table
            .dispatch(&self.kernel, &self.proc, SYSCALL_VEC, &mut frame);
        match flow {
            TrapFlow::Resume => frame.eax as i32,
            TrapFlow::Exit => panic::panic_any(Killed),
        }
    }

    // 以下为用户库风格的按名封装

    pub fn halt(&mut self) -> ! {
        self.syscall(&[nr::SYS_HALT]);
        unreachable!("halt 不会返回")
    }

    pub fn exit(&mut self, status: i32) -> ! {
        self.syscall(&[nr::SYS_EXIT, status as u32]);
        unreachable!("exit 不会返回")
    }

    pub fn exec(&mut self, cmdline: &str) -> i32 {
        let ptr = self.stage_str(cmdline);
        self.syscall(&[nr::SYS_EXEC, ptr])
    }

    pub fn wait(&mut self, pid: i32) -> i32 {
        self.syscall(&[nr::SYS_WAIT, pid as u32])
    }

    pub fn practice(&mut self, n: i32) -> i32 {
        self.syscall(&[nr::SYS_PRACTICE, n as u32])
    }

    pub fn create(&mut self, name: &str, initial_size: u32) -> bool {
        let ptr = self.stage_str(name);
        self.syscall(&[nr::SYS_CREATE, ptr, initial_size]) != 0
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let ptr = self.stage_str(name);
        self.syscall(&[nr::SYS_REMOVE, ptr]) != 0
    }

    pub fn open(&mut self, name: &str) -> i32 {
        let ptr = self.stage_str(name);
        self.syscall(&[nr::SYS_OPEN, ptr])
    }

    pub fn filesize(&mut self, fileno: i32) -> i32 {
        self.syscall(&[nr::SYS_FILESIZE, fileno as u32])
    }

    /// 裸指针版 read, 缓冲区地址由调用方给出
    pub fn read(&mut self, fileno: i32, buffer: u32, size: u32) -> i32 {
        self.syscall(&[nr::SYS_READ, fileno as u32, buffer, size])
    }

    /// 裸指针版 write, 缓冲区地址由调用方给出
    pub fn write(&mut self, fileno: i32, buffer: u32, size: u32) -> i32 {
        self.syscall(&[nr::SYS_WRITE, fileno as u32, buffer, size])
    }

    /// 把数据先摆上用户栈再 write
    pub fn write_buf(&mut self, fileno: i32, data: &[u8]) -> i32 {
        let ptr = self.stage_bytes(data);
        self.write(fileno, ptr, data.len() as u32)
    }

    pub fn seek(&mut self, fileno: i32, position: u32) -> i32 {
        self.syscall(&[nr::SYS_SEEK, fileno as u32, position])
    }

    pub fn tell(&mut self, fileno: i32) -> i32 {
        self.syscall(&[nr::SYS_TELL, fileno as u32])
    }

    pub fn close(&mut self, fileno: i32) -> i32 {
        self.syscall(&[nr::SYS_CLOSE, fileno as u32])
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::testing::bench;

    #[test]
    fn exec_then_wait_returns_child_status() {
        let bench = bench();
        bench.kernel.register_program("child-seven", |u| {
            u.exit(7);
        });
        let status = bench.run_program(|u| {
            let pid = u.exec("child-seven");
            if pid < 1 {
                u.exit(90);
            }
            let first = u.wait(pid);
            if first != 7 {
                u.exit(91);
            }
            // 同一子进程第二次 wait 返回 -1
            let second = u.wait(pid);
            if second != -1 {
                u.exit(92);
            }
            u.exit(0);
        });
        assert_eq!(status, 0);
        assert!(bench.console_text().contains("child-seven: exit(7)"));
    }

    #[test]
    fn exec_missing_program_returns_minus_one() {
        let bench = bench();
        let status = bench.run_program(|u| {
            let pid = u.exec("no-such-program");
            u.exit(pid);
        });
        assert_eq!(status, -1);
    }

    #[test]
    fn exec_passes_full_cmdline() {
        let bench = bench();
        bench.kernel.register_program("echo-args", |u| {
            if u.cmdline() == "echo-args one two" {
                u.exit(0);
            }
            u.exit(1);
        });
        let status = bench.run_program(|u| {
            let pid = u.exec("echo-args one two");
            let status = u.wait(pid);
            u.exit(status);
        });
        assert_eq!(status, 0);
    }

    #[test]
    fn wait_on_unrelated_pid_returns_immediately() {
        let bench = bench();
        let status = bench.run_program(|u| {
            if u.wait(12345) != -1 {
                u.exit(1);
            }
            u.exit(0);
        });
        assert_eq!(status, 0);
    }

    #[test]
    fn parent_observes_fatal_child_status() {
        let bench = bench();
        bench.kernel.register_program("bad-child", |u| {
            let buffer = u.stage_buffer(8);
            // fileno 5 从未打开: 致命
            u.read(5, buffer, 4);
            u.exit(0);
        });
        let status = bench.run_program(|u| {
            let pid = u.exec("bad-child");
            let status = u.wait(pid);
            u.exit(status);
        });
        assert_eq!(status, -1);
        assert!(bench.console_text().contains("bad-child: exit(-1)"));
    }

    #[test]
    fn implicit_exit_when_program_returns() {
        let bench = bench();
        let status = bench.run_program(|u| {
            u.practice(1);
        });
        assert_eq!(status, 0);
        assert!(bench.console_text().contains("test-main: exit(0)"));
    }

    #[test]
    fn halt_powers_off_without_exit_line() {
        let bench = bench();
        let status = bench.run_program(|u| {
            u.halt();
        });
        assert_eq!(status, 0);
        assert!(bench.power.lock().unwrap().off);
        assert!(!bench.console_text().contains("exit("));
    }

    #[test]
    fn children_run_concurrently_with_serialized_file_ops() {
        let bench = bench();
        bench.kernel.register_program("writer", |u| {
            // 程序名后的参数选出各自的文件前缀
            let tag = u.cmdline().split_whitespace().nth(1).unwrap_or("x").to_string();
            for i in 0..10 {
                let name = format!("{}-{}.txt", tag, i);
                if !u.create(&name, 0) {
                    u.exit(1);
                }
                let fileno = u.open(&name);
                if u.write_buf(fileno, tag.as_bytes()) != tag.len() as i32 {
                    u.exit(2);
                }
                u.close(fileno);
            }
            u.exit(0);
        });
        let status = bench.run_program(|u| {
            let a = u.exec("writer alpha");
            let b = u.exec("writer beta");
            if u.wait(a) != 0 || u.wait(b) != 0 {
                u.exit(1);
            }
            // 两边的效果都完整存在, 相当于某个串行顺序
            for i in 0..10 {
                for tag in ["alpha", "beta"] {
                    let name = format!("{}-{}.txt", tag, i);
                    let fileno = u.open(&name);
                    if u.filesize(fileno) != tag.len() as i32 {
                        u.exit(2);
                    }
                    u.close(fileno);
                }
            }
            u.exit(0);
        });
        assert_eq!(status, 0);
    }
}
