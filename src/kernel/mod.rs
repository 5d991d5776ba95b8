//! 内核聚合模块
//!
//! 把陷入表、文件系统访问锁、外部设备和进程登记装配在一起

pub mod fd;
pub mod memory;
pub mod process;
pub mod syscall;
pub mod trap;
pub mod uaccess;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::config::KernelConfig;
use crate::filesys::FileSystem;
use hal_trait::{ConsoleDevice, KeyboardDevice, PowerDevice};
use process::{Pid, Program, UserProc};

/// 内核依赖的外部协作者设备
pub struct Devices {
    pub console: Arc<Mutex<dyn ConsoleDevice>>,
    pub keyboard: Arc<Mutex<dyn KeyboardDevice>>,
    pub power: Arc<Mutex<dyn PowerDevice>>,
}

/// 内核
pub struct Kernel {
    config: KernelConfig,
    /// 启动时装配完成, 之后只读
    trap_table: trap::TrapTable,
    /// 文件系统访问锁: 守卫即是锁, 锁的数据即是文件系统,
    /// 全系统所有触及文件系统的操作在这里串行化
    filesys: Mutex<Box<dyn FileSystem>>,
    devices: Devices,
    /// 可被 exec 的用户程序
    programs: Mutex<FxHashMap<String, Program>>,
    next_pid: AtomicU32,
    halted: AtomicBool,
    /// 仍需汇合的用户线程
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    /// 构建内核并把系统调用分发器挂接到陷入向量
    pub fn new(config: KernelConfig, filesys: Box<dyn FileSystem>, devices: Devices) -> Arc<Self> {
        let mut trap_table = trap::TrapTable::new();
        syscall::register(&mut trap_table);
        info!(stack_pages = config.memory.stack_pages, "内核初始化完成");
        Arc::new(Self {
            config,
            trap_table,
            filesys: Mutex::new(filesys),
            devices,
            programs: Mutex::new(FxHashMap::default()),
            next_pid: AtomicU32::new(1),
            halted: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// 登记一个可被 exec 的用户程序
    pub fn register_program(
        &self,
        name: &str,
        program: impl Fn(&mut UserProc) + Send + Sync + 'static,
    ) {
        self.programs
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(program));
    }

    /// 汇合所有仍在运行的用户线程
    pub fn join_all(&self) {
        loop {
            // 不持锁 join: 被汇合的线程还可能登记新线程
            let handle = self.threads.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }

    /// 系统是否已断电
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn lookup_program(&self, name: &str) -> Option<Program> {
        self.programs.lock().unwrap().get(name).cloned()
    }

    fn allocate_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    /// 获取文件系统访问锁（整个系统唯一的一把）
    fn filesys_lock(&self) -> MutexGuard<'_, Box<dyn FileSystem>> {
        self.filesys.lock().unwrap()
    }

    /// 控制台整段输出
    fn console_write(&self, data: &[u8]) {
        if let Err(err) = self.devices.console.lock().unwrap().write(data) {
            warn!(%err, "控制台写入失败");
        }
    }

    /// 键盘阻塞读一个字节
    fn keyboard_getc(&self) -> u8 {
        match self.devices.keyboard.lock().unwrap().getc() {
            Ok(byte) => byte,
            Err(err) => {
                warn!(%err, "键盘读取失败");
                0
            }
        }
    }

    /// 通知电源设备断电并标记内核已停机
    fn power_shutdown(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.devices.power.lock().unwrap().shutdown();
    }

    fn track_thread(&self, handle: JoinHandle<()>) {
        self.threads.lock().unwrap().push(handle);
    }
}

/// 运行初始程序直至其退出, 返回退出状态
///
/// 程序未登记时返回 None
pub fn run(kernel: &Arc<Kernel>, cmdline: &str) -> Option<i32> {
    let (_pid, info) = process::execute(kernel, None, cmdline)?;
    let status = info.wait();
    kernel.join_all();
    Some(status)
}

#[cfg(test)]
pub(crate) mod testing {
    //! 各模块测试共用的内核台架与设备桩

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use hal_trait::{ConsoleDevice, DeviceError, KeyboardDevice, PowerDevice};

    use super::process::UserProc;
    use super::{Devices, Kernel};
    use crate::config::KernelConfig;
    use crate::filesys::RamFileSystem;

    /// 记录输出的控制台
    pub struct MockConsole {
        pub data: Vec<u8>,
    }

    impl ConsoleDevice for MockConsole {
        fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
            self.data.extend_from_slice(data);
            Ok(())
        }

        fn name(&self) -> &str {
            "mock-console"
        }
    }

    /// 预置按键序列的键盘, 读尽后一直返回 0
    pub struct ScriptedKeyboard {
        pub keys: VecDeque<u8>,
    }

    impl KeyboardDevice for ScriptedKeyboard {
        fn getc(&mut self) -> Result<u8, DeviceError> {
            Ok(self.keys.pop_front().unwrap_or(0))
        }

        fn name(&self) -> &str {
            "scripted-keyboard"
        }
    }

    /// 记录断电请求的电源
    pub struct MockPower {
        pub off: bool,
    }

    impl PowerDevice for MockPower {
        fn shutdown(&mut self) {
            self.off = true;
        }

        fn name(&self) -> &str {
            "mock-power"
        }
    }

    /// 测试台架: 内核加上可观察的设备桩
    pub struct TestBench {
        pub kernel: Arc<Kernel>,
        pub console: Arc<Mutex<MockConsole>>,
        pub power: Arc<Mutex<MockPower>>,
    }

    impl TestBench {
        /// 以 test-main 为名登记并运行一个程序, 返回其退出状态
        pub fn run_program(&self, program: impl Fn(&mut UserProc) + Send + Sync + 'static) -> i32 {
            self.kernel.register_program("test-main", program);
            super::run(&self.kernel, "test-main").expect("test-main 已登记")
        }

        /// 到目前为止控制台收到的全部文本
        pub fn console_text(&self) -> String {
            String::from_utf8_lossy(&self.console.lock().unwrap().data).into_owned()
        }
    }

    pub fn bench() -> TestBench {
        bench_with_keys(&[])
    }

    pub fn bench_with_keys(keys: &[u8]) -> TestBench {
        let console = Arc::new(Mutex::new(MockConsole { data: Vec::new() }));
        let keyboard = Arc::new(Mutex::new(ScriptedKeyboard {
            keys: keys.iter().copied().collect(),
        }));
        let power = Arc::new(Mutex::new(MockPower { off: false }));
        let devices = Devices {
            console: console.clone(),
            keyboard,
            power: power.clone(),
        };
        let kernel = Kernel::new(
            KernelConfig::default(),
            Box::new(RamFileSystem::new()),
            devices,
        );
        TestBench {
            kernel,
            console,
            power,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::bench;

    #[test]
    fn run_unregistered_program_is_none() {
        let bench = bench();
        assert!(super::run(&bench.kernel, "ghost").is_none());
    }

    #[test]
    fn halt_marks_kernel_halted() {
        let bench = bench();
        assert!(!bench.kernel.is_halted());
        bench.run_program(|u| u.halt());
        assert!(bench.kernel.is_halted());
    }
}
