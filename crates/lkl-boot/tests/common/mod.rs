#![allow(dead_code)]

use lkl_boot::kernel::NR_REBOOT;
use lkl_boot::{
    fs_setup, Binfmt, BootParams, ExecImage, GuestKernel, InitBinfmt, LinuxBinprm, Personality,
    INIT_PATH,
};
use lkl_host::{HostOps, HostThreadId, LklError};

use std::sync::{Arc, Condvar, Mutex, Weak};

pub const NR_GETPID: i64 = 172;
const ENOSYS: i64 = 38;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted guest kernel.
///
/// `start_kernel` runs the late-init filesystem setup, starts an init task on its own host
/// thread that execs `/init` through the registered handlers, then idles until the reboot
/// syscall arrives. Every entry point appends to an event log.
pub struct FakeKernel {
    me: Weak<FakeKernel>,
    host: Arc<dyn HostOps>,
    events: Mutex<Vec<String>>,
    binfmts: Mutex<Vec<Arc<dyn Binfmt>>>,
    params: Mutex<Option<BootParams>>,
    files: Mutex<Vec<(String, u32)>>,
    init_thread: Mutex<Option<HostThreadId>>,
    cpu_owner: Mutex<Option<HostThreadId>>,
    shutdown: Mutex<bool>,
    shutdown_cond: Condvar,
    probe: Mutex<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
    probed: Mutex<Vec<bool>>,

    pub init_path: Mutex<String>,
    pub cpu_init_error: Mutex<Option<i32>>,
    pub reboot_error: Mutex<Option<i64>>,
    pub create_file_error: Mutex<Option<i32>>,
    pub flush_error: Mutex<Option<i32>>,
}

impl FakeKernel {
    pub fn new(host: Arc<dyn HostOps>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host,
            events: Mutex::new(Vec::new()),
            binfmts: Mutex::new(Vec::new()),
            params: Mutex::new(None),
            files: Mutex::new(Vec::new()),
            init_thread: Mutex::new(None),
            cpu_owner: Mutex::new(None),
            shutdown: Mutex::new(false),
            shutdown_cond: Condvar::new(),
            probe: Mutex::new(None),
            probed: Mutex::new(Vec::new()),
            init_path: Mutex::new(INIT_PATH.to_string()),
            cpu_init_error: Mutex::new(None),
            reboot_error: Mutex::new(None),
            create_file_error: Mutex::new(None),
            flush_error: Mutex::new(None),
        })
    }

    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn params(&self) -> Option<BootParams> {
        self.params.lock().unwrap().clone()
    }

    pub fn files(&self) -> Vec<(String, u32)> {
        self.files.lock().unwrap().clone()
    }

    pub fn cpu_owner(&self) -> Option<HostThreadId> {
        *self.cpu_owner.lock().unwrap()
    }

    pub fn binfmt_names(&self) -> Vec<&'static str> {
        self.binfmts.lock().unwrap().iter().map(|b| b.name()).collect()
    }

    /// Evaluate `probe` on the init task right before it execs.
    pub fn set_probe(&self, probe: impl Fn() -> bool + Send + Sync + 'static) {
        *self.probe.lock().unwrap() = Some(Box::new(probe));
    }

    pub fn probed(&self) -> Vec<bool> {
        self.probed.lock().unwrap().clone()
    }

    /// Exec `path` on the calling thread, trying each registered handler in turn.
    pub fn exec(&self, path: &str) {
        let bprm = LinuxBinprm::new(path);
        let binfmts = self.binfmts.lock().unwrap().clone();
        let mut image = FakeImage { kernel: self };
        for binfmt in binfmts {
            match binfmt.load_binary(self, &bprm, &mut image) {
                Ok(()) => return,
                Err(LklError::InvalidExecutable(_)) => continue,
                Err(err) => {
                    self.record(format!("exec {path} failed: {err}"));
                    return;
                }
            }
        }
        self.record(format!("exec {path}: no handler"));
    }

    fn run_init(&self) {
        if let Some(probe) = self.probe.lock().unwrap().as_ref() {
            self.probed.lock().unwrap().push(probe());
        }
        let path = self.init_path.lock().unwrap().clone();
        self.exec(&path);
    }
}

impl GuestKernel for FakeKernel {
    fn cpu_init(&self) -> Result<(), i32> {
        self.record("cpu_init");
        match *self.cpu_init_error.lock().unwrap() {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn start_kernel(&self, params: BootParams, init: Arc<InitBinfmt>) {
        self.record("start_kernel");
        *self.params.lock().unwrap() = Some(params);
        *self.shutdown.lock().unwrap() = false;

        fs_setup(self, init);

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let tid = self.host.thread_create(Box::new(move || me.run_init()));
        *self.init_thread.lock().unwrap() = tid;

        let mut shutdown = self.shutdown.lock().unwrap();
        while !*shutdown {
            shutdown = self.shutdown_cond.wait(shutdown).unwrap();
        }
        drop(shutdown);
        self.record("idle loop exit");
    }

    fn cpu_change_owner(&self, owner: HostThreadId) {
        self.record("cpu_change_owner");
        *self.cpu_owner.lock().unwrap() = Some(owner);
    }

    fn cpu_put(&self) {
        self.record("cpu_put");
    }

    fn syscall(&self, nr: i64, args: [i64; 6]) -> i64 {
        self.record(format!("syscall {nr}"));
        match nr {
            NR_REBOOT => {
                if let Some(err) = *self.reboot_error.lock().unwrap() {
                    return err;
                }
                assert_eq!(&args[..3], &[0xfee1_dead, 672_274_793, 0x0123_4567]);
                *self.shutdown.lock().unwrap() = true;
                self.shutdown_cond.notify_all();
                0
            }
            NR_GETPID => 1,
            _ => -ENOSYS,
        }
    }

    fn cpu_wait_shutdown(&self) {
        self.record("cpu_wait_shutdown");
    }

    fn syscalls_init(&self) {
        self.record("syscalls_init");
    }

    fn syscalls_cleanup(&self) {
        self.record("syscalls_cleanup");
    }

    fn threads_cleanup(&self) {
        self.record("threads_cleanup");
        if let Some(tid) = self.init_thread.lock().unwrap().take() {
            self.host.thread_join(tid).unwrap();
        }
    }

    fn tick_suspend_local(&self) {
        self.record("tick_suspend_local");
    }

    fn free_mem(&self) {
        self.record("free_mem");
    }

    fn create_file(&self, path: &str, mode: u32) -> Result<(), i32> {
        if let Some(code) = *self.create_file_error.lock().unwrap() {
            return Err(code);
        }
        self.record(format!("create_file {path} {mode:o}"));
        self.files.lock().unwrap().push((path.to_string(), mode));
        Ok(())
    }

    fn register_binfmt(&self, binfmt: Arc<dyn Binfmt>) {
        self.record(format!("register_binfmt {}", binfmt.name()));
        self.binfmts.lock().unwrap().push(binfmt);
    }

    fn clear_child_reaper(&self) {
        self.record("clear_child_reaper");
    }
}

/// Exec hooks that log into the owning [`FakeKernel`].
pub struct FakeImage<'a> {
    pub kernel: &'a FakeKernel,
}

impl ExecImage for FakeImage<'_> {
    fn flush_old_exec(&mut self, bprm: &LinuxBinprm) -> Result<(), i32> {
        if let Some(code) = *self.kernel.flush_error.lock().unwrap() {
            return Err(code);
        }
        self.kernel.record(format!("flush_old_exec {}", bprm.filename));
        Ok(())
    }

    fn set_personality(&mut self, personality: Personality) {
        self.kernel
            .record(format!("set_personality {}", personality.0));
    }

    fn setup_new_exec(&mut self, _bprm: &LinuxBinprm) {
        self.kernel.record("setup_new_exec");
    }

    fn install_exec_creds(&mut self, _bprm: &LinuxBinprm) {
        self.kernel.record("install_exec_creds");
    }

    fn set_binfmt(&mut self, binfmt: &dyn Binfmt) {
        self.kernel.record(format!("set_binfmt {}", binfmt.name()));
    }
}
