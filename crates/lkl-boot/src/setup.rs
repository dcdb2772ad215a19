use crate::cmdline::{BootParams, CommandLine};
use crate::init::InitBinfmt;
use crate::kernel::{
    GuestKernel, LINUX_REBOOT_CMD_RESTART, LINUX_REBOOT_MAGIC1, LINUX_REBOOT_MAGIC2, NR_REBOOT,
};
use lkl_host::{errno, HostOps, HostSemaphore, HostThreadId, LklError, Result};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Boot bookkeeping shared between the coordinator and the init bridge.
#[derive(Default)]
pub struct BootState {
    /// Readiness semaphore; only populated while a `start` is waiting on it.
    init_sem: Mutex<Option<Arc<dyn HostSemaphore>>>,
    running: AtomicBool,
    /// Set from the first `start` attempt until that attempt fails.
    started: AtomicBool,
    boot_tid: Mutex<Option<HostThreadId>>,
}

impl BootState {
    /// Wake the host thread waiting in [`Lkl::start`].
    pub(crate) fn signal_ready(&self) {
        let sem = lock(&self.init_sem).clone();
        match sem {
            Some(sem) => sem.up(),
            None => tracing::warn!("boot readiness signalled with nobody waiting"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn boot_thread(&self) -> Option<HostThreadId> {
        *lock(&self.boot_tid)
    }
}

/// A guest kernel running inside this process.
///
/// Holds the host capability table for the lifetime of the guest. One context boots at most
/// once; a failed [`Lkl::start`] may be retried.
pub struct Lkl {
    host: Arc<dyn HostOps>,
    kernel: Arc<dyn GuestKernel>,
    state: Arc<BootState>,
    init: Arc<InitBinfmt>,
    command_line: Mutex<Option<CommandLine>>,
}

/// Boot the guest with a formatted command line. See [`Lkl::start`].
#[macro_export]
macro_rules! lkl_start {
    ($lkl:expr, $($arg:tt)*) => {
        $lkl.start(::std::format_args!($($arg)*))
    };
}

impl Lkl {
    pub fn new(host: Arc<dyn HostOps>, kernel: Arc<dyn GuestKernel>) -> Self {
        let state = Arc::new(BootState::default());
        let init = Arc::new(InitBinfmt::new(host.clone(), state.clone()));
        Self {
            host,
            kernel,
            state,
            init,
            command_line: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &Arc<dyn HostOps> {
        &self.host
    }

    pub fn state(&self) -> &Arc<BootState> {
        &self.state
    }

    /// The `/init` handler this context hands to the kernel entry point.
    pub fn init_binfmt(&self) -> &Arc<InitBinfmt> {
        &self.init
    }

    /// The command line the guest was booted with.
    pub fn command_line(&self) -> Option<CommandLine> {
        lock(&self.command_line).clone()
    }

    /// Boot the guest and wait until it has exec'd `/init`.
    ///
    /// On return the calling thread owns the boot CPU and the guest accepts syscalls. Blocks
    /// forever if the guest never reaches `/init`.
    pub fn start(&self, args: fmt::Arguments<'_>) -> Result<()> {
        if self.state.started.swap(true, Ordering::AcqRel) {
            return Err(LklError::InvalidArgument("guest kernel already started"));
        }

        let result = self.boot(args);
        if result.is_err() {
            self.state.started.store(false, Ordering::Release);
        }
        result
    }

    fn boot(&self, args: fmt::Arguments<'_>) -> Result<()> {
        let devices = self.host.virtio_devices();
        let command_line = CommandLine::render(args, devices.as_deref())?;
        let params = BootParams::new(command_line.clone());
        tracing::info!(
            "booting guest kernel: \"{command_line}\" ({} MiB)",
            params.mem_size >> 20
        );

        let sem = self
            .host
            .sem_alloc(0)
            .ok_or(LklError::ResourceExhausted("boot semaphore"))?;
        *lock(&self.state.init_sem) = Some(sem.clone());

        if let Err(code) = self.kernel.cpu_init() {
            self.release_sem(sem);
            return Err(LklError::Errno(code));
        }

        let kernel = self.kernel.clone();
        let init = self.init.clone();
        let Some(tid) = self
            .host
            .thread_create(Box::new(move || kernel.start_kernel(params, init)))
        else {
            self.release_sem(sem);
            return Err(LklError::ResourceExhausted("boot thread"));
        };

        sem.down();
        self.release_sem(sem);

        *lock(&self.state.boot_tid) = Some(tid);
        *lock(&self.command_line) = Some(command_line);
        self.kernel.cpu_change_owner(self.host.thread_self());
        self.kernel.cpu_put();
        self.state.running.store(true, Ordering::Release);

        tracing::info!("guest kernel running (boot thread {tid})");
        Ok(())
    }

    fn release_sem(&self, sem: Arc<dyn HostSemaphore>) {
        lock(&self.state.init_sem).take();
        self.host.sem_free(sem);
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Invoke a guest syscall. Negative results are errno values.
    pub fn syscall(&self, nr: i64, args: [i64; 6]) -> i64 {
        self.kernel.syscall(nr, args)
    }

    /// Shut the guest down and join its boot thread.
    ///
    /// A failing reboot syscall is returned as [`LklError::Errno`] and leaves the guest running.
    pub fn halt(&self) -> Result<()> {
        if !self.is_running() {
            return Err(LklError::InvalidArgument("guest kernel is not running"));
        }

        let args = [
            LINUX_REBOOT_MAGIC1,
            LINUX_REBOOT_MAGIC2,
            LINUX_REBOOT_CMD_RESTART,
            0,
            0,
            0,
        ];
        let ret = self.kernel.syscall(NR_REBOOT, args);
        if ret < 0 {
            return Err(LklError::Errno(
                i32::try_from(ret).unwrap_or(-errno::EINVAL),
            ));
        }

        self.state.running.store(false, Ordering::Release);

        self.kernel.cpu_wait_shutdown();
        self.kernel.syscalls_cleanup();
        self.kernel.threads_cleanup();
        self.kernel.tick_suspend_local();
        self.kernel.free_mem();

        let tid = lock(&self.state.boot_tid).take();
        if let Some(tid) = tid {
            self.host.thread_join(tid)?;
        }
        tracing::info!("guest kernel halted");
        Ok(())
    }

    /// Guest panic-blink hook. Hands control to [`HostOps::panic`], which does not return.
    pub fn panic_blink(&self, _state: i32) -> i64 {
        self.host.panic()
    }
}

impl fmt::Debug for Lkl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lkl")
            .field("running", &self.is_running())
            .field("boot_thread", &self.state.boot_thread())
            .field("command_line", &*lock(&self.command_line))
            .finish()
    }
}
