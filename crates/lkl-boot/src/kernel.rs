//! Guest-kernel entry points consumed by the boot coordinator and the init bridge.
//!
//! Guest-side failures are reported as negative errno values (`Err(-EINVAL)` and friends); the
//! callers here wrap them in [`lkl_host::LklError::Errno`] unchanged.

use crate::cmdline::BootParams;
use crate::init::InitBinfmt;
use lkl_host::{HostThreadId, Result};

use std::sync::Arc;

/// `reboot(2)` on the generic syscall table.
pub const NR_REBOOT: i64 = 142;

pub const LINUX_REBOOT_MAGIC1: i64 = 0xfee1_dead;
pub const LINUX_REBOOT_MAGIC2: i64 = 672_274_793;
pub const LINUX_REBOOT_CMD_RESTART: i64 = 0x0123_4567;

/// Execution domain of a freshly exec'd task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Personality(pub u32);

pub const PER_LINUX: Personality = Personality(0);

/// Arguments of an exec as seen by binary-format handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxBinprm {
    pub filename: String,
}

impl LinuxBinprm {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

/// Per-exec hooks a binary-format handler drives to replace the calling task's image.
pub trait ExecImage {
    fn flush_old_exec(&mut self, bprm: &LinuxBinprm) -> std::result::Result<(), i32>;
    fn set_personality(&mut self, personality: Personality);
    fn setup_new_exec(&mut self, bprm: &LinuxBinprm);
    fn install_exec_creds(&mut self, bprm: &LinuxBinprm);
    fn set_binfmt(&mut self, binfmt: &dyn Binfmt);
}

/// Binary-format handler registered with the guest through [`GuestKernel::register_binfmt`].
pub trait Binfmt: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load `bprm` into `image`. Returning [`lkl_host::LklError::InvalidExecutable`] lets the
    /// guest try the next handler.
    fn load_binary(
        &self,
        kernel: &dyn GuestKernel,
        bprm: &LinuxBinprm,
        image: &mut dyn ExecImage,
    ) -> Result<()>;
}

/// The guest kernel as a library.
pub trait GuestKernel: Send + Sync {
    /// Set up the boot CPU bookkeeping. Runs on the host thread calling `start`.
    fn cpu_init(&self) -> std::result::Result<(), i32>;

    /// Kernel entry point, run on the dedicated boot thread.
    ///
    /// Expected to call [`crate::init::fs_setup`] with `init` during late initialization and then
    /// exec `/init` on the first task. Returns once the guest has shut down.
    fn start_kernel(&self, params: BootParams, init: Arc<InitBinfmt>);

    /// Hand the boot CPU to `owner`.
    fn cpu_change_owner(&self, owner: HostThreadId);
    fn cpu_put(&self);

    fn syscall(&self, nr: i64, args: [i64; 6]) -> i64;

    /// Block until every guest CPU has stopped.
    fn cpu_wait_shutdown(&self);

    /// Deferred syscall-layer setup, run once from the first exec.
    fn syscalls_init(&self);
    fn syscalls_cleanup(&self);
    fn threads_cleanup(&self);
    fn tick_suspend_local(&self);
    fn free_mem(&self);

    fn create_file(&self, path: &str, mode: u32) -> std::result::Result<(), i32>;
    fn register_binfmt(&self, binfmt: Arc<dyn Binfmt>);

    /// Detach the initial pid namespace from its child reaper.
    fn clear_child_reaper(&self);
}
