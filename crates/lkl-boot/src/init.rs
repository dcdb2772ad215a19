use crate::kernel::{Binfmt, ExecImage, GuestKernel, LinuxBinprm, PER_LINUX};
use crate::setup::BootState;
use lkl_host::{HostOps, LklError, Result};

use std::fmt;
use std::sync::Arc;

/// Path whose exec hands control back to the host.
pub const INIT_PATH: &str = "/init";

/// Binary-format handler for [`INIT_PATH`].
///
/// The guest's first task execs `/init` once kernel initialization is done. Instead of loading
/// a program, this handler finishes the deferred setup, wakes the host thread blocked in
/// [`crate::Lkl::start`] and retires the task's host thread.
pub struct InitBinfmt {
    host: Arc<dyn HostOps>,
    state: Arc<BootState>,
}

impl InitBinfmt {
    pub(crate) fn new(host: Arc<dyn HostOps>, state: Arc<BootState>) -> Self {
        Self { host, state }
    }
}

impl fmt::Debug for InitBinfmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitBinfmt").finish_non_exhaustive()
    }
}

impl Binfmt for InitBinfmt {
    fn name(&self) -> &'static str {
        "lkl_run_init"
    }

    fn load_binary(
        &self,
        kernel: &dyn GuestKernel,
        bprm: &LinuxBinprm,
        image: &mut dyn ExecImage,
    ) -> Result<()> {
        if bprm.filename != INIT_PATH {
            return Err(LklError::InvalidExecutable(bprm.filename.clone()));
        }

        image.flush_old_exec(bprm).map_err(LklError::Errno)?;
        image.set_personality(PER_LINUX);
        image.setup_new_exec(bprm);
        image.install_exec_creds(bprm);
        image.set_binfmt(self);

        kernel.clear_child_reaper();
        kernel.syscalls_init();

        tracing::debug!("guest reached {INIT_PATH}, releasing boot waiter");
        self.state.signal_ready();
        self.host.thread_exit()
    }
}

/// Late-init filesystem setup: create the `/init` placeholder and register `init`.
///
/// Must run once, before the guest execs `/init`.
pub fn fs_setup(kernel: &dyn GuestKernel, init: Arc<InitBinfmt>) {
    if let Err(code) = kernel.create_file(INIT_PATH, 0o700) {
        tracing::warn!("failed to create {INIT_PATH} placeholder: errno {code}");
    }
    kernel.register_binfmt(init);
}
