//! Boot and shutdown of a guest kernel linked into the host process.
//!
//! [`Lkl::start`] renders the guest command line, runs the kernel entry point on a dedicated
//! host thread and blocks until the guest execs `/init`. That exec is intercepted by
//! [`InitBinfmt`], which releases the waiting host thread. [`Lkl::halt`] reverses the process.

pub mod cmdline;
pub mod init;
pub mod kernel;
pub mod setup;

pub use cmdline::{memparse, BootParams, CommandLine, COMMAND_LINE_SIZE, DEFAULT_MEM_SIZE};
pub use init::{fs_setup, InitBinfmt, INIT_PATH};
pub use kernel::{Binfmt, ExecImage, GuestKernel, LinuxBinprm, Personality, PER_LINUX};
pub use setup::{BootState, Lkl};
