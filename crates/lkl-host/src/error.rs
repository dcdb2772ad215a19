use thiserror::Error;

pub type Result<T> = std::result::Result<T, LklError>;

/// Linux errno values used when a failure has to cross back into errno-speaking code.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const E2BIG: i32 = 7;
    pub const EBADF: i32 = 9;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const EINVAL: i32 = 22;
}

/// Error taxonomy shared by the host interface, the boot coordinator and the virtio bridge.
///
/// Per-request block I/O failures are not represented here: they only ever reach the guest as
/// the status byte of the failing request.
#[derive(Debug, Error)]
pub enum LklError {
    /// A host allocation (semaphore, mutex, memory, thread) failed.
    #[error("host resources exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("command line too long: {len} bytes (capacity {capacity})")]
    ConfigOverflow { len: usize, capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("refusing to execute {0:?}")]
    InvalidExecutable(String),

    #[error("feature negotiation failed: device offers {device:#x}, driver accepted {driver:#x}")]
    FeatureNegotiationFailed { device: u64, driver: u64 },

    #[error("host thread {0} panicked")]
    ThreadPanicked(u64),

    #[error("io error: {0}")]
    Io(String),

    /// Negative status returned by a guest-side collaborator, passed through unchanged.
    #[error("guest returned errno {0}")]
    Errno(i32),
}

impl LklError {
    /// The negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            LklError::ResourceExhausted(_) => -errno::ENOMEM,
            LklError::ConfigOverflow { .. } => -errno::E2BIG,
            LklError::InvalidArgument(_)
            | LklError::InvalidExecutable(_)
            | LklError::FeatureNegotiationFailed { .. } => -errno::EINVAL,
            LklError::ThreadPanicked(_) | LklError::Io(_) => -errno::EIO,
            LklError::Errno(code) => *code,
        }
    }
}

impl From<std::io::Error> for LklError {
    fn from(err: std::io::Error) -> Self {
        LklError::Io(err.to_string())
    }
}
