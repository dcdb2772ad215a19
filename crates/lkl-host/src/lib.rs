//! Host capability table for running the guest kernel as a library.
//!
//! The embedding process hands the library a [`HostOps`] implementation exactly once, when the
//! boot context is built. Every thread, lock, allocation and diagnostic the library needs goes
//! through it afterwards; nothing in the workspace talks to the OS behind its back.
//!
//! - [`HostOps`]: the capability table itself
//! - [`StdHost`]: implementation on top of `std::thread` and `std::sync`
//! - [`TrackingHost`]: wrapper that counts outstanding allocations and can inject failures

mod error;
mod std_host;
mod tracking;

pub use error::{errno, LklError, Result};
pub use std_host::{StdHost, StdHostConfig};
pub use tracking::{AllocStats, TrackingHost};

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Identity of a host thread as seen by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostThreadId(pub u64);

impl fmt::Display for HostThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Counting semaphore handed out by [`HostOps::sem_alloc`].
pub trait HostSemaphore: Send + Sync {
    fn up(&self);
    fn down(&self);
}

/// Lock handed out by [`HostOps::mutex_alloc`].
///
/// Unlike `std::sync::Mutex` this is not RAII: the virtio transport acquires and releases queue
/// locks from separate calls, so `lock` and `unlock` are explicit.
pub trait HostMutex: Send + Sync {
    fn lock(&self);
    /// Returns `true` if the lock was taken.
    fn try_lock(&self) -> bool;
    fn unlock(&self);
}

/// Source of the `virtio_mmio.device=` entries appended to the guest command line.
pub trait DeviceEnumeration: Send + Sync {
    fn device_string(&self) -> String;
}

/// Block of host memory returned by [`HostOps::mem_alloc`].
pub struct HostMemory {
    buf: Box<[u8]>,
}

impl HostMemory {
    pub fn zeroed(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
        }
    }
}

impl Deref for HostMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for HostMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.buf.len())
            .finish()
    }
}

/// Primitives the embedding host supplies to the guest.
///
/// All calls are synchronous from the caller's point of view. Allocation entry points return
/// `None` on exhaustion; callers turn that into [`LklError::ResourceExhausted`].
pub trait HostOps: Send + Sync {
    /// Extra command line text enumerating devices registered before boot.
    fn virtio_devices(&self) -> Option<String> {
        None
    }

    /// Guest console output.
    fn print(&self, msg: &str);

    /// Called when the guest panics. Never returns.
    fn panic(&self) -> !;

    fn sem_alloc(&self, count: u32) -> Option<Arc<dyn HostSemaphore>>;
    fn sem_free(&self, sem: Arc<dyn HostSemaphore>);

    fn mutex_alloc(&self, recursive: bool) -> Option<Box<dyn HostMutex>>;
    fn mutex_free(&self, mutex: Box<dyn HostMutex>);

    /// Start `f` on a new host thread.
    fn thread_create(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Option<HostThreadId>;
    /// Wait for a thread created by [`HostOps::thread_create`] to finish.
    fn thread_join(&self, tid: HostThreadId) -> Result<()>;
    /// Terminate the calling thread. Only valid on threads created by `thread_create`.
    fn thread_exit(&self) -> !;
    fn thread_self(&self) -> HostThreadId;

    fn mem_alloc(&self, size: usize) -> Option<HostMemory>;
    fn mem_free(&self, mem: HostMemory);
}
