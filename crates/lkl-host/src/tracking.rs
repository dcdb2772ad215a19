use crate::{HostMemory, HostMutex, HostOps, HostSemaphore, HostThreadId, Result, StdHost};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Snapshot of allocations currently outstanding through a [`TrackingHost`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub semaphores: usize,
    pub mutexes: usize,
    pub memory_blocks: usize,
    pub memory_bytes: usize,
}

/// [`HostOps`] wrapper that counts outstanding semaphores, mutexes and memory blocks, and can be
/// told to fail specific allocations.
///
/// Useful for leak checks: after a balanced sequence of operations [`TrackingHost::stats`] must
/// equal the snapshot taken before it.
pub struct TrackingHost<H: HostOps = StdHost> {
    inner: H,
    semaphores: AtomicUsize,
    mutexes: AtomicUsize,
    memory_blocks: AtomicUsize,
    memory_bytes: AtomicUsize,
    sem_allocs_left: AtomicI64,
    mutex_allocs_left: AtomicI64,
    mem_allocs_left: AtomicI64,
    fail_thread_create: AtomicBool,
    printed: std::sync::Mutex<Vec<String>>,
}

/// Decrements a fault-injection budget. A negative budget never fails.
fn consume(budget: &AtomicI64) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
            0 => None,
            n if n < 0 => Some(n),
            n => Some(n - 1),
        })
        .is_ok()
}

impl<H: HostOps> TrackingHost<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            semaphores: AtomicUsize::new(0),
            mutexes: AtomicUsize::new(0),
            memory_blocks: AtomicUsize::new(0),
            memory_bytes: AtomicUsize::new(0),
            sem_allocs_left: AtomicI64::new(-1),
            mutex_allocs_left: AtomicI64::new(-1),
            mem_allocs_left: AtomicI64::new(-1),
            fail_thread_create: AtomicBool::new(false),
            printed: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            semaphores: self.semaphores.load(Ordering::SeqCst),
            mutexes: self.mutexes.load(Ordering::SeqCst),
            memory_blocks: self.memory_blocks.load(Ordering::SeqCst),
            memory_bytes: self.memory_bytes.load(Ordering::SeqCst),
        }
    }

    /// Let `n` more semaphore allocations succeed, then fail the rest.
    pub fn fail_sem_alloc_after(&self, n: u32) {
        self.sem_allocs_left.store(i64::from(n), Ordering::SeqCst);
    }

    pub fn fail_mutex_alloc_after(&self, n: u32) {
        self.mutex_allocs_left.store(i64::from(n), Ordering::SeqCst);
    }

    pub fn fail_mem_alloc_after(&self, n: u32) {
        self.mem_allocs_left.store(i64::from(n), Ordering::SeqCst);
    }

    pub fn set_fail_thread_create(&self, fail: bool) {
        self.fail_thread_create.store(fail, Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn reset_faults(&self) {
        self.sem_allocs_left.store(-1, Ordering::SeqCst);
        self.mutex_allocs_left.store(-1, Ordering::SeqCst);
        self.mem_allocs_left.store(-1, Ordering::SeqCst);
        self.fail_thread_create.store(false, Ordering::SeqCst);
    }

    /// Everything passed to [`HostOps::print`] so far.
    pub fn printed(&self) -> Vec<String> {
        self.printed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for TrackingHost<StdHost> {
    fn default() -> Self {
        Self::new(StdHost::default())
    }
}

impl<H: HostOps> HostOps for TrackingHost<H> {
    fn virtio_devices(&self) -> Option<String> {
        self.inner.virtio_devices()
    }

    fn print(&self, msg: &str) {
        self.printed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(msg.to_string());
        self.inner.print(msg);
    }

    fn panic(&self) -> ! {
        self.inner.panic()
    }

    fn sem_alloc(&self, count: u32) -> Option<Arc<dyn HostSemaphore>> {
        if !consume(&self.sem_allocs_left) {
            return None;
        }
        let sem = self.inner.sem_alloc(count)?;
        self.semaphores.fetch_add(1, Ordering::SeqCst);
        Some(sem)
    }

    fn sem_free(&self, sem: Arc<dyn HostSemaphore>) {
        self.semaphores.fetch_sub(1, Ordering::SeqCst);
        self.inner.sem_free(sem);
    }

    fn mutex_alloc(&self, recursive: bool) -> Option<Box<dyn HostMutex>> {
        if !consume(&self.mutex_allocs_left) {
            return None;
        }
        let mutex = self.inner.mutex_alloc(recursive)?;
        self.mutexes.fetch_add(1, Ordering::SeqCst);
        Some(mutex)
    }

    fn mutex_free(&self, mutex: Box<dyn HostMutex>) {
        self.mutexes.fetch_sub(1, Ordering::SeqCst);
        self.inner.mutex_free(mutex);
    }

    fn thread_create(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Option<HostThreadId> {
        if self.fail_thread_create.load(Ordering::SeqCst) {
            return None;
        }
        self.inner.thread_create(f)
    }

    fn thread_join(&self, tid: HostThreadId) -> Result<()> {
        self.inner.thread_join(tid)
    }

    fn thread_exit(&self) -> ! {
        self.inner.thread_exit()
    }

    fn thread_self(&self) -> HostThreadId {
        self.inner.thread_self()
    }

    fn mem_alloc(&self, size: usize) -> Option<HostMemory> {
        if !consume(&self.mem_allocs_left) {
            return None;
        }
        let mem = self.inner.mem_alloc(size)?;
        self.memory_blocks.fetch_add(1, Ordering::SeqCst);
        self.memory_bytes.fetch_add(mem.len(), Ordering::SeqCst);
        Some(mem)
    }

    fn mem_free(&self, mem: HostMemory) {
        self.memory_blocks.fetch_sub(1, Ordering::SeqCst);
        self.memory_bytes.fetch_sub(mem.len(), Ordering::SeqCst);
        self.inner.mem_free(mem);
    }
}
