use crate::{
    DeviceEnumeration, HostMemory, HostMutex, HostOps, HostSemaphore, HostThreadId, LklError,
    Result,
};

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TID: Cell<Option<HostThreadId>> = const { Cell::new(None) };
}

fn next_tid() -> HostThreadId {
    HostThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

/// Threads not created through [`StdHost`] get an id the first time they ask for one.
fn current_tid() -> HostThreadId {
    CURRENT_TID.with(|cell| match cell.get() {
        Some(tid) => tid,
        None => {
            let tid = next_tid();
            cell.set(Some(tid));
            tid
        }
    })
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Unwind payload used by [`StdHost::thread_exit`].
struct ThreadExit;

#[derive(Debug, Clone)]
pub struct StdHostConfig {
    /// Name given to every host thread the guest creates.
    pub thread_name: Option<String>,
    /// Stack size for guest threads; `None` keeps the std default.
    pub stack_size: Option<usize>,
}

impl Default for StdHostConfig {
    fn default() -> Self {
        Self {
            thread_name: Some("lkl".to_string()),
            stack_size: None,
        }
    }
}

/// [`HostOps`] implemented with `std::thread` and `std::sync`.
pub struct StdHost {
    config: StdHostConfig,
    threads: Mutex<HashMap<HostThreadId, JoinHandle<()>>>,
    devices: Option<Arc<dyn DeviceEnumeration>>,
}

impl StdHost {
    pub fn new(config: StdHostConfig) -> Self {
        Self {
            config,
            threads: Mutex::new(HashMap::new()),
            devices: None,
        }
    }

    /// Append the devices known to `devices` to the guest command line at boot.
    pub fn with_device_enumeration(mut self, devices: Arc<dyn DeviceEnumeration>) -> Self {
        self.devices = Some(devices);
        self
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new(StdHostConfig::default())
    }
}

impl HostOps for StdHost {
    fn virtio_devices(&self) -> Option<String> {
        let devices = self.devices.as_ref()?.device_string();
        (!devices.is_empty()).then_some(devices)
    }

    fn print(&self, msg: &str) {
        tracing::info!(target: "lkl::guest", "{}", msg.trim_end());
    }

    fn panic(&self) -> ! {
        tracing::error!("guest kernel panic, aborting host process");
        std::process::abort()
    }

    fn sem_alloc(&self, count: u32) -> Option<Arc<dyn HostSemaphore>> {
        Some(Arc::new(StdSemaphore::new(count)))
    }

    fn sem_free(&self, sem: Arc<dyn HostSemaphore>) {
        drop(sem);
    }

    fn mutex_alloc(&self, recursive: bool) -> Option<Box<dyn HostMutex>> {
        Some(Box::new(StdMutex::new(recursive)))
    }

    fn mutex_free(&self, mutex: Box<dyn HostMutex>) {
        drop(mutex);
    }

    fn thread_create(&self, f: Box<dyn FnOnce() + Send + 'static>) -> Option<HostThreadId> {
        let tid = next_tid();
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.config.thread_name {
            builder = builder.name(name.clone());
        }
        if let Some(size) = self.config.stack_size {
            builder = builder.stack_size(size);
        }

        let spawned = builder.spawn(move || {
            CURRENT_TID.with(|cell| cell.set(Some(tid)));
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => {}
                Err(payload) if payload.is::<ThreadExit>() => {}
                Err(payload) => panic::resume_unwind(payload),
            }
        });

        match spawned {
            Ok(handle) => {
                lock(&self.threads).insert(tid, handle);
                Some(tid)
            }
            Err(err) => {
                tracing::warn!("failed to spawn host thread: {err}");
                None
            }
        }
    }

    fn thread_join(&self, tid: HostThreadId) -> Result<()> {
        let handle = lock(&self.threads)
            .remove(&tid)
            .ok_or(LklError::InvalidArgument("unknown host thread"))?;
        handle.join().map_err(|_| LklError::ThreadPanicked(tid.0))
    }

    fn thread_exit(&self) -> ! {
        // Caught by the wrapper installed in `thread_create`. resume_unwind skips the panic hook.
        panic::resume_unwind(Box::new(ThreadExit))
    }

    fn thread_self(&self) -> HostThreadId {
        current_tid()
    }

    fn mem_alloc(&self, size: usize) -> Option<HostMemory> {
        Some(HostMemory::zeroed(size))
    }

    fn mem_free(&self, mem: HostMemory) {
        drop(mem);
    }
}

pub(crate) struct StdSemaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl StdSemaphore {
    pub(crate) fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }
}

impl HostSemaphore for StdSemaphore {
    fn up(&self) {
        let mut count = lock(&self.count);
        *count += 1;
        self.cond.notify_one();
    }

    fn down(&self) {
        let mut count = lock(&self.count);
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }
}

#[derive(Default)]
struct MutexState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Explicit lock/unlock mutex. A non-recursive mutex relocked by its owner deadlocks, as a
/// default pthread mutex does.
pub(crate) struct StdMutex {
    recursive: bool,
    state: Mutex<MutexState>,
    cond: Condvar,
}

impl StdMutex {
    pub(crate) fn new(recursive: bool) -> Self {
        Self {
            recursive,
            state: Mutex::new(MutexState::default()),
            cond: Condvar::new(),
        }
    }

    fn try_take(&self, state: &mut MutexState, me: ThreadId) -> bool {
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if self.recursive && owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }
}

impl HostMutex for StdMutex {
    fn lock(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        while !self.try_take(&mut state, me) {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        self.try_take(&mut state, me)
    }

    fn unlock(&self) {
        let me = thread::current().id();
        let mut state = lock(&self.state);
        if state.owner != Some(me) {
            tracing::warn!("host mutex released by a thread that does not hold it");
            return;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }
}
