use lkl_host::Result;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const VIRTIO_ID_BLOCK: u32 = 2;

// Offered by the transport on behalf of every device.
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Transport-visible header shared by every virtio device.
///
/// `device_features` is what the device offers (the transport may add ring features at setup);
/// `driver_features` is what the guest driver accepted during negotiation.
#[derive(Debug)]
pub struct VirtioDev {
    pub device_id: u32,
    pub vendor_id: u32,
    device_features: AtomicU64,
    driver_features: AtomicU64,
}

impl VirtioDev {
    pub fn new(device_id: u32, device_features: u64) -> Self {
        Self {
            device_id,
            vendor_id: 0,
            device_features: AtomicU64::new(device_features),
            driver_features: AtomicU64::new(0),
        }
    }

    pub fn device_features(&self) -> u64 {
        self.device_features.load(Ordering::Acquire)
    }

    /// Add `features` to the offered set.
    pub fn advertise(&self, features: u64) {
        self.device_features.fetch_or(features, Ordering::AcqRel);
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features.load(Ordering::Acquire)
    }

    pub fn set_driver_features(&self, features: u64) {
        self.driver_features.store(features, Ordering::Release);
    }
}

/// One scatter-gather request popped from a virtqueue.
///
/// The transport owns the buffers for the duration of a single enqueue call. Completion is
/// reported through the callback given to [`VirtioReq::new`], at most once.
pub struct VirtioReq<'a> {
    bufs: Vec<&'a mut [u8]>,
    on_complete: Option<Box<dyn FnOnce(u32) + 'a>>,
}

impl<'a> VirtioReq<'a> {
    pub fn new(bufs: Vec<&'a mut [u8]>, on_complete: impl FnOnce(u32) + 'a) -> Self {
        Self {
            bufs,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn buf_count(&self) -> usize {
        self.bufs.len()
    }

    pub fn bufs_mut(&mut self) -> &mut [&'a mut [u8]] {
        &mut self.bufs
    }

    /// Hand the request back to the transport with `len` bytes written.
    pub fn complete(&mut self, len: u32) {
        match self.on_complete.take() {
            Some(done) => done(len),
            None => tracing::debug!("virtio request completed twice"),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.on_complete.is_none()
    }
}

impl fmt::Debug for VirtioReq<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioReq")
            .field("buf_lens", &self.bufs.iter().map(|b| b.len()).collect::<Vec<_>>())
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Device-side operations the transport calls into.
///
/// The transport serializes access to a queue with the acquire/release primitives before
/// calling [`VirtioDeviceOps::enqueue`]; devices do not lock inside `enqueue`.
pub trait VirtioDeviceOps: Send + Sync {
    fn dev(&self) -> &VirtioDev;

    fn config_len(&self) -> usize;
    fn read_config(&self, offset: usize, data: &mut [u8]);

    fn check_features(&self) -> Result<()>;

    fn enqueue(&self, queue: usize, req: &mut VirtioReq<'_>);

    fn try_acquire_queue(&self, queue: usize) -> bool;
    fn acquire_queue(&self, queue: usize);
    fn release_queue(&self, queue: usize);
}

/// Generic device setup and teardown provided by the virtio transport.
pub trait VirtioTransport: Send + Sync {
    /// Register `dev` with `queues` queues of at most `num_max` entries. Returns the transport id.
    fn setup(&self, dev: Arc<dyn VirtioDeviceOps>, queues: usize, num_max: u32) -> Result<u32>;

    /// Unregister a device. On failure the device stays registered.
    fn cleanup(&self, id: u32) -> Result<()>;
}
