use crate::dev::{
    VirtioDeviceOps, VirtioReq, VirtioTransport, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_VERSION_1,
};
use lkl_host::{errno, DeviceEnumeration, LklError, Result};

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Size of the virtio-mmio register block preceding the device config space.
pub const VIRTIO_MMIO_CONFIG: u64 = 0x100;

const MMIO_WINDOW_ALIGN: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioBusConfig {
    /// Guest-physical address of the first device window.
    pub mmio_base: u64,
    /// IRQ handed to the first device; later devices count up from here.
    pub first_irq: u32,
}

impl Default for MmioBusConfig {
    fn default() -> Self {
        Self {
            mmio_base: 0x1000_0000,
            first_irq: 1,
        }
    }
}

struct Slot {
    dev: Arc<dyn VirtioDeviceOps>,
    base: u64,
    size: u64,
    irq: u32,
    queues: usize,
    num_max: u32,
}

struct BusState {
    next_id: u32,
    next_base: u64,
    next_irq: u32,
    slots: BTreeMap<u32, Slot>,
}

/// Placement of a registered device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioWindow {
    pub base: u64,
    pub size: u64,
    pub irq: u32,
    pub queues: usize,
    pub num_max: u32,
}

/// virtio-mmio device registry.
///
/// Hands out ids, MMIO windows and IRQs, produces the `virtio_mmio.device=` command line entries
/// for devices registered before boot, and routes requests to devices under their queue locks.
pub struct MmioBus {
    state: Mutex<BusState>,
}

impl MmioBus {
    pub fn new(config: MmioBusConfig) -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 0,
                next_base: config.mmio_base,
                next_irq: config.first_irq,
                slots: BTreeMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, id: u32) -> Result<(Arc<dyn VirtioDeviceOps>, usize)> {
        let state = self.state();
        let slot = state
            .slots
            .get(&id)
            .ok_or(LklError::InvalidArgument("no such virtio device"))?;
        Ok((slot.dev.clone(), slot.queues))
    }

    pub fn window(&self, id: u32) -> Option<MmioWindow> {
        self.state().slots.get(&id).map(|slot| MmioWindow {
            base: slot.base,
            size: slot.size,
            irq: slot.irq,
            queues: slot.queues,
            num_max: slot.num_max,
        })
    }

    pub fn len(&self) -> usize {
        self.state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Features offered by device `id`, transport bits included.
    pub fn device_features(&self, id: u32) -> Result<u64> {
        let (dev, _) = self.device(id)?;
        Ok(dev.dev().device_features())
    }

    /// Record the features the guest driver accepted and let the device validate them.
    pub fn negotiate(&self, id: u32, driver_features: u64) -> Result<()> {
        let (dev, _) = self.device(id)?;
        dev.dev().set_driver_features(driver_features);
        dev.check_features()
    }

    pub fn read_config(&self, id: u32, offset: usize, data: &mut [u8]) -> Result<()> {
        let (dev, _) = self.device(id)?;
        dev.read_config(offset, data);
        Ok(())
    }

    /// Process one request on `queue`, blocking until the queue lock is free.
    pub fn dispatch(&self, id: u32, queue: usize, req: &mut VirtioReq<'_>) -> Result<()> {
        let (dev, queues) = self.device(id)?;
        if queue >= queues {
            return Err(LklError::InvalidArgument("queue index out of range"));
        }
        dev.acquire_queue(queue);
        dev.enqueue(queue, req);
        dev.release_queue(queue);
        Ok(())
    }

    /// Like [`MmioBus::dispatch`] but returns `Ok(false)` without touching the request when the
    /// queue is busy.
    pub fn try_dispatch(&self, id: u32, queue: usize, req: &mut VirtioReq<'_>) -> Result<bool> {
        let (dev, queues) = self.device(id)?;
        if queue >= queues {
            return Err(LklError::InvalidArgument("queue index out of range"));
        }
        if !dev.try_acquire_queue(queue) {
            return Ok(false);
        }
        dev.enqueue(queue, req);
        dev.release_queue(queue);
        Ok(true)
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new(MmioBusConfig::default())
    }
}

impl VirtioTransport for MmioBus {
    fn setup(&self, dev: Arc<dyn VirtioDeviceOps>, queues: usize, num_max: u32) -> Result<u32> {
        if queues == 0 || num_max == 0 {
            return Err(LklError::InvalidArgument("virtio device needs at least one queue"));
        }
        dev.dev().advertise(VIRTIO_F_VERSION_1 | VIRTIO_F_RING_EVENT_IDX);

        let size = VIRTIO_MMIO_CONFIG + dev.config_len() as u64;
        let mut state = self.state();
        let id = state.next_id;
        let base = state.next_base;
        let irq = state.next_irq;
        state.next_id += 1;
        state.next_base += size.div_ceil(MMIO_WINDOW_ALIGN) * MMIO_WINDOW_ALIGN;
        state.next_irq += 1;
        state.slots.insert(
            id,
            Slot {
                dev,
                base,
                size,
                irq,
                queues,
                num_max,
            },
        );

        tracing::debug!("virtio-mmio device {id} at {base:#x} (size {size:#x}, irq {irq})");
        Ok(id)
    }

    fn cleanup(&self, id: u32) -> Result<()> {
        match self.state().slots.remove(&id) {
            Some(_) => {
                tracing::debug!("virtio-mmio device {id} removed");
                Ok(())
            }
            None => Err(LklError::Errno(-errno::ENOENT)),
        }
    }
}

impl DeviceEnumeration for MmioBus {
    fn device_string(&self) -> String {
        let state = self.state();
        let mut out = String::new();
        for slot in state.slots.values() {
            let _ = write!(
                out,
                " virtio_mmio.device={}@{:#x}:{}",
                slot.size, slot.base, slot.irq
            );
        }
        out
    }
}
