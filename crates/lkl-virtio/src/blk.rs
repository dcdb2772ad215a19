use crate::dev::{VirtioDev, VirtioDeviceOps, VirtioReq, VirtioTransport, VIRTIO_ID_BLOCK};
use crate::file_ops::FileBlockOps;
use lkl_host::{HostMemory, HostMutex, HostOps, LklError, Result};

use std::fmt;
use std::fs::File;
use std::sync::{Arc, Mutex, OnceLock};

pub const VIRTIO_BLK_SECTOR_SIZE: u64 = 512;

pub const LKL_DEV_BLK_TYPE_READ: u32 = 0;
pub const LKL_DEV_BLK_TYPE_WRITE: u32 = 1;
pub const LKL_DEV_BLK_TYPE_FLUSH: u32 = 4;
pub const LKL_DEV_BLK_TYPE_FLUSH_OUT: u32 = 5;

pub const LKL_DEV_BLK_STATUS_OK: u8 = 0;
pub const LKL_DEV_BLK_STATUS_IOERR: u8 = 1;
pub const LKL_DEV_BLK_STATUS_UNSUP: u8 = 2;

pub const NUM_QUEUES: usize = 1;
pub const QUEUE_DEPTH: u32 = 32;

/// `struct virtio_blk_outhdr`: type (4) + ioprio (4) + sector (8, low 32 bits decoded).
pub const VIRTIO_BLK_OUTHDR_SIZE: usize = 16;
/// One status byte.
pub const VIRTIO_BLK_TRAILER_SIZE: usize = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioBlkConfig {
    /// Capacity in 512-byte sectors.
    pub capacity: u64,
    pub blk_size: u32,
}

impl VirtioBlkConfig {
    // capacity (8) + size_max (4) + seg_max (4) + geometry (4) + blk_size (4)
    pub const SIZE: usize = 24;

    pub fn from_capacity_bytes(bytes: u64) -> Self {
        Self {
            // Partial trailing sectors are not exposed to the guest.
            capacity: bytes / VIRTIO_BLK_SECTOR_SIZE,
            blk_size: VIRTIO_BLK_SECTOR_SIZE as u32,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut cfg = [0u8; Self::SIZE];
        cfg[0..8].copy_from_slice(&self.capacity.to_le_bytes());
        // size_max, seg_max and geometry are left as zero.
        cfg[20..24].copy_from_slice(&self.blk_size.to_le_bytes());
        cfg
    }

    pub fn read(&self, offset: usize, data: &mut [u8]) {
        read_config_bytes(&self.to_bytes(), offset, data);
    }
}

fn read_config_bytes(cfg: &[u8], offset: usize, data: &mut [u8]) {
    if offset >= cfg.len() {
        data.fill(0);
        return;
    }
    let end = offset
        .checked_add(data.len())
        .unwrap_or(cfg.len())
        .min(cfg.len());
    data[..end - offset].copy_from_slice(&cfg[offset..end]);
    if end - offset < data.len() {
        data[end - offset..].fill(0);
    }
}

/// Host-side handle of the storage behind a virtio-blk device.
#[derive(Clone)]
pub enum DiskHandle {
    File(Arc<Mutex<File>>),
    /// Handle meaningful only to a custom [`BlockOps`] implementation.
    Opaque(u64),
}

impl DiskHandle {
    pub fn from_file(file: File) -> Self {
        DiskHandle::File(Arc::new(Mutex::new(file)))
    }
}

impl fmt::Debug for DiskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskHandle::File(_) => f.write_str("DiskHandle::File"),
            DiskHandle::Opaque(h) => write!(f, "DiskHandle::Opaque({h:#x})"),
        }
    }
}

/// Block request handed to [`BlockOps::request`]: the decoded header plus the data buffers
/// between the header and the status trailer.
#[derive(Debug)]
pub struct BlkRequest<'r, 'a> {
    pub req_type: u32,
    pub prio: u32,
    pub sector: u64,
    pub bufs: &'r mut [&'a mut [u8]],
}

/// Host block I/O callbacks.
pub trait BlockOps: Send + Sync {
    /// Size of the disk in bytes. Called once, when the disk is registered.
    fn get_capacity(&self, disk: &DiskHandle) -> Result<u64>;

    /// Serve one request. The returned byte is written verbatim to the request's status trailer.
    fn request(&self, disk: &DiskHandle, req: &mut BlkRequest<'_, '_>) -> u8;
}

/// Queue operations of a virtio-blk device.
///
/// Every method has the default behavior; a custom implementation overrides only what it needs
/// and can fall back to the free functions in this module.
pub trait BlkDeviceOps: Send + Sync {
    fn check_features(&self, dev: &VirtioBlkDev) -> Result<()> {
        check_features(dev)
    }

    fn enqueue(&self, dev: &VirtioBlkDev, queue: usize, req: &mut VirtioReq<'_>) {
        enqueue(dev, queue, req)
    }

    fn try_acquire_queue(&self, dev: &VirtioBlkDev, queue: usize) -> bool {
        dev.queue_locks.get(queue).try_lock()
    }

    fn acquire_queue(&self, dev: &VirtioBlkDev, queue: usize) {
        dev.queue_locks.get(queue).lock()
    }

    fn release_queue(&self, dev: &VirtioBlkDev, queue: usize) {
        dev.queue_locks.get(queue).unlock()
    }
}

/// Queue operations used when a [`Disk`] does not bring its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBlkOps;

impl BlkDeviceOps for DefaultBlkOps {}

/// Accepts only a driver that took exactly the advertised feature set.
pub fn check_features(dev: &VirtioBlkDev) -> Result<()> {
    let device = dev.dev.device_features();
    let driver = dev.dev.driver_features();
    if device == driver {
        Ok(())
    } else {
        Err(LklError::FeatureNegotiationFailed { device, driver })
    }
}

/// Translate one virtio-blk request and hand it to the device's [`BlockOps`].
///
/// Expects the caller to hold the lock of `queue`. The request is always completed exactly once;
/// malformed requests are completed with `LKL_DEV_BLK_STATUS_IOERR` in the trailer when there is
/// a trailer to write.
pub fn enqueue(dev: &VirtioBlkDev, _queue: usize, req: &mut VirtioReq<'_>) {
    serve(dev, req);
    req.complete(0);
}

fn serve(dev: &VirtioBlkDev, req: &mut VirtioReq<'_>) {
    if req.buf_count() < 3 {
        dev.malformed("virtio_blk: no status buf\n");
        return;
    }

    let Some((header, rest)) = req.bufs_mut().split_first_mut() else {
        return;
    };
    let Some((trailer, data)) = rest.split_last_mut() else {
        return;
    };

    if let Some(status) = trailer.first_mut() {
        *status = LKL_DEV_BLK_STATUS_IOERR;
    }

    if header.len() != VIRTIO_BLK_OUTHDR_SIZE {
        dev.malformed("virtio_blk: bad header buf\n");
        return;
    }
    if trailer.len() != VIRTIO_BLK_TRAILER_SIZE {
        dev.malformed("virtio_blk: bad status buf\n");
        return;
    }

    let mut blk_req = BlkRequest {
        req_type: le_u32(&header[0..4]),
        prio: le_u32(&header[4..8]),
        // Only the low 32 bits of the wire sector are honoured.
        sector: u64::from(le_u32(&header[8..12])),
        bufs: data,
    };
    trailer[0] = dev.ops.request(&dev.disk, &mut blk_req);
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

/// Memory obtained from [`HostOps::mem_alloc`], returned on drop.
struct HostBlock {
    mem: Option<HostMemory>,
    host: Arc<dyn HostOps>,
}

impl HostBlock {
    fn alloc(host: &Arc<dyn HostOps>, size: usize) -> Result<Self> {
        let mem = host
            .mem_alloc(size)
            .ok_or(LklError::ResourceExhausted("virtio-blk device state"))?;
        Ok(Self {
            mem: Some(mem),
            host: host.clone(),
        })
    }

    fn bytes(&self) -> &[u8] {
        self.mem.as_deref().unwrap_or(&[])
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.mem.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            self.host.mem_free(mem);
        }
    }
}

/// One host mutex per queue. Sized once; freed on drop.
struct QueueLocks {
    locks: Vec<Box<dyn HostMutex>>,
    host: Arc<dyn HostOps>,
}

impl QueueLocks {
    fn alloc(host: &Arc<dyn HostOps>, queues: usize) -> Result<Self> {
        assert!(queues > 0, "virtio-blk needs at least one queue");

        // Dropping a partially filled set frees what was already allocated.
        let mut set = Self {
            locks: Vec::with_capacity(queues),
            host: host.clone(),
        };
        for _ in 0..queues {
            let lock = host
                .mutex_alloc(true)
                .ok_or(LklError::ResourceExhausted("virtio-blk queue lock"))?;
            set.locks.push(lock);
        }
        assert_eq!(set.locks.len(), queues);
        Ok(set)
    }

    fn get(&self, queue: usize) -> &dyn HostMutex {
        &*self.locks[queue]
    }
}

impl Drop for QueueLocks {
    fn drop(&mut self) {
        for lock in self.locks.drain(..) {
            self.host.mutex_free(lock);
        }
    }
}

/// virtio-blk device state, created by [`BlkBridge::disk_add`].
pub struct VirtioBlkDev {
    dev: VirtioDev,
    config: HostBlock,
    capacity: u64,
    ops: Arc<dyn BlockOps>,
    dev_ops: Arc<dyn BlkDeviceOps>,
    disk: DiskHandle,
    queue_locks: QueueLocks,
    host: Arc<dyn HostOps>,
    id: OnceLock<u32>,
}

impl VirtioBlkDev {
    /// Capacity in 512-byte sectors, fixed at registration.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn disk(&self) -> &DiskHandle {
        &self.disk
    }

    pub fn block_ops(&self) -> &Arc<dyn BlockOps> {
        &self.ops
    }

    pub fn host(&self) -> &Arc<dyn HostOps> {
        &self.host
    }

    /// Transport id, once registered.
    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    pub fn queue_count(&self) -> usize {
        self.queue_locks.locks.len()
    }

    fn malformed(&self, msg: &str) {
        tracing::warn!("{}", msg.trim_end());
        self.host.print(msg);
    }
}

impl fmt::Debug for VirtioBlkDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtioBlkDev")
            .field("id", &self.id())
            .field("capacity", &self.capacity)
            .field("disk", &self.disk)
            .field("queues", &self.queue_count())
            .finish()
    }
}

impl VirtioDeviceOps for VirtioBlkDev {
    fn dev(&self) -> &VirtioDev {
        &self.dev
    }

    fn config_len(&self) -> usize {
        VirtioBlkConfig::SIZE
    }

    fn read_config(&self, offset: usize, data: &mut [u8]) {
        read_config_bytes(self.config.bytes(), offset, data);
    }

    fn check_features(&self) -> Result<()> {
        self.dev_ops.check_features(self)
    }

    fn enqueue(&self, queue: usize, req: &mut VirtioReq<'_>) {
        self.dev_ops.enqueue(self, queue, req)
    }

    fn try_acquire_queue(&self, queue: usize) -> bool {
        self.dev_ops.try_acquire_queue(self, queue)
    }

    fn acquire_queue(&self, queue: usize) {
        self.dev_ops.acquire_queue(self, queue)
    }

    fn release_queue(&self, queue: usize) {
        self.dev_ops.release_queue(self, queue)
    }
}

/// Disk descriptor handed to [`BlkBridge::disk_add`].
///
/// `ops` and `dev_ops` default to [`FileBlockOps`] and [`DefaultBlkOps`].
pub struct Disk {
    pub handle: DiskHandle,
    pub ops: Option<Arc<dyn BlockOps>>,
    pub dev_ops: Option<Arc<dyn BlkDeviceOps>>,
    dev: Option<Arc<VirtioBlkDev>>,
}

impl Disk {
    pub fn new(handle: DiskHandle) -> Self {
        Self {
            handle,
            ops: None,
            dev_ops: None,
            dev: None,
        }
    }

    pub fn from_file(file: File) -> Self {
        Self::new(DiskHandle::from_file(file))
    }

    pub fn with_block_ops(mut self, ops: Arc<dyn BlockOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    pub fn with_device_ops(mut self, dev_ops: Arc<dyn BlkDeviceOps>) -> Self {
        self.dev_ops = Some(dev_ops);
        self
    }

    /// The registered device, if any.
    pub fn dev(&self) -> Option<&Arc<VirtioBlkDev>> {
        self.dev.as_ref()
    }
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("handle", &self.handle)
            .field("custom_ops", &self.ops.is_some())
            .field("custom_dev_ops", &self.dev_ops.is_some())
            .field("dev", &self.dev)
            .finish()
    }
}

/// Registers host disks as virtio-blk devices on a transport.
pub struct BlkBridge {
    host: Arc<dyn HostOps>,
    transport: Arc<dyn VirtioTransport>,
}

impl BlkBridge {
    pub fn new(host: Arc<dyn HostOps>, transport: Arc<dyn VirtioTransport>) -> Self {
        Self { host, transport }
    }

    /// Create a virtio-blk device for `disk` and register it with the transport.
    ///
    /// Returns the transport id. On failure nothing allocated here is left behind. A disk that
    /// already carries a device is rejected with [`LklError::InvalidArgument`].
    pub fn disk_add(&self, disk: &mut Disk) -> Result<u32> {
        if disk.dev.is_some() {
            return Err(LklError::InvalidArgument("disk already has a virtio device"));
        }
        let mut config = HostBlock::alloc(&self.host, VirtioBlkConfig::SIZE)?;

        let ops: Arc<dyn BlockOps> = match &disk.ops {
            Some(ops) => ops.clone(),
            None => Arc::new(FileBlockOps),
        };
        let dev_ops: Arc<dyn BlkDeviceOps> = match &disk.dev_ops {
            Some(dev_ops) => dev_ops.clone(),
            None => Arc::new(DefaultBlkOps),
        };

        let queue_locks = QueueLocks::alloc(&self.host, NUM_QUEUES)?;

        let bytes = ops.get_capacity(&disk.handle).map_err(|err| {
            tracing::debug!("virtio-blk get_capacity failed: {err}");
            LklError::ResourceExhausted("virtio-blk capacity")
        })?;
        let cfg = VirtioBlkConfig::from_capacity_bytes(bytes);
        config.bytes_mut().copy_from_slice(&cfg.to_bytes());

        let dev = Arc::new(VirtioBlkDev {
            dev: VirtioDev::new(VIRTIO_ID_BLOCK, 0),
            config,
            capacity: cfg.capacity,
            ops,
            dev_ops,
            disk: disk.handle.clone(),
            queue_locks,
            host: self.host.clone(),
            id: OnceLock::new(),
        });

        let id = self.transport.setup(dev.clone(), NUM_QUEUES, QUEUE_DEPTH)?;
        let _ = dev.id.set(id);
        tracing::info!(
            "virtio-blk device {id} registered ({} sectors)",
            cfg.capacity
        );
        disk.dev = Some(dev);
        Ok(id)
    }

    /// Unregister the device created for `disk`.
    ///
    /// If the transport refuses, its error is returned and the device (and its memory) stays
    /// attached to `disk` so the removal can be retried.
    pub fn disk_remove(&self, disk: &mut Disk) -> Result<()> {
        let dev = disk
            .dev
            .as_ref()
            .ok_or(LklError::InvalidArgument("disk has no virtio device"))?;
        let id = dev
            .id()
            .ok_or(LklError::InvalidArgument("virtio device was never registered"))?;

        self.transport.cleanup(id)?;

        disk.dev = None;
        tracing::info!("virtio-blk device {id} removed");
        Ok(())
    }
}
