//! Virtio plumbing for the library kernel.
//!
//! - [`dev`]: generic device header, the request type and the device/transport traits
//! - [`mmio`]: the virtio-mmio device registry ([`MmioBus`])
//! - [`blk`]: the virtio-blk bridge that exposes a host disk to the guest

pub mod blk;
pub mod dev;
mod file_ops;
pub mod mmio;

pub use blk::{
    BlkBridge, BlkDeviceOps, BlkRequest, BlockOps, DefaultBlkOps, Disk, DiskHandle,
    VirtioBlkConfig, VirtioBlkDev,
};
pub use dev::{VirtioDev, VirtioDeviceOps, VirtioReq, VirtioTransport};
pub use file_ops::FileBlockOps;
pub use mmio::{MmioBus, MmioBusConfig, MmioWindow};
