//! Run a guest kernel as a library inside the host process.
//!
//! This crate re-exports the pieces an embedder needs:
//!
//! - [`host`]: the host capability table ([`HostOps`]) and its std implementation
//! - [`boot`]: booting and halting the guest ([`Lkl`], [`lkl_start!`])
//! - [`virtio`]: exposing host disks to the guest as virtio-blk devices

pub use lkl_boot as boot;
pub use lkl_host as host;
pub use lkl_virtio as virtio;

pub use lkl_boot::{lkl_start, BootParams, GuestKernel, Lkl};
pub use lkl_host::{HostOps, LklError, Result, StdHost, StdHostConfig};
pub use lkl_virtio::{BlkBridge, Disk, DiskHandle, MmioBus};
