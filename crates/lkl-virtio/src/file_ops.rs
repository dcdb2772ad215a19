use crate::blk::{
    BlkRequest, BlockOps, DiskHandle, LKL_DEV_BLK_STATUS_IOERR, LKL_DEV_BLK_STATUS_OK,
    LKL_DEV_BLK_STATUS_UNSUP, LKL_DEV_BLK_TYPE_FLUSH, LKL_DEV_BLK_TYPE_FLUSH_OUT,
    LKL_DEV_BLK_TYPE_READ, LKL_DEV_BLK_TYPE_WRITE, VIRTIO_BLK_SECTOR_SIZE,
};
use lkl_host::{LklError, Result};

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, PoisonError};

/// Block callbacks backed by a host file ([`DiskHandle::File`]).
///
/// Data buffers are transferred back to back starting at `sector * 512`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileBlockOps;

fn file(disk: &DiskHandle) -> Result<&Mutex<File>> {
    match disk {
        DiskHandle::File(file) => Ok(file),
        DiskHandle::Opaque(_) => Err(LklError::InvalidArgument("disk handle is not a host file")),
    }
}

fn transfer(file: &mut File, req: &mut BlkRequest<'_, '_>) -> io::Result<u8> {
    let offset = req
        .sector
        .checked_mul(VIRTIO_BLK_SECTOR_SIZE)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "sector out of range"))?;

    match req.req_type {
        LKL_DEV_BLK_TYPE_READ => {
            file.seek(SeekFrom::Start(offset))?;
            for buf in req.bufs.iter_mut() {
                file.read_exact(buf)?;
            }
        }
        LKL_DEV_BLK_TYPE_WRITE => {
            file.seek(SeekFrom::Start(offset))?;
            for buf in req.bufs.iter() {
                file.write_all(buf)?;
            }
        }
        LKL_DEV_BLK_TYPE_FLUSH | LKL_DEV_BLK_TYPE_FLUSH_OUT => file.sync_all()?,
        _ => return Ok(LKL_DEV_BLK_STATUS_UNSUP),
    }
    Ok(LKL_DEV_BLK_STATUS_OK)
}

impl BlockOps for FileBlockOps {
    fn get_capacity(&self, disk: &DiskHandle) -> Result<u64> {
        let file = file(disk)?.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(file.metadata()?.len())
    }

    fn request(&self, disk: &DiskHandle, req: &mut BlkRequest<'_, '_>) -> u8 {
        let Ok(file) = file(disk) else {
            return LKL_DEV_BLK_STATUS_IOERR;
        };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        match transfer(&mut file, req) {
            Ok(status) => status,
            Err(err) => {
                tracing::debug!(
                    "virtio-blk request type {} at sector {} failed: {err}",
                    req.req_type,
                    req.sector
                );
                LKL_DEV_BLK_STATUS_IOERR
            }
        }
    }
}
