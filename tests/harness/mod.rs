#![allow(dead_code)]

use lkl::boot::kernel::NR_REBOOT;
use lkl::boot::{fs_setup, Binfmt, ExecImage, InitBinfmt, LinuxBinprm, Personality, INIT_PATH};
use lkl::host::{HostThreadId, LklError};
use lkl::virtio::blk::{LKL_DEV_BLK_TYPE_FLUSH, LKL_DEV_BLK_TYPE_READ, LKL_DEV_BLK_TYPE_WRITE};
use lkl::virtio::VirtioReq;
use lkl::{BootParams, GuestKernel, HostOps, MmioBus};

use std::sync::{Arc, Condvar, Mutex, Weak};

/// `read(2)`-numbered syscall: read args[2] bytes at sector args[1] of virtio device args[0].
pub const NR_BLK_READ: i64 = 63;
/// `write(2)`-numbered syscall: write args[2] bytes of value args[3] at sector args[1].
pub const NR_BLK_WRITE: i64 = 64;
/// `fsync(2)`-numbered syscall: flush virtio device args[0].
pub const NR_BLK_FLUSH: i64 = 82;

const EIO: i64 = 5;
const ENOSYS: i64 = 38;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal guest: boots through `/init`, drives the virtio-blk devices it finds on the bus as
/// a guest driver would, and idles until rebooted.
pub struct HarnessKernel {
    me: Weak<HarnessKernel>,
    host: Arc<dyn HostOps>,
    bus: Arc<MmioBus>,
    binfmts: Mutex<Vec<Arc<dyn Binfmt>>>,
    params: Mutex<Option<BootParams>>,
    init_thread: Mutex<Option<HostThreadId>>,
    negotiated: Mutex<Vec<u32>>,
    last_read: Mutex<Vec<u8>>,
    shutdown: Mutex<bool>,
    shutdown_cond: Condvar,
}

impl HarnessKernel {
    pub fn new(host: Arc<dyn HostOps>, bus: Arc<MmioBus>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            host,
            bus,
            binfmts: Mutex::new(Vec::new()),
            params: Mutex::new(None),
            init_thread: Mutex::new(None),
            negotiated: Mutex::new(Vec::new()),
            last_read: Mutex::new(Vec::new()),
            shutdown: Mutex::new(false),
            shutdown_cond: Condvar::new(),
        })
    }

    pub fn params(&self) -> Option<BootParams> {
        self.params.lock().unwrap().clone()
    }

    /// Devices whose features were accepted during boot.
    pub fn negotiated(&self) -> Vec<u32> {
        self.negotiated.lock().unwrap().clone()
    }

    pub fn last_read(&self) -> Vec<u8> {
        self.last_read.lock().unwrap().clone()
    }

    /// Probe every `virtio_mmio.device=` entry and accept exactly what each device offers.
    fn probe_devices(&self, params: &BootParams) {
        let count = params
            .command_line
            .as_str()
            .split_ascii_whitespace()
            .filter(|p| p.starts_with("virtio_mmio.device="))
            .count();
        for id in 0..count as u32 {
            let Ok(features) = self.bus.device_features(id) else {
                continue;
            };
            if self.bus.negotiate(id, features).is_ok() {
                self.negotiated.lock().unwrap().push(id);
            }
        }
    }

    fn run_init(&self) {
        let bprm = LinuxBinprm::new(INIT_PATH);
        let binfmts = self.binfmts.lock().unwrap().clone();
        let mut image = NullImage;
        for binfmt in binfmts {
            match binfmt.load_binary(self, &bprm, &mut image) {
                Err(LklError::InvalidExecutable(_)) => continue,
                _ => return,
            }
        }
    }

    fn blk_request(&self, id: u32, req_type: u32, sector: u64, data: &mut [u8]) -> i64 {
        let mut hdr = [0u8; 16];
        hdr[0..4].copy_from_slice(&req_type.to_le_bytes());
        hdr[8..16].copy_from_slice(&sector.to_le_bytes());
        let mut status = [0xffu8; 1];

        let mut req = VirtioReq::new(vec![&mut hdr[..], data, &mut status[..]], |_| {});
        if self.bus.dispatch(id, 0, &mut req).is_err() {
            return -EIO;
        }
        drop(req);
        i64::from(status[0])
    }
}

impl GuestKernel for HarnessKernel {
    fn cpu_init(&self) -> Result<(), i32> {
        Ok(())
    }

    fn start_kernel(&self, params: BootParams, init: Arc<InitBinfmt>) {
        self.probe_devices(&params);
        *self.params.lock().unwrap() = Some(params);
        fs_setup(self, init);

        let Some(me) = self.me.upgrade() else {
            return;
        };
        *self.init_thread.lock().unwrap() = self.host.thread_create(Box::new(move || me.run_init()));

        let mut shutdown = self.shutdown.lock().unwrap();
        while !*shutdown {
            shutdown = self.shutdown_cond.wait(shutdown).unwrap();
        }
    }

    fn cpu_change_owner(&self, _owner: HostThreadId) {}

    fn cpu_put(&self) {}

    fn syscall(&self, nr: i64, args: [i64; 6]) -> i64 {
        let id = args[0] as u32;
        let sector = args[1] as u64;
        match nr {
            NR_BLK_READ => {
                let mut data = vec![0u8; args[2] as usize];
                let status = self.blk_request(id, LKL_DEV_BLK_TYPE_READ, sector, &mut data);
                *self.last_read.lock().unwrap() = data;
                status
            }
            NR_BLK_WRITE => {
                let mut data = vec![args[3] as u8; args[2] as usize];
                self.blk_request(id, LKL_DEV_BLK_TYPE_WRITE, sector, &mut data)
            }
            NR_BLK_FLUSH => self.blk_request(id, LKL_DEV_BLK_TYPE_FLUSH, 0, &mut []),
            NR_REBOOT => {
                *self.shutdown.lock().unwrap() = true;
                self.shutdown_cond.notify_all();
                0
            }
            _ => -ENOSYS,
        }
    }

    fn cpu_wait_shutdown(&self) {}

    fn syscalls_init(&self) {}

    fn syscalls_cleanup(&self) {}

    fn threads_cleanup(&self) {
        if let Some(tid) = self.init_thread.lock().unwrap().take() {
            self.host.thread_join(tid).unwrap();
        }
    }

    fn tick_suspend_local(&self) {}

    fn free_mem(&self) {}

    fn create_file(&self, _path: &str, _mode: u32) -> Result<(), i32> {
        Ok(())
    }

    fn register_binfmt(&self, binfmt: Arc<dyn Binfmt>) {
        self.binfmts.lock().unwrap().push(binfmt);
    }

    fn clear_child_reaper(&self) {}
}

struct NullImage;

impl ExecImage for NullImage {
    fn flush_old_exec(&mut self, _bprm: &LinuxBinprm) -> Result<(), i32> {
        Ok(())
    }

    fn set_personality(&mut self, _personality: Personality) {}

    fn setup_new_exec(&mut self, _bprm: &LinuxBinprm) {}

    fn install_exec_creds(&mut self, _bprm: &LinuxBinprm) {}

    fn set_binfmt(&mut self, _binfmt: &dyn Binfmt) {}
}
