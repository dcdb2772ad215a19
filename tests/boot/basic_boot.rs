#[path = "../harness/mod.rs"]
mod harness;

use harness::{init_tracing, HarnessKernel};
use lkl::host::TrackingHost;
use lkl::{lkl_start, Lkl, LklError, MmioBus, StdHost, StdHostConfig};

use std::sync::Arc;

#[test]
fn boots_and_halts_on_std_host() {
    init_tracing();
    let bus = Arc::new(MmioBus::default());
    let host = Arc::new(
        StdHost::new(StdHostConfig {
            thread_name: Some("guest".to_string()),
            stack_size: Some(512 * 1024),
        })
        .with_device_enumeration(bus.clone()),
    );
    let kernel = HarnessKernel::new(host.clone(), bus);
    let lkl = Lkl::new(host, kernel.clone());

    assert!(!lkl.is_running());
    lkl_start!(lkl, "mem={} console=hvc0", "64M").unwrap();
    assert!(lkl.is_running());

    let params = kernel.params().unwrap();
    assert_eq!(params.command_line.as_str(), "mem=64M console=hvc0");
    assert_eq!(params.mem_size, 64 << 20);
    assert!(kernel.negotiated().is_empty());

    lkl.halt().unwrap();
    assert!(!lkl.is_running());
}

#[test]
fn boot_and_halt_leave_no_host_allocations() {
    init_tracing();
    let bus = Arc::new(MmioBus::default());
    let host = Arc::new(TrackingHost::default());
    let kernel = HarnessKernel::new(host.clone(), bus);
    let lkl = Lkl::new(host.clone(), kernel);

    let baseline = host.stats();
    lkl_start!(lkl, "").unwrap();
    assert_eq!(host.stats(), baseline);
    lkl.halt().unwrap();
    assert_eq!(host.stats(), baseline);

    let err = lkl_start!(lkl, "again").unwrap_err();
    assert!(matches!(err, LklError::InvalidArgument(_)));
}
