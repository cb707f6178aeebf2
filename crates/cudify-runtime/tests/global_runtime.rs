//! The process-wide emulator. Kept in its own test binary so no other test
//! initialises it first.

use cudify_runtime::emulation::{self, Emulator};
use cudify_runtime::{BackendError, DeviceBuffer, LaunchConfig, RuntimeConfig};
use serial_test::serial;

fn config() -> RuntimeConfig {
    RuntimeConfig::default().with_workers(2).with_fiber_stack_size(96 * 1024)
}

#[test]
#[serial]
fn init_is_idempotent_for_the_same_configuration() {
    let first: &Emulator = emulation::init(config()).unwrap();
    assert!(emulation::is_initialized());
    let again = emulation::init(config()).unwrap();
    assert!(std::ptr::eq(first, again));
    assert!(std::ptr::eq(first, emulation::global().unwrap()));

    let err = emulation::init(config().with_workers(7)).unwrap_err();
    assert!(matches!(err, BackendError::AlreadyInitialized));
}

#[test]
#[serial]
fn free_launch_uses_the_global_emulator() {
    emulation::init(config()).unwrap();
    let before = emulation::global().unwrap().stats();

    let out = DeviceBuffer::<u32>::zeroed(12);
    emulation::launch(&LaunchConfig::linear(12, 4), |t| {
        out.set(t.global_index() as usize, t.block_idx().x);
    })
    .unwrap();

    assert_eq!(out.to_vec(), vec![0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2]);
    let after = emulation::global().unwrap().stats();
    assert_eq!(after.launches, before.launches + 1);
    assert_eq!(after.blocks, before.blocks + 3);
}
