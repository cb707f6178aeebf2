//! Launch semantics of the CPU emulator: coordinates, barriers, atomics.

use std::sync::OnceLock;

use cudify_runtime::kernel;
use cudify_runtime::{DeviceBuffer, Dim3, Emulator, LaunchConfig, Result, RuntimeConfig};
use proptest::prelude::*;

fn emulator() -> &'static Emulator {
    static EMULATOR: OnceLock<Emulator> = OnceLock::new();
    EMULATOR.get_or_init(|| {
        cudify_tracing::init_test_tracing();
        Emulator::new(
            RuntimeConfig::default()
                .with_workers(3)
                .with_fiber_stack_size(128 * 1024)
                .with_prespawn_fibers(8),
        )
        .expect("emulator")
    })
}

fn dim3() -> impl Strategy<Value = Dim3> {
    (1u32..4, 1u32..3, 1u32..3).prop_map(|(x, y, z)| Dim3::new(x, y, z))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_thread_sees_the_coordinates_it_was_bound_to(grid in dim3(), block in dim3()) {
        let config = LaunchConfig::new(grid, block);
        let total = config.total_threads() as usize;
        let seen_block = DeviceBuffer::<u64>::zeroed(total);
        let seen_thread = DeviceBuffer::<u64>::zeroed(total);
        let visits = DeviceBuffer::<u32>::zeroed(total);
        let mismatches = DeviceBuffer::<u32>::zeroed(1);

        emulator().launch(&config, |t| {
            let i = t.global_index() as usize;
            if kernel::thread_idx() != t.thread_idx()
                || kernel::block_idx() != t.block_idx()
                || kernel::block_dim() != block
                || kernel::grid_dim() != grid
                || !t.thread_idx().is_within(block)
                || !t.block_idx().is_within(grid)
            {
                mismatches.set(0, mismatches.get(0) + 1);
            }
            seen_block.set(i, t.block_idx().linear_in(grid));
            seen_thread.set(i, t.thread_idx().linear_in(block));
            visits.set(i, visits.get(i) + 1);
        }).unwrap();

        prop_assert_eq!(mismatches.get(0), 0);
        let per_block = config.threads_per_block();
        for i in 0..total {
            prop_assert_eq!(visits.get(i), 1);
            prop_assert_eq!(seen_block.get(i), i as u64 / per_block);
            prop_assert_eq!(seen_thread.get(i), i as u64 % per_block);
        }
    }
}

#[test]
fn no_thread_passes_a_barrier_before_its_block_arrives() -> Result<()> {
    const BARRIERS: u64 = 3;
    let config = LaunchConfig::new((4, 1, 1), (8, 2, 1));
    let per_block = config.threads_per_block() as usize;
    let arrived = DeviceBuffer::<u64>::zeroed(config.total_threads() as usize);
    let violations = DeviceBuffer::<u32>::zeroed(1);

    emulator().launch(&config, |t| {
        let i = t.global_index() as usize;
        let base = i - (i % per_block);
        for generation in 1..=BARRIERS {
            arrived.set(i, generation);
            t.sync_threads();
            assert_eq!(t.barrier_generation(), generation);
            let early = (base..base + per_block).any(|j| arrived.get(j) < generation);
            if early {
                violations.set(0, violations.get(0) + 1);
            }
        }
    })?;

    assert_eq!(violations.get(0), 0);
    assert!(arrived.to_vec().iter().all(|&g| g == BARRIERS));
    Ok(())
}

#[test]
fn emulated_atomics_do_not_lose_updates() -> Result<()> {
    const ADDS: i32 = 25;
    let config = LaunchConfig::new((6, 1, 1), (32, 1, 1));
    let counters = DeviceBuffer::<i32>::zeroed(6);

    emulator().launch(&config, |t| {
        let cell = t.block_idx().x as usize;
        for _ in 0..ADDS {
            let before = kernel::atomic_add(&counters, cell, 1);
            assert_eq!(t.scratch().add(), before);
            t.sync_threads();
        }
    })?;

    assert_eq!(counters.to_vec(), vec![ADDS * 32; 6]);
    Ok(())
}

#[test]
fn atomic_sub_returns_previous_values() -> Result<()> {
    let config = LaunchConfig::linear(16, 16);
    let counter = DeviceBuffer::from_slice(&[16]);
    let previous = DeviceBuffer::<i32>::zeroed(16);

    emulator().launch(&config, |t| {
        let old = t.atomic_sub(&counter, 0, 1);
        assert_eq!(t.scratch().rem(), old);
        previous.set(t.thread_idx().x as usize, old);
    })?;

    assert_eq!(counter.get(0), 0);
    let mut seen = previous.to_vec();
    seen.sort_unstable();
    assert_eq!(seen, (1..=16).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn four_threads_count_then_write_their_index() -> Result<()> {
    let counter = DeviceBuffer::<i32>::zeroed(1);
    let out = DeviceBuffer::<u32>::zeroed(4);

    emulator().launch(&LaunchConfig::new(Dim3::ONE, Dim3::linear(4)), |t| {
        t.atomic_add(&counter, 0, 1);
        kernel::sync_threads();
        assert_eq!(counter.get(0), 4);
        out.set(kernel::thread_idx().x as usize, kernel::thread_idx().x);
    })?;

    assert_eq!(counter.get(0), 4);
    assert_eq!(out.to_vec(), vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn kernels_can_call_deep_helpers_that_hit_barriers() -> Result<()> {
    fn reduce(shared: &DeviceBuffer<u64>, lane: usize, width: usize) {
        if width == 1 {
            return;
        }
        let half = width / 2;
        if lane < half {
            shared.set(lane, shared.get(lane) + shared.get(lane + half));
        }
        kernel::sync_threads();
        reduce(shared, lane, half);
    }

    let shared = DeviceBuffer::from_slice(&(1..=64).collect::<Vec<u64>>());
    emulator().launch(&LaunchConfig::linear(64, 64), |t| {
        reduce(&shared, t.thread_idx().x as usize, 64);
    })?;

    assert_eq!(shared.get(0), 64 * 65 / 2);
    Ok(())
}

#[test]
fn full_size_blocks_on_many_workers_stay_within_the_fiber_budget() -> Result<()> {
    const MAX_FIBERS: usize = 2048;
    let emu = Emulator::new(
        RuntimeConfig::default()
            .with_workers(32)
            .with_fiber_stack_size(64 * 1024)
            .with_max_fibers(MAX_FIBERS),
    )?;

    let wide = LaunchConfig::linear(1024 * 8, 1024);
    let out = DeviceBuffer::<u32>::zeroed(wide.total_threads() as usize);
    emu.launch(&wide, |t| {
        t.sync_threads();
        out.set(t.global_index() as usize, t.block_idx().x + 1);
    })?;
    assert!(out.to_vec().iter().enumerate().all(|(i, &b)| b == (i / 1024) as u32 + 1));

    let narrow = LaunchConfig::linear(32 * 64, 32);
    emu.launch(&narrow, |t| t.sync_threads())?;

    let stats = emu.stats();
    assert_eq!(stats.blocks, 8 + 64);
    assert!(stats.fibers_peak as usize <= MAX_FIBERS, "peak {}", stats.fibers_peak);
    assert!(stats.fibers_live as usize <= MAX_FIBERS / 2);
    Ok(())
}
