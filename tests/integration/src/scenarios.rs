// Licensed under the Apache-2.0 license

use std::time::Duration;

use axidma::regs::{DESC_BUFFER_ADDRESS, DESC_CONTROL, DESC_NXTDESC, DESC_SIZE};
use axidma::{Channel, DmaError};
use axidma_emulator::EngineConfig;

use crate::{bench, bench_with_tuning, block_mode_tuning, settle, BD_BASE, TGT};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_direct_s2mm_single_transfer() {
    init_logging();
    let mut b = bench(EngineConfig {
        sg_included: false,
        transfer_delay: Duration::from_micros(500),
        ..EngineConfig::default()
    });
    b.ctrl.set_channel(Channel::S2mm);
    assert!(!b.ctrl.is_sg().unwrap());

    b.ctrl.init_direct(4096, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();

    assert!(b.ctrl.rx(10_000).unwrap());
    assert_eq!(b.ctrl.block_offset(), 0);
    assert_eq!(b.ctrl.block_size(), 4096);
    assert!(b.ctrl.irq_ioc().unwrap());
    b.ctrl.clear_irq_ioc().unwrap();
    assert!(!b.ctrl.irq_ioc().unwrap());

    // The engine wrote its pattern into the target buffer.
    let data = b.mem.map(TGT as u64, 4096).unwrap();
    assert_eq!(data.read_u32(0).to_le_bytes(), [0, 1, 2, 3]);
}

#[test]
fn test_sg_ring_layout_in_descriptor_memory() {
    init_logging();
    let mut b = bench(EngineConfig::default());
    b.ctrl.set_channel(Channel::S2mm);
    assert!(b.ctrl.is_sg().unwrap());

    b.ctrl.init_sg(BD_BASE, 4, 2048, TGT).unwrap();

    let bd = b.mem.map(BD_BASE, 4 * DESC_SIZE).unwrap();
    let expected_next = [0x1000_0040, 0x1000_0080, 0x1000_00C0, 0];
    let expected_buf = [0x7000_0000, 0x7000_0800, 0x7000_1000, 0x7000_1800];
    for i in 0..4usize {
        assert_eq!(bd.read_u32(i * DESC_SIZE + DESC_NXTDESC), expected_next[i]);
        assert_eq!(
            bd.read_u32(i * DESC_SIZE + DESC_BUFFER_ADDRESS),
            expected_buf[i]
        );
        assert_eq!(bd.read_u32(i * DESC_SIZE + DESC_CONTROL), 2048);
    }
}

#[test]
fn test_sg_block_granular_progress() {
    init_logging();
    // One completion, then the engine stalls: deterministic partial
    // progress for the block-granular path.
    let mut b = bench_with_tuning(
        EngineConfig {
            transfer_delay: Duration::from_micros(200),
            completion_limit: Some(1),
            ..EngineConfig::default()
        },
        block_mode_tuning(),
    );
    b.ctrl.set_channel(Channel::S2mm);
    b.ctrl.init_sg(BD_BASE, 4, 2048, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();

    assert!(b.ctrl.rx(500_000).unwrap());
    assert_eq!(b.ctrl.block_offset(), 0);
    assert_eq!(b.ctrl.block_size(), 2048);
    assert_eq!(b.ctrl.bd_stop_index(), Some(0));
    assert_eq!(b.ctrl.bd_start_index(), Some(1));
    // More descriptors are still outstanding.
    assert!(b.ctrl.transfer_pending());
}

#[test]
fn test_sg_buffer_granular_completion() {
    init_logging();
    let mut b = bench(EngineConfig {
        transfer_delay: Duration::from_micros(100),
        ..EngineConfig::default()
    });
    b.ctrl.set_channel(Channel::S2mm);
    b.ctrl.init_sg(BD_BASE, 4, 2048, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();

    // The adaptive period starts below its maximum, so a fresh receive
    // waits for the whole ring.
    assert!(b.ctrl.rx(0).unwrap());
    assert_eq!(b.ctrl.block_offset(), 0);
    assert_eq!(b.ctrl.block_size(), 4 * 2048);
    assert!(!b.ctrl.transfer_pending());

    // Every block carries the engine's per-descriptor seed.
    for i in 0..4u32 {
        let block = b.mem.map(TGT as u64 + 2048 * i as u64, 4).unwrap();
        assert_eq!(block.read_u32(0).to_le_bytes()[0], i as u8);
    }

    // The completion arrived within a couple of polls, so the calibrator
    // halves the period.
    assert_eq!(b.ctrl.current_wait_us(), 4_950 / 2);
}

#[test]
fn test_adaptive_calibration_slow_completion() {
    init_logging();
    let mut b = bench(EngineConfig {
        sg_included: false,
        transfer_delay: Duration::from_millis(250),
        ..EngineConfig::default()
    });
    b.ctrl.set_channel(Channel::S2mm);
    b.ctrl.init_direct(4096, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();

    assert_eq!(b.ctrl.current_wait_us(), 4_950);
    // ~50 polls at the current period before the engine goes idle: the
    // calibrator doubles the period.
    assert!(b.ctrl.rx(0).unwrap());
    assert_eq!(b.ctrl.current_wait_us(), 9_900);
}

#[test]
fn test_sg_window_rerun() {
    init_logging();
    let mut b = bench(EngineConfig {
        transfer_delay: Duration::from_micros(100),
        ..EngineConfig::default()
    });
    b.ctrl.set_channel(Channel::S2mm);
    b.ctrl.init_sg(BD_BASE, 4, 2048, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();
    assert!(b.ctrl.rx(0).unwrap());

    // Between runs, slide the ring over the next stretch of the target
    // buffer and run it again.
    b.ctrl.advance_sg_window(1).unwrap();
    assert_eq!(b.ctrl.sg_buffer_address(0).unwrap(), TGT + 4 * 2048);
    b.ctrl.run().unwrap();
    settle();

    assert!(b.ctrl.rx(0).unwrap());
    assert_eq!(b.ctrl.block_size(), 4 * 2048);
    let block = b.mem.map(TGT as u64 + 4 * 2048, 4).unwrap();
    assert_eq!(block.read_u32(0).to_le_bytes()[0], 0);
}

#[test]
fn test_precondition_enforcement() {
    init_logging();
    let mut b = bench(EngineConfig::default());

    match b.ctrl.halt().unwrap_err() {
        DmaError::ChannelNotSet { op } => assert_eq!(op, "halt"),
        other => panic!("unexpected error {other}"),
    }

    b.ctrl.set_channel(Channel::S2mm);
    assert!(b.ctrl.is_sg().unwrap());
    match b.ctrl.init_direct(4096, TGT).unwrap_err() {
        DmaError::WrongMode { op, .. } => assert_eq!(op, "init_direct"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn test_status_reporting() {
    init_logging();
    let mut b = bench(EngineConfig::default());
    b.ctrl.set_channel(Channel::S2mm);
    let status = b.ctrl.status().unwrap();
    assert!(status.halted && status.sg_included && !status.any_error());
    b.ctrl.log_status().unwrap();

    b.ctrl.init_sg(BD_BASE, 4, 2048, TGT).unwrap();
    b.ctrl.run().unwrap();
    settle();
    assert!(b.ctrl.is_running().unwrap());
    b.ctrl.halt().unwrap();
    settle();
    assert!(!b.ctrl.is_running().unwrap());
}
