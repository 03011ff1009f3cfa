// Licensed under the Apache-2.0 license

//! Test-bench helpers wiring the AXI DMA driver to the register-model
//! engine over one shared backing file that stands in for physical memory.

#[cfg(test)]
mod scenarios;

use std::thread;
use std::time::Duration;

use axidma::{DmaController, MemDevice, PollTuning};
use axidma_emulator::{AxiDmaEngine, EngineConfig, EngineHandle};

/// AXI DMA register window base.
pub const REG_BASE: u64 = 0x4040_0000;
/// Physical region holding the descriptor ring.
pub const BD_BASE: u64 = 0x1000_0000;
/// Physical base of the data target buffer.
pub const TGT: u32 = 0x7000_0000;

/// A driver and an engine sharing one sparse backing file.
pub struct TestBench {
    pub mem: MemDevice,
    pub engine: EngineHandle,
    pub ctrl: DmaController,
}

pub fn bench(config: EngineConfig) -> TestBench {
    bench_with_tuning(config, PollTuning::default())
}

pub fn bench_with_tuning(config: EngineConfig, tuning: PollTuning) -> TestBench {
    let file = tempfile::tempfile().unwrap();
    // Sparse; only touched pages materialize.
    file.set_len(0x8000_0000).unwrap();
    let mem = MemDevice::from_file(file);
    let engine = AxiDmaEngine::spawn(mem.try_clone().unwrap(), REG_BASE, config).unwrap();
    let ctrl = DmaController::with_device(mem.try_clone().unwrap(), REG_BASE, tuning).unwrap();
    TestBench { mem, engine, ctrl }
}

/// Pins the adaptive poll period at its maximum, which selects the
/// block-granular receive path for a fresh transfer.
pub fn block_mode_tuning() -> PollTuning {
    PollTuning {
        min_wait_us: 100,
        max_wait_us: 100,
        ..PollTuning::default()
    }
}

/// Gives the engine thread time to observe the latest register writes.
pub fn settle() {
    thread::sleep(Duration::from_millis(2));
}
