// Licensed under the Apache-2.0 license

//! Register-model emulation of an AXI DMA engine.
//!
//! The engine thread plays the hardware side of the register protocol over
//! the same backing file a driver under test maps its windows from: it
//! honors run/halt/soft-reset, completes direct transfers after a
//! configurable delay, walks scatter-gather descriptor chains writing
//! completion status back, counts the DMASR completion threshold down and
//! raises Idle/IOC the way the IP does. The S2MM channel additionally fills
//! each completed data block with a recognizable pattern.
//!
//! Only volatile word accesses are performed on the shared windows, and no
//! typed references into descriptor memory are retained between steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::warn;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};

use axidma::regs::{
    channel_block, ChannelRegs, Status, AXI_DMA_DEPTH, DESC_BUFFER_ADDRESS, DESC_CONTROL,
    DESC_LENGTH_MASK, DESC_NXTDESC, DESC_SIZE, DESC_STATUS, DESC_STATUS_CMPLT, DMACR_RESET,
    DMACR_RS, MM2S_BASE, S2MM_BASE,
};
use axidma::{Mapping, MemDevice, Result};

/// Behavior of an emulated engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Models the synthesis-time scatter-gather option (DMASR bit 3).
    pub sg_included: bool,
    /// Completion latency: per transfer in direct mode, per descriptor in
    /// scatter-gather mode.
    pub transfer_delay: Duration,
    /// Stop after this many descriptor completions per arm, for tests that
    /// need deterministic partial progress.
    pub completion_limit: Option<u32>,
    /// Engine poll granularity.
    pub tick: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sg_included: true,
            transfer_delay: Duration::from_micros(100),
            completion_limit: None,
            tick: Duration::from_micros(20),
        }
    }
}

/// A running engine model. Stopping (or dropping) the handle joins the
/// engine thread.
#[derive(Debug)]
pub struct EngineHandle {
    exit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn stop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct AxiDmaEngine;

impl AxiDmaEngine {
    /// Maps the register window at `base_addr` through `mem`, writes the
    /// reset values both channels come out of reset with, and starts the
    /// engine thread.
    pub fn spawn(mem: MemDevice, base_addr: u64, config: EngineConfig) -> Result<EngineHandle> {
        let regs = mem.map(base_addr, AXI_DMA_DEPTH)?;
        for base in [MM2S_BASE, S2MM_BASE] {
            let ch = unsafe { channel_block(regs.as_ptr(), base) };
            ch.dmacr.set(0);
            ch.dmasr.set(reset_status(config.sg_included));
            ch.curdesc.set(0);
            ch.taildesc.set(0);
            ch.address.set(0);
            ch.length.set(0);
        }

        let engine = Engine {
            regs,
            mem,
            config,
            chans: [ChanState::new(MM2S_BASE, false), ChanState::new(S2MM_BASE, true)],
        };
        let exit = Arc::new(AtomicBool::new(false));
        let thread_exit = exit.clone();
        let thread = thread::spawn(move || engine.run(thread_exit));
        Ok(EngineHandle {
            exit,
            thread: Some(thread),
        })
    }
}

/// Halted, plus the scatter-gather capability bit when configured.
fn reset_status(sg_included: bool) -> u32 {
    0x1 | if sg_included { 0x8 } else { 0x0 }
}

struct Engine {
    regs: Mapping,
    mem: MemDevice,
    config: EngineConfig,
    chans: [ChanState; 2],
}

struct ChanState {
    base: usize,
    /// S2MM produces data into memory; MM2S only consumes it.
    fills_data: bool,
    active: Option<Active>,
}

impl ChanState {
    fn new(base: usize, fills_data: bool) -> Self {
        Self {
            base,
            fills_data,
            active: None,
        }
    }
}

enum Active {
    Direct {
        addr: u32,
        len: u32,
        started: Instant,
    },
    Sg(SgWalk),
}

struct SgWalk {
    ring: Mapping,
    ring_base: u32,
    cur: u32,
    tail: u32,
    ndesc: u32,
    remaining: u32,
    done: u32,
    started: Instant,
}

impl Engine {
    fn run(mut self, exit: Arc<AtomicBool>) {
        while !exit.load(Ordering::Relaxed) {
            self.step();
            thread::sleep(self.config.tick);
        }
    }

    fn step(&mut self) {
        for ch in &mut self.chans {
            let regs = unsafe { channel_block(self.regs.as_ptr(), ch.base) };
            let cr = regs.dmacr.get();

            if cr & DMACR_RESET != 0 {
                // Soft reset: back to reset values, forget any transfer.
                regs.dmacr.set(0);
                regs.dmasr.set(reset_status(self.config.sg_included));
                regs.curdesc.set(0);
                regs.taildesc.set(0);
                regs.length.set(0);
                ch.active = None;
                continue;
            }

            // Write DMASR only on transitions: the driver read-modify-writes
            // it too (interrupt acknowledge), and a steady stream of engine
            // rewrites would race with that.
            if cr & DMACR_RS == 0 {
                if !regs.dmasr.is_set(Status::Halted) {
                    regs.dmasr.modify(Status::Halted::SET);
                }
                ch.active = None;
                continue;
            }
            if regs.dmasr.is_set(Status::Halted) {
                regs.dmasr.modify(Status::Halted::CLEAR);
            }

            if self.config.sg_included {
                step_sg(&self.mem, &self.config, ch, regs);
            } else {
                step_direct(&self.mem, &self.config, ch, regs);
            }
        }
    }
}

fn step_direct(mem: &MemDevice, config: &EngineConfig, ch: &mut ChanState, regs: &ChannelRegs) {
    match &ch.active {
        None => {
            // Writing LENGTH arms the transfer; the register reports the
            // transferred byte count once it completes.
            let len = regs.length.get() & DESC_LENGTH_MASK;
            if len != 0 {
                let addr = regs.address.get();
                regs.length.set(0);
                regs.dmasr.modify(Status::Idle::CLEAR);
                ch.active = Some(Active::Direct {
                    addr,
                    len,
                    started: Instant::now(),
                });
            }
        }
        Some(Active::Direct { addr, len, started }) => {
            if started.elapsed() >= config.transfer_delay {
                if ch.fills_data {
                    fill_block(mem, *addr, *len as usize, 0);
                }
                regs.length.set(*len);
                regs.dmasr.modify(Status::Idle::SET + Status::IocIrq::SET);
                ch.active = None;
            }
        }
        Some(Active::Sg(_)) => {}
    }
}

fn step_sg(mem: &MemDevice, config: &EngineConfig, ch: &mut ChanState, regs: &ChannelRegs) {
    let mut finished = false;
    match &mut ch.active {
        None => {
            // Writing TAILDESC triggers the descriptor fetch; consume it so
            // the next run's write re-arms the ring.
            let tail = regs.taildesc.get();
            if tail != 0 {
                regs.taildesc.set(0);
                let cur = regs.curdesc.get();
                let ndesc = (regs.dmacr.get() >> 16) & 0xFF;
                if ndesc == 0 || tail < cur {
                    warn!("ignoring SG arm: threshold {ndesc}, chain {cur:#x}..{tail:#x}");
                    return;
                }
                let ring_len = (tail - cur) as usize + DESC_SIZE;
                let ring = match mem.map(cur as u64, ring_len) {
                    Ok(map) => map,
                    Err(err) => {
                        warn!("cannot map descriptor chain at {cur:#x}: {err}");
                        return;
                    }
                };
                regs.dmasr
                    .modify(Status::Idle::CLEAR + Status::IrqThresholdSts.val(ndesc));
                ch.active = Some(Active::Sg(SgWalk {
                    ring,
                    ring_base: cur,
                    cur,
                    tail,
                    ndesc,
                    remaining: ndesc,
                    done: 0,
                    started: Instant::now(),
                }));
            }
        }
        Some(Active::Sg(walk)) => {
            let delay = config.transfer_delay.max(Duration::from_micros(1));
            let mut due =
                ((walk.started.elapsed().as_micros() / delay.as_micros()) as u32).min(walk.ndesc);
            if let Some(limit) = config.completion_limit {
                due = due.min(limit);
            }

            while walk.done < due {
                let offset = (walk.cur - walk.ring_base) as usize;
                let buf_addr = walk.ring.read_u32(offset + DESC_BUFFER_ADDRESS);
                let len = walk.ring.read_u32(offset + DESC_CONTROL) & DESC_LENGTH_MASK;
                if ch.fills_data {
                    fill_block(mem, buf_addr, len as usize, walk.done as u8);
                }
                walk.ring
                    .write_u32(offset + DESC_STATUS, DESC_STATUS_CMPLT | len);
                walk.done += 1;
                walk.remaining = walk.remaining.saturating_sub(1);
                regs.dmasr.modify(Status::IrqThresholdSts.val(walk.remaining));
                if walk.remaining == 0 {
                    regs.dmasr.modify(Status::IocIrq::SET);
                }
                if walk.cur == walk.tail {
                    regs.dmasr.modify(Status::Idle::SET);
                    finished = true;
                    break;
                }
                walk.cur = walk.ring.read_u32(offset + DESC_NXTDESC);
            }
        }
        Some(Active::Direct { .. }) => {}
    }
    if finished {
        ch.active = None;
    }
}

/// Fills a completed data block with a pattern tests can recognize:
/// `seed + i` per byte.
fn fill_block(mem: &MemDevice, addr: u32, len: usize, seed: u8) {
    if len == 0 {
        return;
    }
    match mem.map(addr as u64, len) {
        Ok(map) => {
            let ptr = map.as_ptr() as *mut u8;
            for i in 0..len {
                unsafe { ptr.add(i).write_volatile(seed.wrapping_add(i as u8)) };
            }
        }
        Err(err) => warn!("cannot fill data block at {addr:#x}: {err}"),
    }
}
