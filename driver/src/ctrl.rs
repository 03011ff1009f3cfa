// Licensed under the Apache-2.0 license

//! AXI DMA controller driver.
//!
//! The controller is driven through a register window mapped from the
//! physical-memory device. One channel (MM2S or S2MM) is selected at a time;
//! transfers run either in direct mode (a single programmed transfer) or in
//! scatter-gather mode over a descriptor ring living in its own physical
//! region. Receive completion is detected by polling, with the poll period
//! adapted to the observed completion rate.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::LocalRegisterCopy;

use crate::error::DmaError;
use crate::mem::{Mapping, MemDevice};
use crate::regs::{
    self, ChannelRegs, Status, AXI_DMA_DEPTH, DESC_BUFFER_ADDRESS, DESC_CONTROL, DESC_NXTDESC,
    DESC_SIZE, DESC_STATUS, DMACR_DIRECT_ARM, DMACR_RESET, DMACR_SG_ARM,
};
use crate::Result;

/// AXI DMA transfer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Memory-mapped to stream (processor to fabric).
    Mm2s,
    /// Stream to memory-mapped (fabric to processor).
    S2mm,
}

impl Channel {
    fn reg_base(self) -> usize {
        match self {
            Channel::Mm2s => regs::MM2S_BASE,
            Channel::S2mm => regs::S2MM_BASE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Channel::Mm2s => "MM2S",
            Channel::S2mm => "S2MM",
        }
    }
}

/// Adaptive-polling parameters, taken at construction.
///
/// The calibration loop targets a poll period that observes a completion
/// after between `min_loop` and `max_loop` iterations; the period itself is
/// bounded by `min_wait_us..=max_wait_us`.
#[derive(Debug, Clone, Copy)]
pub struct PollTuning {
    pub min_loop: u32,
    pub max_loop: u32,
    pub min_wait_us: u32,
    pub max_wait_us: u32,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            min_loop: 5,
            max_loop: 10,
            min_wait_us: 100,
            max_wait_us: 10_000,
        }
    }
}

/// Current poll period plus its tuning bounds.
#[derive(Debug)]
struct AdaptiveWait {
    tuning: PollTuning,
    cur_us: u32,
}

impl AdaptiveWait {
    fn new(tuning: PollTuning) -> Self {
        assert!(tuning.min_wait_us > 0 && tuning.min_wait_us <= tuning.max_wait_us);
        assert!(tuning.min_loop <= tuning.max_loop);
        let cur_us = ((tuning.max_wait_us - tuning.min_wait_us) / 2)
            .clamp(tuning.min_wait_us, tuning.max_wait_us);
        Self { tuning, cur_us }
    }

    /// Poll step for one receive call: the adaptive period when no timeout
    /// was requested, the finest period otherwise.
    fn step_for(&self, timeout_us: u32) -> u32 {
        if timeout_us == 0 {
            self.cur_us
        } else {
            self.tuning.min_wait_us
        }
    }

    fn at_max(&self) -> bool {
        self.cur_us == self.tuning.max_wait_us
    }

    /// Multiplicative feedback on the poll period: waited too many
    /// iterations, double it; woke too often, halve it.
    fn calibrate(&mut self, nloops: u32) {
        if nloops > self.tuning.max_loop {
            self.cur_us = self.cur_us.saturating_mul(2).min(self.tuning.max_wait_us);
        } else if nloops < self.tuning.min_loop {
            self.cur_us = (self.cur_us / 2).max(self.tuning.min_wait_us);
        }
    }
}

/// Accumulates sleep steps for one receive call.
struct PollTimer {
    step_us: u32,
    timeout_us: u32,
    waited_us: u32,
    loops: u32,
}

impl PollTimer {
    fn new(step_us: u32, timeout_us: u32) -> Self {
        Self {
            step_us,
            timeout_us,
            waited_us: 0,
            loops: 0,
        }
    }

    /// Sleeps one step. Returns false once the budget is exhausted
    /// (never, when the timeout is 0).
    fn wait(&mut self) -> bool {
        thread::sleep(Duration::from_micros(self.step_us as u64));
        self.waited_us += self.step_us;
        self.loops += 1;
        self.timeout_us == 0 || self.waited_us < self.timeout_us
    }
}

/// Scatter-gather transfer in progress, if any. Block- and buffer-granular
/// receives are mutually exclusive by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Block,
    Buffer,
}

/// Descriptor ring state for a scatter-gather channel.
///
/// The descriptor arena is shared with the engine: the CPU writes
/// NXTDESC/BUFFER_ADDRESS/CONTROL during setup and between runs, the engine
/// writes STATUS on completion. Access goes through volatile word reads and
/// writes at computed offsets; no references into the arena are retained.
#[derive(Debug)]
struct SgRing {
    map: Mapping,
    ndesc: u32,
    block_len: u32,
    desc_addr: u32,
    target_addr: u32,
    bd_start: u32,
    bd_stop: u32,
    last_irq_threshold: u32,
}

impl SgRing {
    fn desc_read(&self, index: u32, field: usize) -> u32 {
        self.map.read_u32(index as usize * DESC_SIZE + field)
    }

    fn desc_write(&self, index: u32, field: usize, value: u32) {
        self.map.write_u32(index as usize * DESC_SIZE + field, value);
    }

    fn buffer_address(&self, index: u32) -> u32 {
        self.desc_read(index, DESC_BUFFER_ADDRESS)
    }

    /// Builds the descriptor chain: zeroes the arena, links descriptor `i`
    /// to `i + 1`, points each at its stripe of the target buffer, and
    /// terminates the chain at the last descriptor. Cyclic behavior is a
    /// controller mode, not a property of the chain.
    fn initialize(&self) {
        for offset in (0..self.ndesc as usize * DESC_SIZE).step_by(4) {
            self.map.write_u32(offset, 0);
        }
        for i in 0..self.ndesc {
            self.desc_write(i, DESC_NXTDESC, self.desc_addr + DESC_SIZE as u32 * (i + 1));
            self.desc_write(i, DESC_BUFFER_ADDRESS, self.target_addr + self.block_len * i);
            self.desc_write(i, DESC_CONTROL, self.block_len);
        }
        self.desc_write(self.ndesc - 1, DESC_NXTDESC, 0);
    }
}

/// Decoded DMASR snapshot for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStatus {
    pub raw: u32,
    pub halted: bool,
    pub idle: bool,
    pub sg_included: bool,
    pub dma_internal_error: bool,
    pub dma_slave_error: bool,
    pub dma_decode_error: bool,
    pub sg_internal_error: bool,
    pub sg_slave_error: bool,
    pub sg_decode_error: bool,
    pub ioc_irq: bool,
    pub delay_irq: bool,
    pub error_irq: bool,
    /// Remaining completions before the IOC interrupt (SG only).
    pub irq_threshold: u8,
}

impl ChannelStatus {
    fn decode(raw: u32) -> Self {
        let r = LocalRegisterCopy::<u32, Status::Register>::new(raw);
        Self {
            raw,
            halted: r.is_set(Status::Halted),
            idle: r.is_set(Status::Idle),
            sg_included: r.is_set(Status::SgIncld),
            dma_internal_error: r.is_set(Status::DmaIntErr),
            dma_slave_error: r.is_set(Status::DmaSlvErr),
            dma_decode_error: r.is_set(Status::DmaDecErr),
            sg_internal_error: r.is_set(Status::SgIntErr),
            sg_slave_error: r.is_set(Status::SgSlvErr),
            sg_decode_error: r.is_set(Status::SgDecErr),
            ioc_irq: r.is_set(Status::IocIrq),
            delay_irq: r.is_set(Status::DlyIrq),
            error_irq: r.is_set(Status::ErrIrq),
            irq_threshold: r.read(Status::IrqThresholdSts) as u8,
        }
    }

    /// True when any DMA or scatter-gather error flag is raised.
    pub fn any_error(&self) -> bool {
        self.dma_internal_error
            || self.dma_slave_error
            || self.dma_decode_error
            || self.sg_internal_error
            || self.sg_slave_error
            || self.sg_decode_error
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.halted { " halted" } else { " running" })?;
        let flags = [
            (self.idle, " idle"),
            (self.sg_included, " SGIncld"),
            (self.dma_internal_error, " DMAIntErr"),
            (self.dma_slave_error, " DMASlvErr"),
            (self.dma_decode_error, " DMADecErr"),
            (self.sg_internal_error, " SGIntErr"),
            (self.sg_slave_error, " SGSlvErr"),
            (self.sg_decode_error, " SGDecErr"),
            (self.ioc_irq, " IOC_Irq"),
            (self.delay_irq, " Dly_Irq"),
            (self.error_irq, " Err_Irq"),
        ];
        for (set, name) in flags {
            if set {
                f.write_str(name)?;
            }
        }
        if self.sg_included {
            write!(f, " IRQThresholdSts: {}", self.irq_threshold)?;
        }
        Ok(())
    }
}

/// Userspace driver for one AXI DMA controller instance.
///
/// Identified by the physical base address of its register window. One thread
/// drives one controller; there are no internal locks and the only suspension
/// point is the sleep inside the polling loop.
#[derive(Debug)]
pub struct DmaController {
    mem: MemDevice,
    regs: Mapping,
    channel: Option<Channel>,
    sg: Option<SgRing>,
    direct_len: u32,
    pending: Pending,
    wait: AdaptiveWait,
    block_offset: u32,
    block_size: u32,
}

impl DmaController {
    /// Opens `/dev/mem` and maps the register window at `base_addr`.
    pub fn new(base_addr: u64) -> Result<Self> {
        Self::with_device(MemDevice::open_dev_mem()?, base_addr, PollTuning::default())
    }

    /// Like [`new`](Self::new), with explicit polling parameters.
    pub fn with_tuning(base_addr: u64, tuning: PollTuning) -> Result<Self> {
        Self::with_device(MemDevice::open_dev_mem()?, base_addr, tuning)
    }

    /// Builds the controller over an already-open physical-memory device.
    /// Test harnesses pass a [`MemDevice`] backed by a plain file shared
    /// with a register-model engine.
    pub fn with_device(mem: MemDevice, base_addr: u64, tuning: PollTuning) -> Result<Self> {
        let regs = mem.map(base_addr, AXI_DMA_DEPTH)?;
        Ok(Self {
            mem,
            regs,
            channel: None,
            sg: None,
            direct_len: 0,
            pending: Pending::None,
            wait: AdaptiveWait::new(tuning),
            block_offset: 0,
            block_size: 0,
        })
    }

    /// Selects the channel all subsequent register operations apply to.
    pub fn set_channel(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    /// Register block of the selected channel, borrowed from the window
    /// mapping; fails with `ChannelNotSet` naming the operation that needed
    /// it.
    fn chan_regs(&self, op: &'static str) -> Result<&ChannelRegs> {
        channel_regs(&self.regs, self.channel, op)
    }

    /// Halts the channel by clearing DMACR.
    pub fn halt(&self) -> Result<()> {
        self.chan_regs("halt")?.dmacr.set(0);
        Ok(())
    }

    /// Soft-resets the channel.
    pub fn reset(&self) -> Result<()> {
        self.chan_regs("reset")?.dmacr.set(DMACR_RESET);
        Ok(())
    }

    /// Starts the transfer configured by [`init_direct`](Self::init_direct)
    /// or [`init_sg`](Self::init_sg), dispatching on the engine's
    /// scatter-gather capability bit.
    pub fn run(&mut self) -> Result<()> {
        if self.sg_present("run")? {
            self.run_sg()
        } else {
            self.run_direct()
        }
    }

    /// After a completed transfer the idle flag reports end of transfer.
    pub fn is_idle(&self) -> Result<bool> {
        self.idle("is_idle")
    }

    pub fn is_running(&self) -> Result<bool> {
        self.running("is_running")
    }

    /// Whether the scatter-gather engine is included in the channel
    /// (a synthesis-time property reported by DMASR).
    pub fn is_sg(&self) -> Result<bool> {
        self.sg_present("is_sg")
    }

    fn idle(&self, op: &'static str) -> Result<bool> {
        Ok(self.chan_regs(op)?.dmasr.is_set(Status::Idle))
    }

    fn running(&self, op: &'static str) -> Result<bool> {
        Ok(!self.chan_regs(op)?.dmasr.is_set(Status::Halted))
    }

    fn sg_present(&self, op: &'static str) -> Result<bool> {
        Ok(self.chan_regs(op)?.dmasr.is_set(Status::SgIncld))
    }

    /// Whether the interrupt-on-complete flag is raised.
    pub fn irq_ioc(&self) -> Result<bool> {
        Ok(self.chan_regs("irq_ioc")?.dmasr.is_set(Status::IocIrq))
    }

    /// Clears the interrupt-on-complete flag.
    pub fn clear_irq_ioc(&self) -> Result<()> {
        self.chan_regs("clear_irq_ioc")?
            .dmasr
            .modify(Status::IocIrq::CLEAR);
        Ok(())
    }

    /// Decoded snapshot of the channel status register.
    pub fn status(&self) -> Result<ChannelStatus> {
        let raw = self.chan_regs("status")?.dmasr.get();
        Ok(ChannelStatus::decode(raw))
    }

    /// Logs the decoded channel status.
    pub fn log_status(&self) -> Result<()> {
        let status = self.status()?;
        let channel = self.channel.ok_or(DmaError::ChannelNotSet { op: "status" })?;
        info!("{} status ({:#010x}):{}", channel.name(), status.raw, status);
        Ok(())
    }

    /// Configures a direct-mode transfer of `block_len` bytes to/from
    /// physical address `addr` and enables the channel. The engine must not
    /// include the scatter-gather option.
    pub fn init_direct(&mut self, block_len: u32, addr: u32) -> Result<()> {
        const OP: &str = "init_direct";
        let regs = channel_regs(&self.regs, self.channel, OP)?;
        if self.sg_present(OP)? {
            return Err(DmaError::WrongMode {
                op: OP,
                expected: "direct",
            });
        }
        // START_ADDRESS for MM2S, DESTINATION_ADDRESS for S2MM; the block
        // layout is identical for both channels.
        regs.address.set(addr);
        self.direct_len = block_len;
        regs.dmacr.set(DMACR_DIRECT_ARM);
        Ok(())
    }

    /// Writing the transfer length arms the engine.
    fn run_direct(&mut self) -> Result<()> {
        const OP: &str = "run_direct";
        let regs = self.chan_regs(OP)?;
        if self.sg_present(OP)? {
            return Err(DmaError::WrongMode {
                op: OP,
                expected: "direct",
            });
        }
        regs.length.set(self.direct_len);
        Ok(())
    }

    /// Configures a scatter-gather ring of `count` descriptors at physical
    /// address `bd_base`, each descriptor moving `block_len` bytes and
    /// striding across the target buffer at `target`. Maps the descriptor
    /// arena once; it stays valid for the controller's lifetime.
    pub fn init_sg(&mut self, bd_base: u64, count: u32, block_len: u32, target: u32) -> Result<()> {
        const OP: &str = "init_sg";
        let regs = self.chan_regs(OP)?;
        if !self.sg_present(OP)? {
            return Err(DmaError::WrongMode {
                op: OP,
                expected: "scatter-gather",
            });
        }
        // The completion threshold field is eight bits wide, which bounds
        // the ring size.
        if count == 0 || count > 0xFF {
            return Err(DmaError::DescriptorCount { op: OP, count });
        }

        let map = self.mem.map(bd_base, count as usize * DESC_SIZE)?;
        let ring = SgRing {
            map,
            ndesc: count,
            block_len,
            desc_addr: bd_base as u32,
            target_addr: target,
            bd_start: 0,
            bd_stop: 0,
            last_irq_threshold: count,
        };
        ring.initialize();
        regs.curdesc.set(ring.desc_addr);
        self.sg = Some(ring);
        Ok(())
    }

    /// Arms the ring: completion threshold of one full ring, cyclic
    /// descriptor mode, tail pointer at the last descriptor.
    fn run_sg(&mut self) -> Result<()> {
        const OP: &str = "run_sg";
        let regs = channel_regs(&self.regs, self.channel, OP)?;
        let Some(ring) = self.sg.as_mut() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        regs.dmacr.set((ring.ndesc << 16) | DMACR_SG_ARM);
        regs.taildesc
            .set(ring.desc_addr + DESC_SIZE as u32 * (ring.ndesc - 1));

        ring.bd_start = 0;
        ring.bd_stop = 0;
        ring.last_irq_threshold = ring.ndesc;
        self.block_offset = 0;
        self.block_size = 0;
        self.pending = Pending::None;
        Ok(())
    }

    /// Retargets every descriptor at window `window` of a larger logical
    /// ring: descriptor `i` now covers `target + block_len * (count * window
    /// + i)`. Intended to be called between runs, never while the engine
    /// walks the ring.
    pub fn advance_sg_window(&mut self, window: u32) -> Result<()> {
        const OP: &str = "advance_sg_window";
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        for i in 0..ring.ndesc {
            ring.desc_write(
                i,
                DESC_BUFFER_ADDRESS,
                ring.target_addr + ring.block_len * (ring.ndesc * window + i),
            );
        }
        Ok(())
    }

    /// Data buffer address programmed into descriptor `index`.
    pub fn sg_buffer_address(&self, index: u32) -> Result<u32> {
        const OP: &str = "sg_buffer_address";
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        if index >= ring.ndesc {
            return Err(DmaError::DescriptorOutOfRange {
                op: OP,
                index,
                count: ring.ndesc,
            });
        }
        Ok(ring.buffer_address(index))
    }

    /// Logs every descriptor in the ring.
    pub fn dump_sg_descriptors(&self) -> Result<()> {
        const OP: &str = "dump_sg_descriptors";
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        for i in 0..ring.ndesc {
            debug!(
                "BD{}: addr {:#010x} NXTDESC {:#010x}, BUFFER_ADDRESS {:#010x}, CONTROL {:#x}, STATUS {:#010x}",
                i,
                ring.desc_addr + DESC_SIZE as u32 * i,
                ring.desc_read(i, DESC_NXTDESC),
                ring.desc_read(i, DESC_BUFFER_ADDRESS),
                ring.desc_read(i, DESC_CONTROL),
                ring.desc_read(i, DESC_STATUS),
            );
        }
        Ok(())
    }

    /// Logs the status word of every descriptor.
    pub fn dump_sg_status(&self) -> Result<()> {
        const OP: &str = "dump_sg_status";
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        for i in 0..ring.ndesc {
            debug!("BD{}: STATUS {:#010x}", i, ring.desc_read(i, DESC_STATUS));
        }
        Ok(())
    }

    /// Clears the status word of every descriptor. Required between runs
    /// when cyclic mode is not enabled.
    pub fn clear_sg_status(&mut self) -> Result<()> {
        const OP: &str = "clear_sg_status";
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };
        for i in 0..ring.ndesc {
            ring.desc_write(i, DESC_STATUS, 0);
        }
        Ok(())
    }

    /// Byte offset into the target buffer of the most recently completed
    /// region.
    pub fn block_offset(&self) -> u32 {
        self.block_offset
    }

    /// Byte length of the most recently completed region.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// First descriptor of the window the next block-granular completion
    /// will report, if a ring is initialized.
    pub fn bd_start_index(&self) -> Option<u32> {
        self.sg.as_ref().map(|ring| ring.bd_start)
    }

    /// Last descriptor of the most recently reported window.
    pub fn bd_stop_index(&self) -> Option<u32> {
        self.sg.as_ref().map(|ring| ring.bd_stop)
    }

    /// Whether a scatter-gather receive is in progress and will be resumed
    /// by the next [`rx`](Self::rx) call.
    pub fn transfer_pending(&self) -> bool {
        self.pending != Pending::None
    }

    /// Current adaptive poll period in microseconds.
    pub fn current_wait_us(&self) -> u32 {
        self.wait.cur_us
    }

    /// Waits for received data and reports the newly valid region of the
    /// target buffer via [`block_offset`](Self::block_offset) and
    /// [`block_size`](Self::block_size).
    ///
    /// `timeout_us == 0` polls indefinitely and recalibrates the poll period
    /// after each completion; a nonzero timeout polls at the finest period
    /// and returns `Ok(false)` once the accumulated waits meet the budget,
    /// leaving the transfer resumable by a later call.
    ///
    /// Without a scatter-gather engine this waits for the direct transfer.
    /// With one, an in-progress receive is resumed in its own granularity;
    /// otherwise a fresh receive is block-granular when the poll period sits
    /// at its maximum (low completion rate) and buffer-granular when the
    /// ring turns over fast enough to amortize whole-buffer waits.
    pub fn rx(&mut self, timeout_us: u32) -> Result<bool> {
        if !self.sg_present("rx")? {
            return self.direct_rx(timeout_us);
        }

        match self.pending {
            Pending::Block => return self.block_rx(timeout_us),
            Pending::Buffer => return self.buffer_rx(timeout_us),
            Pending::None => {}
        }

        if self.wait.at_max() {
            self.block_rx(timeout_us)
        } else {
            self.buffer_rx(timeout_us)
        }
    }

    fn direct_rx(&mut self, timeout_us: u32) -> Result<bool> {
        const OP: &str = "direct_rx";
        if self.sg_present(OP)? {
            return Err(DmaError::WrongMode {
                op: OP,
                expected: "direct",
            });
        }
        if self.channel != Some(Channel::S2mm) {
            return Err(DmaError::NotReceiveChannel { op: OP });
        }
        if !self.running(OP)? {
            return Err(DmaError::NotRunning { op: OP });
        }

        let mut timer = PollTimer::new(self.wait.step_for(timeout_us), timeout_us);
        loop {
            if self.idle(OP)? {
                if timeout_us == 0 {
                    self.wait.calibrate(timer.loops);
                }
                // The whole buffer is valid.
                self.block_offset = 0;
                self.block_size = self.direct_len;
                return Ok(true);
            }
            if !timer.wait() {
                return Ok(false);
            }
        }
    }

    /// Block-granular receive: surfaces descriptors as the engine completes
    /// them, tracked through the DMASR completion-threshold countdown.
    fn block_rx(&mut self, timeout_us: u32) -> Result<bool> {
        const OP: &str = "block_rx";
        let regs = channel_regs(&self.regs, self.channel, OP)?;
        if self.channel != Some(Channel::S2mm) {
            return Err(DmaError::NotReceiveChannel { op: OP });
        }
        if regs.dmasr.is_set(Status::Halted) {
            return Err(DmaError::NotRunning { op: OP });
        }
        let Some(ring) = self.sg.as_mut() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };

        let mut timer = PollTimer::new(self.wait.step_for(timeout_us), timeout_us);
        self.pending = Pending::Block;

        loop {
            let status = regs.dmasr.extract();
            let mut ready = 0u32;

            if status.is_set(Status::Idle) {
                // The ring has finished; everything up to the tail is ours.
                ring.bd_stop = ring.ndesc - 1;
                ready = ring.ndesc - ring.bd_start;
                ring.last_irq_threshold = ring.ndesc;
                self.pending = Pending::None;
            } else {
                let irq_threshold = status.read(Status::IrqThresholdSts);
                if irq_threshold < ring.last_irq_threshold {
                    ready = (ring.ndesc - irq_threshold).saturating_sub(ring.bd_start);
                    ring.last_irq_threshold = irq_threshold;
                }
            }

            trace!(
                "poll {}: threshold {} ready {} window {}..{}",
                timer.loops,
                ring.last_irq_threshold,
                ready,
                ring.bd_start,
                ring.bd_stop
            );

            if ready > 0 {
                ring.bd_stop = ring.bd_start + ready - 1;
                if timeout_us == 0 {
                    self.wait.calibrate(timer.loops);
                }
                self.block_offset = ring.buffer_address(ring.bd_start) - ring.target_addr;
                self.block_size = ring.block_len * ready;
                debug!(
                    "descriptors {}..={} ready: offset {:#x} len {}",
                    ring.bd_start, ring.bd_stop, self.block_offset, self.block_size
                );
                if ring.bd_stop < ring.ndesc - 1 {
                    ring.bd_start = ring.bd_stop + 1;
                }
                return Ok(true);
            }

            if !timer.wait() {
                return Ok(false);
            }
        }
    }

    /// Buffer-granular receive: waits until the engine has visited every
    /// descriptor since `run` and reports the whole ring at once.
    fn buffer_rx(&mut self, timeout_us: u32) -> Result<bool> {
        const OP: &str = "buffer_rx";
        let regs = channel_regs(&self.regs, self.channel, OP)?;
        if self.channel != Some(Channel::S2mm) {
            return Err(DmaError::NotReceiveChannel { op: OP });
        }
        if regs.dmasr.is_set(Status::Halted) {
            return Err(DmaError::NotRunning { op: OP });
        }
        let Some(ring) = self.sg.as_ref() else {
            return Err(DmaError::SgNotInitialized { op: OP });
        };

        let mut timer = PollTimer::new(self.wait.step_for(timeout_us), timeout_us);
        self.pending = Pending::Buffer;

        loop {
            if regs.dmasr.is_set(Status::Idle) {
                if timeout_us == 0 {
                    self.wait.calibrate(timer.loops);
                }
                self.block_offset = 0;
                self.block_size = ring.block_len * ring.ndesc;
                self.pending = Pending::None;
                return Ok(true);
            }
            if !timer.wait() {
                return Ok(false);
            }
        }
    }
}

/// Register block for `channel` inside a mapped window, tied to the
/// mapping's borrow. A free function so the receive loops can hold the
/// block while mutating disjoint controller fields.
fn channel_regs<'a>(
    window: &'a Mapping,
    channel: Option<Channel>,
    op: &'static str,
) -> Result<&'a ChannelRegs> {
    let channel = channel.ok_or(DmaError::ChannelNotSet { op })?;
    Ok(unsafe { regs::channel_block(window.as_ptr(), channel.reg_base()) })
}
