// Licensed under the Apache-2.0 license

//! AXI DMA register map.
//!
//! The controller exposes one register block per channel: MM2S at the window
//! base, S2MM at base + 0x30. Both blocks share the same layout, so a single
//! [`ChannelRegs`] describes either; the driver instantiates it at the
//! channel's base offset.

use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

/// Size of the mapped register window in bytes.
pub const AXI_DMA_DEPTH: usize = 0xFFFF;

/// Byte offset of the MM2S channel block inside the register window.
pub const MM2S_BASE: usize = 0x00;
/// Byte offset of the S2MM channel block inside the register window.
pub const S2MM_BASE: usize = 0x30;

/// Run/stop bit of DMACR.
pub const DMACR_RS: u32 = 1 << 0;
/// DMACR word arming a direct-mode channel: run plus IOC/Delay/Error
/// interrupt enables (bit 15 is reserved and has no effect).
pub const DMACR_DIRECT_ARM: u32 = 0xF001;
/// DMACR low word arming a scatter-gather channel: run, IOC interrupt
/// enable and cyclic BD mode; the descriptor count goes into bits [23:16].
pub const DMACR_SG_ARM: u32 = 0x1011;
/// DMACR word performing a soft reset (also the soft-reset bit).
pub const DMACR_RESET: u32 = 0x4;

/// Size of one block descriptor in descriptor memory.
pub const DESC_SIZE: usize = 64;
/// Byte offset of the next-descriptor pointer within a descriptor.
pub const DESC_NXTDESC: usize = 0x00;
/// Byte offset of the data buffer address within a descriptor.
pub const DESC_BUFFER_ADDRESS: usize = 0x08;
/// Byte offset of the control word (low 26 bits = transfer length).
pub const DESC_CONTROL: usize = 0x18;
/// Byte offset of the status word, written by the engine on completion.
pub const DESC_STATUS: usize = 0x1C;

/// Completed flag in a descriptor status word.
pub const DESC_STATUS_CMPLT: u32 = 1 << 31;
/// Transfer-length mask in a descriptor control or status word.
pub const DESC_LENGTH_MASK: u32 = (1 << 26) - 1;

register_bitfields![u32,
    pub Status [
        Halted OFFSET(0) NUMBITS(1) [],
        Idle OFFSET(1) NUMBITS(1) [],
        /// Scatter-gather engine included (set at synthesis time).
        SgIncld OFFSET(3) NUMBITS(1) [],
        DmaIntErr OFFSET(4) NUMBITS(1) [],
        DmaSlvErr OFFSET(5) NUMBITS(1) [],
        DmaDecErr OFFSET(6) NUMBITS(1) [],
        SgIntErr OFFSET(8) NUMBITS(1) [],
        SgSlvErr OFFSET(9) NUMBITS(1) [],
        SgDecErr OFFSET(10) NUMBITS(1) [],
        IocIrq OFFSET(12) NUMBITS(1) [],
        DlyIrq OFFSET(13) NUMBITS(1) [],
        ErrIrq OFFSET(14) NUMBITS(1) [],
        /// Remaining completions before the IOC interrupt fires; the engine
        /// counts this down from the programmed threshold.
        IrqThresholdSts OFFSET(16) NUMBITS(8) [],
    ],
];

register_structs! {
    /// One AXI DMA channel block. For MM2S the 0x18 register is the source
    /// (`START_ADDRESS`), for S2MM the destination (`DESTINATION_ADDRESS`);
    /// both channels program it the same way. DMACR is programmed with the
    /// `DMACR_*` command words (the documented arm values include a reserved
    /// bit no field write could express); DMASR decodes through [`Status`].
    pub ChannelRegs {
        (0x00 => pub dmacr: ReadWrite<u32>),
        (0x04 => pub dmasr: ReadWrite<u32, Status::Register>),
        (0x08 => pub curdesc: ReadWrite<u32>),
        (0x0C => pub curdesc_msb: ReadWrite<u32>),
        (0x10 => pub taildesc: ReadWrite<u32>),
        (0x14 => pub taildesc_msb: ReadWrite<u32>),
        (0x18 => pub address: ReadWrite<u32>),
        (0x1C => pub address_msb: ReadWrite<u32>),
        (0x20 => _reserved0),
        (0x28 => pub length: ReadWrite<u32>),
        (0x2C => @END),
    }
}

/// Channel register block at `base_offset` bytes into a mapped window.
///
/// # Safety
///
/// `window` must point at a mapped AXI DMA register window large enough to
/// contain the block, and the caller must bound the returned lifetime by
/// the mapping backing `window`.
pub unsafe fn channel_block<'a>(window: *mut u32, base_offset: usize) -> &'a ChannelRegs {
    &*((window as *const u8).add(base_offset) as *const ChannelRegs)
}
