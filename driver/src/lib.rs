// Licensed under the Apache-2.0 license

//! Userspace driver for the Xilinx-style AXI DMA engine found on Zynq-class
//! SoCs.
//!
//! The library moves bulk data between processor memory and fabric-side
//! streaming endpoints without kernel involvement:
//!
//! - [`DmaController`] maps the controller's register window through
//!   `/dev/mem`, manages a ring of scatter-gather block descriptors in shared
//!   physical memory and implements an adaptive polling receive loop.
//! - [`DmaBuffer`] opens a kernel-allocated contiguous buffer exported by the
//!   u-dma-buf module (sysfs metadata + `/dev` node) and maps it into the
//!   process.
//! - [`MemDevice`] / [`Mapping`] are the underlying physical-memory access
//!   layer, also usable by test harnesses that substitute a plain file for
//!   `/dev/mem`.
//!
//! A controller owns its mappings exclusively; drive it from a single thread.

mod buffer;
mod ctrl;
mod error;
pub mod mem;
pub mod regs;

pub use buffer::{BufferLayout, BufferOwner, DmaBuffer, SyncDirection};
pub use ctrl::{Channel, ChannelStatus, DmaController, PollTuning};
pub use error::DmaError;
pub use mem::{Mapping, MemDevice};

/// Result type used throughout the driver.
pub type Result<T> = std::result::Result<T, DmaError>;
