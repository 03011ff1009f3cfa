// Licensed under the Apache-2.0 license

use std::io;

use thiserror::Error;

/// Errors surfaced by the DMA controller and buffer drivers.
///
/// Timeouts are not errors: a receive that runs out of budget returns
/// `Ok(false)` and may be resumed. Every configuration or precondition
/// failure names the operation that rejected it.
#[derive(Debug, Error)]
pub enum DmaError {
    #[error("{op}: DMA channel is not set")]
    ChannelNotSet { op: &'static str },

    #[error("{op}: DMA channel is not configured for {expected} mode")]
    WrongMode {
        op: &'static str,
        expected: &'static str,
    },

    #[error("{op}: scatter-gather ring is not initialized")]
    SgNotInitialized { op: &'static str },

    #[error("{op}: descriptor index {index} out of range ({count} descriptors)")]
    DescriptorOutOfRange {
        op: &'static str,
        index: u32,
        count: u32,
    },

    #[error("{op}: descriptor count {count} outside 1..=255")]
    DescriptorCount { op: &'static str, count: u32 },

    #[error("{op}: DMA channel is not running")]
    NotRunning { op: &'static str },

    #[error("{op}: receive requires the S2MM channel")]
    NotReceiveChannel { op: &'static str },

    #[error("sync mode {0} out of range (0..=7)")]
    InvalidSyncMode(u8),

    #[error("contiguous buffer {0} not found under any sysfs root")]
    BufferNotFound(String),

    #[error("{op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl DmaError {
    /// Wraps an I/O error with the operation it occurred in.
    pub(crate) fn io(op: &'static str) -> impl FnOnce(io::Error) -> DmaError {
        move |source| DmaError::Io { op, source }
    }
}
