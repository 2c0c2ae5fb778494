use std::io;

use thiserror::Error;

use crate::usb::communication::TransferError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors for device acquisition and flashing
#[derive(Error, Debug)]
pub enum Error {
    /// USB permission not granted. Raised before any I/O
    #[error("missing permission to access usb device {0}")]
    PermissionDenied(String),
    /// Logical unit reports no media. Recorded per LUN, never fails a session
    #[error("no media inserted in logical unit {0}")]
    MediaAbsent(u8),
    /// Control or bulk transfer failed
    #[error("usb transfer failed: {0}")]
    Transport(#[from] TransferError),
    /// Device answered with a malformed or mismatching status wrapper
    #[error("bulk-only transport protocol error: {0}")]
    Protocol(&'static str),
    /// SCSI command finished with CHECK CONDITION
    #[error("scsi command {opcode:#04x} failed (sense key {sense_key:#04x}, asc {asc:#04x}, ascq {ascq:#04x})")]
    CommandFailed {
        opcode: u8,
        sense_key: u8,
        asc: u8,
        ascq: u8,
    },
    /// Image could not be opened
    #[error("image source unavailable: {0}")]
    SourceUnavailable(#[source] io::Error),
    /// Image read failed mid-stream
    #[error("image source read failed: {0}")]
    SourceRead(#[source] io::Error),
    #[error("buffer length {len} is not a multiple of block size {block_size}")]
    UnalignedBuffer { len: usize, block_size: usize },
    #[error("chunk size {chunk_size} is not a non-zero multiple of block size {block_size}")]
    InvalidChunkSize {
        chunk_size: usize,
        block_size: usize,
    },
    #[error("write of {blocks} blocks at lba {lba} exceeds device capacity")]
    OutOfRange { lba: u64, blocks: u64 },
    /// Session was closed, all of its handles are invalid
    #[error("mass storage session is closed")]
    SessionClosed,
    /// Session opened but no logical unit produced a usable block device
    #[error("no usable logical unit with media")]
    NoMedia,
    /// Flash requested without a selected device or image
    #[error("no {0} selected")]
    NoSelection(&'static str),
    /// Engine instances run once
    #[error("flash engine already ran")]
    EngineReused,
}
