//! Device acquisition and streaming flash engine for USB mass storage devices.
//!
//! - [`usb`]: descriptors, endpoint pairing and the host/communication seams
//! - [`bot`]: Bulk-Only Transport command/status wrappers
//! - [`block`]: block device contract, default SCSI driver and a RAM disk
//! - [`session`]: one paired interface turned into zero or one block device
//! - [`source`]: image sources the engine reads from
//! - [`flash`]: the chunked source-to-device write loop
//! - [`permission`]: one-shot permission prompt exchange
//! - [`job`]: single-job coordinator and selection context

pub mod block;
pub mod bot;
pub mod config;
pub mod error;
pub mod flash;
pub mod job;
pub mod permission;
pub mod session;
pub mod source;
pub mod usb;

#[cfg(test)]
mod testing;

pub use config::FlashConfig;
pub use error::{Error, Result};
pub use flash::{CancelToken, FlashEngine, FlashOutcome, FlashProgress};
pub use job::{FlashJobCoordinator, FlashTarget, JobState, SelectionContext};
pub use session::MassStorageSession;
