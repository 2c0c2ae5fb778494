use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::block::BlockDevice;
use crate::config::FlashConfig;
use crate::error::{Error, Result};
use crate::source::ImageSource;

/// Engine lifecycle. Terminal states are final
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl FlashState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashState::Succeeded | FlashState::Failed | FlashState::Cancelled
        )
    }
}

/// Result of one run. Failure keeps the error text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Fraction of the image written, in [0.0, 1.0]
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct FlashProgress(f32);

impl FlashProgress {
    pub const DONE: FlashProgress = FlashProgress(1.0);

    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn from_bytes(written: u64, total: u64) -> Self {
        if total == 0 {
            return Self(0.0);
        }
        Self::new((written as f64 / total as f64) as f32)
    }

    pub fn value(&self) -> f32 {
        self.0
    }

}

/// Cooperative cancellation flag shared between the controller and a run
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives progress updates. Must not block
#[cfg_attr(test, mockall::automock)]
pub trait ProgressSink {
    fn publish(&self, progress: FlashProgress);
}

enum StreamEnd {
    Exhausted,
    Cancelled,
}

/// Streams an image source into a block device in fixed size chunks.
///
/// One engine serves one run. Each chunk is read fully (short reads are
/// accumulated), zero padded if the source ends inside it, and written with a
/// single call at `bytes_written / block_size`.
pub struct FlashEngine {
    chunk_size: usize,
    state: FlashState,
    bytes_written: u64,
    last_progress: FlashProgress,
}

impl FlashEngine {
    pub fn new(config: &FlashConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            state: FlashState::Idle,
            bytes_written: 0,
            last_progress: FlashProgress::default(),
        }
    }

    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Bytes handed to the device, padding included
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Run to completion. The source is closed on every path and nothing
    /// already written is rolled back.
    pub async fn run<D, S, P>(
        &mut self,
        device: &mut D,
        source: &mut S,
        sink: &P,
        cancel: &CancelToken,
    ) -> FlashOutcome
    where
        D: BlockDevice,
        S: ImageSource,
        P: ProgressSink,
    {
        if self.state != FlashState::Idle {
            source.close().await;
            return FlashOutcome::Failed(Error::EngineReused.to_string());
        }
        self.state = FlashState::Running;
        info!(
            "flash {} ({} bytes) in {} byte chunks",
            source.label(),
            source.total_size(),
            self.chunk_size
        );

        let result = self.stream(device, source, sink, cancel).await;
        source.close().await;

        match result {
            Ok(StreamEnd::Exhausted) => {
                self.publish(sink, FlashProgress::DONE);
                self.state = FlashState::Succeeded;
                info!("flash finished, {} bytes written", self.bytes_written);
                FlashOutcome::Succeeded
            }
            Ok(StreamEnd::Cancelled) => {
                self.state = FlashState::Cancelled;
                info!("flash cancelled after {} bytes", self.bytes_written);
                FlashOutcome::Cancelled
            }
            Err(e) => {
                self.state = FlashState::Failed;
                warn!("flash failed after {} bytes: {}", self.bytes_written, e);
                FlashOutcome::Failed(e.to_string())
            }
        }
    }

    async fn stream<D, S, P>(
        &mut self,
        device: &mut D,
        source: &mut S,
        sink: &P,
        cancel: &CancelToken,
    ) -> Result<StreamEnd>
    where
        D: BlockDevice,
        S: ImageSource,
        P: ProgressSink,
    {
        let block_size = device.block_size();
        if block_size == 0 || self.chunk_size == 0 || self.chunk_size % block_size != 0 {
            return Err(Error::InvalidChunkSize {
                chunk_size: self.chunk_size,
                block_size,
            });
        }

        let total_size = source.total_size();
        let mut buffer = vec![0u8; self.chunk_size];
        loop {
            if cancel.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }
            self.publish(sink, FlashProgress::from_bytes(self.bytes_written, total_size));

            let filled = fill_chunk(source, &mut buffer).await?;
            if filled == 0 {
                return Ok(StreamEnd::Exhausted);
            }
            if filled < buffer.len() {
                debug!("final chunk: {} bytes, padding {}", filled, buffer.len() - filled);
                buffer[filled..].fill(0);
            }

            let lba = self.bytes_written / block_size as u64;
            trace!("write lba={} len={}", lba, buffer.len());
            device.write(lba, &buffer).await?;
            self.bytes_written += buffer.len() as u64;
        }
    }

    fn publish<P: ProgressSink>(&mut self, sink: &P, progress: FlashProgress) {
        if progress < self.last_progress {
            return;
        }
        self.last_progress = progress;
        sink.publish(progress);
    }
}

/// Read until `buf` is full or the source ends. Returns the filled length
async fn fill_chunk<S: ImageSource>(source: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
