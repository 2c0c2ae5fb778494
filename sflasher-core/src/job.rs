use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::block::BlockDevice;
use crate::config::FlashConfig;
use crate::error::{Error, Result};
use crate::flash::{CancelToken, FlashEngine, FlashOutcome, FlashProgress, ProgressSink};
use crate::permission::PermissionRequest;
use crate::source::ImageLocator;

/// A device that can lend a block device to a flash run
#[trait_variant::make(Send)]
pub trait FlashTarget {
    type Device: BlockDevice + Send;

    fn label(&self) -> String;

    /// Open on first use and return the block device to write.
    /// Fails with [`Error::NoMedia`] when the device has none
    async fn acquire(&mut self) -> Result<&mut Self::Device>;

    /// Close the device. Later acquires fail
    async fn release(&mut self);
}

/// Job lifecycle as seen by observers
#[derive(Debug, Clone, PartialEq, Default)]
pub enum JobState {
    #[default]
    NotStarted,
    Running(FlashProgress),
    Succeeded,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

impl From<FlashOutcome> for JobState {
    fn from(outcome: FlashOutcome) -> Self {
        match outcome {
            FlashOutcome::Succeeded => JobState::Succeeded,
            FlashOutcome::Failed(reason) => JobState::Failed(reason),
            FlashOutcome::Cancelled => JobState::Cancelled,
        }
    }
}

struct SelectedDevice<T> {
    target: Arc<AsyncMutex<T>>,
    label: String,
    permitted: bool,
    /// Runs started on this device, cancelled when it is deselected
    runs: Vec<CancelToken>,
}

struct Selection<T, L> {
    generation: u64,
    device: Option<SelectedDevice<T>>,
    image: Option<Arc<L>>,
}

/// Currently selected device and image.
///
/// Every device selection gets a new generation; permission results carry the
/// generation they were requested for and are dropped once it is superseded.
pub struct SelectionContext<T, L> {
    inner: Mutex<Selection<T, L>>,
}

impl<T: FlashTarget + Send + 'static, L: ImageLocator> Default for SelectionContext<T, L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FlashTarget + Send + 'static, L: ImageLocator> SelectionContext<T, L> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Selection {
                generation: 0,
                device: None,
                image: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Selection<T, L>> {
        // selection holds plain data, a panic mid-update leaves it usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the selected device. Runs on the previous device are cancelled
    /// and it is released without waiting for them. Returns the new generation
    pub async fn select_device(&self, target: T) -> u64 {
        let label = target.label();
        let (generation, previous) = {
            let mut selection = self.lock();
            selection.generation += 1;
            let previous = selection.device.replace(SelectedDevice {
                target: Arc::new(AsyncMutex::new(target)),
                label: label.clone(),
                permitted: false,
                runs: Vec::new(),
            });
            (selection.generation, previous)
        };
        info!("selected device {} (generation {})", label, generation);
        if let Some(previous) = previous {
            release(previous).await;
        }
        generation
    }

    /// Drop the device selection and release the device
    pub async fn clear_device(&self) {
        let previous = {
            let mut selection = self.lock();
            selection.generation += 1;
            selection.device.take()
        };
        if let Some(previous) = previous {
            release(previous).await;
        }
    }

    pub fn select_image(&self, image: L) {
        info!("selected image {} ({} bytes)", image.label(), image.size());
        self.lock().image = Some(Arc::new(image));
    }

    pub fn device(&self) -> Option<Arc<AsyncMutex<T>>> {
        self.lock().device.as_ref().map(|device| device.target.clone())
    }

    pub fn device_label(&self) -> Option<String> {
        self.lock().device.as_ref().map(|device| device.label.clone())
    }

    pub fn image(&self) -> Option<Arc<L>> {
        self.lock().image.clone()
    }

    /// Wait for the permission answer for selection `generation` and apply it.
    ///
    /// Returns `Ok(true)` when granted, `Ok(false)` when the selection changed
    /// in the meantime, and [`Error::PermissionDenied`] after clearing the
    /// device selection on a denial.
    pub async fn resolve_permission(
        &self,
        generation: u64,
        request: PermissionRequest,
    ) -> Result<bool> {
        let result = request.wait().await;
        let denied = {
            let mut selection = self.lock();
            if selection.generation != generation {
                debug!(
                    "permission result for generation {} ignored, now {}",
                    generation, selection.generation
                );
                return Ok(false);
            }
            match &result {
                Ok(()) => {
                    if let Some(device) = selection.device.as_mut() {
                        device.permitted = true;
                    }
                    None
                }
                Err(_) => {
                    selection.generation += 1;
                    selection.device.take()
                }
            }
        };
        if let Some(device) = denied {
            warn!("permission denied for {}", device.label);
            release(device).await;
        }
        result.map(|()| true)
    }

    /// Device and image for a new run, which `cancel` stops if the device is deselected
    fn snapshot(&self, cancel: &CancelToken) -> Result<(Arc<AsyncMutex<T>>, Arc<L>)> {
        let mut selection = self.lock();
        let image = selection.image.clone();
        let device = selection.device.as_mut().ok_or(Error::NoSelection("device"))?;
        if !device.permitted {
            return Err(Error::PermissionDenied(device.label.clone()));
        }
        let image = image.ok_or(Error::NoSelection("image"))?;
        device.runs.retain(|run| !run.is_cancelled());
        device.runs.push(cancel.clone());
        Ok((device.target.clone(), image))
    }
}

/// Cancel the device's runs and close it. A run still holding the device
/// closes it from a background task once it lets go
async fn release<T: FlashTarget + Send + 'static>(device: SelectedDevice<T>) {
    for run in &device.runs {
        run.cancel();
    }
    match device.target.clone().try_lock_owned() {
        Ok(mut target) => {
            debug!("releasing {}", device.label);
            target.release().await;
        }
        Err(_) => {
            debug!("{} busy, releasing after its run", device.label);
            let label = device.label;
            tokio::spawn(async move {
                device.target.lock().await.release().await;
                debug!("released {}", label);
            });
        }
    }
}

/// Forwards engine progress to observers while its job is current
struct JobProgressSink {
    id: u64,
    current: Arc<AtomicU64>,
    state: Arc<watch::Sender<JobState>>,
}

impl JobProgressSink {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.id
    }

    /// Checked while holding the channel, so a replacing job's first state always wins
    fn send_if_current(&self, next: JobState) -> bool {
        self.state.send_if_modified(|state| {
            if self.is_current() {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn finish(&self, outcome: FlashOutcome) {
        if !self.send_if_current(outcome.clone().into()) {
            debug!("job {} superseded, outcome {:?} ignored", self.id, outcome);
        }
    }
}

impl ProgressSink for JobProgressSink {
    fn publish(&self, progress: FlashProgress) {
        self.send_if_current(JobState::Running(progress));
    }
}

struct ActiveJob {
    id: u64,
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

/// Runs at most one flash of the selected device/image pair at a time
pub struct FlashJobCoordinator<T, L> {
    selection: Arc<SelectionContext<T, L>>,
    config: FlashConfig,
    state: Arc<watch::Sender<JobState>>,
    current: Arc<AtomicU64>,
    active: Mutex<Option<ActiveJob>>,
}

impl<T, L> FlashJobCoordinator<T, L>
where
    T: FlashTarget + Send + 'static,
    L: ImageLocator + 'static,
{
    pub fn new(selection: Arc<SelectionContext<T, L>>, config: FlashConfig) -> Self {
        let (state, _) = watch::channel(JobState::NotStarted);
        Self {
            selection,
            config,
            state: Arc::new(state),
            current: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn selection(&self) -> &Arc<SelectionContext<T, L>> {
        &self.selection
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start flashing the current selection. An active job is cancelled and
    /// replaced; the new one starts once the device is free. Returns the job id
    pub fn enqueue(&self) -> Result<u64> {
        let cancel = CancelToken::new();
        let (target, image) = self.selection.snapshot(&cancel)?;

        // ids are handed out under the lock so the installed job is always the newest
        let mut active = self.active();
        let id = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = active.take() {
            if !previous.handle.is_finished() {
                info!("job {} replaced by job {}", previous.id, id);
            }
            previous.cancel.cancel();
        }
        self.state.send_replace(JobState::Running(FlashProgress::default()));

        let sink = JobProgressSink {
            id,
            current: self.current.clone(),
            state: self.state.clone(),
        };
        let handle = tokio::spawn(run_job(
            target,
            image,
            self.config.clone(),
            sink,
            cancel.clone(),
        ));
        *active = Some(ActiveJob { id, cancel, handle });
        Ok(id)
    }

    /// Request cancellation of the active job. Takes effect at the next chunk boundary
    pub fn cancel(&self) {
        if let Some(job) = self.active().as_ref() {
            info!("cancelling job {}", job.id);
            job.cancel.cancel();
        }
    }

    /// Clear a terminal state back to [`JobState::NotStarted`]. Returns false
    /// while a job is running or nothing finished
    pub fn acknowledge(&self) -> bool {
        let cleared = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                *state = JobState::NotStarted;
                true
            } else {
                false
            }
        });
        if cleared {
            self.active().take();
        }
        cleared
    }

    /// Wait until the current job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }
}

async fn run_job<T, L>(
    target: Arc<AsyncMutex<T>>,
    image: Arc<L>,
    config: FlashConfig,
    sink: JobProgressSink,
    cancel: CancelToken,
) where
    T: FlashTarget,
    L: ImageLocator,
{
    // waits for a replaced job to let go of the device
    let mut target = target.lock().await;
    let outcome = if cancel.is_cancelled() {
        FlashOutcome::Cancelled
    } else {
        info!("job {}: {} -> {}", sink.id, image.label(), target.label());
        flash_target(&mut *target, image.as_ref(), &config, &sink, &cancel).await
    };
    sink.finish(outcome);
}

async fn flash_target<T, L>(
    target: &mut T,
    image: &L,
    config: &FlashConfig,
    sink: &JobProgressSink,
    cancel: &CancelToken,
) -> FlashOutcome
where
    T: FlashTarget,
    L: ImageLocator,
{
    let device = match target.acquire().await {
        Ok(device) => device,
        Err(e) => return FlashOutcome::Failed(e.to_string()),
    };
    let mut source = match image.open().await {
        Ok(source) => source,
        Err(e) => return FlashOutcome::Failed(e.to_string()),
    };
    FlashEngine::new(config)
        .run(device, &mut source, sink, cancel)
        .await
}
