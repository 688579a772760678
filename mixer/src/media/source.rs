//! Lifecycle of one pooled media source

use super::decode::{self, DecodeJob, DecodeOutcome, DecodeShared};
use super::{
    DecodedFrame, FrameProducer, PacingClock, SourceDescriptor, SourceFactory, SourceKind,
    SourceState, SourceStats,
};
use crate::error::SourceError;
use crate::frame_queue::{DEFAULT_CAPACITY, FrameQueue};
use crate::gpu::{GpuBackend, ImageSlot};

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Tunables shared by every source in the pool
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub queue_capacity: usize,
    /// Longest a render cycle waits on a source's GPU fence
    pub fence_timeout: Duration,
    pub stats_interval: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            fence_timeout: Duration::from_millis(50),
            stats_interval: Duration::from_secs(10),
        }
    }
}

/// A decodable source feeding GPU images to the renderer.
///
/// Owned by the render thread. The decode thread only sees the frame queue
/// and a few atomics.
pub struct MediaSource<B: GpuBackend> {
    kind: SourceKind,
    label: String,
    descriptor: Option<SourceDescriptor>,
    /// Opened producer waiting for `play`
    producer: Option<Box<dyn FrameProducer>>,
    queue: Arc<FrameQueue<DecodedFrame>>,
    shared: Arc<DecodeShared>,
    thread: Option<JoinHandle<DecodeOutcome>>,
    slot: ImageSlot<B>,
    pacing: PacingClock,
    stats: SourceStats,
    settings: SourceSettings,
    status: Option<String>,
    ended: bool,
}

impl<B: GpuBackend> MediaSource<B> {
    pub fn new(kind: SourceKind, index: usize, settings: SourceSettings) -> Self {
        let label = format!("{}-{}", kind, index);
        Self {
            kind,
            stats: SourceStats::new(label.clone()),
            label,
            descriptor: None,
            producer: None,
            queue: Arc::new(FrameQueue::new(settings.queue_capacity)),
            shared: Arc::new(DecodeShared::default()),
            thread: None,
            slot: ImageSlot::new(),
            pacing: PacingClock::new(),
            settings,
            status: None,
            ended: false,
        }
    }

    /// Resolve `descriptor` and prepare a producer for it.
    ///
    /// On failure the source stays `Idle` with `status()` describing why.
    pub fn open(
        &mut self,
        descriptor: &SourceDescriptor,
        factory: &dyn SourceFactory,
    ) -> Result<(), SourceError> {
        let state = self.state();
        if state != SourceState::Idle || self.thread.is_some() {
            return Err(SourceError::Busy(state));
        }
        if descriptor.kind != self.kind {
            return Err(SourceError::Pipeline(format!(
                "{} source cannot open {} media",
                self.kind, descriptor.kind
            )));
        }

        self.shared.set_state(SourceState::Opening);
        self.status = None;
        self.ended = false;
        log::info!("[{}] opening {}", self.label, descriptor.location);

        match factory.create(descriptor) {
            Ok(producer) => {
                self.producer = Some(producer);
                self.shared
                    .looping
                    .store(descriptor.looping, Ordering::Release);
                self.descriptor = Some(descriptor.clone());
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] failed to open {}: {}", self.label, descriptor.location, e);
                self.status = Some(e.to_string());
                self.descriptor = None;
                self.shared.set_state(SourceState::Idle);
                Err(e)
            }
        }
    }

    /// Start the decode thread
    pub fn play(&mut self) -> Result<(), SourceError> {
        let state = self.state();
        if state != SourceState::Opening {
            return Err(SourceError::Busy(state));
        }
        let Some(producer) = self.producer.take() else {
            return Err(SourceError::Pipeline("no producer to play".to_string()));
        };

        let label = self
            .descriptor
            .as_ref()
            .map(|d| d.label())
            .unwrap_or_else(|| self.label.clone());

        self.queue.clear();
        self.queue.set_active(true);
        self.pacing.reset();
        self.stats.reset();
        self.shared.running.store(true, Ordering::Release);
        self.shared.starting.store(true, Ordering::Release);
        self.shared.set_state(SourceState::Playing);

        let job = DecodeJob {
            label,
            producer,
            queue: Arc::clone(&self.queue),
            shared: Arc::clone(&self.shared),
            decode_errors: self.stats.decode_errors_handle(),
            drain_poll: self.settings.fence_timeout.max(Duration::from_millis(10)),
        };

        match decode::spawn(job) {
            Ok(handle) => {
                self.thread = Some(handle);
                log::info!("[{}] playing", self.label);
                Ok(())
            }
            Err(e) => {
                log::error!("[{}] failed to spawn decode thread: {}", self.label, e);
                self.shared.running.store(false, Ordering::Release);
                self.shared.starting.store(false, Ordering::Release);
                self.queue.set_active(false);
                self.shared.set_state(SourceState::Idle);
                self.status = Some(e.to_string());
                Err(SourceError::Allocation(e.to_string()))
            }
        }
    }

    /// Per render cycle: retire finished GPU work, release a due frame,
    /// import it, and notice when decoding has finished.
    pub fn update(&mut self, backend: &mut B, now: Instant) {
        self.slot.begin_cycle(backend, self.settings.fence_timeout);

        if self.thread.is_none() {
            return;
        }

        let head = self.queue.peek_with(|f| (f.timestamp, f.first_frame));
        if let Some((timestamp, first_frame)) = head {
            if self.pacing.is_due(timestamp, first_frame, now) {
                if let Some(frame) = self.queue.pop() {
                    self.present(backend, &frame);
                }
            } else {
                self.stats.pacing_holds += 1;
            }
        }

        if self.thread.as_ref().is_some_and(|t| t.is_finished()) {
            self.reap();
        }

        self.stats.maybe_log_stats(self.settings.stats_interval);
    }

    fn present(&mut self, backend: &mut B, frame: &DecodedFrame) {
        #[cfg(feature = "profiling")]
        let start = Instant::now();

        match backend.import(frame) {
            Ok(image) => {
                self.slot.present(backend, image);
                self.stats.frames_presented += 1;
                log::trace!("[{}] presented frame at {:.3}s", self.label, frame.timestamp);
            }
            Err(e) => {
                // Keep showing the previous image
                self.stats.import_failures += 1;
                log::warn!(
                    "[{}] failed to import frame at {:.3}s: {}",
                    self.label,
                    frame.timestamp,
                    e
                );
            }
        }

        #[cfg(feature = "profiling")]
        {
            self.stats.import_time += start.elapsed();
        }
    }

    /// Collect a decode thread that exited on its own
    fn reap(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.collect(handle);
        self.shared.running.store(false, Ordering::Release);
        self.queue.set_active(false);
        self.queue.clear();
        self.shared.set_state(SourceState::Idle);
        self.ended = true;
        log::info!(
            "[{}] playback finished ({} frames presented)",
            self.label,
            self.stats.frames_presented
        );
    }

    fn collect(&mut self, handle: JoinHandle<DecodeOutcome>) {
        match handle.join() {
            Ok(outcome) => {
                if outcome.status.is_some() {
                    self.status = outcome.status;
                }
            }
            Err(_) => {
                log::error!("[{}] decode thread panicked", self.label);
                self.status = Some("decode thread panicked".to_string());
            }
        }
    }

    /// Leave a decode thread that is still prerolling to exit on its own.
    /// It sees `running` cleared once `start` returns and drops its
    /// producer there; this source carries on with a fresh queue and state.
    fn abandon(&mut self, handle: JoinHandle<DecodeOutcome>) {
        log::warn!(
            "[{}] decode thread still starting, detaching {:?}",
            self.label,
            handle.thread().name()
        );
        drop(handle);
        self.queue = Arc::new(FrameQueue::new(self.settings.queue_capacity));
        self.shared = Arc::new(DecodeShared::default());
    }

    /// Stop decoding and give back every resource. Safe to call at any
    /// point, including after a failed `open`, and more than once.
    pub fn close(&mut self, backend: &mut B) {
        let was_open = !self.is_closed();

        self.shared.running.store(false, Ordering::Release);
        self.queue.set_active(false);
        if let Some(handle) = self.thread.take() {
            if self.shared.starting.load(Ordering::Acquire) {
                self.abandon(handle);
            } else {
                self.collect(handle);
            }
        }
        // Created but never played
        drop(self.producer.take());

        let dropped = self.queue.clear();
        self.slot.release(backend);
        self.pacing.reset();
        self.descriptor = None;
        self.ended = false;
        self.shared.set_state(SourceState::Idle);

        if was_open {
            log::info!(
                "[{}] closed ({} frames presented, {} queued frames dropped)",
                self.label,
                self.stats.frames_presented,
                dropped
            );
        }
    }

    /// Free all images at shutdown, waiting at most the fence timeout
    pub fn shutdown(&mut self, backend: &mut B) {
        self.close(backend);
        self.slot.shutdown(backend, self.settings.fence_timeout);
    }

    pub fn current_texture(&self) -> Option<&B::Image> {
        self.slot.current()
    }

    /// Arm the fence submitted after this source's image was drawn
    pub fn arm_fence(&mut self, backend: &mut B, fence: B::Fence) {
        self.slot.arm_fence(backend, fence);
    }

    /// Change looping; a running decode thread picks it up at the next
    /// end of stream
    pub fn set_looping(&mut self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
        if let Some(descriptor) = self.descriptor.as_mut() {
            descriptor.looping = looping;
        }
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    /// Returns `true` once after the decode thread finished on its own
    pub fn take_ended(&mut self) -> bool {
        std::mem::take(&mut self.ended)
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    /// `Idle` with no thread, producer or current image. Images retired
    /// under a pending fence may still be waiting to be freed.
    pub fn is_closed(&self) -> bool {
        self.state() == SourceState::Idle
            && self.thread.is_none()
            && self.producer.is_none()
            && self.slot.current().is_none()
    }

    /// Whether any image or fence is still held
    pub fn holds_gpu_resources(&self) -> bool {
        !self.slot.is_empty()
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn descriptor(&self) -> Option<&SourceDescriptor> {
        self.descriptor.as_ref()
    }

    /// Last failure reason, e.g. an unsupported capture mode
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }
}

impl<B: GpuBackend> Drop for MediaSource<B> {
    fn drop(&mut self) {
        // Images need the backend and are freed by `close`; the thread
        // must not outlive its queue owner.
        self.shared.running.store(false, Ordering::Release);
        self.queue.set_active(false);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
