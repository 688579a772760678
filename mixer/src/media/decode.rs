//! The per-source decode thread

use super::{DecodedFrame, FrameProducer, Produced, SourceState};
use crate::frame_queue::FrameQueue;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared between a source and its decode thread
#[derive(Debug, Default)]
pub(super) struct DecodeShared {
    pub running: AtomicBool,
    pub looping: AtomicBool,
    /// Set until `FrameProducer::start` returns
    pub starting: AtomicBool,
    state: AtomicU8,
}

impl DecodeShared {
    pub fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SourceState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// What the decode thread reports when it exits
#[derive(Debug, Default)]
pub(super) struct DecodeOutcome {
    /// Reason the play attempt ended early, if it did
    pub status: Option<String>,
    pub frames_decoded: u64,
    pub loops: u64,
}

pub(super) struct DecodeJob {
    pub label: String,
    pub producer: Box<dyn FrameProducer>,
    pub queue: Arc<FrameQueue<DecodedFrame>>,
    pub shared: Arc<DecodeShared>,
    pub decode_errors: Arc<AtomicU64>,
    /// How long to wait on the queue per drain check while flushing
    pub drain_poll: Duration,
}

pub(super) fn spawn(job: DecodeJob) -> io::Result<JoinHandle<DecodeOutcome>> {
    thread::Builder::new()
        .name(format!("decode-{}", job.label))
        .spawn(move || run(job))
}

/// Rebases producer timestamps onto the first picture of a session
#[derive(Debug, Default)]
struct SessionClock {
    base: Option<f64>,
    last: f64,
}

impl SessionClock {
    /// Returns the rebased timestamp and whether this picture opens the session
    fn rebase(&mut self, raw: f64) -> (f64, bool) {
        match self.base {
            None => {
                self.base = Some(raw);
                self.last = 0.0;
                (0.0, true)
            }
            Some(base) => {
                // Never step backwards within a session
                self.last = (raw - base).max(self.last);
                (self.last, false)
            }
        }
    }

    fn reset(&mut self) {
        self.base = None;
    }
}

fn run(job: DecodeJob) -> DecodeOutcome {
    let DecodeJob {
        label,
        mut producer,
        queue,
        shared,
        decode_errors,
        drain_poll,
    } = job;

    let mut outcome = DecodeOutcome::default();
    let mut clock = SessionClock::default();

    log::debug!("[{}] decode thread started", label);

    let started = producer.start();
    shared.starting.store(false, Ordering::Release);
    if let Err(e) = started {
        log::error!("[{}] failed to start decoding: {}", label, e);
        outcome.status = Some(e.to_string());
        shared.set_state(SourceState::Flushing);
    }

    while shared.running.load(Ordering::Acquire) {
        if shared.state() == SourceState::Flushing {
            if queue.wait_drained(drain_poll) {
                shared.set_state(SourceState::Idle);
                break;
            }
            continue;
        }

        match producer.next_frame() {
            Ok(Produced::Frame(mut frame)) => {
                let (timestamp, first) = clock.rebase(frame.timestamp);
                frame.timestamp = timestamp;
                frame.first_frame = first;
                outcome.frames_decoded += 1;
                if !queue.push(frame) {
                    log::trace!("[{}] queue deactivated, frame dropped", label);
                }
            }
            Ok(Produced::Pending) => {}
            Ok(Produced::EndOfStream) => {
                if shared.looping.load(Ordering::Acquire) {
                    log::debug!("[{}] end of stream, looping", label);
                    match producer.restart() {
                        Ok(()) => {
                            clock.reset();
                            outcome.loops += 1;
                        }
                        Err(e) => {
                            log::error!("[{}] loop restart failed: {}", label, e);
                            outcome.status = Some(e.to_string());
                            producer.flush();
                            shared.set_state(SourceState::Flushing);
                        }
                    }
                } else {
                    log::info!("[{}] end of stream", label);
                    producer.flush();
                    shared.set_state(SourceState::Flushing);
                }
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("[{}] skipping frame: {}", label, e);
                decode_errors.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("[{}] decoding stopped: {}", label, e);
                outcome.status = Some(e.to_string());
                producer.flush();
                shared.set_state(SourceState::Flushing);
            }
        }
    }

    // Codec resources go away here, before the thread can be joined
    drop(producer);

    log::debug!(
        "[{}] decode thread exiting ({} frames, {} loops)",
        label,
        outcome.frames_decoded,
        outcome.loops
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_clock_rebases_on_first_picture() {
        let mut clock = SessionClock::default();
        assert_eq!(clock.rebase(12.5), (0.0, true));
        assert_eq!(clock.rebase(12.54), (12.54 - 12.5, false));

        clock.reset();
        assert_eq!(clock.rebase(0.0), (0.0, true));
        assert_eq!(clock.rebase(0.04), (0.04, false));
    }

    #[test]
    fn test_session_clock_is_monotonic() {
        let mut clock = SessionClock::default();
        clock.rebase(1.0);
        let (a, _) = clock.rebase(1.2);
        let (b, _) = clock.rebase(1.1);
        assert!(b >= a);
    }
}
