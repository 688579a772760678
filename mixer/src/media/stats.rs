//! Per-source playback statistics
//!
//! Tracks what happened to the frames a source produced:
//! - presented (imported and shown)
//! - held back by pacing on a render cycle
//! - failed GPU imports
//! - decode errors skipped by the decode thread

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct SourceStats {
    label: String,

    /// Frames imported and made current
    pub(super) frames_presented: u64,

    /// Render cycles where the head frame was not yet due
    pub(super) pacing_holds: u64,

    /// Frames dropped because the GPU import failed
    pub(super) import_failures: u64,

    /// Frames skipped by the decode thread (shared with it)
    pub(super) decode_errors: Arc<AtomicU64>,

    last_stats_log: Instant,

    #[cfg(feature = "profiling")]
    pub(super) import_time: Duration,
}

impl SourceStats {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            frames_presented: 0,
            pacing_holds: 0,
            import_failures: 0,
            decode_errors: Arc::new(AtomicU64::new(0)),
            last_stats_log: Instant::now(),
            #[cfg(feature = "profiling")]
            import_time: Duration::ZERO,
        }
    }

    /// Counter handle for the decode thread
    pub fn decode_errors_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.decode_errors)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    pub fn pacing_holds(&self) -> u64 {
        self.pacing_holds
    }

    pub fn import_failures(&self) -> u64 {
        self.import_failures
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Share of frames lost to import or decode failures, as a percentage
    pub fn failure_rate(&self) -> f64 {
        let failed = self.import_failures + self.decode_errors();
        let total = self.frames_presented + failed;
        if total == 0 {
            0.0
        } else {
            (failed as f64 / total as f64) * 100.0
        }
    }

    /// Log statistics if interval has elapsed
    pub fn maybe_log_stats(&mut self, interval: Duration) {
        if self.last_stats_log.elapsed() < interval {
            return;
        }

        log::info!(
            "[{}] {} presented, {} pacing holds, {} import failures, {} decode errors ({:.1}% lost)",
            self.label,
            self.frames_presented,
            self.pacing_holds,
            self.import_failures,
            self.decode_errors(),
            self.failure_rate()
        );

        #[cfg(feature = "profiling")]
        if self.frames_presented > 0 {
            log::debug!(
                "[{}] average import time {:.2}ms",
                self.label,
                self.import_time.as_secs_f64() * 1000.0 / self.frames_presented as f64
            );
        }

        self.last_stats_log = Instant::now();
    }

    /// Reset counters for a new play attempt
    pub fn reset(&mut self) {
        self.frames_presented = 0;
        self.pacing_holds = 0;
        self.import_failures = 0;
        self.decode_errors.store(0, Ordering::Relaxed);
        #[cfg(feature = "profiling")]
        {
            self.import_time = Duration::ZERO;
        }
        self.last_stats_log = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate() {
        let mut stats = SourceStats::new("test");
        assert_eq!(stats.failure_rate(), 0.0);

        stats.frames_presented = 3;
        stats.import_failures = 1;
        assert!((stats.failure_rate() - 25.0).abs() < 1e-9);

        stats.decode_errors_handle().fetch_add(4, Ordering::Relaxed);
        assert_eq!(stats.decode_errors(), 4);
        assert!((stats.failure_rate() - 62.5).abs() < 1e-9);
    }

    #[test]
    fn test_reset_keeps_shared_handle() {
        let mut stats = SourceStats::new("test");
        let handle = stats.decode_errors_handle();
        handle.fetch_add(2, Ordering::Relaxed);
        stats.frames_presented = 10;

        stats.reset();
        assert_eq!(stats.frames_presented(), 0);
        assert_eq!(stats.decode_errors(), 0);

        handle.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.decode_errors(), 1);
    }
}
