//! Presentation timing for decoded frames

use std::time::{Duration, Instant};

/// Frames due within this window are released early
pub const PACING_EPSILON: Duration = Duration::from_millis(1);

/// Releases frames at their presentation timestamps.
///
/// The clock origin is the instant the first picture of a session was
/// seen; a later picture with timestamp `t` becomes due once
/// `elapsed >= t - epsilon`.
#[derive(Debug, Default)]
pub struct PacingClock {
    origin: Option<Instant>,
}

impl PacingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a frame with `timestamp` may be presented at `now`.
    ///
    /// `first_frame` restarts the clock so that picture is due immediately.
    pub fn is_due(&mut self, timestamp: f64, first_frame: bool, now: Instant) -> bool {
        let origin = match self.origin {
            Some(origin) if !first_frame => origin,
            _ => {
                // Anchor the origin so this frame lands exactly on `now`
                let origin = now
                    .checked_sub(Duration::from_secs_f64(timestamp.max(0.0)))
                    .unwrap_or(now);
                self.origin = Some(origin);
                return true;
            }
        };

        let elapsed = now.saturating_duration_since(origin).as_secs_f64();
        elapsed >= timestamp - PACING_EPSILON.as_secs_f64()
    }

    /// Time until a frame with `timestamp` becomes due, if the clock runs
    pub fn time_until(&self, timestamp: f64, now: Instant) -> Option<Duration> {
        let origin = self.origin?;
        let elapsed = now.saturating_duration_since(origin).as_secs_f64();
        Some(Duration::from_secs_f64((timestamp - elapsed).max(0.0)))
    }

    pub fn reset(&mut self) {
        self.origin = None;
    }

    pub fn is_running(&self) -> bool {
        self.origin.is_some()
    }
}
