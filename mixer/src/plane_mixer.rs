//! Crossfade state of one output plane
//!
//! Each plane has two sides. The mix value says how much of `to` is
//! visible: 0 shows only `from`, 1 only `to`. A fade always brings the
//! newcomer in on the side that is currently hidden, so consecutive fades
//! ping-pong between the sides instead of swapping references.

use std::time::Duration;

/// Mix values this close to a bound count as reaching it
const SNAP: f32 = 1e-4;

#[derive(Debug, Clone)]
pub struct PlaneMixer {
    from_id: Option<usize>,
    to_id: Option<usize>,
    mix_value: f32,
    /// +1 fades towards `to`, -1 towards `from`
    direction: f32,
    fade_duration: Duration,
    is_fading: bool,
}

impl PlaneMixer {
    pub fn new(fade_duration: Duration) -> Self {
        Self {
            from_id: None,
            to_id: None,
            mix_value: 0.0,
            direction: 1.0,
            fade_duration,
            is_fading: false,
        }
    }

    /// Fade `incoming` (a pool index, or `None` for black) in over the
    /// visible side. Returns `false` if a fade is already running.
    pub fn start_fade(&mut self, incoming: Option<usize>) -> bool {
        if self.is_fading {
            return false;
        }

        if self.mix_value <= 0.0 {
            self.to_id = incoming;
            self.direction = 1.0;
        } else {
            self.from_id = incoming;
            self.direction = -1.0;
        }
        self.is_fading = true;
        log::debug!(
            "Fade started: from={:?} to={:?} direction={:+}",
            self.from_id,
            self.to_id,
            self.direction
        );
        true
    }

    /// Advance by `dt`. When the fade completes, the side that faded out
    /// is cleared and its pool index returned.
    pub fn update(&mut self, dt: Duration) -> Option<usize> {
        if !self.is_fading {
            return None;
        }

        let step = if self.fade_duration.is_zero() {
            1.0
        } else {
            (dt.as_secs_f64() / self.fade_duration.as_secs_f64()) as f32
        };
        self.mix_value = (self.mix_value + self.direction * step).clamp(0.0, 1.0);
        if self.direction > 0.0 && self.mix_value > 1.0 - SNAP {
            self.mix_value = 1.0;
        } else if self.direction < 0.0 && self.mix_value < SNAP {
            self.mix_value = 0.0;
        }

        let finished = if self.direction > 0.0 {
            self.mix_value >= 1.0
        } else {
            self.mix_value <= 0.0
        };
        if !finished {
            return None;
        }

        self.is_fading = false;
        let faded_out = if self.direction > 0.0 {
            self.from_id.take()
        } else {
            self.to_id.take()
        };
        log::debug!(
            "Fade finished: visible={:?}, released={:?}",
            self.visible_id(),
            faded_out
        );
        faded_out
    }

    /// Drop every reference to `index`. Returns whether anything changed.
    pub fn detach(&mut self, index: usize) -> bool {
        let mut changed = false;
        if self.from_id == Some(index) {
            self.from_id = None;
            changed = true;
        }
        if self.to_id == Some(index) {
            self.to_id = None;
            changed = true;
        }
        changed
    }

    /// Pool indices this plane currently draws
    pub fn active_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.from_id.into_iter().chain(self.to_id)
    }

    pub fn references(&self, index: usize) -> bool {
        self.from_id == Some(index) || self.to_id == Some(index)
    }

    /// The side that is (or will be, once the fade ends) fully shown
    pub fn visible_id(&self) -> Option<usize> {
        let showing_to = if self.is_fading {
            self.direction > 0.0
        } else {
            self.mix_value >= 0.5
        };
        if showing_to { self.to_id } else { self.from_id }
    }

    pub fn from_id(&self) -> Option<usize> {
        self.from_id
    }

    pub fn to_id(&self) -> Option<usize> {
        self.to_id
    }

    pub fn mix_value(&self) -> f32 {
        self.mix_value
    }

    pub fn direction(&self) -> f32 {
        self.direction
    }

    pub fn is_fading(&self) -> bool {
        self.is_fading
    }

    pub fn fade_duration(&self) -> Duration {
        self.fade_duration
    }

    /// Applies to fades started afterwards and to the remainder of a
    /// running one
    pub fn set_fade_duration(&mut self, duration: Duration) {
        self.fade_duration = duration;
    }

    pub fn status(&self, index: usize) -> common::OutputStatus {
        common::OutputStatus {
            index,
            from: self.from_id,
            to: self.to_id,
            mix_value: self.mix_value,
            fading: self.is_fading,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(16);

    fn run_to_end(mixer: &mut PlaneMixer) -> Option<usize> {
        for _ in 0..10_000 {
            let released = mixer.update(FRAME);
            if !mixer.is_fading() {
                return released;
            }
        }
        panic!("fade never finished");
    }

    #[test]
    fn test_first_fade_goes_to_to_side() {
        let mut mixer = PlaneMixer::new(Duration::from_secs(2));
        assert!(mixer.start_fade(Some(3)));
        assert_eq!(mixer.to_id(), Some(3));
        assert_eq!(mixer.from_id(), None);
        assert_eq!(mixer.direction(), 1.0);
        assert!(mixer.is_fading());
    }

    #[test]
    fn test_two_second_fade() {
        let mut mixer = PlaneMixer::new(Duration::from_secs(2));
        mixer.start_fade(Some(0));

        // 125 frames of 16ms = 2s, halfway after about 1s
        let mut released = None;
        for _ in 0..62 {
            released = released.or(mixer.update(FRAME));
        }
        assert!(mixer.is_fading());
        assert!((mixer.mix_value() - 0.5).abs() < 0.01, "mix {}", mixer.mix_value());

        for _ in 62..125 {
            released = released.or(mixer.update(FRAME));
        }
        assert_eq!(mixer.mix_value(), 1.0);
        assert!(!mixer.is_fading());
        assert_eq!(released, None, "nothing was showing before");
        assert_eq!(mixer.visible_id(), Some(0));
    }

    #[test]
    fn test_mix_value_bounded_and_monotonic() {
        let mut mixer = PlaneMixer::new(Duration::from_millis(300));
        mixer.start_fade(Some(1));

        let mut last = mixer.mix_value();
        while mixer.is_fading() {
            mixer.update(Duration::from_millis(7));
            let v = mixer.mix_value();
            assert!((0.0..=1.0).contains(&v));
            assert!(v >= last);
            last = v;
        }

        mixer.start_fade(Some(2));
        let mut last = mixer.mix_value();
        while mixer.is_fading() {
            mixer.update(Duration::from_millis(7));
            let v = mixer.mix_value();
            assert!((0.0..=1.0).contains(&v));
            assert!(v <= last);
            last = v;
        }
        assert_eq!(mixer.mix_value(), 0.0);
    }

    #[test]
    fn test_ping_pong_releases_previous() {
        let mut mixer = PlaneMixer::new(Duration::from_millis(100));
        mixer.start_fade(Some(1));
        assert_eq!(run_to_end(&mut mixer), None);

        // At mix 1 the newcomer takes the from side
        assert!(mixer.start_fade(Some(2)));
        assert_eq!(mixer.from_id(), Some(2));
        assert_eq!(mixer.direction(), -1.0);
        assert_eq!(run_to_end(&mut mixer), Some(1));
        assert_eq!(mixer.to_id(), None);
        assert_eq!(mixer.visible_id(), Some(2));
        assert!(!mixer.references(1));

        assert!(mixer.start_fade(Some(3)));
        assert_eq!(mixer.to_id(), Some(3));
        assert_eq!(run_to_end(&mut mixer), Some(2));
        assert_eq!(mixer.active_ids().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_start_fade_refused_while_fading() {
        let mut mixer = PlaneMixer::new(Duration::from_secs(1));
        assert!(mixer.start_fade(Some(1)));
        mixer.update(FRAME);
        assert!(!mixer.start_fade(Some(2)));
        assert_eq!(mixer.to_id(), Some(1));
        assert!(!mixer.references(2));
    }

    #[test]
    fn test_zero_duration_completes_next_update() {
        let mut mixer = PlaneMixer::new(Duration::ZERO);
        mixer.start_fade(Some(4));
        assert!(mixer.is_fading());
        mixer.update(Duration::ZERO);
        assert!(!mixer.is_fading());
        assert_eq!(mixer.mix_value(), 1.0);
    }

    #[test]
    fn test_fade_to_black() {
        let mut mixer = PlaneMixer::new(Duration::from_millis(50));
        mixer.start_fade(Some(5));
        run_to_end(&mut mixer);

        assert!(mixer.start_fade(None));
        assert_eq!(mixer.visible_id(), None);
        assert_eq!(run_to_end(&mut mixer), Some(5));
        assert_eq!(mixer.active_ids().count(), 0);
    }

    #[test]
    fn test_detach() {
        let mut mixer = PlaneMixer::new(Duration::from_millis(50));
        mixer.start_fade(Some(5));
        assert!(mixer.detach(5));
        assert!(!mixer.detach(5));
        assert!(!mixer.references(5));
        // the fade itself keeps running, towards black
        assert!(mixer.is_fading());
        assert_eq!(run_to_end(&mut mixer), None);
    }

    #[test]
    fn test_status_snapshot() {
        let mut mixer = PlaneMixer::new(Duration::from_millis(50));
        mixer.start_fade(Some(7));
        let status = mixer.status(1);
        assert_eq!(status.index, 1);
        assert_eq!(status.to, Some(7));
        assert!(status.fading);
    }
}
