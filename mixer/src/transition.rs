//! Crossfade curves.
//!
//! A plane mixer advances its mix value linearly; the curve only shapes how
//! that value is handed to the compositor.

use std::str::FromStr;

/// Easing functions for smooth crossfades
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EasingFunction {
    /// Linear interpolation (constant speed)
    #[default]
    Linear,
    /// Ease in (slow start, fast end)
    EaseIn,
    /// Ease out (fast start, slow end)
    EaseOut,
    /// Ease in-out (slow start and end, fast middle)
    EaseInOut,
}

impl EasingFunction {
    /// Names accepted in the config file
    pub const NAMES: [&'static str; 4] = ["linear", "ease-in", "ease-out", "ease-in-out"];

    /// Apply easing to a linear progress value (0.0 to 1.0)
    pub fn apply(&self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Linear => t,
            Self::EaseIn => t * t,
            Self::EaseOut => t * (2.0 - t),
            Self::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    -1.0 + (4.0 - 2.0 * t) * t
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::EaseIn => "ease-in",
            Self::EaseOut => "ease-out",
            Self::EaseInOut => "ease-in-out",
        }
    }
}

impl FromStr for EasingFunction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(Self::Linear),
            "ease-in" => Ok(Self::EaseIn),
            "ease-out" => Ok(Self::EaseOut),
            "ease-in-out" => Ok(Self::EaseInOut),
            other => anyhow::bail!(
                "Unknown fade curve: {} (expected one of: {})",
                other,
                Self::NAMES.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_easing_functions() {
        let linear = EasingFunction::Linear;
        assert_eq!(linear.apply(0.0), 0.0);
        assert_eq!(linear.apply(0.5), 0.5);
        assert_eq!(linear.apply(1.0), 1.0);

        let ease_in = EasingFunction::EaseIn;
        assert_eq!(ease_in.apply(0.0), 0.0);
        assert!(ease_in.apply(0.5) < 0.5); // Should be slower in the beginning
        assert_eq!(ease_in.apply(1.0), 1.0);

        let ease_out = EasingFunction::EaseOut;
        assert!(ease_out.apply(0.5) > 0.5);
        assert_eq!(ease_out.apply(1.0), 1.0);
    }

    #[test]
    fn test_easing_endpoints_and_monotonicity() {
        for name in EasingFunction::NAMES {
            let easing: EasingFunction = name.parse().unwrap();
            assert_eq!(easing.name(), name);
            assert_eq!(easing.apply(0.0), 0.0);
            assert!((easing.apply(1.0) - 1.0).abs() < 1e-6);

            let mut last = 0.0;
            for i in 0..=20 {
                let v = easing.apply(i as f32 / 20.0);
                assert!(v >= last, "{} not monotonic at step {}", name, i);
                last = v;
            }
        }
    }

    #[test]
    fn test_easing_clamps_input() {
        assert_eq!(EasingFunction::EaseInOut.apply(-1.0), 0.0);
        assert_eq!(EasingFunction::EaseInOut.apply(2.0), 1.0);
    }

    #[test]
    fn test_unknown_curve_rejected() {
        assert!("bounce".parse::<EasingFunction>().is_err());
    }
}
