//! Publishing button indicator state

use common::ControllerState;

/// Receives the controller state after every operator update
pub trait StateReporter {
    fn report(&mut self, state: &ControllerState);
}

/// Logs the controller state whenever it changes
#[derive(Debug, Default)]
pub struct LogReporter {
    last: Option<ControllerState>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `state`; returns `true` if it differs from the last one
    pub fn observe(&mut self, state: &ControllerState) -> bool {
        if self.last.as_ref() == Some(state) {
            return false;
        }
        self.last = Some(*state);
        true
    }

    pub fn last(&self) -> Option<&ControllerState> {
        self.last.as_ref()
    }
}

impl StateReporter for LogReporter {
    fn report(&mut self, state: &ControllerState) {
        if !self.observe(state) {
            return;
        }
        let lit: Vec<String> = state
            .media
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .map(|(i, s)| format!("{}={:?}", i, s))
            .collect();
        log::info!(
            "Controller: bank {}, {} active [{}]",
            state.bank,
            state.active_count(),
            lit.join(", ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SlotState;

    #[test]
    fn test_log_reporter_deduplicates() {
        let mut reporter = LogReporter::new();
        let mut state = ControllerState::default();

        assert!(reporter.observe(&state));
        assert!(!reporter.observe(&state));

        state.media[2] = SlotState::ProceduralActive;
        assert!(reporter.observe(&state));
        assert_eq!(reporter.last(), Some(&state));

        reporter.report(&state);
        assert_eq!(reporter.last().unwrap().active_count(), 1);
    }
}
