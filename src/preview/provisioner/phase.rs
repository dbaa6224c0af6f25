use std::fmt;

use anyhow::{bail, Result};

/// Where a provisioning run is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Preparing,
    Reconciling,
    Deploying,
    AwaitingReadiness,
    BindingDns,
    Done,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Preparing => "Preparing",
            Phase::Reconciling => "Reconciling",
            Phase::Deploying => "Deploying",
            Phase::AwaitingReadiness => "AwaitingReadiness",
            Phase::BindingDns => "BindingDns",
            Phase::Done => "Done",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Check if a phase is terminal (no further transitions allowed)
pub fn is_terminal(phase: &Phase) -> bool {
    matches!(phase, Phase::Done | Phase::Failed)
}

/// Check if a phase transition is valid
pub fn is_valid_transition(from: &Phase, to: &Phase) -> bool {
    use Phase::*;

    match (from, to) {
        (from, _) if is_terminal(from) => false,

        (Preparing, Reconciling) => true,
        (Reconciling, Deploying) => true,
        (Deploying, AwaitingReadiness) => true,
        (AwaitingReadiness, BindingDns) => true,
        (BindingDns, Done) => true,

        (_, Failed) => true,

        _ => false,
    }
}

/// Validate a phase transition and return an error if invalid
pub fn validate_transition(from: &Phase, to: &Phase) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!("Invalid provisioning phase transition from '{}' to '{}'", from, to);
    }
    Ok(())
}

/// The current phase plus every phase visited so far
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    current: Phase,
    history: Vec<Phase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            current: Phase::Preparing,
            history: vec![Phase::Preparing],
        }
    }
}

impl PhaseTracker {
    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn advance(&mut self, to: Phase) -> Result<()> {
        validate_transition(&self.current, &to)?;
        tracing::info!(from = %self.current, to = %to, "Entering phase");
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Move to `Failed`, returning the phase that failed
    pub fn fail(&mut self) -> Phase {
        let failed = self.current;
        if !is_terminal(&failed) {
            self.current = Phase::Failed;
            self.history.push(Phase::Failed);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Phase::*;

    #[test]
    fn test_terminal_phases() {
        assert!(is_terminal(&Done));
        assert!(is_terminal(&Failed));
        assert!(!is_terminal(&Preparing));
        assert!(!is_terminal(&BindingDns));
    }

    #[test]
    fn test_happy_path() {
        let path = [Preparing, Reconciling, Deploying, AwaitingReadiness, BindingDns, Done];
        for pair in path.windows(2) {
            assert!(is_valid_transition(&pair[0], &pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_any_active_phase_can_fail() {
        for phase in [Preparing, Reconciling, Deploying, AwaitingReadiness, BindingDns] {
            assert!(is_valid_transition(&phase, &Failed));
        }
        assert!(!is_valid_transition(&Done, &Failed));
        assert!(!is_valid_transition(&Failed, &Failed));
    }

    #[test]
    fn test_skipping_phases_is_invalid() {
        assert!(!is_valid_transition(&Preparing, &Deploying));
        assert!(!is_valid_transition(&Reconciling, &BindingDns));
        assert!(!is_valid_transition(&Deploying, &Reconciling));
        assert!(validate_transition(&Deploying, &Done).is_err());
    }

    #[test]
    fn test_tracker_records_history() {
        let mut tracker = PhaseTracker::default();
        tracker.advance(Reconciling).unwrap();
        tracker.advance(Deploying).unwrap();
        assert!(tracker.advance(BindingDns).is_err());

        assert_eq!(tracker.fail(), Deploying);
        assert_eq!(tracker.current(), Failed);
        assert_eq!(tracker.history(), &[Preparing, Reconciling, Deploying, Failed]);

        assert_eq!(tracker.fail(), Failed);
        assert_eq!(tracker.history().len(), 4);
    }
}
