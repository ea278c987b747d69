// Degradable Phase
// An optional phase whose failure downgrades its own steps instead of the run

use crate::execution::run::StepLedger;
use crate::models::{Step, StepStatus};
use crate::stages::StageId;

/// Why and where an optional phase gave up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub reason: String,
    /// Step the degradation began at, None when no step had run yet
    pub step_name: Option<String>,
}

/// Finalized steps of a phase
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub steps: Vec<Step>,
    pub degradation: Option<Degradation>,
}

/// Collects the steps of an optional phase on a local list with its own
/// "ok" flag. The outer run never sees a failed step from here.
#[derive(Debug)]
pub struct DegradablePhase {
    stage: StageId,
    steps: Vec<Step>,
    ok: bool,
    degraded_at: Option<usize>,
    reason: Option<String>,
}

impl DegradablePhase {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            steps: Vec::new(),
            ok: true,
            degraded_at: None,
            reason: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    /// Stop the phase. Attributed to the latest recorded step; later calls
    /// are ignored.
    pub fn degrade(&mut self, reason: impl Into<String>) {
        if !self.ok {
            return;
        }
        let reason = reason.into();
        tracing::warn!(stage = %self.stage, reason = %reason, "Optional phase degraded");

        self.ok = false;
        self.degraded_at = self.steps.len().checked_sub(1);
        self.reason = Some(reason);
    }

    /// Rewrite every step to Skipped when the phase did not complete
    pub fn finish(self) -> PhaseOutcome {
        let mut steps = self.steps;

        if self.ok {
            return PhaseOutcome {
                steps,
                degradation: None,
            };
        }

        let reason = self.reason.unwrap_or_default();
        for step in steps.iter_mut() {
            step.status = StepStatus::Skipped;
        }

        let step_name = self.degraded_at.and_then(|index| {
            let step = steps.get_mut(index)?;
            step.add_note(format!("degraded: {}", reason));
            Some(step.name.clone())
        });

        PhaseOutcome {
            steps,
            degradation: Some(Degradation { reason, step_name }),
        }
    }
}

impl StepLedger for DegradablePhase {
    fn can_proceed(&self) -> bool {
        self.ok
    }

    fn record(&mut self, step: Step) -> bool {
        let failure = step.is_failed().then(|| format!("{} failed", step.name));

        self.steps.push(step);
        if let Some(reason) = failure {
            self.degrade(reason);
        }
        self.ok
    }
}
