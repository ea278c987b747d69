// Pipeline Run
// The ordered step list and the flag that decides whether work may continue

use crate::models::Step;

/// Something steps can be recorded on
pub trait StepLedger {
    /// Whether the next unit of work may start
    fn can_proceed(&self) -> bool;

    /// Record a finished step. Returns whether work may still continue.
    fn record(&mut self, step: Step) -> bool;
}

/// State of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRun {
    steps: Vec<Step>,
    may_continue: bool,
    halt_reason: Option<String>,
    /// Reasons optional phases were downgraded
    degradations: Vec<String>,
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            may_continue: true,
            halt_reason: None,
            degradations: Vec::new(),
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<Step> {
        self.steps
    }

    pub fn may_continue(&self) -> bool {
        self.may_continue
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    /// Stop entering further work. The first reason is kept.
    pub fn halt(&mut self, reason: impl Into<String>) {
        if self.may_continue {
            self.may_continue = false;
            self.halt_reason = Some(reason.into());
        }
    }

    pub fn degradations(&self) -> &[String] {
        &self.degradations
    }

    /// Remember that an optional phase gave up. The run may still succeed.
    pub fn record_degradation(&mut self, reason: impl Into<String>) {
        self.degradations.push(reason.into());
    }

    /// Append steps finalized elsewhere (the degradable phase). Leaves the
    /// continue flag alone.
    pub fn append(&mut self, steps: Vec<Step>) {
        self.steps.extend(steps);
    }
}

impl StepLedger for PipelineRun {
    fn can_proceed(&self) -> bool {
        self.may_continue
    }

    fn record(&mut self, step: Step) -> bool {
        if step.is_failed() {
            let reason = match &step.note {
                Some(note) => format!("{} / {} failed: {}", step.stage, step.name, note),
                None => format!("{} / {} failed", step.stage, step.name),
            };
            tracing::error!(stage = %step.stage, step = %step.name, "Required step failed, halting");
            self.halt(reason);
        }
        self.steps.push(step);
        self.may_continue
    }
}
