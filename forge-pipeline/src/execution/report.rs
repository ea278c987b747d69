// Pipeline Report
// Folds a finished run into one overall result for the job system

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::run::PipelineRun;
use crate::models::{Step, StepStatus};
use crate::stages::StageId;

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// What an operator should make of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Succeeded,
    /// Usable artifact, but the optional optimization was skipped
    SucceededWithoutOptimization,
    Failed { stage: Option<StageId> },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Succeeded => write!(f, "all stages succeeded"),
            Verdict::SucceededWithoutOptimization => {
                write!(f, "succeeded without the optional BOLT optimization")
            }
            Verdict::Failed { stage: Some(stage) } => write!(f, "failed at stage {}", stage),
            Verdict::Failed { stage: None } => write!(f, "failed"),
        }
    }
}

/// Aggregated result of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// True iff no step failed
    pub success: bool,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degradations: Vec<String>,
    pub succeeded_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub duration_secs: f64,
    pub steps: Vec<Step>,
}

impl PipelineReport {
    pub fn from_run(run: PipelineRun, duration: Duration) -> Self {
        let halt_reason = run.halt_reason().map(str::to_string);
        let degradations = run.degradations().to_vec();
        let steps = run.into_steps();

        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let failed_steps = count(StepStatus::Failed);
        let skipped_steps = count(StepStatus::Skipped);

        Self {
            success: failed_steps == 0,
            degraded: !degradations.is_empty() || skipped_steps > 0,
            halt_reason,
            degradations,
            succeeded_steps: count(StepStatus::Succeeded),
            failed_steps,
            skipped_steps,
            duration_secs: duration.as_secs_f64(),
            steps,
        }
    }

    /// Stage of the first failed step
    pub fn failed_stage(&self) -> Option<StageId> {
        self.steps.iter().find(|s| s.is_failed()).map(|s| s.stage)
    }

    pub fn verdict(&self) -> Verdict {
        if !self.success {
            Verdict::Failed {
                stage: self.failed_stage(),
            }
        } else if self.degraded {
            Verdict::SucceededWithoutOptimization
        } else {
            Verdict::Succeeded
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs)
    }

    /// Announce the result on the progress channel
    pub fn emit(&self, event_tx: &Option<ProgressSender>) {
        event_tx.send_event(ExecutionEvent::PipelineCompleted {
            success: self.success,
            total_steps: self.steps.len(),
            failed_steps: self.failed_steps,
            skipped_steps: self.skipped_steps,
            duration: self.duration(),
        });
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
