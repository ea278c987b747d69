// Pipeline Models
// Units of work handed to the executor and the steps they produce

use crate::stages::StageId;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal status of a recorded step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Only produced by a degraded optional phase
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepStatus::Succeeded => "SUCCESS",
            StepStatus::Failed => "FAILURE",
            StepStatus::Skipped => "SKIPPED",
        };
        f.pad(label)
    }
}

/// One logical unit of external work: a single command or an ordered
/// sequence where each command runs only if the previous one succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandUnit {
    pub stage: StageId,
    pub name: String,
    pub commands: Vec<String>,
    /// Additional attempts after the first failure
    pub retries: u32,
    /// Wall-clock limit after which the unit is stopped and its partial
    /// output accepted
    pub time_box: Option<Duration>,
}

impl CommandUnit {
    pub fn new(stage: StageId, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::sequence(stage, name, vec![command.into()])
    }

    pub fn sequence(stage: StageId, name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            stage,
            name: name.into(),
            commands,
            retries: 0,
            time_box: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_time_box(mut self, limit: Duration) -> Self {
        self.time_box = Some(limit);
        self
    }
}

/// A recorded unit of executed work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub stage: StageId,
    pub status: StepStatus,
    /// Explanatory text for overrides, degradation and postcondition checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Tail of the captured stdout/stderr
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub exit_code: Option<i32>,
    pub retries_used: u32,
    pub duration: Duration,
}

impl Step {
    pub fn new(stage: StageId, name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            name: name.into(),
            stage,
            status,
            note: None,
            output: String::new(),
            exit_code: None,
            retries_used: 0,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(stage: StageId, name: impl Into<String>) -> Self {
        Self::new(stage, name, StepStatus::Succeeded)
    }

    pub fn failed(stage: StageId, name: impl Into<String>) -> Self {
        Self::new(stage, name, StepStatus::Failed)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.add_note(note);
        self
    }

    /// Append a note, keeping any earlier one
    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        self.note = Some(match self.note.take() {
            Some(existing) => format!("{}; {}", existing, note),
            None => note,
        });
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn is_ok(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_builders() {
        let unit = CommandUnit::new(StageId::CloneLlvm, "Clone", "git clone x")
            .with_retries(3)
            .with_time_box(Duration::from_secs(5));

        assert_eq!(unit.commands, vec!["git clone x".to_string()]);
        assert_eq!(unit.retries, 3);
        assert_eq!(unit.time_box, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_notes_accumulate() {
        let mut step = Step::succeeded(StageId::Package, "Strip").with_note("first");
        step.add_note("second");

        assert_eq!(step.note.as_deref(), Some("first; second"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::Succeeded.to_string(), "SUCCESS");
        assert_eq!(StepStatus::Failed.to_string(), "FAILURE");
        assert_eq!(StepStatus::Skipped.to_string(), "SKIPPED");
    }

    #[test]
    fn test_step_serializes_lowercase_status() {
        let step = Step::failed(StageId::Stage2Build, "Stage 2 Build");
        let json = serde_json::to_value(&step).unwrap();

        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "stage2_build");
        assert!(json.get("note").is_none());
    }
}
