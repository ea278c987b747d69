// Execution Events
// Progress reporting for a pipeline run

use crate::models::Step;
use crate::stages::StageId;

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// The optional phase failed and its steps were downgraded
    Degraded,
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        start_stage: StageId,
        total_stages: usize,
    },

    PipelineCompleted {
        success: bool,
        total_steps: usize,
        failed_steps: usize,
        skipped_steps: usize,
        duration: Duration,
    },

    StageStarted {
        stage: StageId,
        stage_index: usize,
        total_stages: usize,
    },

    StageCompleted {
        stage: StageId,
        status: StageStatus,
        duration: Duration,
    },

    /// Stage not entered because an earlier required stage failed
    StageSkipped { stage: StageId, reason: String },

    StepStarted {
        stage: StageId,
        step_name: String,
    },

    /// A failed attempt is about to be repeated
    StepRetrying {
        stage: StageId,
        step_name: String,
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },

    StepOutput {
        stage: StageId,
        step_name: String,
        output: String,
        is_error: bool,
    },

    StepCompleted { step: Step },

    /// The optional phase stopped early; its steps will be reported as skipped
    PhaseDegraded {
        stage: StageId,
        step_name: Option<String>,
        reason: String,
    },

    DirectoryReclaimed { stage: StageId, path: PathBuf },

    Log {
        level: LogLevel,
        message: String,
        stage: Option<StageId>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create an info log event
    pub fn info(message: impl Into<String>, stage: Option<StageId>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            stage,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, stage: Option<StageId>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            stage,
        }
    }

    /// Create an error log event
    pub fn error(message: impl Into<String>, stage: Option<StageId>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
            stage,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::PipelineStarted {
            start_stage: StageId::CloneLlvm,
            total_stages: 7,
        });
        tx.send_event(ExecutionEvent::info("hello", Some(StageId::CloneLlvm)));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::PipelineStarted { total_stages: 7, .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(
            event2,
            ExecutionEvent::Log {
                level: LogLevel::Info,
                ..
            }
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::warning("test", None));
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = progress_channel();
        drop(rx);
        tx.send_event(ExecutionEvent::error("nobody listens", None));
    }
}
