// Execution Module
// Stage sequencing, the optional phase, run state and the final report

pub mod degradable;
pub mod events;
pub mod report;
pub mod run;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types
pub use degradable::{Degradation, DegradablePhase, PhaseOutcome};
pub use events::{
    progress_channel, EventSender, ExecutionEvent, LogLevel, ProgressReceiver, ProgressSender,
    StageStatus,
};
pub use report::{PipelineReport, Verdict};
pub use run::{PipelineRun, StepLedger};
pub use runner::PipelineRunner;
