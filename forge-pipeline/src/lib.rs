// Forge Pipeline Library
// Staged, resumable build of a PGO and BOLT optimized clang toolchain

pub mod config;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod host;
pub mod models;
pub mod postcondition;
pub mod reclaim;
pub mod runners;
pub mod stages;

// Re-export commonly used types
pub use config::{ForgeConfig, Layout};
pub use error::{ServiceError, ServiceResult};
pub use host::HostArch;
pub use models::{CommandUnit, Step, StepStatus};

// Re-export execution types
pub use execution::{
    ExecutionEvent, PipelineReport, PipelineRun, PipelineRunner, ProgressSender, StageStatus,
    Verdict,
};

// Re-export runner and stage types
pub use runners::{CommandExecutor, ShellExecutor};
pub use stages::{Recipes, StageId, StageRegistry};
