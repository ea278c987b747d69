// Runners Module
// Executes command units and turns their outcome into steps

pub mod command;
pub mod shell;

// Re-export key types
pub use command::ShellExecutor;
pub use shell::{OutputCallback, ShellConfig, ShellOutput, ShellRunner};

use crate::models::{CommandUnit, Step};

/// Executes one unit of external work.
///
/// Implementations are stateless between calls: everything a unit needs is
/// carried by the [`CommandUnit`], and the outcome is fully described by the
/// returned [`Step`].
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, unit: &CommandUnit) -> Step;
}
