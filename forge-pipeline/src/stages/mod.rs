// Stages Module
// The fixed stage list and the commands each stage runs

pub mod recipes;
pub mod registry;

// Re-export key types
pub use recipes::{BoltTarget, Recipes};
pub use registry::{StageId, StageRegistry};
