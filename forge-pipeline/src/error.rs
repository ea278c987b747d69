// Service Errors
// Configuration-level failures that stop the pipeline before any step runs

use std::io;
use thiserror::Error;

/// Errors raised before or outside step execution.
///
/// Step failures are never reported through this type: they are recorded as
/// [`Step`](crate::models::Step) data and judged by the report.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown stage '{name}'. Valid stages: {}", .valid.join(", "))]
    InvalidStage { name: String, valid: Vec<String> },

    #[error("Unsupported host architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Required tool not found on PATH: {0}")]
    MissingTool(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;
