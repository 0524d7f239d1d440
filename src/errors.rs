//! Error types shared across the scheduler.

use std::io;

/// Convenience alias used throughout the crate.
pub type JobResult<T> = Result<T, SchedulerError>;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no builder configured for architecture {0:?}")]
    NoBuilderForArch(String),

    #[error("build failed: {0}")]
    Build(String),

    #[error("merging inconsistent manifest")]
    ManifestInconsistency,

    #[error("repository {name} failed to {command}: {message}")]
    Repository {
        name: String,
        command: &'static str,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl SchedulerError {
    pub fn new(msg: impl Into<String>) -> Self {
        SchedulerError::Other(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        SchedulerError::Config(msg.into())
    }
}
