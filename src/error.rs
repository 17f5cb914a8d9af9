//! Error types shared across the pipeline.

use thiserror::Error;

use crate::{command::CommandError, metadata::MetadataError};

/// Everything that can go fatally wrong during a pipeline invocation.
///
/// All of these abort the run; there are no retries and no rollback of
/// partially written working directories. The one non-fatal failure mode
/// (a model-quality estimate failing for a single direction) is absorbed
/// inside the quality gate and never surfaces here.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed or inconsistent invocation arguments, detected before any
    /// external process runs.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A later stage was invoked before an earlier stage produced the
    /// artifacts it depends on.
    #[error("Missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Worker {index} panicked")]
    WorkerPanic { index: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
