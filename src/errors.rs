//! Typed error hierarchy for testsmith.
//!
//! Two enums cover the two subsystems:
//! - `StageError`: failures raised by a pipeline stage or the healing loop
//! - `QueueError`: misuse of the run queue (unknown runs, shut-down queue)
//!
//! Collaborators return `anyhow::Result`; a collaborator that wants a
//! specific classification returns one of these variants and the stage
//! recovers it with [`StageError::classify`].

use thiserror::Error;

use crate::pipeline::models::RunStatus;

/// Errors from a single pipeline stage or healing attempt.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Discovery degraded: {0}")]
    DiscoveryDegraded(String),

    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Execution infrastructure failure: {0}")]
    ExecutionInfrastructureFailure(String),

    #[error("Patch for {target} rejected: {reason}")]
    PatchInvalid { target: String, reason: String },

    #[error("Healing exhausted after {attempts} attempts with {remaining_failures} failing tests")]
    HealingExhausted {
        attempts: u32,
        remaining_failures: u32,
    },

    #[error("Run cancelled")]
    QueueCancelled,

    #[error("Collaborator unreachable: {0}")]
    CollaboratorUnreachable(String),
}

impl StageError {
    /// Whether this error ends the run. Degraded discovery, unavailable
    /// generation and rejected patches are absorbed where they occur.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionInfrastructureFailure(_)
                | Self::HealingExhausted { .. }
                | Self::QueueCancelled
                | Self::CollaboratorUnreachable(_)
        )
    }

    /// The terminal status a fatal error drives the run to.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::QueueCancelled => Some(RunStatus::Cancelled),
            e if e.is_fatal() => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// Recover a typed error from a collaborator failure, or wrap the
    /// failure with `fallback` when it carries no classification.
    pub fn classify(err: anyhow::Error, fallback: fn(String) -> StageError) -> StageError {
        match err.downcast::<StageError>() {
            Ok(typed) => typed,
            Err(other) => fallback(format!("{:#}", other)),
        }
    }
}

/// Errors from the run queue manager.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run queue is shut down")]
    ShutDown,

    #[error("Invalid run request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
