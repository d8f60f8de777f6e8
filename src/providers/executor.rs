//! Executor trait: one request/response turn against an external agent.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to start collaborator: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("collaborator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("malformed collaborator output: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of one executed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteResult {
    /// Continuation token to use for the next turn.
    pub session_id: String,
    /// Reply text.
    pub response: String,
    /// Reported cost in USD.
    pub cost: f64,
}

/// External execution collaborator.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one turn.
    ///
    /// With `is_new` a fresh continuation is started and `session_id` is
    /// ignored; otherwise the continuation named by `session_id` is resumed.
    /// Implementations must return promptly once `cancel` fires.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        text: &str,
        is_new: bool,
    ) -> Result<ExecuteResult, ExecutorError>;
}
