//! Error types for cc-bridge.

use std::path::PathBuf;

use thiserror::Error;

use crate::providers::ExecutorError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error ({what}): {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] ExecutorError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("agent {agent_id}: {source}")]
    Agent {
        agent_id: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Serialization {
            what: what.into(),
            source,
        }
    }

    /// Attach the originating agent id to a per-agent failure.
    pub fn for_agent(self, agent_id: impl Into<String>) -> Self {
        Error::Agent {
            agent_id: agent_id.into(),
            source: Box::new(self),
        }
    }

    /// The underlying error with any agent wrapper removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::Agent { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_wrapper_keeps_the_underlying_kind() {
        let err = Error::NotFound("session for agent-a".to_string()).for_agent("agent-a");

        assert_eq!(
            err.to_string(),
            "agent agent-a: Not found: session for agent-a"
        );
        assert!(matches!(err.root(), Error::NotFound(_)));
    }

    #[test]
    fn storage_error_names_the_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = Error::storage("/tmp/q/a.json", io);

        assert!(err.to_string().contains("/tmp/q/a.json"));
    }
}
