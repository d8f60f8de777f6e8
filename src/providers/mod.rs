//! Execution collaborators.

pub mod claude;
pub mod executor;

pub use claude::ClaudeExecutor;
pub use executor::{ExecuteResult, Executor, ExecutorError};
