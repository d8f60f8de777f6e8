//! cc-bridge library root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod providers;

pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use crate::core::{Broker, Message, MessageType, Queue, QueueManager, Session, SessionManager};
pub use error::{Error, Result};
pub use providers::{ClaudeExecutor, ExecuteResult, Executor, ExecutorError};
