//! Core module - Messages, queues, sessions, and the broker.
//!
//! This module contains the heart of cc-bridge's message processing:
//! - Message model and wire codec
//! - File-based per-agent queues
//! - Conversation session tracking
//! - The poll/execute/respond broker

pub mod broker;
pub mod message;
pub mod queue;
pub mod session;

pub use broker::Broker;
pub use message::{Message, MessageContext, MessageType, Payload};
pub use queue::{Queue, QueueManager};
pub use session::{Session, SessionManager};
