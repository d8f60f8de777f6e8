//! Message model exchanged between agents and the human operator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default first agent.
pub const AGENT_A: &str = "agent-a";
/// Default second agent.
pub const AGENT_B: &str = "agent-b";
/// The human operator.
pub const HUMAN: &str = "human";
/// Broadcast target.
pub const BROADCAST: &str = "broadcast";

/// Metadata key carrying the collaborator's reported cost for a turn.
pub const COST_METADATA_KEY: &str = "cost";

/// Message classification. Recorded only; the broker does not branch on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Human- or agent-authored text
    Message,
    /// Output of a tool invocation
    ToolResult,
    /// Sent under an impersonated `from`
    Inject,
    /// Broker/system notice
    System,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Message => write!(f, "message"),
            MessageType::ToolResult => write!(f, "tool_result"),
            MessageType::Inject => write!(f, "inject"),
            MessageType::System => write!(f, "system"),
        }
    }
}

/// Message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Payload {
    pub text: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Session state observed after the turn that produced a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MessageContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub turn_number: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// A single queued message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MessageContext>,
}

impl Message {
    /// Create a message with a fresh id and the current UTC time.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            from: from.into(),
            to: to.into(),
            message_type,
            payload: Payload {
                text: text.into(),
                metadata: HashMap::new(),
            },
            context: None,
        }
    }

    /// A message from the human operator.
    pub fn user(to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(HUMAN, to, MessageType::Message, text)
    }

    /// A message authored by an agent.
    pub fn agent(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(from, to, MessageType::Message, text)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_context(mut self, session_id: impl Into<String>, turn_number: u64) -> Self {
        self.context = Some(MessageContext {
            session_id: session_id.into(),
            turn_number,
        });
        self
    }

    pub fn text(&self) -> &str {
        &self.payload.text
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::serialization(format!("message {}", self.id), e))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| Error::serialization("message record", e))
    }
}
