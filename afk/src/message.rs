//! Chat message types shared between the run executor and model transports.
//!
//! A run's transcript is an append-only sequence of [`Message`]s. Content is
//! either plain text or a list of typed parts (text, image URL, tool use,
//! tool result). A compaction pass may rewrite older transcript entries but
//! never in the middle of an active phase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user input.
    User,
    /// Model output.
    Assistant,
    /// Tool execution result.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One typed content part within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text content.
    Text {
        /// The text payload.
        text: String,
    },
    /// Image referenced by URL.
    ImageUrl {
        /// Image location.
        url: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Provider tool-call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// JSON arguments object.
        arguments: Value,
    },
    /// The result of a tool invocation.
    ToolResult {
        /// Identifier of the originating tool call.
        tool_call_id: String,
        /// JSON-safe output payload.
        output: Value,
        /// Whether the tool succeeded.
        success: bool,
    },
}

/// Message content: a plain string or a list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text.
    Text(String),
    /// Typed content parts.
    Parts(Vec<ContentPart>),
}

/// One entry in a run transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// The message content.
    pub content: MessageContent,
    /// Optional author name (subagent or tool name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            name: None,
        }
    }

    /// Create a tool-result message.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, output: Value, success: bool) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_call_id: tool_call_id.into(),
                output,
                success,
            }]),
            name: None,
        }
    }

    /// Create a message from typed parts.
    #[must_use]
    pub fn from_parts(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            content: MessageContent::Parts(parts),
            name: None,
        }
    }

    /// Attach an author name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Extract the concatenated text content, if any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match &self.content {
            MessageContent::Text(text) => Some(text.clone()),
            MessageContent::Parts(parts) => {
                let collected: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if collected.is_empty() {
                    None
                } else {
                    Some(collected.join("\n"))
                }
            }
        }
    }
}
