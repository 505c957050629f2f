//! Model transport interface.
//!
//! The run executor talks to language models through the capability-
//! advertising [`ModelTransport`] trait. Provider routing, caching,
//! hedging, and streaming codecs live behind this seam — the core never
//! assumes a capability without checking the [`TransportCapabilities`]
//! flags first.

pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::tool::ToolDefinition;

/// Capability flags advertised by a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCapabilities {
    /// Supports `chat_stream`.
    pub streaming: bool,
    /// Supports tool/function calling.
    pub tool_calling: bool,
    /// Supports structured output schemas.
    pub structured_output: bool,
    /// Supports `embed`.
    pub embeddings: bool,
    /// Supports aborting an in-flight call via interrupt.
    pub interrupt: bool,
    /// Honors idempotency keys on requests.
    pub idempotency: bool,
}

/// Token usage reported by a transport for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt/input tokens.
    pub input_tokens: u64,
    /// Completion/output tokens.
    pub output_tokens: u64,
    /// Total token count.
    pub total_tokens: u64,
}

impl Usage {
    /// Create a usage record from input/output counts.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// A tool invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider tool-call identifier.
    pub id: String,
    /// Tool name to invoke.
    pub name: String,
    /// JSON arguments object.
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Create a new tool call request.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A chat request sent to a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model reference (opaque to the core).
    pub model: String,
    /// Current transcript.
    pub messages: Vec<Message>,
    /// Tool definitions exported to the model.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Request metadata (idempotency key, run/thread ids).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChatRequest {
    /// Create a request for `model` with the given transcript.
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Attach tool definitions.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// A normalized chat response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant text output, when present.
    pub text: Option<String>,
    /// Tool calls requested by the model, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token usage for this call.
    #[serde(default)]
    pub usage: Usage,
    /// Effective model identifier, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider-reported cost for this call in USD, when known. Feeds the
    /// run's `max_total_cost_usd` budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

impl ChatResponse {
    /// Create a text-only response.
    #[must_use]
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Create a tool-calling response.
    #[must_use]
    pub fn from_tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    /// Whether the model requested any tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Incremental event from a streaming chat call.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ChatStreamEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// A tool call started streaming.
    ToolCallStarted {
        /// Tool call id.
        id: String,
        /// Tool name.
        name: String,
    },
    /// The stream finished with a complete response.
    Completed(ChatResponse),
}

/// Boxed stream of chat events.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatStreamEvent>> + Send>>;

/// Handle over an in-flight streaming chat call.
///
/// `cancel` is a cooperative signal; transports that advertise the
/// `interrupt` capability observe it and abort the underlying stream.
pub struct ChatStreamHandle {
    /// Event stream for the call.
    pub events: ChatStream,
    /// Cooperative cancel/interrupt signal.
    pub cancel: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl std::fmt::Debug for ChatStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStreamHandle").finish_non_exhaustive()
    }
}

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    /// Model reference.
    pub model: String,
    /// Texts to embed.
    pub inputs: Vec<String>,
}

/// An embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    /// One vector per input, in order.
    pub vectors: Vec<Vec<f32>>,
    /// Token usage for the call.
    #[serde(default)]
    pub usage: Usage,
}

/// Provider session handle for resumable transports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSession {
    /// Opaque session token.
    pub session_token: Option<String>,
    /// Opaque checkpoint token.
    pub checkpoint_token: Option<String>,
}

/// Capability-advertising interface to a language model provider.
///
/// Default method bodies reject unadvertised capabilities so implementations
/// only override what they actually support.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Stable transport identifier for logs and results.
    fn id(&self) -> &str;

    /// Capability flags for this transport.
    fn capabilities(&self) -> TransportCapabilities;

    /// Execute one chat call.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Execute one streaming chat call.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let _ = request;
        Err(Error::capability("streaming"))
    }

    /// Execute one streaming chat call behind a cancellable handle.
    async fn chat_stream_handle(&self, request: ChatRequest) -> Result<ChatStreamHandle> {
        let _ = request;
        Err(Error::capability("streaming"))
    }

    /// Embed a batch of texts.
    async fn embed(&self, request: EmbedRequest) -> Result<EmbedResponse> {
        let _ = request;
        Err(Error::capability("embeddings"))
    }

    /// Open or resume a provider session.
    async fn start_session(
        &self,
        session_token: Option<String>,
        checkpoint_token: Option<String>,
    ) -> Result<TransportSession> {
        let _ = (session_token, checkpoint_token);
        Err(Error::capability("idempotency"))
    }
}
