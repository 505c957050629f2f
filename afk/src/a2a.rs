//! Agent-to-agent (A2A) invocation protocol.
//!
//! An at-least-once, in-process transport between a parent run and its
//! subagents. Retried invocations are made safe by client-chosen idempotency
//! keys: once a request succeeds, every later `invoke` with the same key
//! replays the cached response and emits an `ignored_late_response` event.
//! Failures are never cached, so they may be retried with the same key.
//!
//! # Architecture
//!
//! ```text
//! InternalProtocol (implements AgentProtocol)
//!   ├── invoke(request)        → dedupe-aware delivery, ordered events
//!   ├── invoke_stream(request) → same, yielding the event sequence
//!   ├── get_task / cancel_task → per-correlation task tracking
//!   └── record_dead_letter     → exhausted-retry bookkeeping
//!
//! DeliveryStore (success cache + dead-letter log)
//!   └── InMemoryDeliveryStore — single lock around both tables
//! ```

pub mod delivery;
pub mod protocol;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::pin::Pin;

use crate::error::Result;
use crate::util::now_ms;

/// Observable protocol event kinds, in delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEventType {
    /// Request accepted for delivery.
    Queued,
    /// Request handed to the dispatcher.
    Dispatched,
    /// Dispatch produced a successful response.
    Acked,
    /// Dispatch produced a failure.
    Nacked,
    /// Retry budget exhausted; entry recorded in the dead-letter log.
    DeadLetter,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Delivery was cancelled.
    Cancelled,
    /// A dedupe hit replayed the cached response.
    IgnoredLateResponse,
}

impl std::fmt::Display for ProtocolEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::DeadLetter => "dead_letter",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::IgnoredLateResponse => "ignored_late_response",
        };
        f.write_str(name)
    }
}

/// Typed request envelope for one agent-to-agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Parent run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Conversation continuity key (`{run_id}:{thread_id}`).
    pub conversation_id: String,
    /// Unique id for this invocation.
    pub correlation_id: String,
    /// Dedupe key; identical keys replay the cached success response.
    pub idempotency_key: String,
    /// Requesting agent.
    pub source_agent: String,
    /// Target agent.
    pub target_agent: String,
    /// Invocation payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Delivery metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Optional id of the event that caused this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Per-request delivery timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
}

/// Normalized response for one agent-to-agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Parent run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Conversation continuity key.
    pub conversation_id: String,
    /// Correlation id of the originating request.
    pub correlation_id: String,
    /// Idempotency key of the originating request.
    pub idempotency_key: String,
    /// Responding agent.
    pub source_agent: String,
    /// Recipient agent.
    pub target_agent: String,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Output payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response metadata (`retryable`, latency, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InvocationResponse {
    /// Build a success response answering `request` from `source_agent`.
    #[must_use]
    pub fn success_for(
        request: &InvocationRequest,
        source_agent: impl Into<String>,
        output: Value,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            run_id: request.run_id.clone(),
            thread_id: request.thread_id.clone(),
            conversation_id: request.conversation_id.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            source_agent: source_agent.into(),
            target_agent: request.source_agent.clone(),
            success: true,
            output: Some(output),
            error: None,
            metadata,
        }
    }

    /// Build a failure response answering `request` from `source_agent`.
    #[must_use]
    pub fn failure_for(
        request: &InvocationRequest,
        source_agent: impl Into<String>,
        error: impl Into<String>,
        retryable: bool,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("retryable".to_owned(), Value::Bool(retryable));
        Self {
            run_id: request.run_id.clone(),
            thread_id: request.thread_id.clone(),
            conversation_id: request.conversation_id.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            source_agent: source_agent.into(),
            target_agent: request.source_agent.clone(),
            success: false,
            output: None,
            error: Some(error.into()),
            metadata,
        }
    }

    /// Whether a failed response may be retried. Absent metadata means yes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.metadata
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// Observable event emitted during request delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: ProtocolEventType,
    /// The request being delivered.
    pub request: InvocationRequest,
    /// The response, once available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<InvocationResponse>,
    /// Event details.
    #[serde(default)]
    pub details: Map<String, Value>,
    /// Emission timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
}

impl ProtocolEvent {
    /// Create an event for `request`.
    #[must_use]
    pub fn new(event_type: ProtocolEventType, request: InvocationRequest) -> Self {
        Self {
            event_type,
            request,
            response: None,
            details: Map::new(),
            timestamp_ms: now_ms(),
        }
    }

    /// Attach the response.
    #[must_use]
    pub fn with_response(mut self, response: InvocationResponse) -> Self {
        self.response = Some(response);
        self
    }

    /// Attach one detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Dead-letter record for an invocation that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The last request attempted.
    pub request: InvocationRequest,
    /// The last error observed.
    pub error: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// Record timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
}

impl DeadLetter {
    /// Create a dead-letter record.
    #[must_use]
    pub fn new(request: InvocationRequest, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            request,
            error: error.into(),
            attempts,
            timestamp_ms: now_ms(),
        }
    }
}

/// Internal message envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeType {
    /// A request envelope.
    Request,
    /// A response envelope.
    Response,
    /// An event envelope.
    Event,
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// Typed internal message envelope with end-to-end correlation ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalEnvelope {
    /// Envelope kind.
    pub message_type: EnvelopeType,
    /// Run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Conversation continuity key.
    pub conversation_id: String,
    /// Invocation correlation id.
    pub correlation_id: String,
    /// Dedupe key.
    pub idempotency_key: String,
    /// Sending agent.
    pub source_agent: String,
    /// Receiving agent.
    pub target_agent: String,
    /// Envelope payload.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Envelope metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Optional causation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Envelope timestamp in epoch milliseconds.
    pub timestamp_ms: i64,
}

impl InternalEnvelope {
    /// Wrap a request.
    #[must_use]
    pub fn from_request(request: &InvocationRequest) -> Self {
        Self {
            message_type: EnvelopeType::Request,
            run_id: request.run_id.clone(),
            thread_id: request.thread_id.clone(),
            conversation_id: request.conversation_id.clone(),
            correlation_id: request.correlation_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            source_agent: request.source_agent.clone(),
            target_agent: request.target_agent.clone(),
            payload: request.payload.clone(),
            metadata: request.metadata.clone(),
            causation_id: request.causation_id.clone(),
            timestamp_ms: now_ms(),
        }
    }

    /// Wrap a response, with causation pointing at the request.
    #[must_use]
    pub fn from_response(response: &InvocationResponse, causation_id: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("success".to_owned(), Value::Bool(response.success));
        payload.insert(
            "output".to_owned(),
            response.output.clone().unwrap_or(Value::Null),
        );
        payload.insert(
            "error".to_owned(),
            response
                .error
                .clone()
                .map_or(Value::Null, Value::String),
        );
        Self {
            message_type: EnvelopeType::Response,
            run_id: response.run_id.clone(),
            thread_id: response.thread_id.clone(),
            conversation_id: response.conversation_id.clone(),
            correlation_id: response.correlation_id.clone(),
            idempotency_key: response.idempotency_key.clone(),
            source_agent: response.source_agent.clone(),
            target_agent: response.target_agent.clone(),
            payload,
            metadata: response.metadata.clone(),
            causation_id: Some(causation_id.into()),
            timestamp_ms: now_ms(),
        }
    }
}

/// Boxed stream of protocol events.
pub type ProtocolEventStream = Pin<Box<dyn Stream<Item = ProtocolEvent> + Send>>;

/// Receiver side of a protocol dispatch: executes one request against the
/// target agent and returns its terminal response.
#[async_trait]
pub trait InvocationDispatcher: Send + Sync {
    /// Dispatch one request.
    async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse>;
}

/// Protocol abstraction for agent communication transports.
#[async_trait]
pub trait AgentProtocol: Send + Sync {
    /// Stable protocol identifier.
    fn protocol_id(&self) -> &str;

    /// Send one request and return one terminal response.
    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse>;

    /// Send one request and stream protocol events until terminal state.
    async fn invoke_stream(&self, request: InvocationRequest) -> Result<ProtocolEventStream>;

    /// Fetch tracked task metadata by task (correlation) id.
    async fn get_task(&self, task_id: &str) -> Result<Map<String, Value>>;

    /// Request cancellation of a tracked task.
    async fn cancel_task(&self, task_id: &str) -> Result<Map<String, Value>>;

    /// Whether this protocol records dead letters.
    fn supports_dead_letters(&self) -> bool {
        false
    }

    /// Record one exhausted-retry dead letter.
    async fn record_dead_letter(
        &self,
        request: InvocationRequest,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        let _ = (request, error, attempts);
        Ok(())
    }
}
