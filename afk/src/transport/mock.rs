//! Scripted transport for testing.
//!
//! Replays a fixed sequence of responses without making real API calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    ChatRequest, ChatResponse, ModelTransport, ToolCallRequest, TransportCapabilities, Usage,
};
use crate::error::{Error, Result};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Final text output.
    Text(String),
    /// Tool calls for the executor to dispatch.
    ToolCalls(Vec<ToolCallRequest>),
    /// A transport failure.
    Error(String),
}

/// A scripted transport that returns predefined replies in sequence.
///
/// Once the script is exhausted, further calls repeat the last reply.
/// Received requests are recorded for assertions.
#[derive(Debug)]
pub struct MockTransport {
    id: String,
    capabilities: TransportCapabilities,
    replies: Vec<MockReply>,
    cost_per_call: Option<f64>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockTransport {
    /// Create a mock transport with the given scripted replies.
    #[must_use]
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            id: "mock".to_owned(),
            capabilities: TransportCapabilities {
                tool_calling: true,
                ..TransportCapabilities::default()
            },
            replies,
            cost_per_call: None,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script a single text reply.
    #[must_use]
    pub fn text(reply: impl Into<String>) -> Self {
        Self::new(vec![MockReply::Text(reply.into())])
    }

    /// Override the transport id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the advertised capabilities.
    #[must_use]
    pub const fn with_capabilities(mut self, capabilities: TransportCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Report a fixed cost (USD) on every successful reply.
    #[must_use]
    pub const fn with_cost_per_call(mut self, cost_usd: f64) -> Self {
        self.cost_per_call = Some(cost_usd);
        self
    }

    /// Number of chat calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|reqs| reqs.len()).unwrap_or(0)
    }

    /// Snapshot of received requests.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|reqs| reqs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelTransport for MockTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        if let Ok(mut reqs) = self.requests.lock() {
            reqs.push(request);
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(index.min(self.replies.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_else(|| MockReply::Text(String::new()));

        match reply {
            MockReply::Text(text) => Ok(ChatResponse {
                text: Some(text),
                tool_calls: Vec::new(),
                usage: Usage::new(8, 4),
                model: Some(self.id.clone()),
                cost_usd: self.cost_per_call,
            }),
            MockReply::ToolCalls(calls) => Ok(ChatResponse {
                text: None,
                tool_calls: calls,
                usage: Usage::new(8, 4),
                model: Some(self.id.clone()),
                cost_usd: self.cost_per_call,
            }),
            MockReply::Error(message) => Err(Error::transport(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn replays_script_then_repeats_last() {
        let transport = MockTransport::new(vec![
            MockReply::Text("first".into()),
            MockReply::Text("second".into()),
        ]);
        let request = ChatRequest::new("m", vec![Message::user("hi")]);

        let r1 = transport.chat(request.clone()).await.unwrap();
        assert_eq!(r1.text.as_deref(), Some("first"));
        let r2 = transport.chat(request.clone()).await.unwrap();
        assert_eq!(r2.text.as_deref(), Some("second"));
        let r3 = transport.chat(request).await.unwrap();
        assert_eq!(r3.text.as_deref(), Some("second"));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_error_surfaces() {
        let transport = MockTransport::new(vec![MockReply::Error("boom".into())]);
        let err = transport
            .chat(ChatRequest::new("m", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
