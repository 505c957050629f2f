//! At-least-once in-process A2A protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::delivery::{DeliveryStore, InMemoryDeliveryStore};
use super::{
    AgentProtocol, DeadLetter, InternalEnvelope, InvocationDispatcher, InvocationRequest,
    InvocationResponse, ProtocolEvent, ProtocolEventStream, ProtocolEventType,
};
use crate::error::{Error, Result};

/// In-process [`AgentProtocol`] with idempotency dedupe, dead-letter
/// support, and per-correlation task tracking.
pub struct InternalProtocol {
    dispatch: Arc<dyn InvocationDispatcher>,
    delivery_store: Arc<dyn DeliveryStore>,
    event_log: Mutex<Vec<ProtocolEvent>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    tasks: Mutex<HashMap<String, Map<String, Value>>>,
}

impl std::fmt::Debug for InternalProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalProtocol").finish_non_exhaustive()
    }
}

impl InternalProtocol {
    /// Protocol identifier advertised to peers.
    pub const PROTOCOL_ID: &'static str = "internal.a2a.v1";

    /// Create a protocol over the given dispatcher with the default
    /// in-memory delivery store.
    #[must_use]
    pub fn new(dispatch: Arc<dyn InvocationDispatcher>) -> Self {
        Self::with_store(dispatch, Arc::new(InMemoryDeliveryStore::new()))
    }

    /// Create a protocol over the given dispatcher and delivery store.
    #[must_use]
    pub fn with_store(
        dispatch: Arc<dyn InvocationDispatcher>,
        delivery_store: Arc<dyn DeliveryStore>,
    ) -> Self {
        Self {
            dispatch,
            delivery_store,
            event_log: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of emitted protocol events.
    pub async fn events(&self) -> Vec<ProtocolEvent> {
        self.event_log.lock().await.clone()
    }

    /// Snapshot of accumulated dead-letter records.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }

    async fn track_task(&self, correlation_id: &str, fields: Map<String, Value>) {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks.entry(correlation_id.to_owned()).or_default();
        for (key, value) in fields {
            entry.insert(key, value);
        }
    }

    async fn invoke_internal(
        &self,
        request: InvocationRequest,
        events: &mut Vec<ProtocolEvent>,
    ) -> Result<InvocationResponse> {
        if let Some(cached) = self
            .delivery_store
            .get_success(&request.idempotency_key)
            .await?
        {
            debug!(
                idempotency_key = %request.idempotency_key,
                target = %request.target_agent,
                "Dedupe hit, replaying cached response",
            );
            events.push(
                ProtocolEvent::new(ProtocolEventType::IgnoredLateResponse, request)
                    .with_response(cached.clone())
                    .with_detail("deduped", Value::Bool(true)),
            );
            return Ok(cached);
        }

        let request_envelope = InternalEnvelope::from_request(&request);
        events.push(
            ProtocolEvent::new(ProtocolEventType::Queued, request.clone()).with_detail(
                "message_type",
                Value::String(request_envelope.message_type.to_string()),
            ),
        );
        events.push(
            ProtocolEvent::new(ProtocolEventType::Dispatched, request.clone())
                .with_detail("protocol", Value::String(Self::PROTOCOL_ID.to_owned())),
        );

        let mut tracked = Map::new();
        tracked.insert("status".to_owned(), Value::String("running".to_owned()));
        tracked.insert("run_id".to_owned(), Value::String(request.run_id.clone()));
        tracked.insert(
            "thread_id".to_owned(),
            Value::String(request.thread_id.clone()),
        );
        tracked.insert(
            "target_agent".to_owned(),
            Value::String(request.target_agent.clone()),
        );
        tracked.insert(
            "idempotency_key".to_owned(),
            Value::String(request.idempotency_key.clone()),
        );
        self.track_task(&request.correlation_id, tracked).await;

        let response = match self.dispatch.dispatch(request.clone()).await {
            Ok(response) => response,
            Err(Error::Cancelled) => {
                events.push(
                    ProtocolEvent::new(ProtocolEventType::Cancelled, request)
                        .with_detail("reason", Value::String("cancelled".to_owned())),
                );
                return Err(Error::Cancelled);
            }
            Err(error) => {
                events.push(
                    ProtocolEvent::new(ProtocolEventType::Nacked, request)
                        .with_detail("error", Value::String(error.to_string())),
                );
                return Err(error);
            }
        };

        let response_envelope =
            InternalEnvelope::from_response(&response, request.correlation_id.clone());

        if response.success {
            self.delivery_store
                .record_success(&request.idempotency_key, response.clone())
                .await?;
            let mut tracked = Map::new();
            tracked.insert("status".to_owned(), Value::String("completed".to_owned()));
            tracked.insert("success".to_owned(), Value::Bool(true));
            self.track_task(&request.correlation_id, tracked).await;
            events.push(
                ProtocolEvent::new(ProtocolEventType::Acked, request.clone())
                    .with_response(response.clone())
                    .with_detail(
                        "message_type",
                        Value::String(response_envelope.message_type.to_string()),
                    ),
            );
            events.push(
                ProtocolEvent::new(ProtocolEventType::Completed, request)
                    .with_response(response.clone()),
            );
        } else {
            let error_text = response
                .error
                .clone()
                .unwrap_or_else(|| "unknown".to_owned());
            let mut tracked = Map::new();
            tracked.insert("status".to_owned(), Value::String("failed".to_owned()));
            tracked.insert("success".to_owned(), Value::Bool(false));
            tracked.insert("error".to_owned(), Value::String(error_text.clone()));
            self.track_task(&request.correlation_id, tracked).await;
            events.push(
                ProtocolEvent::new(ProtocolEventType::Nacked, request.clone())
                    .with_response(response.clone())
                    .with_detail("error", Value::String(error_text)),
            );
            events.push(
                ProtocolEvent::new(ProtocolEventType::Failed, request)
                    .with_response(response.clone()),
            );
        }

        Ok(response)
    }
}

#[async_trait]
impl AgentProtocol for InternalProtocol {
    fn protocol_id(&self) -> &str {
        Self::PROTOCOL_ID
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        let mut events = Vec::new();
        let result = self.invoke_internal(request, &mut events).await;
        self.event_log.lock().await.extend(events);
        result
    }

    async fn invoke_stream(&self, request: InvocationRequest) -> Result<ProtocolEventStream> {
        let mut events = Vec::new();
        // Delivery completes before the stream is returned; events then
        // replay in order.
        let _ = self.invoke_internal(request, &mut events).await;
        self.event_log.lock().await.extend(events.clone());
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn get_task(&self, task_id: &str) -> Result<Map<String, Value>> {
        let tasks = self.tasks.lock().await;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::invalid_arguments(format!("Unknown task_id '{task_id}'")))
    }

    async fn cancel_task(&self, task_id: &str) -> Result<Map<String, Value>> {
        let mut tasks = self.tasks.lock().await;
        let Some(entry) = tasks.get_mut(task_id) else {
            return Err(Error::invalid_arguments(format!(
                "Unknown task_id '{task_id}'"
            )));
        };
        let status = entry.get("status").and_then(Value::as_str).unwrap_or("");
        if !matches!(status, "completed" | "failed" | "cancelled") {
            entry.insert(
                "status".to_owned(),
                Value::String("cancel_requested".to_owned()),
            );
        }
        Ok(entry.clone())
    }

    fn supports_dead_letters(&self) -> bool {
        true
    }

    async fn record_dead_letter(
        &self,
        request: InvocationRequest,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        warn!(
            correlation_id = %request.correlation_id,
            target = %request.target_agent,
            attempts,
            error,
            "Recording A2A dead letter",
        );
        let dead_letter = DeadLetter::new(request.clone(), error, attempts);
        self.delivery_store
            .record_dead_letter(dead_letter.clone())
            .await?;
        let event = ProtocolEvent::new(ProtocolEventType::DeadLetter, request)
            .with_detail("error", Value::String(error.to_owned()))
            .with_detail("attempts", Value::from(attempts));
        let mut dead_letters = self.dead_letters.lock().await;
        let mut event_log = self.event_log.lock().await;
        dead_letters.push(dead_letter);
        event_log.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn request(key: &str) -> InvocationRequest {
        InvocationRequest {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            conversation_id: "r1:t1".into(),
            correlation_id: format!("corr-{key}"),
            idempotency_key: key.into(),
            source_agent: "parent".into(),
            target_agent: "child".into(),
            payload: Map::new(),
            metadata: Map::new(),
            causation_id: None,
            timeout_s: None,
        }
    }

    struct CountingDispatcher {
        calls: AtomicU32,
        succeed: bool,
    }

    #[async_trait]
    impl InvocationDispatcher for CountingDispatcher {
        async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(InvocationResponse::success_for(
                    &request,
                    "child",
                    serde_json::json!({"x": 1}),
                    Map::new(),
                ))
            } else {
                Ok(InvocationResponse::failure_for(
                    &request, "child", "boom", true,
                ))
            }
        }
    }

    #[tokio::test]
    async fn second_invoke_with_same_key_replays_cached_response() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: true,
        });
        let protocol = InternalProtocol::new(dispatcher.clone());

        let first = protocol.invoke(request("K1")).await.unwrap();
        let second = protocol.invoke(request("K1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        let events = protocol.events().await;
        let replayed = events
            .iter()
            .filter(|event| event.event_type == ProtocolEventType::IgnoredLateResponse)
            .count();
        assert_eq!(replayed, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: false,
        });
        let protocol = InternalProtocol::new(dispatcher.clone());

        let first = protocol.invoke(request("K2")).await.unwrap();
        assert!(!first.success);
        let _ = protocol.invoke(request("K2")).await.unwrap();
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn event_sequence_is_ordered() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: true,
        });
        let protocol = InternalProtocol::new(dispatcher);
        let stream = protocol.invoke_stream(request("K3")).await.unwrap();
        let kinds: Vec<ProtocolEventType> =
            stream.map(|event| event.event_type).collect().await;
        assert_eq!(
            kinds,
            vec![
                ProtocolEventType::Queued,
                ProtocolEventType::Dispatched,
                ProtocolEventType::Acked,
                ProtocolEventType::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn failed_dispatch_emits_nacked_then_failed() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: false,
        });
        let protocol = InternalProtocol::new(dispatcher);
        let _ = protocol.invoke(request("K4")).await.unwrap();
        let kinds: Vec<ProtocolEventType> = protocol
            .events()
            .await
            .into_iter()
            .map(|event| event.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ProtocolEventType::Queued,
                ProtocolEventType::Dispatched,
                ProtocolEventType::Nacked,
                ProtocolEventType::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn task_tracking_and_cancel() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: true,
        });
        let protocol = InternalProtocol::new(dispatcher);
        let _ = protocol.invoke(request("K5")).await.unwrap();

        let task = protocol.get_task("corr-K5").await.unwrap();
        assert_eq!(
            task.get("status").and_then(Value::as_str),
            Some("completed")
        );
        // Terminal tasks keep their status on cancel.
        let cancelled = protocol.cancel_task("corr-K5").await.unwrap();
        assert_eq!(
            cancelled.get("status").and_then(Value::as_str),
            Some("completed")
        );
        assert!(protocol.get_task("missing").await.is_err());
    }

    #[tokio::test]
    async fn dead_letters_accumulate() {
        let dispatcher = Arc::new(CountingDispatcher {
            calls: AtomicU32::new(0),
            succeed: true,
        });
        let protocol = InternalProtocol::new(dispatcher);
        protocol
            .record_dead_letter(request("K6"), "exhausted", 3)
            .await
            .unwrap();
        let dead = protocol.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        let events = protocol.events().await;
        assert_eq!(events.last().unwrap().event_type, ProtocolEventType::DeadLetter);
    }
}
