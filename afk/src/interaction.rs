//! Human-in-the-loop interaction broker.
//!
//! When policy routes an action through `request_approval` or
//! `request_user_input`, the run executor asks the configured
//! [`InteractionProvider`]. Providers either resolve synchronously or return
//! a deferred token; the executor then pauses the run and awaits the token
//! up to a configured timeout, applying the provider's fallback on expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::debug;

/// Outcome kind for approval/user-input decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    /// Proceed with the action.
    Allow,
    /// Refuse the action.
    Deny,
    /// Defer to an out-of-band resolution.
    Defer,
}

/// Request payload for a human approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Current execution step.
    pub step: u64,
    /// Reason shown to the approver.
    pub reason: String,
    /// Additional JSON-safe context for the approval surface.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Request payload for human user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputRequest {
    /// Run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Current execution step.
    pub step: u64,
    /// Prompt text for the human response.
    pub prompt: String,
    /// Additional JSON-safe context for the input request.
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Resolved decision for an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Decision outcome.
    pub kind: DecisionKind,
    /// Optional explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    /// Whether the request was approved.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.kind == DecisionKind::Allow
    }
}

/// Resolved decision for a user-input request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputDecision {
    /// Decision outcome.
    pub kind: DecisionKind,
    /// User-provided text value when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Optional explanation or fallback reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Deferred interaction token returned by providers that resolve
/// out-of-band.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferredDecision {
    /// Opaque token used to resolve the decision later.
    pub token: String,
    /// Optional provider message for logs/UI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Provider reply: an immediate decision or a deferred token.
#[derive(Debug, Clone)]
pub enum InteractionReply<T> {
    /// The provider resolved synchronously.
    Resolved(T),
    /// The provider deferred; await the token.
    Deferred(DeferredDecision),
}

/// Human-in-the-loop provider surface.
#[async_trait]
pub trait InteractionProvider: Send + Sync {
    /// Request approval for an action.
    async fn request_approval(&self, request: &ApprovalRequest)
    -> InteractionReply<ApprovalDecision>;

    /// Request user input.
    async fn request_user_input(
        &self,
        request: &UserInputRequest,
    ) -> InteractionReply<UserInputDecision>;

    /// Await a deferred approval token up to `timeout`. `None` on expiry.
    async fn await_deferred_approval(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<ApprovalDecision> {
        let _ = (token, timeout);
        None
    }

    /// Await a deferred user-input token up to `timeout`. `None` on expiry.
    async fn await_deferred_input(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<UserInputDecision> {
        let _ = (token, timeout);
        None
    }
}

/// Headless provider that resolves every request from configured fallbacks.
///
/// Used when no human is attached; keeps autonomous runs unblocked.
#[derive(Debug, Clone)]
pub struct HeadlessInteractionProvider {
    approval_fallback: DecisionKind,
    input_fallback: DecisionKind,
}

impl HeadlessInteractionProvider {
    /// Create a provider with the given fallbacks.
    #[must_use]
    pub const fn new(approval_fallback: DecisionKind, input_fallback: DecisionKind) -> Self {
        Self {
            approval_fallback,
            input_fallback,
        }
    }
}

impl Default for HeadlessInteractionProvider {
    fn default() -> Self {
        Self::new(DecisionKind::Deny, DecisionKind::Deny)
    }
}

#[async_trait]
impl InteractionProvider for HeadlessInteractionProvider {
    async fn request_approval(
        &self,
        request: &ApprovalRequest,
    ) -> InteractionReply<ApprovalDecision> {
        debug!(run_id = %request.run_id, step = request.step, "Headless approval fallback");
        InteractionReply::Resolved(ApprovalDecision {
            kind: self.approval_fallback,
            reason: Some("headless fallback".to_owned()),
        })
    }

    async fn request_user_input(
        &self,
        request: &UserInputRequest,
    ) -> InteractionReply<UserInputDecision> {
        debug!(run_id = %request.run_id, step = request.step, "Headless input fallback");
        InteractionReply::Resolved(UserInputDecision {
            kind: self.input_fallback,
            value: None,
            reason: Some("headless fallback".to_owned()),
        })
    }
}

/// Provider that defers every request and lets an external surface resolve
/// tokens via [`resolve_approval`](Self::resolve_approval) /
/// [`resolve_input`](Self::resolve_input).
#[derive(Default)]
pub struct ExternalInteractionProvider {
    approval_senders: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
    approval_receivers: Mutex<HashMap<String, oneshot::Receiver<ApprovalDecision>>>,
    input_senders: Mutex<HashMap<String, oneshot::Sender<UserInputDecision>>>,
    input_receivers: Mutex<HashMap<String, oneshot::Receiver<UserInputDecision>>>,
}

impl std::fmt::Debug for ExternalInteractionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.approval_senders.lock().map(|p| p.len()).unwrap_or(0)
            + self.input_senders.lock().map(|p| p.len()).unwrap_or(0);
        f.debug_struct("ExternalInteractionProvider")
            .field("pending", &pending)
            .finish()
    }
}

impl ExternalInteractionProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a deferred approval token. Returns `false` for unknown tokens.
    pub fn resolve_approval(&self, token: &str, decision: ApprovalDecision) -> bool {
        let sender = self
            .approval_senders
            .lock()
            .ok()
            .and_then(|mut map| map.remove(token));
        sender.is_some_and(|tx| tx.send(decision).is_ok())
    }

    /// Resolve a deferred user-input token. Returns `false` for unknown
    /// tokens.
    pub fn resolve_input(&self, token: &str, decision: UserInputDecision) -> bool {
        let sender = self
            .input_senders
            .lock()
            .ok()
            .and_then(|mut map| map.remove(token));
        sender.is_some_and(|tx| tx.send(decision).is_ok())
    }

    /// Tokens currently awaiting resolution.
    #[must_use]
    pub fn pending_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        if let Ok(map) = self.approval_senders.lock() {
            tokens.extend(map.keys().cloned());
        }
        if let Ok(map) = self.input_senders.lock() {
            tokens.extend(map.keys().cloned());
        }
        tokens.sort();
        tokens
    }
}

#[async_trait]
impl InteractionProvider for ExternalInteractionProvider {
    async fn request_approval(
        &self,
        _request: &ApprovalRequest,
    ) -> InteractionReply<ApprovalDecision> {
        let token = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.approval_senders.lock() {
            map.insert(token.clone(), tx);
        }
        if let Ok(mut map) = self.approval_receivers.lock() {
            map.insert(token.clone(), rx);
        }
        InteractionReply::Deferred(DeferredDecision {
            token,
            message: None,
        })
    }

    async fn request_user_input(
        &self,
        _request: &UserInputRequest,
    ) -> InteractionReply<UserInputDecision> {
        let token = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.input_senders.lock() {
            map.insert(token.clone(), tx);
        }
        if let Ok(mut map) = self.input_receivers.lock() {
            map.insert(token.clone(), rx);
        }
        InteractionReply::Deferred(DeferredDecision {
            token,
            message: None,
        })
    }

    async fn await_deferred_approval(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<ApprovalDecision> {
        let rx = self
            .approval_receivers
            .lock()
            .ok()
            .and_then(|mut map| map.remove(token))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => Some(decision),
            _ => {
                // Drop the dangling sender so late resolutions fail cleanly.
                if let Ok(mut map) = self.approval_senders.lock() {
                    map.remove(token);
                }
                None
            }
        }
    }

    async fn await_deferred_input(
        &self,
        token: &str,
        timeout: Duration,
    ) -> Option<UserInputDecision> {
        let rx = self
            .input_receivers
            .lock()
            .ok()
            .and_then(|mut map| map.remove(token))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => Some(decision),
            _ => {
                if let Ok(mut map) = self.input_senders.lock() {
                    map.remove(token);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn headless_resolves_from_fallbacks() {
        let provider =
            HeadlessInteractionProvider::new(DecisionKind::Allow, DecisionKind::Deny);
        let request = ApprovalRequest {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            step: 1,
            reason: "dangerous tool".into(),
            payload: Map::new(),
        };
        match provider.request_approval(&request).await {
            InteractionReply::Resolved(decision) => assert!(decision.is_allowed()),
            InteractionReply::Deferred(_) => panic!("headless must resolve synchronously"),
        }
    }

    #[tokio::test]
    async fn external_defers_and_resolves() {
        let provider = ExternalInteractionProvider::new();
        let request = ApprovalRequest {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            step: 1,
            reason: "needs a human".into(),
            payload: Map::new(),
        };
        let token = match provider.request_approval(&request).await {
            InteractionReply::Deferred(deferred) => deferred.token,
            InteractionReply::Resolved(_) => panic!("external provider must defer"),
        };

        assert!(provider.resolve_approval(
            &token,
            ApprovalDecision {
                kind: DecisionKind::Allow,
                reason: None,
            },
        ));
        let resolved = provider
            .await_deferred_approval(&token, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(resolved.is_allowed());
    }

    #[tokio::test]
    async fn deferred_wait_times_out() {
        let provider = ExternalInteractionProvider::new();
        let request = UserInputRequest {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            step: 2,
            prompt: "Provide input".into(),
            payload: Map::new(),
        };
        let token = match provider.request_user_input(&request).await {
            InteractionReply::Deferred(deferred) => deferred.token,
            InteractionReply::Resolved(_) => panic!("external provider must defer"),
        };
        let resolved = provider
            .await_deferred_input(&token, Duration::from_millis(20))
            .await;
        assert!(resolved.is_none());
        // The token is gone once the wait expired.
        assert!(!provider.resolve_input(
            &token,
            UserInputDecision {
                kind: DecisionKind::Allow,
                value: Some("late".into()),
                reason: None,
            },
        ));
    }
}
