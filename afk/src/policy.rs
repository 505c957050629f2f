//! Policy evaluation for runtime actions.
//!
//! Every state transition passes the policy layer before it executes: first
//! a deterministic rule engine (when configured), then dynamic policy roles
//! in declaration order. The first non-allow decision wins and
//! short-circuits. Policy evaluation never fails — it always returns a
//! [`PolicyDecision`].

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Action selected by the policy layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Allow the action.
    Allow,
    /// Deny the action.
    Deny,
    /// Defer the action to an out-of-band decision.
    Defer,
    /// Route through the interaction broker for human approval.
    RequestApproval,
    /// Route through the interaction broker for user input.
    RequestUserInput,
}

/// Runtime events the policy layer evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEventType {
    /// Before a tool call executes.
    ToolBeforeExecute,
    /// Before a subagent node dispatches.
    SubagentBeforeExecute,
    /// Before a model call is made.
    LlmBeforeCall,
}

impl std::fmt::Display for PolicyEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolBeforeExecute => write!(f, "tool_before_execute"),
            Self::SubagentBeforeExecute => write!(f, "subagent_before_execute"),
            Self::LlmBeforeCall => write!(f, "llm_before_call"),
        }
    }
}

/// Payload evaluated by the policy layer for one runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvent {
    /// Which hook fired.
    pub event_type: PolicyEventType,
    /// Current run identifier.
    pub run_id: String,
    /// Current thread identifier.
    pub thread_id: String,
    /// Current step index.
    pub step: u64,
    /// JSON-safe run context snapshot.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Target tool name when the event is tool-related.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// JSON-safe tool arguments when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Map<String, Value>>,
    /// Target subagent name when relevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subagent_name: Option<String>,
    /// Additional runtime metadata for rule matching.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PolicyEvent {
    /// The subject name a rule matches against: the tool name, the subagent
    /// name, or `"llm"` for model-call events.
    #[must_use]
    pub fn subject(&self) -> &str {
        self.tool_name
            .as_deref()
            .or(self.subagent_name.as_deref())
            .unwrap_or("llm")
    }
}

/// Decision produced by the policy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// Selected action.
    pub action: PolicyAction,
    /// Optional human-readable explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Optional rewritten tool arguments used for execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_tool_args: Option<Map<String, Value>>,
    /// Payload for approval/input defer flows.
    #[serde(default)]
    pub request_payload: Map<String, Value>,
    /// Identifier of the winning policy rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Ordered ids of every rule that matched the event.
    #[serde(default)]
    pub matched_rules: Vec<String>,
}

impl PolicyDecision {
    /// An unconditional allow.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            action: PolicyAction::Allow,
            reason: None,
            updated_tool_args: None,
            request_payload: Map::new(),
            policy_id: None,
            matched_rules: Vec::new(),
        }
    }

    /// A deny with the given reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::Deny,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    /// An approval request with the given reason.
    #[must_use]
    pub fn request_approval(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::RequestApproval,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    /// A user-input request with the given reason.
    #[must_use]
    pub fn request_user_input(reason: impl Into<String>) -> Self {
        Self {
            action: PolicyAction::RequestUserInput,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    /// Whether the action is `Allow`.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.action == PolicyAction::Allow
    }
}

impl Default for PolicyDecision {
    fn default() -> Self {
        Self::allow()
    }
}

/// One deterministic policy rule.
///
/// A rule matches when the event type is listed (empty = all types) and the
/// event subject matches one of the rule's subjects (`"*"` matches any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Stable rule identifier.
    pub id: String,
    /// Event types this rule applies to (empty = all).
    #[serde(default)]
    pub event_types: Vec<PolicyEventType>,
    /// Subject names this rule applies to (empty = all, `"*"` wildcard).
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Action taken when the rule matches.
    pub action: PolicyAction,
    /// Optional explanation attached to the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Optional tool-argument rewrite applied on allow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_tool_args: Option<Map<String, Value>>,
    /// Payload forwarded to the interaction broker on defer/request actions.
    #[serde(default)]
    pub request_payload: Map<String, Value>,
}

impl PolicyRule {
    /// Create a rule with the given id and action, matching everything.
    #[must_use]
    pub fn new(id: impl Into<String>, action: PolicyAction) -> Self {
        Self {
            id: id.into(),
            event_types: Vec::new(),
            subjects: Vec::new(),
            action,
            reason: None,
            updated_tool_args: None,
            request_payload: Map::new(),
        }
    }

    /// Restrict the rule to specific event types.
    #[must_use]
    pub fn on_events(mut self, event_types: Vec<PolicyEventType>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Restrict the rule to specific subjects.
    #[must_use]
    pub fn on_subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a tool-argument rewrite.
    #[must_use]
    pub fn with_updated_tool_args(mut self, args: Map<String, Value>) -> Self {
        self.updated_tool_args = Some(args);
        self
    }

    fn matches(&self, event: &PolicyEvent) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if self.subjects.is_empty() {
            return true;
        }
        let subject = event.subject();
        self.subjects
            .iter()
            .any(|pattern| pattern == "*" || pattern == subject)
    }
}

/// Result of evaluating the rule engine against one event.
#[derive(Debug, Clone)]
pub struct PolicyEvaluation {
    /// The winning decision.
    pub decision: PolicyDecision,
}

/// Deterministic rule engine evaluated before dynamic policy roles.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    /// Create an engine from an ordered rule list.
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Evaluate an event against the rules in declaration order.
    ///
    /// The first matching non-allow rule wins. Matching allow rules are
    /// recorded in `matched_rules` but do not short-circuit.
    #[must_use]
    pub fn evaluate(&self, event: &PolicyEvent) -> PolicyEvaluation {
        let mut matched: Vec<String> = Vec::new();
        let mut rewrite: Option<Map<String, Value>> = None;

        for rule in &self.rules {
            if !rule.matches(event) {
                continue;
            }
            matched.push(rule.id.clone());
            if rule.action == PolicyAction::Allow {
                if rule.updated_tool_args.is_some() {
                    rewrite = rule.updated_tool_args.clone();
                }
                continue;
            }
            return PolicyEvaluation {
                decision: PolicyDecision {
                    action: rule.action,
                    reason: rule.reason.clone(),
                    updated_tool_args: rule.updated_tool_args.clone(),
                    request_payload: rule.request_payload.clone(),
                    policy_id: Some(rule.id.clone()),
                    matched_rules: matched,
                },
            };
        }

        PolicyEvaluation {
            decision: PolicyDecision {
                updated_tool_args: rewrite,
                matched_rules: matched,
                ..PolicyDecision::allow()
            },
        }
    }
}

/// Dynamic policy hook evaluated after the rule engine.
#[async_trait]
pub trait PolicyRole: Send + Sync {
    /// Evaluate one event. Must not fail; return an allow when undecided.
    async fn evaluate(&self, event: &PolicyEvent) -> PolicyDecision;
}

/// Evaluate the full policy chain: rule engine first, then roles in
/// declaration order. The first non-allow decision wins.
pub async fn evaluate_chain(
    engine: Option<&PolicyEngine>,
    roles: &[Arc<dyn PolicyRole>],
    event: &PolicyEvent,
) -> PolicyDecision {
    let mut decision = PolicyDecision::allow();

    if let Some(engine) = engine {
        decision = engine.evaluate(event).decision;
        if !decision.is_allow() {
            return decision;
        }
    }

    for role in roles {
        let role_decision = role.evaluate(event).await;
        if !role_decision.is_allow() {
            return role_decision;
        }
        // Keep argument rewrites from allow decisions.
        if role_decision.updated_tool_args.is_some() {
            decision.updated_tool_args = role_decision.updated_tool_args;
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_event(tool: &str) -> PolicyEvent {
        PolicyEvent {
            event_type: PolicyEventType::ToolBeforeExecute,
            run_id: "r1".into(),
            thread_id: "t1".into(),
            step: 1,
            context: Map::new(),
            tool_name: Some(tool.into()),
            tool_args: None,
            subagent_name: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn first_non_allow_wins() {
        let engine = PolicyEngine::new(vec![
            PolicyRule::new("audit", PolicyAction::Allow),
            PolicyRule::new("deny-shell", PolicyAction::Deny)
                .on_subjects(vec!["shell".into()])
                .with_reason("shell is forbidden"),
            PolicyRule::new("deny-all", PolicyAction::Deny),
        ]);

        let eval = engine.evaluate(&tool_event("shell"));
        assert_eq!(eval.decision.action, PolicyAction::Deny);
        assert_eq!(eval.decision.policy_id.as_deref(), Some("deny-shell"));
        assert_eq!(eval.decision.matched_rules, vec!["audit", "deny-shell"]);
    }

    #[test]
    fn unmatched_subject_allows() {
        let engine = PolicyEngine::new(vec![
            PolicyRule::new("deny-shell", PolicyAction::Deny).on_subjects(vec!["shell".into()]),
        ]);
        let eval = engine.evaluate(&tool_event("search"));
        assert!(eval.decision.is_allow());
        assert!(eval.decision.matched_rules.is_empty());
    }

    #[test]
    fn allow_rule_can_rewrite_args() {
        let mut rewrite = Map::new();
        rewrite.insert("limit".into(), Value::from(10));
        let engine = PolicyEngine::new(vec![
            PolicyRule::new("cap-limit", PolicyAction::Allow)
                .on_subjects(vec!["search".into()])
                .with_updated_tool_args(rewrite),
        ]);
        let eval = engine.evaluate(&tool_event("search"));
        assert!(eval.decision.is_allow());
        let args = eval.decision.updated_tool_args.unwrap();
        assert_eq!(args.get("limit"), Some(&Value::from(10)));
    }

    struct DenyRole;

    #[async_trait]
    impl PolicyRole for DenyRole {
        async fn evaluate(&self, _event: &PolicyEvent) -> PolicyDecision {
            PolicyDecision::deny("role said no")
        }
    }

    #[tokio::test]
    async fn roles_run_after_engine() {
        let engine = PolicyEngine::new(vec![PolicyRule::new("audit", PolicyAction::Allow)]);
        let roles: Vec<Arc<dyn PolicyRole>> = vec![Arc::new(DenyRole)];
        let decision = evaluate_chain(Some(&engine), &roles, &tool_event("search")).await;
        assert_eq!(decision.action, PolicyAction::Deny);
        assert_eq!(decision.reason.as_deref(), Some("role said no"));
    }

    #[tokio::test]
    async fn engine_deny_short_circuits_roles() {
        let engine = PolicyEngine::new(vec![
            PolicyRule::new("deny-all", PolicyAction::Deny).with_reason("engine said no"),
        ]);
        let roles: Vec<Arc<dyn PolicyRole>> = vec![Arc::new(DenyRole)];
        let decision = evaluate_chain(Some(&engine), &roles, &tool_event("search")).await;
        assert_eq!(decision.reason.as_deref(), Some("engine said no"));
    }
}
