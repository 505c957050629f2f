//! Delegation engine: DAG-ordered subagent fan-out.
//!
//! A [`DelegationPlan`] is a DAG of subagent invocations. Execution flows
//! through five stages:
//!
//! 1. [`DelegationPlanner`] — build a trivial fan-out plan from targets
//! 2. [`GraphValidator`] — reject bad graphs, produce a stable topological order
//! 3. [`DelegationScheduler`] — drain the order with bounded parallelism
//! 4. node executor — per-node retries, timeouts, dead-lettering
//! 5. [`DelegationAggregator`] — deterministic fan-in via the join policy
//!
//! [`DelegationEngine`] wires the stages together.
//!
//! [`DelegationPlanner`]: planner::DelegationPlanner
//! [`GraphValidator`]: planner::GraphValidator
//! [`DelegationScheduler`]: scheduler::DelegationScheduler
//! [`DelegationAggregator`]: engine::DelegationAggregator
//! [`DelegationEngine`]: engine::DelegationEngine

pub mod engine;
pub mod planner;
pub mod scheduler;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::now_ms;

/// Rule for computing a plan's aggregated status from its node results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Failed iff any required node failed.
    #[default]
    AllRequired,
    /// Required failures fail the plan; optional failures degrade it.
    AllowOptionalFailures,
    /// Completed iff at least one node succeeded.
    FirstSuccess,
    /// Completed iff the success count reaches the quorum.
    Quorum,
}

/// Terminal status of one plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node succeeded.
    Completed,
    /// Node failed after exhausting retries.
    Failed,
    /// Node was cancelled by parent control flow.
    Cancelled,
    /// Node never ran (failed dependency or unscheduled).
    Skipped,
    /// Node's final attempt timed out.
    Timeout,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Aggregated terminal status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    /// Join policy satisfied.
    Completed,
    /// Partial success with tolerated failures.
    Degraded,
    /// Join policy not satisfied.
    Failed,
    /// Cancellation dominated the plan.
    Cancelled,
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Retry controls for one delegation node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts (min 1).
    pub max_attempts: u32,
    /// Exponential backoff base in seconds.
    pub backoff_base_s: f64,
    /// Backoff cap in seconds.
    pub max_backoff_s: f64,
    /// Uniform jitter added to each delay, in seconds.
    pub jitter_s: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_base_s: 0.25,
            max_backoff_s: 5.0,
            jitter_s: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`:
    /// `min(max_backoff, base * 2^(attempt-1)) + uniform(0, jitter)`.
    #[must_use]
    pub fn backoff_delay_s(&self, attempt: u32) -> f64 {
        let base = self.backoff_base_s.max(0.0);
        let cap = self.max_backoff_s.max(base);
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(64);
        let delay = (base * 2f64.powi(exponent)).min(cap).max(0.0);
        let jitter = fastrand::f64() * self.jitter_s.max(0.0);
        delay + jitter
    }
}

/// One executable node in a delegation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationNode {
    /// Node id, unique within the plan.
    pub node_id: String,
    /// Target subagent name.
    pub target_agent: String,
    /// Declared input payload for the node.
    #[serde(default)]
    pub input_binding: Map<String, Value>,
    /// Per-attempt wall-clock timeout in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    /// Retry policy for delivery attempts.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Whether this node's failure fails strict join policies.
    pub required: bool,
}

impl DelegationNode {
    /// Create a required node with default timeout and retry policy.
    #[must_use]
    pub fn new(node_id: impl Into<String>, target_agent: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            target_agent: target_agent.into(),
            input_binding: Map::new(),
            timeout_s: Some(60.0),
            retry_policy: RetryPolicy::default(),
            required: true,
        }
    }
}

/// Directed dependency edge between delegation nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationEdge {
    /// Edge source node id.
    pub from_node: String,
    /// Edge target node id.
    pub to_node: String,
    /// Source-output-key → target-input-key mapping.
    #[serde(default)]
    pub output_key_map: BTreeMap<String, String>,
}

impl DelegationEdge {
    /// Create an edge with no key mapping.
    #[must_use]
    pub fn new(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            output_key_map: BTreeMap::new(),
        }
    }

    /// Attach an output-key mapping.
    #[must_use]
    pub fn with_key_map(mut self, output_key_map: BTreeMap<String, String>) -> Self {
        self.output_key_map = output_key_map;
        self
    }
}

/// DAG plan for subagent fan-out/fan-in execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationPlan {
    /// Plan nodes, in declaration order.
    pub nodes: Vec<DelegationNode>,
    /// Dependency edges.
    #[serde(default)]
    pub edges: Vec<DelegationEdge>,
    /// Fan-in rule.
    #[serde(default)]
    pub join_policy: JoinPolicy,
    /// Maximum concurrently running nodes for this plan (min 1).
    pub max_parallelism: usize,
    /// Success quorum, for [`JoinPolicy::Quorum`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quorum: Option<u32>,
}

impl Default for DelegationPlan {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            join_policy: JoinPolicy::AllRequired,
            max_parallelism: 1,
            quorum: None,
        }
    }
}

/// Terminal execution result for one plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Node id.
    pub node_id: String,
    /// Target subagent name.
    pub target_agent: String,
    /// Terminal status.
    pub status: NodeStatus,
    /// Whether the node succeeded.
    pub success: bool,
    /// Delivery attempts made.
    pub attempts: u32,
    /// Output payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Node start timestamp in epoch milliseconds.
    pub started_at_ms: i64,
    /// Node finish timestamp in epoch milliseconds.
    pub finished_at_ms: i64,
}

impl NodeResult {
    /// Build a non-success result with the given status and reason.
    #[must_use]
    pub fn unsuccessful(
        node: &DelegationNode,
        status: NodeStatus,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            node_id: node.node_id.clone(),
            target_agent: node.target_agent.clone(),
            status,
            success: false,
            attempts,
            output: None,
            error: Some(error.into()),
            metadata: Map::new(),
            started_at_ms: now,
            finished_at_ms: now,
        }
    }
}

/// Aggregated DAG execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResult {
    /// Per-node results keyed by node id.
    pub node_results: HashMap<String, NodeResult>,
    /// Node results in topological order.
    pub ordered_outputs: Vec<NodeResult>,
    /// Aggregated terminal status.
    pub final_status: FinalStatus,
    /// Number of successful nodes.
    pub success_count: usize,
    /// Number of unsuccessful nodes.
    pub failure_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_exponential() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base_s: 1.0,
            max_backoff_s: 3.0,
            jitter_s: 0.0,
        };
        assert!((policy.backoff_delay_s(1) - 1.0).abs() < f64::EPSILON);
        assert!((policy.backoff_delay_s(2) - 2.0).abs() < f64::EPSILON);
        // Capped at max_backoff_s from attempt 3 on.
        assert!((policy.backoff_delay_s(3) - 3.0).abs() < f64::EPSILON);
        assert!((policy.backoff_delay_s(10) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_base_yields_zero_delay() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_base_s: 0.0,
            max_backoff_s: 30.0,
            jitter_s: 0.0,
        };
        assert!(policy.backoff_delay_s(1).abs() < f64::EPSILON);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_base_s: 0.0,
            max_backoff_s: 0.0,
            jitter_s: 0.5,
        };
        for _ in 0..32 {
            let delay = policy.backoff_delay_s(1);
            assert!((0.0..=0.5).contains(&delay));
        }
    }
}
