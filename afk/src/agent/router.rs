//! Subagent routing.
//!
//! After each step the run executor consults the agent's router (when
//! configured). The router selects subagent targets and may carry a full
//! delegation plan in its metadata under the `delegation_plan` key.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::delegation::{
    DelegationEdge, DelegationNode, DelegationPlan, JoinPolicy, RetryPolicy,
};
use crate::error::Result;
use crate::message::Message;

/// Payload passed into subagent router callbacks.
#[derive(Debug, Clone)]
pub struct RouterInput {
    /// Current run identifier.
    pub run_id: String,
    /// Current thread identifier.
    pub thread_id: String,
    /// Current step index.
    pub step: u64,
    /// JSON-safe runtime context snapshot.
    pub context: Map<String, Value>,
    /// Current message transcript.
    pub messages: Vec<Message>,
}

/// Routing decision returned by router callbacks.
#[derive(Debug, Clone, Default)]
pub struct RouterDecision {
    /// Subagent names selected for execution.
    pub targets: Vec<String>,
    /// Whether the selected targets run in parallel.
    pub parallel: bool,
    /// Additional router metadata (may carry a `delegation_plan`).
    pub metadata: Map<String, Value>,
}

/// Router hook deciding which subagents run after a step.
#[async_trait]
pub trait SubagentRouter: Send + Sync {
    /// Inspect the run and select subagent targets. An empty decision
    /// means no delegation this step.
    async fn route(&self, input: RouterInput) -> Result<RouterDecision>;
}

/// Parse an optional router-provided delegation plan payload.
///
/// Malformed nodes and edges are dropped; a plan without any valid node
/// yields `None` so the caller falls back to the trivial fan-out plan.
#[must_use]
pub fn delegation_plan_from_metadata(metadata: &Map<String, Value>) -> Option<DelegationPlan> {
    let raw_plan = metadata.get("delegation_plan")?.as_object()?;
    let raw_nodes = raw_plan.get("nodes")?.as_array()?;

    let mut nodes: Vec<DelegationNode> = Vec::new();
    for row in raw_nodes {
        let Some(row) = row.as_object() else {
            continue;
        };
        let Some(node_id) = row
            .get("node_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        let Some(target) = row
            .get("target_agent")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|target| !target.is_empty())
        else {
            continue;
        };

        let input_binding = row
            .get("input_binding")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let retry_policy = row
            .get("retry_policy")
            .and_then(Value::as_object)
            .map_or_else(RetryPolicy::default, |retry| RetryPolicy {
                max_attempts: retry
                    .get("max_attempts")
                    .and_then(Value::as_u64)
                    .map_or(1, |attempts| attempts.max(1) as u32),
                backoff_base_s: retry
                    .get("backoff_base_s")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.25)
                    .max(0.0),
                max_backoff_s: retry
                    .get("max_backoff_s")
                    .and_then(Value::as_f64)
                    .unwrap_or(5.0)
                    .max(0.0),
                jitter_s: retry
                    .get("jitter_s")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0)
                    .max(0.0),
            });

        let timeout_s = row
            .get("timeout_s")
            .and_then(Value::as_f64)
            .or(Some(120.0));

        nodes.push(DelegationNode {
            node_id: node_id.to_owned(),
            target_agent: target.to_owned(),
            input_binding,
            timeout_s,
            retry_policy,
            required: row
                .get("required")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        });
    }
    if nodes.is_empty() {
        return None;
    }

    let mut edges: Vec<DelegationEdge> = Vec::new();
    if let Some(raw_edges) = raw_plan.get("edges").and_then(Value::as_array) {
        for row in raw_edges {
            let Some(row) = row.as_object() else {
                continue;
            };
            let (Some(from_node), Some(to_node)) = (
                row.get("from_node").and_then(Value::as_str),
                row.get("to_node").and_then(Value::as_str),
            ) else {
                continue;
            };
            let output_key_map: BTreeMap<String, String> = row
                .get("output_key_map")
                .and_then(Value::as_object)
                .map(|raw_map| {
                    raw_map
                        .iter()
                        .filter_map(|(key, value)| {
                            value.as_str().map(|v| (key.clone(), v.to_owned()))
                        })
                        .collect()
                })
                .unwrap_or_default();
            edges.push(DelegationEdge {
                from_node: from_node.to_owned(),
                to_node: to_node.to_owned(),
                output_key_map,
            });
        }
    }

    let join_policy = match raw_plan.get("join_policy").and_then(Value::as_str) {
        Some("allow_optional_failures") => JoinPolicy::AllowOptionalFailures,
        Some("first_success") => JoinPolicy::FirstSuccess,
        Some("quorum") => JoinPolicy::Quorum,
        _ => JoinPolicy::AllRequired,
    };
    let max_parallelism = raw_plan
        .get("max_parallelism")
        .and_then(Value::as_u64)
        .map_or(1, |parallelism| parallelism.max(1) as usize);
    let quorum = raw_plan
        .get("quorum")
        .and_then(Value::as_u64)
        .map(|quorum| quorum as u32);

    Some(DelegationPlan {
        nodes,
        edges,
        join_policy,
        max_parallelism,
        quorum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_parses_nodes_edges_and_policy() {
        let metadata: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "delegation_plan": {
                "nodes": [
                    {"node_id": "a", "target_agent": "writer",
                     "input_binding": {"topic": "rust"},
                     "retry_policy": {"max_attempts": 3, "backoff_base_s": 0.0,
                                      "max_backoff_s": 1.0, "jitter_s": 0.0}},
                    {"node_id": "b", "target_agent": "critic", "required": false},
                    {"node_id": "", "target_agent": "dropped"}
                ],
                "edges": [
                    {"from_node": "a", "to_node": "b",
                     "output_key_map": {"value": "from_a"}}
                ],
                "join_policy": "allow_optional_failures",
                "max_parallelism": 2,
                "quorum": 1
            }
        }))
        .unwrap();

        let plan = delegation_plan_from_metadata(&metadata).unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.nodes[0].retry_policy.max_attempts, 3);
        assert!(!plan.nodes[1].required);
        assert_eq!(plan.edges.len(), 1);
        assert_eq!(
            plan.edges[0].output_key_map.get("value").map(String::as_str),
            Some("from_a")
        );
        assert_eq!(plan.join_policy, JoinPolicy::AllowOptionalFailures);
        assert_eq!(plan.max_parallelism, 2);
    }

    #[test]
    fn missing_or_empty_plan_yields_none() {
        assert!(delegation_plan_from_metadata(&Map::new()).is_none());
        let metadata: Map<String, Value> = serde_json::from_value(serde_json::json!({
            "delegation_plan": {"nodes": []}
        }))
        .unwrap();
        assert!(delegation_plan_from_metadata(&metadata).is_none());
    }
}
