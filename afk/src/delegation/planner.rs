//! Plan construction and graph validation.

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};

use super::{DelegationNode, DelegationPlan, JoinPolicy, RetryPolicy};

/// Builds trivial fan-out plans from selected subagent targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegationPlanner;

impl DelegationPlanner {
    /// Create a deterministic fan-out plan from target names.
    ///
    /// Blank targets are skipped; duplicate targets get `#2`, `#3`, ...
    /// suffixes. The plan has no edges and `join_policy = all_required`.
    /// `max_parallelism` defaults to the node count when `parallel` is set,
    /// 1 otherwise.
    #[must_use]
    pub fn create_plan(
        &self,
        targets: &[String],
        parallel: bool,
        default_timeout_s: Option<f64>,
        default_retry_policy: Option<RetryPolicy>,
        max_parallelism: Option<usize>,
    ) -> DelegationPlan {
        let retry = default_retry_policy.unwrap_or(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut nodes: Vec<DelegationNode> = Vec::new();
        for name in targets {
            let normalized = name.trim();
            if normalized.is_empty() {
                continue;
            }
            let count = counts.entry(normalized.to_owned()).or_insert(0);
            *count += 1;
            let node_id = if *count == 1 {
                normalized.to_owned()
            } else {
                format!("{normalized}#{count}")
            };
            nodes.push(DelegationNode {
                node_id,
                target_agent: normalized.to_owned(),
                input_binding: serde_json::Map::new(),
                timeout_s: default_timeout_s,
                retry_policy: retry,
                required: true,
            });
        }

        if nodes.is_empty() {
            return DelegationPlan::default();
        }

        let max_parallel = match max_parallelism {
            Some(value) => value.max(1),
            None if parallel => nodes.len(),
            None => 1,
        };
        DelegationPlan {
            nodes,
            edges: Vec::new(),
            join_policy: JoinPolicy::AllRequired,
            max_parallelism: max_parallel,
            quorum: None,
        }
    }
}

/// Validates delegation DAG structure and produces a stable topological
/// order.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphValidator;

impl GraphValidator {
    /// Validate plan shape and return the topological ordering.
    ///
    /// Kahn's algorithm with the ready set kept lexicographically sorted:
    /// that sort is the documented tie-break, so the order is deterministic
    /// for any valid graph.
    pub fn validate(
        &self,
        plan: &DelegationPlan,
        available_targets: &HashSet<String>,
    ) -> Result<Vec<String>> {
        if plan.max_parallelism < 1 {
            return Err(Error::graph("DelegationPlan.max_parallelism must be >= 1"));
        }

        let mut node_ids: HashSet<&str> = HashSet::new();
        for node in &plan.nodes {
            if !node_ids.insert(node.node_id.as_str()) {
                return Err(Error::graph(format!(
                    "Duplicate node_id '{}' in delegation plan",
                    node.node_id
                )));
            }
            if !available_targets.contains(&node.target_agent) {
                return Err(Error::graph(format!(
                    "Unknown delegation target '{}' for node '{}'",
                    node.target_agent, node.node_id
                )));
            }
        }

        let mut indegree: BTreeMap<&str, usize> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), 0))
            .collect();
        let mut children: BTreeMap<&str, Vec<&str>> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), Vec::new()))
            .collect();

        for edge in &plan.edges {
            if !node_ids.contains(edge.from_node.as_str()) {
                return Err(Error::graph(format!(
                    "Edge source '{}' is not in delegation nodes",
                    edge.from_node
                )));
            }
            if !node_ids.contains(edge.to_node.as_str()) {
                return Err(Error::graph(format!(
                    "Edge target '{}' is not in delegation nodes",
                    edge.to_node
                )));
            }
            if edge.from_node == edge.to_node {
                return Err(Error::graph(format!(
                    "Self-cycle is not allowed for node '{}'",
                    edge.from_node
                )));
            }
            *indegree.entry(edge.to_node.as_str()).or_insert(0) += 1;
            children
                .entry(edge.from_node.as_str())
                .or_default()
                .push(edge.to_node.as_str());
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node_id, _)| *node_id)
            .collect();
        ready.sort_unstable();

        let mut order: Vec<String> = Vec::with_capacity(plan.nodes.len());
        while !ready.is_empty() {
            let current = ready.remove(0);
            order.push(current.to_owned());
            let mut unlocked: Vec<&str> = Vec::new();
            if let Some(kids) = children.get(current) {
                let mut kids = kids.clone();
                kids.sort_unstable();
                for child in kids {
                    if let Some(degree) = indegree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            unlocked.push(child);
                        }
                    }
                }
            }
            ready.extend(unlocked);
            ready.sort_unstable();
        }

        if order.len() != plan.nodes.len() {
            return Err(Error::graph("Delegation plan contains a cycle"));
        }
        Ok(order)
    }
}
