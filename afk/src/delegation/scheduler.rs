//! Bounded-parallel DAG scheduler.
//!
//! Drains a validated topological order with three concurrency bounds:
//! a process-global semaphore, a per-plan (per-parent) bound, and a
//! per-target-agent semaphore that prevents thundering-herd on one child.
//! Cancellation aborts running node tasks and marks the remainder
//! cancelled; a failed node marks its transitive descendants skipped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::{DelegationNode, DelegationPlan, NodeResult, NodeStatus};

/// Cancellation/interrupt probe polled between scheduling rounds.
pub type ControlProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Executes one node attempt chain; never fails, always returns a result.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Execute one node with its bound payload.
    async fn execute(&self, node: DelegationNode, payload: Map<String, Value>) -> NodeResult;
}

/// Concurrency bounds for a scheduler instance.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    /// Global cap across all parallel delegations in the process.
    pub max_parallel_global: usize,
    /// Per-plan cap (combined with the plan's own `max_parallelism`).
    pub max_parallel_per_parent: usize,
    /// Per-target-agent cap across concurrent plans.
    pub max_parallel_per_target: usize,
    /// Ready-queue back-pressure limit.
    pub backpressure_limit: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_parallel_global: 16,
            max_parallel_per_parent: 4,
            max_parallel_per_target: 2,
            backpressure_limit: 64,
        }
    }
}

/// Executes validated delegation plans with bounded parallelism and
/// deterministic ordering.
pub struct DelegationScheduler {
    global: Arc<Semaphore>,
    max_parallel_per_parent: usize,
    max_parallel_per_target: usize,
    backpressure_limit: usize,
    target_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl std::fmt::Debug for DelegationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationScheduler")
            .field("max_parallel_per_parent", &self.max_parallel_per_parent)
            .field("max_parallel_per_target", &self.max_parallel_per_target)
            .field("backpressure_limit", &self.backpressure_limit)
            .finish_non_exhaustive()
    }
}

const CANCELLED_BY_PARENT: &str = "Cancelled by parent control flow";

impl DelegationScheduler {
    /// Create a scheduler with the given limits (each clamped to >= 1).
    #[must_use]
    pub fn new(limits: SchedulerLimits) -> Self {
        Self {
            global: Arc::new(Semaphore::new(limits.max_parallel_global.max(1))),
            max_parallel_per_parent: limits.max_parallel_per_parent.max(1),
            max_parallel_per_target: limits.max_parallel_per_target.max(1),
            backpressure_limit: limits.backpressure_limit.max(1),
            target_semaphores: Mutex::new(HashMap::new()),
        }
    }

    async fn target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let mut semaphores = self.target_semaphores.lock().await;
        Arc::clone(
            semaphores
                .entry(target.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_parallel_per_target))),
        )
    }

    /// Execute the plan's nodes in deterministic DAG order with parallel
    /// fan-out/fan-in. Returns per-node results plus audit rows for late
    /// responses observed after cancellation.
    pub async fn execute(
        &self,
        plan: &DelegationPlan,
        topological_order: &[String],
        executor: Arc<dyn NodeExecutor>,
        cancel_requested: Option<ControlProbe>,
        interrupt_requested: Option<ControlProbe>,
    ) -> Result<(HashMap<String, NodeResult>, Vec<Map<String, Value>>)> {
        if plan.nodes.is_empty() {
            return Ok((HashMap::new(), Vec::new()));
        }

        let node_by_id: HashMap<&str, &DelegationNode> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), node))
            .collect();
        let mut children: HashMap<&str, Vec<&str>> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), Vec::new()))
            .collect();
        let mut parents: HashMap<&str, Vec<&str>> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), Vec::new()))
            .collect();
        let mut indegree: HashMap<&str, usize> = plan
            .nodes
            .iter()
            .map(|node| (node.node_id.as_str(), 0))
            .collect();
        let mut edge_by_pair: HashMap<(&str, &str), &BTreeMap<String, String>> = HashMap::new();

        for edge in &plan.edges {
            children
                .entry(edge.from_node.as_str())
                .or_default()
                .push(edge.to_node.as_str());
            parents
                .entry(edge.to_node.as_str())
                .or_default()
                .push(edge.from_node.as_str());
            *indegree.entry(edge.to_node.as_str()).or_insert(0) += 1;
            edge_by_pair.insert(
                (edge.from_node.as_str(), edge.to_node.as_str()),
                &edge.output_key_map,
            );
        }

        let mut ready: Vec<String> = topological_order
            .iter()
            .filter(|node_id| indegree.get(node_id.as_str()) == Some(&0))
            .cloned()
            .collect();
        ready.sort_unstable();

        let is_control_cancelled = move || {
            cancel_requested.as_ref().is_some_and(|probe| probe())
                || interrupt_requested.as_ref().is_some_and(|probe| probe())
        };

        let mut running: JoinSet<(String, NodeResult)> = JoinSet::new();
        let mut task_nodes: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut results: HashMap<String, NodeResult> = HashMap::new();
        let mut audit: Vec<Map<String, Value>> = Vec::new();
        let mut cancelled = false;

        let parent_parallelism = plan.max_parallelism.min(self.max_parallel_per_parent);

        loop {
            if is_control_cancelled() && !cancelled {
                cancelled = true;
                running.abort_all();
            }

            while !cancelled && !ready.is_empty() && running.len() < parent_parallelism {
                if ready.len() + running.len() > self.backpressure_limit {
                    warn!(
                        ready = ready.len(),
                        running = running.len(),
                        limit = self.backpressure_limit,
                        "Delegation ready queue exceeded back-pressure limit",
                    );
                    return Err(Error::backpressure(
                        "Subagent ready queue exceeded the configured back-pressure limit",
                    ));
                }
                let node_id = ready.remove(0);
                if results.contains_key(&node_id) {
                    continue;
                }
                let Some(node) = node_by_id.get(node_id.as_str()).copied() else {
                    continue;
                };

                let blocked_parent = parents
                    .get(node_id.as_str())
                    .into_iter()
                    .flatten()
                    .find(|parent_id| {
                        results
                            .get(**parent_id)
                            .is_some_and(|result| !result.success)
                    })
                    .copied();
                if let Some(parent_id) = blocked_parent {
                    mark_subtree_skipped(
                        &node_id,
                        &format!("Dependency '{parent_id}' did not complete successfully"),
                        &node_by_id,
                        &children,
                        &mut results,
                    );
                    continue;
                }

                let payload = build_payload(&node_id, node, &parents, &edge_by_pair, &results);
                debug!(node_id = %node.node_id, target = %node.target_agent, "Scheduling node");

                let global = Arc::clone(&self.global);
                let per_target = self.target_semaphore(&node.target_agent).await;
                let task_executor = Arc::clone(&executor);
                let task_node = node.clone();
                let handle = running.spawn(async move {
                    let _global_permit = global.acquire_owned().await.ok();
                    let _target_permit = per_target.acquire_owned().await.ok();
                    let node_id = task_node.node_id.clone();
                    let result = task_executor.execute(task_node, payload).await;
                    (node_id, result)
                });
                task_nodes.insert(handle.id(), node_id);
            }

            if running.is_empty() {
                break;
            }

            // Bounded wait so cancel/interrupt flags are observed promptly.
            let joined =
                tokio::time::timeout(Duration::from_millis(50), running.join_next_with_id()).await;
            let outcome = match joined {
                Err(_) | Ok(None) => continue,
                Ok(Some(outcome)) => outcome,
            };

            let (node_id, result) = match outcome {
                Ok((task_id, (node_id, result))) => {
                    task_nodes.remove(&task_id);
                    (node_id, Some(result))
                }
                Err(join_error) => {
                    let node_id = task_nodes
                        .remove(&join_error.id())
                        .unwrap_or_default();
                    (node_id, None)
                }
            };
            let Some(node) = node_by_id.get(node_id.as_str()).copied() else {
                continue;
            };

            if cancelled {
                let mut row = Map::new();
                row.insert(
                    "type".to_owned(),
                    Value::String("ignored_late_response".to_owned()),
                );
                row.insert("node_id".to_owned(), Value::String(node_id.clone()));
                row.insert(
                    "target_agent".to_owned(),
                    Value::String(node.target_agent.clone()),
                );
                audit.push(row);
                results.entry(node_id).or_insert_with(|| {
                    NodeResult::unsuccessful(node, NodeStatus::Cancelled, 0, CANCELLED_BY_PARENT)
                });
                continue;
            }

            let result = result.unwrap_or_else(|| {
                // Aborted or panicked node task.
                NodeResult::unsuccessful(node, NodeStatus::Cancelled, 0, CANCELLED_BY_PARENT)
            });
            let success = result.success;
            results.insert(node_id.clone(), result);

            if !success {
                let kids: Vec<String> = children
                    .get(node_id.as_str())
                    .into_iter()
                    .flatten()
                    .map(|child| (*child).to_owned())
                    .collect();
                for child in kids {
                    mark_subtree_skipped(
                        &child,
                        &format!("Dependency '{node_id}' did not complete successfully"),
                        &node_by_id,
                        &children,
                        &mut results,
                    );
                }
                continue;
            }

            let running_ids: HashSet<&String> = task_nodes.values().collect();
            if let Some(kids) = children.get(node_id.as_str()) {
                for child in kids {
                    if let Some(degree) = indegree.get_mut(child) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0
                            && !results.contains_key(*child)
                            && !running_ids.contains(&(*child).to_owned())
                        {
                            ready.push((*child).to_owned());
                        }
                    }
                }
            }
            ready.sort_unstable();
        }

        if cancelled {
            for node in &plan.nodes {
                results.entry(node.node_id.clone()).or_insert_with(|| {
                    NodeResult::unsuccessful(node, NodeStatus::Cancelled, 0, CANCELLED_BY_PARENT)
                });
            }
        }

        for node_id in topological_order {
            if !results.contains_key(node_id)
                && let Some(node) = node_by_id.get(node_id.as_str())
            {
                results.insert(
                    node_id.clone(),
                    NodeResult::unsuccessful(node, NodeStatus::Skipped, 0, "Node was not scheduled"),
                );
            }
        }

        Ok((results, audit))
    }
}

/// Mark `start_node` and its transitive descendants as skipped.
fn mark_subtree_skipped(
    start_node: &str,
    reason: &str,
    node_by_id: &HashMap<&str, &DelegationNode>,
    children: &HashMap<&str, Vec<&str>>,
    results: &mut HashMap<String, NodeResult>,
) {
    let mut stack: Vec<String> = vec![start_node.to_owned()];
    while let Some(current) = stack.pop() {
        if results.contains_key(&current) {
            continue;
        }
        let Some(node) = node_by_id.get(current.as_str()) else {
            continue;
        };
        results.insert(
            current.clone(),
            NodeResult::unsuccessful(node, NodeStatus::Skipped, 0, reason),
        );
        if let Some(kids) = children.get(current.as_str()) {
            for child in kids {
                stack.push((*child).to_owned());
            }
        }
    }
}

/// Overlay a node's declared input binding with parent outputs.
///
/// Parents apply in sorted order; for each successful parent, a non-empty
/// edge key map copies mapped keys from dict outputs, dict outputs without a
/// map merge non-conflicting keys in sorted key order, and scalar outputs
/// bind under the parent's node id.
fn build_payload(
    node_id: &str,
    node: &DelegationNode,
    parents: &HashMap<&str, Vec<&str>>,
    edge_by_pair: &HashMap<(&str, &str), &BTreeMap<String, String>>,
    results: &HashMap<String, NodeResult>,
) -> Map<String, Value> {
    let mut payload = node.input_binding.clone();
    let mut parent_ids: Vec<&str> = parents
        .get(node_id)
        .into_iter()
        .flatten()
        .copied()
        .collect();
    parent_ids.sort_unstable();

    for parent_id in parent_ids {
        let Some(parent_result) = results.get(parent_id) else {
            continue;
        };
        if !parent_result.success {
            continue;
        }
        let mapping = edge_by_pair.get(&(parent_id, node_id));
        let parent_output = parent_result.output.as_ref();

        if let (Some(mapping), Some(Value::Object(output))) = (mapping, parent_output)
            && !mapping.is_empty()
        {
            for (source_key, target_key) in *mapping {
                if let Some(value) = output.get(source_key) {
                    payload.insert(target_key.clone(), value.clone());
                }
            }
            continue;
        }

        match parent_output {
            Some(Value::Object(output)) => {
                for (key, value) in output {
                    if !payload.contains_key(key) {
                        payload.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(value) if !value.is_null() => {
                payload.insert(parent_id.to_owned(), value.clone());
            }
            _ => {}
        }
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::{DelegationEdge, JoinPolicy};
    use crate::util::now_ms;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingExecutor {
        delay_ms: u64,
        peak: Arc<AtomicUsize>,
        current: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeExecutor for RecordingExecutor {
        async fn execute(
            &self,
            node: DelegationNode,
            payload: Map<String, Value>,
        ) -> NodeResult {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            let started = now_ms();
            NodeResult {
                node_id: node.node_id.clone(),
                target_agent: node.target_agent.clone(),
                status: NodeStatus::Completed,
                success: true,
                attempts: 1,
                output: Some(Value::Object(payload)),
                error: None,
                metadata: Map::new(),
                started_at_ms: started,
                finished_at_ms: now_ms(),
            }
        }
    }

    struct FailingExecutor;

    #[async_trait]
    impl NodeExecutor for FailingExecutor {
        async fn execute(
            &self,
            node: DelegationNode,
            _payload: Map<String, Value>,
        ) -> NodeResult {
            NodeResult::unsuccessful(&node, NodeStatus::Failed, 1, "always fails")
        }
    }

    fn plan_of(nodes: Vec<DelegationNode>, edges: Vec<DelegationEdge>, parallel: usize) -> DelegationPlan {
        DelegationPlan {
            nodes,
            edges,
            join_policy: JoinPolicy::AllRequired,
            max_parallelism: parallel,
            quorum: None,
        }
    }

    #[tokio::test]
    async fn parallelism_respects_plan_bound() {
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(RecordingExecutor {
            delay_ms: 30,
            peak: Arc::clone(&peak),
            current: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = DelegationScheduler::new(SchedulerLimits {
            max_parallel_global: 16,
            max_parallel_per_parent: 16,
            max_parallel_per_target: 16,
            backpressure_limit: 64,
        });
        let nodes: Vec<DelegationNode> = (0..4)
            .map(|index| DelegationNode::new(format!("n{index}"), format!("agent{index}")))
            .collect();
        let plan = plan_of(nodes, Vec::new(), 2);
        let order: Vec<String> = plan.nodes.iter().map(|n| n.node_id.clone()).collect();

        let (results, audit) = scheduler
            .execute(&plan, &order, executor, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 4);
        assert!(audit.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn per_target_limit_bounds_same_agent_fanout() {
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(RecordingExecutor {
            delay_ms: 30,
            peak: Arc::clone(&peak),
            current: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = DelegationScheduler::new(SchedulerLimits {
            max_parallel_global: 16,
            max_parallel_per_parent: 16,
            max_parallel_per_target: 1,
            backpressure_limit: 64,
        });
        let nodes: Vec<DelegationNode> = (0..3)
            .map(|index| DelegationNode::new(format!("n{index}"), "same-agent"))
            .collect();
        let plan = plan_of(nodes, Vec::new(), 3);
        let order: Vec<String> = plan.nodes.iter().map(|n| n.node_id.clone()).collect();

        let (results, _) = scheduler
            .execute(&plan, &order, executor, None, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dependency_skips_descendants() {
        let scheduler = DelegationScheduler::new(SchedulerLimits::default());
        let plan = plan_of(
            vec![
                DelegationNode::new("a", "agent"),
                DelegationNode::new("b", "agent"),
                DelegationNode::new("c", "agent"),
            ],
            vec![DelegationEdge::new("a", "b"), DelegationEdge::new("b", "c")],
            2,
        );
        let order = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let (results, _) = scheduler
            .execute(&plan, &order, Arc::new(FailingExecutor), None, None)
            .await
            .unwrap();
        assert_eq!(results["a"].status, NodeStatus::Failed);
        assert_eq!(results["b"].status, NodeStatus::Skipped);
        assert_eq!(results["c"].status, NodeStatus::Skipped);
        assert!(
            results["b"]
                .error
                .as_deref()
                .unwrap()
                .contains("did not complete successfully")
        );
    }

    #[tokio::test]
    async fn cancel_marks_pending_nodes_cancelled() {
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let probe_flag = Arc::clone(&cancel_flag);
        let executor = Arc::new(RecordingExecutor {
            delay_ms: 200,
            peak: Arc::new(AtomicUsize::new(0)),
            current: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = DelegationScheduler::new(SchedulerLimits::default());
        let plan = plan_of(
            vec![
                DelegationNode::new("a", "agent"),
                DelegationNode::new("b", "agent"),
            ],
            vec![DelegationEdge::new("a", "b")],
            1,
        );
        let order = vec!["a".to_owned(), "b".to_owned()];

        let cancel: ControlProbe =
            Arc::new(move || probe_flag.load(Ordering::SeqCst));
        tokio::spawn({
            let cancel_flag = Arc::clone(&cancel_flag);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel_flag.store(true, Ordering::SeqCst);
            }
        });

        let (results, _) = scheduler
            .execute(&plan, &order, executor, Some(cancel), None)
            .await
            .unwrap();
        assert_eq!(results["a"].status, NodeStatus::Cancelled);
        assert_eq!(results["b"].status, NodeStatus::Cancelled);
        assert_eq!(
            results["b"].error.as_deref(),
            Some("Cancelled by parent control flow")
        );
    }

    #[tokio::test]
    async fn backpressure_fails_the_plan() {
        let executor = Arc::new(RecordingExecutor {
            delay_ms: 5,
            peak: Arc::new(AtomicUsize::new(0)),
            current: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = DelegationScheduler::new(SchedulerLimits {
            max_parallel_global: 16,
            max_parallel_per_parent: 1,
            max_parallel_per_target: 16,
            backpressure_limit: 2,
        });
        let nodes: Vec<DelegationNode> = (0..8)
            .map(|index| DelegationNode::new(format!("n{index}"), "agent"))
            .collect();
        let plan = plan_of(nodes, Vec::new(), 1);
        let order: Vec<String> = plan.nodes.iter().map(|n| n.node_id.clone()).collect();

        let err = scheduler
            .execute(&plan, &order, executor, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));
    }

    #[tokio::test]
    async fn edge_key_map_binds_parent_output() {
        let executor = Arc::new(RecordingExecutor {
            delay_ms: 1,
            peak: Arc::new(AtomicUsize::new(0)),
            current: Arc::new(AtomicUsize::new(0)),
        });
        let scheduler = DelegationScheduler::new(SchedulerLimits::default());

        let mut seed = DelegationNode::new("a", "agent");
        seed.input_binding
            .insert("value".to_owned(), Value::String("A-OK".to_owned()));
        let mut key_map = BTreeMap::new();
        key_map.insert("value".to_owned(), "from_a".to_owned());
        let plan = plan_of(
            vec![seed, DelegationNode::new("b", "agent")],
            vec![DelegationEdge::new("a", "b").with_key_map(key_map)],
            2,
        );
        let order = vec!["a".to_owned(), "b".to_owned()];
        let (results, _) = scheduler
            .execute(&plan, &order, executor, None, None)
            .await
            .unwrap();

        let output_b = results["b"].output.as_ref().unwrap();
        assert_eq!(
            output_b.get("from_a"),
            Some(&Value::String("A-OK".to_owned()))
        );
    }
}
