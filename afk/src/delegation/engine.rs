//! Node execution, fan-in aggregation, and the assembled engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::a2a::{AgentProtocol, InvocationRequest};
use crate::error::{Error, Result};
use crate::util::now_ms;

use super::planner::{DelegationPlanner, GraphValidator};
use super::scheduler::{ControlProbe, DelegationScheduler, NodeExecutor, SchedulerLimits};
use super::{
    DelegationNode, DelegationPlan, DelegationResult, FinalStatus, JoinPolicy, NodeResult,
    NodeStatus,
};

/// Builds the invocation request for one node attempt.
pub trait RequestFactory: Send + Sync {
    /// Build the request for `node` with its bound `payload` on `attempt`.
    fn build(
        &self,
        node: &DelegationNode,
        payload: &Map<String, Value>,
        attempt: u32,
    ) -> InvocationRequest;
}

/// Executes individual delegation nodes with timeout and retry controls.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegationExecutor;

impl DelegationExecutor {
    /// Run one node to a terminal status.
    ///
    /// Attempts run against the protocol up to `retry_policy.max_attempts`
    /// times with capped exponential backoff between attempts. A response
    /// with `metadata.retryable == false` stops retrying immediately and
    /// suppresses the dead-letter record. When every attempt fails and the
    /// protocol records dead letters, exactly one entry is written.
    pub async fn execute_node(
        &self,
        node: &DelegationNode,
        payload: &Map<String, Value>,
        protocol: &dyn AgentProtocol,
        request_factory: &dyn RequestFactory,
    ) -> NodeResult {
        let mut attempts = node.retry_policy.max_attempts.max(1);
        let started_ms = now_ms();
        let mut last_error = "unknown".to_owned();
        let mut timed_out = false;
        let mut last_request: Option<InvocationRequest> = None;
        let mut dead_letter_eligible = true;

        let mut attempt = 1u32;
        while attempt <= attempts {
            let request = request_factory.build(node, payload, attempt);
            last_request = Some(request.clone());

            let outcome = match node.timeout_s {
                None => Some(protocol.invoke(request).await),
                Some(timeout_s) => {
                    match tokio::time::timeout(
                        Duration::from_secs_f64(timeout_s.max(0.0)),
                        protocol.invoke(request),
                    )
                    .await
                    {
                        Ok(result) => Some(result),
                        Err(_) => None,
                    }
                }
            };

            match outcome {
                None => {
                    timed_out = true;
                    last_error = format!(
                        "Delegation node '{}' timed out after {:.2}s",
                        node.node_id,
                        node.timeout_s.unwrap_or_default()
                    );
                }
                Some(Err(Error::Cancelled)) => {
                    return NodeResult {
                        node_id: node.node_id.clone(),
                        target_agent: node.target_agent.clone(),
                        status: NodeStatus::Cancelled,
                        success: false,
                        attempts: attempt,
                        output: None,
                        error: Some("Cancelled by parent control flow".to_owned()),
                        metadata: Map::new(),
                        started_at_ms: started_ms,
                        finished_at_ms: now_ms(),
                    };
                }
                Some(Err(error)) => {
                    timed_out = false;
                    last_error = error.to_string();
                }
                Some(Ok(response)) => {
                    if response.success {
                        return NodeResult {
                            node_id: node.node_id.clone(),
                            target_agent: node.target_agent.clone(),
                            status: NodeStatus::Completed,
                            success: true,
                            attempts: attempt,
                            output: response.output,
                            error: None,
                            metadata: response.metadata,
                            started_at_ms: started_ms,
                            finished_at_ms: now_ms(),
                        };
                    }
                    timed_out = false;
                    last_error = response
                        .error
                        .clone()
                        .unwrap_or_else(|| "Subagent returned unsuccessful response".to_owned());
                    if !response.is_retryable() {
                        attempts = attempt;
                        dead_letter_eligible = false;
                        break;
                    }
                }
            }

            if attempt < attempts {
                let delay = node.retry_policy.backoff_delay_s(attempt);
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
            attempt += 1;
        }

        if dead_letter_eligible
            && protocol.supports_dead_letters()
            && let Some(request) = last_request
        {
            if let Err(error) = protocol
                .record_dead_letter(request, &last_error, attempts)
                .await
            {
                warn!(%error, node_id = %node.node_id, "Failed to record dead letter");
            }
        }

        NodeResult {
            node_id: node.node_id.clone(),
            target_agent: node.target_agent.clone(),
            status: if timed_out {
                NodeStatus::Timeout
            } else {
                NodeStatus::Failed
            },
            success: false,
            attempts,
            output: None,
            error: Some(last_error),
            metadata: Map::new(),
            started_at_ms: started_ms,
            finished_at_ms: now_ms(),
        }
    }
}

/// Aggregates node results via the plan's join policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelegationAggregator;

impl DelegationAggregator {
    /// Build a deterministic fan-in result in topological order.
    ///
    /// Cancellation overrides the join policy: when at least one node was
    /// cancelled and every node is cancelled or skipped, the aggregated
    /// status is `cancelled`.
    #[must_use]
    pub fn aggregate(
        &self,
        plan: &DelegationPlan,
        topological_order: &[String],
        node_results: HashMap<String, NodeResult>,
    ) -> DelegationResult {
        let ordered: Vec<NodeResult> = topological_order
            .iter()
            .filter_map(|node_id| node_results.get(node_id).cloned())
            .collect();

        let success_count = ordered.iter().filter(|result| result.success).count();
        let failure_count = ordered.len() - success_count;

        let cancelled_count = ordered
            .iter()
            .filter(|result| result.status == NodeStatus::Cancelled)
            .count();
        let cancellation_terminal = !ordered.is_empty()
            && cancelled_count > 0
            && ordered.iter().all(|result| {
                matches!(result.status, NodeStatus::Cancelled | NodeStatus::Skipped)
            });

        let required_failure = || {
            plan.nodes.iter().any(|node| {
                node.required
                    && node_results
                        .get(&node.node_id)
                        .is_some_and(|result| !result.success)
            })
        };

        let final_status = if cancellation_terminal {
            FinalStatus::Cancelled
        } else {
            match plan.join_policy {
                JoinPolicy::FirstSuccess => {
                    if success_count > 0 {
                        FinalStatus::Completed
                    } else {
                        FinalStatus::Failed
                    }
                }
                JoinPolicy::Quorum => {
                    let quorum = plan.quorum.filter(|q| *q > 0).unwrap_or(1) as usize;
                    if success_count >= quorum {
                        FinalStatus::Completed
                    } else {
                        FinalStatus::Failed
                    }
                }
                JoinPolicy::AllowOptionalFailures => {
                    if required_failure() {
                        FinalStatus::Failed
                    } else if failure_count > 0 {
                        FinalStatus::Degraded
                    } else {
                        FinalStatus::Completed
                    }
                }
                JoinPolicy::AllRequired => {
                    if required_failure() {
                        FinalStatus::Failed
                    } else {
                        FinalStatus::Completed
                    }
                }
            }
        };

        DelegationResult {
            node_results,
            ordered_outputs: ordered,
            final_status,
            success_count,
            failure_count,
        }
    }
}

struct ProtocolNodeExecutor {
    executor: DelegationExecutor,
    protocol: Arc<dyn AgentProtocol>,
    request_factory: Arc<dyn RequestFactory>,
}

#[async_trait]
impl NodeExecutor for ProtocolNodeExecutor {
    async fn execute(&self, node: DelegationNode, payload: Map<String, Value>) -> NodeResult {
        self.executor
            .execute_node(
                &node,
                &payload,
                self.protocol.as_ref(),
                self.request_factory.as_ref(),
            )
            .await
    }
}

/// Full orchestration pipeline:
/// planner → validator → scheduler → executor → aggregator.
pub struct DelegationEngine {
    /// Plan construction stage.
    pub planner: DelegationPlanner,
    /// Graph validation stage.
    pub validator: GraphValidator,
    /// Bounded-parallel scheduling stage.
    pub scheduler: Arc<DelegationScheduler>,
    /// Per-node execution stage.
    pub executor: DelegationExecutor,
    /// Fan-in aggregation stage.
    pub aggregator: DelegationAggregator,
}

impl std::fmt::Debug for DelegationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationEngine")
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl DelegationEngine {
    /// Create an engine with a fresh scheduler using the given limits.
    #[must_use]
    pub fn new(limits: SchedulerLimits) -> Self {
        Self::with_scheduler(Arc::new(DelegationScheduler::new(limits)))
    }

    /// Create an engine over a shared scheduler (shares the global and
    /// per-target semaphores with other engines in the process).
    #[must_use]
    pub fn with_scheduler(scheduler: Arc<DelegationScheduler>) -> Self {
        Self {
            planner: DelegationPlanner,
            validator: GraphValidator,
            scheduler,
            executor: DelegationExecutor,
            aggregator: DelegationAggregator,
        }
    }

    /// Execute a plan and return the aggregated result plus audit rows for
    /// responses observed after cancellation.
    pub async fn execute(
        &self,
        plan: &DelegationPlan,
        available_targets: &HashSet<String>,
        protocol: Arc<dyn AgentProtocol>,
        request_factory: Arc<dyn RequestFactory>,
        cancel_requested: Option<ControlProbe>,
        interrupt_requested: Option<ControlProbe>,
    ) -> Result<(DelegationResult, Vec<Map<String, Value>>)> {
        let topological_order = self.validator.validate(plan, available_targets)?;
        debug!(
            nodes = plan.nodes.len(),
            edges = plan.edges.len(),
            max_parallelism = plan.max_parallelism,
            "Executing delegation plan",
        );

        let node_executor = Arc::new(ProtocolNodeExecutor {
            executor: self.executor,
            protocol,
            request_factory,
        });
        let (node_results, audit_rows) = self
            .scheduler
            .execute(
                plan,
                &topological_order,
                node_executor,
                cancel_requested,
                interrupt_requested,
            )
            .await?;

        let aggregated = self
            .aggregator
            .aggregate(plan, &topological_order, node_results);
        info!(
            final_status = %aggregated.final_status,
            success_count = aggregated.success_count,
            failure_count = aggregated.failure_count,
            "Delegation plan finished",
        );
        Ok((aggregated, audit_rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::a2a::protocol::InternalProtocol;
    use crate::a2a::{InvocationDispatcher, InvocationResponse};
    use crate::delegation::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct KeyedFactory;

    impl RequestFactory for KeyedFactory {
        fn build(
            &self,
            node: &DelegationNode,
            payload: &Map<String, Value>,
            attempt: u32,
        ) -> InvocationRequest {
            let mut metadata = Map::new();
            metadata.insert("attempt".to_owned(), Value::from(attempt));
            InvocationRequest {
                run_id: "r1".to_owned(),
                thread_id: "t1".to_owned(),
                conversation_id: "r1:t1".to_owned(),
                correlation_id: format!("r1:1:{}", node.node_id),
                idempotency_key: format!("r1:1:{}", node.node_id),
                causation_id: Some("r1:1".to_owned()),
                source_agent: "parent".to_owned(),
                target_agent: node.target_agent.clone(),
                payload: payload.clone(),
                metadata,
                timeout_s: node.timeout_s,
            }
        }
    }

    struct AlwaysFails {
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl InvocationDispatcher for AlwaysFails {
        async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(InvocationResponse::failure_for(
                &request,
                request.target_agent.clone(),
                "dispatch failed",
                self.retryable,
            ))
        }
    }

    fn node_with_retries(max_attempts: u32) -> DelegationNode {
        DelegationNode {
            retry_policy: RetryPolicy {
                max_attempts,
                backoff_base_s: 0.0,
                max_backoff_s: 0.0,
                jitter_s: 0.0,
            },
            ..DelegationNode::new("n1", "child")
        }
    }

    #[tokio::test]
    async fn retries_then_dead_letters() {
        let dispatcher = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
            retryable: true,
        });
        let protocol = InternalProtocol::new(dispatcher.clone());
        let node = node_with_retries(2);

        let result = DelegationExecutor
            .execute_node(&node, &Map::new(), &protocol, &KeyedFactory)
            .await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(protocol.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn non_retryable_response_stops_and_skips_dead_letter() {
        let dispatcher = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
            retryable: false,
        });
        let protocol = InternalProtocol::new(dispatcher.clone());
        let node = node_with_retries(5);

        let result = DelegationExecutor
            .execute_node(&node, &Map::new(), &protocol, &KeyedFactory)
            .await;

        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(protocol.dead_letters().await.is_empty());
    }

    struct SlowDispatcher;

    #[async_trait]
    impl InvocationDispatcher for SlowDispatcher {
        async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(InvocationResponse::success_for(
                &request,
                request.target_agent.clone(),
                Value::Null,
                Map::new(),
            ))
        }
    }

    #[tokio::test]
    async fn per_attempt_timeout_produces_timeout_status() {
        let protocol = InternalProtocol::new(Arc::new(SlowDispatcher));
        let node = DelegationNode {
            timeout_s: Some(0.02),
            ..node_with_retries(1)
        };
        let result = DelegationExecutor
            .execute_node(&node, &Map::new(), &protocol, &KeyedFactory)
            .await;
        assert_eq!(result.status, NodeStatus::Timeout);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    fn result_of(node_id: &str, status: NodeStatus, success: bool) -> NodeResult {
        NodeResult {
            node_id: node_id.to_owned(),
            target_agent: node_id.to_owned(),
            status,
            success,
            attempts: 1,
            output: None,
            error: None,
            metadata: Map::new(),
            started_at_ms: 0,
            finished_at_ms: 0,
        }
    }

    fn plan_with(join_policy: JoinPolicy, required: &[bool], quorum: Option<u32>) -> DelegationPlan {
        DelegationPlan {
            nodes: required
                .iter()
                .enumerate()
                .map(|(index, required)| DelegationNode {
                    required: *required,
                    ..DelegationNode::new(format!("n{index}"), format!("n{index}"))
                })
                .collect(),
            edges: Vec::new(),
            join_policy,
            max_parallelism: 1,
            quorum,
        }
    }

    #[test]
    fn join_policies_aggregate_as_specified() {
        let order = vec!["n0".to_owned(), "n1".to_owned()];
        let mixed: HashMap<String, NodeResult> = [
            ("n0".to_owned(), result_of("n0", NodeStatus::Completed, true)),
            ("n1".to_owned(), result_of("n1", NodeStatus::Failed, false)),
        ]
        .into();

        let all_required = DelegationAggregator.aggregate(
            &plan_with(JoinPolicy::AllRequired, &[true, true], None),
            &order,
            mixed.clone(),
        );
        assert_eq!(all_required.final_status, FinalStatus::Failed);

        let optional = DelegationAggregator.aggregate(
            &plan_with(JoinPolicy::AllowOptionalFailures, &[true, false], None),
            &order,
            mixed.clone(),
        );
        assert_eq!(optional.final_status, FinalStatus::Degraded);
        assert_eq!(optional.success_count, 1);
        assert_eq!(optional.failure_count, 1);

        let first_success = DelegationAggregator.aggregate(
            &plan_with(JoinPolicy::FirstSuccess, &[true, true], None),
            &order,
            mixed.clone(),
        );
        assert_eq!(first_success.final_status, FinalStatus::Completed);

        let quorum_two = DelegationAggregator.aggregate(
            &plan_with(JoinPolicy::Quorum, &[true, true], Some(2)),
            &order,
            mixed,
        );
        assert_eq!(quorum_two.final_status, FinalStatus::Failed);
    }

    #[test]
    fn cancellation_overrides_join_policy() {
        let order = vec!["n0".to_owned(), "n1".to_owned()];
        let results: HashMap<String, NodeResult> = [
            (
                "n0".to_owned(),
                result_of("n0", NodeStatus::Cancelled, false),
            ),
            ("n1".to_owned(), result_of("n1", NodeStatus::Skipped, false)),
        ]
        .into();
        let aggregated = DelegationAggregator.aggregate(
            &plan_with(JoinPolicy::FirstSuccess, &[true, true], None),
            &order,
            results,
        );
        assert_eq!(aggregated.final_status, FinalStatus::Cancelled);
    }

    #[test]
    fn empty_plan_completes_with_no_outputs() {
        let aggregated = DelegationAggregator.aggregate(
            &DelegationPlan::default(),
            &[],
            HashMap::new(),
        );
        assert_eq!(aggregated.final_status, FinalStatus::Completed);
        assert!(aggregated.ordered_outputs.is_empty());
    }
}
