//! Integration tests for the afk runtime.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use afk::delegation::engine::{DelegationEngine, RequestFactory};
use afk::delegation::scheduler::{ControlProbe, SchedulerLimits};
use afk::prelude::*;
use afk::queue::{REASON_NON_RETRYABLE, REASON_RETRY_BUDGET_EXHAUSTED};

// ---------------------------------------------------------------------------
// Shared fixtures
// ---------------------------------------------------------------------------

/// A dispatcher scripted per target agent.
struct ScriptedDispatcher {
    calls: AtomicU32,
    outputs: BTreeMap<String, Value>,
    fail_targets: HashSet<String>,
    retryable: bool,
    delay: Option<Duration>,
}

impl ScriptedDispatcher {
    fn succeeding(outputs: BTreeMap<String, Value>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            outputs,
            fail_targets: HashSet::new(),
            retryable: true,
            delay: None,
        }
    }
}

#[async_trait]
impl InvocationDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_targets.contains(&request.target_agent) {
            return Ok(InvocationResponse::failure_for(
                &request,
                request.target_agent.clone(),
                format!("target '{}' always fails", request.target_agent),
                self.retryable,
            ));
        }
        let output = self
            .outputs
            .get(&request.target_agent)
            .cloned()
            .unwrap_or_else(|| Value::Object(request.payload.clone()));
        Ok(InvocationResponse::success_for(
            &request,
            request.target_agent.clone(),
            output,
            Map::new(),
        ))
    }
}

struct TestFactory;

impl RequestFactory for TestFactory {
    fn build(
        &self,
        node: &DelegationNode,
        payload: &Map<String, Value>,
        attempt: u32,
    ) -> InvocationRequest {
        let mut metadata = Map::new();
        metadata.insert("attempt".to_owned(), Value::from(attempt));
        InvocationRequest {
            run_id: "run-1".to_owned(),
            thread_id: "thread-1".to_owned(),
            conversation_id: "run-1:thread-1".to_owned(),
            correlation_id: format!("run-1:1:{}", node.node_id),
            idempotency_key: format!("run-1:1:{}", node.node_id),
            causation_id: Some("run-1:1".to_owned()),
            source_agent: "parent".to_owned(),
            target_agent: node.target_agent.clone(),
            payload: payload.clone(),
            metadata,
            timeout_s: node.timeout_s,
        }
    }
}

fn zero_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base_s: 0.0,
        max_backoff_s: 0.0,
        jitter_s: 0.0,
    }
}

fn available(names: &[&str]) -> HashSet<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

async fn wait_terminal(queue: &dyn TaskQueue, task_id: &str) -> TaskItem {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(task) = queue.get(task_id).await.unwrap()
            && task.is_terminal()
        {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task '{task_id}' did not reach a terminal state in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// A2A dedupe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a2a_dedupe_replays_identical_response() {
    let mut outputs = BTreeMap::new();
    outputs.insert("child".to_owned(), json!({"echo": {"x": 1}}));
    let dispatcher = Arc::new(ScriptedDispatcher::succeeding(outputs));
    let protocol = InternalProtocol::new(dispatcher.clone());

    let mut payload = Map::new();
    payload.insert("x".to_owned(), Value::from(1));
    let request = InvocationRequest {
        run_id: "r".to_owned(),
        thread_id: "t".to_owned(),
        conversation_id: "r:t".to_owned(),
        correlation_id: "c1".to_owned(),
        idempotency_key: "K1".to_owned(),
        causation_id: None,
        source_agent: "parent".to_owned(),
        target_agent: "child".to_owned(),
        payload,
        metadata: Map::new(),
        timeout_s: None,
    };

    let first = protocol.invoke(request.clone()).await.unwrap();
    assert!(first.success);
    let second = protocol
        .invoke(InvocationRequest {
            correlation_id: "c2".to_owned(),
            ..request
        })
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

    let replays = protocol
        .events()
        .await
        .iter()
        .filter(|event| event.event_type == ProtocolEventType::IgnoredLateResponse)
        .count();
    assert_eq!(replays, 1);
}

// ---------------------------------------------------------------------------
// Delegation scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dag_fanout_binds_outputs_in_topo_order() {
    let mut outputs = BTreeMap::new();
    outputs.insert("agent-a".to_owned(), json!({"value": "A-OK"}));
    let dispatcher = Arc::new(ScriptedDispatcher::succeeding(outputs));
    let protocol: Arc<dyn AgentProtocol> = Arc::new(InternalProtocol::new(dispatcher));

    let mut key_map = BTreeMap::new();
    key_map.insert("value".to_owned(), "from_a".to_owned());
    let plan = DelegationPlan {
        nodes: vec![
            DelegationNode::new("a", "agent-a"),
            DelegationNode::new("b", "agent-b"),
            DelegationNode::new("c", "agent-c"),
        ],
        edges: vec![
            DelegationEdge::new("a", "b").with_key_map(key_map.clone()),
            DelegationEdge::new("a", "c").with_key_map(key_map),
        ],
        join_policy: JoinPolicy::AllRequired,
        max_parallelism: 2,
        quorum: None,
    };

    let engine = DelegationEngine::new(SchedulerLimits::default());
    let (result, audit) = engine
        .execute(
            &plan,
            &available(&["agent-a", "agent-b", "agent-c"]),
            protocol,
            Arc::new(TestFactory),
            None,
            None,
        )
        .await
        .unwrap();

    assert!(audit.is_empty());
    assert_eq!(result.final_status, FinalStatus::Completed);
    let order: Vec<&str> = result
        .ordered_outputs
        .iter()
        .map(|node| node.node_id.as_str())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    for downstream in ["b", "c"] {
        let output = result.node_results[downstream].output.as_ref().unwrap();
        assert_eq!(
            output.get("from_a"),
            Some(&Value::String("A-OK".to_owned())),
            "node '{downstream}' did not receive the mapped payload"
        );
    }
}

#[tokio::test]
async fn retry_exhaustion_dead_letters_once() {
    let dispatcher = Arc::new(ScriptedDispatcher {
        calls: AtomicU32::new(0),
        outputs: BTreeMap::new(),
        fail_targets: available(&["flaky"]),
        retryable: true,
        delay: None,
    });
    let internal = Arc::new(InternalProtocol::new(dispatcher.clone()));
    let protocol: Arc<dyn AgentProtocol> = internal.clone();

    let plan = DelegationPlan {
        nodes: vec![DelegationNode {
            retry_policy: zero_backoff(2),
            ..DelegationNode::new("n1", "flaky")
        }],
        edges: Vec::new(),
        join_policy: JoinPolicy::AllRequired,
        max_parallelism: 1,
        quorum: None,
    };

    let engine = DelegationEngine::new(SchedulerLimits::default());
    let (result, _) = engine
        .execute(
            &plan,
            &available(&["flaky"]),
            protocol,
            Arc::new(TestFactory),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    let node = &result.node_results["n1"];
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.attempts, 2);
    assert_eq!(result.final_status, FinalStatus::Failed);
    assert_eq!(internal.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn optional_failure_degrades_the_plan() {
    let dispatcher = Arc::new(ScriptedDispatcher {
        calls: AtomicU32::new(0),
        outputs: BTreeMap::new(),
        fail_targets: available(&["optional-agent"]),
        retryable: false,
        delay: None,
    });
    let protocol: Arc<dyn AgentProtocol> = Arc::new(InternalProtocol::new(dispatcher));

    let plan = DelegationPlan {
        nodes: vec![
            DelegationNode::new("required", "required-agent"),
            DelegationNode {
                required: false,
                retry_policy: zero_backoff(1),
                ..DelegationNode::new("optional", "optional-agent")
            },
        ],
        edges: Vec::new(),
        join_policy: JoinPolicy::AllowOptionalFailures,
        max_parallelism: 2,
        quorum: None,
    };

    let engine = DelegationEngine::new(SchedulerLimits::default());
    let (result, _) = engine
        .execute(
            &plan,
            &available(&["required-agent", "optional-agent"]),
            protocol,
            Arc::new(TestFactory),
            None,
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.final_status, FinalStatus::Degraded);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 1);
}

#[tokio::test]
async fn cancel_propagates_down_a_sequential_plan() {
    let dispatcher = Arc::new(ScriptedDispatcher {
        calls: AtomicU32::new(0),
        outputs: BTreeMap::new(),
        fail_targets: HashSet::new(),
        retryable: true,
        delay: Some(Duration::from_millis(200)),
    });
    let protocol: Arc<dyn AgentProtocol> = Arc::new(InternalProtocol::new(dispatcher));

    let plan = DelegationPlan {
        nodes: vec![
            DelegationNode::new("a", "slow-agent"),
            DelegationNode::new("b", "slow-agent"),
        ],
        edges: vec![DelegationEdge::new("a", "b")],
        join_policy: JoinPolicy::AllRequired,
        max_parallelism: 1,
        quorum: None,
    };

    let cancel_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let probe_flag = Arc::clone(&cancel_flag);
    let cancel: ControlProbe = Arc::new(move || probe_flag.load(Ordering::SeqCst));
    tokio::spawn({
        let cancel_flag = Arc::clone(&cancel_flag);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_flag.store(true, Ordering::SeqCst);
        }
    });

    let engine = DelegationEngine::new(SchedulerLimits::default());
    let (result, _) = engine
        .execute(
            &plan,
            &available(&["slow-agent"]),
            protocol,
            Arc::new(TestFactory),
            Some(cancel),
            None,
        )
        .await
        .unwrap();

    assert_eq!(result.final_status, FinalStatus::Cancelled);
    assert_eq!(result.node_results["a"].status, NodeStatus::Cancelled);
    assert_eq!(result.node_results["b"].status, NodeStatus::Cancelled);
    assert!(
        result.node_results["b"]
            .error
            .as_deref()
            .unwrap()
            .to_lowercase()
            .contains("cancelled by parent control flow")
    );
}

// ---------------------------------------------------------------------------
// Run executor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct EchoTool;

#[async_trait]
impl DynTool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> String {
        "Echoes back the input message.".to_owned()
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            self.description(),
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
        )
    }

    async fn call_json(&self, args: Value) -> Result<Value> {
        args.get("message")
            .cloned()
            .ok_or_else(|| Error::invalid_arguments("missing required field 'message'"))
    }
}

#[tokio::test]
async fn run_completes_with_final_text() {
    let transport = Arc::new(MockTransport::text("All done."));
    let agent = Agent::builder("assistant")
        .transport(transport)
        .instructions("You are terse.")
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let result = runner
        .run(agent, Some("Do the thing.".into()), None, None)
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.final_text, "All done.");
    assert_eq!(result.provider_adapter.as_deref(), Some("mock"));
    assert!(result.usage_aggregate.total_tokens > 0);
}

#[tokio::test]
async fn run_executes_tool_batch_then_completes() {
    let transport = Arc::new(MockTransport::new(vec![
        MockReply::ToolCalls(vec![ToolCallRequest::new(
            "call-1",
            "echo",
            json!({"message": "ping"}),
        )]),
        MockReply::Text("Echo said ping.".into()),
    ]));
    let agent = Agent::builder("assistant")
        .transport(transport.clone())
        .tool(Arc::new(EchoTool))
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let result = runner
        .run(agent, Some("Use echo.".into()), None, None)
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.final_text, "Echo said ping.");
    assert_eq!(result.tool_executions.len(), 1);
    let record = &result.tool_executions[0];
    assert!(record.success);
    assert_eq!(record.tool_name, "echo");
    assert_eq!(record.output, Some(Value::String("ping".into())));
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn events_arrive_in_lifecycle_order() {
    let transport = Arc::new(MockTransport::text("ok"));
    let agent = Agent::builder("assistant")
        .transport(transport)
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let handle = runner
        .run_handle(agent, Some("hi".into()), None, None)
        .unwrap();
    let result = handle.await_result().await.unwrap();
    assert_eq!(result.state, RunState::Completed);

    let mut kinds: Vec<RunEventType> = Vec::new();
    while let Some(event) = handle.next_event().await {
        kinds.push(event.event_type);
        if event.event_type == RunEventType::RunCompleted {
            break;
        }
    }
    let started = kinds.iter().position(|k| *k == RunEventType::RunStarted);
    let step = kinds.iter().position(|k| *k == RunEventType::StepStarted);
    let llm = kinds.iter().position(|k| *k == RunEventType::LlmCompleted);
    let done = kinds.iter().position(|k| *k == RunEventType::RunCompleted);
    assert!(started < step && step < llm && llm < done, "order: {kinds:?}");
}

#[tokio::test]
async fn policy_denied_tool_is_skipped_and_run_continues() {
    let transport = Arc::new(MockTransport::new(vec![
        MockReply::ToolCalls(vec![ToolCallRequest::new(
            "call-1",
            "echo",
            json!({"message": "nope"}),
        )]),
        MockReply::Text("Done without the tool.".into()),
    ]));
    let engine = Arc::new(PolicyEngine::new(vec![
        PolicyRule::new("deny-echo", PolicyAction::Deny)
            .on_subjects(vec!["echo".into()])
            .with_reason("echo is forbidden here"),
    ]));
    let agent = Agent::builder("assistant")
        .transport(transport)
        .tool(Arc::new(EchoTool))
        .policy_engine(engine)
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let result = runner.run(agent, Some("try".into()), None, None).await.unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.tool_executions.len(), 1);
    assert!(!result.tool_executions[0].success);
    assert!(
        result.tool_executions[0]
            .error
            .as_deref()
            .unwrap()
            .contains("forbidden")
    );
}

#[tokio::test]
async fn cost_ceiling_terminates_the_run() {
    // Each call costs $0.05; the ceiling allows one full step but not two.
    let transport = Arc::new(
        MockTransport::new(vec![
            MockReply::ToolCalls(vec![ToolCallRequest::new(
                "call-1",
                "echo",
                json!({"message": "a"}),
            )]),
            MockReply::ToolCalls(vec![ToolCallRequest::new(
                "call-2",
                "echo",
                json!({"message": "b"}),
            )]),
            MockReply::Text("never reached".into()),
        ])
        .with_cost_per_call(0.05),
    );
    let agent = Agent::builder("assistant")
        .transport(transport.clone())
        .tool(Arc::new(EchoTool))
        .failsafe(FailSafeConfig {
            max_total_cost_usd: Some(0.08),
            ..FailSafeConfig::default()
        })
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let result = runner
        .run(agent, Some("keep using echo".into()), None, None)
        .await
        .unwrap();
    // Two tool-call steps spent $0.10; the third step is refused before any
    // model call. No text was produced, so the run fails rather than
    // degrades.
    assert_eq!(result.state, RunState::Failed);
    assert!(result.error.as_deref().unwrap().contains("cost"));
    assert!((result.total_cost_usd.unwrap() - 0.10).abs() < 1e-9);
    assert_eq!(transport.call_count(), 2);
}

/// Transport that never completes within a test's patience.
#[derive(Debug)]
struct StallingTransport;

#[async_trait]
impl ModelTransport for StallingTransport {
    fn id(&self) -> &str {
        "stalling"
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }

    async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ChatResponse::from_text("too late"))
    }
}

#[tokio::test]
async fn cancel_stops_the_run_without_result() {
    let agent = Agent::builder("assistant")
        .transport(Arc::new(StallingTransport))
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let handle = runner
        .run_handle(agent, Some("hi".into()), None, None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.await_result())
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn subagent_fanout_splices_bridge_message() {
    struct AlwaysDelegate;

    #[async_trait]
    impl SubagentRouter for AlwaysDelegate {
        async fn route(&self, input: RouterInput) -> Result<RouterDecision> {
            // Delegate exactly once, on the first step.
            if input.step > 1 {
                return Ok(RouterDecision::default());
            }
            Ok(RouterDecision {
                targets: vec!["summarizer".into()],
                parallel: true,
                metadata: Map::new(),
            })
        }
    }

    let child_transport = Arc::new(MockTransport::text("summary: all good"));
    let child = Agent::builder("summarizer")
        .transport(child_transport)
        .build()
        .unwrap();
    let parent_transport = Arc::new(MockTransport::new(vec![
        MockReply::Text("thinking".into()),
        MockReply::Text("final answer".into()),
    ]));
    let parent = Agent::builder("orchestrator")
        .transport(parent_transport.clone())
        .subagent(child)
        .router(Arc::new(AlwaysDelegate))
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let result = runner
        .run(parent, Some("summarize".into()), None, None)
        .await
        .unwrap();
    assert_eq!(result.state, RunState::Completed);
    assert_eq!(result.subagent_executions.len(), 1);
    let record = &result.subagent_executions[0];
    assert!(record.success);
    assert_eq!(record.subagent_name, "summarizer");
    assert_eq!(record.output_text.as_deref(), Some("summary: all good"));

    // The bridge message reached the parent transcript on the second call.
    let second_request = &parent_transport.requests()[1];
    let bridged = second_request.messages.iter().any(|message| {
        message
            .text()
            .is_some_and(|text| text.contains("Subagent 'summarizer' result"))
    });
    assert!(bridged, "bridge message missing from parent transcript");
}

#[tokio::test]
async fn resume_serves_terminal_result_from_checkpoint() {
    let transport = Arc::new(MockTransport::text("first run output"));
    let agent = Agent::builder("assistant")
        .transport(transport.clone())
        .build()
        .unwrap();
    let runner = Runner::new().unwrap();

    let handle = runner
        .run_handle(
            agent.clone(),
            Some("go".into()),
            None,
            Some("thread-keep".into()),
        )
        .unwrap();
    let first = handle.await_result().await.unwrap();
    assert_eq!(first.state, RunState::Completed);
    let calls_after_first = transport.call_count();

    let resumed = runner
        .resume(agent, &first.run_id, "thread-keep", None)
        .await
        .unwrap();
    assert_eq!(resumed.final_text, first.final_text);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(transport.call_count(), calls_after_first);
}

// ---------------------------------------------------------------------------
// Queue + worker
// ---------------------------------------------------------------------------

struct FailingHandler;

#[async_trait]
impl JobHandler for FailingHandler {
    async fn run(&self, _arguments: Map<String, Value>, _task: &TaskItem) -> Result<Value> {
        Err(Error::internal("handler always raises"))
    }
}

struct SumHandler;

#[async_trait]
impl JobHandler for SumHandler {
    async fn run(&self, arguments: Map<String, Value>, _task: &TaskItem) -> Result<Value> {
        let a = arguments.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = arguments.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(Value::from(a + b))
    }
}

fn fast_worker_config() -> TaskWorkerConfig {
    TaskWorkerConfig {
        poll_interval_s: 0.05,
        max_concurrent_tasks: 2,
        shutdown_timeout_s: 2.0,
        ..TaskWorkerConfig::default()
    }
}

#[tokio::test]
async fn job_dispatch_completes_with_result_envelope() {
    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(Arc::clone(&queue))
        .job_handler("sum", Arc::new(SumHandler))
        .config(fast_worker_config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let task = queue
        .enqueue_contract(
            JOB_DISPATCH_CONTRACT,
            json!({"job_type": "sum", "arguments": {"a": 1, "b": 2}})
                .as_object()
                .cloned()
                .unwrap(),
            None,
            3,
            None,
            None,
        )
        .await
        .unwrap();

    let finished = wait_terminal(queue.as_ref(), &task.id).await;
    worker.shutdown().await;

    assert_eq!(finished.status, TaskStatus::Completed);
    let result = finished.result.unwrap();
    assert_eq!(
        result.get("contract").and_then(Value::as_str),
        Some(JOB_DISPATCH_CONTRACT)
    );
    assert_eq!(result.get("output"), Some(&Value::from(3)));
}

#[tokio::test]
async fn retry_budget_exhaustion_dead_letters_the_task() {
    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(Arc::clone(&queue))
        .job_handler("sum", Arc::new(FailingHandler))
        .config(fast_worker_config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let task = queue
        .enqueue_contract(
            JOB_DISPATCH_CONTRACT,
            json!({"job_type": "sum", "arguments": {"a": 1, "b": 2}})
                .as_object()
                .cloned()
                .unwrap(),
            None,
            2,
            None,
            Some(TaskRetryPolicy {
                backoff_base_s: 0.0,
                backoff_max_s: 0.0,
                backoff_jitter_s: 0.0,
            }),
        )
        .await
        .unwrap();

    let finished = wait_terminal(queue.as_ref(), &task.id).await;
    worker.shutdown().await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 3);
    assert_eq!(
        finished.dead_letter_reason(),
        Some(REASON_RETRY_BUDGET_EXHAUSTED)
    );
}

#[tokio::test]
async fn unknown_contract_fails_without_consuming_retries() {
    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(Arc::clone(&queue))
        .config(fast_worker_config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let task = queue
        .enqueue_contract("ghost.contract.v9", Map::new(), None, 5, None, None)
        .await
        .unwrap();

    let finished = wait_terminal(queue.as_ref(), &task.id).await;
    worker.shutdown().await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 1);
    assert_eq!(finished.dead_letter_reason(), Some(REASON_NON_RETRYABLE));
    assert!(
        finished
            .error
            .as_deref()
            .unwrap()
            .contains("Unknown execution contract")
    );
}

#[tokio::test]
async fn runner_chat_contract_runs_the_agent() {
    let transport = Arc::new(MockTransport::text("queued agent says hi"));
    let agent = Agent::builder("queued-agent")
        .transport(transport)
        .build()
        .unwrap();

    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(Arc::clone(&queue))
        .agent(agent)
        .config(fast_worker_config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let task = queue
        .enqueue_contract(
            RUNNER_CHAT_CONTRACT,
            json!({"user_message": "hello"}).as_object().cloned().unwrap(),
            Some("queued-agent".into()),
            1,
            None,
            None,
        )
        .await
        .unwrap();

    let finished = wait_terminal(queue.as_ref(), &task.id).await;
    worker.shutdown().await;

    assert_eq!(finished.status, TaskStatus::Completed);
    let result = finished.result.unwrap();
    let output = result.get("output").unwrap();
    assert_eq!(
        output.get("final_text").and_then(Value::as_str),
        Some("queued agent says hi")
    );
    assert_eq!(
        output.get("state").and_then(Value::as_str),
        Some("completed")
    );
}

#[tokio::test]
async fn missing_agent_name_is_terminal() {
    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(Arc::clone(&queue))
        .config(fast_worker_config())
        .build()
        .unwrap();
    worker.start().await.unwrap();

    let task = queue
        .enqueue_contract(RUNNER_CHAT_CONTRACT, Map::new(), None, 5, None, None)
        .await
        .unwrap();
    let finished = wait_terminal(queue.as_ref(), &task.id).await;
    worker.shutdown().await;

    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.retry_count, 1);
    assert_eq!(finished.dead_letter_reason(), Some(REASON_NON_RETRYABLE));
}

#[tokio::test]
async fn presence_refresh_must_beat_ttl() {
    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let worker = TaskWorker::builder(queue)
        .config(TaskWorkerConfig {
            worker_presence_ttl_s: 10.0,
            worker_presence_refresh_s: 10.0,
            ..fast_worker_config()
        })
        .build()
        .unwrap();
    let err = worker.start().await.unwrap_err();
    assert!(err.to_string().contains("worker_presence_refresh_s"));
    assert!(!worker.is_running());
}

#[tokio::test]
async fn contract_id_mismatch_is_rejected_at_build() {
    struct MislabeledContract;

    #[async_trait]
    impl ExecutionContract for MislabeledContract {
        fn contract_id(&self) -> &str {
            "actual.id.v1"
        }

        fn requires_agent(&self) -> bool {
            false
        }

        async fn execute(
            &self,
            _task: &TaskItem,
            _agent: Option<Arc<Agent>>,
            _context: &ContractContext,
        ) -> std::result::Result<Value, ContractError> {
            Ok(Value::Null)
        }
    }

    let queue: Arc<dyn TaskQueue> = Arc::new(in_memory_task_queue());
    let result = TaskWorker::builder(queue)
        .contract("registered.id.v1", Arc::new(MislabeledContract))
        .build();
    assert!(result.is_err());
}
