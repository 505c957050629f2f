//! Subagent fan-out through the delegation engine and A2A protocol.
//!
//! Router-selected targets become a delegation plan; each node dispatches
//! through an in-process A2A protocol whose dispatcher recursively starts a
//! child run for the target subagent. Node results splice back into the
//! parent transcript as a bridge message.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::a2a::protocol::InternalProtocol;
use crate::a2a::{AgentProtocol, InvocationDispatcher, InvocationRequest, InvocationResponse};
use crate::agent::delegation_plan_from_metadata;
use crate::delegation::engine::{DelegationEngine, RequestFactory};
use crate::delegation::scheduler::ControlProbe;
use crate::delegation::DelegationNode;
use crate::error::{Error, Result};
use crate::event::{RunEventType, RunState};
use crate::policy::{PolicyEvent, PolicyEventType};

use super::executor::RunCtx;
use super::result::SubagentExecutionRecord;
use super::{RunOptions, RunnerCore};

/// Builds node invocation requests keyed by `{run_id}:{step}:{node_id}`.
struct NodeRequestFactory {
    run_id: String,
    thread_id: String,
    step: u64,
    source_agent: String,
    parallel: bool,
}

impl RequestFactory for NodeRequestFactory {
    fn build(
        &self,
        node: &DelegationNode,
        payload: &Map<String, Value>,
        attempt: u32,
    ) -> InvocationRequest {
        let node_key = format!("{}:{}:{}", self.run_id, self.step, node.node_id);
        let mut metadata = Map::new();
        metadata.insert("step".to_owned(), Value::from(self.step));
        metadata.insert("node_id".to_owned(), Value::String(node.node_id.clone()));
        metadata.insert("attempt".to_owned(), Value::from(attempt));
        metadata.insert("parallel".to_owned(), Value::Bool(self.parallel));
        InvocationRequest {
            run_id: self.run_id.clone(),
            thread_id: self.thread_id.clone(),
            conversation_id: format!("{}:{}", self.run_id, self.thread_id),
            correlation_id: node_key.clone(),
            idempotency_key: node_key,
            source_agent: self.source_agent.clone(),
            target_agent: node.target_agent.clone(),
            payload: payload.clone(),
            metadata,
            causation_id: Some(format!("{}:{}", self.run_id, self.step)),
            timeout_s: node.timeout_s,
        }
    }
}

/// Dispatches one node request by recursively running the target subagent.
struct SubagentDispatcher {
    core: Arc<RunnerCore>,
    ctx_run_id: String,
    ctx_thread_id: String,
    agent: Arc<crate::agent::Agent>,
    context: Map<String, Value>,
    depth: u32,
    lineage: Vec<u64>,
    step: u64,
    sink: crate::event::EventSink,
}

impl SubagentDispatcher {
    async fn emit_subagent_event(
        &self,
        event_type: RunEventType,
        name: &str,
        data: Map<String, Value>,
    ) {
        let mut payload = data;
        payload.insert("subagent_name".to_owned(), Value::String(name.to_owned()));
        self.sink
            .emit(
                crate::event::RunEvent::new(
                    event_type,
                    self.ctx_run_id.clone(),
                    self.ctx_thread_id.clone(),
                    RunState::Running,
                )
                .with_step(self.step)
                .with_data(payload),
            )
            .await;
    }
}

#[async_trait]
impl InvocationDispatcher for SubagentDispatcher {
    async fn dispatch(&self, request: InvocationRequest) -> Result<InvocationResponse> {
        let Some(sub) = self.agent.subagent(&request.target_agent) else {
            return Ok(InvocationResponse::failure_for(
                &request,
                request.target_agent.clone(),
                format!("Unknown subagent target '{}'", request.target_agent),
                false,
            ));
        };
        let sub = Arc::clone(sub);
        let started = Instant::now();

        let mut start_data = Map::new();
        start_data.insert(
            "correlation_id".to_owned(),
            Value::String(request.correlation_id.clone()),
        );
        self.emit_subagent_event(RunEventType::SubagentStarted, sub.name(), start_data)
            .await;

        // Policy gate before the child run starts.
        let engine = self
            .agent
            .policy_engine()
            .or(self.core.policy_engine.as_ref());
        let decision = crate::policy::evaluate_chain(
            engine.map(|engine| engine.as_ref()),
            self.agent.policy_roles(),
            &PolicyEvent {
                event_type: PolicyEventType::SubagentBeforeExecute,
                run_id: self.ctx_run_id.clone(),
                thread_id: self.ctx_thread_id.clone(),
                step: self.step,
                context: self.context.clone(),
                tool_name: None,
                tool_args: None,
                subagent_name: Some(sub.name().to_owned()),
                metadata: request.metadata.clone(),
            },
        )
        .await;
        if !decision.is_allow() {
            let reason = decision
                .reason
                .unwrap_or_else(|| format!("Subagent '{}' denied by policy", sub.name()));
            let mut data = Map::new();
            data.insert("success".to_owned(), Value::Bool(false));
            data.insert("error".to_owned(), Value::String(reason.clone()));
            self.emit_subagent_event(RunEventType::SubagentCompleted, sub.name(), data)
                .await;
            return Ok(InvocationResponse::failure_for(
                &request,
                sub.name().to_owned(),
                reason,
                false,
            ));
        }

        // Inherit only the declared parent-context keys, then overlay the
        // node payload.
        let mut inherited = Map::new();
        for key in sub.inherit_context_keys() {
            if let Some(value) = self.context.get(key) {
                inherited.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &request.payload {
            inherited.insert(key.clone(), value.clone());
        }

        let mut lineage = self.lineage.clone();
        lineage.push(self.step);
        let spawn = self.core.spawn_run(
            Arc::clone(&sub),
            RunOptions {
                user_message: None,
                context: inherited,
                thread_id: Some(self.ctx_thread_id.clone()),
                depth: self.depth + 1,
                lineage,
                resume_run_id: None,
                resume_snapshot: None,
            },
        );
        let outcome = match spawn {
            Ok(handle) => handle.await_result().await,
            Err(err) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                let error_text = err.to_string();
                let mut data = Map::new();
                data.insert("success".to_owned(), Value::Bool(false));
                data.insert("error".to_owned(), Value::String(error_text.clone()));
                data.insert("latency_ms".to_owned(), Value::from(latency_ms));
                self.emit_subagent_event(RunEventType::SubagentCompleted, sub.name(), data)
                    .await;
                return Ok(InvocationResponse::failure_for(
                    &request,
                    sub.name().to_owned(),
                    error_text,
                    true,
                ));
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Some(result) => {
                let mut data = Map::new();
                data.insert("success".to_owned(), Value::Bool(true));
                data.insert("latency_ms".to_owned(), Value::from(latency_ms));
                self.emit_subagent_event(RunEventType::SubagentCompleted, sub.name(), data)
                    .await;

                let mut output = Map::new();
                output.insert(
                    "final_text".to_owned(),
                    Value::String(result.final_text.clone()),
                );
                output.insert(
                    "state".to_owned(),
                    Value::String(result.state.to_string()),
                );
                output.insert("run_id".to_owned(), Value::String(result.run_id.clone()));
                let mut metadata = Map::new();
                metadata.insert("latency_ms".to_owned(), Value::from(latency_ms));
                Ok(InvocationResponse::success_for(
                    &request,
                    sub.name().to_owned(),
                    Value::Object(output),
                    metadata,
                ))
            }
            None => {
                let error_text = format!("Subagent '{}' cancelled", sub.name());
                let mut data = Map::new();
                data.insert("success".to_owned(), Value::Bool(false));
                data.insert("error".to_owned(), Value::String(error_text.clone()));
                data.insert("latency_ms".to_owned(), Value::from(latency_ms));
                self.emit_subagent_event(RunEventType::SubagentCompleted, sub.name(), data)
                    .await;
                Ok(InvocationResponse::failure_for(
                    &request,
                    sub.name().to_owned(),
                    error_text,
                    true,
                ))
            }
        }
    }
}

/// Execute selected subagents through DAG orchestration and the A2A
/// protocol, returning execution records plus the bridge text inserted back
/// into the parent transcript.
pub(super) async fn run_subagents(
    ctx: &RunCtx,
    options: &RunOptions,
    step: u64,
    targets: Vec<String>,
    parallel: bool,
    router_metadata: &Map<String, Value>,
) -> Result<(Vec<SubagentExecutionRecord>, String)> {
    let index: HashSet<String> = ctx
        .agent
        .subagents()
        .iter()
        .map(|sub| sub.name().to_owned())
        .collect();

    let mut selected: Vec<String> = Vec::new();
    for name in &targets {
        let normalized = name.trim();
        if normalized.is_empty() {
            continue;
        }
        if !index.contains(normalized) {
            return Err(Error::invalid_arguments(format!(
                "Unknown subagent target '{name}'"
            )));
        }
        selected.push(normalized.to_owned());
    }
    if !parallel {
        selected.truncate(1);
    }
    if selected.is_empty() {
        return Ok((Vec::new(), String::new()));
    }

    let engine = DelegationEngine::with_scheduler(Arc::clone(&ctx.core.scheduler));
    let plan = delegation_plan_from_metadata(router_metadata).unwrap_or_else(|| {
        engine.planner.create_plan(
            &selected,
            parallel,
            Some(120.0),
            None,
            Some(if parallel {
                ctx.core.config.max_parallel_subagents_per_parent
            } else {
                1
            }),
        )
    });

    let dispatcher = Arc::new(SubagentDispatcher {
        core: Arc::clone(&ctx.core),
        ctx_run_id: ctx.run_id.clone(),
        ctx_thread_id: ctx.thread_id.clone(),
        agent: Arc::clone(&ctx.agent),
        context: options.context.clone(),
        depth: options.depth,
        lineage: options.lineage.clone(),
        step,
        sink: ctx.sink.clone(),
    });
    let protocol = Arc::new(InternalProtocol::new(dispatcher));
    let factory = Arc::new(NodeRequestFactory {
        run_id: ctx.run_id.clone(),
        thread_id: ctx.thread_id.clone(),
        step,
        source_agent: ctx.agent.name().to_owned(),
        parallel,
    });

    let cancel_control = Arc::clone(&ctx.control);
    let cancel: ControlProbe = Arc::new(move || cancel_control.is_cancel_requested());
    let interrupt_control = Arc::clone(&ctx.control);
    let interrupt: ControlProbe = Arc::new(move || interrupt_control.is_interrupt_requested());

    let (result, audit_rows) = engine
        .execute(
            &plan,
            &index,
            Arc::clone(&protocol) as Arc<dyn AgentProtocol>,
            factory,
            Some(cancel),
            Some(interrupt),
        )
        .await?;

    for row in audit_rows {
        ctx.sink
            .emit(
                ctx.event(RunEventType::Warning, RunState::Running)
                    .with_step(step)
                    .with_message("Ignored late subagent response after cancellation")
                    .with_data(row),
            )
            .await;
    }

    for dead_letter in protocol.dead_letters().await {
        let mut data = Map::new();
        data.insert(
            "node_correlation_id".to_owned(),
            Value::String(dead_letter.request.correlation_id.clone()),
        );
        data.insert(
            "target_agent".to_owned(),
            Value::String(dead_letter.request.target_agent.clone()),
        );
        data.insert("attempts".to_owned(), Value::from(dead_letter.attempts));
        data.insert("error".to_owned(), Value::String(dead_letter.error.clone()));
        warn!(
            run_id = %ctx.run_id,
            target = %dead_letter.request.target_agent,
            attempts = dead_letter.attempts,
            "Subagent delivery exhausted retry budget",
        );
        ctx.sink
            .emit(
                ctx.event(RunEventType::Warning, RunState::Running)
                    .with_step(step)
                    .with_message("Subagent delivery exhausted retry budget")
                    .with_data(data),
            )
            .await;
    }

    let mut records: Vec<SubagentExecutionRecord> = Vec::new();
    let mut bridge_parts: Vec<String> = Vec::new();
    for node_output in &result.ordered_outputs {
        let latency_ms = (node_output.finished_at_ms - node_output.started_at_ms) as f64;
        let text_output: Option<String> = match &node_output.output {
            Some(Value::Object(output)) => output
                .get("final_text")
                .and_then(Value::as_str)
                .map(str::to_owned),
            Some(Value::String(text)) => Some(text.clone()),
            _ => None,
        };

        records.push(SubagentExecutionRecord {
            subagent_name: node_output.target_agent.clone(),
            success: node_output.success,
            output_text: text_output.clone(),
            error: node_output.error.clone(),
            latency_ms: Some(latency_ms),
        });

        if node_output.success
            && let Some(text) = text_output.filter(|text| !text.is_empty())
        {
            bridge_parts.push(format!(
                "Subagent '{}' result:\n{text}",
                node_output.target_agent
            ));
        } else if let Some(error) = &node_output.error {
            bridge_parts.push(format!(
                "Subagent '{}' failed: {error}",
                node_output.target_agent
            ));
        }
    }

    info!(
        run_id = %ctx.run_id,
        step,
        final_status = %result.final_status,
        nodes = result.ordered_outputs.len(),
        "Subagent delegation finished",
    );
    Ok((records, bridge_parts.join("\n\n")))
}
