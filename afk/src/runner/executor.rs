//! Per-run execution loop.
//!
//! One `execute` task owns all mutable run state. Control flags are
//! consulted at every suspension-point boundary; phase checkpoints are
//! written after each sub-phase so the run can resume from its latest
//! frame.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, RouterInput};
use crate::checkpoint::{CheckpointJournal, CheckpointPhase};
use crate::error::Error;
use crate::event::{EventSink, RunEvent, RunEventType, RunState};
use crate::failsafe::FailurePolicy;
use crate::instructions::{InstructionSource, render_template};
use crate::interaction::{ApprovalRequest, InteractionReply, UserInputRequest};
use crate::message::Message;
use crate::policy::{
    PolicyAction, PolicyDecision, PolicyEvent, PolicyEventType, evaluate_chain,
};
use crate::tool::ToolExecutionRecord;
use crate::transport::{ChatRequest, ChatResponse, ToolCallRequest};

use super::handle::{ResultSlot, RunControl};
use super::result::{AgentResult, SubagentExecutionRecord, UsageAggregate};
use super::{RunOptions, RunnerCore, RuntimeSnapshot};

/// Mutable state accumulated over one run.
struct LoopState {
    transcript: Vec<Message>,
    usage: UsageAggregate,
    llm_calls: u32,
    tool_calls_made: u32,
    tool_executions: Vec<ToolExecutionRecord>,
    subagent_executions: Vec<SubagentExecutionRecord>,
    total_cost_usd: f64,
    last_text: Option<String>,
    normalized_model: Option<String>,
    breaker_failures: u32,
    breaker_open_until: Option<Instant>,
    step: u64,
}

impl LoopState {
    fn from_options(options: &RunOptions) -> Self {
        match &options.resume_snapshot {
            Some(snapshot) => Self {
                transcript: snapshot.transcript.clone(),
                usage: snapshot.usage,
                llm_calls: snapshot.llm_calls,
                tool_calls_made: snapshot.tool_calls_made,
                tool_executions: snapshot.tool_executions.clone(),
                subagent_executions: snapshot.subagent_executions.clone(),
                total_cost_usd: snapshot.total_cost_usd,
                last_text: None,
                normalized_model: None,
                breaker_failures: 0,
                breaker_open_until: None,
                step: snapshot.step,
            },
            None => Self {
                transcript: Vec::new(),
                usage: UsageAggregate::default(),
                llm_calls: 0,
                tool_calls_made: 0,
                tool_executions: Vec::new(),
                subagent_executions: Vec::new(),
                total_cost_usd: 0.0,
                last_text: None,
                normalized_model: None,
                breaker_failures: 0,
                breaker_open_until: None,
                step: 0,
            },
        }
    }

    fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            step: self.step,
            transcript: self.transcript.clone(),
            usage: self.usage,
            llm_calls: self.llm_calls,
            tool_calls_made: self.tool_calls_made,
            total_cost_usd: self.total_cost_usd,
            tool_executions: self.tool_executions.clone(),
            subagent_executions: self.subagent_executions.clone(),
        }
    }
}

/// How the model call phase ended when it did not return a response.
enum CallFailure {
    Cancelled,
    Interrupted,
    Failed(String),
}

/// What terminated the run.
enum Terminal {
    Completed(String),
    Degraded(String),
    Failed(String),
    Cancelled { interrupted: bool },
}

/// Everything the loop and its helpers need, bundled to keep signatures
/// manageable.
pub(super) struct RunCtx {
    pub core: Arc<RunnerCore>,
    pub agent: Arc<Agent>,
    pub run_id: String,
    pub thread_id: String,
    pub sink: EventSink,
    pub control: Arc<RunControl>,
    pub journal: CheckpointJournal,
}

impl RunCtx {
    pub(super) fn event(&self, event_type: RunEventType, state: RunState) -> RunEvent {
        RunEvent::new(event_type, self.run_id.clone(), self.thread_id.clone(), state)
    }
}

pub(crate) async fn execute(
    core: Arc<RunnerCore>,
    agent: Arc<Agent>,
    options: RunOptions,
    run_id: String,
    thread_id: String,
    sink: EventSink,
    control: Arc<RunControl>,
    slot: Arc<ResultSlot>,
) {
    let journal = match CheckpointJournal::new(Arc::clone(&core.memory), &thread_id, &run_id) {
        Ok(journal) => journal,
        Err(err) => {
            error!(%err, run_id, "Cannot open checkpoint journal");
            slot.set(None).await;
            return;
        }
    };
    let ctx = RunCtx {
        core,
        agent,
        run_id,
        thread_id,
        sink,
        control,
        journal,
    };

    let outcome = run_loop(&ctx, &options).await;
    slot.set(outcome).await;
}

async fn run_loop(ctx: &RunCtx, options: &RunOptions) -> Option<AgentResult> {
    let failsafe = ctx.agent.failsafe().clone();
    let mut state = LoopState::from_options(options);
    let resumed = options.resume_snapshot.is_some();

    if !resumed {
        // Fresh transcript: system instructions land at step time; user
        // message and context note land once here.
        if let Some(user_message) = &options.user_message {
            state.transcript.push(Message::user(user_message));
        } else if !options.context.is_empty() {
            let context_text = serde_json::to_string_pretty(&options.context)
                .unwrap_or_else(|_| "{}".to_owned());
            state
                .transcript
                .push(Message::user(format!("Additional context provided:\n{context_text}")));
        }
    }

    info!(
        run_id = %ctx.run_id,
        agent = %ctx.agent.name(),
        depth = options.depth,
        resumed,
        "Run started",
    );
    let mut start_data = Map::new();
    start_data.insert("agent".to_owned(), Value::String(ctx.agent.name().to_owned()));
    start_data.insert("depth".to_owned(), Value::from(options.depth));
    start_data.insert(
        "lineage".to_owned(),
        Value::Array(options.lineage.iter().map(|step| Value::from(*step)).collect()),
    );
    ctx.sink
        .emit(
            ctx.event(RunEventType::RunStarted, RunState::Running)
                .with_data(start_data.clone()),
        )
        .await;
    checkpoint(ctx, state.step, CheckpointPhase::RunStarted, Value::Object(start_data)).await;

    let started = Instant::now();
    let terminal: Terminal = 'run: loop {
        if state.step >= failsafe.max_steps {
            break budget_terminal(&state, "steps", failsafe.max_steps.to_string());
        }
        state.step += 1;
        let step = state.step;

        match boundary(ctx, &mut state).await {
            Boundary::Continue => {}
            Boundary::Cancelled => break Terminal::Cancelled { interrupted: false },
        }

        if started.elapsed().as_secs_f64() > failsafe.max_wall_time_s {
            break budget_terminal(&state, "wall_time", format!("{}s", failsafe.max_wall_time_s));
        }
        if state.llm_calls >= failsafe.max_llm_calls {
            break budget_terminal(&state, "llm_calls", failsafe.max_llm_calls.to_string());
        }
        if let Some(cost_limit) = failsafe.max_total_cost_usd
            && state.total_cost_usd > cost_limit
        {
            break budget_terminal(&state, "cost", format!("${cost_limit:.2}"));
        }

        // Refresh the effective system instructions.
        match resolve_instructions(ctx, &options.context) {
            Ok(system_text) => {
                if state
                    .transcript
                    .first()
                    .is_some_and(|message| message.role == crate::message::Role::System)
                {
                    state.transcript.remove(0);
                }
                if !system_text.is_empty() {
                    state.transcript.insert(0, Message::system(system_text));
                }
            }
            Err(err) => break Terminal::Failed(err.to_string()),
        }

        ctx.sink
            .emit(
                ctx.event(RunEventType::StepStarted, RunState::Running)
                    .with_step(step),
            )
            .await;
        checkpoint(ctx, step, CheckpointPhase::PreLlm, Value::Null).await;

        // Policy gate on the model call itself.
        let llm_decision = evaluate_policy_and_audit(
            ctx,
            PolicyEvent {
                event_type: PolicyEventType::LlmBeforeCall,
                run_id: ctx.run_id.clone(),
                thread_id: ctx.thread_id.clone(),
                step,
                context: options.context.clone(),
                tool_name: None,
                tool_args: None,
                subagent_name: None,
                metadata: Map::new(),
            },
            RunState::Running,
        )
        .await;
        if !llm_decision.is_allow() {
            let allowed = resolve_gated_action(ctx, step, "model call", &llm_decision).await;
            if !allowed {
                let reason = llm_decision
                    .reason
                    .unwrap_or_else(|| "Model call denied by policy".to_owned());
                break Terminal::Failed(reason);
            }
        }

        ctx.sink
            .emit(
                ctx.event(RunEventType::LlmCalled, RunState::Running)
                    .with_step(step),
            )
            .await;

        let response = match call_model(ctx, &failsafe, &mut state).await {
            Ok(response) => response,
            Err(CallFailure::Cancelled) => break Terminal::Cancelled { interrupted: false },
            Err(CallFailure::Interrupted) => break Terminal::Cancelled { interrupted: true },
            Err(CallFailure::Failed(message)) => {
                match failsafe.llm_failure_policy {
                    FailurePolicy::Continue
                    | FailurePolicy::ContinueWithError
                    | FailurePolicy::RetryThenContinue
                    | FailurePolicy::SkipAction => {
                        warn!(run_id = %ctx.run_id, step, error = %message, "Model call failed, continuing");
                        let mut data = Map::new();
                        data.insert("error".to_owned(), Value::String(message));
                        ctx.sink
                            .emit(
                                ctx.event(RunEventType::Warning, RunState::Running)
                                    .with_step(step)
                                    .with_message("Model call failed; continuing per policy")
                                    .with_data(data),
                            )
                            .await;
                        continue 'run;
                    }
                    FailurePolicy::RetryThenDegrade => {
                        break if state.last_text.is_some() {
                            Terminal::Degraded(format!("Model call failed: {message}"))
                        } else {
                            Terminal::Failed(format!("Model call failed: {message}"))
                        };
                    }
                    FailurePolicy::RetryThenFail
                    | FailurePolicy::FailFast
                    | FailurePolicy::FailRun => {
                        break Terminal::Failed(format!("Model call failed: {message}"));
                    }
                }
            }
        };

        state.llm_calls += 1;
        state.usage.add_usage(response.usage);
        if let Some(cost_usd) = response.cost_usd {
            state.total_cost_usd += cost_usd;
        }
        if response.model.is_some() {
            state.normalized_model = response.model.clone();
        }
        if let Some(text) = &response.text
            && !text.is_empty()
        {
            state.last_text = Some(text.clone());
        }

        let mut llm_data = Map::new();
        llm_data.insert(
            "text".to_owned(),
            response
                .text
                .clone()
                .map_or(Value::Null, Value::String),
        );
        llm_data.insert(
            "tool_call_count".to_owned(),
            Value::from(response.tool_calls.len()),
        );
        ctx.sink
            .emit(
                ctx.event(RunEventType::LlmCompleted, RunState::Running)
                    .with_step(step)
                    .with_data(llm_data.clone()),
            )
            .await;
        checkpoint(ctx, step, CheckpointPhase::PostLlm, Value::Object(llm_data)).await;

        // Append the assistant turn before any tool results.
        state.transcript.push(assistant_message(&response));

        // Tool batch.
        if response.has_tool_calls() {
            let batch = response.tool_calls.len() as u32;
            if state.tool_calls_made + batch > failsafe.max_tool_calls {
                break budget_terminal(&state, "tool_calls", failsafe.max_tool_calls.to_string());
            }

            match boundary(ctx, &mut state).await {
                Boundary::Continue => {}
                Boundary::Cancelled => break Terminal::Cancelled { interrupted: false },
            }

            let mut batch_data = Map::new();
            batch_data.insert(
                "tool_names".to_owned(),
                Value::Array(
                    response
                        .tool_calls
                        .iter()
                        .map(|call| Value::String(call.name.clone()))
                        .collect(),
                ),
            );
            ctx.sink
                .emit(
                    ctx.event(RunEventType::ToolBatchStarted, RunState::Running)
                        .with_step(step)
                        .with_data(batch_data),
                )
                .await;
            checkpoint(ctx, step, CheckpointPhase::PreToolBatch, Value::Null).await;

            if let Err(reason) =
                run_tool_batch(ctx, &failsafe, options, &mut state, &response.tool_calls).await
            {
                break Terminal::Failed(reason);
            }
            state.tool_calls_made += batch;
            checkpoint(ctx, step, CheckpointPhase::PostToolBatch, Value::Null).await;
        }

        // Subagent batch.
        let mut delegated = false;
        if ctx.agent.router().is_some() && options.depth < failsafe.max_subagent_depth {
            match boundary(ctx, &mut state).await {
                Boundary::Continue => {}
                Boundary::Cancelled => break Terminal::Cancelled { interrupted: false },
            }
            match run_router_phase(ctx, &failsafe, options, &mut state).await {
                Ok(ran) => delegated = ran,
                Err(reason) => break Terminal::Failed(reason),
            }
        }

        checkpoint(
            ctx,
            step,
            CheckpointPhase::RuntimeState,
            serde_json::to_value(state.snapshot()).unwrap_or(Value::Null),
        )
        .await;

        if !response.has_tool_calls() && !delegated {
            let final_text = response
                .text
                .clone()
                .or_else(|| state.last_text.clone())
                .unwrap_or_default();
            break Terminal::Completed(final_text);
        }
    };

    finish(ctx, state, terminal).await
}

fn budget_terminal(state: &LoopState, resource: &str, limit: String) -> Terminal {
    let message = format!("Budget exhausted ({resource}): limit {limit} reached");
    if state.last_text.is_some() {
        Terminal::Degraded(message)
    } else {
        Terminal::Failed(message)
    }
}

enum Boundary {
    Continue,
    Cancelled,
}

/// Control-flag check at a safe boundary: honors pause (persisting paused /
/// resumed checkpoints) and cancel/interrupt.
async fn boundary(ctx: &RunCtx, state: &mut LoopState) -> Boundary {
    if ctx.control.is_cancel_requested() || ctx.control.is_interrupt_requested() {
        return Boundary::Cancelled;
    }
    if !ctx.control.is_pause_requested() {
        return Boundary::Continue;
    }

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunPaused, RunState::Paused)
                .with_step(state.step)
                .with_message("Paused at step boundary"),
        )
        .await;
    checkpoint(ctx, state.step, CheckpointPhase::Paused, Value::Null).await;

    while ctx.control.is_pause_requested() {
        if ctx.control.is_cancel_requested() || ctx.control.is_interrupt_requested() {
            return Boundary::Cancelled;
        }
        let _ = tokio::time::timeout(Duration::from_millis(25), ctx.control.changed()).await;
    }

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunResumed, RunState::Running)
                .with_step(state.step)
                .with_message("Resumed after pause"),
        )
        .await;
    checkpoint(ctx, state.step, CheckpointPhase::Resumed, Value::Null).await;
    Boundary::Continue
}

async fn checkpoint(ctx: &RunCtx, step: u64, phase: CheckpointPhase, payload: Value) {
    if let Err(err) = ctx.journal.write(step, phase, payload).await {
        warn!(%err, run_id = %ctx.run_id, step, phase = %phase, "Checkpoint write failed");
    }
}

fn resolve_instructions(
    ctx: &RunCtx,
    context: &Map<String, Value>,
) -> crate::error::Result<String> {
    match ctx.agent.instructions() {
        InstructionSource::Inline(text) => Ok(text.clone()),
        InstructionSource::TemplateFile {
            path,
            context: extra,
        } => {
            let template = ctx.core.instructions.load_file(path)?;
            let mut merged = context.clone();
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            render_template(&template, &merged)
        }
        InstructionSource::Auto => {
            let template = ctx.core.instructions.load_auto(ctx.agent.name())?;
            render_template(&template, context)
        }
    }
}

fn assistant_message(response: &ChatResponse) -> Message {
    if response.tool_calls.is_empty() {
        Message::assistant(response.text.clone().unwrap_or_default())
    } else {
        let mut parts: Vec<crate::message::ContentPart> = Vec::new();
        if let Some(text) = &response.text
            && !text.is_empty()
        {
            parts.push(crate::message::ContentPart::Text { text: text.clone() });
        }
        for call in &response.tool_calls {
            parts.push(crate::message::ContentPart::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }
        Message::from_parts(crate::message::Role::Assistant, parts)
    }
}

/// Call the model with circuit breaker and fallback-model chain, racing the
/// cancel/interrupt flags.
async fn call_model(
    ctx: &RunCtx,
    failsafe: &crate::failsafe::FailSafeConfig,
    state: &mut LoopState,
) -> Result<ChatResponse, CallFailure> {
    if let Some(open_until) = state.breaker_open_until {
        if Instant::now() < open_until {
            return Err(CallFailure::Failed(
                Error::CircuitOpen {
                    failures: state.breaker_failures,
                }
                .to_string(),
            ));
        }
        // Cooldown elapsed: allow a probe call.
        state.breaker_open_until = None;
    }

    let mut models: Vec<String> = vec![ctx.agent.model().to_owned()];
    models.extend(failsafe.fallback_model_chain.iter().cloned());

    let definitions = ctx.agent.tools().definitions();
    let mut last_error = "model call failed".to_owned();

    for model in models {
        let request = ChatRequest::new(model.clone(), state.transcript.clone())
            .with_tools(definitions.clone());
        let call = ctx.agent.transport().chat(request);
        tokio::pin!(call);

        let result = loop {
            if ctx.control.is_interrupt_requested() {
                // Capability-gated abort; degrade to cancel when the
                // transport cannot interrupt.
                if ctx.agent.transport().capabilities().interrupt {
                    return Err(CallFailure::Interrupted);
                }
                return Err(CallFailure::Cancelled);
            }
            if ctx.control.is_cancel_requested() {
                return Err(CallFailure::Cancelled);
            }
            match tokio::time::timeout(Duration::from_millis(25), &mut call).await {
                Ok(result) => break result,
                Err(_) => continue,
            }
        };

        match result {
            Ok(response) => {
                state.breaker_failures = 0;
                state.breaker_open_until = None;
                return Ok(response);
            }
            Err(err) => {
                state.breaker_failures += 1;
                if state.breaker_failures >= failsafe.breaker_failure_threshold {
                    state.breaker_open_until = Some(
                        Instant::now() + Duration::from_secs_f64(failsafe.breaker_cooldown_s),
                    );
                    warn!(
                        run_id = %ctx.run_id,
                        failures = state.breaker_failures,
                        "Model-call circuit breaker opened",
                    );
                }
                error!(run_id = %ctx.run_id, model = %model, error = %err, "Model call failed");
                last_error = err.to_string();
            }
        }
    }

    Err(CallFailure::Failed(last_error))
}

/// Evaluate the policy chain (agent engine first, then runner engine, then
/// roles) and emit the audit event.
pub(super) async fn evaluate_policy_and_audit(
    ctx: &RunCtx,
    event: PolicyEvent,
    state: RunState,
) -> PolicyDecision {
    let engine = ctx
        .agent
        .policy_engine()
        .or(ctx.core.policy_engine.as_ref());
    let decision = evaluate_chain(
        engine.map(|engine| engine.as_ref()),
        ctx.agent.policy_roles(),
        &event,
    )
    .await;

    let mut data = Map::new();
    data.insert(
        "event_type".to_owned(),
        Value::String(event.event_type.to_string()),
    );
    data.insert(
        "action".to_owned(),
        serde_json::to_value(decision.action).unwrap_or(Value::Null),
    );
    data.insert(
        "reason".to_owned(),
        decision.reason.clone().map_or(Value::Null, Value::String),
    );
    data.insert(
        "policy_id".to_owned(),
        decision
            .policy_id
            .clone()
            .map_or(Value::Null, Value::String),
    );
    data.insert(
        "matched_rules".to_owned(),
        Value::Array(
            decision
                .matched_rules
                .iter()
                .map(|rule| Value::String(rule.clone()))
                .collect(),
        ),
    );
    ctx.sink
        .emit(
            ctx.event(RunEventType::PolicyDecision, state)
                .with_step(event.step)
                .with_data(data),
        )
        .await;
    decision
}

/// Resolve a non-allow policy decision through the interaction broker.
/// Returns whether the gated action may proceed.
async fn resolve_gated_action(
    ctx: &RunCtx,
    step: u64,
    subject: &str,
    decision: &PolicyDecision,
) -> bool {
    match decision.action {
        PolicyAction::Allow => true,
        PolicyAction::Deny => false,
        PolicyAction::RequestUserInput => {
            let prompt = decision
                .request_payload
                .get("prompt")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|prompt| !prompt.is_empty())
                .map(str::to_owned)
                .or_else(|| decision.reason.clone())
                .unwrap_or_else(|| format!("Provide input for {subject}"));
            request_user_input(ctx, step, &prompt, decision.request_payload.clone())
                .await
                .kind
                == crate::interaction::DecisionKind::Allow
        }
        PolicyAction::Defer => {
            // A defer marker may route to user input; approval otherwise.
            let wants_input = decision
                .request_payload
                .get("interaction")
                .and_then(Value::as_str)
                .map(|marker| {
                    matches!(marker.trim().to_lowercase().as_str(), "user_input" | "input")
                })
                .unwrap_or(false);
            if wants_input {
                let prompt = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("Provide input for {subject}"));
                request_user_input(ctx, step, &prompt, decision.request_payload.clone())
                    .await
                    .kind
                    == crate::interaction::DecisionKind::Allow
            } else {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("Approval required for {subject}"));
                request_approval(ctx, step, &reason, decision.request_payload.clone()).await
            }
        }
        PolicyAction::RequestApproval => {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| format!("Approval required for {subject}"));
            request_approval(ctx, step, &reason, decision.request_payload.clone()).await
        }
    }
}

/// Request approval, handling the deferred pause/resume flow.
async fn request_approval(
    ctx: &RunCtx,
    step: u64,
    reason: &str,
    payload: Map<String, Value>,
) -> bool {
    let request = ApprovalRequest {
        run_id: ctx.run_id.clone(),
        thread_id: ctx.thread_id.clone(),
        step,
        reason: reason.to_owned(),
        payload,
    };
    let deferred = match ctx.core.interaction.request_approval(&request).await {
        InteractionReply::Resolved(decision) => return decision.is_allowed(),
        InteractionReply::Deferred(deferred) => deferred,
    };

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunPaused, RunState::Paused)
                .with_step(step)
                .with_message("Waiting for deferred approval"),
        )
        .await;
    let mut pause_payload = Map::new();
    pause_payload.insert("kind".to_owned(), Value::String("approval".to_owned()));
    pause_payload.insert("reason".to_owned(), Value::String(reason.to_owned()));
    checkpoint(ctx, step, CheckpointPhase::Paused, Value::Object(pause_payload)).await;

    let resolved = ctx
        .core
        .interaction
        .await_deferred_approval(
            &deferred.token,
            Duration::from_secs_f64(ctx.core.config.approval_timeout_s),
        )
        .await;

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunResumed, RunState::Running)
                .with_step(step)
                .with_message("Deferred approval resolved"),
        )
        .await;
    let mut resume_payload = Map::new();
    resume_payload.insert("kind".to_owned(), Value::String("approval".to_owned()));
    checkpoint(ctx, step, CheckpointPhase::Resumed, Value::Object(resume_payload)).await;

    match resolved {
        Some(decision) => decision.is_allowed(),
        None => ctx.core.config.approval_fallback == crate::interaction::DecisionKind::Allow,
    }
}

/// Request user input, handling the deferred pause/resume flow.
async fn request_user_input(
    ctx: &RunCtx,
    step: u64,
    prompt: &str,
    payload: Map<String, Value>,
) -> crate::interaction::UserInputDecision {
    let request = UserInputRequest {
        run_id: ctx.run_id.clone(),
        thread_id: ctx.thread_id.clone(),
        step,
        prompt: prompt.to_owned(),
        payload,
    };
    let deferred = match ctx.core.interaction.request_user_input(&request).await {
        InteractionReply::Resolved(decision) => return decision,
        InteractionReply::Deferred(deferred) => deferred,
    };

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunPaused, RunState::Paused)
                .with_step(step)
                .with_message("Waiting for deferred user input"),
        )
        .await;
    let mut pause_payload = Map::new();
    pause_payload.insert("kind".to_owned(), Value::String("user_input".to_owned()));
    pause_payload.insert("prompt".to_owned(), Value::String(prompt.to_owned()));
    checkpoint(ctx, step, CheckpointPhase::Paused, Value::Object(pause_payload)).await;

    let resolved = ctx
        .core
        .interaction
        .await_deferred_input(
            &deferred.token,
            Duration::from_secs_f64(ctx.core.config.input_timeout_s),
        )
        .await;

    ctx.sink
        .emit(
            ctx.event(RunEventType::RunResumed, RunState::Running)
                .with_step(step)
                .with_message("Deferred user input resolved"),
        )
        .await;
    let mut resume_payload = Map::new();
    resume_payload.insert("kind".to_owned(), Value::String("user_input".to_owned()));
    checkpoint(ctx, step, CheckpointPhase::Resumed, Value::Object(resume_payload)).await;

    resolved.unwrap_or(crate::interaction::UserInputDecision {
        kind: ctx.core.config.input_fallback,
        value: None,
        reason: Some("input_timeout".to_owned()),
    })
}

/// Execute one tool batch: per-call policy, bounded-parallel execution,
/// deterministic transcript order. Returns `Err(reason)` only for
/// fail-the-run policies.
async fn run_tool_batch(
    ctx: &RunCtx,
    failsafe: &crate::failsafe::FailSafeConfig,
    options: &RunOptions,
    state: &mut LoopState,
    calls: &[ToolCallRequest],
) -> Result<(), String> {
    let step = state.step;
    // One slot per call, in model emission order.
    let mut records: Vec<Option<ToolExecutionRecord>> = vec![None; calls.len()];
    let mut approved: Vec<(usize, ToolCallRequest)> = Vec::new();

    for (index, call) in calls.iter().enumerate() {
        let tool_args = call.arguments.as_object().cloned();
        let decision = evaluate_policy_and_audit(
            ctx,
            PolicyEvent {
                event_type: PolicyEventType::ToolBeforeExecute,
                run_id: ctx.run_id.clone(),
                thread_id: ctx.thread_id.clone(),
                step,
                context: options.context.clone(),
                tool_name: Some(call.name.clone()),
                tool_args,
                subagent_name: None,
                metadata: Map::new(),
            },
            RunState::Running,
        )
        .await;

        let allowed = match decision.action {
            PolicyAction::Allow => true,
            _ => {
                resolve_gated_action(ctx, step, &format!("tool '{}'", call.name), &decision).await
            }
        };

        if allowed {
            let mut effective = call.clone();
            if let Some(updated) = &decision.updated_tool_args {
                effective.arguments = Value::Object(updated.clone());
            }
            approved.push((index, effective));
        } else {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| format!("Tool '{}' denied by policy", call.name));
            if matches!(
                failsafe.approval_denial_policy,
                FailurePolicy::FailRun | FailurePolicy::FailFast
            ) {
                return Err(reason);
            }
            records[index] = Some(ToolExecutionRecord {
                tool_name: call.name.clone(),
                tool_call_id: Some(call.id.clone()),
                success: false,
                output: None,
                error: Some(reason),
                latency_ms: None,
            });
        }
    }

    // Execute approved calls with bounded parallelism, preserving order.
    let concurrency = failsafe.max_parallel_tools.max(1);
    for chunk in approved.chunks(concurrency) {
        let futures: Vec<_> = chunk
            .iter()
            .map(|(index, call)| {
                let index = *index;
                async move { (index, execute_single_tool(ctx, call).await) }
            })
            .collect();
        for (index, record) in futures::future::join_all(futures).await {
            records[index] = Some(record);
        }
    }

    for (index, call) in calls.iter().enumerate() {
        let Some(record) = records[index].take() else {
            continue;
        };
        let output = record
            .output
            .clone()
            .unwrap_or_else(|| Value::String(record.error.clone().unwrap_or_default()));
        state
            .transcript
            .push(Message::tool_result(&call.id, output, record.success));

        let mut data = Map::new();
        data.insert(
            "tool_name".to_owned(),
            Value::String(record.tool_name.clone()),
        );
        data.insert(
            "tool_call_id".to_owned(),
            record
                .tool_call_id
                .clone()
                .map_or(Value::Null, Value::String),
        );
        data.insert("success".to_owned(), Value::Bool(record.success));
        data.insert(
            "output".to_owned(),
            record.output.clone().unwrap_or(Value::Null),
        );
        data.insert(
            "error".to_owned(),
            record.error.clone().map_or(Value::Null, Value::String),
        );
        ctx.sink
            .emit(
                ctx.event(RunEventType::ToolCompleted, RunState::Running)
                    .with_step(step)
                    .with_data(data),
            )
            .await;

        let effect_id = format!("tool-{}", call.id.replace(':', "-"));
        if let Err(err) = ctx
            .journal
            .record_effect(
                step,
                &effect_id,
                serde_json::to_value(&record).unwrap_or(Value::Null),
            )
            .await
        {
            warn!(%err, run_id = %ctx.run_id, "Effect journal write failed");
        }

        state.tool_executions.push(record);
    }

    Ok(())
}

async fn execute_single_tool(ctx: &RunCtx, call: &ToolCallRequest) -> ToolExecutionRecord {
    let started = Instant::now();
    let Some(tool) = ctx.agent.tools().get(&call.name) else {
        warn!(run_id = %ctx.run_id, tool = %call.name, "Tool not found");
        return ToolExecutionRecord {
            tool_name: call.name.clone(),
            tool_call_id: Some(call.id.clone()),
            success: false,
            output: None,
            error: Some(format!("Tool '{}' not found", call.name)),
            latency_ms: None,
        };
    };

    debug!(run_id = %ctx.run_id, tool = %call.name, "Dispatching tool");
    let outcome = tool.call_json(call.arguments.clone()).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(output) => ToolExecutionRecord {
            tool_name: call.name.clone(),
            tool_call_id: Some(call.id.clone()),
            success: true,
            output: Some(output),
            error: None,
            latency_ms: Some(latency_ms),
        },
        Err(err) => {
            warn!(run_id = %ctx.run_id, tool = %call.name, error = %err, "Tool execution failed");
            ToolExecutionRecord {
                tool_name: call.name.clone(),
                tool_call_id: Some(call.id.clone()),
                success: false,
                output: None,
                error: Some(err.to_string()),
                latency_ms: Some(latency_ms),
            }
        }
    }
}

/// Router + delegation phase. Returns whether any subagent work ran.
async fn run_router_phase(
    ctx: &RunCtx,
    failsafe: &crate::failsafe::FailSafeConfig,
    options: &RunOptions,
    state: &mut LoopState,
) -> Result<bool, String> {
    let Some(router) = ctx.agent.router() else {
        return Ok(false);
    };

    let decision = match router
        .route(RouterInput {
            run_id: ctx.run_id.clone(),
            thread_id: ctx.thread_id.clone(),
            step: state.step,
            context: options.context.clone(),
            messages: state.transcript.clone(),
        })
        .await
    {
        Ok(decision) => decision,
        Err(err) => {
            return handle_subagent_failure(ctx, failsafe, state, err.to_string()).await;
        }
    };
    if decision.targets.is_empty() {
        return Ok(false);
    }

    let mut targets = decision.targets;
    targets.truncate(failsafe.max_subagent_fanout_per_step.max(1));

    match super::subagents::run_subagents(
        ctx,
        options,
        state.step,
        targets,
        decision.parallel,
        &decision.metadata,
    )
    .await
    {
        Ok((records, bridge)) => {
            let ran = !records.is_empty();
            state.subagent_executions.extend(records);
            if !bridge.is_empty() {
                state.transcript.push(Message::user(bridge));
            }
            Ok(ran)
        }
        Err(err) => handle_subagent_failure(ctx, failsafe, state, err.to_string()).await,
    }
}

async fn handle_subagent_failure(
    ctx: &RunCtx,
    failsafe: &crate::failsafe::FailSafeConfig,
    state: &mut LoopState,
    message: String,
) -> Result<bool, String> {
    match failsafe.subagent_failure_policy {
        FailurePolicy::FailRun | FailurePolicy::FailFast | FailurePolicy::RetryThenFail => {
            Err(message)
        }
        _ => {
            warn!(run_id = %ctx.run_id, error = %message, "Subagent phase failed, continuing");
            let mut data = Map::new();
            data.insert("error".to_owned(), Value::String(message.clone()));
            ctx.sink
                .emit(
                    ctx.event(RunEventType::Warning, RunState::Running)
                        .with_step(state.step)
                        .with_message("Subagent delegation failed")
                        .with_data(data),
                )
                .await;
            state
                .transcript
                .push(Message::user(format!("Subagent delegation failed: {message}")));
            Ok(false)
        }
    }
}

/// Build and record the terminal result.
async fn finish(ctx: &RunCtx, state: LoopState, terminal: Terminal) -> Option<AgentResult> {
    let (run_state, final_text, error, event_type, interrupted) = match terminal {
        Terminal::Completed(text) => (RunState::Completed, text, None, RunEventType::RunCompleted, false),
        Terminal::Degraded(message) => (
            RunState::Degraded,
            state.last_text.clone().unwrap_or_default(),
            Some(message),
            RunEventType::RunCompleted,
            false,
        ),
        Terminal::Failed(message) => (
            RunState::Failed,
            state.last_text.clone().unwrap_or_default(),
            Some(message),
            RunEventType::RunFailed,
            false,
        ),
        Terminal::Cancelled { interrupted } => (
            RunState::Cancelled,
            state.last_text.clone().unwrap_or_default(),
            Some("Run cancelled".to_owned()),
            RunEventType::RunCancelled,
            interrupted,
        ),
    };

    let result = AgentResult {
        run_id: ctx.run_id.clone(),
        thread_id: ctx.thread_id.clone(),
        state: run_state,
        final_text,
        requested_model: Some(ctx.agent.model().to_owned()),
        normalized_model: state.normalized_model.clone(),
        provider_adapter: Some(ctx.agent.transport().id().to_owned()),
        tool_executions: state.tool_executions.clone(),
        subagent_executions: state.subagent_executions.clone(),
        usage_aggregate: state.usage,
        total_cost_usd: (state.total_cost_usd > 0.0).then_some(state.total_cost_usd),
        error: error.clone(),
        state_snapshot: Map::new(),
    };

    if interrupted {
        ctx.sink
            .emit(
                ctx.event(RunEventType::RunInterrupted, RunState::Cancelled)
                    .with_step(state.step)
                    .with_message("In-flight model call interrupted"),
            )
            .await;
    }

    let mut data = Map::new();
    data.insert(
        "final_text".to_owned(),
        Value::String(result.final_text.clone()),
    );
    if let Some(error) = &error {
        data.insert("error".to_owned(), Value::String(error.clone()));
    }
    let mut event = ctx
        .event(event_type, run_state)
        .with_step(state.step)
        .with_data(data);
    if let Some(error) = &error {
        event = event.with_message(error.clone());
    }
    ctx.sink.emit(event).await;

    let mut terminal_payload = Map::new();
    terminal_payload.insert(
        "terminal_result".to_owned(),
        serde_json::to_value(&result).unwrap_or(Value::Null),
    );
    checkpoint(
        ctx,
        state.step,
        CheckpointPhase::RunTerminal,
        Value::Object(terminal_payload),
    )
    .await;

    info!(
        run_id = %ctx.run_id,
        agent = %ctx.agent.name(),
        state = %run_state,
        steps = state.step,
        llm_calls = state.llm_calls,
        "Run finished",
    );

    if run_state == RunState::Cancelled {
        None
    } else {
        Some(result)
    }
}
