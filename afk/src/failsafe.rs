//! Fail-safe limits and failure policies for agent runs.

use serde::{Deserialize, Serialize};

/// Strategy applied when an action kind fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Retry, then fail the run.
    RetryThenFail,
    /// Retry, then degrade the run keeping partial output.
    RetryThenDegrade,
    /// Abort immediately.
    FailFast,
    /// Record the error and keep going.
    ContinueWithError,
    /// Retry, then keep going without the result.
    RetryThenContinue,
    /// Keep going without the result.
    Continue,
    /// Fail the run.
    FailRun,
    /// Skip the denied/failed action.
    SkipAction,
}

/// Runtime limits and failure-policy settings for an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailSafeConfig {
    /// Strategy when model calls fail.
    pub llm_failure_policy: FailurePolicy,
    /// Strategy when tool calls fail.
    pub tool_failure_policy: FailurePolicy,
    /// Strategy when subagent calls fail.
    pub subagent_failure_policy: FailurePolicy,
    /// Strategy when approval is denied or times out.
    pub approval_denial_policy: FailurePolicy,
    /// Maximum run loop iterations.
    pub max_steps: u64,
    /// Maximum wall-clock runtime in seconds.
    pub max_wall_time_s: f64,
    /// Maximum model invocations per run.
    pub max_llm_calls: u32,
    /// Maximum tool invocations per run.
    pub max_tool_calls: u32,
    /// Maximum concurrent tools per batch.
    pub max_parallel_tools: usize,
    /// Maximum subagent recursion depth.
    pub max_subagent_depth: u32,
    /// Maximum selected subagents per step.
    pub max_subagent_fanout_per_step: usize,
    /// Optional cost ceiling in USD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_cost_usd: Option<f64>,
    /// Ordered fallback model ids tried when the primary model fails.
    #[serde(default)]
    pub fallback_model_chain: Vec<String>,
    /// Consecutive model-call failures before the breaker opens.
    pub breaker_failure_threshold: u32,
    /// Breaker cooldown window in seconds.
    pub breaker_cooldown_s: f64,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            llm_failure_policy: FailurePolicy::RetryThenFail,
            tool_failure_policy: FailurePolicy::ContinueWithError,
            subagent_failure_policy: FailurePolicy::Continue,
            approval_denial_policy: FailurePolicy::SkipAction,
            max_steps: 20,
            max_wall_time_s: 300.0,
            max_llm_calls: 50,
            max_tool_calls: 200,
            max_parallel_tools: 16,
            max_subagent_depth: 3,
            max_subagent_fanout_per_step: 4,
            max_total_cost_usd: None,
            fallback_model_chain: Vec::new(),
            breaker_failure_threshold: 5,
            breaker_cooldown_s: 30.0,
        }
    }
}
