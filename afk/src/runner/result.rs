//! Terminal result types for agent runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::RunState;
use crate::tool::ToolExecutionRecord;
use crate::transport::Usage;

/// Aggregated token usage across the model calls in a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAggregate {
    /// Sum of prompt/input tokens.
    pub input_tokens: u64,
    /// Sum of completion/output tokens.
    pub output_tokens: u64,
    /// Sum of total token counts.
    pub total_tokens: u64,
}

impl UsageAggregate {
    /// Add one model call's usage to the totals.
    pub fn add_usage(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total_tokens;
    }
}

/// Normalized record for one subagent execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentExecutionRecord {
    /// Executed subagent name.
    pub subagent_name: String,
    /// Whether the subagent run succeeded.
    pub success: bool,
    /// Final text returned by the subagent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    /// Error message when the subagent failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Subagent execution latency in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
}

/// Terminal result payload returned by runner calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    /// Run identifier.
    pub run_id: String,
    /// Thread identifier.
    pub thread_id: String,
    /// Terminal run state.
    pub state: RunState,
    /// Final assistant text.
    pub final_text: String,
    /// Model identifier requested by the agent definition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_model: Option<String>,
    /// Effective model identifier reported by the transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_model: Option<String>,
    /// Transport id used for execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_adapter: Option<String>,
    /// Ordered tool execution records.
    #[serde(default)]
    pub tool_executions: Vec<ToolExecutionRecord>,
    /// Ordered subagent execution records.
    #[serde(default)]
    pub subagent_executions: Vec<SubagentExecutionRecord>,
    /// Total token usage across model calls.
    #[serde(default)]
    pub usage_aggregate: UsageAggregate,
    /// Aggregated model-call cost in USD, when the transport reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    /// Summary of the dominant failure, for non-completed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Terminal runtime snapshot payload.
    #[serde(default)]
    pub state_snapshot: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut aggregate = UsageAggregate::default();
        aggregate.add_usage(Usage::new(10, 5));
        aggregate.add_usage(Usage::new(3, 2));
        assert_eq!(aggregate.input_tokens, 13);
        assert_eq!(aggregate.output_tokens, 7);
        assert_eq!(aggregate.total_tokens, 20);
    }

    #[test]
    fn result_serde_round_trip() {
        let result = AgentResult {
            run_id: "r1".into(),
            thread_id: "t1".into(),
            state: RunState::Completed,
            final_text: "done".into(),
            requested_model: Some("m".into()),
            normalized_model: None,
            provider_adapter: Some("mock".into()),
            tool_executions: Vec::new(),
            subagent_executions: Vec::new(),
            usage_aggregate: UsageAggregate::default(),
            total_cost_usd: None,
            error: None,
            state_snapshot: Map::new(),
        };
        let raw = serde_json::to_value(&result).unwrap();
        let back: AgentResult = serde_json::from_value(raw).unwrap();
        assert_eq!(back, result);
    }
}
