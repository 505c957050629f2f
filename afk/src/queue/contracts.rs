//! Execution contracts for worker dispatch.
//!
//! Each task's metadata names an execution contract; the worker resolves it
//! and hands the task over. Resolution and validation failures are
//! terminal — they fail the task without consuming retry budget — while
//! execution failures pass through as retryable.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::Agent;
use crate::runner::Runner;

use super::TaskItem;

/// Contract id for runner-based agent execution.
pub const RUNNER_CHAT_CONTRACT: &str = "runner.chat.v1";
/// Contract id for non-agent job execution via registered handlers.
pub const JOB_DISPATCH_CONTRACT: &str = "job.dispatch.v1";

/// Execution contract failure.
#[derive(Debug, Error)]
pub enum ContractError {
    /// The task cannot be mapped to a known execution contract.
    #[error("{0}")]
    Resolution(String),
    /// Task data is invalid for the resolved contract.
    #[error("{0}")]
    Validation(String),
    /// The contract ran and failed (retryable).
    #[error("{0}")]
    Execution(String),
}

impl ContractError {
    /// Whether this failure is terminal (does not consume retry budget).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolution(_) | Self::Validation(_))
    }
}

/// Named handler used by the `job.dispatch.v1` contract.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one job with its arguments.
    async fn run(&self, arguments: Map<String, Value>, task: &TaskItem)
    -> crate::error::Result<Value>;
}

/// Shared worker dependencies passed to execution contracts.
#[derive(Default)]
pub struct ContractContext {
    /// Named handler map used by dispatch-style contracts.
    pub job_handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for ContractContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractContext")
            .field("job_handlers", &self.job_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Contract implemented by worker execution strategies.
#[async_trait]
pub trait ExecutionContract: Send + Sync {
    /// Stable contract id.
    fn contract_id(&self) -> &str;

    /// Whether tasks need a resolvable `agent_name`.
    fn requires_agent(&self) -> bool;

    /// Execute one task and return a JSON-safe output payload.
    async fn execute(
        &self,
        task: &TaskItem,
        agent: Option<Arc<Agent>>,
        context: &ContractContext,
    ) -> Result<Value, ContractError>;
}

/// Built-in contract for runner-based agent execution.
///
/// Expected payload: `user_message: string?`, `context: object?`.
pub struct RunnerChatContract {
    runner: Runner,
}

impl std::fmt::Debug for RunnerChatContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerChatContract").finish_non_exhaustive()
    }
}

impl RunnerChatContract {
    /// Create the contract over a runner.
    #[must_use]
    pub const fn new(runner: Runner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ExecutionContract for RunnerChatContract {
    fn contract_id(&self) -> &str {
        RUNNER_CHAT_CONTRACT
    }

    fn requires_agent(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        task: &TaskItem,
        agent: Option<Arc<Agent>>,
        _context: &ContractContext,
    ) -> Result<Value, ContractError> {
        let agent = agent.ok_or_else(|| {
            ContractError::Validation(format!(
                "Contract '{RUNNER_CHAT_CONTRACT}' requires an agent"
            ))
        })?;

        let user_message = match task.payload.get("user_message") {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(_) => {
                return Err(ContractError::Validation(format!(
                    "Contract '{RUNNER_CHAT_CONTRACT}' expected payload.user_message to be a string or null"
                )));
            }
        };
        let context = match task.payload.get("context") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(ContractError::Validation(format!(
                    "Contract '{RUNNER_CHAT_CONTRACT}' expected payload.context to be an object or null"
                )));
            }
        };

        let result = self
            .runner
            .run(agent, user_message, context, None)
            .await
            .map_err(|err| ContractError::Execution(err.to_string()))?;

        let mut output = Map::new();
        output.insert(
            "final_text".to_owned(),
            Value::String(result.final_text.clone()),
        );
        output.insert("state".to_owned(), Value::String(result.state.to_string()));
        Ok(Value::Object(output))
    }
}

/// Built-in contract for non-agent job execution.
///
/// Expected payload: `job_type: string`, `arguments: object?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobDispatchContract;

#[async_trait]
impl ExecutionContract for JobDispatchContract {
    fn contract_id(&self) -> &str {
        JOB_DISPATCH_CONTRACT
    }

    fn requires_agent(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        task: &TaskItem,
        _agent: Option<Arc<Agent>>,
        context: &ContractContext,
    ) -> Result<Value, ContractError> {
        let job_type = task
            .payload
            .get("job_type")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|job_type| !job_type.is_empty())
            .ok_or_else(|| {
                ContractError::Validation(format!(
                    "Contract '{JOB_DISPATCH_CONTRACT}' requires non-empty payload.job_type"
                ))
            })?;

        let arguments = match task.payload.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ContractError::Validation(format!(
                    "Contract '{JOB_DISPATCH_CONTRACT}' expected payload.arguments to be an object"
                )));
            }
        };

        let handler = context.job_handlers.get(job_type).ok_or_else(|| {
            ContractError::Validation(format!(
                "Unknown job handler '{job_type}' for contract '{JOB_DISPATCH_CONTRACT}'"
            ))
        })?;

        handler
            .run(arguments, task)
            .await
            .map_err(|err| ContractError::Execution(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SumHandler;

    #[async_trait]
    impl JobHandler for SumHandler {
        async fn run(
            &self,
            arguments: Map<String, Value>,
            _task: &TaskItem,
        ) -> crate::error::Result<Value> {
            let a = arguments.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = arguments.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::from(a + b))
        }
    }

    fn job_task(payload: Value) -> TaskItem {
        let mut task = TaskItem::new(None, payload.as_object().cloned().unwrap_or_default());
        task.set_execution_contract(JOB_DISPATCH_CONTRACT);
        task
    }

    #[tokio::test]
    async fn job_dispatch_routes_to_handler() {
        let mut context = ContractContext::default();
        context
            .job_handlers
            .insert("sum".to_owned(), Arc::new(SumHandler));
        let task = job_task(serde_json::json!({
            "job_type": "sum",
            "arguments": {"a": 1, "b": 2}
        }));
        let output = JobDispatchContract
            .execute(&task, None, &context)
            .await
            .unwrap();
        assert_eq!(output, Value::from(3));
    }

    #[tokio::test]
    async fn job_dispatch_validates_payload_shape() {
        let context = ContractContext::default();

        let missing_type = job_task(serde_json::json!({}));
        let err = JobDispatchContract
            .execute(&missing_type, None, &context)
            .await
            .unwrap_err();
        assert!(err.is_terminal());

        let bad_args = job_task(serde_json::json!({
            "job_type": "sum",
            "arguments": [1, 2]
        }));
        let err = JobDispatchContract
            .execute(&bad_args, None, &context)
            .await
            .unwrap_err();
        assert!(err.is_terminal());

        let unknown = job_task(serde_json::json!({"job_type": "nope"}));
        let err = JobDispatchContract
            .execute(&unknown, None, &context)
            .await
            .unwrap_err();
        assert!(matches!(err, ContractError::Validation(_)));
    }
}
