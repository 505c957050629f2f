//! Prelude module for convenient imports.
//!
//! Re-exports the most commonly used types and traits so you can get
//! started with a single `use` statement.
//!
//! ```rust,ignore
//! use afk::prelude::*;
//!
//! let agent = Agent::builder("assistant")
//!     .transport(transport)
//!     .instructions("You are helpful.")
//!     .build()?;
//! let runner = Runner::new()?;
//! ```

pub use crate::a2a::{
    AgentProtocol, DeadLetter, InvocationDispatcher, InvocationRequest, InvocationResponse,
    ProtocolEvent, ProtocolEventType,
    delivery::{DeliveryStore, InMemoryDeliveryStore},
    protocol::InternalProtocol,
};
pub use crate::agent::{Agent, AgentBuilder, RouterDecision, RouterInput, SubagentRouter};
pub use crate::delegation::{
    DelegationEdge, DelegationNode, DelegationPlan, DelegationResult, FinalStatus, JoinPolicy,
    NodeResult, NodeStatus, RetryPolicy,
    engine::DelegationEngine,
    scheduler::SchedulerLimits,
};
pub use crate::error::{Error, Result};
pub use crate::event::{RunEvent, RunEventType, RunState};
pub use crate::failsafe::{FailSafeConfig, FailurePolicy};
pub use crate::instructions::InstructionSource;
pub use crate::interaction::{
    ApprovalDecision, ApprovalRequest, DecisionKind, ExternalInteractionProvider,
    HeadlessInteractionProvider, InteractionProvider, UserInputDecision, UserInputRequest,
};
pub use crate::memory::{
    MemoryEvent, MemoryRecord, MemoryStore,
    compaction::{CompactionSummary, RetentionPolicy, StateRetentionPolicy},
    in_memory::InMemoryMemoryStore,
};
pub use crate::message::{ContentPart, Message, MessageContent, Role};
pub use crate::policy::{
    PolicyAction, PolicyDecision, PolicyEngine, PolicyEvent, PolicyEventType, PolicyRole,
    PolicyRule,
};
pub use crate::queue::{
    TaskItem, TaskQueue, TaskRetryPolicy, TaskStatus,
    contracts::{
        ContractContext, ContractError, ExecutionContract, JOB_DISPATCH_CONTRACT, JobHandler,
        RUNNER_CHAT_CONTRACT,
    },
    memory::{InMemoryTaskQueue, in_memory_task_queue},
    worker::{TaskWorker, TaskWorkerConfig, WorkerMetrics},
};
pub use crate::runner::{
    AgentResult, RunHandle, Runner, RunnerConfig, StreamEvent, SubagentExecutionRecord,
    UsageAggregate,
};
pub use crate::tool::{BoxedTool, DynTool, ToolDefinition, ToolExecutionRecord, ToolRegistry};
pub use crate::transport::{
    ChatRequest, ChatResponse, ModelTransport, ToolCallRequest, TransportCapabilities, Usage,
    mock::{MockReply, MockTransport},
};
