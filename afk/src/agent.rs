//! Agent definitions.
//!
//! An [`Agent`] is immutable configuration: model reference, instructions,
//! tools, optional subagents, routing and policy hooks, and fail-safe
//! limits. Agents are frozen after construction — runtime state lives on
//! runs, never on agents.
//!
//! # Example
//!
//! ```rust,ignore
//! let agent = Agent::builder("researcher")
//!     .transport(transport)
//!     .instructions("You are a careful researcher.")
//!     .tool(Arc::new(SearchTool))
//!     .subagent(summarizer)
//!     .build()?;
//! ```

mod builder;
mod router;

pub use builder::AgentBuilder;
pub use router::{RouterDecision, RouterInput, SubagentRouter, delegation_plan_from_metadata};

use std::sync::Arc;

use crate::failsafe::FailSafeConfig;
use crate::instructions::InstructionSource;
use crate::policy::{PolicyEngine, PolicyRole};
use crate::tool::ToolRegistry;
use crate::transport::ModelTransport;

/// Immutable agent configuration.
pub struct Agent {
    pub(crate) name: String,
    pub(crate) model: String,
    pub(crate) transport: Arc<dyn ModelTransport>,
    pub(crate) instructions: InstructionSource,
    pub(crate) tools: ToolRegistry,
    pub(crate) subagents: Vec<Arc<Agent>>,
    pub(crate) router: Option<Arc<dyn SubagentRouter>>,
    pub(crate) policy_engine: Option<Arc<PolicyEngine>>,
    pub(crate) policy_roles: Vec<Arc<dyn PolicyRole>>,
    pub(crate) failsafe: FailSafeConfig,
    pub(crate) inherit_context_keys: Vec<String>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tools", &self.tools.len())
            .field(
                "subagents",
                &self
                    .subagents
                    .iter()
                    .map(|sub| sub.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Create a builder for an agent with the given name.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(name)
    }

    /// The agent's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The model reference passed to the transport.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The model transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ModelTransport> {
        &self.transport
    }

    /// The instruction source.
    #[must_use]
    pub fn instructions(&self) -> &InstructionSource {
        &self.instructions
    }

    /// The agent's tool registry.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Declared subagents.
    #[must_use]
    pub fn subagents(&self) -> &[Arc<Agent>] {
        &self.subagents
    }

    /// Look up a subagent by name.
    #[must_use]
    pub fn subagent(&self, name: &str) -> Option<&Arc<Agent>> {
        self.subagents.iter().find(|sub| sub.name == name)
    }

    /// The configured subagent router, if any.
    #[must_use]
    pub fn router(&self) -> Option<&Arc<dyn SubagentRouter>> {
        self.router.as_ref()
    }

    /// The agent-level policy engine, if any.
    #[must_use]
    pub fn policy_engine(&self) -> Option<&Arc<PolicyEngine>> {
        self.policy_engine.as_ref()
    }

    /// Dynamic policy roles in declaration order.
    #[must_use]
    pub fn policy_roles(&self) -> &[Arc<dyn PolicyRole>] {
        &self.policy_roles
    }

    /// Fail-safe limits and failure policies.
    #[must_use]
    pub fn failsafe(&self) -> &FailSafeConfig {
        &self.failsafe
    }

    /// Parent-context keys propagated to this agent's child runs.
    #[must_use]
    pub fn inherit_context_keys(&self) -> &[String] {
        &self.inherit_context_keys
    }
}
