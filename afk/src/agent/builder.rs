//! Builder for [`Agent`] definitions.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::failsafe::FailSafeConfig;
use crate::instructions::InstructionSource;
use crate::policy::{PolicyEngine, PolicyRole};
use crate::tool::{BoxedTool, ToolRegistry};
use crate::transport::ModelTransport;

use super::{Agent, SubagentRouter};

/// Builder producing frozen [`Agent`] values.
pub struct AgentBuilder {
    name: String,
    model: Option<String>,
    transport: Option<Arc<dyn ModelTransport>>,
    instructions: InstructionSource,
    tools: ToolRegistry,
    tool_error: Option<Error>,
    subagents: Vec<Arc<Agent>>,
    router: Option<Arc<dyn SubagentRouter>>,
    policy_engine: Option<Arc<PolicyEngine>>,
    policy_roles: Vec<Arc<dyn PolicyRole>>,
    failsafe: FailSafeConfig,
    inherit_context_keys: Vec<String>,
}

impl std::fmt::Debug for AgentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBuilder")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AgentBuilder {
    /// Start a builder for an agent with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            transport: None,
            instructions: InstructionSource::default(),
            tools: ToolRegistry::new(),
            tool_error: None,
            subagents: Vec::new(),
            router: None,
            policy_engine: None,
            policy_roles: Vec::new(),
            failsafe: FailSafeConfig::default(),
            inherit_context_keys: Vec::new(),
        }
    }

    /// Set the model transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the model reference (defaults to the transport id).
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set inline instruction text.
    #[must_use]
    pub fn instructions(mut self, text: impl Into<String>) -> Self {
        self.instructions = InstructionSource::Inline(text.into());
        self
    }

    /// Load instructions from a template file rendered with the run
    /// context plus `context`.
    #[must_use]
    pub fn instructions_file(mut self, path: impl Into<PathBuf>, context: Map<String, Value>) -> Self {
        self.instructions = InstructionSource::TemplateFile {
            path: path.into(),
            context,
        };
        self
    }

    /// Load instructions from the auto-derived `UPPER_SNAKE.md` file.
    #[must_use]
    pub fn instructions_auto(mut self) -> Self {
        self.instructions = InstructionSource::Auto;
        self
    }

    /// Register a tool. Duplicate names surface at `build`.
    #[must_use]
    pub fn tool(mut self, tool: BoxedTool) -> Self {
        if self.tool_error.is_none()
            && let Err(error) = self.tools.register(tool)
        {
            self.tool_error = Some(error);
        }
        self
    }

    /// Add a subagent.
    #[must_use]
    pub fn subagent(mut self, subagent: Arc<Agent>) -> Self {
        self.subagents.push(subagent);
        self
    }

    /// Set the subagent router.
    #[must_use]
    pub fn router(mut self, router: Arc<dyn SubagentRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Set the agent-level policy engine.
    #[must_use]
    pub fn policy_engine(mut self, engine: Arc<PolicyEngine>) -> Self {
        self.policy_engine = Some(engine);
        self
    }

    /// Append a dynamic policy role.
    #[must_use]
    pub fn policy_role(mut self, role: Arc<dyn PolicyRole>) -> Self {
        self.policy_roles.push(role);
        self
    }

    /// Override the fail-safe configuration.
    #[must_use]
    pub fn failsafe(mut self, failsafe: FailSafeConfig) -> Self {
        self.failsafe = failsafe;
        self
    }

    /// Set which parent-context keys propagate to child runs.
    #[must_use]
    pub fn inherit_context_keys(mut self, keys: Vec<String>) -> Self {
        self.inherit_context_keys = keys;
        self
    }

    /// Freeze the configuration into an [`Agent`].
    pub fn build(self) -> Result<Arc<Agent>> {
        if let Some(error) = self.tool_error {
            return Err(error);
        }
        let name = self.name.trim().to_owned();
        if name.is_empty() {
            return Err(Error::configuration("agent name must be non-empty"));
        }
        let transport = self.transport.ok_or_else(|| {
            Error::configuration(format!(
                "Agent '{name}' has no transport configured. Call .transport() before build."
            ))
        })?;
        let model = self
            .model
            .unwrap_or_else(|| transport.id().to_owned());

        let mut seen = std::collections::HashSet::new();
        for subagent in &self.subagents {
            if !seen.insert(subagent.name.clone()) {
                return Err(Error::configuration(format!(
                    "duplicate subagent name '{}' on agent '{name}'",
                    subagent.name
                )));
            }
        }

        Ok(Arc::new(Agent {
            name,
            model,
            transport,
            instructions: self.instructions,
            tools: self.tools,
            subagents: self.subagents,
            router: self.router,
            policy_engine: self.policy_engine,
            policy_roles: self.policy_roles,
            failsafe: self.failsafe,
            inherit_context_keys: self.inherit_context_keys,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn build_requires_transport_and_name() {
        assert!(Agent::builder("x").build().is_err());
        assert!(
            Agent::builder("  ")
                .transport(Arc::new(MockTransport::text("hi")))
                .build()
                .is_err()
        );
        let agent = Agent::builder("writer")
            .transport(Arc::new(MockTransport::text("hi")))
            .build()
            .unwrap();
        assert_eq!(agent.name(), "writer");
        assert_eq!(agent.model(), "mock");
    }

    #[test]
    fn duplicate_subagents_are_rejected() {
        let transport: Arc<MockTransport> = Arc::new(MockTransport::text("hi"));
        let child = Agent::builder("child")
            .transport(transport.clone())
            .build()
            .unwrap();
        let twin = Agent::builder("child")
            .transport(transport.clone())
            .build()
            .unwrap();
        let result = Agent::builder("parent")
            .transport(transport)
            .subagent(child)
            .subagent(twin)
            .build();
        assert!(result.is_err());
    }
}
