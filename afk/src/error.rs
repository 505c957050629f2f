//! Error types for the afk runtime.
//!
//! One crate-level [`Error`] covers every failure domain: configuration,
//! policy, interaction, resource budgets, transport, delivery, validation,
//! and persistence. Operations that can fail return [`Result`]; policy
//! evaluation never raises — it returns a decision object instead.

use thiserror::Error;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid agent, run, or worker configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration issue.
        message: String,
    },

    /// An action was denied by policy or authorization.
    #[error("Denied by policy: {reason}")]
    PolicyDenied {
        /// Reason produced by the policy layer.
        reason: String,
    },

    /// A human interaction (approval or user input) was denied or timed out.
    #[error("Interaction '{kind}' failed: {message}")]
    Interaction {
        /// Interaction kind (`approval` or `user_input`).
        kind: String,
        /// What went wrong.
        message: String,
    },

    /// A run budget (steps, wall time, calls, cost) was exhausted.
    #[error("Budget exhausted ({resource}): {message}")]
    BudgetExhausted {
        /// Which budget ran out.
        resource: String,
        /// Human-readable detail.
        message: String,
    },

    /// Model transport failure (provider error, timeout, bad response shape).
    #[error("Transport error: {message}")]
    Transport {
        /// The underlying error message.
        message: String,
    },

    /// A capability was requested that the transport does not advertise.
    #[error("Capability '{capability}' is not supported by this transport")]
    CapabilityUnavailable {
        /// Name of the missing capability flag.
        capability: String,
    },

    /// The model-call circuit breaker is open.
    #[error("Circuit breaker open after {failures} consecutive failures")]
    CircuitOpen {
        /// Consecutive failure count that opened the breaker.
        failures: u32,
    },

    /// Delivery failed after exhausting its retry budget.
    #[error("Retry budget exhausted after {attempts} attempt(s): {message}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last error observed.
        message: String,
    },

    /// A bounded queue or scheduler refused new work.
    #[error("Back-pressure limit exceeded: {message}")]
    Backpressure {
        /// Which limit was hit.
        message: String,
    },

    /// The operation was cancelled.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The operation was interrupted.
    #[error("Operation was interrupted")]
    Interrupted,

    /// Invalid delegation graph (duplicate node, unknown target, cycle).
    #[error("Invalid delegation graph: {message}")]
    Graph {
        /// Structural problem description.
        message: String,
    },

    /// Invalid tool arguments or task payload shape.
    #[error("Invalid arguments: {message}")]
    InvalidArguments {
        /// What failed validation.
        message: String,
    },

    /// Checkpoint chain is missing or inconsistent.
    #[error("Checkpoint corruption: {message}")]
    CheckpointCorruption {
        /// Which record is missing or invalid.
        message: String,
    },

    /// Memory-store read/write failure.
    #[error("Persistence error: {message}")]
    Persistence {
        /// The underlying error message.
        message: String,
    },

    /// Instruction template failure (missing file, unresolved placeholder).
    #[error("Instruction error: {message}")]
    Instruction {
        /// Resolution or render failure description.
        message: String,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// The underlying error message.
        message: String,
    },
}

impl Error {
    /// Create a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new policy-denied error.
    #[must_use]
    pub fn policy_denied(reason: impl Into<String>) -> Self {
        Self::PolicyDenied {
            reason: reason.into(),
        }
    }

    /// Create a new interaction error.
    #[must_use]
    pub fn interaction(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Interaction {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a new budget-exhausted error.
    #[must_use]
    pub fn budget(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a new capability-unavailable error.
    #[must_use]
    pub fn capability(capability: impl Into<String>) -> Self {
        Self::CapabilityUnavailable {
            capability: capability.into(),
        }
    }

    /// Create a new back-pressure error.
    #[must_use]
    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::Backpressure {
            message: message.into(),
        }
    }

    /// Create a new delegation-graph error.
    #[must_use]
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph {
            message: message.into(),
        }
    }

    /// Create a new invalid-arguments error.
    #[must_use]
    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }

    /// Create a new checkpoint-corruption error.
    #[must_use]
    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::CheckpointCorruption {
            message: message.into(),
        }
    }

    /// Create a new persistence error.
    #[must_use]
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a new instruction error.
    #[must_use]
    pub fn instruction(message: impl Into<String>) -> Self {
        Self::Instruction {
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
