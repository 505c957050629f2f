//! Afk is an agent orchestration runtime: a scheduler that drives
//! long-running agent conversations through tool calls, subagent
//! delegation, and human-in-the-loop interactions, with durable
//! checkpointing, at-least-once inter-agent delivery, and persistent task
//! queues feeding contract-typed workers.
//!
//! # Architecture
//!
//! ```text
//! TaskWorker (queue consumer)
//!   └── ExecutionContract dispatch
//!         ├── runner.chat.v1 → Runner (run executor)
//!         │     ├── ModelTransport  (opaque provider seam)
//!         │     ├── tool batches    (policy-gated, bounded parallelism)
//!         │     └── DelegationEngine → InternalProtocol (A2A)
//!         │           └── recursive child runs
//!         └── job.dispatch.v1 → registered JobHandlers
//!
//! Every phase boundary → CheckpointJournal; every transition → RunEvent.
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use afk::prelude::*;
//!
//! let agent = Agent::builder("assistant")
//!     .transport(transport)
//!     .instructions("You are helpful.")
//!     .build()?;
//!
//! let runner = Runner::new()?;
//! let result = runner.run(agent, Some("Hello!".into()), None, None).await?;
//! println!("{}", result.final_text);
//! ```

// Core data model
pub mod error;
pub mod message;
pub mod tool;
pub mod transport;

// Agent configuration
pub mod agent;
pub mod failsafe;
pub mod instructions;

// Policy and interaction
pub mod interaction;
pub mod policy;

// Persistence
pub mod checkpoint;
pub mod event;
pub mod memory;

// Orchestration
pub mod a2a;
pub mod delegation;
pub mod runner;

// Task queue and workers
pub mod queue;

pub mod prelude;

pub(crate) mod util;

pub use error::{Error, Result};
