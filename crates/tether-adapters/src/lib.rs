//! # tether-adapters
//!
//! Process-facing half of Tether.
//!
//! This crate provides:
//! - [`AgentCommand`]: argument and sanitized environment construction for
//!   one agent spawn
//! - [`SessionSupervisor`]: the session registry, per-session output pumps,
//!   permission relaying and local execution of approved tool calls
//!
//! Events leave the supervisor on an unbounded channel as
//! [`tether_proto::BoundaryEvent`] values, in the order each agent produced
//! them.

mod agent_command;
mod supervisor;

pub use agent_command::{AgentCommand, build_args, sanitized_env};
pub use supervisor::{DEFAULT_GRACE_PERIOD, SessionSnapshot, SessionSupervisor, SupervisorError};
