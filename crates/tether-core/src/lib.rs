//! # tether-core
//!
//! The protocol engine behind the Tether session supervisor.
//!
//! This crate provides:
//! - Line framing and decoding of the agent's stream-json output
//! - Correlation of tool invocations with their results
//! - Permission-denial detection and the per-session mediation state machine
//! - Local execution of approved tool calls
//! - Configuration loading and resume-id storage
//!
//! Nothing here owns a process. The async supervisor in `tether-adapters`
//! drives these pieces from the agent's output.

pub mod claude_stream;
pub mod config;
pub mod denial;
pub mod executor;
pub mod line_framer;
pub mod mediator;
pub mod resume_store;
mod text;
pub mod tracker;

pub use claude_stream::{
    AssistantBlock, DecodedEvent, EventKind, ProtocolEvent, UserBlock, decode, user_turn,
    user_turn_line,
};
pub use config::{
    AgentConfig, ConfigError, DEFAULT_CONFIG_FILE, ExecutorConfig, PermissionsConfig, StoreConfig,
    TetherConfig,
};
pub use denial::{DEFAULT_DENIAL_PHRASES, DenialDetector, PhraseDenialDetector};
pub use executor::{ExecutionContext, LocalToolExecutor, ToolError, approved_report, denied_report};
pub use line_framer::{LineFramer, split_lines};
pub use mediator::{Approval, DenialAction, MediatorState, PermissionMediator, Resolution, Verdict};
pub use resume_store::{JsonFileResumeStore, MemoryResumeStore, ResumeEntry};
pub use text::{floor_char_boundary, lossy_bounded, truncate_with_ellipsis};
pub use tracker::{ToolInvocation, ToolUseTracker};
