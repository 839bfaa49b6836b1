//! A long-lived session façade over a coding-agent CLI subprocess.
//!
//! Supervises the child agent process over line-delimited JSON on stdio,
//! hosts a local IPC endpoint the agent's own MCP helper connects back to
//! for interactive prompts (permission, question, plan approval,
//! supervisor/host-tool calls), and parses the agent's streaming JSON
//! into typed [`types::ResponseChunk`]s for a UI consumer.
//!
//! Four components compose the core, in dependency order:
//! [`ipc`] (the IPC Broker), [`supervisor`] (the Process Supervisor),
//! [`parser`] (the Stream Parser), and [`session_runner`] (the public
//! façade binding the other three together).

/// Runner-wide error hierarchy.
pub mod error;

/// Core data model: session identity, message history, turn state,
/// response chunks, and process configuration.
pub mod types;

/// Environment-loadable process launch configuration.
pub mod config;

/// Bounded, close-once-guarded delivery of response chunks to a consumer.
pub mod chunk;

/// Local IPC endpoint for the agent's MCP helper process.
pub mod ipc;

/// Subprocess lifecycle: launch, restart policy, interrupt, shutdown.
pub mod supervisor;

/// Parses the agent's line-delimited JSON stream into response chunks.
pub mod parser;

/// The public session façade binding the IPC Broker, Process Supervisor,
/// and Stream Parser together.
pub mod session_runner;

pub use config::RunnerConfig;
pub use error::{RunnerError, RunnerResult};
pub use session_runner::SessionRunner;
pub use types::{Message, ResponseChunk, Role};
