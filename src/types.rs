//! Core data model: session identity, message history, in-flight turn
//! state, the chunk types streamed to a consumer, and the configuration
//! handed to a process generation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chunk::ChunkSender;
use crate::error::RunnerError;

/// Return the current UTC time as an ISO 8601 string.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Ordered conversation transcript. Appended to on user send and on a
/// completed assistant result; read by cloning a snapshot.
#[derive(Debug, Clone, Default)]
pub struct MessageHistory {
    messages: Vec<Message>,
}

impl MessageHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(Message {
            role: Role::User,
            text: text.into(),
        });
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.messages.push(Message {
            role: Role::Assistant,
            text: text.into(),
        });
    }

    /// A copy of the transcript as it stands.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

/// Which endpoint kind an IPC broker hosts.
#[derive(Debug, Clone)]
pub enum IpcEndpointKind {
    /// Unix domain socket under a per-user temp directory.
    FilesystemSocket,
    /// Loopback TCP, reached via the container gateway hostname.
    LoopbackTcp,
}

/// Immutable configuration for one process generation. A fresh
/// `ProcessConfig` (and fresh supervisor) is built for every launch.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub session_id: String,
    pub working_dir: std::path::PathBuf,
    pub started: bool,
    pub allowed_tools: Vec<String>,
    pub ipc_endpoint: IpcEndpointDescriptor,
    pub fork_parent: Option<String>,
    pub containerized: bool,
    pub container_image: Option<String>,
    /// Path to the runtime MCP configuration file telling the agent where
    /// to find the bundled "plural" server entry.
    pub mcp_config_path: std::path::PathBuf,
    /// Identifier of the tool the agent should route permission prompts
    /// through; this crate always registers the bundled MCP server under
    /// this name.
    pub permission_prompt_tool: String,
}

/// A concrete, resolved IPC endpoint a launched process can be told about.
#[derive(Debug, Clone)]
pub enum IpcEndpointDescriptor {
    Socket(std::path::PathBuf),
    Tcp { host: String, port: u16 },
}

/// Per-model token/cost breakdown reported in a result message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
}

/// Snapshot of usage/cost/timing statistics, emitted as a `ResponseChunk`
/// once a turn's final totals are known.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StreamStats {
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
    pub per_model: HashMap<String, ModelUsage>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
}

/// One item of a `TodoWrite` tool call, re-parsed out of its raw JSON input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TodoItem {
    pub content: String,
    pub status: String,
}

/// Best-effort summary of a tool result, used to give the consumer a short
/// human-readable description without re-deriving it from raw tool input.
/// Parsing is best-effort by design (see the open question on
/// `tool_use_result` shape): anything unrecognised becomes `Raw`, and a
/// wholly absent sibling becomes no summary at all rather than an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResultSummary {
    ReadRange {
        path: String,
        start_line: u64,
        end_line: u64,
    },
    GlobCount {
        count: u64,
    },
    ShellExit {
        code: i32,
    },
    Applied,
    Raw(String),
}

/// One tagged value streamed to the UI consumer. A `Done` or `Error` chunk
/// is always the final chunk on a channel.
#[derive(Debug, Clone)]
pub enum ResponseChunk {
    Text {
        content: String,
    },
    ToolUse {
        name: String,
        input_description: String,
        use_id: String,
    },
    ToolResult {
        use_id: String,
        summary: Option<ToolResultSummary>,
    },
    TodoUpdate {
        items: Vec<TodoItem>,
    },
    StreamStats(StreamStats),
    SubagentStatus {
        model: Option<String>,
    },
    PermissionDenials {
        denials: Vec<String>,
    },
    Done,
    Error {
        err: RunnerError,
    },
}

/// Cumulative-output-token bookkeeping across possibly several API calls
/// within one turn. The agent reports output tokens cumulatively within
/// one API call, resetting the counter whenever the message id changes;
/// this tracks a running total that never goes backwards.
#[derive(Debug, Clone, Default)]
pub struct TokenAccumulator {
    accumulated_completed: u64,
    last_message_id: Option<String>,
    last_cumulative: u64,
}

impl TokenAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cumulative-output-tokens observation for `message_id`.
    /// Returns the new running total.
    pub fn observe(&mut self, message_id: &str, cumulative_output_tokens: u64) -> u64 {
        if self.last_message_id.as_deref() != Some(message_id) {
            self.accumulated_completed += self.last_cumulative;
            self.last_message_id = Some(message_id.to_string());
            self.last_cumulative = 0;
        }
        self.last_cumulative = cumulative_output_tokens;
        self.total()
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.accumulated_completed + self.last_cumulative
    }

    /// The message id the last observation was recorded against, if any.
    /// Lets a caller correlate a follow-up observation (e.g. a
    /// `message_delta` stream event) that carries no id of its own.
    #[must_use]
    pub fn current_message_id(&self) -> Option<&str> {
        self.last_message_id.as_deref()
    }
}

/// Transient state held while one user message is being answered. At most
/// one exists per session.
pub struct PendingTurn {
    pub chunks: ChunkSender,
    pub accumulated_text: String,
    pub last_was_tool_use: bool,
    pub started_at: std::time::Instant,
    pub tokens: TokenAccumulator,
    pub complete: bool,
    pub active: bool,
}

impl PendingTurn {
    #[must_use]
    pub fn new(chunks: ChunkSender) -> Self {
        Self {
            chunks,
            accumulated_text: String::new(),
            last_was_tool_use: false,
            started_at: std::time::Instant::now(),
            tokens: TokenAccumulator::new(),
            complete: false,
            active: true,
        }
    }
}

/// One running (or about-to-run) session: identity, working directory,
/// history, and the authorisation/mode flags that shape how the agent is
/// launched.
pub struct Session {
    pub id: String,
    pub working_dir: std::path::PathBuf,
    pub started: bool,
    pub history: MessageHistory,
    pub allowed_tools: Vec<String>,
    pub fork_parent: Option<String>,
    pub containerized: bool,
    pub container_image: Option<String>,
    pub supervisor_mode: bool,
    pub host_tools: bool,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>, working_dir: std::path::PathBuf) -> Self {
        Self {
            id: id.into(),
            working_dir,
            started: false,
            history: MessageHistory::new(),
            allowed_tools: Vec::new(),
            fork_parent: None,
            containerized: false,
            container_image: None,
            supervisor_mode: false,
            host_tools: false,
        }
    }

    pub fn add_allowed_tool(&mut self, tool: impl Into<String>) {
        let tool = tool.into();
        if !self.allowed_tools.contains(&tool) {
            self.allowed_tools.push(tool);
        }
    }
}

/// The JSON document written to disk before the agent is launched,
/// advertising the IPC endpoint to the built-in MCP server entry the
/// agent is configured to spawn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfigFile {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpServerEntry {
    pub command: String,
    pub args: Vec<String>,
}

/// Name the bundled MCP server is registered under in the runtime config.
pub const MCP_SERVER_NAME: &str = "plural";

/// Identifier passed to the agent's `--permission-prompt-tool` flag,
/// following the `mcp__<server>__<tool>` naming the MCP host convention
/// uses to route a permission prompt to a specific server tool.
pub const PERMISSION_PROMPT_TOOL: &str = "mcp__plural__permission";

impl RuntimeConfigFile {
    /// Build the runtime config naming the built-in `"plural"` MCP server,
    /// pointed at `self_exe` and wired to the given IPC endpoint.
    #[must_use]
    pub fn for_endpoint(
        self_exe: &std::path::Path,
        endpoint: &IpcEndpointDescriptor,
        session_id: &str,
        supervisor_mode: bool,
        host_tools: bool,
    ) -> Self {
        let mut args = vec!["mcp-server".to_string()];
        match endpoint {
            IpcEndpointDescriptor::Socket(path) => {
                args.push("--socket".to_string());
                args.push(path.display().to_string());
            }
            IpcEndpointDescriptor::Tcp { host, port } => {
                args.push("--tcp".to_string());
                args.push(format!("{host}:{port}"));
                args.push("--auto-approve".to_string());
                args.push("--session-id".to_string());
                args.push(session_id.to_string());
            }
        }
        if supervisor_mode {
            args.push("--supervisor".to_string());
        }
        if host_tools {
            args.push("--host-tools".to_string());
        }

        let mut mcp_servers = HashMap::new();
        mcp_servers.insert(
            MCP_SERVER_NAME.to_string(),
            McpServerEntry {
                command: self_exe.display().to_string(),
                args,
            },
        );
        Self { mcp_servers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_accumulator_sums_across_message_ids() {
        let mut acc = TokenAccumulator::new();
        assert_eq!(acc.observe("m1", 5), 5);
        assert_eq!(acc.observe("m1", 12), 12);
        assert_eq!(acc.observe("m2", 3), 15);
        assert_eq!(acc.observe("m2", 9), 21);
    }

    #[test]
    fn token_accumulator_remembers_current_message_id() {
        let mut acc = TokenAccumulator::new();
        assert_eq!(acc.current_message_id(), None);
        acc.observe("m1", 5);
        assert_eq!(acc.current_message_id(), Some("m1"));
        acc.observe("m1", 8);
        assert_eq!(acc.current_message_id(), Some("m1"));
    }

    #[test]
    fn allowed_tools_dedupe() {
        let mut session = Session::new("s1", std::path::PathBuf::from("/tmp"));
        session.add_allowed_tool("Read");
        session.add_allowed_tool("Read");
        session.add_allowed_tool("Write");
        assert_eq!(session.allowed_tools, vec!["Read", "Write"]);
    }

    #[test]
    fn runtime_config_names_plural_server_for_socket_endpoint() {
        let endpoint = IpcEndpointDescriptor::Socket(std::path::PathBuf::from("/tmp/s1.sock"));
        let cfg = RuntimeConfigFile::for_endpoint(
            std::path::Path::new("/usr/local/bin/plural"),
            &endpoint,
            "s1",
            true,
            false,
        );
        let entry = &cfg.mcp_servers["plural"];
        assert!(entry.args.contains(&"--socket".to_string()));
        assert!(entry.args.contains(&"--supervisor".to_string()));
        assert!(!entry.args.contains(&"--host-tools".to_string()));
    }

    #[test]
    fn runtime_config_round_trips_through_json() {
        let endpoint = IpcEndpointDescriptor::Tcp {
            host: "host.containers.internal".to_string(),
            port: 4500,
        };
        let cfg = RuntimeConfigFile::for_endpoint(
            std::path::Path::new("/usr/local/bin/plural"),
            &endpoint,
            "child-1",
            false,
            true,
        );
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: RuntimeConfigFile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
    }
}
