//! Session Runner: the public façade binding the IPC Broker, the Process
//! Supervisor, and the Stream Parser into one session.
//!
//! This is the component a UI consumer actually holds. Everything else
//! in this crate exists to make `send()` able to return a channel of
//! [`ResponseChunk`]s and have it filled in by a background task driven
//! off the supervisor's line events.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::chunk::{self, ChunkSender};
use crate::error::{RunnerError, RunnerResult};
use crate::ipc::{self, ConversationKind, ConversationRequest};
use crate::parser;
use crate::supervisor::{self, OnProcessExit, Supervisor};
use crate::types::{
    Message, PendingTurn, ProcessConfig, ResponseChunk, RuntimeConfigFile, Session, StreamStats,
};

struct ConversationChannel {
    payload_rx: Option<mpsc::Receiver<Value>>,
    pending_respond_to: Arc<Mutex<Option<oneshot::Sender<Value>>>>,
    forwarder: JoinHandle<()>,
}

fn spawn_conversation_channel(mut request_rx: mpsc::Receiver<ConversationRequest>) -> ConversationChannel {
    let (payload_tx, payload_rx) = mpsc::channel(1);
    let pending_respond_to = Arc::new(Mutex::new(None));
    let slot = pending_respond_to.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            *slot.lock().await = Some(request.respond_to);
            if payload_tx.send(request.payload).await.is_err() {
                break;
            }
        }
    });
    ConversationChannel {
        payload_rx: Some(payload_rx),
        pending_respond_to,
        forwarder,
    }
}

struct State {
    session: Session,
    broker: Option<ipc::Broker>,
    supervisor: Option<Supervisor>,
    pending: Option<PendingTurn>,
    conversations: HashMap<ConversationKind, ConversationChannel>,
    stopped: bool,
    /// The current turn's chunk receiver, take-once accessible through
    /// [`SessionRunner::get_response_chan`] for a consumer that did not
    /// keep `send`/`send_content`'s own return value.
    response_rx: Option<mpsc::Receiver<ResponseChunk>>,
}

struct Inner {
    state: Mutex<State>,
    self_exe: PathBuf,
    agent_binary: String,
    container_runtime: String,
    max_restarts: u32,
    restart_delay: Duration,
    /// Whether the current turn has already seen a `result` line. Read
    /// synchronously by the supervisor's exit callback, so it lives
    /// outside the async `state` mutex.
    turn_complete: Arc<AtomicBool>,
}

/// A single running (or about-to-run) agent session, and the public
/// surface a UI consumer drives it through.
#[derive(Clone)]
pub struct SessionRunner {
    inner: Arc<Inner>,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        working_dir: PathBuf,
        self_exe: PathBuf,
        agent_binary: impl Into<String>,
        container_runtime: impl Into<String>,
        max_restarts: u32,
        restart_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    session: Session::new(session_id, working_dir),
                    broker: None,
                    supervisor: None,
                    pending: None,
                    conversations: HashMap::new(),
                    stopped: false,
                    response_rx: None,
                }),
                self_exe,
                agent_binary: agent_binary.into(),
                container_runtime: container_runtime.into(),
                max_restarts,
                restart_delay,
                turn_complete: Arc::new(AtomicBool::new(true)),
            }),
        }
    }

    /// Build a runner from a loaded [`crate::config::RunnerConfig`], using
    /// its default working directory unless `working_dir` overrides it.
    #[must_use]
    pub fn with_config(
        session_id: impl Into<String>,
        working_dir: Option<PathBuf>,
        self_exe: PathBuf,
        config: &crate::config::RunnerConfig,
    ) -> Self {
        let working_dir = working_dir
            .or_else(|| config.default_working_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        Self::new(
            session_id,
            working_dir,
            self_exe,
            config.agent_binary.clone(),
            config.container_runtime.clone(),
            config.max_restarts,
            config.restart_delay(),
        )
    }

    pub async fn set_allowed_tools(&self, tools: Vec<String>) {
        self.inner.state.lock().await.session.allowed_tools = tools;
    }

    pub async fn add_allowed_tool(&self, tool: impl Into<String>) {
        self.inner.state.lock().await.session.add_allowed_tool(tool);
    }

    pub async fn set_containerized(&self, flag: bool, image: Option<String>) {
        let mut state = self.inner.state.lock().await;
        state.session.containerized = flag;
        state.session.container_image = image;
    }

    pub async fn set_fork_from_session(&self, parent_id: Option<String>) {
        self.inner.state.lock().await.session.fork_parent = parent_id;
    }

    pub async fn set_supervisor(&self, flag: bool) {
        self.inner.state.lock().await.session.supervisor_mode = flag;
    }

    pub async fn set_host_tools(&self, flag: bool) {
        self.inner.state.lock().await.session.host_tools = flag;
    }

    /// Take the receive half of one conversation kind's payload channel.
    /// Returns `None` once already taken, or once the session is stopped.
    pub async fn request_chan(&self, kind: ConversationKind) -> Option<mpsc::Receiver<Value>> {
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return None;
        }
        state.conversations.get_mut(&kind)?.payload_rx.take()
    }

    /// Answer the most recently dequeued request of `kind`. A non-blocking,
    /// best-effort send: silently discarded if the session is stopped, no
    /// request of this kind is currently awaiting an answer, or the
    /// connection has already gone away.
    pub async fn send_response(&self, kind: ConversationKind, value: Value) {
        let state = self.inner.state.lock().await;
        if state.stopped {
            return;
        }
        let Some(channel) = state.conversations.get(&kind) else {
            return;
        };
        let slot = channel.pending_respond_to.clone();
        drop(state);
        if let Some(sender) = slot.lock().await.take() {
            let _ = sender.send(value);
        }
    }

    #[must_use]
    pub async fn get_messages(&self) -> Vec<Message> {
        self.inner.state.lock().await.session.history.snapshot()
    }

    #[must_use]
    pub async fn is_streaming(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .pending
            .as_ref()
            .is_some_and(|turn| turn.active && !turn.complete)
    }

    /// Retrieve the current turn's chunk receiver, for a consumer that
    /// did not keep the value `send`/`send_content` returned. Take-once:
    /// returns `None` if already claimed, or if no turn is in flight.
    pub async fn get_response_chan(&self) -> Option<mpsc::Receiver<ResponseChunk>> {
        self.inner.state.lock().await.response_rx.take()
    }

    /// Forward an interrupt to the running process, if any, marking the
    /// next exit as user-initiated so it is not treated as a crash.
    pub async fn interrupt(&self) -> RunnerResult<()> {
        let state = self.inner.state.lock().await;
        let Some(supervisor) = &state.supervisor else {
            return Err(RunnerError::FatalProcess {
                reason: "no agent process is running".into(),
            });
        };
        supervisor.interrupt().await;
        Ok(())
    }

    /// Idempotent full shutdown: stops the process, closes the broker,
    /// aborts conversation forwarders, and closes any open turn.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return;
        }
        state.stopped = true;
        let session_id = state.session.id.clone();

        if let Some(supervisor) = state.supervisor.take() {
            supervisor.stop().await;
        }
        if let Some(mut broker) = state.broker.take() {
            broker.close().await;
        }
        for (_, channel) in state.conversations.drain() {
            channel.forwarder.abort();
        }
        let turn = state.pending.take();
        drop(state);

        if let Some(turn) = turn {
            turn.chunks.close_with(ResponseChunk::Done).await;
        }
        let _ = tokio::fs::remove_file(runtime_config_path(&session_id)).await;
    }

    /// Send one user message, starting (or resuming) the agent process as
    /// needed. Returns a receiver of this turn's chunks.
    pub async fn send(&self, text: impl Into<String>) -> RunnerResult<mpsc::Receiver<ResponseChunk>> {
        self.send_content(text.into()).await
    }

    /// Send content assembled from several blocks, joined as paragraphs.
    /// A convenience wrapper: this crate's message model keeps turn text
    /// as a single string rather than a structured block list.
    pub async fn send_content(&self, text: String) -> RunnerResult<mpsc::Receiver<ResponseChunk>> {
        let (chunks_tx, chunks_rx) = chunk::turn_channel();
        let mut state = self.inner.state.lock().await;
        if state.stopped {
            return Err(RunnerError::FatalProcess {
                reason: "session is stopped".into(),
            });
        }

        // 1. Append to history.
        state.session.history.push_user(text.clone());

        // 2. Ensure the broker is open.
        if state.broker.is_none() {
            let (broker, registry) = if state.session.containerized {
                ipc::Broker::open_tcp().await?
            } else {
                ipc::Broker::open_socket(&state.session.id).await?
            };
            state.broker = Some(broker);
            install_conversations(&mut state, registry);
            write_runtime_config(&self.inner, &state).await?;
        }

        // 3. Install a fresh pending turn; reset the per-turn flag the
        // supervisor's exit callback reads. The receiver is parked in
        // `response_rx` and reclaimed just below, so `get_response_chan`
        // can still hand it out if this call's return value gets dropped.
        state.pending = Some(PendingTurn::new(chunks_tx));
        state.response_rx = Some(chunks_rx);
        self.inner.turn_complete.store(false, Ordering::SeqCst);

        // 4. Ensure the supervisor is running, with a one-shot fallback
        // to a fresh session if a resume launch fails.
        self.ensure_supervisor(&mut state).await?;

        // 5. Serialise and hand off to the supervisor's stdin.
        let payload = json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        let line = serde_json::to_string(&payload)?;
        let supervisor = state.supervisor.clone().expect("supervisor ensured above");
        let chunks_rx = state.response_rx.take().expect("installed above");
        drop(state);

        // 6. Return immediately; the rest happens in the line handler.
        supervisor.write_message(&line).await?;
        Ok(chunks_rx)
    }

    async fn ensure_supervisor(&self, state: &mut State) -> RunnerResult<()> {
        if state.supervisor.is_none() {
            return self.spawn_new_supervisor(state).await;
        }
        let supervisor = state.supervisor.clone().expect("checked is_some above");
        if supervisor.is_running().await {
            return Ok(());
        }
        match supervisor.start().await {
            Ok(()) => Ok(()),
            Err(err) if state.session.started => {
                tracing::warn!(error = %err, "resume launch failed, falling back to a new session");
                state.session.started = false;
                state.session.fork_parent = None;
                self.spawn_new_supervisor(state).await
            }
            Err(err) => Err(err),
        }
    }

    async fn spawn_new_supervisor(&self, state: &mut State) -> RunnerResult<()> {
        if let Some(old) = state.supervisor.take() {
            old.stop().await;
        }

        let endpoint = state
            .broker
            .as_ref()
            .expect("broker ensured before supervisor")
            .endpoint()
            .clone();
        let config = ProcessConfig {
            session_id: state.session.id.clone(),
            working_dir: state.session.working_dir.clone(),
            started: state.session.started,
            allowed_tools: state.session.allowed_tools.clone(),
            ipc_endpoint: endpoint,
            fork_parent: state.session.fork_parent.clone(),
            containerized: state.session.containerized,
            container_image: state.session.container_image.clone(),
            mcp_config_path: runtime_config_path(&state.session.id),
            permission_prompt_tool: crate::types::PERMISSION_PROMPT_TOOL.to_string(),
        };

        let (emitter, mut receiver) = supervisor::event_channel();
        let flag = self.inner.turn_complete.clone();
        let on_process_exit: OnProcessExit = Arc::new(move || !flag.load(Ordering::SeqCst));

        let supervisor = Supervisor::new(
            config,
            self.inner.agent_binary.clone(),
            self.inner.container_runtime.clone(),
            emitter,
            on_process_exit,
            self.inner.max_restarts,
            self.inner.restart_delay,
        );
        supervisor.start().await?;
        state.supervisor = Some(supervisor);

        let driver_inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handle_supervisor_event(&driver_inner, event).await;
            }
        });

        Ok(())
    }
}

async fn handle_supervisor_event(inner: &Arc<Inner>, event: supervisor::SupervisorEvent) {
    match event {
        supervisor::SupervisorEvent::Line(line) => handle_line(inner, line).await,
        supervisor::SupervisorEvent::ProcessExited { code } => handle_process_exit(inner, code).await,
        supervisor::SupervisorEvent::RestartAttempt(attempt) => {
            tracing::info!(attempt, "restarting agent process");
        }
        supervisor::SupervisorEvent::FatalError(err) => handle_fatal(inner, err).await,
        supervisor::SupervisorEvent::ContainerReady => {
            tracing::info!("containerized agent process reported ready");
        }
    }
}

async fn handle_process_exit(inner: &Arc<Inner>, code: Option<i32>) {
    let mut state = inner.state.lock().await;
    if state.stopped {
        return;
    }
    let Some(turn) = state.pending.as_mut() else {
        return;
    };
    if turn.complete {
        return;
    }
    turn.active = false;
    tracing::warn!(?code, "agent process exited mid-turn");
}

async fn handle_fatal(inner: &Arc<Inner>, err: RunnerError) {
    inner.turn_complete.store(true, Ordering::SeqCst);
    let mut state = inner.state.lock().await;
    let Some(turn) = state.pending.take() else {
        return;
    };
    drop(state);
    let _ = turn.chunks.send(ResponseChunk::Error { err }).await;
    turn.chunks.close_with(ResponseChunk::Done).await;
}

async fn handle_line(inner: &Arc<Inner>, line: String) {
    append_stream_log(inner, &line).await;

    let event: Option<Value> = serde_json::from_str(&line).ok();
    let line_type = event
        .as_ref()
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if line_type.as_deref() == Some("system")
        && event
            .as_ref()
            .and_then(|e| e.get("subtype"))
            .and_then(Value::as_str)
            == Some("init")
    {
        inner.state.lock().await.session.started = true;
    }

    let chunks = parser::parse_line(&line, false);
    for chunk in chunks {
        let formatted = {
            let mut state = inner.state.lock().await;
            let Some(turn) = state.pending.as_mut() else {
                return;
            };
            format_chunk(turn, chunk)
        };
        let sender = {
            let state = inner.state.lock().await;
            let Some(turn) = state.pending.as_ref() else {
                return;
            };
            turn.chunks.clone()
        };
        if let Err(err) = sender.send(formatted).await {
            let mut state = inner.state.lock().await;
            if let Some(turn) = state.pending.take() {
                drop(state);
                turn.chunks.close_with(ResponseChunk::Error { err }).await;
            }
            return;
        }
    }

    if let Some(event) = &event {
        apply_out_of_band(inner, event).await;
    }

    if line_type.as_deref() == Some("result") {
        finalize_turn(inner, event.as_ref()).await;
    }
}

fn format_chunk(turn: &mut PendingTurn, chunk: ResponseChunk) -> ResponseChunk {
    match chunk {
        ResponseChunk::Text { content } => {
            let content = if turn.last_was_tool_use && !turn.accumulated_text.is_empty() {
                format!("\n{content}")
            } else {
                content
            };
            turn.accumulated_text.push_str(&content);
            turn.last_was_tool_use = false;
            ResponseChunk::Text { content }
        }
        ResponseChunk::ToolUse {
            name,
            input_description,
            use_id,
        } => {
            turn.last_was_tool_use = true;
            ResponseChunk::ToolUse {
                name,
                input_description,
                use_id,
            }
        }
        other => other,
    }
}

async fn apply_out_of_band(inner: &Arc<Inner>, event: &Value) {
    if parser::is_subagent_message(event) {
        let model = event
            .pointer("/message/model")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(sender) = current_sender(inner).await {
            let _ = sender.send(ResponseChunk::SubagentStatus { model }).await;
        }
        return;
    }

    let Some((message_id, cumulative)) = extract_token_observation(event) else {
        return;
    };
    let total = {
        let mut state = inner.state.lock().await;
        let Some(turn) = state.pending.as_mut() else {
            return;
        };
        let Some(message_id) = message_id.or_else(|| turn.tokens.current_message_id().map(str::to_string)) else {
            return;
        };
        turn.tokens.observe(&message_id, cumulative)
    };
    if let Some(sender) = current_sender(inner).await {
        let _ = sender
            .send(ResponseChunk::StreamStats(StreamStats {
                output_tokens: total,
                ..Default::default()
            }))
            .await;
    }
}

/// Pulls a (message-id, cumulative-output-tokens) observation out of an
/// `assistant` message or a `stream_event` delta. A `message_delta` event
/// carries no id of its own, so its id half comes back `None` — the
/// caller correlates it against the turn's already-observed message id.
fn extract_token_observation(event: &Value) -> Option<(Option<String>, u64)> {
    if event.get("type").and_then(Value::as_str) == Some("stream_event") {
        let inner_event = event.get("event")?;
        return match inner_event.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                let message_id = inner_event
                    .pointer("/message/id")
                    .and_then(Value::as_str)?
                    .to_string();
                let tokens = inner_event
                    .pointer("/message/usage/output_tokens")
                    .and_then(Value::as_u64)?;
                Some((Some(message_id), tokens))
            }
            Some("message_delta") => {
                let tokens = inner_event
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)?;
                Some((None, tokens))
            }
            _ => None,
        };
    }

    let message_id = event
        .pointer("/message/id")
        .or_else(|| event.pointer("/message_id"))
        .and_then(Value::as_str)?;
    let tokens = event
        .pointer("/message/usage/output_tokens")
        .or_else(|| event.pointer("/usage/output_tokens"))
        .and_then(Value::as_u64)?;
    Some((Some(message_id.to_string()), tokens))
}

async fn current_sender(inner: &Arc<Inner>) -> Option<ChunkSender> {
    inner.state.lock().await.pending.as_ref().map(|t| t.chunks.clone())
}

async fn finalize_turn(inner: &Arc<Inner>, event: Option<&Value>) {
    inner.turn_complete.store(true, Ordering::SeqCst);

    let mut state = inner.state.lock().await;
    state.session.started = true;
    let Some(mut turn) = state.pending.take() else {
        return;
    };
    turn.complete = true;
    turn.active = false;
    let accumulated_text = std::mem::take(&mut turn.accumulated_text);
    if !accumulated_text.is_empty() {
        state.session.history.push_assistant(accumulated_text);
    }
    if let Some(supervisor) = &state.supervisor {
        supervisor.reset_restart_attempts();
    }
    drop(state);

    if let Some(denials) = event.and_then(|e| e.get("permission_denials")).and_then(Value::as_array) {
        if !denials.is_empty() {
            let denials = denials.iter().filter_map(Value::as_str).map(str::to_string).collect();
            let _ = turn.chunks.send(ResponseChunk::PermissionDenials { denials }).await;
        }
    }

    turn.chunks.close_with(ResponseChunk::Done).await;
}

async fn write_runtime_config(inner: &Inner, state: &State) -> RunnerResult<()> {
    let endpoint = state
        .broker
        .as_ref()
        .expect("broker open before writing runtime config")
        .endpoint();
    let config = RuntimeConfigFile::for_endpoint(
        &inner.self_exe,
        endpoint,
        &state.session.id,
        state.session.supervisor_mode,
        state.session.host_tools,
    );
    let path = runtime_config_path(&state.session.id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(RunnerError::Io)?;
    }
    let json = serde_json::to_vec_pretty(&config)?;
    tokio::fs::write(&path, json).await.map_err(RunnerError::Io)
}

fn install_conversations(state: &mut State, mut registry: ipc::ConversationRegistry) {
    for kind in ConversationKind::ALL {
        if let Some(rx) = registry.take(kind) {
            state.conversations.insert(kind, spawn_conversation_channel(rx));
        }
    }
}

async fn append_stream_log(inner: &Arc<Inner>, line: &str) {
    let path = {
        let state = inner.state.lock().await;
        stream_log_path(&state.session.id)
    };
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let rendered = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| line.to_string());

    if let Ok(mut file) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        let _ = file.write_all(rendered.as_bytes()).await;
        let _ = file.write_all(b"\n---\n").await;
    }
}

fn base_state_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".cache").join("plural"))
        .unwrap_or_else(|| std::env::temp_dir().join("plural"))
}

fn runtime_config_path(session_id: &str) -> PathBuf {
    base_state_dir().join("runtime").join(format!("{session_id}.json"))
}

fn stream_log_path(session_id: &str) -> PathBuf {
    base_state_dir().join("logs").join(format!("{session_id}.jsonl"))
}
