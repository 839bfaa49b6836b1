//! Process Supervisor: owns one agent subprocess generation at a time.
//!
//! Generalises the Claude CLI provider's `submit()` — spawn, pipe stdio,
//! read lines until EOF or abort, reap the child — into a long-lived
//! component that can write many messages to one running process, detect
//! an unexpected exit, and restart with a bounded attempt budget. Lines,
//! restarts, and fatal errors are reported to the owner as
//! [`SupervisorEvent`]s over a channel, following the same
//! emitter/receiver split used for session chunk delivery rather than a
//! callback-trait object.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{RunnerError, RunnerResult};
use crate::types::{IpcEndpointDescriptor, ProcessConfig};

/// Hostname by which a containerized agent reaches the host's loopback
/// IPC endpoint.
pub const CONTAINER_GATEWAY_HOST: &str = "host.containers.internal";

/// Callback consulted by the exit monitor: returns `true` if the exit
/// should be treated as restartable (the turn had not yet completed),
/// `false` if it was expected (a result already arrived, or the session
/// is shutting down).
pub type OnProcessExit = Arc<dyn Fn() -> bool + Send + Sync>;

/// Lifecycle events surfaced by a supervisor to its owner.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// One non-empty line of agent stdout.
    Line(String),
    /// The agent process exited.
    ProcessExited { code: Option<i32> },
    /// A restart attempt is about to begin, numbered from 1.
    RestartAttempt(u32),
    /// The restart budget is exhausted, or relaunch itself failed.
    FatalError(RunnerError),
    /// First reliable signal a containerized agent is live (session init
    /// seen on stdout). Fires at most once per supervisor.
    ContainerReady,
}

/// Sending half of the supervisor event channel.
#[derive(Clone)]
pub struct SupervisorEmitter {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl SupervisorEmitter {
    /// Send an event, silently discarding if the owner has stopped
    /// listening.
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.tx.send(event);
    }
}

/// Receiving half of the supervisor event channel.
pub struct SupervisorReceiver {
    rx: mpsc::UnboundedReceiver<SupervisorEvent>,
}

impl SupervisorReceiver {
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        self.rx.recv().await
    }
}

#[must_use]
pub fn event_channel() -> (SupervisorEmitter, SupervisorReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SupervisorEmitter { tx }, SupervisorReceiver { rx })
}

struct Shared {
    config: Mutex<ProcessConfig>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    emitter: SupervisorEmitter,
    on_process_exit: OnProcessExit,
    agent_binary: String,
    container_runtime: String,
    max_restarts: u32,
    restart_delay: Duration,
    interrupted: AtomicBool,
    stopped: AtomicBool,
    restart_attempts: AtomicU32,
    container_ready_reported: AtomicBool,
}

/// Owns one agent subprocess generation, restarting it in place on an
/// unexpected exit (up to `max_restarts`) and reporting everything it
/// sees back through a [`SupervisorReceiver`].
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProcessConfig,
        agent_binary: impl Into<String>,
        container_runtime: impl Into<String>,
        emitter: SupervisorEmitter,
        on_process_exit: OnProcessExit,
        max_restarts: u32,
        restart_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(config),
                child: Mutex::new(None),
                stdin: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                emitter,
                on_process_exit,
                agent_binary: agent_binary.into(),
                container_runtime: container_runtime.into(),
                max_restarts,
                restart_delay,
                interrupted: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                restart_attempts: AtomicU32::new(0),
                container_ready_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Launch the subprocess. Fails if `stop()` has already been called,
    /// or if the process itself fails to spawn.
    pub async fn start(&self) -> RunnerResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(RunnerError::FatalProcess {
                reason: "supervisor has been stopped".into(),
            });
        }
        Self::spawn_generation(&self.shared).await
    }

    async fn spawn_generation(shared: &Arc<Shared>) -> RunnerResult<()> {
        let config = shared.config.lock().await.clone();
        let (program, args) = build_command(&shared.agent_binary, &shared.container_runtime, &config);

        tracing::info!(session_id = %config.session_id, %program, "starting agent process");

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| RunnerError::FatalProcess {
            reason: format!("failed to launch {program}: {e}"),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        *shared.stdin.lock().await = stdin;
        *shared.child.lock().await = Some(child);

        let containerized = config.containerized;

        let read_shared = shared.clone();
        let read_task = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if containerized
                            && is_session_init_line(&line)
                            && !read_shared
                                .container_ready_reported
                                .swap(true, Ordering::SeqCst)
                        {
                            read_shared.emitter.emit(SupervisorEvent::ContainerReady);
                        }
                        read_shared.emitter.emit(SupervisorEvent::Line(line));
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = tokio::io::AsyncReadExt::read_to_string(
                &mut tokio::io::BufReader::new(stderr),
                &mut buf,
            )
            .await;
            if !buf.trim().is_empty() {
                tracing::debug!(stderr = %buf.trim(), "agent process stderr");
            }
        });

        let monitor_shared = shared.clone();
        let monitor_task = tokio::spawn(async move {
            let code = {
                let mut guard = monitor_shared.child.lock().await;
                match guard.as_mut() {
                    Some(child) => child.wait().await.ok().and_then(|status| status.code()),
                    None => None,
                }
            };
            Self::handle_exit(&monitor_shared, code).await;
        });

        *shared.tasks.lock().await = vec![read_task, stderr_task, monitor_task];
        Ok(())
    }

    async fn handle_exit(shared: &Arc<Shared>, code: Option<i32>) {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        shared.emitter.emit(SupervisorEvent::ProcessExited { code });

        if shared.interrupted.swap(false, Ordering::SeqCst) {
            tracing::info!("agent process exit followed an interrupt, not restarting");
            return;
        }

        if !(shared.on_process_exit)() {
            return;
        }

        let attempt = shared.restart_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > shared.max_restarts {
            shared.emitter.emit(SupervisorEvent::FatalError(
                RunnerError::FatalProcess {
                    reason: format!("exceeded {} restart attempts", shared.max_restarts),
                },
            ));
            return;
        }

        shared.emitter.emit(SupervisorEvent::RestartAttempt(attempt));
        tokio::time::sleep(shared.restart_delay).await;

        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = Self::spawn_generation(shared).await {
            shared.emitter.emit(SupervisorEvent::FatalError(err));
        }
    }

    /// Write one line to the agent's standard input, appending the
    /// trailing newline the line-delimited protocol expects.
    pub async fn write_message(&self, line: &str) -> RunnerResult<()> {
        let mut guard = self.shared.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(RunnerError::FatalProcess {
                reason: "agent process is not running".into(),
            });
        };
        let mut payload = line.as_bytes().to_vec();
        payload.push(b'\n');
        tokio::io::AsyncWriteExt::write_all(stdin, &payload)
            .await
            .map_err(RunnerError::Io)
    }

    /// Signal the process to interrupt. No-op if not running. Marks the
    /// next exit as user-initiated so it is not treated as restartable.
    pub async fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        let guard = self.shared.child.lock().await;
        let Some(child) = guard.as_ref() else {
            return;
        };
        let Some(pid) = child.id() else {
            return;
        };
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGINT);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }

    /// Idempotent full shutdown: kills the process if still alive, and
    /// waits for every background task to finish.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut guard = self.shared.child.lock().await;
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            *guard = None;
        }
        *self.shared.stdin.lock().await = None;

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().await);
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    pub async fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst) && self.shared.child.lock().await.is_some()
    }

    #[must_use]
    pub fn restart_attempts(&self) -> u32 {
        self.shared.restart_attempts.load(Ordering::SeqCst)
    }

    pub fn reset_restart_attempts(&self) {
        self.shared.restart_attempts.store(0, Ordering::SeqCst);
    }

    pub fn set_interrupted(&self, interrupted: bool) {
        self.shared.interrupted.store(interrupted, Ordering::SeqCst);
    }

    pub async fn mark_session_started(&self) {
        self.shared.config.lock().await.started = true;
    }

    pub async fn update_config(&self, config: ProcessConfig) {
        *self.shared.config.lock().await = config;
    }
}

fn is_session_init_line(line: &str) -> bool {
    serde_json::from_str::<Value>(line).is_ok_and(|v| {
        v.get("type").and_then(Value::as_str) == Some("system")
            && v.get("subtype").and_then(Value::as_str) == Some("init")
    })
}

/// Build the program and argument vector for one agent launch. Pure
/// function of `config` so the identity/resume/fork table in the launch
/// contract is directly testable without spawning anything.
#[must_use]
pub fn build_command(
    agent_binary: &str,
    container_runtime: &str,
    config: &ProcessConfig,
) -> (String, Vec<String>) {
    let agent_args = build_agent_args(config);
    if config.containerized {
        let image = config
            .container_image
            .as_deref()
            .unwrap_or("plural-agent:latest");
        let mount = config.working_dir.display().to_string();
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-i".to_string(),
            "-v".to_string(),
            format!("{mount}:{mount}"),
            "-w".to_string(),
            mount,
            image.to_string(),
            agent_binary.to_string(),
        ];
        args.extend(agent_args);
        (container_runtime.to_string(), args)
    } else {
        (agent_binary.to_string(), agent_args)
    }
}

fn build_agent_args(config: &ProcessConfig) -> Vec<String> {
    let mut args = vec![
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--include-partial-messages".to_string(),
    ];

    match (&config.fork_parent, config.started) {
        (Some(parent), false) => {
            args.push("--resume".to_string());
            args.push(parent.clone());
            args.push("--fork".to_string());
            args.push("--new-session".to_string());
            args.push(config.session_id.clone());
        }
        (_, true) => {
            args.push("--resume".to_string());
            args.push(config.session_id.clone());
        }
        (None, false) => {
            args.push("--new-session".to_string());
            args.push(config.session_id.clone());
        }
    }

    args.push("--ipc-endpoint".to_string());
    args.push(endpoint_arg(&config.ipc_endpoint));

    args.push("--mcp-config".to_string());
    args.push(config.mcp_config_path.display().to_string());

    args.push("--permission-prompt-tool".to_string());
    args.push(config.permission_prompt_tool.clone());

    for tool in &config.allowed_tools {
        args.push("--allow-tool".to_string());
        args.push(tool.clone());
    }

    args
}

fn endpoint_arg(endpoint: &IpcEndpointDescriptor) -> String {
    match endpoint {
        IpcEndpointDescriptor::Socket(path) => path.display().to_string(),
        IpcEndpointDescriptor::Tcp { host, port } => format!("{host}:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(started: bool, fork_parent: Option<&str>) -> ProcessConfig {
        ProcessConfig {
            session_id: "S1".to_string(),
            working_dir: std::path::PathBuf::from("/work"),
            started,
            allowed_tools: vec!["Read".to_string()],
            ipc_endpoint: IpcEndpointDescriptor::Socket(std::path::PathBuf::from("/tmp/s1.sock")),
            fork_parent: fork_parent.map(str::to_string),
            containerized: false,
            container_image: None,
            mcp_config_path: std::path::PathBuf::from("/tmp/s1-mcp.json"),
            permission_prompt_tool: "mcp__plural__permission".to_string(),
        }
    }

    #[test]
    fn new_session_without_fork_uses_new_session_flag() {
        let (_, args) = build_command("plural-agent", "docker", &config(false, None));
        assert!(args.windows(2).any(|w| w[0] == "--new-session" && w[1] == "S1"));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn started_session_uses_resume_without_fork_flag() {
        let (_, args) = build_command("plural-agent", "docker", &config(true, None));
        assert!(args.windows(2).any(|w| w[0] == "--resume" && w[1] == "S1"));
        assert!(!args.contains(&"--fork".to_string()));
    }

    #[test]
    fn forked_child_not_started_resumes_parent_and_forks_into_child() {
        let (_, args) = build_command("plural-agent", "docker", &config(false, Some("P")));
        assert!(args.windows(2).any(|w| w[0] == "--resume" && w[1] == "P"));
        assert!(args.contains(&"--fork".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--new-session" && w[1] == "S1"));
    }

    #[test]
    fn forked_child_after_first_result_drops_fork_flags() {
        let mut cfg = config(false, Some("P"));
        cfg.started = true;
        let (_, args) = build_command("plural-agent", "docker", &cfg);
        assert!(args.windows(2).any(|w| w[0] == "--resume" && w[1] == "S1"));
        assert!(!args.contains(&"--fork".to_string()));
    }

    #[test]
    fn containerized_session_wraps_in_container_runtime() {
        let mut cfg = config(false, None);
        cfg.containerized = true;
        cfg.container_image = Some("plural/agent:1.0".to_string());
        let (program, args) = build_command("plural-agent", "docker", &cfg);
        assert_eq!(program, "docker");
        assert_eq!(args[0], "run");
        assert!(args.contains(&"plural/agent:1.0".to_string()));
        assert!(args.contains(&"plural-agent".to_string()));
    }

    #[test]
    fn carries_mcp_config_path_and_permission_prompt_tool() {
        let (_, args) = build_command("plural-agent", "docker", &config(false, None));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--mcp-config" && w[1] == "/tmp/s1-mcp.json"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--permission-prompt-tool" && w[1] == "mcp__plural__permission"));
    }

    #[test]
    fn allow_tool_flags_are_repeated_per_tool() {
        let mut cfg = config(false, None);
        cfg.allowed_tools = vec!["Read".to_string(), "Write".to_string()];
        let (_, args) = build_command("plural-agent", "docker", &cfg);
        let count = args.iter().filter(|a| *a == "--allow-tool").count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn supervisor_rejects_start_after_stop() {
        let (emitter, _rx) = event_channel();
        let sup = Supervisor::new(
            config(false, None),
            "definitely-not-a-real-binary-xyz",
            "docker",
            emitter,
            Arc::new(|| true),
            3,
            Duration::from_millis(10),
        );
        sup.stop().await;
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::FatalProcess { .. }));
    }

    #[tokio::test]
    async fn reset_restart_attempts_zeroes_the_counter() {
        let (emitter, _rx) = event_channel();
        let sup = Supervisor::new(
            config(false, None),
            "definitely-not-a-real-binary-xyz",
            "docker",
            emitter,
            Arc::new(|| true),
            3,
            Duration::from_millis(10),
        );
        sup.shared.restart_attempts.store(2, Ordering::SeqCst);
        assert_eq!(sup.restart_attempts(), 2);
        sup.reset_restart_attempts();
        assert_eq!(sup.restart_attempts(), 0);
    }

    #[tokio::test]
    async fn write_message_fails_when_not_running() {
        let (emitter, _rx) = event_channel();
        let sup = Supervisor::new(
            config(false, None),
            "definitely-not-a-real-binary-xyz",
            "docker",
            emitter,
            Arc::new(|| true),
            3,
            Duration::from_millis(10),
        );
        let err = sup.write_message("hi").await.unwrap_err();
        assert!(matches!(err, RunnerError::FatalProcess { .. }));
    }
}
