//! IPC Broker: a local listener the helper process spawned by the agent
//! for MCP connects back to, carrying one named request/response
//! conversation per connection.
//!
//! Generalises the PTY broker's socket-path/permission/cleanup
//! conventions — stale socket removed before bind, 0600 permissions,
//! `remove_file` on shutdown — from a single long-lived Hub connection to
//! many short-lived one-request-per-connection conversations, and from
//! blocking `std::os::unix::net` plus a reader thread per connection to
//! async `tokio::net` with one task per connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{RunnerError, RunnerResult};
use crate::types::IpcEndpointDescriptor;

/// Maximum path length for a Unix domain socket (macOS kernel limit);
/// the same bound matters on any platform the broker might run on.
const MAX_SOCK_PATH: usize = 104;

/// How long the broker waits for an interactive response before writing
/// the canonical denial and closing the connection.
pub const CONVERSATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Named conversation kinds the helper process can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKind {
    Permission,
    Question,
    Plan,
    CreateChild,
    ListChildren,
    MergeChild,
    CreatePr,
    PushBranch,
    ReviewComments,
}

impl ConversationKind {
    pub const ALL: [ConversationKind; 9] = [
        Self::Permission,
        Self::Question,
        Self::Plan,
        Self::CreateChild,
        Self::ListChildren,
        Self::MergeChild,
        Self::CreatePr,
        Self::PushBranch,
        Self::ReviewComments,
    ];

    fn wire_name(self) -> &'static str {
        match self {
            Self::Permission => "permission",
            Self::Question => "question",
            Self::Plan => "plan",
            Self::CreateChild => "create_child",
            Self::ListChildren => "list_children",
            Self::MergeChild => "merge_child",
            Self::CreatePr => "create_pr",
            Self::PushBranch => "push_branch",
            Self::ReviewComments => "review_comments",
        }
    }

    fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_name() == name)
    }
}

/// One inbound conversation, handed to the owner for a decision. Dropping
/// `respond_to` without sending answers the waiting connection with the
/// canonical denial, same as an explicit timeout.
pub struct ConversationRequest {
    pub kind: ConversationKind,
    pub payload: Value,
    pub respond_to: oneshot::Sender<Value>,
}

/// The set of per-kind receivers handed to the session owner at
/// construction. Each kind's receiver can be taken out exactly once.
pub struct ConversationRegistry {
    receivers: HashMap<ConversationKind, mpsc::Receiver<ConversationRequest>>,
}

impl ConversationRegistry {
    pub fn take(&mut self, kind: ConversationKind) -> Option<mpsc::Receiver<ConversationRequest>> {
        self.receivers.remove(&kind)
    }
}

struct SharedBroker {
    senders: HashMap<ConversationKind, mpsc::Sender<ConversationRequest>>,
    closed: AtomicBool,
    shutdown: Notify,
    socket_path: Option<PathBuf>,
}

/// The running broker: an accept loop plus the conversation registry
/// handed out at construction.
pub struct Broker {
    shared: Arc<SharedBroker>,
    endpoint: IpcEndpointDescriptor,
    accept_task: Option<JoinHandle<()>>,
}

impl Broker {
    /// Open a filesystem-socket endpoint under a per-user temp directory,
    /// named after `session_id`.
    pub async fn open_socket(session_id: &str) -> RunnerResult<(Self, ConversationRegistry)> {
        let path = socket_path(session_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(RunnerError::Io)?;
        }
        let _ = tokio::fs::remove_file(&path).await;

        let listener = UnixListener::bind(&path)
            .map_err(|e| RunnerError::Ipc(format!("bind socket {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await;
        }

        let (shared, registry) = Self::new_shared(Some(path.clone()));
        let endpoint = IpcEndpointDescriptor::Socket(path);
        let accept_task = tokio::spawn(accept_loop_unix(listener, shared.clone()));

        Ok((
            Self {
                shared,
                endpoint,
                accept_task: Some(accept_task),
            },
            registry,
        ))
    }

    /// Open a loopback-TCP endpoint on an OS-assigned port, for
    /// containerized sessions that cannot share a host filesystem socket.
    pub async fn open_tcp() -> RunnerResult<(Self, ConversationRegistry)> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| RunnerError::Ipc(format!("bind loopback tcp: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| RunnerError::Ipc(format!("read bound port: {e}")))?
            .port();

        let (shared, registry) = Self::new_shared(None);
        let endpoint = IpcEndpointDescriptor::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        let accept_task = tokio::spawn(accept_loop_tcp(listener, shared.clone()));

        Ok((
            Self {
                shared,
                endpoint,
                accept_task: Some(accept_task),
            },
            registry,
        ))
    }

    fn new_shared(socket_path: Option<PathBuf>) -> (Arc<SharedBroker>, ConversationRegistry) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in ConversationKind::ALL {
            let (tx, rx) = mpsc::channel(1);
            senders.insert(kind, tx);
            receivers.insert(kind, rx);
        }
        (
            Arc::new(SharedBroker {
                senders,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                socket_path,
            }),
            ConversationRegistry { receivers },
        )
    }

    #[must_use]
    pub fn endpoint(&self) -> &IpcEndpointDescriptor {
        &self.endpoint
    }

    /// Idempotent: unblocks the accept loop, removes the socket file if
    /// any, and waits for the accept task to finish.
    pub async fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.notify_waiters();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        if let Some(path) = &self.shared.socket_path {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

fn socket_path(session_id: &str) -> RunnerResult<PathBuf> {
    let base = directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".cache").join("plural").join("ipc"))
        .unwrap_or_else(|| std::env::temp_dir().join("plural-ipc"));
    let path = base.join(format!("{session_id}.sock"));
    if path.to_string_lossy().len() > MAX_SOCK_PATH {
        return Err(RunnerError::Ipc(format!(
            "ipc socket path too long ({} > {MAX_SOCK_PATH}): {}",
            path.to_string_lossy().len(),
            path.display()
        )));
    }
    Ok(path)
}

async fn accept_loop_unix(listener: UnixListener, shared: Arc<SharedBroker>) {
    loop {
        tokio::select! {
            () = shared.shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move { handle_connection(stream, shared).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ipc broker accept failed");
                    }
                }
            }
        }
    }
}

async fn accept_loop_tcp(listener: TcpListener, shared: Arc<SharedBroker>) {
    loop {
        tokio::select! {
            () = shared.shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let shared = shared.clone();
                        tokio::spawn(async move { handle_connection(stream, shared).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ipc broker accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection<S>(stream: S, shared: Arc<SharedBroker>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let line = match lines.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(error = %e, "ipc broker read failed");
            return;
        }
    };

    let response = match dispatch(&line, &shared).await {
        Ok(value) => value,
        Err(reason) => {
            tracing::debug!(%reason, "ipc broker request rejected");
            canonical_denial(&reason)
        }
    };

    let mut payload = match serde_json::to_vec(&response) {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    payload.push(b'\n');
    let _ = write_half.write_all(&payload).await;
}

async fn dispatch(line: &str, shared: &Arc<SharedBroker>) -> Result<Value, String> {
    let request: Value = serde_json::from_str(line).map_err(|e| format!("malformed request: {e}"))?;
    let kind_name = request
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing \"kind\" field".to_string())?;
    let kind = ConversationKind::from_wire_name(kind_name)
        .ok_or_else(|| format!("unknown conversation kind {kind_name:?}"))?;
    let payload = request.get("payload").cloned().unwrap_or(Value::Null);

    let sender = shared
        .senders
        .get(&kind)
        .ok_or_else(|| format!("no handler registered for {kind_name}"))?
        .clone();

    let (respond_to, answer) = oneshot::channel();
    let conversation = ConversationRequest {
        kind,
        payload,
        respond_to,
    };

    match tokio::time::timeout(CONVERSATION_TIMEOUT, async move {
        sender
            .send(conversation)
            .await
            .map_err(|_| "owner is no longer listening".to_string())?;
        answer.await.map_err(|_| "owner dropped without responding".to_string())
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err("timed out waiting for a response".to_string()),
    }
}

fn canonical_denial(reason: &str) -> Value {
    json!({ "decision": "denied", "reason": reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip_for_every_kind() {
        for kind in ConversationKind::ALL {
            let name = kind.wire_name();
            assert_eq!(ConversationKind::from_wire_name(name), Some(kind));
        }
    }

    #[tokio::test]
    async fn unknown_kind_yields_canonical_denial() {
        let (shared, _registry) = Broker::new_shared(None);
        let result = dispatch(r#"{"kind":"not_a_real_kind","payload":{}}"#, &shared).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn socket_conversation_round_trips_a_response() {
        let (mut broker, mut registry) = Broker::open_socket("ipc-test-session").await.unwrap();
        let mut permission_rx = registry.take(ConversationKind::Permission).unwrap();

        let responder = tokio::spawn(async move {
            let req = permission_rx.recv().await.unwrap();
            assert_eq!(req.payload["tool"], "Write");
            let _ = req.respond_to.send(json!({"decision": "allow"}));
        });

        let IpcEndpointDescriptor::Socket(path) = broker.endpoint().clone() else {
            panic!("expected a socket endpoint");
        };
        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"{\"kind\":\"permission\",\"payload\":{\"tool\":\"Write\"}}\n")
            .await
            .unwrap();

        let mut reply = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut tokio::io::BufReader::new(stream), &mut reply)
            .await
            .unwrap();
        let value: Value = serde_json::from_str(reply.trim()).unwrap();
        assert_eq!(value["decision"], "allow");

        responder.await.unwrap();
        broker.close().await;
        broker.close().await; // idempotent
    }

    #[tokio::test]
    async fn dropped_responder_yields_denial_not_a_crash() {
        let (mut broker, mut registry) = Broker::open_socket("ipc-test-dropped").await.unwrap();
        let mut question_rx = registry.take(ConversationKind::Question).unwrap();

        let responder = tokio::spawn(async move {
            let req = question_rx.recv().await.unwrap();
            drop(req.respond_to);
        });

        let IpcEndpointDescriptor::Socket(path) = broker.endpoint().clone() else {
            panic!("expected a socket endpoint");
        };
        let mut stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        stream
            .write_all(b"{\"kind\":\"question\",\"payload\":{}}\n")
            .await
            .unwrap();

        let mut reply = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut tokio::io::BufReader::new(stream), &mut reply)
            .await
            .unwrap();
        let value: Value = serde_json::from_str(reply.trim()).unwrap();
        assert_eq!(value["decision"], "denied");

        responder.await.unwrap();
        broker.close().await;
    }
}
