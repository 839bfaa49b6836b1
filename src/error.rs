use std::fmt;

/// The result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Error hierarchy for the agent runner.
///
/// All match arms in classification methods are exhaustive (no wildcards)
/// so that adding a new variant forces a compile-time decision.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The agent process exited before a result arrived; may still be
    /// recovered by a restart.
    #[error("agent process exited unexpectedly (code {code:?})")]
    TransientProcess { code: Option<i32> },

    /// The restart budget is exhausted, or the process failed to launch.
    #[error("agent process failed permanently: {reason}")]
    FatalProcess { reason: String },

    /// An outbound user message could not be encoded.
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The IPC endpoint could not be opened, or its accept loop faulted.
    #[error("ipc error: {0}")]
    Ipc(String),

    /// An interactive prompt or a chunk send exceeded its deadline.
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// The agent reported a logical error in its result message.
    #[error("agent reported an error: {message}")]
    AgentLogical { message: String },

    /// Filesystem or socket setup failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether this error ends the session (no further turns are possible).
    ///
    /// All arms are listed explicitly — no wildcards — so adding a new
    /// variant produces a compile error until classified.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::FatalProcess { .. } | Self::Ipc(_) | Self::Io(_) => true,
            Self::TransientProcess { .. }
            | Self::Serialization(_)
            | Self::Timeout { .. }
            | Self::AgentLogical { .. } => false,
        }
    }

    /// A short error code suitable for embedding in a `ResponseChunk::Error`.
    ///
    /// All arms are listed explicitly — no wildcards — so adding a new
    /// variant produces a compile error until classified.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientProcess { .. } => "TRANSIENT_PROCESS",
            Self::FatalProcess { .. } => "FATAL_PROCESS",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Ipc(_) => "IPC",
            Self::Timeout { .. } => "TIMEOUT",
            Self::AgentLogical { .. } => "AGENT_LOGICAL",
            Self::Io(_) => "IO",
        }
    }
}

/// Serialize `RunnerError` as a JSON object with `code` and `message` fields,
/// matching the shape a `ResponseChunk::Error` payload carries downstream.
impl serde::Serialize for RunnerError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("RunnerError", 2)?;
        s.serialize_field("code", self.code())?;
        s.serialize_field("message", &fmt::format(format_args!("{self}")))?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_is_exhaustive_and_matches_table() {
        assert!(
            RunnerError::FatalProcess {
                reason: "boom".into()
            }
            .is_fatal()
        );
        assert!(RunnerError::Ipc("accept failed".into()).is_fatal());
        assert!(!RunnerError::TransientProcess { code: Some(1) }.is_fatal());
        assert!(
            !RunnerError::AgentLogical {
                message: "bad tool call".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn serializes_as_code_and_message() {
        let err = RunnerError::Timeout {
            what: "permission prompt".into(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "TIMEOUT");
        assert!(
            value["message"]
                .as_str()
                .unwrap()
                .contains("permission prompt")
        );
    }
}
