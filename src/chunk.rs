//! Delivery of [`ResponseChunk`](crate::types::ResponseChunk)s to a UI
//! consumer.
//!
//! Built on `tokio::sync::mpsc::channel`, generalising the unbounded
//! emitter/receiver split used for session events: a bounded channel here
//! (buffer 100, per the turn contract) plus a close-once guard, since a
//! turn's channel has several potential closers (normal completion, fatal
//! error, start-up failure, shutdown) and must be closed by exactly one
//! of them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::RunnerError;
use crate::types::ResponseChunk;

/// Buffer size for a turn's chunk channel.
pub const CHUNK_BUFFER: usize = 100;

/// How long a single send may block before we give up on a stalled
/// consumer and report a timeout instead of hanging the reader task.
pub const CHUNK_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a fresh chunk channel for one turn.
#[must_use]
pub fn turn_channel() -> (ChunkSender, mpsc::Receiver<ResponseChunk>) {
    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    (
        ChunkSender {
            inner: Arc::new(Mutex::new(Some(tx))),
        },
        rx,
    )
}

/// The sending half of a turn's chunk channel, shared between the
/// supervisor's line handler and the runner's failure paths.
///
/// Closing is modelled as taking the sender out of its slot: the first
/// caller to `close_with` gets `Some` and performs the close; every
/// later caller (or a racing concurrent caller) gets `None` and is a
/// no-op. This is the close-once guard in channel form.
#[derive(Clone)]
pub struct ChunkSender {
    inner: Arc<Mutex<Option<mpsc::Sender<ResponseChunk>>>>,
}

impl ChunkSender {
    /// Send a non-terminal chunk, bounded by [`CHUNK_SEND_TIMEOUT`].
    ///
    /// Returns `Ok(())` if the channel is already closed (nobody is
    /// listening any more, which is not itself an error) or if the send
    /// completed. Returns `Err(RunnerError::Timeout)` only if the consumer
    /// is alive but not draining the channel quickly enough.
    pub async fn send(&self, chunk: ResponseChunk) -> Result<(), RunnerError> {
        let tx = { self.inner.lock().await.clone() };
        let Some(tx) = tx else {
            return Ok(());
        };
        match tokio::time::timeout(CHUNK_SEND_TIMEOUT, tx.send(chunk)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(RunnerError::Timeout {
                what: "chunk channel send".into(),
            }),
        }
    }

    /// Close the channel exactly once, sending `terminal` as the final
    /// chunk if this call is the one that wins the race.
    pub async fn close_with(&self, terminal: ResponseChunk) {
        let tx = { self.inner.lock().await.take() };
        if let Some(tx) = tx {
            let _ = tx.send(terminal).await;
        }
    }

    /// Whether this sender has already been closed.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_with_is_idempotent() {
        let (sender, mut rx) = turn_channel();
        sender.close_with(ResponseChunk::Done).await;
        sender.close_with(ResponseChunk::Done).await;
        assert!(matches!(rx.recv().await, Some(ResponseChunk::Done)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_is_silently_dropped() {
        let (sender, mut rx) = turn_channel();
        sender.close_with(ResponseChunk::Done).await;
        sender
            .send(ResponseChunk::Text {
                content: "late".into(),
            })
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(ResponseChunk::Done)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (sender, mut rx) = turn_channel();
        sender
            .send(ResponseChunk::Text {
                content: "a".into(),
            })
            .await
            .unwrap();
        sender
            .send(ResponseChunk::Text {
                content: "b".into(),
            })
            .await
            .unwrap();
        sender.close_with(ResponseChunk::Done).await;

        let mut seen = Vec::new();
        while let Some(chunk) = rx.recv().await {
            seen.push(chunk);
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[2], ResponseChunk::Done));
    }
}
