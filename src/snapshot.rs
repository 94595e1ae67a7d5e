//! Single-shot still capture with cancellation-aware response staging.
//!
//! Every request gets its own capture process. Nothing is committed to the
//! client until the process has produced either its first output chunk or a
//! diagnostic, so a failing camera yields an error response instead of a
//! success header that cannot be retracted, and a client that went away
//! before any data arrived gets no image payload at all.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::capture::{
    diagnostic_stream, output_stream, CaptureKind, CaptureProcess, CommandSpec, SpawnError,
    DEFAULT_CHUNK_SIZE,
};
use crate::trace::{describe_chunk, EventTracer};

/// Chunks buffered between the capture task and the response body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Error type for snapshot capture.
#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    /// The capture process could not be started.
    #[error("Failed to start snapshot capture: {0}")]
    Spawn(#[from] SpawnError),
    /// The capture process ended without output or diagnostic.
    #[error("Snapshot capture exited without output")]
    ExitedWithoutOutput,
    /// The capture task ended without reporting an outcome.
    #[error("Snapshot capture task ended unexpectedly")]
    TaskGone,
}

/// How a snapshot request was resolved.
#[derive(Debug)]
pub enum SnapshotOutcome {
    /// Data arrived and the client was still there; the image streams out.
    Committed(SnapshotBody),
    /// The client went away before any data arrived; nothing is sent.
    Cancelled,
    /// The capture tool reported an error before producing data.
    Failed { diagnostic: String },
}

/// Per-request state transitions, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Started,
    CancelledDiscard,
    CommittedStreaming,
    Failed,
    Done,
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Started => "started",
            Self::CancelledDiscard => "cancelled-discard",
            Self::CommittedStreaming => "committed-streaming",
            Self::Failed => "failed",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Image payload of a committed snapshot: the peeked first chunk followed by
/// the rest of the process output.
#[derive(Debug)]
pub struct SnapshotBody {
    first: Option<Bytes>,
    rest: mpsc::Receiver<Bytes>,
}

impl Stream for SnapshotBody {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        self.rest.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

/// Settings for snapshot capture.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Command for the still capture process.
    pub command: CommandSpec,
    /// Read size for the process output.
    pub chunk_size: usize,
    /// Time between SIGTERM and SIGKILL when a capture is abandoned.
    pub terminate_grace: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::snapshot_default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Runs one capture process per snapshot request.
#[derive(Debug, Clone)]
pub struct SnapshotController {
    config: SnapshotConfig,
    tracer: EventTracer,
}

impl SnapshotController {
    #[must_use]
    pub fn new(config: SnapshotConfig, tracer: EventTracer) -> Self {
        Self { config, tracer }
    }

    /// Take a still.
    ///
    /// `cancel` is the connection-close signal; it may fire at any time. It
    /// is only consulted when the first output chunk arrives: cancelled by
    /// then means [`SnapshotOutcome::Cancelled`], otherwise the response is
    /// committed and cancellation no longer changes it.
    ///
    /// The capture runs on its own task, so dropping the returned future does
    /// not leave the process unattended.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotError::Spawn` if the process cannot be started and
    /// `SnapshotError::ExitedWithoutOutput` if it ends silently.
    pub async fn capture(
        &self,
        request_id: &str,
        cancel: CancellationToken,
    ) -> Result<SnapshotOutcome, SnapshotError> {
        let process = CaptureProcess::spawn(CaptureKind::Snapshot, &self.config.command, self.tracer)?;

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = SnapshotTask {
            request_id: request_id.to_string(),
            process,
            cancel,
            config: self.config.clone(),
            tracer: self.tracer,
            started: Instant::now(),
        };
        tokio::spawn(task.run(outcome_tx));

        outcome_rx.await.map_err(|_| SnapshotError::TaskGone)?
    }
}

type OutcomeSender = oneshot::Sender<Result<SnapshotOutcome, SnapshotError>>;

struct SnapshotTask {
    request_id: String,
    process: CaptureProcess,
    cancel: CancellationToken,
    config: SnapshotConfig,
    tracer: EventTracer,
    started: Instant,
}

impl SnapshotTask {
    fn transition(&self, state: SnapshotState) {
        tracing::debug!(request = %self.request_id, state = %state, "Snapshot state");
        self.tracer.record("snapshot", "state", format_args!("{} {state}", self.request_id));
    }

    async fn run(mut self, outcome_tx: OutcomeSender) {
        self.transition(SnapshotState::Started);

        let (Some(stdout), Some(stderr)) = (self.process.take_stdout(), self.process.take_stderr())
        else {
            let _ = outcome_tx.send(Err(SnapshotError::ExitedWithoutOutput));
            self.abandon().await;
            return;
        };
        let mut output = output_stream(stdout, self.config.chunk_size);
        let mut diagnostics = diagnostic_stream(stderr);
        let mut diagnostics_open = true;

        let first = loop {
            tokio::select! {
                biased;
                diag = diagnostics.next(), if diagnostics_open => match diag {
                    Some(Ok(text)) => {
                        self.fail(outcome_tx, text).await;
                        return;
                    }
                    _ => diagnostics_open = false,
                },
                chunk = output.next() => match chunk {
                    Some(Ok(chunk)) => break chunk,
                    Some(Err(e)) => {
                        tracing::warn!(request = %self.request_id, error = %e, "Snapshot output read failed");
                        break Bytes::new();
                    }
                    None => break Bytes::new(),
                },
            }
        };

        if first.is_empty() {
            // Output ended before any data: report whatever diagnostic the
            // tool left behind, if any.
            let mut text = String::new();
            while let Some(Ok(chunk)) = diagnostics.next().await {
                text.push_str(&chunk);
            }
            if text.is_empty() {
                tracing::warn!(request = %self.request_id, "Snapshot capture exited without output");
                self.transition(SnapshotState::Failed);
                let _ = outcome_tx.send(Err(SnapshotError::ExitedWithoutOutput));
                self.finish().await;
            } else {
                self.fail(outcome_tx, text).await;
            }
            return;
        }

        self.tracer.record(self.process.program(), "data", describe_chunk(&first));

        if self.cancel.is_cancelled() {
            tracing::info!(request = %self.request_id, "Snapshot cancelled by client");
            self.transition(SnapshotState::CancelledDiscard);
            let _ = outcome_tx.send(Ok(SnapshotOutcome::Cancelled));
            self.abandon().await;
            return;
        }

        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let body = SnapshotBody {
            first: Some(first),
            rest: body_rx,
        };
        if outcome_tx.send(Ok(SnapshotOutcome::Committed(body))).is_err() {
            tracing::info!(request = %self.request_id, "Snapshot requester gone before commit");
            self.transition(SnapshotState::CancelledDiscard);
            self.abandon().await;
            return;
        }
        self.transition(SnapshotState::CommittedStreaming);

        loop {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(chunk)) => {
                        if body_tx.send(chunk).await.is_err() {
                            tracing::info!(request = %self.request_id, "Snapshot client disconnected mid-stream");
                            drop(body_tx);
                            self.abandon().await;
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(request = %self.request_id, error = %e, "Snapshot output read failed");
                        break;
                    }
                    None => break,
                },
                diag = diagnostics.next(), if diagnostics_open => match diag {
                    // Already committed; the response cannot change any more.
                    Some(Ok(text)) => tracing::warn!(
                        request = %self.request_id,
                        "{}> error after commit:{}",
                        self.process.program(),
                        text.trim_end()
                    ),
                    _ => diagnostics_open = false,
                },
            }
        }

        drop(body_tx);
        self.finish().await;
    }

    async fn fail(mut self, outcome_tx: OutcomeSender, diagnostic: String) {
        tracing::warn!(
            request = %self.request_id,
            "{}> error:{}",
            self.process.program(),
            diagnostic.trim_end()
        );
        self.transition(SnapshotState::Failed);
        let _ = outcome_tx.send(Ok(SnapshotOutcome::Failed { diagnostic }));
        if let Err(e) = self.process.terminate(self.config.terminate_grace).await {
            tracing::error!(request = %self.request_id, error = %e, "Failed to terminate snapshot capture");
        }
        self.finish().await;
    }

    /// Stop the process and discard whatever it still had to say.
    async fn abandon(mut self) {
        if let Err(e) = self.process.terminate(self.config.terminate_grace).await {
            tracing::error!(request = %self.request_id, error = %e, "Failed to terminate snapshot capture");
        }
        self.finish().await;
    }

    async fn finish(mut self) {
        let status = self.process.wait().await;
        self.transition(SnapshotState::Done);
        tracing::info!(
            request = %self.request_id,
            status = ?status.ok(),
            elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Snapshot capture finished"
        );
    }
}
