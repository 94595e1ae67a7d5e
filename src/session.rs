//! Shared continuous-capture session.
//!
//! One capture process serves every stream subscriber. It is spawned by the
//! first subscribe and terminated by the last unsubscribe. Both transitions
//! happen while holding the session lock, so a subscriber can never attach to
//! a process that is being torn down: it waits for the teardown and then
//! spawns a fresh one.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::capture::{
    diagnostic_stream, output_stream, CaptureKind, CaptureProcess, CommandSpec, SpawnError,
    DEFAULT_CHUNK_SIZE,
};
use crate::relay::{FanOutRelay, RelaySink, SinkId, DEFAULT_SINK_CAPACITY};
use crate::trace::EventTracer;

/// Error type for session operations.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The continuous capture process could not be started.
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(#[from] SpawnError),
}

/// Settings for the shared session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Command for the continuous capture process.
    pub command: CommandSpec,
    /// Chunks buffered per subscriber before it is evicted.
    pub sink_capacity: usize,
    /// Read size for the process output.
    pub chunk_size: usize,
    /// Time between SIGTERM and SIGKILL on teardown.
    pub terminate_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::continuous_default(),
            sink_capacity: DEFAULT_SINK_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Snapshot of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Current subscriber count.
    pub subscribers: usize,
    /// Whether a capture process is currently owned by the session.
    pub running: bool,
    /// Identifier of the current session, if any.
    pub session_id: Option<u64>,
    /// Processes spawned over the manager's life.
    pub spawns: u64,
    /// Processes terminated over the manager's life.
    pub terminations: u64,
}

struct ActiveSession {
    id: u64,
    process: CaptureProcess,
    relay: FanOutRelay,
    pump: Option<JoinHandle<()>>,
    diagnostics: Option<JoinHandle<()>>,
    started: Instant,
}

#[derive(Default)]
struct SessionState {
    active: Option<ActiveSession>,
    subscribers: usize,
    next_id: u64,
}

/// Owner of the shared continuous-capture process.
pub struct SessionManager {
    state: Mutex<SessionState>,
    config: SessionConfig,
    tracer: EventTracer,
    spawns: AtomicU64,
    terminations: AtomicU64,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionConfig, tracer: EventTracer) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::default()),
            config,
            tracer,
            spawns: AtomicU64::new(0),
            terminations: AtomicU64::new(0),
        })
    }

    /// Join the shared stream, spawning the capture process if nobody is
    /// watching yet.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::CaptureUnavailable` if the process cannot be
    /// spawned. The caller is not counted as a subscriber in that case.
    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, SessionError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // A closed relay means the process ended on its own. Its remaining
        // subscribers are on their way out; newcomers get a fresh process.
        if state.active.as_ref().is_some_and(|a| a.relay.is_closed()) {
            if let Some(stale) = state.active.take() {
                tracing::info!(
                    session = stale.id,
                    orphaned = state.subscribers,
                    "Replacing ended stream capture"
                );
                state.subscribers = 0;
                self.teardown(stale).await;
            }
        }

        let active = match state.active.take() {
            Some(active) => active,
            None => {
                let id = state.next_id;
                let active = self.start_session(id)?;
                state.next_id += 1;
                active
            }
        };

        let sink = active.relay.attach();
        let session_id = active.id;
        state.active = Some(active);
        state.subscribers += 1;

        tracing::info!(
            session = session_id,
            sink = sink.id(),
            subscribers = state.subscribers,
            "Stream subscriber joined"
        );

        Ok(Subscription {
            manager: Arc::clone(self),
            session_id,
            sink,
            released: AtomicBool::new(false),
            opened: Instant::now(),
        })
    }

    /// Leave the shared stream. The last subscriber to leave terminates the
    /// capture process.
    ///
    /// Only the first call for a given handle has any effect; returns whether
    /// this call did.
    pub async fn unsubscribe(&self, handle: &Subscription) -> bool {
        if handle.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.release(handle.session_id, handle.sink.id(), handle.opened)
            .await
    }

    async fn release(&self, session_id: u64, sink_id: SinkId, opened: Instant) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(active) = state.active.as_ref().filter(|a| a.id == session_id) else {
            tracing::debug!(session = session_id, "Subscriber outlived its session");
            return false;
        };

        active.relay.detach(sink_id);
        state.subscribers = state.subscribers.saturating_sub(1);
        tracing::info!(
            session = session_id,
            sink = sink_id,
            subscribers = state.subscribers,
            elapsed_ms = u64::try_from(opened.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Stream subscriber left"
        );

        if state.subscribers == 0 {
            if let Some(active) = state.active.take() {
                self.teardown(active).await;
            }
        }
        true
    }

    /// Tear down the current session regardless of subscribers.
    ///
    /// Outstanding handles become inert; their streams end.
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        guard.subscribers = 0;
        if let Some(active) = guard.active.take() {
            self.teardown(active).await;
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> SessionStats {
        let state = self.state.lock().await;
        SessionStats {
            subscribers: state.subscribers,
            running: state.active.is_some(),
            session_id: state.active.as_ref().map(|a| a.id),
            spawns: self.spawns.load(Ordering::Acquire),
            terminations: self.terminations.load(Ordering::Acquire),
        }
    }

    fn start_session(&self, id: u64) -> Result<ActiveSession, SpawnError> {
        let mut process =
            CaptureProcess::spawn(CaptureKind::Continuous, &self.config.command, self.tracer)
                .inspect_err(|e| tracing::error!(error = %e, "Failed to start stream capture"))?;
        self.spawns.fetch_add(1, Ordering::AcqRel);

        let relay = FanOutRelay::new(self.config.sink_capacity, self.tracer);
        let pump = process
            .take_stdout()
            .map(|stdout| relay.spawn_pump(output_stream(stdout, self.config.chunk_size)));
        if pump.is_none() {
            relay.close();
        }

        let tracer = self.tracer;
        let program = self.config.command.program.clone();
        let diagnostics = process.take_stderr().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = diagnostic_stream(stderr);
                while let Some(Ok(text)) = lines.next().await {
                    tracing::warn!(session = id, "{program}> error:{}", text.trim_end());
                    tracer.record(&program, "stderr", &text);
                }
            })
        });

        self.tracer
            .record("session", "start", format_args!("session={id}"));
        Ok(ActiveSession {
            id,
            process,
            relay,
            pump,
            diagnostics,
            started: Instant::now(),
        })
    }

    async fn teardown(&self, mut active: ActiveSession) {
        // Close first so the pump does not report the kill as an unexpected end.
        active.relay.close();
        if let Err(e) = active.process.terminate(self.config.terminate_grace).await {
            tracing::error!(session = active.id, error = %e, "Failed to terminate stream capture");
        }
        if let Some(pump) = active.pump.take() {
            pump.abort();
        }
        if let Some(diagnostics) = active.diagnostics.take() {
            diagnostics.abort();
        }
        self.terminations.fetch_add(1, Ordering::AcqRel);

        tracing::info!(
            session = active.id,
            uptime_ms = u64::try_from(active.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Stream capture stopped"
        );
        self.tracer
            .record("session", "stop", format_args!("session={}", active.id));
    }
}

/// A client's membership in the shared session.
///
/// Yields the relayed bytes. Dropping it (for example when the HTTP response
/// body is dropped on disconnect) unsubscribes.
pub struct Subscription {
    manager: Arc<SessionManager>,
    session_id: u64,
    sink: RelaySink,
    released: AtomicBool,
    opened: Instant,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", &self.session_id)
            .field("sink", &self.sink.id())
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Subscription {
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    #[must_use]
    pub fn sink_id(&self) -> SinkId {
        self.sink.id()
    }

    /// Receive the next chunk, or `None` when the stream ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.sink.recv().await
    }
}

impl Stream for Subscription {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.sink).poll_next(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = Arc::clone(&self.manager);
        let (session_id, sink_id, opened) = (self.session_id, self.sink.id(), self.opened);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    manager.release(session_id, sink_id, opened).await;
                });
            }
            Err(_) => {
                tracing::warn!(session = session_id, "Subscription dropped outside runtime");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(script: &str) -> Arc<SessionManager> {
        SessionManager::new(
            SessionConfig {
                command: CommandSpec::shell(script),
                terminate_grace: Duration::from_millis(500),
                ..SessionConfig::default()
            },
            EventTracer::disabled(),
        )
    }

    #[tokio::test]
    async fn test_first_subscribe_spawns() {
        let manager = manager("exec sleep 30");
        assert_eq!(manager.stats().await, SessionStats::default());

        let sub = manager.subscribe().await.unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.subscribers, 1);
        assert!(stats.running);
        assert_eq!(stats.spawns, 1);
        assert_eq!(stats.session_id, Some(sub.session_id()));

        assert!(manager.unsubscribe(&sub).await);
        let stats = manager.stats().await;
        assert_eq!(stats.subscribers, 0);
        assert!(!stats.running);
        assert_eq!(stats.terminations, 1);
    }

    #[tokio::test]
    async fn test_second_subscriber_reuses_process() {
        let manager = manager("exec sleep 30");
        let a = manager.subscribe().await.unwrap();
        let b = manager.subscribe().await.unwrap();

        assert_eq!(a.session_id(), b.session_id());
        assert_ne!(a.sink_id(), b.sink_id());
        assert_eq!(manager.stats().await.spawns, 1);

        manager.unsubscribe(&a).await;
        let stats = manager.stats().await;
        assert!(stats.running);
        assert_eq!(stats.terminations, 0);

        manager.unsubscribe(&b).await;
        assert_eq!(manager.stats().await.terminations, 1);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_is_noop() {
        let manager = manager("exec sleep 30");
        let a = manager.subscribe().await.unwrap();
        let b = manager.subscribe().await.unwrap();

        assert!(manager.unsubscribe(&a).await);
        assert!(!manager.unsubscribe(&a).await);
        assert_eq!(manager.stats().await.subscribers, 1);

        drop(a);
        tokio::task::yield_now().await;
        assert_eq!(manager.stats().await.subscribers, 1);
        manager.unsubscribe(&b).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_count_untouched() {
        let manager = SessionManager::new(
            SessionConfig {
                command: CommandSpec::new("/nonexistent/raspivid", vec![]),
                ..SessionConfig::default()
            },
            EventTracer::disabled(),
        );

        let result = manager.subscribe().await;
        assert!(matches!(result, Err(SessionError::CaptureUnavailable(_))));
        assert_eq!(manager.stats().await, SessionStats::default());
    }

    #[tokio::test]
    async fn test_resubscribe_after_teardown_spawns_fresh() {
        let manager = manager("exec sleep 30");
        let first = manager.subscribe().await.unwrap();
        manager.unsubscribe(&first).await;

        let second = manager.subscribe().await.unwrap();
        assert_ne!(first.session_id(), second.session_id());
        assert_eq!(manager.stats().await.spawns, 2);
        manager.unsubscribe(&second).await;
    }

    #[tokio::test]
    async fn test_subscriber_receives_process_output() {
        let manager = manager("while true; do printf 'x'; sleep 0.05; done");
        let mut sub = manager.subscribe().await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(chunk.iter().all(|b| *b == b'x'));
        manager.unsubscribe(&sub).await;
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let manager = manager("exec sleep 30");
        let sub = manager.subscribe().await.unwrap();
        drop(sub);

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.stats().await.running {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(manager.stats().await.terminations, 1);
    }

    #[tokio::test]
    async fn test_unexpected_exit_ends_subscriber_streams() {
        let manager = manager("printf 'bye'");
        let mut sub = manager.subscribe().await.unwrap();

        let mut data = Vec::new();
        while let Some(chunk) = sub.recv().await {
            data.extend_from_slice(&chunk);
        }
        // The process is gone but no restart happens; the session lives on
        // until the subscriber leaves.
        assert!(manager.stats().await.running);
        manager.unsubscribe(&sub).await;
        assert!(!manager.stats().await.running);
    }

    #[tokio::test]
    async fn test_subscribe_after_unexpected_exit_spawns_fresh() {
        let manager = manager("printf 'bye'");
        let mut first = manager.subscribe().await.unwrap();
        while first.recv().await.is_some() {}

        // `first` is still held, so the ended session has not been released.
        let mut second = manager.subscribe().await.unwrap();
        assert_ne!(first.session_id(), second.session_id());
        let stats = manager.stats().await;
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.spawns, 2);
        assert_eq!(stats.terminations, 1);
        assert_eq!(stats.session_id, Some(second.session_id()));

        let mut data = Vec::new();
        while let Some(chunk) = second.recv().await {
            data.extend_from_slice(&chunk);
        }
        assert_eq!(data, b"bye");

        assert!(!manager.unsubscribe(&first).await);
        assert_eq!(manager.stats().await.subscribers, 1);
        assert!(manager.unsubscribe(&second).await);
        assert!(!manager.stats().await.running);
    }

    #[tokio::test]
    async fn test_shutdown_makes_handles_inert() {
        let manager = manager("exec sleep 30");
        let sub = manager.subscribe().await.unwrap();
        manager.shutdown().await;

        assert!(!manager.stats().await.running);
        assert!(!manager.unsubscribe(&sub).await);
        assert_eq!(manager.stats().await.subscribers, 0);
    }
}
