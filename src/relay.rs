//! Fan-out relay from one upstream byte stream to many sinks.
//!
//! Each sink owns a bounded queue. Publishing never waits on a sink: a sink
//! whose queue is full is evicted and its stream ends, so one slow client
//! cannot stall or starve the others. Sinks only see bytes published after
//! they attached.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::trace::{describe_chunk, EventTracer};

/// Default number of chunks buffered per sink.
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Identifier of an attached sink.
pub type SinkId = u64;

struct RelayInner {
    sinks: Mutex<SinkTable>,
    next_id: AtomicU64,
    capacity: usize,
    tracer: EventTracer,
}

#[derive(Default)]
struct SinkTable {
    senders: HashMap<SinkId, mpsc::Sender<Bytes>>,
    closed: bool,
}

/// One upstream, many independent downstream sinks.
#[derive(Clone)]
pub struct FanOutRelay {
    inner: Arc<RelayInner>,
}

impl std::fmt::Debug for FanOutRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutRelay")
            .field("sinks", &self.sink_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FanOutRelay {
    /// Create a relay whose sinks each buffer up to `capacity` chunks.
    #[must_use]
    pub fn new(capacity: usize, tracer: EventTracer) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                sinks: Mutex::new(SinkTable::default()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                tracer,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, SinkTable> {
        // A poisoned table only means a publisher panicked mid-loop; the map
        // itself is still consistent.
        self.inner
            .sinks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a new sink. It receives every chunk published from now on.
    ///
    /// Attaching to a closed relay yields a sink that ends immediately.
    #[must_use]
    pub fn attach(&self) -> RelaySink {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let mut table = self.table();
        if !table.closed {
            table.senders.insert(id, tx);
        }
        let count = table.senders.len();
        drop(table);

        tracing::debug!(sink = id, sinks = count, "Relay sink attached");
        self.inner.tracer.record("relay", "attach", format_args!("sink={id}"));
        RelaySink { id, rx }
    }

    /// Stop delivering to `id`. Returns `false` if it was not attached.
    pub fn detach(&self, id: SinkId) -> bool {
        let removed = self.table().senders.remove(&id).is_some();
        if removed {
            tracing::debug!(sink = id, "Relay sink detached");
            self.inner.tracer.record("relay", "detach", format_args!("sink={id}"));
        }
        removed
    }

    /// Deliver `chunk` to every attached sink.
    ///
    /// Sinks that are full or whose receiver is gone are dropped. Returns the
    /// number of sinks the chunk was queued for.
    pub fn publish(&self, chunk: Bytes) -> usize {
        self.inner
            .tracer
            .record("relay", "data", describe_chunk(&chunk));

        let mut table = self.table();
        if table.closed {
            return 0;
        }

        let mut delivered = 0;
        table.senders.retain(|id, tx| match tx.try_send(chunk.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(sink = *id, "Relay sink lagging, evicting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(sink = *id, "Relay sink receiver gone");
                false
            }
        });
        delivered
    }

    /// End the upstream. Every sink sees end-of-stream once drained.
    ///
    /// Returns `false` if the relay was already closed.
    pub fn close(&self) -> bool {
        let mut table = self.table();
        if table.closed {
            return false;
        }
        table.closed = true;
        let sinks = table.senders.len();
        table.senders.clear();
        drop(table);

        tracing::debug!(sinks, "Relay closed");
        self.inner.tracer.record("relay", "end", format_args!("sinks={sinks}"));
        true
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.table().closed
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.table().senders.len()
    }

    /// Drive the relay from `source` until it ends, then close it.
    ///
    /// If the relay is still open when the source ends, the upstream finished
    /// on its own; that is logged as an unexpected end.
    pub fn spawn_pump<S>(&self, mut source: S) -> JoinHandle<()>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static,
    {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(chunk) = source.next().await {
                match chunk {
                    Ok(chunk) => {
                        relay.publish(chunk);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Relay upstream read failed");
                        break;
                    }
                }
            }

            if relay.close() {
                tracing::warn!("Relay upstream ended unexpectedly");
            }
        })
    }
}

/// Receiving end of one relay attachment.
#[derive(Debug)]
pub struct RelaySink {
    id: SinkId,
    rx: mpsc::Receiver<Bytes>,
}

impl RelaySink {
    #[must_use]
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Receive the next chunk, or `None` at end-of-stream.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for RelaySink {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
