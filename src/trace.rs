//! Optional event-tracing hook.
//!
//! When enabled, components report their lifecycle events (spawn, output
//! chunks, exit, attach/detach, state changes) as debug records under the
//! `camera_relay::events` target. When disabled every call is a no-op.

use std::fmt::Display;

/// Log target used for traced events.
pub const EVENT_TARGET: &str = "camera_relay::events";

/// Structured-logging hook injected into each component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTracer {
    enabled: bool,
}

impl EventTracer {
    /// Create a tracer, enabled or not.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// A tracer that records nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record an event emitted by `source`.
    pub fn record(&self, source: &str, event: &str, detail: impl Display) {
        if self.enabled {
            tracing::debug!(
                target: EVENT_TARGET,
                source,
                event,
                detail = %detail,
                "evspy"
            );
        }
    }
}

/// Short description of a data chunk for traced events.
#[must_use]
pub fn describe_chunk(chunk: &[u8]) -> String {
    let preview: String = String::from_utf8_lossy(&chunk[..chunk.len().min(8)])
        .chars()
        .map(|c| if c.is_control() { '.' } else { c })
        .collect();
    format!("Bytes[len={}, head={preview:?}]", chunk.len())
}
