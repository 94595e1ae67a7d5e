//! Configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture::{CommandSpec, DEFAULT_CHUNK_SIZE};
use crate::relay::DEFAULT_SINK_CAPACITY;
use crate::session::SessionConfig;
use crate::snapshot::SnapshotConfig;
use crate::trace::EventTracer;

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 8080;

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// The configured address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Capture commands and the content types they produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Content type of `/stream` responses.
    pub stream_content_type: String,
    /// Content type of successful `/still` responses.
    pub snapshot_content_type: String,
    /// Milliseconds between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
    /// Continuous video command.
    pub continuous: CommandSpec,
    /// Single still command.
    pub snapshot: CommandSpec,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stream_content_type: "video/h264".to_string(),
            snapshot_content_type: "image/jpeg".to_string(),
            terminate_grace_ms: 2000,
            continuous: CommandSpec::continuous_default(),
            snapshot: CommandSpec::snapshot_default(),
        }
    }
}

/// Fan-out buffering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Chunks buffered per stream subscriber before it is evicted.
    pub sink_capacity: usize,
    /// Read size for capture output.
    pub chunk_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            sink_capacity: DEFAULT_SINK_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Record component lifecycle events at debug level.
    pub trace_events: bool,
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub relay: RelaySettings,
}

impl RelayConfig {
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.capture.terminate_grace_ms)
    }

    #[must_use]
    pub fn tracer(&self) -> EventTracer {
        EventTracer::new(self.trace_events)
    }

    /// Settings for the shared stream session.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command: self.capture.continuous.clone(),
            sink_capacity: self.relay.sink_capacity,
            chunk_size: self.relay.chunk_size,
            terminate_grace: self.terminate_grace(),
        }
    }

    /// Settings for snapshot capture.
    #[must_use]
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            command: self.capture.snapshot.clone(),
            chunk_size: self.relay.chunk_size,
            terminate_grace: self.terminate_grace(),
        }
    }
}
