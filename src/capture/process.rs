//! Capture process spawning and control.
//!
//! A [`CaptureProcess`] wraps one camera tool invocation. Its stdout is the
//! media payload and is exposed as a byte stream; its stderr is exposed as a
//! sequence of text chunks that callers may log or turn into a response.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use super::{CaptureKind, CommandSpec};
use crate::trace::EventTracer;

/// Default read size for stdout/stderr chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Error type for process spawning operations.
#[derive(thiserror::Error, Debug)]
pub enum SpawnError {
    /// The capture binary was not found.
    #[error("Capture binary not found: {program}")]
    NotFound { program: String },
    /// Permission denied when spawning.
    #[error("Permission denied: {program}")]
    PermissionDenied { program: String },
    /// Other I/O error, including fork failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    /// Create a `SpawnError` from an I/O error, classifying common cases.
    fn from_io(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                program: program.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_string(),
            },
            _ => Self::Io(err),
        }
    }
}

/// A running capture process.
#[derive(Debug)]
pub struct CaptureProcess {
    child: Child,
    kind: CaptureKind,
    program: String,
    tracer: EventTracer,
}

impl CaptureProcess {
    /// Spawn the capture tool described by `spec`.
    ///
    /// stdin is closed, stdout and stderr are piped. The child is killed if
    /// the handle is dropped without being terminated.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` if the process fails to spawn.
    pub fn spawn(
        kind: CaptureKind,
        spec: &CommandSpec,
        tracer: EventTracer,
    ) -> Result<Self, SpawnError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.program, e))?;

        tracing::info!(kind = %kind, program = %spec.program, pid = ?child.id(), "Capture process spawned");
        tracer.record(&spec.program, "spawn", format_args!("pid={:?}", child.id()));

        Ok(Self {
            child,
            kind,
            program: spec.program.clone(),
            tracer,
        })
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take ownership of the stdout handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the stderr handle.
    ///
    /// This can only be called once; subsequent calls return `None`.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Get the process ID, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check whether the process has exited, without blocking.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.tracer
            .record(&self.program, "exit", format_args!("status={status}"));
        Ok(status)
    }

    /// Terminate the process.
    ///
    /// On Unix, sends SIGTERM first, then SIGKILL once `grace` has elapsed.
    /// On other platforms, kills immediately. Calling this on a process that
    /// already exited is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if termination fails.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<()> {
        if self.has_exited() {
            tracing::debug!(kind = %self.kind, "Capture process already exited");
            return Ok(());
        }

        #[cfg(unix)]
        let result = self.terminate_unix(grace).await;

        #[cfg(not(unix))]
        let result = {
            let _ = grace;
            self.child.kill().await
        };

        self.tracer.record(&self.program, "terminated", "");
        tracing::info!(kind = %self.kind, program = %self.program, "Capture process terminated");
        result
    }

    #[cfg(unix)]
    async fn terminate_unix(&mut self, grace: Duration) -> std::io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.id() else {
            return Ok(());
        };

        let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        let _ = kill(nix_pid, Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(pid, "Capture process ignored SIGTERM, killing");
                self.child.kill().await
            }
        }
    }
}

/// Expose a process's stdout as a stream of byte chunks.
pub fn output_stream(
    stdout: ChildStdout,
    chunk_size: usize,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + Unpin {
    ReaderStream::with_capacity(stdout, chunk_size.max(1))
}

/// Expose a process's stderr as a stream of text chunks.
///
/// Chunks are whatever the OS delivered in one read; content is not
/// interpreted, invalid UTF-8 is replaced.
pub fn diagnostic_stream(
    stderr: ChildStderr,
) -> impl Stream<Item = std::io::Result<String>> + Send + Unpin {
    ReaderStream::new(stderr).map(|chunk| chunk.map(|b| String::from_utf8_lossy(&b).into_owned()))
}
