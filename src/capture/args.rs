//! Command lines for the camera capture tools.

use serde::{Deserialize, Serialize};

/// Which capture flavor a process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// Unbounded H.264 stream, shared between subscribers.
    Continuous,
    /// Single JPEG still, one process per request.
    Snapshot,
}

impl CaptureKind {
    /// Short label used in logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Program and fixed argument list for one capture kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `sh -c <script>`, handy for substituting the camera in tests.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh", vec!["-c".to_string(), script.into()])
    }

    /// Default `raspivid` invocation.
    #[must_use]
    pub fn continuous_default() -> Self {
        Self::new("raspivid", VideoArgs::default().build_args())
    }

    /// Default `raspistill` invocation.
    #[must_use]
    pub fn snapshot_default() -> Self {
        Self::new("raspistill", StillArgs::default().build_args())
    }
}

/// Builder for `raspivid` arguments.
///
/// Always selects no preview, inline SPS/PPS headers, unlimited duration
/// and output to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoArgs {
    width: u32,
    height: u32,
    rotation: u16,
    fps: u32,
    bitrate: u32,
}

impl Default for VideoArgs {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            rotation: 0,
            fps: 15,
            bitrate: 1_000_000,
        }
    }
}

impl VideoArgs {
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-ih".to_string(),
            "-w".to_string(),
            self.width.to_string(),
            "-h".to_string(),
            self.height.to_string(),
            "-t".to_string(),
            "0".to_string(),
            "-rot".to_string(),
            self.rotation.to_string(),
            "-fps".to_string(),
            self.fps.to_string(),
            "-b".to_string(),
            self.bitrate.to_string(),
            "-o".to_string(),
            "-".to_string(),
        ]
    }
}

/// Builder for `raspistill` arguments.
///
/// Always selects no preview and output to stdout. The delay is at least
/// 1ms; zero would make the tool wait forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillArgs {
    width: u32,
    height: u32,
    rotation: u16,
    delay_ms: u32,
}

impl Default for StillArgs {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            rotation: 0,
            delay_ms: 1,
        }
    }
}

impl StillArgs {
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        vec![
            "-n".to_string(),
            "-w".to_string(),
            self.width.to_string(),
            "-h".to_string(),
            self.height.to_string(),
            "-t".to_string(),
            self.delay_ms.to_string(),
            "-rot".to_string(),
            self.rotation.to_string(),
            "-o".to_string(),
            "-".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_default_video_args() {
        let args = VideoArgs::default().build_args();

        assert!(args.contains(&"-n".to_string()));
        assert!(args.contains(&"-ih".to_string()));
        assert_eq!(flag_value(&args, "-w"), Some("1280"));
        assert_eq!(flag_value(&args, "-h"), Some("720"));
        assert_eq!(flag_value(&args, "-t"), Some("0"));
        assert_eq!(flag_value(&args, "-fps"), Some("15"));
        assert_eq!(flag_value(&args, "-b"), Some("1000000"));
        assert_eq!(flag_value(&args, "-o"), Some("-"));
    }

    #[test]
    fn test_default_still_args() {
        let args = StillArgs::default().build_args();

        assert!(args.contains(&"-n".to_string()));
        assert!(!args.contains(&"-ih".to_string()));
        assert_eq!(flag_value(&args, "-t"), Some("1"));
        assert_eq!(flag_value(&args, "-o"), Some("-"));
    }

    #[test]
    fn test_default_command_specs() {
        let continuous = CommandSpec::continuous_default();
        assert_eq!(continuous.program, "raspivid");
        assert_eq!(continuous.args, VideoArgs::default().build_args());

        let snapshot = CommandSpec::snapshot_default();
        assert_eq!(snapshot.program, "raspistill");
    }

    #[test]
    fn test_shell_command() {
        let spec = CommandSpec::shell("echo hi");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_capture_kind_display() {
        assert_eq!(CaptureKind::Continuous.to_string(), "continuous");
        assert_eq!(CaptureKind::Snapshot.label(), "snapshot");
    }
}
