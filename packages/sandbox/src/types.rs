// ABOUTME: Core value types for sandbox execution and desktop session tracking
// ABOUTME: Defines ExecutionResult, SandboxStatus, SessionSandboxInfo, and DesktopSandboxInfo

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exit code reported when an execution exceeds its timeout, matching the
/// convention of coreutils `timeout(1)`.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Outcome of a single command execution.
///
/// Immutable once created. Failures never propagate past the execution
/// boundary as errors; they arrive here with a non-zero exit code and
/// diagnostic text in `stderr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Captured standard output (empty string when the command produced none)
    pub stdout: String,
    /// Captured standard error (empty string when the command produced none)
    pub stderr: String,
    /// Process exit code; 124 indicates a timeout
    pub exit_code: i64,
}

impl ExecutionResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i64) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Engine or spawn failure converted to data: exit code 1, diagnostic in stderr.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new("", reason.into(), 1)
    }

    /// Synthetic timeout result: exit code 124 with a timeout marker appended
    /// to whatever stderr was captured before expiry.
    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>, timeout_secs: u64) -> Self {
        let mut stderr = stderr.into();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("Execution timed out after {} seconds", timeout_secs));
        Self::new(stdout, stderr, TIMEOUT_EXIT_CODE)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by `STDERR: <stderr>` when stderr is non-empty.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            return self.stdout.clone();
        }
        if self.stdout.is_empty() {
            return format!("STDERR: {}", self.stderr);
        }
        format!("{}\nSTDERR: {}", self.stdout, self.stderr)
    }
}

/// Desktop sandbox lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Container is being created
    Creating,
    /// Container is running and reachable
    Running,
    /// Container has stopped or disappeared
    Stopped,
    /// Creation failed
    Error,
}

/// Engine-facing result of a successful desktop container creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesktopSandboxInfo {
    /// Container ID assigned by the engine
    pub container_id: String,
    /// Web-reachable remote-desktop URL (`http://<host>:<port>/vnc.html`)
    pub vnc_url: String,
    /// Host port bound to the container's web-VNC port
    pub mapped_port: u16,
}

/// Per-session desktop sandbox record, owned exclusively by the registry.
///
/// The registry's cached status is a best-effort mirror of the engine;
/// lookups re-validate liveness against the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSandboxInfo {
    /// Opaque session identifier this sandbox is bound to
    pub session_id: String,
    /// Container ID, once creation has produced one
    pub container_id: Option<String>,
    /// Remote-desktop URL, once the port mapping is resolved
    pub vnc_url: Option<String>,
    /// Host port bound to the container's web-VNC port
    pub mapped_port: Option<u16>,
    /// Creation timestamp, used by the reaper's age policy
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status
    pub status: SandboxStatus,
}

impl SessionSandboxInfo {
    /// Placeholder written into the registry before container creation starts,
    /// so concurrent callers observe in-progress state.
    pub fn creating(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            container_id: None,
            vnc_url: None,
            mapped_port: None,
            created_at: Utc::now(),
            status: SandboxStatus::Creating,
        }
    }

    pub fn running(session_id: impl Into<String>, desktop: DesktopSandboxInfo) -> Self {
        Self {
            session_id: session_id.into(),
            container_id: Some(desktop.container_id),
            vnc_url: Some(desktop.vnc_url),
            mapped_port: Some(desktop.mapped_port),
            created_at: Utc::now(),
            status: SandboxStatus::Running,
        }
    }

    pub fn failed(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            container_id: None,
            vnc_url: None,
            mapped_port: None,
            created_at: Utc::now(),
            status: SandboxStatus::Error,
        }
    }

    /// A sandbox is available iff it is running and has a resolved URL.
    pub fn is_available(&self) -> bool {
        self.status == SandboxStatus::Running
            && self.vnc_url.as_ref().is_some_and(|url| !url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_output_stdout_only() {
        let result = ExecutionResult::new("out", "", 0);
        assert_eq!(result.combined_output(), "out");
        assert!(result.success());
    }

    #[test]
    fn combined_output_stderr_only() {
        let result = ExecutionResult::new("", "err", 1);
        assert_eq!(result.combined_output(), "STDERR: err");
        assert!(!result.success());
    }

    #[test]
    fn combined_output_both_streams() {
        let result = ExecutionResult::new("out", "err", 1);
        assert_eq!(result.combined_output(), "out\nSTDERR: err");
    }

    #[test]
    fn timed_out_appends_marker_and_uses_124() {
        let result = ExecutionResult::timed_out("partial", "warning", 5);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "partial");
        assert!(result.stderr.contains("timed out after 5 seconds"));
        assert!(result.stderr.starts_with("warning\n"));
    }

    #[test]
    fn availability_requires_running_and_url() {
        let desktop = DesktopSandboxInfo {
            container_id: "abc123".to_string(),
            vnc_url: "http://localhost:32768/vnc.html".to_string(),
            mapped_port: 32768,
        };
        let info = SessionSandboxInfo::running("s1", desktop);
        assert!(info.is_available());

        let mut stopped = info.clone();
        stopped.status = SandboxStatus::Stopped;
        assert!(!stopped.is_available());

        let mut no_url = info.clone();
        no_url.vnc_url = Some(String::new());
        assert!(!no_url.is_available());

        assert!(!SessionSandboxInfo::creating("s1").is_available());
        assert!(!SessionSandboxInfo::failed("s1").is_available());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SandboxStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&SandboxStatus::Creating).unwrap(),
            "\"creating\""
        );
    }
}
