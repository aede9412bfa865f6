// ABOUTME: Command execution for agent-generated code with container and local-process backends
// ABOUTME: CodeSandbox owns one long-lived container, or falls back to local processes when disabled

use crate::config::SandboxConfig;
use crate::engine::{ContainerSpec, EngineClient};
use crate::error::Result;
use crate::types::ExecutionResult;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Seconds to wait for the keep-alive container to report running
const CONTAINER_READY_TIMEOUT_SECS: u64 = 30;

/// How long to keep draining stdout/stderr after the shell has exited.
/// Grandchildren inherit the pipe write ends; without this bound a surviving
/// background process would hold the call open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Executes a single shell command with a bounded wait.
///
/// Implementations never fail observably: engine and spawn errors are
/// converted into an [`ExecutionResult`] with a non-zero exit code, because
/// the consuming agent loop reacts to exit codes, not exceptions.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, command: &str, timeout_secs: u64) -> ExecutionResult;
}

/// Runs commands inside a long-lived container via the engine's exec API.
pub struct ContainerExecutor {
    engine: Arc<EngineClient>,
    container_id: String,
}

impl ContainerExecutor {
    pub fn new(engine: Arc<EngineClient>, container_id: String) -> Self {
        Self {
            engine,
            container_id,
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    async fn execute(&self, command: &str, timeout_secs: u64) -> ExecutionResult {
        debug!(
            "Executing in container {} (timeout: {}s): {}",
            self.container_id, timeout_secs, command
        );

        let exec = self.engine.exec_capture(&self.container_id, command);
        match tokio::time::timeout(Duration::from_secs(timeout_secs), exec).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Exec failed in container {}: {}", self.container_id, e);
                ExecutionResult::failure(format!("sandbox execution failed: {}", e))
            }
            Err(_) => {
                // Known limitation: the exec session keeps running inside the
                // container. Callers must treat a 124 as "result unknown,
                // possibly still running", not as proof of termination.
                warn!(
                    "Exec in container {} timed out after {}s",
                    self.container_id, timeout_secs
                );
                ExecutionResult::timed_out("", "", timeout_secs)
            }
        }
    }
}

/// Runs commands as local OS processes. Used when sandboxing is disabled;
/// keeps the feature usable without an engine, at the cost of isolation.
pub struct LocalProcessExecutor;

#[async_trait]
impl Executor for LocalProcessExecutor {
    async fn execute(&self, command: &str, timeout_secs: u64) -> ExecutionResult {
        debug!("Executing locally (timeout: {}s): {}", timeout_secs, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Lead a fresh process group so a timeout kill reaches background
        // grandchildren, not just the shell
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failure(format!("failed to spawn shell: {}", e)),
        };

        // Drain both pipes concurrently; a reader per stream keeps the child
        // from blocking on a full pipe buffer.
        let Some(stdout_pipe) = child.stdout.take() else {
            return ExecutionResult::failure("stdout pipe was not captured");
        };
        let Some(stderr_pipe) = child.stderr.take() else {
            return ExecutionResult::failure("stderr pipe was not captured");
        };
        let stdout_buf = Arc::new(StdMutex::new(Vec::new()));
        let stderr_buf = Arc::new(StdMutex::new(Vec::new()));
        let mut stdout_task = tokio::spawn(copy_pipe(stdout_pipe, Arc::clone(&stdout_buf)));
        let mut stderr_task = tokio::spawn(copy_pipe(stderr_pipe, Arc::clone(&stderr_buf)));

        let wait = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()).await;
        if wait.is_err() {
            kill_process_tree(&mut child).await;
        }

        // The shell is gone either way, but grandchildren may still hold the
        // pipe write ends open; the drains are bounded so they cannot.
        bounded_drain(&mut stdout_task).await;
        bounded_drain(&mut stderr_task).await;

        let stdout = take_captured(&stdout_buf);
        let stderr = take_captured(&stderr_buf);

        match wait {
            Ok(Ok(status)) => {
                ExecutionResult::new(stdout, stderr, status.code().map(i64::from).unwrap_or(1))
            }
            Ok(Err(e)) => ExecutionResult::failure(format!("failed to wait for process: {}", e)),
            Err(_) => ExecutionResult::timed_out(stdout, stderr, timeout_secs),
        }
    }
}

/// Append everything readable from `pipe` into the shared buffer, so partial
/// output survives even if this reader is aborted mid-stream.
async fn copy_pipe<R>(mut pipe: R, buf: Arc<StdMutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut guard) = buf.lock() {
                    guard.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Wait for a pipe reader to finish, aborting it after the drain grace.
async fn bounded_drain(task: &mut JoinHandle<()>) {
    tokio::select! {
        _ = &mut *task => {}
        _ = tokio::time::sleep(DRAIN_GRACE) => task.abort(),
    }
}

fn take_captured(buf: &Arc<StdMutex<Vec<u8>>>) -> String {
    let data = buf.lock().map(|guard| guard.clone()).unwrap_or_default();
    String::from_utf8_lossy(&data).into_owned()
}

/// Kill the shell's whole process group, then the shell itself as a fallback
/// for platforms without process groups.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("killpg for process group {} failed: {}", pid, e);
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill timed-out process: {}", e);
    }
}

/// Single application-lifetime execution sandbox.
///
/// With sandboxing enabled it creates one keep-alive container at
/// construction and execs every command inside it, amortizing image-pull and
/// container-start latency across the session. Construction failures are
/// fatal; there is no sandbox without a container.
pub struct CodeSandbox {
    executor: Box<dyn Executor>,
    engine: Option<Arc<EngineClient>>,
    container_id: Option<String>,
    default_timeout_secs: u64,
}

impl CodeSandbox {
    pub async fn new(config: &SandboxConfig) -> Result<Self> {
        if !config.use_sandbox {
            info!("Sandbox disabled; commands will run as local processes");
            return Ok(Self {
                executor: Box::new(LocalProcessExecutor),
                engine: None,
                container_id: None,
                default_timeout_secs: config.timeout_seconds,
            });
        }

        let engine = Arc::new(EngineClient::connect().await?);
        engine.pull_image_if_needed(&config.image).await?;

        let memory_bytes = EngineClient::parse_memory_limit(&config.memory_limit)?;
        let spec = ContainerSpec {
            image: config.image.clone(),
            working_dir: Some(config.work_dir.clone()),
            // Keeps the container alive indefinitely between execs
            command: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            memory_bytes: Some(memory_bytes),
            cpu_cores: Some(config.cpu_limit),
            network_mode: if config.network_enabled {
                "bridge".to_string()
            } else {
                "none".to_string()
            },
            auto_remove: true,
            ..Default::default()
        };

        let container_id = engine.create_container(&spec).await?;
        engine.start_container(&container_id).await?;
        engine
            .wait_for_container_ready(&container_id, CONTAINER_READY_TIMEOUT_SECS)
            .await;

        info!(
            "Code sandbox ready in container {} (image: {})",
            container_id, config.image
        );

        Ok(Self {
            executor: Box::new(ContainerExecutor::new(
                Arc::clone(&engine),
                container_id.clone(),
            )),
            engine: Some(engine),
            container_id: Some(container_id),
            default_timeout_secs: config.timeout_seconds,
        })
    }

    /// Run a shell command, bounded by `timeout_secs`. Never fails; timeouts
    /// surface as exit code 124 with a marker in stderr, and on the container
    /// path the in-container process may still be running afterwards.
    pub async fn execute_command(&self, command: &str, timeout_secs: u64) -> ExecutionResult {
        self.executor.execute(command, timeout_secs).await
    }

    /// `execute_command` with the configured default timeout.
    pub async fn execute(&self, command: &str) -> ExecutionResult {
        self.execute_command(command, self.default_timeout_secs).await
    }

    pub async fn execute_bash(&self, script: &str, timeout_secs: u64) -> ExecutionResult {
        self.execute_command(script, timeout_secs).await
    }

    /// Run a Python script via `python3 -c`, shell-escaped for safe embedding.
    pub async fn execute_python(&self, script: &str, timeout_secs: u64) -> ExecutionResult {
        let command = format!("python3 -c {}", shell_quote(script));
        self.execute_command(&command, timeout_secs).await
    }

    pub fn default_timeout_secs(&self) -> u64 {
        self.default_timeout_secs
    }

    /// Stop the keep-alive container (auto-remove lets the engine reclaim it)
    /// and close the engine connection. Shutdown path; best-effort only.
    pub async fn close(&self) {
        if let Some(engine) = &self.engine {
            if let Some(container_id) = &self.container_id {
                engine.stop_container(container_id).await;
            }
            engine.close();
        }
    }
}

/// Wrap in single quotes, replacing embedded single quotes with `'"'"'`.
fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r#"'"'"'"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_plain_text() {
        assert_eq!(shell_quote("print(1)"), "'print(1)'");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("print('hi')"), r#"'print('"'"'hi'"'"')'"#);
    }

    #[tokio::test]
    async fn local_executor_captures_both_streams() {
        let result = LocalProcessExecutor
            .execute("echo out; echo err >&2; exit 3", 5)
            .await;
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn local_executor_kills_on_timeout() {
        let start = std::time::Instant::now();
        let result = LocalProcessExecutor.execute("sleep 5", 1).await;
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(result.exit_code, 124);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn local_executor_keeps_output_written_before_timeout() {
        let result = LocalProcessExecutor.execute("echo early; sleep 5", 1).await;
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.stdout, "early\n");
    }

    #[tokio::test]
    async fn timeout_kills_background_grandchildren() {
        // The backgrounded sleep inherits the pipe write ends; the group kill
        // must take it down so the call returns at the timeout, not after 10s
        let start = std::time::Instant::now();
        let result = LocalProcessExecutor
            .execute("sleep 10 & echo hi; wait", 1)
            .await;
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "took {:?}",
            start.elapsed()
        );
        assert_eq!(result.exit_code, 124);
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn lingering_background_process_does_not_hold_the_call_open() {
        // Shell exits immediately; the orphaned sleep still holds stdout open.
        // The bounded drain returns what was captured instead of blocking.
        let start = std::time::Instant::now();
        let result = LocalProcessExecutor.execute("sleep 10 & echo hi", 5).await;
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "took {:?}",
            start.elapsed()
        );
        assert!(result.success());
        assert_eq!(result.stdout, "hi\n");
    }
}
