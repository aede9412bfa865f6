// ABOUTME: Container engine client wrapping all bollard interaction
// ABOUTME: Connection, image pulls, container lifecycle, port mapping, exec, and memory-limit parsing

use crate::error::{Result, SandboxError};
use crate::types::ExecutionResult;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, PortBinding},
    Docker,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Labels applied to every container this crate creates, so operators can
/// find leftovers with a single `docker ps --filter label=` query.
const MANAGED_LABEL: &str = "openmanus.managed";
const SESSION_LABEL: &str = "openmanus.session";

/// Bounded wait for image pulls
const PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period after a container reports running, for in-container services
/// to bind their ports
const READY_GRACE: Duration = Duration::from_secs(2);

/// Grace period given to a container's init process on stop before SIGKILL
const STOP_TIMEOUT_SECS: i64 = 10;

/// Description of a container to create, translated to a bollard
/// configuration in exactly one place.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    /// Engine-side container name; anonymous when `None`
    pub name: Option<String>,
    pub command: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// Memory limit in bytes
    pub memory_bytes: Option<i64>,
    /// CPU limit in cores; converted to a quota/period pair (100000 = 1 core)
    pub cpu_cores: Option<f64>,
    /// "bridge" or "none"
    pub network_mode: String,
    /// Let the engine reclaim the container once it stops
    pub auto_remove: bool,
    /// `/dev/shm` size in bytes; browser engines need this enlarged
    pub shm_size_bytes: Option<i64>,
    /// Container port to expose on a random host port
    pub exposed_port: Option<u16>,
    /// Session this container belongs to, recorded as a label
    pub session_id: Option<String>,
}

fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    if let Some(session_id) = &spec.session_id {
        labels.insert(SESSION_LABEL.to_string(), session_id.clone());
    }

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    if let Some(port) = spec.exposed_port {
        let container_port = format!("{}/tcp", port);
        exposed_ports.insert(container_port.clone(), HashMap::new());
        // Empty host port asks the engine for a random ephemeral port
        let binding = vec![PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(String::new()),
        }];
        port_bindings.insert(container_port, Some(binding));
    }

    let host_config = HostConfig {
        memory: spec.memory_bytes,
        cpu_quota: spec.cpu_cores.map(|cores| (cores * 100_000.0) as i64),
        cpu_period: spec.cpu_cores.map(|_| 100_000),
        network_mode: Some(spec.network_mode.clone()),
        auto_remove: Some(spec.auto_remove),
        shm_size: spec.shm_size_bytes,
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: spec.command.clone(),
        env: Some(env),
        working_dir: spec.working_dir.clone(),
        labels: Some(labels),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Client for the container engine.
///
/// Owns the engine connection, created once at construction and shared
/// read-only across threads. All other components reach the engine through
/// this type; bollard never leaks past it.
pub struct EngineClient {
    docker: Docker,
    closed: AtomicBool,
}

impl EngineClient {
    /// Connect to the engine over the platform-default socket and verify the
    /// connection with a liveness probe. An unreachable engine is fatal.
    pub async fn connect() -> Result<Self> {
        #[cfg(unix)]
        let docker = Docker::connect_with_socket_defaults().map_err(SandboxError::Docker)?;

        #[cfg(windows)]
        let docker = Docker::connect_with_named_pipe_defaults().map_err(SandboxError::Docker)?;

        docker.ping().await.map_err(|e| {
            error!("Failed to connect to Docker daemon: {}", e);
            SandboxError::Docker(e)
        })?;

        info!("Successfully connected to Docker daemon");
        Ok(Self {
            docker,
            closed: AtomicBool::new(false),
        })
    }

    /// Pull `image` unless it is already present locally. The pull is bounded
    /// to ten minutes; expiry or a stream error surfaces as `ImageError`.
    pub async fn pull_image_if_needed(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => {
                debug!("Image {} already exists locally", image);
                return Ok(());
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(SandboxError::ImageError(e.to_string())),
        }

        info!("Pulling image: {} (timeout: {:?})", image, PULL_TIMEOUT);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        let pull = async {
            let mut last_status = String::new();
            while let Some(result) = stream.next().await {
                let progress = result
                    .map_err(|e| SandboxError::ImageError(format!("failed to pull {}: {}", image, e)))?;
                if let Some(status) = &progress.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(error) = progress.error {
                    return Err(SandboxError::ImageError(format!(
                        "failed to pull {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        };

        match tokio::time::timeout(PULL_TIMEOUT, pull).await {
            Ok(result) => {
                result?;
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Err(_) => Err(SandboxError::ImageError(format!(
                "timeout pulling image {} after {:?}",
                image, PULL_TIMEOUT
            ))),
        }
    }

    /// Best-effort health check: any inspection failure reads as not running.
    pub async fn is_container_running(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false),
            Err(e) => {
                debug!("Inspect of container {} failed: {}", container_id, e);
                false
            }
        }
    }

    /// Poll container state at one-second granularity until it reports
    /// running, then allow a short grace period for in-container services to
    /// bind their ports. A timeout is logged, not raised; downstream callers
    /// re-validate readiness themselves.
    pub async fn wait_for_container_ready(&self, container_id: &str, timeout_secs: u64) {
        for _ in 0..timeout_secs {
            if self.is_container_running(container_id).await {
                tokio::time::sleep(READY_GRACE).await;
                debug!("Container {} is ready", container_id);
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!(
            "Container {} not running after {}s, proceeding anyway",
            container_id, timeout_secs
        );
    }

    /// Resolve the host port bound to a declared container port. A missing
    /// binding is a hard error: callers cannot build a reachable URL without it.
    pub async fn get_mapped_port(&self, container_id: &str, container_port: u16) -> Result<u16> {
        let inspect = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| match e {
                BollardError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::ContainerNotFound(container_id.to_string()),
                _ => SandboxError::Docker(e),
            })?;

        let key = format!("{}/tcp", container_port);
        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.first().cloned())
            .and_then(|binding| binding.host_port)
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| SandboxError::PortMappingNotFound {
                container_id: container_id.to_string(),
                container_port,
            })
    }

    /// Create a container from a spec. The container is not started.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        debug!("Creating container from image {}", spec.image);

        let config = to_bollard_config(spec);
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| {
                error!("Failed to create container: {}", e);
                SandboxError::ContainerStartFailed(e.to_string())
            })?;

        info!("Created container {}", response.id);
        Ok(response.id)
    }

    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                error!("Failed to start container {}: {}", container_id, e);
                SandboxError::ContainerStartFailed(e.to_string())
            })?;

        info!("Started container {}", container_id);
        Ok(())
    }

    /// Run a shell command inside a running container and capture its output.
    ///
    /// No timeout is applied here; the executor layer bounds the whole call.
    pub async fn exec_capture(&self, container_id: &str, command: &str) -> Result<ExecutionResult> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker.create_exec(container_id, exec_config).await?;
        let start_result = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                        Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                        Ok(_) => {}
                        Err(e) => return Err(SandboxError::Docker(e)),
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::ContainerStartFailed(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);

        Ok(ExecutionResult::new(
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        ))
    }

    /// Stop (bounded grace) then force-remove a container.
    ///
    /// Destruction is best-effort and idempotent: every failure is logged and
    /// swallowed so cleanup code never needs to retry or crash.
    pub async fn destroy_container(&self, container_id: &str) {
        debug!("Destroying container {}", container_id);

        let stop_options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(container_id, Some(stop_options)).await {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("Container {} already stopped", container_id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", container_id);
                return;
            }
            Err(e) => warn!("Failed to stop container {}: {}", container_id, e),
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_id, Some(remove_options))
            .await
        {
            Ok(_) => info!("Removed container {}", container_id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!("Container {} already removed", container_id),
            Err(e) => warn!("Failed to remove container {}: {}", container_id, e),
        }
    }

    /// Stop a container without removing it, for containers created with
    /// auto-remove where the engine reclaims them itself. Best-effort.
    pub async fn stop_container(&self, container_id: &str) {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(container_id, Some(options)).await {
            Ok(_) => info!("Stopped container {}", container_id),
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => debug!("Container {} already gone", container_id),
            Err(e) => warn!("Failed to stop container {}: {}", container_id, e),
        }
    }

    /// Parse a human-readable memory limit ("512m", "1g", "1024") into bytes.
    pub fn parse_memory_limit(text: &str) -> Result<i64> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SandboxError::InvalidConfiguration(
                "memory limit is empty".to_string(),
            ));
        }

        let (number, multiplier) = match text.chars().last().map(|c| c.to_ascii_lowercase()) {
            Some('k') => (&text[..text.len() - 1], 1024_i64),
            Some('m') => (&text[..text.len() - 1], 1024 * 1024),
            Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
            _ => (text, 1),
        };

        let value: i64 = number.parse().map_err(|_| {
            SandboxError::InvalidConfiguration(format!("invalid memory limit: {}", text))
        })?;
        if value < 0 {
            return Err(SandboxError::InvalidConfiguration(format!(
                "memory limit must not be negative: {}",
                text
            )));
        }

        value.checked_mul(multiplier).ok_or_else(|| {
            SandboxError::InvalidConfiguration(format!("memory limit out of range: {}", text))
        })
    }

    /// Mark the engine connection closed. Idempotent; shutdown-path code, so
    /// it logs instead of failing. The underlying handle is released on drop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Engine connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_memory_limit_suffixes() {
        assert_eq!(
            EngineClient::parse_memory_limit("512m").unwrap(),
            512 * 1024 * 1024
        );
        assert_eq!(
            EngineClient::parse_memory_limit("1g").unwrap(),
            1024 * 1024 * 1024
        );
        assert_eq!(EngineClient::parse_memory_limit("64k").unwrap(), 64 * 1024);
        assert_eq!(EngineClient::parse_memory_limit("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_memory_limit_plain_bytes() {
        assert_eq!(EngineClient::parse_memory_limit("1024").unwrap(), 1024);
    }

    #[test]
    fn parse_memory_limit_rejects_malformed_input() {
        assert!(matches!(
            EngineClient::parse_memory_limit("bad"),
            Err(SandboxError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            EngineClient::parse_memory_limit(""),
            Err(SandboxError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            EngineClient::parse_memory_limit("12x5m"),
            Err(SandboxError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn parse_memory_limit_rejects_out_of_range_values() {
        // Would overflow i64 when scaled to bytes; must fail, not wrap
        assert!(matches!(
            EngineClient::parse_memory_limit("99999999999g"),
            Err(SandboxError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            EngineClient::parse_memory_limit("-1g"),
            Err(SandboxError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn spec_translation_sets_limits_and_labels() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());

        let spec = ContainerSpec {
            image: "alpine:latest".to_string(),
            name: Some("test-container".to_string()),
            command: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            working_dir: Some("/workspace".to_string()),
            env,
            memory_bytes: Some(512 * 1024 * 1024),
            cpu_cores: Some(1.5),
            network_mode: "bridge".to_string(),
            auto_remove: true,
            shm_size_bytes: None,
            exposed_port: Some(6901),
            session_id: Some("session-1".to_string()),
        };

        let config = to_bollard_config(&spec);
        assert_eq!(config.image, Some("alpine:latest".to_string()));
        assert_eq!(config.env, Some(vec!["FOO=bar".to_string()]));

        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(150_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.auto_remove, Some(true));
        assert!(host.port_bindings.unwrap().contains_key("6901/tcp"));

        let labels = config.labels.unwrap();
        assert_eq!(labels.get("openmanus.managed"), Some(&"true".to_string()));
        assert_eq!(labels.get("openmanus.session"), Some(&"session-1".to_string()));
    }

    #[test]
    fn spec_translation_omits_ports_when_unset() {
        let spec = ContainerSpec {
            image: "alpine:latest".to_string(),
            network_mode: "none".to_string(),
            ..Default::default()
        };
        let config = to_bollard_config(&spec);
        assert!(config.exposed_ports.is_none());
        let host = config.host_config.unwrap();
        assert!(host.port_bindings.is_none());
        assert_eq!(host.network_mode, Some("none".to_string()));
        assert!(host.cpu_quota.is_none());
    }
}
