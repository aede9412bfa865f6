// ABOUTME: Per-session graphical desktop sandbox factory
// ABOUTME: Provisions full-desktop-with-browser containers exposing a web-based VNC client

use crate::config::HOST_ADDRESS_ENV;
use crate::engine::{ContainerSpec, EngineClient};
use crate::error::{Result, SandboxError};
use crate::types::DesktopSandboxInfo;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Desktop image serving a full XFCE desktop with a browser and a web VNC
/// client on the fixed port below.
const DESKTOP_IMAGE: &str = "consol/ubuntu-xfce-vnc:latest";
const WEB_VNC_PORT: u16 = 6901;
const VNC_PASSWORD: &str = "vncpassword";
const VNC_RESOLUTION: &str = "1280x800";

const DESKTOP_MEMORY_BYTES: i64 = 1024 * 1024 * 1024;
const DESKTOP_CPU_CORES: f64 = 2.0;
/// Embedded browser engines need an enlarged /dev/shm
const DESKTOP_SHM_BYTES: i64 = 512 * 1024 * 1024;
const DESKTOP_READY_TIMEOUT_SECS: u64 = 60;

/// Creates and destroys desktop sandboxes.
///
/// Object-safe so the registry can be exercised against a mock. Destruction
/// and liveness checks are best-effort by contract: they cannot fail
/// observably, since they run from cleanup paths.
#[async_trait]
pub trait DesktopProvisioner: Send + Sync {
    async fn create_sandbox(&self, session_id: &str) -> Result<DesktopSandboxInfo>;
    async fn destroy_sandbox(&self, container_id: &str);
    async fn is_running(&self, container_id: &str) -> bool;
}

/// Stateless factory for desktop sandbox containers. Holds no session state;
/// the registry owns the session-to-sandbox mapping.
pub struct DesktopSandboxFactory {
    engine: Arc<EngineClient>,
}

impl DesktopSandboxFactory {
    pub fn new(engine: Arc<EngineClient>) -> Self {
        Self { engine }
    }

    async fn provision(&self, session_id: &str) -> Result<DesktopSandboxInfo> {
        self.engine.pull_image_if_needed(DESKTOP_IMAGE).await?;

        let mut env = HashMap::new();
        env.insert("VNC_PW".to_string(), VNC_PASSWORD.to_string());
        env.insert("VNC_RESOLUTION".to_string(), VNC_RESOLUTION.to_string());

        let spec = ContainerSpec {
            image: DESKTOP_IMAGE.to_string(),
            name: Some(container_name(session_id)),
            env,
            memory_bytes: Some(DESKTOP_MEMORY_BYTES),
            cpu_cores: Some(DESKTOP_CPU_CORES),
            network_mode: "bridge".to_string(),
            // Lifecycle is explicitly managed by the registry
            auto_remove: false,
            shm_size_bytes: Some(DESKTOP_SHM_BYTES),
            exposed_port: Some(WEB_VNC_PORT),
            session_id: Some(session_id.to_string()),
            ..Default::default()
        };

        let container_id = self.engine.create_container(&spec).await?;

        let started = async {
            self.engine.start_container(&container_id).await?;
            self.engine
                .wait_for_container_ready(&container_id, DESKTOP_READY_TIMEOUT_SECS)
                .await;
            self.engine
                .get_mapped_port(&container_id, WEB_VNC_PORT)
                .await
        }
        .await;

        let mapped_port = match started {
            Ok(port) => port,
            Err(e) => {
                // Don't leave a half-started container behind
                self.engine.destroy_container(&container_id).await;
                return Err(e);
            }
        };

        let vnc_url = vnc_url(&host_address(), mapped_port);
        info!(
            "Desktop sandbox for session {} ready at {} (container {})",
            session_id, vnc_url, container_id
        );

        Ok(DesktopSandboxInfo {
            container_id,
            vnc_url,
            mapped_port,
        })
    }
}

#[async_trait]
impl DesktopProvisioner for DesktopSandboxFactory {
    async fn create_sandbox(&self, session_id: &str) -> Result<DesktopSandboxInfo> {
        self.provision(session_id).await.map_err(|e| {
            warn!("Desktop sandbox creation failed for {}: {}", session_id, e);
            SandboxError::CreationFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    async fn destroy_sandbox(&self, container_id: &str) {
        self.engine.destroy_container(container_id).await;
    }

    async fn is_running(&self, container_id: &str) -> bool {
        self.engine.is_container_running(container_id).await
    }
}

fn vnc_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/vnc.html", host, port)
}

/// Engine container names only allow [a-zA-Z0-9_.-]; session IDs are opaque.
fn container_name(session_id: &str) -> String {
    let sanitized: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("openmanus-desktop-{}", sanitized)
}

/// Host address for the VNC URL: explicit environment override, else the
/// local routable address, else `localhost`.
fn host_address() -> String {
    if let Ok(host) = std::env::var(HOST_ADDRESS_ENV) {
        if !host.is_empty() {
            return host;
        }
    }

    // Connected UDP sockets send no packets; this only asks the kernel which
    // local address would route outward.
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }

    "localhost".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vnc_url_format() {
        assert_eq!(vnc_url("localhost", 32768), "http://localhost:32768/vnc.html");
    }

    #[test]
    fn container_name_sanitizes_session_id() {
        assert_eq!(container_name("abc-123"), "openmanus-desktop-abc-123");
        assert_eq!(
            container_name("user@example/run 1"),
            "openmanus-desktop-user-example-run-1"
        );
    }

    #[test]
    fn host_address_never_empty() {
        assert!(!host_address().is_empty());
    }
}
