// ABOUTME: Configuration consumed by the sandbox core
// ABOUTME: Owned by the surrounding application; this crate only reads it

use serde::Deserialize;

/// Environment variable that overrides the host address embedded in desktop
/// sandbox URLs. When unset, the local network address is probed, falling
/// back to `localhost`.
pub const HOST_ADDRESS_ENV: &str = "OPENMANUS_HOST_ADDRESS";

/// Configuration for the code-execution sandbox.
///
/// Supplied by the embedding application. With `use_sandbox` disabled the
/// sandbox runs commands as local OS processes and never touches the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Execute inside a container (true) or as local processes (false)
    pub use_sandbox: bool,
    /// Image for the long-lived execution container
    pub image: String,
    /// Working directory inside the container
    pub work_dir: String,
    /// Memory limit with optional k/m/g suffix, e.g. "512m"
    pub memory_limit: String,
    /// CPU limit in cores; fractional values allowed
    pub cpu_limit: f64,
    /// Default execution timeout in seconds
    pub timeout_seconds: u64,
    /// Bridge networking when true, no network when false
    pub network_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            use_sandbox: true,
            image: "python:3.12-slim".to_string(),
            work_dir: "/workspace".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout_seconds: 300,
            network_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SandboxConfig::default();
        assert!(config.use_sandbox);
        assert_eq!(config.image, "python:3.12-slim");
        assert_eq!(config.memory_limit, "512m");
        assert_eq!(config.timeout_seconds, 300);
        assert!(!config.network_enabled);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"use_sandbox": false, "timeout_seconds": 60}"#).unwrap();
        assert!(!config.use_sandbox);
        assert_eq!(config.timeout_seconds, 60);
        assert_eq!(config.work_dir, "/workspace");
    }
}
