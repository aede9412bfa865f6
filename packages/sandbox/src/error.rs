// ABOUTME: Error types for sandbox operations
// ABOUTME: Distinguishes fatal startup errors from per-call failures reported as ExecutionResult data

use thiserror::Error;

/// Main error type for sandbox operations.
///
/// Only creation-path failures surface through this type. Command execution
/// failures are reported as [`ExecutionResult`](crate::ExecutionResult) data
/// so agent loops can branch on exit codes, and cleanup paths log and swallow
/// their errors instead of returning them.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Docker/container-engine errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Docker container not found
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Docker image not found or failed to pull
    #[error("Docker image error: {0}")]
    ImageError(String),

    /// Container failed to create or start
    #[error("Container failed to start: {0}")]
    ContainerStartFailed(String),

    /// The engine reports no host binding for a declared container port
    #[error("no host port mapped for {container_port}/tcp on container {container_id}")]
    PortMappingNotFound {
        container_id: String,
        container_port: u16,
    },

    /// Desktop sandbox creation failed
    #[error("failed to create desktop sandbox for session {session_id}: {reason}")]
    CreationFailed { session_id: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
