// ABOUTME: Isolated, resource-bounded command execution and desktop sandboxes for agent workloads
// ABOUTME: Wires the engine client, code sandbox, desktop factory, and session registry together

pub mod config;
pub mod desktop;
pub mod engine;
pub mod error;
pub mod executor;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use config::{SandboxConfig, HOST_ADDRESS_ENV};
pub use desktop::{DesktopProvisioner, DesktopSandboxFactory};
pub use engine::{ContainerSpec, EngineClient};
pub use error::{Result, SandboxError};
pub use executor::{CodeSandbox, ContainerExecutor, Executor, LocalProcessExecutor};
pub use registry::SandboxSessionRegistry;
pub use types::{
    DesktopSandboxInfo, ExecutionResult, SandboxStatus, SessionSandboxInfo, TIMEOUT_EXIT_CODE,
};
