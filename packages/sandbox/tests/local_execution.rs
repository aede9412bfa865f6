// ABOUTME: Integration tests for the local-process execution path
// ABOUTME: Exercises CodeSandbox with sandboxing disabled; no container engine required

#![cfg(unix)]

use openmanus_sandbox::{CodeSandbox, SandboxConfig, TIMEOUT_EXIT_CODE};
use std::time::{Duration, Instant};

fn local_config() -> SandboxConfig {
    SandboxConfig {
        use_sandbox: false,
        ..SandboxConfig::default()
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let sandbox = CodeSandbox::new(&local_config()).await.unwrap();

    let result = sandbox.execute_command("echo hi", 5).await;
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, 0);
    assert!(result.success());
    assert_eq!(result.combined_output(), "hi\n");

    sandbox.close().await;
}

#[tokio::test]
async fn nonzero_exit_code_is_data_not_error() {
    let sandbox = CodeSandbox::new(&local_config()).await.unwrap();

    let result = sandbox.execute_command("ls /definitely-not-a-real-path", 5).await;
    assert!(!result.success());
    assert_ne!(result.exit_code, 0);
    assert!(!result.stderr.is_empty());
    assert!(result.combined_output().starts_with("STDERR: "));
}

#[tokio::test]
async fn timeout_returns_124_within_margin() {
    let sandbox = CodeSandbox::new(&local_config()).await.unwrap();

    let start = Instant::now();
    let result = sandbox.execute_command("sleep 5", 1).await;
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(result.stderr.contains("timed out"));
}

#[tokio::test]
async fn bash_delegates_to_command_execution() {
    let sandbox = CodeSandbox::new(&local_config()).await.unwrap();

    let result = sandbox
        .execute_bash("x=3; y=4; echo $((x * y))", 5)
        .await;
    assert_eq!(result.stdout, "12\n");
    assert!(result.success());
}

#[tokio::test]
async fn python_script_with_quotes_survives_escaping() {
    let sandbox = CodeSandbox::new(&local_config()).await.unwrap();

    let result = sandbox.execute_python("print('hello world')", 10).await;
    if result.stderr.contains("not found") {
        // Host has no python3; escaping is still covered by unit tests
        return;
    }
    assert_eq!(result.stdout, "hello world\n");
    assert!(result.success());
}

#[tokio::test]
async fn default_timeout_comes_from_config() {
    let config = SandboxConfig {
        use_sandbox: false,
        timeout_seconds: 42,
        ..SandboxConfig::default()
    };
    let sandbox = CodeSandbox::new(&config).await.unwrap();
    assert_eq!(sandbox.default_timeout_secs(), 42);

    let result = sandbox.execute("echo default").await;
    assert_eq!(result.stdout, "default\n");
}
