// ABOUTME: Tests for Docker runtime graceful degradation when the daemon is unavailable
// ABOUTME: Verifies connection errors are informative and probes skip without a daemon

use detlab_orchestrator::{ContainerRuntime, DockerRuntime};

/// Connecting must either succeed or fail with an error that points the user
/// at Docker, never panic.
#[tokio::test]
async fn docker_connect_error_is_informative() {
    match DockerRuntime::connect() {
        Ok(_) => {
            // Docker is available; nothing to assert about unavailability
            println!("Note: Docker is available. This test verifies behavior when it is not.");
        }
        Err(e) => {
            let message = e.to_string();
            assert!(
                message.contains("Connection")
                    || message.contains("docker")
                    || message.contains("socket"),
                "Error message should be informative about Docker unavailability: {}",
                message
            );
        }
    }
}

/// Inspecting a container that does not exist is an absence, not an error.
#[tokio::test]
async fn inspect_of_missing_container_is_none() {
    let runtime = match DockerRuntime::connect() {
        Ok(runtime) => runtime,
        Err(_) => {
            println!("Skipping test: Docker not available");
            return;
        }
    };

    if runtime.ping().await.is_err() {
        println!("Skipping test: Docker daemon not responding");
        return;
    }

    let state = runtime
        .inspect_by_name("detlab-test-no-such-container")
        .await
        .expect("inspect of a missing container should not error");
    assert!(state.is_none());

    let removed = runtime
        .remove_by_name("detlab-test-no-such-container")
        .await
        .expect("remove of a missing container should not error");
    assert!(!removed);
}
