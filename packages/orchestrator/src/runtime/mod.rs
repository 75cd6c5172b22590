// ABOUTME: Container runtime trait and shared types for sandbox execution backends
// ABOUTME: Defines the name-keyed lifecycle interface implemented by the Docker backend

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Exec error: {0}")]
    Exec(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Specification for creating one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
    pub mounts: Vec<BindMount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// Captured output of a command executed inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Runtime backend for sandbox containers.
///
/// All operations are keyed by container name: instance names are unique for
/// the lifetime of a test run, so the name is the identity of a sandbox.
/// Absence is never an error here. `remove_by_name` returns whether anything
/// was removed and `inspect_by_name` returns `None` for a missing container,
/// since callers must tolerate "not found" during provisioning, teardown,
/// and health checks. Implementations are stateless per call and may be shared
/// read-only across workers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Check whether an image exists locally.
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container from the given spec without starting it.
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Start a created container.
    async fn start(&self, name: &str) -> Result<()>;

    /// Gracefully stop a running container, killing it after the timeout.
    ///
    /// Returns `Ok(true)` if a container was stopped (or already was),
    /// `Ok(false)` if none existed with that name.
    async fn stop(&self, name: &str, timeout_secs: u64) -> Result<bool>;

    /// Force-remove a container and its attached volumes.
    ///
    /// Returns `Ok(true)` if a container was removed, `Ok(false)` if none
    /// existed with that name.
    async fn remove_by_name(&self, name: &str) -> Result<bool>;

    /// Look up a container's state by name, `None` if it does not exist.
    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerState>>;

    /// Execute a command inside a running container and collect its output.
    async fn exec(&self, name: &str, command: Vec<String>) -> Result<ExecOutput>;
}
