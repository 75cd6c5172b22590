// ABOUTME: Handle owning the lifecycle of one named sandbox container
// ABOUTME: Provision, idempotent teardown, liveness queries, and in-sandbox detection execution

use crate::model::{Detection, TestResult, TestStatus};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("failed to remove stale sandbox [{name}]: {source}")]
    StaleRemoval { name: String, source: RuntimeError },

    #[error("failed to pull image {image} for sandbox [{name}]: {source}")]
    ImagePull {
        name: String,
        image: String,
        source: RuntimeError,
    },

    #[error("failed to create sandbox [{name}]: {source}")]
    Create { name: String, source: RuntimeError },

    #[error("failed to start sandbox [{name}]: {source}")]
    Start { name: String, source: RuntimeError },
}

#[derive(Error, Debug)]
#[error("failed to remove sandbox [{name}]: {source}")]
pub struct TeardownError {
    pub name: String,
    pub source: RuntimeError,
}

#[derive(Error, Debug)]
#[error("could not determine status of sandbox [{name}]: {source}")]
pub struct RuntimeQueryError {
    pub name: String,
    pub source: RuntimeError,
}

/// Owns at most one live container named after its instance config.
///
/// A handle is exclusively owned by one worker, so no in-process locking is
/// needed; the runtime client behind it is shared read-only across workers.
pub struct SandboxHandle {
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    stop_timeout_secs: u64,
}

impl SandboxHandle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: ContainerSpec) -> Self {
        Self {
            runtime,
            spec,
            stop_timeout_secs: 10,
        }
    }

    pub fn with_stop_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.stop_timeout_secs = timeout_secs;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Provision the sandbox: remove any stale container bearing this name
    /// (absence is fine), make sure the image is present, then create and
    /// start the container.
    ///
    /// If this fails, the caller must not assume any pre-existing container
    /// is gone.
    pub async fn provision(&self) -> Result<(), ProvisionError> {
        let name = self.spec.name.clone();
        debug!("provision equivalent: {}", self.docker_run_equivalent());

        match self.runtime.remove_by_name(&name).await {
            Ok(true) => info!("Removed stale sandbox [{}] before provisioning", name),
            Ok(false) => {}
            Err(source) => return Err(ProvisionError::StaleRemoval { name, source }),
        }

        let image = self.spec.image.clone();
        match self.runtime.image_exists(&image).await {
            Ok(true) => {}
            Ok(false) => {
                self.runtime.pull_image(&image).await.map_err(|source| {
                    ProvisionError::ImagePull {
                        name: name.clone(),
                        image: image.clone(),
                        source,
                    }
                })?;
            }
            Err(source) => {
                return Err(ProvisionError::ImagePull { name, image, source });
            }
        }

        self.runtime
            .create(&self.spec)
            .await
            .map_err(|source| ProvisionError::Create {
                name: name.clone(),
                source,
            })?;

        self.runtime
            .start(&name)
            .await
            .map_err(|source| ProvisionError::Start { name, source })?;

        info!("Sandbox [{}] provisioned and running", self.spec.name);
        Ok(())
    }

    /// Tear the sandbox down. Idempotent: an absent container is success.
    ///
    /// Attempts a graceful stop first; whatever that says, removal is then
    /// forced and takes attached volumes with it. Fails only when a
    /// container known to exist could not be removed.
    pub async fn teardown(&self) -> Result<(), TeardownError> {
        if let Err(e) = self
            .runtime
            .stop(&self.spec.name, self.stop_timeout_secs)
            .await
        {
            warn!(
                "Could not stop sandbox [{}], removing anyway: {}",
                self.spec.name, e
            );
        }

        match self.runtime.remove_by_name(&self.spec.name).await {
            Ok(removed) => {
                if removed {
                    info!("Sandbox [{}] removed", self.spec.name);
                }
                Ok(())
            }
            Err(source) => Err(TeardownError {
                name: self.spec.name.clone(),
                source,
            }),
        }
    }

    /// Query the runtime for this sandbox's liveness. A missing container is
    /// `Ok(false)`, not an error; any other query failure is surfaced.
    pub async fn is_alive(&self) -> Result<bool, RuntimeQueryError> {
        match self.runtime.inspect_by_name(&self.spec.name).await {
            Ok(Some(state)) => Ok(state.is_running()),
            Ok(None) => Ok(false),
            Err(source) => Err(RuntimeQueryError {
                name: self.spec.name.clone(),
                source,
            }),
        }
    }

    /// Run one detection inside the sandbox and record its outcome.
    ///
    /// The detection source is executed by the container's shell; exit code
    /// zero is a pass, non-zero a fail, and a transport failure an error
    /// outcome. This never fails the worker: the outcome is the result.
    pub async fn run_detection(&self, detection: &Detection) -> TestResult {
        let command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            detection.source.clone(),
        ];

        match self.runtime.exec(&self.spec.name, command).await {
            Ok(output) if output.exit_code == 0 => {
                TestResult::new(detection, &self.spec.name, TestStatus::Passed, output.stdout)
            }
            Ok(output) => {
                let diagnostic = if output.stderr.is_empty() {
                    format!("exit code {}: {}", output.exit_code, output.stdout)
                } else {
                    format!("exit code {}: {}", output.exit_code, output.stderr)
                };
                TestResult::new(detection, &self.spec.name, TestStatus::Failed, diagnostic)
            }
            Err(e) => {
                warn!(
                    "Could not execute detection [{}] in sandbox [{}]: {}",
                    detection.name, self.spec.name, e
                );
                TestResult::new(
                    detection,
                    &self.spec.name,
                    TestStatus::Error,
                    e.to_string(),
                )
            }
        }
    }

    /// Command line equivalent to the provisioning request, logged for
    /// copy/paste debugging against a plain docker CLI.
    fn docker_run_equivalent(&self) -> String {
        let mut parts = vec!["docker run -d".to_string()];
        for port in &self.spec.ports {
            parts.push(format!("-p {}:{}", port.host_port, port.container_port));
        }
        for mount in &self.spec.mounts {
            parts.push(format!(
                "-v {}:{}{}",
                mount.host_path,
                mount.container_path,
                if mount.read_only { ":ro" } else { "" }
            ));
        }
        for key in self.spec.env.keys() {
            parts.push(format!("-e {}", key));
        }
        parts.push(format!("--name {}", self.spec.name));
        parts.push(self.spec.image.clone());
        parts.join(" ")
    }
}
