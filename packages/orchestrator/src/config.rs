// ABOUTME: Run and instance configuration for sandbox test runs
// ABOUTME: Loads the YAML run config, validates invariants, and assembles container specs

use crate::runtime::{BindMount, ContainerSpec, PortBinding};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Container-side port the application serves its web UI on.
pub const UI_CONTAINER_PORT: u16 = 8000;
/// Container-side port of the event collector endpoint.
pub const COLLECTOR_CONTAINER_PORT: u16 = 8088;
/// Container-side port of the management API.
pub const API_CONTAINER_PORT: u16 = 8089;

const DEFAULT_HEALTH_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("No sandbox instances configured")]
    NoInstances,

    #[error("Duplicate instance name: {0}")]
    DuplicateInstanceName(String),

    #[error("Host port {port} is bound by both {first} and {second}")]
    PortCollision {
        port: u16,
        first: String,
        second: String,
    },
}

/// Host port bindings for one instance, mapped onto the application's fixed
/// container ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortBindings {
    pub ui: u16,
    pub collector: u16,
    pub api: u16,
}

/// Read-only content mount from the host into the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
}

/// Configuration for one sandbox instance. Immutable for the run; the name is
/// the instance's identity and must be unique across the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub ports: PortBindings,
    pub content_mount: MountSpec,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
}

/// Global options for one test run plus the set of instances to provision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub image: String,
    pub admin_password: String,
    #[serde(default)]
    pub app_urls: Vec<String>,
    #[serde(default)]
    pub registry_username: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    #[serde(default = "default_health_poll_interval_secs")]
    pub health_poll_interval_secs: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    pub instances: Vec<InstanceConfig>,
}

fn default_health_poll_interval_secs() -> u64 {
    DEFAULT_HEALTH_POLL_INTERVAL_SECS
}

fn default_stop_timeout_secs() -> u64 {
    DEFAULT_STOP_TIMEOUT_SECS
}

impl RunConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the run invariants: at least one instance, unique instance
    /// names, and host ports not reused across live instances.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::NoInstances);
        }

        let mut names = HashSet::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();

        for instance in &self.instances {
            if !names.insert(instance.name.as_str()) {
                return Err(ConfigError::DuplicateInstanceName(instance.name.clone()));
            }

            for port in [
                instance.ports.ui,
                instance.ports.collector,
                instance.ports.api,
            ] {
                if let Some(first) = ports.insert(port, instance.name.as_str()) {
                    return Err(ConfigError::PortCollision {
                        port,
                        first: first.to_string(),
                        second: instance.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Assemble the container environment for one instance: license
    /// acceptance, admin credentials, app package source URLs, and registry
    /// credentials when both halves are configured.
    pub fn environment_for(&self, instance: &InstanceConfig) -> HashMap<String, String> {
        let mut environment = HashMap::new();
        environment.insert("APP_START_ARGS".to_string(), "--accept-license".to_string());
        environment.insert(
            "APP_ADMIN_PASSWORD".to_string(),
            self.admin_password.clone(),
        );
        environment.insert("APP_PACKAGES_URL".to_string(), self.app_urls.join(","));

        if let (Some(username), Some(password)) =
            (&self.registry_username, &self.registry_password)
        {
            environment.insert("REGISTRY_USERNAME".to_string(), username.clone());
            environment.insert("REGISTRY_PASSWORD".to_string(), password.clone());
        }

        for (key, value) in &instance.extra_env {
            environment.insert(key.clone(), value.clone());
        }

        environment
    }

    /// Build the full container spec for one instance.
    pub fn container_spec_for(&self, instance: &InstanceConfig) -> ContainerSpec {
        ContainerSpec {
            name: instance.name.clone(),
            image: self.image.clone(),
            env: self.environment_for(instance),
            ports: vec![
                PortBinding {
                    host_port: instance.ports.ui,
                    container_port: UI_CONTAINER_PORT,
                },
                PortBinding {
                    host_port: instance.ports.collector,
                    container_port: COLLECTOR_CONTAINER_PORT,
                },
                PortBinding {
                    host_port: instance.ports.api,
                    container_port: API_CONTAINER_PORT,
                },
            ],
            mounts: vec![BindMount {
                host_path: instance.content_mount.host_path.clone(),
                container_path: instance.content_mount.container_path.clone(),
                read_only: true,
            }],
        }
    }

    pub fn health_poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_poll_interval_secs)
    }
}
