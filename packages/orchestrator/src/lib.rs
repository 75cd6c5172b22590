// ABOUTME: Parallel sandbox orchestration for detection-content testing
// ABOUTME: Provisions, monitors, and tears down pools of containerized app-under-test instances

pub mod config;
pub mod coordination;
pub mod handle;
pub mod model;
pub mod runtime;
pub mod supervisor;
pub mod worker;

pub use config::{ConfigError, InstanceConfig, MountSpec, PortBindings, RunConfig};
pub use coordination::{RunCoordinator, StatusLine};
pub use handle::{ProvisionError, RuntimeQueryError, SandboxHandle, TeardownError};
pub use model::{Detection, TestAssignment, TestResult, TestStatus};
pub use runtime::{
    BindMount, ContainerRuntime, ContainerSpec, ContainerState, DockerRuntime, ExecOutput,
    PortBinding, RuntimeError,
};
pub use supervisor::{RunSummary, TeardownFailure, TestRunSupervisor, WorkerFailure};
pub use worker::{InstanceWorker, WorkerError, WorkerReport, WorkerState};
