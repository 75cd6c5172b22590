// ABOUTME: Worker owning one sandbox through its full lifecycle
// ABOUTME: Explicit state machine driving provision, test execution, health polling, and teardown

use crate::coordination::RunCoordinator;
use crate::handle::{ProvisionError, SandboxHandle, TeardownError};
use crate::model::{TestAssignment, TestResult, TestStatus};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Provisioning,
    Running,
    TearingDown,
    Finished,
    Errored,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("sandbox lost: {0}")]
    SandboxLost(String),

    #[error("worker task failed: {0}")]
    Join(String),
}

/// Everything a worker hands back to the supervisor at join time.
#[derive(Debug)]
pub struct WorkerReport {
    pub instance: String,
    pub results: Vec<TestResult>,
    pub error: Option<WorkerError>,
    pub teardown_error: Option<TeardownError>,
}

/// The unit of concurrency: owns exactly one sandbox, runs the assignments
/// scheduled onto it, polls its health, and always attempts teardown.
///
/// Errors during the run are absorbed here and converted into a termination
/// request plus diagnostics, so one sandbox's failure cannot crash sibling
/// workers. Only teardown failures travel up in the report, because an
/// un-removed sandbox is a leak the operator has to know about.
pub struct InstanceWorker {
    handle: SandboxHandle,
    assignments: Vec<TestAssignment>,
    coordinator: Arc<RunCoordinator>,
    poll_interval: Duration,
    state: WorkerState,
    results: Vec<TestResult>,
    error: Option<WorkerError>,
}

impl InstanceWorker {
    pub fn new(
        handle: SandboxHandle,
        assignments: Vec<TestAssignment>,
        coordinator: Arc<RunCoordinator>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            handle,
            assignments,
            coordinator,
            poll_interval,
            state: WorkerState::Created,
            results: Vec::new(),
            error: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Drive the whole lifecycle and return the report. Teardown is always
    /// attempted, whatever happened before it.
    pub async fn run(mut self) -> WorkerReport {
        self.start().await;
        if self.state == WorkerState::Running {
            self.run_assigned_tests().await;
        }
        let teardown_error = self.finish().await;

        WorkerReport {
            instance: self.handle.name().to_string(),
            results: self.results,
            error: self.error,
            teardown_error,
        }
    }

    /// Provision the sandbox. A provisioning failure is recorded, requests
    /// run-wide termination, and leaves the worker in `Errored`; it is not
    /// propagated further.
    pub async fn start(&mut self) {
        let name = self.handle.name().to_string();
        self.state = WorkerState::Provisioning;
        self.coordinator.report(&name, "provisioning sandbox");

        match self.handle.provision().await {
            Ok(()) => {
                self.state = WorkerState::Running;
                self.coordinator.report(&name, "sandbox running");
            }
            Err(e) => {
                self.coordinator.report(&name, format!("Error: {}", e));
                if self.coordinator.request_termination() {
                    self.coordinator
                        .report(&name, "requesting termination of the run");
                }
                self.error = Some(WorkerError::Provision(e));
                self.state = WorkerState::Errored;
            }
        }
    }

    /// Execute the assignments sequentially while `Running`.
    ///
    /// The termination flag is checked before scheduling each assignment;
    /// once it is set, no new assignment starts (the in-flight one finishes).
    /// Health is polled whenever the poll interval has elapsed between
    /// assignments, and immediately after any error-status outcome.
    pub async fn run_assigned_tests(&mut self) {
        let name = self.handle.name().to_string();
        let assignments = std::mem::take(&mut self.assignments);
        let total = assignments.len();
        let mut last_poll = Instant::now();

        for (index, assignment) in assignments.into_iter().enumerate() {
            if self.coordinator.termination_requested() {
                self.coordinator.report(
                    &name,
                    format!(
                        "termination requested, skipping {} remaining assignment(s)",
                        total - index
                    ),
                );
                break;
            }

            if last_poll.elapsed() >= self.poll_interval {
                if !self.poll_health().await {
                    break;
                }
                last_poll = Instant::now();
            }

            self.coordinator.report(
                &name,
                format!(
                    "testing detection [{}] ({}/{})",
                    assignment.detection.name,
                    index + 1,
                    total
                ),
            );

            let result = self.handle.run_detection(&assignment.detection).await;
            self.coordinator.report(
                &name,
                format!(
                    "detection [{}] {}",
                    assignment.detection.name,
                    result.status.as_str()
                ),
            );

            let errored = result.status == TestStatus::Error;
            self.results.push(result);

            if errored && !self.poll_health().await {
                break;
            }
        }

        if self.state == WorkerState::Running {
            self.state = WorkerState::TearingDown;
        }
    }

    /// Check the sandbox is still alive. An unexpected loss (or an
    /// indeterminate query) writes a diagnostic, requests termination, and
    /// moves the worker to `TearingDown`. Returns whether the sandbox is
    /// still healthy.
    pub async fn poll_health(&mut self) -> bool {
        let name = self.handle.name().to_string();

        let reason = match self.handle.is_alive().await {
            Ok(true) => return true,
            Ok(false) => format!("sandbox [{}] is no longer running", name),
            Err(e) => e.to_string(),
        };

        warn!("Lost sandbox [{}]: {}", name, reason);
        self.coordinator
            .report(&name, format!("Error: could not get sandbox [{}]: {}", name, reason));
        self.coordinator.request_termination();
        self.error = Some(WorkerError::SandboxLost(reason));
        self.state = WorkerState::TearingDown;
        false
    }

    /// Tear the sandbox down. Callable from any state and idempotent; the
    /// worker ends up `Finished` whatever the teardown outcome, so it is
    /// never left polling a dead sandbox. A teardown failure is returned so
    /// the supervisor can surface the leak.
    pub async fn finish(&mut self) -> Option<TeardownError> {
        if self.state == WorkerState::Finished {
            return None;
        }

        let name = self.handle.name().to_string();
        self.state = WorkerState::TearingDown;
        self.coordinator.report(&name, "tearing down sandbox");

        let outcome = self.handle.teardown().await;
        self.state = WorkerState::Finished;

        match outcome {
            Ok(()) => {
                info!("Worker for [{}] finished", name);
                self.coordinator.report(&name, "sandbox removed");
                None
            }
            Err(e) => {
                self.coordinator.report(&name, format!("Error: {}", e));
                Some(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Detection;
    use crate::runtime::{
        ContainerRuntime, ContainerSpec, ContainerState, ExecOutput, Result as RuntimeResult,
    };
    use std::collections::HashMap;

    struct IdleRuntime;

    #[async_trait::async_trait]
    impl ContainerRuntime for IdleRuntime {
        async fn ping(&self) -> RuntimeResult<()> {
            Ok(())
        }
        async fn image_exists(&self, _image: &str) -> RuntimeResult<bool> {
            Ok(true)
        }
        async fn pull_image(&self, _image: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn create(&self, _spec: &ContainerSpec) -> RuntimeResult<()> {
            Ok(())
        }
        async fn start(&self, _name: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn stop(&self, _name: &str, _timeout_secs: u64) -> RuntimeResult<bool> {
            Ok(false)
        }
        async fn remove_by_name(&self, _name: &str) -> RuntimeResult<bool> {
            Ok(false)
        }
        async fn inspect_by_name(&self, _name: &str) -> RuntimeResult<Option<ContainerState>> {
            Ok(Some(ContainerState::Running))
        }
        async fn exec(&self, _name: &str, _command: Vec<String>) -> RuntimeResult<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn worker(
        assignments: Vec<TestAssignment>,
        coordinator: Arc<RunCoordinator>,
    ) -> InstanceWorker {
        let spec = ContainerSpec {
            name: "test-0".to_string(),
            image: "app-under-test:latest".to_string(),
            env: HashMap::new(),
            ports: vec![],
            mounts: vec![],
        };
        InstanceWorker::new(
            SandboxHandle::new(Arc::new(IdleRuntime), spec),
            assignments,
            coordinator,
            Duration::from_millis(50),
        )
    }

    fn assignment(name: &str) -> TestAssignment {
        TestAssignment {
            detection: Detection {
                name: name.to_string(),
                source: "true".to_string(),
            },
            instance: "test-0".to_string(),
        }
    }

    #[tokio::test]
    async fn worker_with_no_assignments_finishes_cleanly() {
        let (coordinator, _receiver) = RunCoordinator::new();
        let report = worker(vec![], coordinator.clone()).run().await;

        assert!(report.results.is_empty());
        assert!(report.error.is_none());
        assert!(report.teardown_error.is_none());
        assert!(!coordinator.termination_requested());
    }

    #[tokio::test]
    async fn worker_runs_all_assignments_in_order() {
        let (coordinator, _receiver) = RunCoordinator::new();
        let report = worker(
            vec![assignment("det-a"), assignment("det-b")],
            coordinator,
        )
        .run()
        .await;

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].detection, "det-a");
        assert_eq!(report.results[1].detection, "det-b");
        assert!(report
            .results
            .iter()
            .all(|r| r.status == TestStatus::Passed));
    }

    #[tokio::test]
    async fn prior_termination_schedules_zero_assignments() {
        let (coordinator, _receiver) = RunCoordinator::new();
        coordinator.request_termination();

        let report = worker(
            vec![assignment("det-a"), assignment("det-b")],
            coordinator,
        )
        .run()
        .await;

        assert!(report.results.is_empty());
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (coordinator, _receiver) = RunCoordinator::new();
        let mut worker = worker(vec![], coordinator);

        worker.start().await;
        assert_eq!(worker.state(), WorkerState::Running);

        assert!(worker.finish().await.is_none());
        assert_eq!(worker.state(), WorkerState::Finished);
        assert!(worker.finish().await.is_none());
        assert_eq!(worker.state(), WorkerState::Finished);
    }
}
