// ABOUTME: Supervisor fanning out one worker per configured sandbox instance
// ABOUTME: Joins all workers, drains the status sink, and aggregates run results and errors

use crate::config::RunConfig;
use crate::coordination::{RunCoordinator, StatusLine};
use crate::handle::{SandboxHandle, TeardownError};
use crate::model::{TestAssignment, TestResult};
use crate::runtime::ContainerRuntime;
use crate::worker::{InstanceWorker, WorkerError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A worker-level error attributed to its instance.
#[derive(Debug)]
pub struct WorkerFailure {
    pub instance: String,
    pub error: WorkerError,
}

/// A sandbox that could not be cleaned up; the leaked resource is
/// operator-actionable.
#[derive(Debug)]
pub struct TeardownFailure {
    pub instance: String,
    pub error: TeardownError,
}

/// Aggregate outcome of one test run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub results: Vec<TestResult>,
    pub errors: Vec<WorkerFailure>,
    pub teardown_failures: Vec<TeardownFailure>,
    pub terminated: bool,
}

impl RunSummary {
    /// A run fails when the termination flag was set by an error, as opposed
    /// to the run completing normally.
    pub fn failed(&self) -> bool {
        self.terminated
    }
}

/// Fans out one worker per configured instance, waits for all of them to
/// reach a terminal state, and merges their reports.
///
/// Teardown is attempted for every worker, including the siblings of
/// whichever one set the termination flag; the workers handle that
/// themselves, so joining is enough here.
pub struct TestRunSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    config: RunConfig,
    status_stream: Option<mpsc::UnboundedSender<StatusLine>>,
}

impl TestRunSupervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RunConfig) -> Self {
        Self {
            runtime,
            config,
            status_stream: None,
        }
    }

    /// Forward live status lines to the given channel in addition to the
    /// structured log.
    pub fn with_status_stream(mut self, stream: mpsc::UnboundedSender<StatusLine>) -> Self {
        self.status_stream = Some(stream);
        self
    }

    pub async fn run(self, assignments: Vec<TestAssignment>) -> RunSummary {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            instances = self.config.instances.len(),
            assignments = assignments.len(),
            "starting test run"
        );

        let (coordinator, mut receiver) = RunCoordinator::new();

        let forward = self.status_stream.clone();
        let drain = tokio::spawn(async move {
            while let Some(line) = receiver.recv().await {
                info!(instance = %line.instance, "{}", line.message);
                if let Some(stream) = &forward {
                    let _ = stream.send(line);
                }
            }
        });

        let known: HashSet<&str> = self
            .config
            .instances
            .iter()
            .map(|i| i.name.as_str())
            .collect();
        let mut by_instance: HashMap<String, Vec<TestAssignment>> = HashMap::new();
        for assignment in assignments {
            if known.contains(assignment.instance.as_str()) {
                by_instance
                    .entry(assignment.instance.clone())
                    .or_default()
                    .push(assignment);
            } else {
                warn!(
                    "Assignment [{}] references unknown instance [{}], skipping",
                    assignment.detection.name, assignment.instance
                );
            }
        }

        let poll_interval = self.config.health_poll_interval();
        let mut handles = Vec::new();
        for instance in &self.config.instances {
            let spec = self.config.container_spec_for(instance);
            let handle = SandboxHandle::new(self.runtime.clone(), spec)
                .with_stop_timeout_secs(self.config.stop_timeout_secs);
            let worker = InstanceWorker::new(
                handle,
                by_instance.remove(&instance.name).unwrap_or_default(),
                coordinator.clone(),
                poll_interval,
            );
            handles.push((instance.name.clone(), tokio::spawn(worker.run())));
        }

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut teardown_failures = Vec::new();

        for (name, handle) in handles {
            match handle.await {
                Ok(report) => {
                    results.extend(report.results);
                    if let Some(error) = report.error {
                        errors.push(WorkerFailure {
                            instance: report.instance.clone(),
                            error,
                        });
                    }
                    if let Some(error) = report.teardown_error {
                        teardown_failures.push(TeardownFailure {
                            instance: report.instance,
                            error,
                        });
                    }
                }
                Err(e) => {
                    error!("Worker for [{}] did not complete: {}", name, e);
                    coordinator.request_termination();
                    errors.push(WorkerFailure {
                        instance: name,
                        error: WorkerError::Join(e.to_string()),
                    });
                }
            }
        }

        let terminated = coordinator.termination_requested();

        // The drain task ends once every sender is gone
        drop(coordinator);
        let _ = drain.await;

        info!(
            %run_id,
            results = results.len(),
            errors = errors.len(),
            teardown_failures = teardown_failures.len(),
            terminated,
            "test run complete"
        );

        RunSummary {
            run_id,
            results,
            errors,
            teardown_failures,
            terminated,
        }
    }
}
