// ABOUTME: End-to-end orchestrator tests against an in-memory fake container runtime
// ABOUTME: Covers provisioning idempotence, cooperative termination, sandbox loss, and teardown reporting

use async_trait::async_trait;
use detlab_orchestrator::{
    ContainerRuntime, ContainerSpec, ContainerState, Detection, ExecOutput, InstanceConfig,
    MountSpec, PortBindings, RunConfig, RuntimeError, SandboxHandle, TestAssignment, TestStatus,
    TestRunSupervisor, WorkerError,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// In-memory stand-in for the Docker backend. Containers are plain map
/// entries; failure injection is keyed by instance name.
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerState>>,
    create_counts: Mutex<HashMap<String, usize>>,
    exec_counts: Mutex<HashMap<String, usize>>,
    fail_create: HashSet<String>,
    fail_remove_existing: HashSet<String>,
    /// Mark the container exited once this many execs have completed on it
    kill_after_execs: HashMap<String, usize>,
}

impl FakeRuntime {
    fn new() -> Self {
        Self::default()
    }

    fn container_count(&self, name: &str) -> usize {
        self.containers
            .lock()
            .unwrap()
            .keys()
            .filter(|n| n.as_str() == name)
            .count()
    }

    fn live_containers(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    fn create_count(&self, name: &str) -> usize {
        *self.create_counts.lock().unwrap().get(name).unwrap_or(&0)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), RuntimeError> {
        if self.fail_create.contains(&spec.name) {
            return Err(RuntimeError::Container(format!(
                "injected create failure for {}",
                spec.name
            )));
        }
        *self
            .create_counts
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_insert(0) += 1;
        self.containers
            .lock()
            .unwrap()
            .insert(spec.name.clone(), ContainerState::Created);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(state) => {
                *state = ContainerState::Running;
                Ok(())
            }
            None => Err(RuntimeError::Container(format!(
                "no such container: {}",
                name
            ))),
        }
    }

    async fn stop(&self, name: &str, _timeout_secs: u64) -> Result<bool, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(name) {
            Some(state) => {
                *state = ContainerState::Exited;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_by_name(&self, name: &str) -> Result<bool, RuntimeError> {
        let mut containers = self.containers.lock().unwrap();
        if !containers.contains_key(name) {
            return Ok(false);
        }
        if self.fail_remove_existing.contains(name) {
            return Err(RuntimeError::Container(format!(
                "injected remove failure for {}",
                name
            )));
        }
        containers.remove(name);
        Ok(true)
    }

    async fn inspect_by_name(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn exec(&self, name: &str, command: Vec<String>) -> Result<ExecOutput, RuntimeError> {
        {
            let containers = self.containers.lock().unwrap();
            match containers.get(name) {
                Some(ContainerState::Running) => {}
                _ => {
                    return Err(RuntimeError::Exec(format!(
                        "container {} is not running",
                        name
                    )))
                }
            }
        }

        let count = {
            let mut counts = self.exec_counts.lock().unwrap();
            let count = counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(&limit) = self.kill_after_execs.get(name) {
            if count >= limit {
                self.containers
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), ContainerState::Exited);
            }
        }

        let source = command.last().map(String::as_str).unwrap_or("");
        let exit_code = if source.contains("exit 1") { 1 } else { 0 };

        Ok(ExecOutput {
            exit_code,
            stdout: format!("ran: {}", source),
            stderr: String::new(),
        })
    }
}

fn instance(name: &str, base_port: u16) -> InstanceConfig {
    InstanceConfig {
        name: name.to_string(),
        ports: PortBindings {
            ui: base_port,
            collector: base_port + 1,
            api: base_port + 2,
        },
        content_mount: MountSpec {
            host_path: "/tmp/content".to_string(),
            container_path: "/opt/app/content".to_string(),
        },
        extra_env: HashMap::new(),
    }
}

fn run_config(instances: Vec<InstanceConfig>) -> RunConfig {
    RunConfig {
        image: "app-under-test:latest".to_string(),
        admin_password: "changeme".to_string(),
        app_urls: vec![],
        registry_username: None,
        registry_password: None,
        health_poll_interval_secs: 1,
        stop_timeout_secs: 1,
        instances,
    }
}

fn assignment(detection: &str, instance: &str) -> TestAssignment {
    TestAssignment {
        detection: Detection {
            name: detection.to_string(),
            source: "run-detection".to_string(),
        },
        instance: instance.to_string(),
    }
}

#[tokio::test]
async fn provisioning_twice_yields_exactly_one_live_sandbox() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = run_config(vec![instance("test-0", 8100)]);
    let handle = SandboxHandle::new(
        runtime.clone(),
        config.container_spec_for(&config.instances[0]),
    );

    handle.provision().await.expect("first provision failed");
    handle.provision().await.expect("second provision failed");

    assert_eq!(runtime.container_count("test-0"), 1);
    assert_eq!(runtime.create_count("test-0"), 2);
    assert!(handle.is_alive().await.unwrap());
}

#[tokio::test]
async fn teardown_of_absent_sandbox_is_silent_success() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = run_config(vec![instance("test-0", 8100)]);
    let handle = SandboxHandle::new(
        runtime.clone(),
        config.container_spec_for(&config.instances[0]),
    );

    handle.teardown().await.expect("teardown of absent sandbox");
    handle.teardown().await.expect("repeated teardown");
    assert!(!handle.is_alive().await.unwrap());
}

#[tokio::test]
async fn lost_sandbox_terminates_the_run_and_still_finishes() {
    let mut runtime = FakeRuntime::new();
    runtime.kill_after_execs.insert("test-0".to_string(), 1);
    let runtime = Arc::new(runtime);

    let config = run_config(vec![instance("test-0", 8100)]);
    let assignments = vec![
        assignment("det-a", "test-0"),
        assignment("det-b", "test-0"),
        assignment("det-c", "test-0"),
    ];

    let summary = TestRunSupervisor::new(runtime.clone(), config)
        .run(assignments)
        .await;

    assert!(summary.terminated);
    assert!(summary.failed());
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].instance, "test-0");
    assert!(matches!(
        summary.errors[0].error,
        WorkerError::SandboxLost(_)
    ));

    // The first exec succeeded before the sandbox died, the second surfaced
    // the loss, the third was never scheduled
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[0].status, TestStatus::Passed);
    assert_eq!(summary.results[1].status, TestStatus::Error);

    // Teardown still ran and removed the dead container
    assert!(summary.teardown_failures.is_empty());
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn one_failed_provision_terminates_but_all_sandboxes_finish() {
    let mut runtime = FakeRuntime::new();
    runtime.fail_create.insert("test-1".to_string());
    let runtime = Arc::new(runtime);

    let config = run_config(vec![
        instance("test-0", 8100),
        instance("test-1", 8200),
        instance("test-2", 8300),
    ]);
    let assignments = vec![
        assignment("det-a", "test-0"),
        assignment("det-b", "test-1"),
        assignment("det-c", "test-2"),
    ];

    let (status_tx, mut status_rx) = tokio::sync::mpsc::unbounded_channel();
    let summary = TestRunSupervisor::new(runtime.clone(), config)
        .with_status_stream(status_tx)
        .run(assignments)
        .await;

    assert!(summary.terminated);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].instance, "test-1");
    assert!(matches!(
        summary.errors[0].error,
        WorkerError::Provision(_)
    ));
    assert!(summary.errors[0].error.to_string().contains("test-1"));

    // The healthy siblings still provisioned and everything was torn down
    let mut running = HashSet::new();
    while let Some(line) = status_rx.recv().await {
        if line.message == "sandbox running" {
            running.insert(line.instance);
        }
    }
    assert_eq!(
        running,
        HashSet::from(["test-0".to_string(), "test-2".to_string()])
    );
    assert!(summary.teardown_failures.is_empty());
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn clean_run_keeps_the_flag_clear_and_tests_everything() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = run_config(vec![
        instance("test-0", 8100),
        instance("test-1", 8200),
        instance("test-2", 8300),
    ]);

    let mut assignments = Vec::new();
    for (index, name) in ["det-a", "det-b", "det-c", "det-d", "det-e", "det-f"]
        .into_iter()
        .enumerate()
    {
        assignments.push(assignment(name, &format!("test-{}", index % 3)));
    }

    let summary = TestRunSupervisor::new(runtime.clone(), config)
        .run(assignments)
        .await;

    assert!(!summary.terminated);
    assert!(!summary.failed());
    assert!(summary.errors.is_empty());
    assert!(summary.teardown_failures.is_empty());
    assert_eq!(summary.results.len(), 6);
    assert!(summary
        .results
        .iter()
        .all(|r| r.status == TestStatus::Passed));
    assert!(runtime.live_containers().is_empty());
}

#[tokio::test]
async fn failing_detections_are_results_not_run_failures() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = run_config(vec![instance("test-0", 8100)]);

    let assignments = vec![
        assignment("det-pass", "test-0"),
        TestAssignment {
            detection: Detection {
                name: "det-fail".to_string(),
                source: "exit 1".to_string(),
            },
            instance: "test-0".to_string(),
        },
    ];

    let summary = TestRunSupervisor::new(runtime, config).run(assignments).await;

    assert!(!summary.terminated);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[0].status, TestStatus::Passed);
    assert_eq!(summary.results[1].status, TestStatus::Failed);
    assert!(summary.results[1].diagnostic.contains("exit code 1"));
}

#[tokio::test]
async fn teardown_failure_is_reported_while_siblings_stay_clean() {
    let mut runtime = FakeRuntime::new();
    runtime.fail_remove_existing.insert("test-0".to_string());
    let runtime = Arc::new(runtime);

    let config = run_config(vec![instance("test-0", 8100), instance("test-1", 8200)]);
    let assignments = vec![
        assignment("det-a", "test-0"),
        assignment("det-b", "test-1"),
    ];

    let summary = TestRunSupervisor::new(runtime.clone(), config)
        .run(assignments)
        .await;

    // The tests themselves completed; only cleanup of test-0 failed
    assert!(!summary.terminated);
    assert_eq!(summary.results.len(), 2);
    assert!(summary.errors.is_empty());
    assert_eq!(summary.teardown_failures.len(), 1);
    assert_eq!(summary.teardown_failures[0].instance, "test-0");

    // The leaked sandbox is still there for the operator; the sibling is gone
    assert_eq!(runtime.live_containers(), vec!["test-0".to_string()]);
}

#[tokio::test]
async fn assignments_for_unknown_instances_are_skipped() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = run_config(vec![instance("test-0", 8100)]);
    let assignments = vec![
        assignment("det-a", "test-0"),
        assignment("det-b", "no-such-instance"),
    ];

    let summary = TestRunSupervisor::new(runtime, config).run(assignments).await;

    assert!(!summary.terminated);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].detection, "det-a");
}
