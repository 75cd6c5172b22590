// ABOUTME: Data model for detection test scheduling and results
// ABOUTME: Detections, per-instance assignments, and the pass/fail/error outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A detection to test. Opaque to the orchestrator beyond its name and a
/// source runnable inside a sandbox; schema parsing and validation happen
/// upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub name: String,
    pub source: String,
}

/// A detection scheduled onto a specific sandbox instance. Consumed exactly
/// once by the worker owning that instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestAssignment {
    pub detection: Detection,
    pub instance: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Error => "error",
        }
    }
}

/// Outcome of one assignment. Append-only per worker; merged by the
/// supervisor at join time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub detection: String,
    pub instance: String,
    pub status: TestStatus,
    pub diagnostic: String,
    pub recorded_at: DateTime<Utc>,
}

impl TestResult {
    pub fn new(
        detection: &Detection,
        instance: &str,
        status: TestStatus,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            detection: detection.name.clone(),
            instance: instance.to_string(),
            status,
            diagnostic: diagnostic.into(),
            recorded_at: Utc::now(),
        }
    }
}
