// ABOUTME: Run-wide coordination shared by all workers in a test run
// ABOUTME: Carries the once-only cooperative termination flag and the serialized status sink

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One line of live progress output, attributed to the instance that
/// produced it.
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub timestamp: DateTime<Utc>,
    pub instance: String,
    pub message: String,
}

/// State shared by reference across every worker in a run.
///
/// The termination flag is write-once-true: once any worker requests
/// termination it never reverts, and every other worker observes it on its
/// next poll or scheduling decision. Status lines go through an mpsc channel,
/// so concurrent workers never interleave partial writes.
pub struct RunCoordinator {
    terminate: AtomicBool,
    sink: mpsc::UnboundedSender<StatusLine>,
}

impl RunCoordinator {
    /// Create a coordinator and the receiving end of its status sink.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StatusLine>) {
        let (sink, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                terminate: AtomicBool::new(false),
                sink,
            }),
            receiver,
        )
    }

    /// Request cooperative termination of the whole run.
    ///
    /// Returns `true` only for the first caller; later calls are no-ops.
    pub fn request_termination(&self) -> bool {
        !self.terminate.swap(true, Ordering::AcqRel)
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Emit one status line. Send failures mean the run is over and the
    /// receiver is gone; the line is dropped.
    pub fn report(&self, instance: &str, message: impl Into<String>) {
        let _ = self.sink.send(StatusLine {
            timestamp: Utc::now(),
            instance: instance.to_string(),
            message: message.into(),
        });
    }
}
