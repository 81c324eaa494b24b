// Event system for progress reporting

use std::time::Duration;
use tokio::sync::mpsc;

use crate::engine::{ConnectionMode, JobId};

/// Completion snapshot: how many submitted targets have resolved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };
        Progress {
            completed,
            total,
            percent,
        }
    }

    pub fn is_done(&self) -> bool {
        self.completed >= self.total
    }
}

/// Events emitted while a scan runs
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A job was handed a context
    JobStarted {
        job_id: JobId,
        target: String,
        mode: ConnectionMode,
    },

    /// Payload returned a result
    JobCompleted {
        job_id: JobId,
        target: String,
        duration: Duration,
    },

    /// Payload returned an error, panicked, or was abandoned
    JobFailed {
        job_id: JobId,
        target: String,
        error: String,
    },

    /// Job crossed the timeout and was abandoned
    JobTimedOut {
        job_id: JobId,
        target: String,
        elapsed: Duration,
    },

    /// Emitted after each drain pass when progress is enabled
    Progress(Progress),
}

/// Event emitter for sending scan events
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the given channel
    pub fn new(tx: mpsc::UnboundedSender<ScanEvent>) -> Self {
        EventEmitter { tx }
    }

    /// Create an emitter together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ScanEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventEmitter { tx }, rx)
    }

    pub fn job_started(&self, job_id: JobId, target: String, mode: ConnectionMode) {
        let _ = self.tx.send(ScanEvent::JobStarted {
            job_id,
            target,
            mode,
        });
    }

    pub fn job_completed(&self, job_id: JobId, target: String, duration: Duration) {
        let _ = self.tx.send(ScanEvent::JobCompleted {
            job_id,
            target,
            duration,
        });
    }

    pub fn job_failed(&self, job_id: JobId, target: String, error: String) {
        let _ = self.tx.send(ScanEvent::JobFailed {
            job_id,
            target,
            error,
        });
    }

    pub fn job_timed_out(&self, job_id: JobId, target: String, elapsed: Duration) {
        let _ = self.tx.send(ScanEvent::JobTimedOut {
            job_id,
            target,
            elapsed,
        });
    }

    pub fn progress(&self, progress: Progress) {
        let _ = self.tx.send(ScanEvent::Progress(progress));
    }
}
