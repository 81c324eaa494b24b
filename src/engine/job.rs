// In-flight jobs and their terminal outcomes

use std::any::Any;
use std::fmt;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::classify::ConnectionMode;
use super::pool::ContextLease;

/// Monotonic job identifier, unique within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a job. Transitions only go forward, once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed,
    TimedOut,
    /// Still running when the pool closed
    Abandoned,
}

/// Why a target did not produce a payload result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("timed out after {}ms (limit {}ms)", .elapsed.as_millis(), .limit.as_millis())]
    Timeout { elapsed: Duration, limit: Duration },

    #[error("{0}")]
    Payload(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("abandoned before completion")]
    Abandoned,
}

/// Handle to the spawned payload task
pub type JobHandle<T> = JoinHandle<Result<T, JobError>>;

/// One unit of work bound to exactly one target
pub struct Job<T> {
    pub id: JobId,
    pub target: String,
    pub mode: ConnectionMode,
    pub started_at: Instant,
    state: JobState,
    handle: Option<JobHandle<T>>,
    lease: Option<ContextLease>,
}

impl<T: Send + 'static> Job<T> {
    pub(crate) fn new(
        id: JobId,
        target: String,
        mode: ConnectionMode,
        started_at: Instant,
        handle: JobHandle<T>,
        lease: ContextLease,
    ) -> Self {
        Job {
            id,
            target,
            mode,
            started_at,
            state: JobState::Running,
            handle: Some(handle),
            lease: Some(lease),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Advance the job one poll step
    ///
    /// Returns the terminal outcome the first time the job finishes or crosses
    /// `timeout`, and `None` while it is still running. A resolved job never
    /// yields a second outcome.
    pub(crate) fn step(
        &mut self,
        now: Instant,
        timeout: Option<Duration>,
    ) -> Option<Result<T, JobError>> {
        if self.state != JobState::Running {
            return None;
        }

        if let Some(outcome) = self.try_take() {
            self.state = JobState::Completed;
            self.dispose();
            return Some(outcome);
        }

        // Finished but not readable yet; reap it on the next pass
        if self.is_finished() {
            return None;
        }

        match timeout {
            Some(limit) if self.elapsed(now) >= limit => {
                let elapsed = self.elapsed(now);
                self.state = JobState::TimedOut;
                self.dispose();
                Some(Err(JobError::Timeout { elapsed, limit }))
            }
            _ => None,
        }
    }

    /// Stop tracking a job that is still running
    pub(crate) fn abandon(&mut self) -> Option<Result<T, JobError>> {
        if self.state != JobState::Running {
            return None;
        }
        self.state = JobState::Abandoned;
        self.dispose();
        Some(Err(JobError::Abandoned))
    }

    fn try_take(&mut self) -> Option<Result<T, JobError>> {
        let handle = self.handle.as_mut()?;
        if !handle.is_finished() {
            return None;
        }

        // Outside the coop budget: a finished handle must read as ready
        match tokio::task::unconstrained(handle).now_or_never()? {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_panic() => Some(Err(JobError::Panicked(panic_message(e.into_panic())))),
            Err(e) => Some(Err(JobError::Payload(e.to_string()))),
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    // Dropping the JoinHandle detaches the task instead of aborting it: a
    // timed-out payload keeps running until it returns on its own.
    fn dispose(&mut self) {
        self.handle.take();
        self.lease.take();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
