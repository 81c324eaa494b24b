// Bounded pool of execution contexts

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::classify::{classify, ConnectionMode, LocalHostSet};
use super::credential::Credential;
use super::job::JobId;
use crate::config::check_throttle_limit;
use crate::output::errors::ScanError;

/// Timing record for one job, shared between the control loop and workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTimer {
    /// Set by the dispatcher when the job is submitted
    pub submitted: Instant,
    /// Set by the worker when the payload starts
    pub began: Option<Instant>,
    /// Set by the worker when the payload returns
    pub finished: Option<Instant>,
}

impl JobTimer {
    /// Time from submission to payload return, or to `now` if unfinished
    pub fn duration(&self, now: Instant) -> Duration {
        self.finished
            .unwrap_or(now)
            .saturating_duration_since(self.submitted)
    }
}

/// Synchronized map of per-job timers
#[derive(Debug, Clone, Default)]
pub struct JobTimers {
    inner: Arc<DashMap<JobId, JobTimer>>,
}

impl JobTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, id: JobId, at: Instant) {
        self.inner.insert(
            id,
            JobTimer {
                submitted: at,
                began: None,
                finished: None,
            },
        );
    }

    pub fn mark_began(&self, id: JobId, at: Instant) {
        if let Some(mut timer) = self.inner.get_mut(&id) {
            timer.began = Some(at);
        }
    }

    pub fn mark_finished(&self, id: JobId, at: Instant) {
        if let Some(mut timer) = self.inner.get_mut(&id) {
            timer.finished = Some(at);
        }
    }

    pub fn get(&self, id: JobId) -> Option<JobTimer> {
        self.inner.get(&id).map(|t| *t)
    }

    pub fn remove(&self, id: JobId) -> Option<JobTimer> {
        self.inner.remove(&id).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// State every context is seeded with when the pool opens
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    pub local_hosts: LocalHostSet,
    pub credential: Option<Credential>,
    pub timers: JobTimers,
}

/// One slot of concurrency capacity
///
/// Each context owns its own copy of the local host set and credential. Only
/// the timer map is shared with the control loop.
#[derive(Debug)]
pub struct ExecutionContext {
    slot: usize,
    local_hosts: LocalHostSet,
    credential: Option<Credential>,
    timers: JobTimers,
}

impl ExecutionContext {
    fn seeded(slot: usize, shared: &SharedState) -> Self {
        ExecutionContext {
            slot,
            local_hosts: shared.local_hosts.clone(),
            credential: shared.credential.clone(),
            timers: shared.timers.clone(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn local_hosts(&self) -> &LocalHostSet {
        &self.local_hosts
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn timers(&self) -> &JobTimers {
        &self.timers
    }

    /// Classify `target` against this context's own snapshot
    pub fn classify(&self, target: &str, force_remote: bool) -> ConnectionMode {
        classify(
            target,
            force_remote,
            self.credential.as_ref(),
            &self.local_hosts,
        )
    }
}

/// Exclusive use of one context; returns the slot to the pool on drop
#[derive(Debug)]
pub struct ContextLease {
    context: Arc<ExecutionContext>,
    free: Arc<Mutex<Vec<usize>>>,
    _permit: OwnedSemaphorePermit,
}

impl ContextLease {
    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        // Slot goes back before the permit is released by field drop
        self.free.lock().push(self.context.slot);
    }
}

/// Fixed-size pool of execution contexts
pub struct ExecutionPool {
    contexts: Mutex<Vec<Arc<ExecutionContext>>>,
    free: Arc<Mutex<Vec<usize>>>,
    permits: Arc<Semaphore>,
    size: usize,
    closed: AtomicBool,
}

impl ExecutionPool {
    /// Open a pool of `size` contexts, each seeded from `shared`
    pub fn open(size: usize, shared: SharedState) -> Result<Self, ScanError> {
        check_throttle_limit(size)?;

        let contexts: Vec<_> = (0..size)
            .map(|slot| Arc::new(ExecutionContext::seeded(slot, &shared)))
            .collect();
        // Reversed so slot 0 is handed out first
        let free: Vec<usize> = (0..size).rev().collect();

        tracing::info!(size, "execution pool opened");

        Ok(ExecutionPool {
            contexts: Mutex::new(contexts),
            free: Arc::new(Mutex::new(free)),
            permits: Arc::new(Semaphore::new(size)),
            size,
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Contexts not currently leased
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Lease a free context without waiting
    pub fn try_acquire(&self) -> Option<ContextLease> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        self.lease(permit)
    }

    /// Lease a context, waiting until one is free
    pub async fn acquire(&self) -> Result<ContextLease, ScanError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| pool_closed())?;
        self.lease(permit).ok_or_else(pool_closed)
    }

    fn lease(&self, permit: OwnedSemaphorePermit) -> Option<ContextLease> {
        let slot = self.free.lock().pop()?;
        let context = self.contexts.lock().get(slot).cloned()?;
        Some(ContextLease {
            context,
            free: self.free.clone(),
            _permit: permit,
        })
    }

    /// Release every context
    ///
    /// Returns the number of contexts released. Closing an already closed
    /// pool releases nothing and returns 0.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        self.permits.close();
        let released = std::mem::take(&mut *self.contexts.lock()).len();
        tracing::info!(released, "execution pool closed");
        released
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn pool_closed() -> ScanError {
    ScanError::Config {
        message: "execution pool is closed".to_string(),
        suggestion: None,
    }
}
