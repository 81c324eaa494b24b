// Per-target results and their collection

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::classify::ConnectionMode;
use super::job::{JobError, JobId};

/// Terminal status of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Ok,
    Failed,
    TimedOut,
}

/// The one record every submitted target produces
#[derive(Debug, Clone)]
pub struct HostResult<T> {
    pub job_id: JobId,
    pub target: String,
    pub mode: ConnectionMode,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Result<T, JobError>,
}

impl<T> HostResult<T> {
    pub fn status(&self) -> ResultStatus {
        match &self.outcome {
            Ok(_) => ResultStatus::Ok,
            Err(JobError::Timeout { .. }) => ResultStatus::TimedOut,
            Err(_) => ResultStatus::Failed,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn is_timeout(&self) -> bool {
        self.status() == ResultStatus::TimedOut
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.outcome.as_ref().err()
    }
}

/// Counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanRecap {
    pub ok: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl ScanRecap {
    pub fn total(&self) -> usize {
        self.ok + self.failed + self.timed_out
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.timed_out > 0
    }
}

/// Append-only collection of results in arrival order
#[derive(Debug)]
pub struct ResultAggregator<T> {
    results: Vec<HostResult<T>>,
}

impl<T> ResultAggregator<T> {
    pub fn new() -> Self {
        ResultAggregator {
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: HostResult<T>) {
        self.results.push(result);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostResult<T>> {
        self.results.iter()
    }

    pub fn recap(&self) -> ScanRecap {
        recap(&self.results)
    }

    pub fn collect(self) -> Vec<HostResult<T>> {
        self.results
    }
}

impl<T> Default for ResultAggregator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tally a slice of results
pub fn recap<T>(results: &[HostResult<T>]) -> ScanRecap {
    let mut recap = ScanRecap::default();
    for result in results {
        match result.status() {
            ResultStatus::Ok => recap.ok += 1,
            ResultStatus::Failed => recap.failed += 1,
            ResultStatus::TimedOut => recap.timed_out += 1,
        }
    }
    recap
}
