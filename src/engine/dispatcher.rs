// Job dispatcher and completion poller

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::aggregate::{HostResult, ResultAggregator};
use super::classify::{ConnectionMode, LocalHostSet};
use super::job::{Job, JobError, JobId};
use super::pool::{ExecutionPool, JobTimers, SharedState};
use super::{Payload, Route};
use crate::config::ScanConfig;
use crate::output::errors::ScanError;
use crate::output::events::{EventEmitter, Progress};

/// Submission and completion counters for one run
#[derive(Debug, Default)]
pub struct RunState {
    submitted: AtomicUsize,
    completed: AtomicUsize,
}

impl RunState {
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.completed(), self.submitted())
    }
}

/// Fans a payload out over targets through a bounded context pool
///
/// The dispatcher owns the only control loop. It never awaits an individual
/// job; it polls all of them in [`Dispatcher::drain_pass`].
pub struct Dispatcher<P: Payload> {
    payload: Arc<P>,
    pool: ExecutionPool,
    timers: JobTimers,
    run: Arc<RunState>,
    active: Vec<Job<P::Output>>,
    results: ResultAggregator<P::Output>,
    next_id: u64,
    timeout: Option<Duration>,
    poll_interval: Duration,
    force_remote: bool,
    show_progress: bool,
    events: Option<EventEmitter>,
}

impl<P: Payload> Dispatcher<P> {
    /// Validate `config` and open the context pool
    pub fn open(
        config: &ScanConfig,
        local_hosts: LocalHostSet,
        payload: P,
    ) -> Result<Self, ScanError> {
        config.validate()?;

        let timers = JobTimers::new();
        let shared = SharedState {
            local_hosts,
            credential: config.credential.clone(),
            timers: timers.clone(),
        };
        let pool = ExecutionPool::open(config.throttle_limit, shared)?;

        let run = Arc::new(RunState::default());
        run.reset();

        Ok(Dispatcher {
            payload: Arc::new(payload),
            pool,
            timers,
            run,
            active: Vec::new(),
            results: ResultAggregator::new(),
            next_id: 1,
            timeout: config.timeout,
            poll_interval: config.poll_interval,
            force_remote: config.force_remote,
            show_progress: config.show_progress,
            events: None,
        })
    }

    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    /// Jobs submitted but not yet resolved
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn results(&self) -> &ResultAggregator<P::Output> {
        &self.results
    }

    /// Start one job for `target`
    ///
    /// Waits for a free context when the pool is saturated, draining finished
    /// jobs while it waits. Ends with one non-blocking drain pass.
    pub async fn submit(&mut self, target: impl Into<String>) -> Result<JobId, ScanError> {
        let target = target.into();

        let lease = loop {
            if self.pool.is_closed() {
                return Err(ScanError::config("cannot submit to a closed execution pool"));
            }
            if let Some(lease) = self.pool.try_acquire() {
                break lease;
            }
            self.drain_pass();
            if self.pool.available() == 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        let id = JobId(self.next_id);
        self.next_id += 1;

        let context = lease.context().clone();
        let mode = context.classify(&target, self.force_remote);
        let route = match mode {
            ConnectionMode::Local => Route::local(),
            ConnectionMode::Remote => Route::remote(context.credential().cloned()),
        };

        let started_at = Instant::now();
        self.timers.start(id, started_at);

        let payload = self.payload.clone();
        let worker_target = target.clone();
        let handle = tokio::spawn(async move {
            let timers = context.timers();
            timers.mark_began(id, Instant::now());
            let outcome = payload
                .collect(&worker_target, &route)
                .await
                .map_err(|e| JobError::Payload(e.to_string()));
            timers.mark_finished(id, Instant::now());
            outcome
        });

        tracing::debug!(job_id = id.0, host = %target, mode = %mode, "job submitted");
        if let Some(ref emitter) = self.events {
            emitter.job_started(id, target.clone(), mode);
        }

        self.active
            .push(Job::new(id, target, mode, started_at, handle, lease));
        self.run.submitted.fetch_add(1, Ordering::Relaxed);

        self.drain_pass();
        Ok(id)
    }

    /// One poll over every active job
    ///
    /// Reaps finished jobs, abandons those past the timeout, and returns
    /// whether any job is still pending.
    pub fn drain_pass(&mut self) -> bool {
        let now = Instant::now();
        let mut pending = false;
        let mut i = 0;

        while i < self.active.len() {
            match self.active[i].step(now, self.timeout) {
                Some(outcome) => {
                    let job = self.active.swap_remove(i);
                    self.resolve(job, outcome, now);
                }
                None => {
                    pending = true;
                    i += 1;
                }
            }
        }

        if self.show_progress {
            if let Some(ref emitter) = self.events {
                emitter.progress(self.run.progress());
            }
        }

        pending
    }

    /// Poll until no job is pending (`wait`), or once (`!wait`)
    pub async fn drain(&mut self, wait: bool) -> bool {
        loop {
            let pending = self.drain_pass();
            if !wait || !pending {
                return pending;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Abandon anything still active and release the pool
    ///
    /// Returns the number of contexts released; 0 when already closed.
    pub fn close(&mut self) -> usize {
        let now = Instant::now();
        for mut job in std::mem::take(&mut self.active) {
            if let Some(outcome) = job.abandon() {
                tracing::warn!(job_id = job.id.0, host = %job.target, "job abandoned at close");
                self.resolve(job, outcome, now);
            }
        }
        self.pool.close()
    }

    /// Close the pool and hand back every result in arrival order
    pub fn finish(mut self) -> Vec<HostResult<P::Output>> {
        self.close();
        std::mem::take(&mut self.results).collect()
    }

    fn resolve(&mut self, job: Job<P::Output>, outcome: Result<P::Output, JobError>, now: Instant) {
        let duration = self
            .timers
            .remove(job.id)
            .map(|t| t.duration(now))
            .unwrap_or_else(|| job.elapsed(now));

        match &outcome {
            Ok(_) => {
                tracing::debug!(
                    job_id = job.id.0,
                    host = %job.target,
                    elapsed_ms = duration.as_millis() as u64,
                    "job completed"
                );
                if let Some(ref emitter) = self.events {
                    emitter.job_completed(job.id, job.target.clone(), duration);
                }
            }
            Err(JobError::Timeout { elapsed, .. }) => {
                tracing::warn!(
                    job_id = job.id.0,
                    host = %job.target,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job timed out, abandoning"
                );
                if let Some(ref emitter) = self.events {
                    emitter.job_timed_out(job.id, job.target.clone(), *elapsed);
                }
            }
            Err(e) => {
                tracing::debug!(job_id = job.id.0, host = %job.target, error = %e, "job failed");
                if let Some(ref emitter) = self.events {
                    emitter.job_failed(job.id, job.target.clone(), e.to_string());
                }
            }
        }

        self.run.completed.fetch_add(1, Ordering::Relaxed);
        self.results.record(HostResult {
            job_id: job.id,
            target: job.target,
            mode: job.mode,
            timestamp: Utc::now(),
            duration,
            outcome,
        });
    }
}

/// Run `payload` against every target and wait for all of them
///
/// Fails only on invalid configuration, before anything is submitted. Every
/// target yields exactly one result, whether it succeeded, failed or timed out.
pub async fn run<P, I>(
    config: &ScanConfig,
    local_hosts: LocalHostSet,
    payload: P,
    targets: I,
    events: Option<EventEmitter>,
) -> Result<Vec<HostResult<P::Output>>, ScanError>
where
    P: Payload,
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut dispatcher = Dispatcher::open(config, local_hosts, payload)?;
    if let Some(emitter) = events {
        dispatcher = dispatcher.with_events(emitter);
    }

    for target in targets {
        dispatcher.submit(target).await?;
    }
    dispatcher.drain(true).await;

    Ok(dispatcher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Credential;
    use crate::output::events::ScanEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct FakeError(String);

    #[derive(Clone, Copy)]
    enum Behavior {
        Sleep(u64),
        Fail,
        Hang,
        Panic,
    }

    /// Payload whose per-target behavior is scripted
    #[derive(Default)]
    struct FakePayload {
        behaviors: HashMap<String, Behavior>,
        default_delay_ms: u64,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        calls: Arc<Mutex<Vec<(String, ConnectionMode, Option<String>)>>>,
    }

    impl FakePayload {
        fn with(mut self, target: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(target.to_string(), behavior);
            self
        }

        fn delay(mut self, ms: u64) -> Self {
            self.default_delay_ms = ms;
            self
        }
    }

    #[async_trait]
    impl Payload for FakePayload {
        type Output = String;
        type Error = FakeError;

        async fn collect(&self, target: &str, route: &Route) -> Result<String, FakeError> {
            self.calls.lock().push((
                target.to_string(),
                route.mode,
                route.credential.as_ref().map(|c| c.user.clone()),
            ));

            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let behavior = self
                .behaviors
                .get(target)
                .copied()
                .unwrap_or(Behavior::Sleep(self.default_delay_ms));

            let outcome = match behavior {
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(format!("tasks@{}", target))
                }
                Behavior::Fail => Err(FakeError(format!("{} unreachable", target))),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Panic => panic!("payload exploded"),
            };

            self.running.fetch_sub(1, Ordering::SeqCst);
            outcome
        }
    }

    fn config(limit: usize) -> ScanConfig {
        ScanConfig::default()
            .with_throttle_limit(limit)
            .with_poll_interval(Duration::from_millis(10))
    }

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("host{:02}", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_target_yields_exactly_one_result() {
        for limit in [1, 3, 64] {
            let payload = FakePayload::default()
                .delay(20)
                .with("host03", Behavior::Fail)
                .with("host07", Behavior::Fail);

            let results = run(&config(limit), LocalHostSet::loopback(), payload, targets(25), None)
                .await
                .unwrap();

            assert_eq!(results.len(), 25);
            let seen: HashSet<_> = results.iter().map(|r| r.target.clone()).collect();
            assert_eq!(seen, targets(25).into_iter().collect::<HashSet<_>>());
            assert_eq!(results.iter().filter(|r| !r.is_ok()).count(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_jobs_never_exceed_limit() {
        for limit in [1, 2, 5] {
            let payload = FakePayload::default().delay(30);
            let peak = payload.peak.clone();

            let mut dispatcher =
                Dispatcher::open(&config(limit), LocalHostSet::loopback(), payload).unwrap();
            for target in targets(17) {
                dispatcher.submit(target).await.unwrap();
                assert!(dispatcher.active_len() <= limit);
            }
            dispatcher.drain(true).await;

            assert_eq!(dispatcher.finish().len(), 17);
            assert!(peak.load(Ordering::SeqCst) <= limit);
            assert!(peak.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_target_times_out_without_holding_up_the_batch() {
        let payload = FakePayload::default()
            .with("A", Behavior::Sleep(50))
            .with("B", Behavior::Sleep(50))
            .with("C", Behavior::Sleep(500));
        let cfg = config(2).with_timeout(Duration::from_millis(200));

        let start = Instant::now();
        let results = run(&cfg, LocalHostSet::loopback(), payload, ["A", "B", "C"], None)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        let by_target: HashMap<_, _> = results.iter().map(|r| (r.target.as_str(), r)).collect();
        assert!(by_target["A"].is_ok());
        assert!(by_target["B"].is_ok());
        assert!(by_target["C"].is_timeout());
        assert!(by_target["C"].duration >= Duration::from_millis(200));

        // C starts once A or B frees a slot, then times out well before 500ms
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_jobs_finishing_in_one_pass_are_all_completed() {
        // More finished handles than one task turn's coop budget, all reaped
        // in the same pass that also crosses the timeout
        let payload = FakePayload::default().delay(95);
        let cfg = ScanConfig::default()
            .with_throttle_limit(300)
            .with_timeout(Duration::from_millis(100))
            .with_poll_interval(Duration::from_millis(100));

        let results = run(&cfg, LocalHostSet::loopback(), payload, targets(300), None)
            .await
            .unwrap();

        assert_eq!(results.len(), 300);
        let timed_out = results.iter().filter(|r| r.is_timeout()).count();
        assert_eq!(timed_out, 0);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_target_resolves_within_timeout_plus_poll() {
        let payload = FakePayload::default().with("stuck", Behavior::Hang);
        let cfg = ScanConfig::default()
            .with_throttle_limit(4)
            .with_timeout(Duration::from_millis(300));

        let start = Instant::now();
        let results = run(&cfg, LocalHostSet::loopback(), payload, ["stuck"], None)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(results.len(), 1);
        match &results[0].outcome {
            Err(JobError::Timeout { limit, .. }) => {
                assert_eq!(*limit, Duration::from_millis(300))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(elapsed <= Duration::from_millis(300) + cfg.poll_interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_context_is_reused() {
        // Two hung targets on one context must not stall the third
        let payload = FakePayload::default()
            .with("h1", Behavior::Hang)
            .with("h2", Behavior::Hang)
            .with("ok", Behavior::Sleep(10));
        let cfg = config(1).with_timeout(Duration::from_millis(100));

        let results = run(&cfg, LocalHostSet::loopback(), payload, ["h1", "h2", "ok"], None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_timeout()).count(), 2);
        assert!(results.iter().any(|r| r.target == "ok" && r.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_payload_failure_and_panic_are_isolated() {
        let payload = FakePayload::default()
            .delay(5)
            .with("bad", Behavior::Fail)
            .with("boom", Behavior::Panic);

        let results = run(
            &config(4),
            LocalHostSet::loopback(),
            payload,
            ["good1", "bad", "boom", "good2"],
            None,
        )
        .await
        .unwrap();

        let by_target: HashMap<_, _> = results.iter().map(|r| (r.target.as_str(), r)).collect();
        assert!(by_target["good1"].is_ok());
        assert!(by_target["good2"].is_ok());
        assert_eq!(
            by_target["bad"].error(),
            Some(&JobError::Payload("bad unreachable".to_string()))
        );
        assert_eq!(
            by_target["boom"].error(),
            Some(&JobError::Panicked("payload exploded".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_localhost_without_credential_runs_local() {
        let payload = FakePayload::default();
        let calls = payload.calls.clone();

        let results = run(&config(2), LocalHostSet::loopback(), payload, ["localhost"], None)
            .await
            .unwrap();

        assert_eq!(results[0].mode, ConnectionMode::Local);
        assert_eq!(
            calls.lock().as_slice(),
            &[("localhost".to_string(), ConnectionMode::Local, None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_routes_remote_targets() {
        let payload = FakePayload::default();
        let calls = payload.calls.clone();
        let cfg = config(2).with_credential(Credential::new("ops").with_password("pw"));

        let results = run(&cfg, LocalHostSet::loopback(), payload, ["127.0.0.1", "web01"], None)
            .await
            .unwrap();

        let modes: HashMap<_, _> = results.iter().map(|r| (r.target.as_str(), r.mode)).collect();
        assert_eq!(modes["127.0.0.1"], ConnectionMode::Local);
        assert_eq!(modes["web01"], ConnectionMode::Remote);

        let calls = calls.lock();
        let remote = calls.iter().find(|c| c.0 == "web01").unwrap();
        assert_eq!(remote.2.as_deref(), Some("ops"));
        let local = calls.iter().find(|c| c.0 == "127.0.0.1").unwrap();
        assert_eq!(local.2, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_remote_covers_local_aliases() {
        let payload = FakePayload::default();
        let cfg = config(2).with_force_remote(true);

        let results = run(&cfg, LocalHostSet::loopback(), payload, ["localhost", "::1"], None)
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.mode == ConnectionMode::Remote));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_submission() {
        let payload = FakePayload::default();
        let calls = payload.calls.clone();

        let err = run(&config(0), LocalHostSet::loopback(), payload, ["web01"], None)
            .await
            .unwrap_err();

        assert!(err.is_config());
        assert!(calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_abandons_active_jobs_once() {
        let payload = FakePayload::default().with("stuck", Behavior::Hang);
        let mut dispatcher =
            Dispatcher::open(&config(3), LocalHostSet::loopback(), payload).unwrap();

        dispatcher.submit("stuck").await.unwrap();
        assert!(dispatcher.drain(false).await);
        assert_eq!(dispatcher.active_len(), 1);

        assert_eq!(dispatcher.close(), 3);
        assert_eq!(dispatcher.close(), 0);
        assert_eq!(dispatcher.active_len(), 0);
        assert!(dispatcher.submit("late").await.is_err());

        let results = dispatcher.finish();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error(), Some(&JobError::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_ids_are_monotonic() {
        let payload = FakePayload::default().delay(1);
        let mut dispatcher =
            Dispatcher::open(&config(2), LocalHostSet::loopback(), payload).unwrap();

        let mut ids = Vec::new();
        for target in targets(5) {
            ids.push(dispatcher.submit(target).await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids[0], JobId(1));

        dispatcher.drain(true).await;
        assert_eq!(dispatcher.run_state().submitted(), 5);
        assert_eq!(dispatcher.run_state().completed(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_serializes_submission() {
        let payload = FakePayload::default().delay(100);
        let start = Instant::now();

        let results = run(&config(1), LocalHostSet::loopback(), payload, ["a", "b"], None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_events_reach_full_completion() {
        let (emitter, mut rx) = EventEmitter::channel();
        let payload = FakePayload::default().delay(15).with("bad", Behavior::Fail);
        let cfg = config(2).with_progress(true);

        run(&cfg, LocalHostSet::loopback(), payload, ["a", "bad", "c"], Some(emitter))
            .await
            .unwrap();

        let mut started = 0;
        let mut finished = 0;
        let mut last_progress = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                ScanEvent::JobStarted { .. } => started += 1,
                ScanEvent::JobCompleted { .. }
                | ScanEvent::JobFailed { .. }
                | ScanEvent::JobTimedOut { .. } => finished += 1,
                ScanEvent::Progress(p) => last_progress = Some(p),
            }
        }

        assert_eq!(started, 3);
        assert_eq!(finished, 3);
        let last = last_progress.unwrap();
        assert_eq!((last.completed, last.total), (3, 3));
        assert_eq!(last.percent, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_progress_events_when_disabled() {
        let (emitter, mut rx) = EventEmitter::channel();
        run(
            &config(2),
            LocalHostSet::loopback(),
            FakePayload::default(),
            ["a"],
            Some(emitter),
        )
        .await
        .unwrap();

        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, ScanEvent::Progress(_)));
        }
    }
}
