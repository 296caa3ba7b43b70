//! Cron service: owns the job set, drives the tick loop and runs due jobs on
//! a bounded worker pool.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use clawgate_bus::{MessageBus, delivery_topic};
use clawgate_config::CronSettings;
use clawgate_types::Envelope;

use crate::clock::{Clock, SystemClock};
use crate::error::CronError;
use crate::schedule;
use crate::store::JobStore;
use crate::{CronJob, CronSchedule, JobState};

/// Async job handler: receives the due job, returns the result text.
pub type JobHandler = Arc<
    dyn Fn(CronJob) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>> + Send + Sync,
>;

struct JobSet {
    jobs: Vec<CronJob>,
    /// The last write to the store failed.
    dirty: bool,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Releases a job's in-flight claim when the run ends, however it ends.
struct InFlight<'a> {
    service: &'a CronService,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.service
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Persistent job scheduler.
///
/// All reads and mutations of the job set go through one async mutex, and
/// every mutation rewrites the store before returning.
pub struct CronService {
    store: JobStore,
    jobs: Mutex<JobSet>,
    handler: StdRwLock<Option<JobHandler>>,
    bus: Option<MessageBus>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    workers: Semaphore,
    in_flight: StdMutex<HashSet<String>>,
    tracker: TaskTracker,
    ticker: Mutex<Option<Ticker>>,
}

impl CronService {
    /// Open the store at `path` using the system clock.
    pub fn open(path: impl Into<PathBuf>, settings: &CronSettings) -> Result<Self, CronError> {
        Self::open_with_clock(path, settings, Arc::new(SystemClock))
    }

    /// Open the store at `path`. A missing store starts empty; a corrupt one is an error.
    pub fn open_with_clock(
        path: impl Into<PathBuf>,
        settings: &CronSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CronError> {
        let store = JobStore::new(path);
        let mut jobs = store.load()?;

        let now = clock.now_millis();
        let mut repaired = false;
        for job in jobs
            .iter_mut()
            .filter(|j| j.enabled && j.state.next_run_at_ms.is_none())
        {
            job.state.next_run_at_ms = next_run(job, now);
            if job.state.next_run_at_ms.is_none() {
                warn!(job_id = %job.id, name = %job.name, "Cron job has no future run, disabling");
                job.enabled = false;
            }
            repaired = true;
        }

        info!(
            path = %store.path().display(),
            jobs = jobs.len(),
            "Loaded cron jobs"
        );

        Ok(Self {
            store,
            jobs: Mutex::new(JobSet {
                jobs,
                dirty: repaired,
            }),
            handler: StdRwLock::new(None),
            bus: None,
            clock,
            tick: settings.tick(),
            workers: Semaphore::new(settings.max_concurrent_jobs.max(1)),
            in_flight: StdMutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
            ticker: Mutex::new(None),
        })
    }

    /// Publish results of delivering jobs on `bus`.
    pub fn with_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    // ──────────────────── Job management ────────────────────

    /// Create, schedule and persist a job.
    ///
    /// Names are not deduplicated; callers wanting an upsert look the name up
    /// and remove the stale job first.
    pub async fn add_job(
        &self,
        name: &str,
        schedule: CronSchedule,
        message: &str,
        deliver: bool,
        channel: &str,
        to: &str,
    ) -> Result<CronJob, CronError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CronError::Validation("name is required".into()));
        }
        if message.trim().is_empty() {
            return Err(CronError::Validation("message is required".into()));
        }
        schedule::validate(&schedule)?;

        let now = self.clock.now_millis();
        let Some(next_run_at_ms) = schedule::next_run_after(&schedule, now)? else {
            return Err(schedule::invalid(
                &schedule.describe(),
                "schedule has no future occurrence",
            ));
        };
        let job = CronJob {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            schedule,
            message: message.to_string(),
            deliver,
            channel: channel.to_string(),
            to: to.to_string(),
            enabled: true,
            state: JobState {
                next_run_at_ms: Some(next_run_at_ms),
                ..Default::default()
            },
            created_at_ms: now,
        };

        let mut set = self.jobs.lock().await;
        set.jobs.push(job.clone());
        self.persist(&mut set);

        info!(
            job_id = %job.id,
            name = %job.name,
            schedule = %job.schedule.describe(),
            "Cron job added"
        );
        Ok(job)
    }

    /// Remove a job. Returns `false` if no job has that ID.
    pub async fn remove_job(&self, id: &str) -> bool {
        let mut set = self.jobs.lock().await;
        let Some(index) = set.jobs.iter().position(|j| j.id == id) else {
            return false;
        };
        let job = set.jobs.remove(index);
        self.persist(&mut set);
        info!(job_id = %id, name = %job.name, "Cron job removed");
        true
    }

    /// Enable or disable a job. Returns the updated job, or `None` if unknown.
    ///
    /// Disabling clears the next run; re-enabling schedules from now. A job
    /// whose schedule has no future occurrence stays disabled.
    pub async fn enable_job(&self, id: &str, enabled: bool) -> Option<CronJob> {
        let now = self.clock.now_millis();
        let mut set = self.jobs.lock().await;
        let job = set.jobs.iter_mut().find(|j| j.id == id)?;

        if !enabled {
            job.state.next_run_at_ms = None;
            job.enabled = false;
        } else if !job.enabled {
            job.state.next_run_at_ms = next_run(job, now);
            job.enabled = job.state.next_run_at_ms.is_some();
            if !job.enabled {
                warn!(job_id = %id, name = %job.name, "Cron job has no future run, leaving it disabled");
            }
        }

        let job = job.clone();
        self.persist(&mut set);
        info!(job_id = %id, enabled = job.enabled, "Cron job updated");
        Some(job)
    }

    /// Jobs in insertion order.
    pub async fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        self.jobs
            .lock()
            .await
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        self.jobs
            .lock()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
    }

    /// Register the handler invoked for every due job, replacing any previous one.
    pub fn set_on_job<F, Fut>(&self, handler: F)
    where
        F: Fn(CronJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| Box::pin(handler(job)));
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    fn persist(&self, set: &mut JobSet) {
        match self.store.save(&set.jobs) {
            Ok(()) => {
                if set.dirty {
                    info!("Cron store write succeeded after earlier failure");
                }
                set.dirty = false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist cron jobs, retrying on next change");
                set.dirty = true;
            }
        }
    }

    // ──────────────────── Tick loop ────────────────────

    /// Start the background tick loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), CronError> {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return Err(CronError::AlreadyRunning("cron scheduler".into()));
        }

        let cancel = CancellationToken::new();
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.tick_loop(token).await });
        *ticker = Some(Ticker { cancel, handle });

        info!(tick = ?self.tick, "Cron service started");
        Ok(())
    }

    /// Stop the tick loop and wait for running jobs to finish.
    pub async fn stop(&self) {
        let ticker = self.ticker.lock().await.take();
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            if let Err(e) = ticker.handle.await {
                warn!("Cron tick loop ended abnormally: {e}");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
        info!("Cron service stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.ticker.lock().await.is_some()
    }

    async fn tick_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let due = self.claim_due_jobs().await;
                    if !due.is_empty() {
                        debug!(count = due.len(), "Dispatching due cron jobs");
                    }
                    self.dispatch(due);
                }
            }
        }
    }

    /// Run every currently due job and wait for all of them to finish.
    /// Returns how many jobs ran.
    pub async fn run_due_jobs(self: &Arc<Self>) -> usize {
        let handles = self.dispatch(self.claim_due_jobs().await);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Cron worker ended abnormally: {e}");
            }
        }
        count
    }

    /// Run one job immediately on the caller's task, outside the worker pool.
    pub async fn run_job_now(&self, id: &str) -> Result<CronJob, CronError> {
        let job = self
            .get_job(id)
            .await
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;
        let _claim = self
            .claim(id)
            .ok_or_else(|| CronError::AlreadyRunning(format!("job {id}")))?;
        self.execute(job)
            .await
            .ok_or_else(|| CronError::NotFound(id.to_string()))
    }

    /// Collect due jobs that are not already running and mark them in flight.
    async fn claim_due_jobs(&self) -> Vec<CronJob> {
        let now = self.clock.now_millis();
        let mut set = self.jobs.lock().await;
        if set.dirty {
            self.persist(&mut set);
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        set.jobs
            .iter()
            .filter(|j| j.is_due(now))
            .filter(|j| {
                let claimed = in_flight.insert(j.id.clone());
                if !claimed {
                    debug!(job_id = %j.id, "Cron job still running, skipping");
                }
                claimed
            })
            .cloned()
            .collect()
    }

    fn claim(&self, id: &str) -> Option<InFlight<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
        inserted.then(|| InFlight {
            service: self,
            id: id.to_string(),
        })
    }

    fn dispatch(self: &Arc<Self>, jobs: Vec<CronJob>) -> Vec<JoinHandle<()>> {
        jobs.into_iter()
            .map(|job| {
                let this = Arc::clone(self);
                self.tracker.spawn(async move {
                    let _claim = InFlight {
                        service: &this,
                        id: job.id.clone(),
                    };
                    let Ok(_permit) = this.workers.acquire().await else {
                        return;
                    };
                    this.execute(job).await;
                })
            })
            .collect()
    }

    /// Invoke the handler for `job`, record the outcome and deliver the result.
    /// Returns the updated job, or `None` if it was removed while running.
    async fn execute(&self, job: CronJob) -> Option<CronJob> {
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let started = self.clock.now_millis();
        info!(job_id = %job.id, name = %job.name, "Running cron job");

        let result = match handler {
            Some(handler) => AssertUnwindSafe(handler(job.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow!("job handler panicked"))),
            None => Err(anyhow!("no job handler registered")),
        };

        match &result {
            Ok(_) => info!(job_id = %job.id, "Cron job finished"),
            Err(e) => warn!(job_id = %job.id, error = %format!("{e:#}"), "Cron job failed"),
        }

        if let (true, Ok(text)) = (job.deliver, &result) {
            self.deliver(&job, text);
        }
        self.record_run(&job.id, started, result).await
    }

    async fn record_run(
        &self,
        id: &str,
        started: i64,
        result: anyhow::Result<String>,
    ) -> Option<CronJob> {
        let mut set = self.jobs.lock().await;
        let Some(job) = set.jobs.iter_mut().find(|j| j.id == id) else {
            debug!(job_id = %id, "Cron job removed while running");
            return None;
        };

        job.state.last_run_at_ms = Some(started);
        job.state.run_count += 1;
        match result {
            Ok(text) => {
                job.state.last_result = Some(text);
                job.state.last_error = None;
            }
            Err(e) => {
                job.state.last_result = None;
                job.state.last_error = Some(format!("{e:#}"));
            }
        }
        job.state.next_run_at_ms = if job.enabled {
            next_run(job, started)
        } else {
            None
        };
        if job.enabled && job.state.next_run_at_ms.is_none() {
            info!(job_id = %job.id, name = %job.name, "Cron schedule exhausted, disabling job");
            job.enabled = false;
        }

        let job = job.clone();
        self.persist(&mut set);
        Some(job)
    }

    fn deliver(&self, job: &CronJob, text: &str) {
        let Some(bus) = &self.bus else {
            warn!(job_id = %job.id, "Cron job wants delivery but no bus is attached");
            return;
        };
        if job.channel.is_empty() {
            warn!(job_id = %job.id, "Cron job wants delivery but has no channel");
            return;
        }
        if text.trim().is_empty() {
            debug!(job_id = %job.id, "Empty cron result, nothing to deliver");
            return;
        }

        let envelope = Envelope::outbound(
            job.channel.clone(),
            job.to.clone(),
            job.session_key(),
            text,
        );
        if bus.publish(&delivery_topic(&job.channel), envelope) == 0 {
            warn!(job_id = %job.id, channel = %job.channel, "No adapter subscribed for cron delivery");
        } else {
            debug!(job_id = %job.id, channel = %job.channel, to = %job.to, "Cron result delivered");
        }
    }
}

fn next_run(job: &CronJob, after_ms: i64) -> Option<i64> {
    match schedule::next_run_after(&job.schedule, after_ms) {
        Ok(next) => next,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Cannot compute next cron run");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use clawgate_bus::TopicFilter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    const T0: i64 = 1_760_000_000_000;
    const FIFTEEN_MIN: u64 = 900_000;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        clock: Arc<ManualClock>,
        service: Arc<CronService>,
    }

    fn settings() -> CronSettings {
        CronSettings {
            tick_millis: 10,
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron").join("jobs.json");
        let clock = Arc::new(ManualClock::new(T0));
        let service =
            Arc::new(CronService::open_with_clock(&path, &settings(), clock.clone()).unwrap());
        Fixture {
            _dir: dir,
            path,
            clock,
            service,
        }
    }

    fn ok_handler(service: &CronService) -> Arc<AtomicU32> {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        service.set_on_job(move |job| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("ran {}", job.name))
            }
        });
        runs
    }

    async fn add_every(service: &CronService, name: &str, every_ms: u64) -> CronJob {
        service
            .add_job(name, CronSchedule::every(every_ms), "scan markets", false, "telegram", "")
            .await
            .unwrap()
    }

    // ── job management ──

    #[tokio::test]
    async fn test_scan_markets_scenario() {
        let f = fixture();
        let job = add_every(&f.service, "econ:scan_markets", FIFTEEN_MIN).await;
        assert_eq!(job.name, "econ:scan_markets");
        assert!(job.enabled);
        assert!(!job.id.is_empty());
        let next = job.state.next_run_at_ms.unwrap();
        assert!(next >= T0 && next <= T0 + FIFTEEN_MIN as i64);
        assert!(!f.service.remove_job("nonexistent").await);
    }

    #[tokio::test]
    async fn test_add_job_validation() {
        let f = fixture();
        let svc = &f.service;
        let every = CronSchedule::every(1_000);

        let err = svc.add_job("  ", every.clone(), "m", false, "", "").await.unwrap_err();
        assert!(matches!(err, CronError::Validation(_)));
        let err = svc.add_job("n", every.clone(), "", false, "", "").await.unwrap_err();
        assert!(matches!(err, CronError::Validation(_)));

        let neither = CronSchedule {
            every_ms: None,
            ..every.clone()
        };
        let both = CronSchedule {
            expr: Some("0 7 * * *".into()),
            ..every.clone()
        };
        for schedule in [neither, both] {
            let err = svc.add_job("n", schedule, "m", false, "", "").await.unwrap_err();
            assert!(matches!(err, CronError::Validation(_)));
        }

        let err = svc
            .add_job("n", CronSchedule::cron("whenever"), "m", false, "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule { .. }));
        assert!(svc.list_jobs(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_names_not_deduplicated() {
        let f = fixture();
        let a = add_every(&f.service, "dup", 1_000).await;
        let b = add_every(&f.service, "dup", 1_000).await;
        assert_ne!(a.id, b.id);
        assert_eq!(f.service.list_jobs(true).await.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let f = fixture();
        let a = add_every(&f.service, "a", 1_000).await;
        let b = add_every(&f.service, "b", 1_000).await;
        assert!(f.service.remove_job(&a.id).await);
        assert!(!f.service.remove_job(&a.id).await);
        let ids: Vec<_> = f.service.list_jobs(true).await.into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b.id]);
    }

    #[tokio::test]
    async fn test_disable_and_enable() {
        let f = fixture();
        let job = add_every(&f.service, "econ:volatility_alert", 300_000).await;

        let disabled = f.service.enable_job(&job.id, false).await.unwrap();
        assert!(!disabled.enabled);
        assert_eq!(disabled.state.next_run_at_ms, None);
        assert!(f.service.list_jobs(false).await.is_empty());
        assert_eq!(f.service.list_jobs(true).await.len(), 1);

        f.clock.set(T0 + 42_000);
        let enabled = f.service.enable_job(&job.id, true).await.unwrap();
        assert!(enabled.enabled);
        assert_eq!(enabled.state.next_run_at_ms, Some(T0 + 42_000 + 300_000));

        assert!(f.service.enable_job("missing", true).await.is_none());
    }

    #[tokio::test]
    async fn test_schedule_without_future_run_is_rejected() {
        let f = fixture();
        let err = f
            .service
            .add_job("past", CronSchedule::cron("0 0 0 1 1 * 2020"), "m", false, "", "")
            .await
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule { .. }));
        assert!(f.service.list_jobs(true).await.is_empty());
    }

    fn expired_job(enabled: bool) -> CronJob {
        CronJob {
            id: "expired".into(),
            name: "new-year-2020".into(),
            schedule: CronSchedule::cron("0 0 0 1 1 * 2020"),
            message: "m".into(),
            deliver: false,
            channel: String::new(),
            to: String::new(),
            enabled,
            state: JobState::default(),
            created_at_ms: T0,
        }
    }

    #[tokio::test]
    async fn test_stored_job_without_future_run_is_disabled_on_open() {
        let f = fixture();
        JobStore::new(&f.path).save(&[expired_job(true)]).unwrap();

        let reopened =
            CronService::open_with_clock(&f.path, &settings(), f.clock.clone()).unwrap();
        let job = reopened.get_job("expired").await.unwrap();
        assert!(!job.enabled);
        assert_eq!(job.state.next_run_at_ms, None);
        assert!(reopened.list_jobs(false).await.is_empty());
    }

    #[tokio::test]
    async fn test_enabling_job_without_future_run_keeps_it_disabled() {
        let f = fixture();
        JobStore::new(&f.path).save(&[expired_job(false)]).unwrap();
        let service = CronService::open_with_clock(&f.path, &settings(), f.clock.clone()).unwrap();

        let job = service.enable_job("expired", true).await.unwrap();
        assert!(!job.enabled);
        assert_eq!(job.state.next_run_at_ms, None);
        assert!(service.list_jobs(false).await.is_empty());
    }

    #[tokio::test]
    async fn test_final_occurrence_disables_job() {
        let f = fixture();
        ok_handler(&f.service);
        let job = f
            .service
            .add_job("new-year", CronSchedule::cron("0 0 0 1 1 * 2026"), "m", false, "", "")
            .await
            .unwrap();
        let due = job.state.next_run_at_ms.unwrap();

        f.clock.set(due + 1);
        assert_eq!(f.service.run_due_jobs().await, 1);

        let job = f.service.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.run_count, 1);
        assert!(!job.enabled);
        assert_eq!(job.state.next_run_at_ms, None);
    }

    #[tokio::test]
    async fn test_enable_already_enabled_keeps_schedule() {
        let f = fixture();
        let job = add_every(&f.service, "a", 60_000).await;
        f.clock.set(T0 + 30_000);
        let same = f.service.enable_job(&job.id, true).await.unwrap();
        assert_eq!(same.state.next_run_at_ms, job.state.next_run_at_ms);
    }

    // ── running ──

    #[tokio::test]
    async fn test_every_schedule_is_relative_to_run_start() {
        let f = fixture();
        let runs = ok_handler(&f.service);
        let job = add_every(&f.service, "econ:scan_markets", FIFTEEN_MIN).await;
        assert_eq!(job.state.next_run_at_ms, Some(T0 + FIFTEEN_MIN as i64));

        f.clock.set(T0 + FIFTEEN_MIN as i64 - 1);
        assert_eq!(f.service.run_due_jobs().await, 0);

        let t1 = T0 + FIFTEEN_MIN as i64 + 1_234;
        f.clock.set(t1);
        assert_eq!(f.service.run_due_jobs().await, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let job = f.service.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.last_run_at_ms, Some(t1));
        assert_eq!(job.state.next_run_at_ms, Some(t1 + FIFTEEN_MIN as i64));
        assert_eq!(job.state.run_count, 1);
        assert_eq!(job.state.last_result.as_deref(), Some("ran econ:scan_markets"));
        assert_eq!(job.state.last_error, None);

        // Not due again until the next interval.
        assert_eq!(f.service.run_due_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_failing_job_is_isolated() {
        let f = fixture();
        f.service.set_on_job(|job| async move {
            if job.name == "broken" {
                anyhow::bail!("market data unavailable");
            }
            Ok("fine".to_string())
        });
        let broken = add_every(&f.service, "broken", 1_000).await;
        let healthy = add_every(&f.service, "healthy", 1_000).await;

        f.clock.set(T0 + 1_000);
        assert_eq!(f.service.run_due_jobs().await, 2);

        let broken = f.service.get_job(&broken.id).await.unwrap();
        assert!(broken.enabled);
        assert_eq!(broken.state.run_count, 1);
        assert_eq!(broken.state.last_error.as_deref(), Some("market data unavailable"));
        assert_eq!(broken.state.next_run_at_ms, Some(T0 + 2_000));

        let healthy = f.service.get_job(&healthy.id).await.unwrap();
        assert_eq!(healthy.state.last_result.as_deref(), Some("fine"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recorded() {
        let f = fixture();
        f.service.set_on_job(|_job| async move {
            if true {
                panic!("boom");
            }
            Ok(String::new())
        });
        let job = add_every(&f.service, "p", 1_000).await;
        f.clock.set(T0 + 1_000);
        assert_eq!(f.service.run_due_jobs().await, 1);

        let job = f.service.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.last_error.as_deref(), Some("job handler panicked"));
        assert!(f.service.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_handler_is_recorded() {
        let f = fixture();
        let job = add_every(&f.service, "orphan", 1_000).await;
        f.clock.set(T0 + 1_000);
        f.service.run_due_jobs().await;
        let job = f.service.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.last_error.as_deref(), Some("no job handler registered"));
    }

    #[tokio::test]
    async fn test_job_never_overlaps_itself() {
        let f = fixture();
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        let runs = Arc::new(AtomicU32::new(0));
        {
            let gate = gate.clone();
            let started = started.clone();
            let runs = runs.clone();
            f.service.set_on_job(move |_job| {
                let gate = gate.clone();
                let started = started.clone();
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    started.notify_one();
                    gate.notified().await;
                    Ok("slow".to_string())
                }
            });
        }
        let job = add_every(&f.service, "slow", 1_000).await;

        f.clock.set(T0 + 1_000);
        let handles = f.service.dispatch(f.service.claim_due_jobs().await);
        assert_eq!(handles.len(), 1);
        started.notified().await;

        // Still due, but in flight.
        f.clock.set(T0 + 5_000);
        assert!(f.service.claim_due_jobs().await.is_empty());
        assert!(matches!(
            f.service.run_job_now(&job.id).await,
            Err(CronError::AlreadyRunning(_))
        ));

        gate.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = f.service.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.run_count, 1);
        assert_eq!(job.state.next_run_at_ms, Some(T0 + 2_000));
    }

    #[tokio::test]
    async fn test_worker_pool_bounds_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let settings = CronSettings {
            max_concurrent_jobs: 2,
            ..settings()
        };
        let service = Arc::new(
            CronService::open_with_clock(dir.path().join("jobs.json"), &settings, clock.clone())
                .unwrap(),
        );

        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        {
            let active = active.clone();
            let peak = peak.clone();
            service.set_on_job(move |_job| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(String::new())
                }
            });
        }
        for i in 0..5 {
            add_every(&service, &format!("job-{i}"), 1_000).await;
        }

        clock.set(T0 + 1_000);
        assert_eq!(service.run_due_jobs().await, 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_successful_delivery_publishes_to_channel() {
        let dir = tempfile::tempdir().unwrap();
        let bus = MessageBus::new(8);
        let mut delivery = bus.subscribe(TopicFilter::Delivery("telegram".into()));
        let clock = Arc::new(ManualClock::new(T0));
        let service = Arc::new(
            CronService::open_with_clock(dir.path().join("jobs.json"), &settings(), clock.clone())
                .unwrap()
                .with_bus(bus),
        );
        service.set_on_job(|job| async move {
            if job.name == "fails" {
                anyhow::bail!("nope");
            }
            Ok("BTC 64k, ETH flat".to_string())
        });

        let job = service
            .add_job("report", CronSchedule::every(1_000), "report", true, "telegram", "42")
            .await
            .unwrap();
        service
            .add_job("fails", CronSchedule::every(1_000), "report", true, "telegram", "42")
            .await
            .unwrap();
        service
            .add_job("quiet", CronSchedule::every(1_000), "report", false, "telegram", "42")
            .await
            .unwrap();

        clock.set(T0 + 1_000);
        assert_eq!(service.run_due_jobs().await, 3);

        let envelope = delivery.try_recv().unwrap();
        assert_eq!(envelope.text, "BTC 64k, ETH flat");
        assert_eq!(envelope.recipient, "42");
        assert_eq!(envelope.session_key, format!("cron:{}", job.id));
        assert!(delivery.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_run_job_now() {
        let f = fixture();
        ok_handler(&f.service);
        assert!(matches!(
            f.service.run_job_now("missing").await,
            Err(CronError::NotFound(_))
        ));

        let job = add_every(&f.service, "manual", 3_600_000).await;
        f.clock.set(T0 + 10);
        let ran = f.service.run_job_now(&job.id).await.unwrap();
        assert_eq!(ran.state.run_count, 1);
        assert_eq!(ran.state.last_run_at_ms, Some(T0 + 10));
        assert_eq!(ran.state.next_run_at_ms, Some(T0 + 10 + 3_600_000));
    }

    // ── persistence ──

    #[tokio::test]
    async fn test_reload_restores_identical_jobs() {
        let f = fixture();
        ok_handler(&f.service);
        add_every(&f.service, "econ:scan_markets", FIFTEEN_MIN).await;
        let daily = f
            .service
            .add_job(
                "econ:daily_outlook",
                CronSchedule::cron("0 7 * * *"),
                "morning briefing",
                true,
                "telegram",
                "42",
            )
            .await
            .unwrap();
        let weekly = f
            .service
            .add_job(
                "econ:update_weights",
                CronSchedule::cron("30 23 * * 0"),
                "adjust weights",
                false,
                "telegram",
                "",
            )
            .await
            .unwrap();
        f.service.enable_job(&weekly.id, false).await.unwrap();
        f.service.run_job_now(&daily.id).await.unwrap();

        let before = f.service.list_jobs(true).await;
        let reopened = CronService::open_with_clock(&f.path, &settings(), f.clock.clone()).unwrap();
        assert_eq!(reopened.list_jobs(true).await, before);
    }

    #[tokio::test]
    async fn test_past_due_job_runs_once_after_restart() {
        let f = fixture();
        let job = add_every(&f.service, "econ:volatility_alert", 300_000).await;

        // Down for an hour: twelve intervals missed.
        f.clock.set(T0 + 3_600_000);
        let reopened =
            Arc::new(CronService::open_with_clock(&f.path, &settings(), f.clock.clone()).unwrap());
        let runs = ok_handler(&reopened);

        assert_eq!(reopened.run_due_jobs().await, 1);
        assert_eq!(reopened.run_due_jobs().await, 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let job = reopened.get_job(&job.id).await.unwrap();
        assert_eq!(job.state.next_run_at_ms, Some(T0 + 3_600_000 + 300_000));
    }

    #[tokio::test]
    async fn test_corrupt_store_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "[[[").unwrap();
        assert!(CronService::open(&path, &settings()).is_err());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let service = CronService::open(blocker.join("jobs.json"), &settings()).unwrap();

        let job = add_every(&service, "a", 1_000).await;
        assert!(service.jobs.lock().await.dirty);
        assert_eq!(service.get_job(&job.id).await.unwrap(), job);

        // Once the location becomes writable, the next mutation persists everything.
        std::fs::remove_file(&blocker).unwrap();
        add_every(&service, "b", 1_000).await;
        assert!(!service.jobs.lock().await.dirty);
        let stored = JobStore::new(blocker.join("jobs.json")).load().unwrap();
        assert_eq!(stored.len(), 2);
    }

    // ── tick loop ──

    #[tokio::test]
    async fn test_tick_loop_runs_due_jobs() {
        let f = fixture();
        let runs = ok_handler(&f.service);
        add_every(&f.service, "a", 1_000).await;

        f.service.start().await.unwrap();
        assert!(matches!(
            f.service.start().await,
            Err(CronError::AlreadyRunning(_))
        ));
        assert!(f.service.is_running().await);

        f.clock.set(T0 + 1_000);
        tokio::time::timeout(Duration::from_secs(2), async {
            while runs.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        f.service.stop().await;
        assert!(!f.service.is_running().await);
        // The manual clock never advanced past the next slot.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
