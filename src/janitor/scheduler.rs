use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_lock::Mutex as AsyncMutex;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendResult, DocumentStore, DocumentStoreArc};
use crate::error::{unknown_job, SessionResult};
use crate::platform::runtime::{sleep, spawn_detached};

use super::job::JanitorJob;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobStats {
    pub runs: u64,
    pub skipped: u64,
    pub failures: u64,
    pub corrected: u64,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    corrected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            runs: self.runs.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            corrected: self.corrected.load(Ordering::SeqCst),
        }
    }

    fn record(&self, result: &BackendResult<usize>) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(count) => {
                self.corrected.fetch_add(*count as u64, Ordering::SeqCst);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// Sweep context shared between a job's tick loop, its spawned sweeps and
/// manual runs.
#[derive(Clone)]
struct ScheduledJob {
    job: JanitorJob,
    sweep_lock: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

/// Runs [`JanitorJob`]s on their intervals.
///
/// A tick that fires while the previous sweep of the same job is still
/// running is skipped rather than queued.
#[derive(Clone)]
pub struct Janitor {
    store: DocumentStoreArc,
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
}

impl Janitor {
    pub fn new(store: DocumentStoreArc) -> Self {
        Self {
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts the interval for `job`. Returns `false` if a job with the same
    /// name is already scheduled.
    pub fn schedule(&self, job: JanitorJob) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.name) {
            log::debug!("janitor job {} already scheduled", job.name);
            return false;
        }

        let scheduled = ScheduledJob {
            job,
            sweep_lock: Arc::new(AsyncMutex::new(())),
            cancel: CancellationToken::new(),
            counters: Arc::new(Counters::default()),
        };
        log::info!(
            "janitor job {} scheduled every {:?}",
            scheduled.job.name,
            scheduled.job.interval
        );
        spawn_detached(tick_loop(Arc::clone(&self.store), scheduled.clone()));
        jobs.insert(scheduled.job.name.clone(), scheduled);
        true
    }

    pub fn stop(&self, name: &str) -> bool {
        match self.jobs.lock().unwrap().remove(name) {
            Some(scheduled) => {
                scheduled.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every interval and returns how many were running.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<ScheduledJob> = self
            .jobs
            .lock()
            .unwrap()
            .drain()
            .map(|(_, scheduled)| scheduled)
            .collect();
        for scheduled in &drained {
            scheduled.cancel.cancel();
        }
        drained.len()
    }

    /// Runs a scheduled job immediately, waiting for an in-flight sweep of
    /// the same job to finish first. Returns the number of corrected records.
    pub async fn run_now(&self, name: &str) -> SessionResult<usize> {
        let scheduled = self
            .jobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| unknown_job(name))?;

        let _guard = scheduled.sweep_lock.lock_arc().await;
        let result = sweep(self.store.as_ref(), &scheduled.job, &scheduled.cancel).await;
        scheduled.counters.record(&result);
        Ok(result?)
    }

    /// Runs `job` once without scheduling it.
    pub async fn run_once(&self, job: &JanitorJob) -> SessionResult<usize> {
        Ok(sweep(self.store.as_ref(), job, &CancellationToken::new()).await?)
    }

    pub fn active_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.jobs
            .lock()
            .unwrap()
            .get(name)
            .map(|scheduled| scheduled.counters.snapshot())
    }
}

async fn tick_loop(store: DocumentStoreArc, scheduled: ScheduledJob) {
    let name = scheduled.job.name.clone();
    loop {
        tokio::select! {
            _ = scheduled.cancel.cancelled() => break,
            _ = sleep(scheduled.job.interval) => {}
        }

        let Some(guard) = scheduled.sweep_lock.try_lock_arc() else {
            scheduled.counters.skipped.fetch_add(1, Ordering::SeqCst);
            log::debug!("janitor job {name}: previous sweep still running, skipping tick");
            continue;
        };

        let store = Arc::clone(&store);
        let sweep_job = scheduled.clone();
        spawn_detached(async move {
            let _guard = guard;
            let result = sweep(store.as_ref(), &sweep_job.job, &sweep_job.cancel).await;
            sweep_job.counters.record(&result);
        });
    }
    log::debug!("janitor job {name} stopped");
}

async fn sweep(
    store: &dyn DocumentStore,
    job: &JanitorJob,
    cancel: &CancellationToken,
) -> BackendResult<usize> {
    let now = Utc::now();
    let stale = match store.query(&job.query_at(now)).await {
        Ok(stale) => stale,
        Err(err) => {
            log::warn!("janitor job {} query failed: {err}", job.name);
            return Err(err);
        }
    };
    if stale.is_empty() {
        return Ok(0);
    }
    if cancel.is_cancelled() {
        log::debug!("janitor job {} cancelled before writing", job.name);
        return Ok(0);
    }

    let ops: Vec<_> = stale.iter().map(|doc| job.action.to_op(doc, now)).collect();
    let count = ops.len();
    log::info!("janitor job {}: found {count} stale records", job.name);
    if let Err(err) = store.commit(ops).await {
        log::error!("janitor job {} failed to write corrections: {err}", job.name);
        return Err(err);
    }
    log::info!("janitor job {}: corrected {count} records", job.name);
    Ok(count)
}
