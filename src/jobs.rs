// src/jobs.rs
//
// Per-file background jobs on a bounded worker pool, with a pollable status
// record for each file id.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CANCELLED: &str = "Cancelled";
const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    ExtractingText,
    Ocr,
    Cleaning,
    ParsingPassA,
    ParsingPassB,
    CachedHit,
    Done,
    Failed,
}

impl JobState {
    pub fn progress(self) -> f64 {
        match self {
            JobState::Queued => 0.0,
            JobState::ExtractingText => 0.1,
            JobState::Ocr => 0.2,
            JobState::Cleaning => 0.3,
            JobState::ParsingPassA => 0.5,
            JobState::ParsingPassB => 0.7,
            JobState::CachedHit => 0.9,
            JobState::Done | JobState::Failed => 1.0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// Read-only snapshot handed to pollers.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub file_id: i64,
    pub state: JobState,
    pub progress: f64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl JobStatus {
    fn queued(file_id: i64) -> Self {
        let now = Utc::now();
        Self {
            file_id,
            state: JobState::Queued,
            progress: 0.0,
            message: Some("Queued".to_string()),
            started_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn advance(&mut self, state: JobState, message: Option<String>) {
        self.state = state;
        self.progress = self.progress.max(state.progress());
        if message.is_some() {
            self.message = message;
        }
        self.updated_at = Utc::now();
        if state.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
    }

    fn fail(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.advance(JobState::Failed, Some(format!("Failed: {reason}")));
    }
}

struct JobRecord {
    status: JobStatus,
    running: bool,
}

/// Owns every job status. Shared by the queue and whoever polls it.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<i64, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, JobRecord>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self, file_id: i64) -> Option<JobStatus> {
        self.lock().get(&file_id).map(|r| r.status.clone())
    }

    pub fn all(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.lock().values().map(|r| r.status.clone()).collect();
        all.sort_by_key(|s| s.file_id);
        all
    }

    pub fn is_processing(&self, file_id: i64) -> bool {
        self.lock()
            .get(&file_id)
            .is_some_and(|r| !r.status.state.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|r| !r.status.state.is_terminal())
            .count()
    }

    fn enqueue(&self, file_id: i64) -> Result<(), JobError> {
        let mut jobs = self.lock();
        if jobs.get(&file_id).is_some_and(|r| !r.status.state.is_terminal()) {
            return Err(JobError::AlreadyRunning(file_id));
        }
        jobs.insert(
            file_id,
            JobRecord {
                status: JobStatus::queued(file_id),
                running: false,
            },
        );
        Ok(())
    }

    /// False when the job was cancelled while it waited for a worker.
    fn start(&self, file_id: i64) -> bool {
        match self.lock().get_mut(&file_id) {
            Some(r) if !r.status.state.is_terminal() => {
                r.running = true;
                true
            }
            _ => false,
        }
    }

    /// Move a live job to `state`. Terminal jobs are never changed.
    pub fn update(&self, file_id: i64, state: JobState, message: Option<String>) -> bool {
        match self.lock().get_mut(&file_id) {
            Some(r) if !r.status.state.is_terminal() => {
                r.status.advance(state, message);
                true
            }
            _ => false,
        }
    }

    /// Mark a job failed from outside its worker. The worker keeps running
    /// but its later updates are ignored.
    pub fn mark_failed(&self, file_id: i64, reason: &str) -> bool {
        match self.lock().get_mut(&file_id) {
            Some(r) if !r.status.state.is_terminal() => {
                r.status.fail(reason);
                true
            }
            _ => false,
        }
    }

    /// Check and transition under one guard so a worker cannot start in between.
    fn cancel(&self, file_id: i64) -> bool {
        match self.lock().get_mut(&file_id) {
            Some(r) if !r.running && !r.status.state.is_terminal() => {
                r.status.fail(CANCELLED);
                true
            }
            _ => false,
        }
    }

    fn finish(&self, file_id: i64, outcome: Result<Value, String>) -> Option<JobStatus> {
        let mut jobs = self.lock();
        let r = jobs.get_mut(&file_id).filter(|r| !r.status.state.is_terminal())?;
        r.running = false;
        match outcome {
            Ok(value) => {
                r.status.result = Some(value);
                r.status.advance(JobState::Done, Some("Complete".to_string()));
            }
            Err(e) => r.status.fail(&e),
        }
        Some(r.status.clone())
    }

    /// Drop terminal jobs that completed at least `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, r| {
            let expired = r
                .status
                .completed_at
                .and_then(|done| (now - done).to_std().ok())
                .is_some_and(|age| age >= max_age);
            !(r.status.state.is_terminal() && expired)
        });
        before - jobs.len()
    }
}

/// Handle a worker uses to publish progress for its own file.
#[derive(Clone)]
pub struct JobReporter {
    file_id: i64,
    registry: Arc<JobRegistry>,
}

impl JobReporter {
    pub fn new(file_id: i64, registry: Arc<JobRegistry>) -> Self {
        Self { file_id, registry }
    }

    pub fn set_state(&self, state: JobState, message: impl Into<String>) {
        let message = message.into();
        debug!(file_id = self.file_id, ?state, %message, "job progress");
        self.registry.update(self.file_id, state, Some(message));
    }
}

pub struct JobQueue {
    registry: Arc<JobRegistry>,
    permits: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    retention: Duration,
}

impl JobQueue {
    pub fn new(registry: Arc<JobRegistry>, max_workers: usize) -> Self {
        info!(max_workers, "Job queue started");
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            retention: DEFAULT_RETENTION,
        }
    }

    /// How long finished jobs stay pollable. Expired records are purged on
    /// each `submit`.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Queue `work` for `file_id`. `on_complete` sees the terminal status
    /// unless the job was cancelled or overridden first.
    pub fn submit<W, Fut, C>(&self, file_id: i64, work: W, on_complete: C) -> Result<(), JobError>
    where
        W: FnOnce(JobReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
        C: FnOnce(&JobStatus) + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::ShuttingDown);
        }
        self.cleanup_old_jobs(self.retention);
        self.registry.enqueue(file_id)?;

        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                registry.finish(file_id, Err("worker pool closed".to_string()));
                return;
            };
            if !registry.start(file_id) {
                debug!(file_id, "Job cancelled before start");
                return;
            }
            let reporter = JobReporter::new(file_id, Arc::clone(&registry));
            // a panicking job still has to reach a terminal state
            let outcome = match tokio::spawn(async move { work(reporter).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("job aborted: {e}")),
            };
            if let Err(e) = &outcome {
                warn!(file_id, error = %e, "Job failed");
            }
            if let Some(status) = registry.finish(file_id, outcome) {
                on_complete(&status);
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
        debug!(file_id, "Job submitted");
        Ok(())
    }

    pub fn status(&self, file_id: i64) -> Option<JobStatus> {
        self.registry.status(file_id)
    }

    pub fn all_statuses(&self) -> Vec<JobStatus> {
        self.registry.all()
    }

    pub fn is_processing(&self, file_id: i64) -> bool {
        self.registry.is_processing(file_id)
    }

    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Only succeeds while the job is still waiting for a worker.
    pub fn cancel(&self, file_id: i64) -> bool {
        let cancelled = self.registry.cancel(file_id);
        if cancelled {
            info!(file_id, "Job cancelled");
        }
        cancelled
    }

    pub fn cleanup_old_jobs(&self, max_age: Duration) -> usize {
        let removed = self.registry.cleanup(max_age);
        if removed > 0 {
            debug!(removed, "Purged finished jobs");
        }
        removed
    }

    /// Refuse new work and wait for everything already submitted.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job task panicked");
            }
        }
        info!("Job queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn queue(workers: usize) -> JobQueue {
        JobQueue::new(Arc::new(JobRegistry::new()), workers)
    }

    #[tokio::test]
    async fn test_job_runs_to_done() {
        let q = queue(2);
        let (tx, rx) = oneshot::channel();
        q.submit(
            7,
            |reporter| async move {
                reporter.set_state(JobState::ExtractingText, "Reading PDF");
                reporter.set_state(JobState::ParsingPassA, "Pass A");
                Ok(json!({"bills": 1}))
            },
            move |status| {
                let _ = tx.send(status.state);
            },
        )
        .unwrap();
        assert!(q.is_processing(7));

        q.shutdown().await;
        assert_eq!(rx.await.unwrap(), JobState::Done);
        let s = q.status(7).unwrap();
        assert_eq!(s.progress, 1.0);
        assert_eq!(s.result, Some(json!({"bills": 1})));
        assert!(s.completed_at.is_some());
        assert_eq!(q.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_message() {
        let q = queue(1);
        q.submit(3, |_| async { Err("disk full".to_string()) }, |_| {})
            .unwrap();
        q.shutdown().await;
        let s = q.status(3).unwrap();
        assert_eq!(s.state, JobState::Failed);
        assert_eq!(s.message.as_deref(), Some("Failed: disk full"));
        assert_eq!(s.error.as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected_until_terminal() {
        let q = queue(1);
        let (release, wait) = oneshot::channel::<()>();
        q.submit(
            1,
            |_| async move {
                let _ = wait.await;
                Ok(Value::Null)
            },
            |_| {},
        )
        .unwrap();
        let again = q.submit(1, |_| async { Ok(Value::Null) }, |_| {});
        assert!(matches!(again, Err(JobError::AlreadyRunning(1))));

        release.send(()).unwrap();
        q.shutdown().await;
        assert_eq!(q.status(1).unwrap().state, JobState::Done);
        assert!(matches!(
            q.submit(1, |_| async { Ok(Value::Null) }, |_| {}),
            Err(JobError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_cancel_only_before_start() {
        let q = queue(1);
        let (release, wait) = oneshot::channel::<()>();
        let (started_tx, started) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);

        q.submit(
            1,
            |_| async move {
                let _ = started_tx.send(());
                let _ = wait.await;
                Ok(Value::Null)
            },
            |_| {},
        )
        .unwrap();
        q.submit(
            2,
            move |_| async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            },
            |_| {},
        )
        .unwrap();

        // job 1 holds the only worker
        started.await.unwrap();
        assert!(!q.cancel(1));
        assert!(q.cancel(2));
        assert!(!q.cancel(2));

        release.send(()).unwrap();
        q.shutdown().await;
        assert!(!ran.load(Ordering::SeqCst));
        let s = q.status(2).unwrap();
        assert_eq!(s.state, JobState::Failed);
        assert_eq!(s.error.as_deref(), Some(CANCELLED));
        assert_eq!(q.status(1).unwrap().state, JobState::Done);
    }

    fn explode() -> Result<Value, String> {
        panic!("pdf decoder blew up")
    }

    #[tokio::test]
    async fn test_panicking_job_ends_failed() {
        let q = queue(1);
        let (tx, rx) = oneshot::channel();
        q.submit(9, |_| async { explode() }, move |status| {
            let _ = tx.send(status.state);
        })
        .unwrap();

        q.shutdown().await;
        assert_eq!(rx.await.unwrap(), JobState::Failed);
        assert!(!q.is_processing(9));
        assert_eq!(q.active_count(), 0);
        let s = q.status(9).unwrap();
        assert!(s.error.unwrap().contains("panicked"));
        assert!(s.message.unwrap().starts_with("Failed: job aborted"));
    }

    #[tokio::test]
    async fn test_submit_purges_expired_jobs() {
        let q = queue(1).with_retention(Duration::ZERO);
        let (tx, rx) = oneshot::channel();
        q.submit(1, |_| async { Ok(Value::Null) }, move |_| {
            let _ = tx.send(());
        })
        .unwrap();
        rx.await.unwrap();
        assert!(q.status(1).is_some());

        q.submit(2, |_| async { Ok(Value::Null) }, |_| {}).unwrap();
        assert!(q.status(1).is_none());
        assert!(q.status(2).is_some());
        q.shutdown().await;
    }

    #[test]
    fn test_cancel_refuses_started_job() {
        let registry = JobRegistry::new();
        registry.enqueue(4).unwrap();
        assert!(registry.start(4));
        assert!(!registry.cancel(4));
        assert!(registry.is_processing(4));

        let done = registry.finish(4, Ok(Value::Null)).unwrap();
        assert_eq!(done.state, JobState::Done);
        assert!(done.error.is_none());
    }

    #[test]
    fn test_progress_never_decreases_and_terminal_is_final() {
        let registry = JobRegistry::new();
        registry.enqueue(9).unwrap();
        registry.update(9, JobState::ParsingPassB, None);
        registry.update(9, JobState::Cleaning, None);
        assert_eq!(registry.status(9).unwrap().progress, 0.7);

        registry.mark_failed(9, "user override");
        assert!(!registry.update(9, JobState::CachedHit, None));
        assert!(registry.finish(9, Ok(Value::Null)).is_none());
        let s = registry.status(9).unwrap();
        assert_eq!(s.state, JobState::Failed);
        assert_eq!(s.error.as_deref(), Some("user override"));
    }

    #[test]
    fn test_cleanup_only_drops_old_terminal_jobs() {
        let registry = JobRegistry::new();
        registry.enqueue(1).unwrap();
        registry.enqueue(2).unwrap();
        registry.finish(1, Ok(Value::Null));

        assert_eq!(registry.cleanup(Duration::from_secs(3600)), 0);
        assert_eq!(registry.cleanup(Duration::ZERO), 1);
        assert!(registry.status(1).is_none());
        assert!(registry.is_processing(2));
    }
}
