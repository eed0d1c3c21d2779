//! Durable index job queue and its drain workers.
//!
//! Saving a page only writes a job row; embedding happens later when a drain
//! task claims the job. Enqueueing coalesces: any job for the same page that
//! has not started yet is replaced by the newer snapshot, so a burst of saves
//! costs one round of embedding.
//!
//! Jobs of the same page never run concurrently. The claim query skips pages
//! that already have a job in flight, which lets several workers drain
//! different pages in parallel without a global lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{now_millis, Database};
use crate::error::{FailureKind, IndexError, StoreError};
use crate::retry::RetryPolicy;

/// Default attempts before a job is dead-lettered.
pub const DEFAULT_MAX_JOB_ATTEMPTS: u32 = 5;

/// Default deadline for processing a single job.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors from queue bookkeeping.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Store(StoreError::Sqlite(err))
    }
}

/// A claimed job, ready to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Queue sequence number
    pub seq: i64,
    /// Page to index
    pub page_id: String,
    /// Serialized document tree
    pub snapshot: String,
    /// Failed attempts so far
    pub attempts: u32,
    /// Re-embed every unit, not only changed ones
    pub reindex: bool,
}

/// Queue row without its snapshot, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub seq: i64,
    pub page_id: String,
    pub processing: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Unix millis before which the job is not claimable
    pub not_before: i64,
    pub dead: bool,
    pub reindex: bool,
    pub enqueued_at: i64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Unlocked and claimable again after the given delay.
    Retry(Duration),
    /// Attempts exhausted; parked until revived.
    DeadLettered,
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Attempts before dead-lettering
    pub max_attempts: u32,
    /// Delay before a failed job becomes claimable again
    pub backoff: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_JOB_ATTEMPTS,
            backoff: RetryPolicy {
                max_attempts: DEFAULT_MAX_JOB_ATTEMPTS,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(300),
                max_elapsed: Duration::from_secs(3600),
                jitter: 0.2,
            },
        }
    }
}

// A live job is claimable once its backoff has elapsed and its page has
// nothing in flight.
const CLAIMABLE: &str = "processing = 0 AND dead = 0 AND not_before <= ?1
     AND NOT EXISTS (
         SELECT 1 FROM index_jobs p
         WHERE p.page_id = index_jobs.page_id AND p.processing = 1
     )";

/// SQLite-backed job queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    config: QueueConfig,
}

impl JobQueue {
    /// Open the queue and recover jobs interrupted by a crash.
    pub fn open(db: Database, config: QueueConfig) -> Result<Self, QueueError> {
        let queue = Self { db, config };
        let recovered = queue.recover()?;
        if recovered > 0 {
            info!("Recovered {} interrupted index jobs", recovered);
        }
        Ok(queue)
    }

    /// Queue a snapshot of a page, replacing any job for it that has not
    /// started yet (dead-lettered ones included). Returns the new sequence
    /// number.
    pub fn enqueue(&self, page_id: &str, snapshot: &str) -> Result<i64, QueueError> {
        self.insert(page_id, snapshot, false)
    }

    /// Like [`enqueue`](Self::enqueue), but the job re-embeds every unit of
    /// the page when it runs.
    pub fn enqueue_reindex(&self, page_id: &str, snapshot: &str) -> Result<i64, QueueError> {
        self.insert(page_id, snapshot, true)
    }

    fn insert(&self, page_id: &str, snapshot: &str, reindex: bool) -> Result<i64, QueueError> {
        let (replaced, seq, reindex) = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            // A replaced reindex request carries over to the newer snapshot
            let pending_reindex: bool = tx.query_row(
                "SELECT COALESCE(MAX(reindex), 0) FROM index_jobs
                 WHERE page_id = ?1 AND processing = 0",
                params![page_id],
                |row| row.get(0),
            )?;
            let reindex = reindex || pending_reindex;
            let replaced = tx.execute(
                "DELETE FROM index_jobs WHERE page_id = ?1 AND processing = 0",
                params![page_id],
            )?;
            tx.execute(
                "INSERT INTO index_jobs (page_id, snapshot, reindex, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![page_id, snapshot, reindex, now_millis()],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;
            Ok((replaced, seq, reindex))
        })?;

        debug!(
            "Enqueued job {} for page {} (replaced {}, reindex {})",
            seq, page_id, replaced, reindex
        );
        Ok(seq)
    }

    /// Lock and return the oldest claimable job.
    ///
    /// A job is claimable when it is not dead, its backoff has elapsed and no
    /// other job of the same page is being processed.
    pub fn claim(&self) -> Result<Option<Job>, QueueError> {
        let job = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let job = tx
                .query_row(
                    &format!(
                        "SELECT seq, page_id, snapshot, attempts, reindex FROM index_jobs
                         WHERE {} ORDER BY seq LIMIT 1",
                        CLAIMABLE
                    ),
                    params![now_millis()],
                    |row| {
                        Ok(Job {
                            seq: row.get(0)?,
                            page_id: row.get(1)?,
                            snapshot: row.get(2)?,
                            attempts: row.get(3)?,
                            reindex: row.get(4)?,
                        })
                    },
                )
                .optional()?;

            if let Some(ref job) = job {
                tx.execute(
                    "UPDATE index_jobs SET processing = 1 WHERE seq = ?1",
                    params![job.seq],
                )?;
            }
            tx.commit()?;
            Ok(job)
        })?;

        if let Some(ref job) = job {
            debug!("Claimed job {} for page {}", job.seq, job.page_id);
        }
        Ok(job)
    }

    /// Remove a successfully processed job.
    pub fn complete(&self, seq: i64) -> Result<(), QueueError> {
        self.delete(seq)
    }

    /// Remove a job that must never be retried.
    pub fn discard(&self, seq: i64) -> Result<(), QueueError> {
        self.delete(seq)
    }

    /// Record a failed attempt: unlock with backoff, or dead-letter once
    /// attempts are exhausted.
    pub fn fail(&self, seq: i64, error: &str) -> Result<FailOutcome, QueueError> {
        let attempts = self.attempts(seq)? + 1;

        if attempts >= self.config.max_attempts {
            self.park(seq, attempts, error)?;
            warn!("Job {} dead-lettered after {} attempts: {}", seq, attempts, error);
            return Ok(FailOutcome::DeadLettered);
        }

        let delay = self.config.backoff.delay_for(attempts);
        let not_before = now_millis() + delay.as_millis() as i64;
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE index_jobs
                 SET processing = 0, attempts = ?2, last_error = ?3, not_before = ?4
                 WHERE seq = ?1",
                params![seq, attempts, error, not_before],
            )
        })?;

        debug!("Job {} failed (attempt {}), retry in {:?}", seq, attempts, delay);
        Ok(FailOutcome::Retry(delay))
    }

    /// Dead-letter a job immediately.
    pub fn dead_letter(&self, seq: i64, error: &str) -> Result<(), QueueError> {
        let attempts = self.attempts(seq)? + 1;
        self.park(seq, attempts, error)
    }

    /// Drop every job of a page that has not started. Returns the count.
    pub fn remove_page(&self, page_id: &str) -> Result<usize, QueueError> {
        Ok(self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM index_jobs WHERE page_id = ?1 AND processing = 0",
                params![page_id],
            )
        })?)
    }

    /// Revive every dead-lettered job. Returns the count.
    pub fn retry_dead(&self) -> Result<usize, QueueError> {
        let revived = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE index_jobs
                 SET dead = 0, attempts = 0, not_before = 0, last_error = NULL
                 WHERE dead = 1",
                [],
            )
        })?;
        if revived > 0 {
            info!("Revived {} dead-lettered jobs", revived);
        }
        Ok(revived)
    }

    /// Jobs waiting to run (locked and dead-lettered ones excluded).
    pub fn pending_count(&self) -> Result<usize, QueueError> {
        self.count_where("processing = 0 AND dead = 0", None)
    }

    /// Jobs that [`JobQueue::claim`] could hand out right now.
    pub fn claimable_count(&self) -> Result<usize, QueueError> {
        self.count_where(CLAIMABLE, Some(now_millis()))
    }

    /// All jobs in queue order.
    pub fn list(&self) -> Result<Vec<JobSummary>, QueueError> {
        self.summaries("1 = 1")
    }

    /// Dead-lettered jobs in queue order.
    pub fn dead_letters(&self) -> Result<Vec<JobSummary>, QueueError> {
        self.summaries("dead = 1")
    }

    /// Unlock jobs left in flight by a crash. A stale job whose page already
    /// has a newer waiting snapshot is dropped instead.
    fn recover(&self) -> Result<usize, QueueError> {
        Ok(self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let dropped = tx.execute(
                "DELETE FROM index_jobs
                 WHERE processing = 1 AND EXISTS (
                     SELECT 1 FROM index_jobs newer
                     WHERE newer.page_id = index_jobs.page_id
                       AND newer.processing = 0
                       AND newer.seq > index_jobs.seq
                 )",
                [],
            )?;
            let unlocked = tx.execute(
                "UPDATE index_jobs SET processing = 0 WHERE processing = 1",
                [],
            )?;
            tx.commit()?;
            Ok(dropped + unlocked)
        })?)
    }

    fn delete(&self, seq: i64) -> Result<(), QueueError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM index_jobs WHERE seq = ?1", params![seq])
        })?;
        Ok(())
    }

    fn attempts(&self, seq: i64) -> Result<u32, QueueError> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT attempts FROM index_jobs WHERE seq = ?1",
                    params![seq],
                    |row| row.get(0),
                )
                .optional()
            })?
            .ok_or(QueueError::JobNotFound(seq))
    }

    fn park(&self, seq: i64, attempts: u32, error: &str) -> Result<(), QueueError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE index_jobs
                 SET processing = 0, dead = 1, attempts = ?2, last_error = ?3
                 WHERE seq = ?1",
                params![seq, attempts, error],
            )
        })?;
        Ok(())
    }

    fn count_where(&self, condition: &str, now: Option<i64>) -> Result<usize, QueueError> {
        let sql = format!("SELECT COUNT(*) FROM index_jobs WHERE {}", condition);
        let count: i64 = self.db.with_conn(|conn| match now {
            Some(now) => conn.query_row(&sql, params![now], |r| r.get(0)),
            None => conn.query_row(&sql, [], |r| r.get(0)),
        })?;
        Ok(count as usize)
    }

    fn summaries(&self, condition: &str) -> Result<Vec<JobSummary>, QueueError> {
        let sql = format!(
            "SELECT seq, page_id, processing, attempts, last_error, not_before, dead, reindex,
                    enqueued_at
             FROM index_jobs WHERE {} ORDER BY seq",
            condition
        );
        Ok(self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(JobSummary {
                        seq: row.get(0)?,
                        page_id: row.get(1)?,
                        processing: row.get(2)?,
                        attempts: row.get(3)?,
                        last_error: row.get(4)?,
                        not_before: row.get(5)?,
                        dead: row.get(6)?,
                        reindex: row.get(7)?,
                        enqueued_at: row.get(8)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?)
    }
}

/// Processes one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), IndexError>;
}

struct RunnerInner {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    workers: usize,
    job_timeout: Duration,
    active: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bounded pool of drain tasks over a [`JobQueue`].
///
/// Drain tasks are started on demand by [`JobRunner::kick`] and exit when
/// the queue has nothing claimable. A task that hits a transient failure
/// unlocks the job and stops; the next kick picks the work up again.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    /// Create a runner with at most `workers` concurrent drain tasks.
    pub fn new(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        job_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                queue,
                handler,
                workers: workers.max(1),
                job_timeout,
                active: AtomicUsize::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// Number of drain tasks currently running.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Start drain tasks up to the worker limit. Never waits.
    pub fn kick(&self) {
        let mut tasks = match self.inner.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.retain(|t| !t.is_finished());

        while self.inner.try_acquire_slot() {
            let inner = Arc::clone(&self.inner);
            tasks.push(tokio::spawn(async move { inner.drain().await }));
        }
    }

    /// Drain until nothing is claimable and no task is running.
    ///
    /// Jobs waiting out a backoff are not waited for.
    pub async fn drain_until_idle(&self) -> Result<(), QueueError> {
        loop {
            self.kick();
            let tasks = {
                let mut guard = match self.inner.tasks.lock() {
                    Ok(tasks) => tasks,
                    Err(poisoned) => poisoned.into_inner(),
                };
                std::mem::take(&mut *guard)
            };
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Drain task panicked: {}", e);
                }
            }

            if self.active() == 0 && self.inner.queue.claimable_count()? == 0 {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }
}

impl RunnerInner {
    fn try_acquire_slot(&self) -> bool {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.workers).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn drain(&self) {
        loop {
            let job = match self.queue.claim() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.release_slot();
                    // An enqueue may have raced with the empty claim.
                    match self.queue.claimable_count() {
                        Ok(n) if n > 0 && self.try_acquire_slot() => continue,
                        _ => return,
                    }
                }
                Err(e) => {
                    error!("Failed to claim index job: {}", e);
                    self.release_slot();
                    return;
                }
            };

            if !self.run(job).await {
                self.release_slot();
                return;
            }
        }
    }

    /// Process one job. Returns false when the drain task should stop.
    async fn run(&self, job: Job) -> bool {
        let result =
            match tokio::time::timeout(self.job_timeout, self.handler.handle(&job)).await {
                Ok(result) => result,
                Err(_) => Err(IndexError::Timeout(self.job_timeout)),
            };

        let err = match result {
            Ok(()) => {
                if let Err(e) = self.queue.complete(job.seq) {
                    error!("Failed to complete job {}: {}", job.seq, e);
                    return false;
                }
                debug!("Job {} for page {} done", job.seq, job.page_id);
                return true;
            }
            Err(err) => err,
        };

        let message = err.to_string();
        let bookkeeping = match err.kind() {
            FailureKind::Malformed => {
                error!("Discarding job {} for page {}: {}", job.seq, job.page_id, message);
                self.queue.discard(job.seq)
            }
            FailureKind::Fatal => match err {
                IndexError::PageMissing(_) => {
                    warn!("Discarding job {}: {}", job.seq, message);
                    self.queue.discard(job.seq)
                }
                _ => {
                    error!(
                        "Job {} for page {} failed permanently: {}",
                        job.seq, job.page_id, message
                    );
                    self.queue.dead_letter(job.seq, &message)
                }
            },
            FailureKind::Transient => {
                warn!("Job {} for page {} failed: {}", job.seq, job.page_id, message);
                return match self.queue.fail(job.seq, &message) {
                    Ok(_) => false,
                    Err(e) => {
                        error!("Failed to unlock job {}: {}", job.seq, e);
                        false
                    }
                };
            }
        };

        match bookkeeping {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to settle job {}: {}", job.seq, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn queue() -> JobQueue {
        JobQueue::open(Database::in_memory().unwrap(), QueueConfig::default()).unwrap()
    }

    fn queue_with(db: Database, max_attempts: u32, base_delay: Duration) -> JobQueue {
        JobQueue::open(
            db,
            QueueConfig {
                max_attempts,
                backoff: RetryPolicy {
                    base_delay,
                    max_delay: base_delay,
                    jitter: 0.0,
                    ..RetryPolicy::default()
                },
            },
        )
        .unwrap()
    }

    #[test]
    fn test_enqueue_coalesces_pending_jobs() {
        let queue = queue();
        queue.enqueue("A", "s1").unwrap();
        queue.enqueue("B", "b1").unwrap();
        let latest = queue.enqueue("A", "s2").unwrap();

        assert_eq!(queue.pending_count().unwrap(), 2);
        let jobs = queue.list().unwrap();
        assert_eq!(jobs.iter().filter(|j| j.page_id == "A").count(), 1);

        let first = queue.claim().unwrap().unwrap();
        assert_eq!(first.page_id, "B");
        let second = queue.claim().unwrap().unwrap();
        assert_eq!(second.seq, latest);
        assert_eq!(second.snapshot, "s2");
    }

    #[test]
    fn test_reindex_request_survives_coalescing() {
        let queue = queue();
        queue.enqueue_reindex("A", "s1").unwrap();
        queue.enqueue("A", "s2").unwrap();
        queue.enqueue("B", "b1").unwrap();

        let a = queue.claim().unwrap().unwrap();
        assert_eq!(a.snapshot, "s2");
        assert!(a.reindex);
        let b = queue.claim().unwrap().unwrap();
        assert!(!b.reindex);
        assert!(queue.list().unwrap().iter().all(|j| j.processing));
    }

    #[test]
    fn test_reindex_does_not_touch_job_in_flight() {
        let queue = queue();
        queue.enqueue("A", "s1").unwrap();
        let running = queue.claim().unwrap().unwrap();
        assert!(!running.reindex);

        queue.enqueue_reindex("A", "s1").unwrap();
        queue.complete(running.seq).unwrap();

        let next = queue.claim().unwrap().unwrap();
        assert!(next.reindex);
    }

    #[test]
    fn test_claim_serializes_per_page() {
        let queue = queue();
        queue.enqueue("A", "s1").unwrap();
        let job = queue.claim().unwrap().unwrap();

        // A newer snapshot does not replace the one in flight, and waits for it
        queue.enqueue("A", "s2").unwrap();
        assert!(queue.claim().unwrap().is_none());

        queue.complete(job.seq).unwrap();
        let next = queue.claim().unwrap().unwrap();
        assert_eq!(next.snapshot, "s2");
    }

    #[test]
    fn test_fail_unlocks_with_backoff() {
        let queue = queue_with(Database::in_memory().unwrap(), 5, Duration::from_secs(3600));
        queue.enqueue("A", "s1").unwrap();
        let job = queue.claim().unwrap().unwrap();

        let outcome = queue.fail(job.seq, "embedding service down").unwrap();
        assert_eq!(outcome, FailOutcome::Retry(Duration::from_secs(3600)));

        let summary = &queue.list().unwrap()[0];
        assert!(!summary.processing);
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.last_error.as_deref(), Some("embedding service down"));
        assert_eq!(queue.pending_count().unwrap(), 1);
        assert_eq!(queue.claimable_count().unwrap(), 0);
        assert!(queue.claim().unwrap().is_none());
    }

    #[test]
    fn test_dead_letter_after_max_attempts_and_revive() {
        let queue = queue_with(Database::in_memory().unwrap(), 2, Duration::ZERO);
        queue.enqueue("A", "s1").unwrap();

        let job = queue.claim().unwrap().unwrap();
        assert!(matches!(queue.fail(job.seq, "boom").unwrap(), FailOutcome::Retry(_)));
        let job = queue.claim().unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(queue.fail(job.seq, "boom").unwrap(), FailOutcome::DeadLettered);

        assert!(queue.claim().unwrap().is_none());
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert_eq!(queue.dead_letters().unwrap().len(), 1);

        assert_eq!(queue.retry_dead().unwrap(), 1);
        let job = queue.claim().unwrap().unwrap();
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn test_enqueue_replaces_dead_letter() {
        let queue = queue();
        queue.enqueue("A", "s1").unwrap();
        let job = queue.claim().unwrap().unwrap();
        queue.dead_letter(job.seq, "bad dims").unwrap();
        assert_eq!(queue.dead_letters().unwrap().len(), 1);

        queue.enqueue("A", "s2").unwrap();
        assert!(queue.dead_letters().unwrap().is_empty());
        assert_eq!(queue.claim().unwrap().unwrap().snapshot, "s2");
    }

    #[test]
    fn test_fail_unknown_job() {
        let queue = queue();
        assert!(matches!(
            queue.fail(42, "gone"),
            Err(QueueError::JobNotFound(42))
        ));
    }

    #[test]
    fn test_recover_unlocks_interrupted_jobs() {
        let db = Database::in_memory().unwrap();
        let queue = JobQueue::open(db.clone(), QueueConfig::default()).unwrap();
        queue.enqueue("A", "a1").unwrap();
        queue.enqueue("B", "b1").unwrap();
        queue.claim().unwrap().unwrap();
        queue.claim().unwrap().unwrap();
        // A got a newer snapshot while its first job was in flight
        queue.enqueue("A", "a2").unwrap();

        let reopened = JobQueue::open(db, QueueConfig::default()).unwrap();
        let jobs = reopened.list().unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| !j.processing));

        let mut snapshots = Vec::new();
        while let Some(job) = reopened.claim().unwrap() {
            snapshots.push(job.snapshot.clone());
            reopened.complete(job.seq).unwrap();
        }
        snapshots.sort();
        assert_eq!(snapshots, vec!["a2", "b1"]);
    }

    #[test]
    fn test_remove_page_keeps_other_pages() {
        let queue = queue();
        queue.enqueue("A", "s1").unwrap();
        queue.enqueue("B", "s1").unwrap();
        assert_eq!(queue.remove_page("A").unwrap(), 1);
        assert_eq!(queue.list().unwrap()[0].page_id, "B");
    }

    struct ScriptedHandler {
        calls: AtomicU32,
        fail_first: u32,
        kind: fn(&Job) -> IndexError,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, job: &Job) -> Result<(), IndexError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err((self.kind)(job));
            }
            Ok(())
        }
    }

    fn handler(fail_first: u32, kind: fn(&Job) -> IndexError) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            fail_first,
            kind,
        })
    }

    #[tokio::test]
    async fn test_runner_drains_all_pages() {
        let queue = queue();
        let h = handler(0, |_| IndexError::Timeout(Duration::ZERO));
        let runner = JobRunner::new(queue.clone(), h.clone(), 2, DEFAULT_JOB_TIMEOUT);

        for page in ["A", "B", "C"] {
            queue.enqueue(page, "{}").unwrap();
        }
        runner.drain_until_idle().await.unwrap();

        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert!(queue.list().unwrap().is_empty());
        assert_eq!(runner.active(), 0);
    }

    #[tokio::test]
    async fn test_runner_stops_on_transient_failure() {
        let queue = queue_with(Database::in_memory().unwrap(), 5, Duration::from_secs(3600));
        let h = handler(1, |_| {
            IndexError::Embedding(crate::embeddings::EmbeddingError::NetworkError(
                "refused".to_string(),
            ))
        });
        let runner = JobRunner::new(queue.clone(), h.clone(), 1, DEFAULT_JOB_TIMEOUT);

        queue.enqueue("A", "{}").unwrap();
        runner.drain_until_idle().await.unwrap();

        let jobs = queue.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].processing);
        assert_eq!(jobs[0].attempts, 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_runner_discards_missing_page_and_dead_letters_fatal() {
        let queue = queue();
        let h = handler(2, |job| {
            if job.page_id == "gone" {
                IndexError::PageMissing(job.page_id.clone())
            } else {
                IndexError::DimensionMismatch {
                    expected: 4,
                    actual: 3,
                }
            }
        });
        let runner = JobRunner::new(queue.clone(), h, 1, DEFAULT_JOB_TIMEOUT);

        queue.enqueue("gone", "{}").unwrap();
        queue.enqueue("bad", "{}").unwrap();
        runner.drain_until_idle().await.unwrap();

        let jobs = queue.list().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].page_id, "bad");
        assert!(jobs[0].dead);
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> Result<(), IndexError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runner_times_out_job_as_transient() {
        let queue = queue_with(Database::in_memory().unwrap(), 5, Duration::from_secs(3600));
        let runner = JobRunner::new(
            queue.clone(),
            Arc::new(SlowHandler),
            1,
            Duration::from_millis(20),
        );

        queue.enqueue("A", "{}").unwrap();
        runner.drain_until_idle().await.unwrap();

        let jobs = queue.list().unwrap();
        assert_eq!(jobs[0].attempts, 1);
        assert!(jobs[0].last_error.as_deref().unwrap().contains("deadline"));
    }
}
