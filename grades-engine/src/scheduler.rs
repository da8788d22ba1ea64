//! Recompute scheduler
//!
//! Work arrives on an unbounded queue and is held for `recalculate_delay`
//! so bursts on the same key coalesce into one task. Released tasks run on
//! a bounded worker pool; each (learner, subsection) and (learner, course)
//! is serialized by its own lock. Retryable failures back off exponentially
//! until `scheduler_max_attempts`, after which the task is recorded in
//! `grade_task_failures` and announced as `GradeTaskFailed`.

use crate::config::RuntimeSettings;
use crate::context::GradeContext;
use crate::engine::CourseGradeEngine;
use crate::error::{GradesError, Result};
use crate::stores::{FailureStore, FrozenGuard, GradeStores, ScoreStore};
use crate::structure::CourseStructure;
use chrono::{DateTime, Utc};
use grades_common::events::{EventBus, GradeEvent, OverrideChanged, WeightedScoreChanged};
use grades_common::time;
use grades_common::{CourseKey, LearnerId, UsageKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A unit of recompute work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GradeWork {
    /// A block score was written
    ScoreChanged(WeightedScoreChanged),
    /// An override was created, changed or removed
    OverrideChanged(OverrideChanged),
    /// Recompute a course grade without a score change
    CourseRecompute {
        event_transaction_id: Uuid,
        learner_id: LearnerId,
        course_id: CourseKey,
        reason: String,
        requested_at: DateTime<Utc>,
    },
}

impl GradeWork {
    pub fn event_transaction_id(&self) -> Uuid {
        match self {
            GradeWork::ScoreChanged(e) => e.event_transaction_id,
            GradeWork::OverrideChanged(e) => e.event_transaction_id,
            GradeWork::CourseRecompute {
                event_transaction_id,
                ..
            } => *event_transaction_id,
        }
    }

    pub fn learner_id(&self) -> LearnerId {
        match self {
            GradeWork::ScoreChanged(e) => e.learner_id,
            GradeWork::OverrideChanged(e) => e.learner_id,
            GradeWork::CourseRecompute { learner_id, .. } => *learner_id,
        }
    }

    pub fn course_id(&self) -> &CourseKey {
        match self {
            GradeWork::ScoreChanged(e) => &e.course_id,
            GradeWork::OverrideChanged(e) => &e.course_id,
            GradeWork::CourseRecompute { course_id, .. } => course_id,
        }
    }

    /// Time of the change that produced this work
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            GradeWork::ScoreChanged(e) => e.modified_at,
            GradeWork::OverrideChanged(e) => e.modified_at,
            GradeWork::CourseRecompute { requested_at, .. } => *requested_at,
        }
    }

    /// Coalescing key
    pub fn key(&self) -> TaskKey {
        match self {
            GradeWork::ScoreChanged(e) => TaskKey::Block(e.learner_id, e.block_id.normalized()),
            GradeWork::OverrideChanged(e) => {
                TaskKey::Subsection(e.learner_id, e.subsection_id.normalized())
            }
            GradeWork::CourseRecompute {
                learner_id,
                course_id,
                ..
            } => TaskKey::Course(*learner_id, course_id.normalized()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Block(LearnerId, UsageKey),
    Subsection(LearnerId, UsageKey),
    Course(LearnerId, CourseKey),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Block(l, k) | TaskKey::Subsection(l, k) => write!(f, "{}:{}", l, k),
            TaskKey::Course(l, k) => write!(f, "{}:{}", l, k),
        }
    }
}

/// Queued and running task count, with a wakeup when it reaches zero
#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Producer handle for the scheduler
#[derive(Clone)]
pub struct GradeQueue {
    tx: mpsc::UnboundedSender<GradeWork>,
    outstanding: Arc<Outstanding>,
}

impl GradeQueue {
    pub fn enqueue(&self, work: GradeWork) -> Result<()> {
        self.outstanding.start();
        if self.tx.send(work).is_err() {
            self.outstanding.finish();
            return Err(GradesError::Cancelled);
        }
        Ok(())
    }
}

/// What the scheduler needs to run tasks
#[derive(Clone)]
pub struct SchedulerDeps {
    pub structure: Arc<dyn CourseStructure>,
    pub stores: GradeStores,
    pub courses: CourseGradeEngine,
    pub bus: EventBus,
}

struct Inner {
    structure: Arc<dyn CourseStructure>,
    scores: ScoreStore,
    frozen: FrozenGuard,
    failures: FailureStore,
    courses: CourseGradeEngine,
    bus: EventBus,
    settings: RuntimeSettings,
    pending: Mutex<HashMap<TaskKey, GradeWork>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    outstanding: Arc<Outstanding>,
}

pub struct GradeScheduler {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl GradeScheduler {
    /// Spawn the dispatcher and return the scheduler with its queue
    pub fn start(
        deps: SchedulerDeps,
        settings: RuntimeSettings,
        cancel: CancellationToken,
    ) -> (Self, GradeQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(Outstanding::default());
        let inner = Arc::new(Inner {
            structure: deps.structure,
            scores: deps.stores.scores.clone(),
            frozen: deps.stores.frozen.clone(),
            failures: deps.stores.failures.clone(),
            courses: deps.courses,
            bus: deps.bus,
            permits: Arc::new(Semaphore::new(settings.scheduler_workers.max(1))),
            settings,
            pending: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
            cancel,
            outstanding: outstanding.clone(),
        });

        info!(
            workers = inner.settings.scheduler_workers,
            delay_ms = inner.settings.recalculate_delay_ms,
            "Grade scheduler started"
        );
        let handle = tokio::spawn(dispatch(inner.clone(), rx));
        let queue = GradeQueue { tx, outstanding };
        (
            Self {
                inner,
                dispatcher: Mutex::new(Some(handle)),
            },
            queue,
        )
    }

    /// Number of queued or running tasks
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.count.load(Ordering::SeqCst)
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.outstanding.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancel pending work and stop the dispatcher
    ///
    /// Tasks already writing finish their current subsection; nothing new
    /// starts.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler dispatcher ended abnormally");
            }
        }
        self.wait_idle().await;
        info!("Grade scheduler stopped");
    }
}

async fn dispatch(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<GradeWork>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            work = rx.recv() => match work {
                Some(work) => submit(&inner, work).await,
                None => break,
            },
        }
    }

    // Work still in the channel will never run
    rx.close();
    while let Ok(work) = rx.try_recv() {
        debug!(key = %work.key(), "Discarding queued work on shutdown");
        inner.outstanding.finish();
    }
}

async fn submit(inner: &Arc<Inner>, work: GradeWork) {
    let key = work.key();
    let mut pending = inner.pending.lock().await;
    if let Some(existing) = pending.get_mut(&key) {
        // Coalesced into the task already waiting
        if work.modified_at() >= existing.modified_at() {
            *existing = work;
        }
        drop(pending);
        debug!(key = %key, "Coalesced grade work");
        inner.outstanding.finish();
        return;
    }
    pending.insert(key.clone(), work);
    drop(pending);
    tokio::spawn(release(inner.clone(), key));
}

async fn release(inner: Arc<Inner>, key: TaskKey) {
    let cancelled = tokio::select! {
        _ = inner.cancel.cancelled() => true,
        _ = tokio::time::sleep(inner.settings.recalculate_delay()) => false,
    };
    let work = inner.pending.lock().await.remove(&key);

    if let Some(work) = work {
        if cancelled {
            debug!(key = %key, "Dropping pending grade work on cancel");
        } else {
            inner.run(work).await;
        }
    }
    inner.outstanding.finish();
}

impl Inner {
    async fn run(&self, work: GradeWork) {
        let task_key = work.key().to_string();
        let deadline = self.settings.task_deadline();
        let max_attempts = self.settings.scheduler_max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                debug!(key = %task_key, "Grade task cancelled before start");
                break;
            }

            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                break;
            };

            let result = match tokio::time::timeout(deadline, self.process(&work)).await {
                Ok(result) => result,
                Err(_) => Err(GradesError::DeadlineExceeded(self.settings.scheduler_task_deadline_ms)),
            };
            drop(permit);

            match result {
                Ok(()) => {
                    debug!(key = %task_key, attempt, "Grade task complete");
                    break;
                }
                Err(GradesError::Cancelled) => {
                    debug!(key = %task_key, "Grade task cancelled");
                    break;
                }
                Err(GradesError::GradesFrozen(course)) => {
                    warn!(key = %task_key, course = %course, "Recompute refused: grades frozen");
                    break;
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = self.settings.backoff_for(attempt);
                    warn!(
                        key = %task_key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Grade task failed, will retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    let failure = if e.is_retryable() {
                        GradesError::RetryExhausted {
                            key: task_key.clone(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        }
                    } else {
                        e
                    };
                    self.record_failure(&work, &task_key, &failure, attempt).await;
                    break;
                }
            }
        }
        self.prune_locks().await;
    }

    async fn record_failure(&self, work: &GradeWork, task_key: &str, err: &GradesError, attempts: u32) {
        error!(key = %task_key, attempts, code = err.code(), error = %err, "Grade task failed");
        let payload = serde_json::to_value(work).unwrap_or_else(|e| {
            serde_json::json!({ "unserializable": e.to_string() })
        });
        let failed_at = time::now();

        if let Err(e) = self
            .failures
            .record(
                work.event_transaction_id(),
                task_key,
                err.code(),
                &err.to_string(),
                attempts,
                &payload,
                failed_at,
            )
            .await
        {
            error!(key = %task_key, error = %e, "Failed to record grade task failure");
        }

        self.bus.emit_lossy(GradeEvent::GradeTaskFailed {
            event_transaction_id: work.event_transaction_id(),
            task_key: task_key.to_string(),
            error_code: err.code().to_string(),
            message: err.to_string(),
            attempts,
            payload,
            timestamp: failed_at,
        });
    }

    async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let mutex = self
            .key_locks
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    async fn prune_locks(&self) {
        self.key_locks
            .lock()
            .await
            .retain(|_, m| Arc::strong_count(m) > 1);
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(GradesError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Fail with `StaleRead` until the score store reflects the event
    async fn verify_read(&self, change: &WeightedScoreChanged) -> Result<()> {
        let stale = |detail: &str| GradesError::StaleRead {
            key: format!("{}:{}", change.learner_id, change.block_id),
            detail: detail.to_string(),
        };
        match self.scores.get(change.learner_id, &change.block_id).await? {
            None => Err(stale("score row missing")),
            Some(row) if row.modified_at < change.modified_at => {
                Err(stale("stored score older than event"))
            }
            Some(row) if row.modified_at == change.modified_at && !row.matches(change) => {
                Err(stale("stored score differs at same timestamp"))
            }
            Some(_) => Ok(()),
        }
    }

    async fn process(&self, work: &GradeWork) -> Result<()> {
        let learner_id = work.learner_id();
        let txn = work.event_transaction_id();
        self.frozen.ensure_not_frozen(work.course_id()).await?;

        let (ctx, subsections, as_of) = match work {
            GradeWork::ScoreChanged(change) => {
                self.verify_read(change).await?;
                let ctx = GradeContext::load(self.structure.as_ref(), &change.course_id).await?;
                let parents: Vec<UsageKey> = ctx
                    .view()
                    .parent_subsections(&change.block_id)
                    .into_iter()
                    .map(|s| s.usage_key.clone())
                    .collect();
                if parents.is_empty() {
                    return Err(GradesError::StructureUnavailable(format!(
                        "Block {} is not in any subsection",
                        change.block_id
                    )));
                }
                (ctx, parents, Some(change.modified_at))
            }
            GradeWork::OverrideChanged(change) => {
                let ctx = GradeContext::load(self.structure.as_ref(), &change.course_id).await?;
                (ctx, vec![change.subsection_id.normalized()], Some(change.modified_at))
            }
            GradeWork::CourseRecompute { course_id, .. } => {
                let ctx = GradeContext::load(self.structure.as_ref(), course_id).await?;
                (ctx, Vec::new(), None)
            }
        };

        for subsection in &subsections {
            self.check_cancel()?;
            let _guard = self
                .lock(TaskKey::Subsection(learner_id, subsection.clone()).to_string())
                .await;
            self.courses
                .subsections()
                .compute(&ctx, learner_id, subsection, txn)
                .await?;
        }

        self.check_cancel()?;
        let _guard = self
            .lock(TaskKey::Course(learner_id, ctx.course_key().clone()).to_string())
            .await;
        self.courses.compute(&ctx, learner_id, txn, as_of).await?;
        Ok(())
    }
}
