//! Background training: submit → job id → poll.
//!
//! Training blocks for the whole fit, which is too long to hold a request
//! handler. [`TrainingQueue`] moves it onto a dedicated worker thread fed by a
//! bounded channel; callers poll [`TrainingQueue::status`] for the outcome.

use crate::trainer::Trainer;
use crate::types::RawImage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type JobId = Uuid;

/// Finished jobs kept for polling before the oldest are evicted.
pub const DEFAULT_RETAINED_JOBS: usize = 256;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("training worker has shut down")]
    WorkerGone,
    #[error("training queue is full")]
    QueueFull,
    #[error("failed to spawn training worker: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

/// Snapshot of one submitted training job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub identity: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure cause, for `Failed` jobs.
    pub error: Option<String>,
}

struct TrainRequest {
    id: JobId,
    identity: String,
    images: Vec<RawImage>,
}

/// Live job statuses plus the completion order of finished ones.
#[derive(Default)]
struct JobBook {
    statuses: HashMap<JobId, JobStatus>,
    finished: VecDeque<JobId>,
    retain: usize,
}

impl JobBook {
    /// Record `id` as finished and evict the oldest finished jobs past the bound.
    fn finish(&mut self, id: JobId) {
        self.finished.push_back(id);
        while self.finished.len() > self.retain {
            if let Some(old) = self.finished.pop_front() {
                self.statuses.remove(&old);
            }
        }
    }
}

type JobTable = Arc<Mutex<JobBook>>;

/// Clone-safe handle to the training worker. The worker exits once every
/// handle has been dropped and the queue is drained.
#[derive(Clone)]
pub struct TrainingQueue {
    tx: mpsc::Sender<TrainRequest>,
    jobs: JobTable,
}

impl TrainingQueue {
    /// Start the worker thread. `capacity` bounds the number of queued jobs.
    pub fn spawn(trainer: Arc<Trainer>, capacity: usize) -> Result<Self, JobError> {
        Self::spawn_with_retention(trainer, capacity, DEFAULT_RETAINED_JOBS)
    }

    /// Like [`spawn`](Self::spawn), keeping at most `retain` finished jobs
    /// pollable. Older finished jobs are dropped from the table.
    pub fn spawn_with_retention(
        trainer: Arc<Trainer>,
        capacity: usize,
        retain: usize,
    ) -> Result<Self, JobError> {
        let (tx, mut rx) = mpsc::channel::<TrainRequest>(capacity.max(1));
        let jobs: JobTable = Arc::new(Mutex::new(JobBook {
            retain: retain.max(1),
            ..JobBook::default()
        }));
        let worker_jobs = Arc::clone(&jobs);

        std::thread::Builder::new()
            .name("rollcall-trainer".into())
            .spawn(move || {
                tracing::info!("training worker started");
                while let Some(req) = rx.blocking_recv() {
                    run_job(&trainer, &worker_jobs, req);
                }
                tracing::info!("training worker exiting");
            })
            .map_err(JobError::Spawn)?;

        Ok(Self { tx, jobs })
    }

    /// Queue a training job, waiting for room if the queue is full.
    pub async fn submit(
        &self,
        identity: impl Into<String>,
        images: Vec<RawImage>,
    ) -> Result<JobId, JobError> {
        let req = self.register(identity.into(), images);
        let id = req.id;
        if self.tx.send(req).await.is_err() {
            self.forget(&id);
            return Err(JobError::WorkerGone);
        }
        Ok(id)
    }

    /// Queue a training job without waiting; fails if the queue is full.
    pub fn try_submit(
        &self,
        identity: impl Into<String>,
        images: Vec<RawImage>,
    ) -> Result<JobId, JobError> {
        let req = self.register(identity.into(), images);
        let id = req.id;
        match self.tx.try_send(req) {
            Ok(()) => Ok(id),
            Err(e) => {
                self.forget(&id);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => JobError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => JobError::WorkerGone,
                })
            }
        }
    }

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        lock(&self.jobs).statuses.get(id).cloned()
    }

    /// Return a finished job's status and stop tracking it. Queued and
    /// running jobs are left in place and yield `None`.
    pub fn take(&self, id: &JobId) -> Option<JobStatus> {
        let mut book = lock(&self.jobs);
        if !book.statuses.get(id)?.state.is_finished() {
            return None;
        }
        book.finished.retain(|f| f != id);
        book.statuses.remove(id)
    }

    fn register(&self, identity: String, images: Vec<RawImage>) -> TrainRequest {
        let id = Uuid::new_v4();
        lock(&self.jobs).statuses.insert(
            id,
            JobStatus {
                id,
                identity: identity.clone(),
                state: JobState::Queued,
                submitted_at: Utc::now(),
                started_at: None,
                finished_at: None,
                error: None,
            },
        );
        tracing::debug!(job = %id, identity, images = images.len(), "training job queued");
        TrainRequest { id, identity, images }
    }

    fn forget(&self, id: &JobId) {
        lock(&self.jobs).statuses.remove(id);
    }
}

fn run_job(trainer: &Trainer, jobs: &JobTable, req: TrainRequest) {
    update(jobs, &req.id, |s| {
        s.state = JobState::Running;
        s.started_at = Some(Utc::now());
    });

    let outcome = trainer.try_train(&req.identity, &req.images);
    let error = match &outcome {
        Ok(report) => {
            tracing::info!(
                job = %req.id,
                identity = %req.identity,
                positives = report.positives,
                loss = report.final_loss,
                "training job succeeded"
            );
            None
        }
        Err(e) => {
            tracing::error!(job = %req.id, identity = %req.identity, error = %e, "training job failed");
            Some(e.to_string())
        }
    };

    let mut book = lock(jobs);
    if let Some(s) = book.statuses.get_mut(&req.id) {
        s.state = if error.is_none() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        s.finished_at = Some(Utc::now());
        s.error = error;
        book.finish(req.id);
    }
}

fn update(jobs: &JobTable, id: &JobId, f: impl FnOnce(&mut JobStatus)) {
    if let Some(status) = lock(jobs).statuses.get_mut(id) {
        f(status);
    }
}

fn lock(jobs: &JobTable) -> std::sync::MutexGuard<'_, JobBook> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}
