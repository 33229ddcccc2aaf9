//! Export status store.
//!
//! The job record is the only state shared between pollers and the worker
//! that owns a job, so every mutation is a single read-modify-write performed
//! under the store's own entry lock.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use time::OffsetDateTime;

use crate::job::{ExportJob, ExportStatus, JobIssue};
use crate::rate_limit::{PollDecision, PollRateLimiter};

#[derive(Debug, Error)]
pub enum StatusStoreError {
    #[error("Export job not found: {0}")]
    NotFound(String),

    #[error("Export job already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid export status transition for {job_id} from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: ExportStatus,
        to: ExportStatus,
    },
}

impl StatusStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The job is still running; the limiter decided how to answer.
    Waiting(PollDecision),
    /// The job is terminal. Polling it never touches the window.
    Finished(Box<ExportJob>),
}

#[async_trait]
pub trait ExportStatusStore: Send + Sync {
    async fn create(&self, job: ExportJob) -> Result<(), StatusStoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<ExportJob>, StatusStoreError>;

    /// Applies the poll limiter to the job's window atomically.
    async fn register_poll(
        &self,
        job_id: &str,
        limiter: &PollRateLimiter,
        now: OffsetDateTime,
    ) -> Result<PollOutcome, StatusStoreError>;

    /// Pending → InProgress. Already InProgress is accepted so a redelivered
    /// message can be processed again.
    async fn mark_in_progress(&self, job_id: &str) -> Result<(), StatusStoreError>;

    async fn push_warning(&self, job_id: &str, warning: JobIssue) -> Result<(), StatusStoreError>;

    async fn complete(&self, job_id: &str, now: OffsetDateTime) -> Result<(), StatusStoreError>;

    async fn fail(
        &self,
        job_id: &str,
        error: JobIssue,
        now: OffsetDateTime,
    ) -> Result<(), StatusStoreError>;
}

/// Status store backed by a `DashMap`; `get_mut` holds the shard lock for the
/// whole read-modify-write.
#[derive(Debug, Default)]
pub struct InMemoryStatusStore {
    jobs: DashMap<String, ExportJob>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn update<T>(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut ExportJob) -> Result<T, StatusStoreError>,
    ) -> Result<T, StatusStoreError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| StatusStoreError::NotFound(job_id.to_string()))?;
        apply(entry.value_mut())
    }
}

fn transition(job: &mut ExportJob, to: ExportStatus) -> Result<(), StatusStoreError> {
    if !job.status.can_transition_to(to) {
        return Err(StatusStoreError::InvalidTransition {
            job_id: job.id.clone(),
            from: job.status,
            to,
        });
    }
    job.status = to;
    Ok(())
}

#[async_trait]
impl ExportStatusStore for InMemoryStatusStore {
    async fn create(&self, job: ExportJob) -> Result<(), StatusStoreError> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(StatusStoreError::AlreadyExists(job.id)),
            Entry::Vacant(slot) => {
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get(&self, job_id: &str) -> Result<Option<ExportJob>, StatusStoreError> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    async fn register_poll(
        &self,
        job_id: &str,
        limiter: &PollRateLimiter,
        now: OffsetDateTime,
    ) -> Result<PollOutcome, StatusStoreError> {
        self.update(job_id, |job| {
            if job.status.is_terminal() {
                return Ok(PollOutcome::Finished(Box::new(job.clone())));
            }
            Ok(PollOutcome::Waiting(
                limiter.register(&mut job.poll_window, now),
            ))
        })
    }

    async fn mark_in_progress(&self, job_id: &str) -> Result<(), StatusStoreError> {
        self.update(job_id, |job| {
            if job.status == ExportStatus::InProgress {
                return Ok(());
            }
            transition(job, ExportStatus::InProgress)
        })
    }

    async fn push_warning(&self, job_id: &str, warning: JobIssue) -> Result<(), StatusStoreError> {
        self.update(job_id, |job| {
            job.warnings.push(warning);
            Ok(())
        })
    }

    async fn complete(&self, job_id: &str, now: OffsetDateTime) -> Result<(), StatusStoreError> {
        self.update(job_id, |job| {
            transition(job, ExportStatus::Completed)?;
            job.finished_at = Some(now);
            Ok(())
        })
    }

    async fn fail(
        &self,
        job_id: &str,
        error: JobIssue,
        now: OffsetDateTime,
    ) -> Result<(), StatusStoreError> {
        self.update(job_id, |job| {
            transition(job, ExportStatus::Failed)?;
            job.error = Some(error);
            job.finished_at = Some(now);
            Ok(())
        })
    }
}
