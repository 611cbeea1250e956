//! Durable job queue: create/claim/progress/complete/fail, plus stale-job
//! recovery on process startup.
//!
//! All job-state mutations funnel through this module. State transitions
//! form a DAG — `Queued -> InProgress -> (Completed | Failed)`, with a
//! direct `Queued -> Failed` edge reserved for jobs that exhausted their
//! attempts while stale — and are represented as a Rust enum so a caller
//! can never observe, say, a `worker_id` on a job that was never claimed.

use crate::metadata::{MetadataError, MetadataStore};
use bson::oid::ObjectId;
use bson::{doc, Bson};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

const COLLECTION: &str = "jobs";
const MAX_ERROR_TAIL: i32 = 100;

pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 5 * 60;
pub const DEFAULT_STALE_THRESHOLD_SECS: i64 = 10 * 60;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(ObjectId),

    #[error("job {0} is not in a state that allows this transition")]
    InvalidTransition(ObjectId),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// Outcome recorded on a job's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub lines_processed: u64,
    pub records_inserted: u64,
    pub error_count: u64,
    pub message: String,
}

/// Running counters updated once per flushed batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub lines_processed: u64,
    pub records_inserted: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A job's lifecycle state. Fields that only make sense in one phase (the
/// claiming worker's id, its lease expiry, the terminal result) live inside
/// the variant that owns them rather than as nullable top-level fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    InProgress {
        worker_id: String,
        lock_until: DateTime<Utc>,
    },
    Completed {
        result: JobResult,
    },
    Failed {
        result: JobResult,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub file_id: ObjectId,
    #[serde(flatten)]
    pub state: JobState,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    #[serde(default)]
    pub errors: Vec<JobErrorEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryReport {
    pub reset: u64,
    pub failed: u64,
}

pub struct JobQueue {
    store: Arc<dyn MetadataStore>,
    lock_timeout: Duration,
    stale_threshold: Duration,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        lock_timeout: Duration,
        stale_threshold: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            lock_timeout,
            stale_threshold,
            max_attempts,
        }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, file_id: ObjectId) -> Result<JobRecord, JobError> {
        let now = Utc::now();
        let doc = doc! {
            "file_id": file_id,
            "state": "queued",
            "attempts": 0,
            "queued_at": Bson::DateTime(now.into()),
            "started_at": Bson::Null,
            "finished_at": Bson::Null,
            "progress": { "lines_processed": 0, "records_inserted": 0, "error_count": 0 },
            "errors": [],
        };
        let id = self.store.insert_one(COLLECTION, doc).await?;
        Ok(JobRecord {
            id,
            file_id,
            state: JobState::Queued,
            attempts: 0,
            queued_at: now,
            started_at: None,
            finished_at: None,
            progress: Progress::default(),
            errors: Vec::new(),
        })
    }

    /// Atomically claim the oldest queued job, if any. The `find-and-update`
    /// is a single document operation conditioned on `state == queued`, so
    /// two concurrent workers can never both claim the same job.
    #[instrument(skip(self))]
    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>, JobError> {
        let now = Utc::now();
        let lock_until = now + self.lock_timeout;
        let filter = doc! { "state": "queued" };
        let update = doc! {
            "$set": {
                "state": "in_progress",
                "worker_id": worker_id,
                "lock_until": Bson::DateTime(lock_until.into()),
                "started_at": Bson::DateTime(now.into()),
            },
            "$inc": { "attempts": 1 },
        };
        let sort = doc! { "queued_at": 1, "_id": 1 };

        let updated = self
            .store
            .find_one_and_update(COLLECTION, filter, update, Some(sort))
            .await?;

        match updated {
            Some(doc) => {
                let record = document_to_record(doc)?;
                info!(job_id = %record.id, worker_id, "claimed job");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, progress))]
    pub async fn update_progress(
        &self,
        job_id: ObjectId,
        progress: &Progress,
    ) -> Result<(), JobError> {
        let lock_until = Utc::now() + self.lock_timeout;
        let matched = self
            .store
            .update_many(
                COLLECTION,
                doc! { "_id": job_id, "state": "in_progress" },
                doc! {
                    "$set": {
                        "progress": {
                            "lines_processed": progress.lines_processed as i64,
                            "records_inserted": progress.records_inserted as i64,
                            "error_count": progress.error_count as i64,
                        },
                        "lock_until": Bson::DateTime(lock_until.into()),
                    }
                },
            )
            .await?;
        if matched == 0 {
            return Err(JobError::InvalidTransition(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn append_error(&self, job_id: ObjectId, message: &str) -> Result<(), JobError> {
        self.store
            .update_many(
                COLLECTION,
                doc! { "_id": job_id },
                doc! {
                    "$push": {
                        "errors": {
                            "$each": [{ "message": message, "timestamp": Bson::DateTime(Utc::now().into()) }],
                            "$slice": -MAX_ERROR_TAIL,
                        }
                    },
                    "$inc": { "progress.error_count": 1 },
                },
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, result))]
    pub async fn complete(&self, job_id: ObjectId, result: JobResult) -> Result<(), JobError> {
        self.finish(job_id, "completed", result).await
    }

    #[instrument(skip(self, result))]
    pub async fn fail(&self, job_id: ObjectId, result: JobResult) -> Result<(), JobError> {
        self.finish(job_id, "failed", result).await
    }

    async fn finish(
        &self,
        job_id: ObjectId,
        terminal_state: &str,
        result: JobResult,
    ) -> Result<(), JobError> {
        let result_bson = bson::to_bson(&result)
            .map_err(|e| JobError::Metadata(MetadataError::Other(e.to_string())))?;
        let matched = self
            .store
            .update_many(
                COLLECTION,
                doc! { "_id": job_id, "state": "in_progress" },
                doc! {
                    "$set": {
                        "state": terminal_state,
                        "result": result_bson,
                        "finished_at": Bson::DateTime(Utc::now().into()),
                    }
                },
            )
            .await?;
        if matched == 0 {
            return Err(JobError::InvalidTransition(job_id));
        }
        Ok(())
    }

    /// Run once at process startup, before any worker begins claiming jobs.
    /// `InProgress` jobs whose lease has expired or that have simply run too
    /// long are reset to `Queued` (if they still have attempts left) or
    /// failed outright (if they've exhausted them).
    #[instrument(skip(self))]
    pub async fn recover_stale(&self) -> Result<RecoveryReport, JobError> {
        let now = Utc::now();
        let stale_cutoff = now - self.stale_threshold;

        let stale_filter = doc! {
            "state": "in_progress",
            "$or": [
                { "lock_until": { "$lt": Bson::DateTime(now.into()) } },
                { "started_at": { "$lt": Bson::DateTime(stale_cutoff.into()) } },
            ],
        };
        let stale_jobs = self.store.find(COLLECTION, stale_filter, None, None, None).await?;

        let mut reset = 0u64;
        let mut failed = 0u64;

        for doc in stale_jobs {
            let record = match document_to_record(doc) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping unparseable stale job during recovery: {}", e);
                    continue;
                }
            };

            if record.attempts < self.max_attempts {
                self.store
                    .update_many(
                        COLLECTION,
                        doc! { "_id": record.id, "state": "in_progress" },
                        doc! {
                            "$set": { "state": "queued" },
                            "$unset": { "worker_id": "", "lock_until": "" },
                        },
                    )
                    .await?;
                reset += 1;
            } else {
                let result = JobResult {
                    lines_processed: record.progress.lines_processed,
                    records_inserted: record.progress.records_inserted,
                    error_count: record.progress.error_count,
                    message: "exceeded maximum attempts and became stale".to_string(),
                };
                self.fail(record.id, result).await.ok();
                failed += 1;
            }
        }

        info!(reset, failed, "stale job recovery complete");
        Ok(RecoveryReport { reset, failed })
    }

    #[instrument(skip(self))]
    pub async fn get(&self, job_id: ObjectId) -> Result<JobRecord, JobError> {
        let doc = self
            .store
            .find_one(COLLECTION, doc! { "_id": job_id })
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        document_to_record(doc)
    }
}

fn document_to_record(doc: bson::Document) -> Result<JobRecord, JobError> {
    bson::from_document(doc).map_err(|e| JobError::Metadata(MetadataError::BsonDe(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMetadataStore;
    use proptest::prelude::*;

    fn queue() -> JobQueue {
        JobQueue::new(
            Arc::new(FakeMetadataStore::new()),
            Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
            Duration::seconds(DEFAULT_STALE_THRESHOLD_SECS),
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    #[tokio::test]
    async fn test_create_then_claim() {
        let q = queue();
        let created = q.create(ObjectId::new()).await.unwrap();
        let claimed = q.claim("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, created.id);
        assert!(matches!(claimed.state, JobState::InProgress { .. }));
        assert_eq!(claimed.attempts, 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let q = queue();
        q.create(ObjectId::new()).await.unwrap();
        let first = q.claim("worker-1").await.unwrap();
        let second = q.claim("worker-2").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_claim_fifo_order() {
        let q = queue();
        let a = q.create(ObjectId::new()).await.unwrap();
        let b = q.create(ObjectId::new()).await.unwrap();
        let first = q.claim("w").await.unwrap().unwrap();
        let second = q.claim("w").await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
    }

    #[tokio::test]
    async fn test_complete_then_get() {
        let q = queue();
        q.create(ObjectId::new()).await.unwrap();
        let claimed = q.claim("w").await.unwrap().unwrap();
        q.complete(
            claimed.id,
            JobResult {
                lines_processed: 10,
                records_inserted: 10,
                error_count: 0,
                message: "ok".to_string(),
            },
        )
        .await
        .unwrap();
        let fetched = q.get(claimed.id).await.unwrap();
        assert!(matches!(fetched.state, JobState::Completed { .. }));
    }

    #[tokio::test]
    async fn test_append_error_caps_tail() {
        let q = queue();
        q.create(ObjectId::new()).await.unwrap();
        let claimed = q.claim("w").await.unwrap().unwrap();
        for i in 0..150 {
            q.append_error(claimed.id, &format!("line {i} bad")).await.unwrap();
        }
        let fetched = q.get(claimed.id).await.unwrap();
        assert_eq!(fetched.errors.len(), 100);
        assert_eq!(fetched.progress.error_count, 150);
    }

    #[tokio::test]
    async fn test_recover_stale_resets_under_max_attempts() {
        let q = queue();
        q.create(ObjectId::new()).await.unwrap();
        let claimed = q.claim("dead-worker").await.unwrap().unwrap();

        // force staleness by expiring the lock directly
        q.store
            .update_many(
                COLLECTION,
                doc! { "_id": claimed.id },
                doc! { "$set": { "lock_until": Bson::DateTime((Utc::now() - Duration::minutes(1)).into()) } },
            )
            .await
            .unwrap();

        let report = q.recover_stale().await.unwrap();
        assert_eq!(report.reset, 1);
        assert_eq!(report.failed, 0);

        let fetched = q.get(claimed.id).await.unwrap();
        assert!(matches!(fetched.state, JobState::Queued));
    }

    #[tokio::test]
    async fn test_recover_stale_fails_after_max_attempts() {
        let q = JobQueue::new(
            Arc::new(FakeMetadataStore::new()),
            Duration::seconds(DEFAULT_LOCK_TIMEOUT_SECS),
            Duration::seconds(DEFAULT_STALE_THRESHOLD_SECS),
            1,
        );
        q.create(ObjectId::new()).await.unwrap();
        let claimed = q.claim("dead-worker").await.unwrap().unwrap();
        q.store
            .update_many(
                COLLECTION,
                doc! { "_id": claimed.id },
                doc! { "$set": { "lock_until": Bson::DateTime((Utc::now() - Duration::minutes(1)).into()) } },
            )
            .await
            .unwrap();

        let report = q.recover_stale().await.unwrap();
        assert_eq!(report.reset, 0);
        assert_eq!(report.failed, 1);

        let fetched = q.get(claimed.id).await.unwrap();
        assert!(matches!(fetched.state, JobState::Failed { .. }));
    }

    proptest! {
        /// Jobs always claim in creation order, for any queue depth.
        #[test]
        fn test_claim_order_matches_creation_order(count in 1usize..30) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let q = queue();
                let mut created = Vec::with_capacity(count);
                for _ in 0..count {
                    created.push(q.create(ObjectId::new()).await.unwrap().id);
                }

                let mut claimed = Vec::with_capacity(count);
                while let Some(job) = q.claim("w").await.unwrap() {
                    claimed.push(job.id);
                }
                prop_assert_eq!(created, claimed);
                Ok(())
            })?;
        }
    }
}
