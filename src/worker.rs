//! Processing worker: claim loop, then stream -> line-split -> parse ->
//! batch -> bulk-insert for one job at a time.
//!
//! The line-splitter/parser stage and the batching/flush stage run as two
//! concurrently-scheduled halves joined by a bounded `tokio::sync::mpsc`
//! channel — the channel fills up and the reader stops pulling from the
//! object-store stream whenever the inserter falls behind, which is the
//! back-pressure the pipeline depends on to keep steady-state memory
//! bounded.

use crate::catalog::{Catalog, CatalogError, FileStatus};
use crate::jobs::{JobError, JobQueue, JobResult, Progress};
use crate::metadata::{MetadataError, MetadataStore};
use crate::parser::{self, LineParse, ParserKind};
use crate::storage::{ObjectStore, StorageError};
use bson::oid::ObjectId;
use chrono::Utc;
use futures::stream::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, instrument, warn};

const CHANNEL_CAPACITY: usize = 256;
const PARSED_RECORDS_COLLECTION: &str = "parsed_records";

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("file record {0} referenced by job not found")]
    FileMissing(ObjectId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub file_id: ObjectId,
    pub job_id: ObjectId,
    pub line_number: u64,
    pub data: serde_json::Value,
    pub processed_at: chrono::DateTime<Utc>,
}

enum LineOutcome {
    Record(ParsedRecord),
    Error { line_number: u64, message: String },
}

pub struct WorkerConfig {
    pub batch_size: usize,
    pub write_pause: Duration,
    pub poll_interval: Duration,
    pub worker_id: String,
}

pub struct Worker {
    jobs: Arc<JobQueue>,
    catalog: Arc<Catalog>,
    store: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        jobs: Arc<JobQueue>,
        catalog: Arc<Catalog>,
        store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            jobs,
            catalog,
            store,
            metadata,
            config,
        }
    }

    /// Claim loop: runs until the process is torn down. Each claimed job is
    /// processed to completion before the next claim attempt.
    pub async fn run(&self) {
        loop {
            match self.jobs.claim(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job.id, job.file_id).await {
                        warn!(job_id = %job.id, error = %e, "job processing failed");
                        tokio::time::sleep(self.config.poll_interval * 2).await;
                    }
                }
                Ok(None) => tokio::time::sleep(self.config.poll_interval).await,
                Err(e) => {
                    error!("claim failed: {}", e);
                    tokio::time::sleep(self.config.poll_interval * 2).await;
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn process(&self, job_id: ObjectId, file_id: ObjectId) -> Result<(), WorkerError> {
        let outcome = self.run_pipeline(job_id, file_id).await;
        match outcome {
            Ok(progress) => {
                self.catalog.set_status(file_id, FileStatus::Processed).await?;
                self.jobs
                    .complete(
                        job_id,
                        JobResult {
                            lines_processed: progress.lines_processed,
                            records_inserted: progress.records_inserted,
                            error_count: progress.error_count,
                            message: "processing complete".to_string(),
                        },
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.jobs
                    .fail(
                        job_id,
                        JobResult {
                            lines_processed: 0,
                            records_inserted: 0,
                            error_count: 0,
                            message: e.to_string(),
                        },
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, job_id: ObjectId, file_id: ObjectId) -> Result<Progress, WorkerError> {
        let file = self
            .catalog
            .get(file_id)
            .await
            .map_err(|_| WorkerError::FileMissing(file_id))?;

        let byte_stream = self.store.get_stream(&file.key).await?;
        let kind = parser::select_parser(&file.content_type);

        let reader = StreamReader::new(byte_stream.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        }));
        let mut lines = tokio::io::BufReader::new(reader).lines();

        let (tx, mut rx) = mpsc::channel::<LineOutcome>(CHANNEL_CAPACITY);

        let producer = tokio::spawn(async move {
            let mut line_number: u64 = 0;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        line_number += 1;
                        let outcome = match parser::parse_line(kind, &line, line_number) {
                            LineParse::Empty => None,
                            LineParse::Ok { line_number, data } => {
                                if parser::validate(&data) {
                                    Some(LineOutcome::Record(ParsedRecord {
                                        file_id,
                                        job_id,
                                        line_number,
                                        data,
                                        processed_at: Utc::now(),
                                    }))
                                } else {
                                    Some(LineOutcome::Error {
                                        line_number,
                                        message: format!("Line {line_number}: Invalid data format"),
                                    })
                                }
                            }
                            LineParse::Err {
                                line_number,
                                message,
                                ..
                            } => Some(LineOutcome::Error {
                                line_number,
                                message: format!("Line {line_number}: {message}"),
                            }),
                        };
                        if let Some(outcome) = outcome {
                            if tx.send(outcome).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(LineOutcome::Error {
                                line_number,
                                message: format!("stream read error: {e}"),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        let mut progress = Progress::default();
        let mut batch: Vec<ParsedRecord> = Vec::with_capacity(self.config.batch_size);

        while let Some(outcome) = rx.recv().await {
            match outcome {
                LineOutcome::Record(record) => {
                    progress.lines_processed += 1;
                    batch.push(record);
                    if batch.len() >= self.config.batch_size {
                        self.flush_batch(job_id, &mut batch, &mut progress).await?;
                    }
                }
                LineOutcome::Error { message, .. } => {
                    progress.lines_processed += 1;
                    progress.error_count += 1;
                    if let Err(e) = self.jobs.append_error(job_id, &message).await {
                        warn!(job_id = %job_id, "failed to append error entry: {}", e);
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush_batch(job_id, &mut batch, &mut progress).await?;
        }

        producer.await.map_err(|e| {
            WorkerError::Metadata(MetadataError::Other(format!("producer task panicked: {e}")))
        })?;

        Ok(progress)
    }

    async fn flush_batch(
        &self,
        job_id: ObjectId,
        batch: &mut Vec<ParsedRecord>,
        progress: &mut Progress,
    ) -> Result<(), WorkerError> {
        let docs: Vec<bson::Document> = batch
            .iter()
            .filter_map(|r| bson::to_document(r).ok())
            .collect();

        match self.metadata.insert_many(PARSED_RECORDS_COLLECTION, docs).await {
            Ok(()) => progress.records_inserted += batch.len() as u64,
            Err(e) => {
                warn!(job_id = %job_id, "batch flush failed, continuing: {}", e);
                progress.error_count += batch.len() as u64;
            }
        }
        batch.clear();

        self.jobs.update_progress(job_id, progress).await?;
        tokio::time::sleep(self.write_pause()).await;
        debug!(job_id = %job_id, lines = progress.lines_processed, "flushed batch");
        Ok(())
    }

    fn write_pause(&self) -> Duration {
        self.config.write_pause
    }
}
