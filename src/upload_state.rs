//! Lifecycle of uploads and their chunks.
//!
//! Every transition is a sled transaction over the upload and chunk records, so concurrent chunk
//! reports never lose an update and completion is decided from the chunk records themselves.
//! Transitions are safe to repeat: a duplicate delivery of a task observes the state left by the
//! first and becomes a no-op.

use std::time::Duration;

use time::OffsetDateTime;

use crate::chunk_splitter::ChunkPlan;
use crate::error::IngestError;
use crate::metrics::{CHUNK_OUTCOMES, UPLOADS_FINISHED};
use crate::models::{
    Chunk, ChunkStatus, FileRef, Upload, UploadId, UploadStatus, UploadStatusReport,
};
use crate::record_store::{abort, RecordStore, TxResult, UploadTxn};

/// Failure reason recorded for a cancelled upload.
pub const CANCELLED_REASON: &str = "cancelled";

/// Failure reason recorded for an attempt cut short by a restart.
const INTERRUPTED_REASON: &str = "interrupted by restart";

/// What a dispatch task should do with an upload
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkingStart {
    /// Compute and install the chunk plan
    Split(Upload),
    /// The plan is installed; only its chunk tasks need enqueueing
    AlreadyPlanned(Upload),
    /// Nothing to do
    Skip(UploadStatus),
}

/// What a chunk task should do
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkStart {
    /// Process the chunk; its attempt has been recorded
    Run(Upload, Chunk),
    /// The chunk or its upload already reached a terminal state
    Skip,
    /// Another attempt is running and within its deadline; it will report the outcome
    InFlight,
    /// A stale attempt exhausted the chunk's budget and failed the upload
    Exhausted(Upload),
}

/// Counts reported by a successful chunk
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChunkCounts {
    pub valid_lines: u64,
    pub invalid_lines: u64,
}

/// Result of reporting a chunk success
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    /// The chunk was marked succeeded; `completed` is true if this completed the upload
    Recorded { upload: Upload, completed: bool },
    /// The chunk had already reached a terminal state
    Duplicate(Upload),
}

/// Result of reporting a chunk failure
#[derive(Clone, Debug, PartialEq)]
pub enum FailureOutcome {
    /// The chunk was queued again for another attempt
    Retry(Chunk),
    /// The chunk failed permanently; `failed` is true if this failed the upload
    Failed { upload: Upload, failed: bool },
    /// The chunk had already reached a terminal state
    Ignored,
}

/// Transactional state machine over upload and chunk records
#[derive(Clone)]
pub struct UploadStateMachine {
    store: RecordStore,
    chunk_attempts: u32,
    chunk_timeout: Duration,
}

impl UploadStateMachine {
    pub fn new(store: RecordStore, chunk_attempts: u32, chunk_timeout: Duration) -> Self {
        UploadStateMachine {
            store,
            chunk_attempts: chunk_attempts.max(1),
            chunk_timeout,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Create a pending upload for a stored file, or return the existing one.
    pub fn create_upload(
        &self,
        file_ref: &FileRef,
        owner: &str,
        size: u64,
    ) -> Result<(Upload, bool), IngestError> {
        let upload = Upload::new(file_ref, owner, size, OffsetDateTime::now_utc());
        self.store.insert_upload(&upload)
    }

    /// Move an upload into `chunking` at the start of a dispatch task.
    pub fn begin_chunking(&self, upload_id: UploadId) -> Result<ChunkingStart, IngestError> {
        let now = OffsetDateTime::now_utc();
        self.store.transaction(|txn| {
            let mut upload = txn.upload(upload_id)?;
            match upload.status {
                UploadStatus::Pending | UploadStatus::Chunking => {
                    transition(&mut upload, UploadStatus::Chunking, now)?;
                    txn.put_upload(&upload)?;
                    Ok(ChunkingStart::Split(upload))
                }
                UploadStatus::Processing => Ok(ChunkingStart::AlreadyPlanned(upload)),
                status => Ok(ChunkingStart::Skip(status)),
            }
        })
    }

    /// Persist the chunk plan and move the upload to `processing` in one transaction.
    ///
    /// Installing the same plan again returns the upload unchanged, as does installing a plan
    /// for an upload that failed meanwhile.
    pub fn install_plan(&self, upload_id: UploadId, plan: &ChunkPlan) -> Result<Upload, IngestError> {
        let now = OffsetDateTime::now_utc();
        let chunk_count = u32::try_from(plan.ranges.len())?;
        self.store.transaction(|txn| {
            let mut upload = txn.upload(upload_id)?;
            if upload.status.is_terminal() || upload.status == UploadStatus::Processing {
                return Ok(upload);
            }
            transition(&mut upload, UploadStatus::Processing, now)?;
            for range in &plan.ranges {
                if txn.chunk(upload_id, range.index)?.is_none() {
                    txn.put_chunk(&Chunk::queued(upload_id, range, now))?;
                }
            }
            upload.chunk_count = Some(chunk_count);
            upload.header_len = plan.header_len;
            txn.put_upload(&upload)?;
            Ok(upload)
        })
    }

    /// Fail an upload for a reason outside any chunk, such as a malformed file.
    ///
    /// Returns the upload and whether this call failed it.
    pub fn fail_upload(
        &self,
        upload_id: UploadId,
        reason: &str,
    ) -> Result<(Upload, bool), IngestError> {
        let now = OffsetDateTime::now_utc();
        let (upload, failed) = self.store.transaction(|txn| {
            let mut upload = txn.upload(upload_id)?;
            if upload.status.is_terminal() {
                return Ok((upload, false));
            }
            transition(&mut upload, UploadStatus::Failed, now)?;
            upload.failure_reasons.insert(reason.to_string());
            txn.put_upload(&upload)?;
            Ok((upload, true))
        })?;
        if failed {
            tracing::warn!("Upload {} failed: {}", upload_id, reason);
            UPLOADS_FINISHED.with_label_values(&["failed"]).inc();
        }
        Ok((upload, failed))
    }

    /// Cancel an upload that has not finished.
    ///
    /// Queued chunk tasks observe the failed upload and do nothing.
    pub fn cancel(&self, upload_id: UploadId) -> Result<Upload, IngestError> {
        let now = OffsetDateTime::now_utc();
        let upload = self.store.transaction(|txn| {
            let mut upload = txn.upload(upload_id)?;
            transition(&mut upload, UploadStatus::Failed, now)?;
            upload.cancelled = true;
            upload.failure_reasons.insert(CANCELLED_REASON.to_string());
            txn.put_upload(&upload)?;
            Ok(upload)
        })?;
        tracing::info!("Upload {} cancelled", upload_id);
        UPLOADS_FINISHED.with_label_values(&["failed"]).inc();
        Ok(upload)
    }

    /// Record the start of an attempt at a chunk.
    ///
    /// Returns [ChunkStart::InFlight] if another attempt is in progress and has not exceeded the
    /// chunk timeout. An attempt older than the timeout counts as a failed attempt.
    pub fn start_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        now: OffsetDateTime,
    ) -> Result<ChunkStart, IngestError> {
        let deadline = time::Duration::try_from(self.chunk_timeout)
            .map_err(|err| IngestError::InvalidSettings(format!("chunk timeout: {err}")))?;
        let timeout_reason = IngestError::ChunkTimeout {
            upload_id,
            index,
            seconds: self.chunk_timeout.as_secs(),
        }
        .to_string();
        let start = self.store.transaction(|txn| {
            let upload = txn.upload(upload_id)?;
            if upload.status != UploadStatus::Processing {
                return Ok(ChunkStart::Skip);
            }
            let mut chunk = existing_chunk(txn, upload_id, index)?;
            match chunk.status {
                ChunkStatus::Succeeded | ChunkStatus::Failed => return Ok(ChunkStart::Skip),
                ChunkStatus::Processing => {
                    let started_at = chunk.started_at.unwrap_or(chunk.updated_at);
                    if now < started_at + deadline {
                        return Ok(ChunkStart::InFlight);
                    }
                    tracing::warn!("Reclaiming chunk {} of upload {} after timeout", index, upload_id);
                    chunk.last_error = Some(timeout_reason.clone());
                }
                ChunkStatus::Queued => {}
            }
            if chunk.attempts >= self.chunk_attempts {
                let reason = chunk
                    .last_error
                    .clone()
                    .unwrap_or_else(|| timeout_reason.clone());
                let (upload, _) = fail_chunk(txn, upload, chunk, &reason, now)?;
                return Ok(ChunkStart::Exhausted(upload));
            }
            chunk.status = ChunkStatus::Processing;
            chunk.attempts += 1;
            chunk.started_at = Some(now);
            chunk.updated_at = now;
            txn.put_chunk(&chunk)?;
            Ok(ChunkStart::Run(upload, chunk))
        })?;
        if let ChunkStart::Exhausted(_) = start {
            CHUNK_OUTCOMES.with_label_values(&["failed"]).inc();
            UPLOADS_FINISHED.with_label_values(&["failed"]).inc();
        }
        Ok(start)
    }

    /// Mark a chunk succeeded and complete the upload if every chunk has succeeded.
    ///
    /// Must only be called after every partial aggregate of the chunk has been merged.
    pub fn complete_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        counts: ChunkCounts,
    ) -> Result<Completion, IngestError> {
        let now = OffsetDateTime::now_utc();
        let completion = self.store.transaction(|txn| {
            let mut upload = txn.upload(upload_id)?;
            let mut chunk = existing_chunk(txn, upload_id, index)?;
            if chunk.status.is_terminal() {
                return Ok(Completion::Duplicate(upload));
            }
            chunk.status = ChunkStatus::Succeeded;
            chunk.valid_lines = counts.valid_lines;
            chunk.invalid_lines = counts.invalid_lines;
            chunk.last_error = None;
            chunk.updated_at = now;
            txn.put_chunk(&chunk)?;

            if upload.status != UploadStatus::Processing {
                return Ok(Completion::Recorded {
                    upload,
                    completed: false,
                });
            }
            let (succeeded, failed) = tally(txn, &upload)?;
            let total = upload.chunk_count.unwrap_or(0);
            let completed = succeeded == total && failed == 0;
            if completed {
                transition(&mut upload, UploadStatus::Completed, now)?;
                txn.put_upload(&upload)?;
            }
            Ok(Completion::Recorded { upload, completed })
        })?;
        match &completion {
            Completion::Recorded { completed, .. } => {
                CHUNK_OUTCOMES.with_label_values(&["succeeded"]).inc();
                if *completed {
                    tracing::info!("Upload {} completed", upload_id);
                    UPLOADS_FINISHED.with_label_values(&["completed"]).inc();
                }
            }
            Completion::Duplicate(_) => {
                tracing::debug!("Duplicate completion of chunk {} of upload {}", index, upload_id)
            }
        }
        Ok(completion)
    }

    /// Record a failed attempt at a chunk.
    ///
    /// A retryable error with attempts left queues the chunk again. Otherwise the chunk fails
    /// permanently and the upload fails with it; aggregates already merged are kept.
    pub fn record_chunk_failure(
        &self,
        upload_id: UploadId,
        index: u32,
        error: &IngestError,
    ) -> Result<FailureOutcome, IngestError> {
        let now = OffsetDateTime::now_utc();
        let message = error.to_string();
        let retryable = error.is_retryable();
        let outcome = self.store.transaction(|txn| {
            let upload = txn.upload(upload_id)?;
            let mut chunk = existing_chunk(txn, upload_id, index)?;
            if chunk.status.is_terminal() {
                return Ok(FailureOutcome::Ignored);
            }
            if retryable
                && chunk.attempts < self.chunk_attempts
                && upload.status == UploadStatus::Processing
            {
                chunk.status = ChunkStatus::Queued;
                chunk.last_error = Some(message.clone());
                chunk.started_at = None;
                chunk.updated_at = now;
                txn.put_chunk(&chunk)?;
                return Ok(FailureOutcome::Retry(chunk));
            }
            let (upload, failed) = fail_chunk(txn, upload, chunk, &message, now)?;
            Ok(FailureOutcome::Failed { upload, failed })
        })?;
        match &outcome {
            FailureOutcome::Retry(chunk) => {
                tracing::info!(
                    "Chunk {} of upload {} failed attempt {}: {}",
                    index,
                    upload_id,
                    chunk.attempts,
                    message
                );
                CHUNK_OUTCOMES.with_label_values(&["retried"]).inc();
            }
            FailureOutcome::Failed { failed, .. } => {
                tracing::warn!("Chunk {} of upload {} failed: {}", index, upload_id, message);
                CHUNK_OUTCOMES.with_label_values(&["failed"]).inc();
                if *failed {
                    UPLOADS_FINISHED.with_label_values(&["failed"]).inc();
                }
            }
            FailureOutcome::Ignored => {}
        }
        Ok(outcome)
    }

    /// Queue again the chunks of an upload left `processing` by a previous process.
    ///
    /// Only valid at startup, before any worker runs. The interrupted attempts stay counted.
    /// Returns the number of chunks reclaimed.
    pub fn reclaim_chunks(&self, upload_id: UploadId) -> Result<u32, IngestError> {
        let now = OffsetDateTime::now_utc();
        self.store.transaction(|txn| {
            let upload = txn.upload(upload_id)?;
            let mut reclaimed = 0;
            for index in 0..upload.chunk_count.unwrap_or(0) {
                let mut chunk = existing_chunk(txn, upload_id, index)?;
                if chunk.status == ChunkStatus::Processing {
                    chunk.status = ChunkStatus::Queued;
                    chunk.started_at = None;
                    chunk.last_error = Some(INTERRUPTED_REASON.to_string());
                    chunk.updated_at = now;
                    txn.put_chunk(&chunk)?;
                    reclaimed += 1;
                }
            }
            Ok(reclaimed)
        })
    }

    /// Report the processing status of an upload from its durable records.
    pub fn status_report(&self, upload_id: UploadId) -> Result<UploadStatusReport, IngestError> {
        let upload = self.store.upload(upload_id)?;
        let chunks = self.store.list_chunks(upload_id)?;
        let count = |status| chunks.iter().filter(|c| c.status == status).count() as u32;
        let chunks_succeeded = count(ChunkStatus::Succeeded);
        let chunks_failed = count(ChunkStatus::Failed);
        let chunks_total = upload.chunk_count.unwrap_or(0);
        let progress = if upload.status == UploadStatus::Completed {
            100.0
        } else if chunks_total == 0 {
            0.0
        } else {
            let terminal = f64::from(chunks_succeeded + chunks_failed);
            (terminal / f64::from(chunks_total) * 10000.0).round() / 100.0
        };
        Ok(UploadStatusReport {
            upload_id,
            filename: upload.filename.clone(),
            owner: upload.owner.clone(),
            status: upload.status,
            chunks_total,
            chunks_succeeded,
            chunks_failed,
            error_summary: upload.error_summary(),
            valid_rows: chunks.iter().map(|c| c.valid_lines).sum(),
            invalid_rows: chunks.iter().map(|c| c.invalid_lines).sum(),
            progress,
            partial: upload.status == UploadStatus::Failed && chunks_succeeded > 0,
            created_at: upload.created_at,
            completed_at: upload.completed_at,
        })
    }
}

/// Apply a status transition allowed by [UploadStatus::can_transition_to].
fn transition(upload: &mut Upload, next: UploadStatus, now: OffsetDateTime) -> TxResult<()> {
    if !upload.status.can_transition_to(next) {
        return Err(abort(IngestError::InvalidTransition {
            from: upload.status,
            to: next,
        }));
    }
    upload.status = next;
    upload.updated_at = now;
    if next.is_terminal() {
        upload.completed_at = Some(now);
    }
    Ok(())
}

fn existing_chunk(txn: &UploadTxn, upload_id: UploadId, index: u32) -> TxResult<Chunk> {
    txn.chunk(upload_id, index)?.ok_or_else(|| {
        abort(IngestError::CorruptRecord {
            key: format!("chunks/{upload_id}/{index}"),
        })
    })
}

/// Count the succeeded and failed chunks of an upload within a transaction.
fn tally(txn: &UploadTxn, upload: &Upload) -> TxResult<(u32, u32)> {
    let mut succeeded = 0;
    let mut failed = 0;
    for index in 0..upload.chunk_count.unwrap_or(0) {
        match existing_chunk(txn, upload.id, index)?.status {
            ChunkStatus::Succeeded => succeeded += 1,
            ChunkStatus::Failed => failed += 1,
            ChunkStatus::Queued | ChunkStatus::Processing => {}
        }
    }
    Ok((succeeded, failed))
}

/// Fail a chunk permanently and cascade the failure to its upload.
///
/// Returns the upload and whether it moved to `failed` now.
fn fail_chunk(
    txn: &UploadTxn,
    mut upload: Upload,
    mut chunk: Chunk,
    reason: &str,
    now: OffsetDateTime,
) -> TxResult<(Upload, bool)> {
    chunk.status = ChunkStatus::Failed;
    chunk.last_error = Some(reason.to_string());
    chunk.updated_at = now;
    txn.put_chunk(&chunk)?;
    let failed = !upload.status.is_terminal();
    if failed {
        transition(&mut upload, UploadStatus::Failed, now)?;
    }
    upload
        .failure_reasons
        .insert(format!("chunk {}: {}", chunk.index, reason));
    upload.updated_at = now;
    txn.put_upload(&upload)?;
    Ok((upload, failed))
}
