//! Task handlers driving an upload through the pipeline.
//!
//! A `process_upload` task splits the file and installs the chunk plan, then enqueues one
//! `process_chunk` task per chunk. Each chunk task processes its byte range, stores and merges the
//! partial aggregates, and reports the outcome to the state machine. The chunk report that
//! completes or fails the upload enqueues the `update_cache` task for the upload's cities.
//!
//! Handlers hold no state between deliveries; everything they need is read from the records, so
//! any delivery may be repeated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::aggregate_merger::AggregateMerger;
use crate::blob_store::BlobStore;
use crate::cache_sync::CacheSynchronizer;
use crate::chunk_processor::{ChunkProcessor, ParseRules};
use crate::chunk_splitter::ChunkSplitter;
use crate::error::IngestError;
use crate::metrics::ROWS;
use crate::models::{Chunk, ChunkStatus, Upload, UploadId};
use crate::record_store::RecordStore;
use crate::task_queue::{Task, TaskHandler, TaskQueue};
use crate::upload_state::{
    ChunkCounts, ChunkStart, ChunkingStart, Completion, FailureOutcome, UploadStateMachine,
};

/// Handles the tasks of all three queues
pub struct Dispatcher {
    state: UploadStateMachine,
    merger: AggregateMerger,
    processor: ChunkProcessor,
    blob_store: Arc<dyn BlobStore>,
    cache: CacheSynchronizer,
    queue: TaskQueue,
    rules: ParseRules,
    chunk_size: u64,
    chunk_timeout: Duration,
    /// Publish statistics after every N chunk completions, 0 to disable
    publish_every: u32,
}

/// Collaborators and tunables of a [Dispatcher]
pub struct DispatcherParts {
    pub state: UploadStateMachine,
    pub merger: AggregateMerger,
    pub processor: ChunkProcessor,
    pub blob_store: Arc<dyn BlobStore>,
    pub cache: CacheSynchronizer,
    pub queue: TaskQueue,
    pub rules: ParseRules,
    pub chunk_size: u64,
    pub chunk_timeout: Duration,
    pub publish_every: u32,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        Dispatcher {
            state: parts.state,
            merger: parts.merger,
            processor: parts.processor,
            blob_store: parts.blob_store,
            cache: parts.cache,
            queue: parts.queue,
            rules: parts.rules,
            chunk_size: parts.chunk_size,
            chunk_timeout: parts.chunk_timeout,
            publish_every: parts.publish_every,
        }
    }

    fn store(&self) -> &RecordStore {
        self.state.store()
    }

    /// Split an upload and enqueue its chunk tasks.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn dispatch_upload(&self, upload_id: UploadId) -> Result<(), IngestError> {
        let upload = match self.state.begin_chunking(upload_id)? {
            ChunkingStart::Skip(status) => {
                tracing::debug!("Upload {} is {}, nothing to dispatch", upload_id, status);
                return Ok(());
            }
            ChunkingStart::AlreadyPlanned(upload) => upload,
            ChunkingStart::Split(upload) => {
                let splitter =
                    ChunkSplitter::new(self.blob_store.as_ref(), &self.rules, self.chunk_size);
                let plan = match splitter.split(upload_id, upload.size).await {
                    Ok(plan) => plan,
                    Err(err) if err.is_retryable() => return Err(err),
                    Err(err) => {
                        self.state.fail_upload(upload_id, &err.to_string())?;
                        return Ok(());
                    }
                };
                tracing::info!(
                    "Upload {} split into {} chunks",
                    upload_id,
                    plan.ranges.len()
                );
                self.state.install_plan(upload_id, &plan)?
            }
        };
        self.enqueue_chunks(&upload)
    }

    /// Enqueue a task for every queued chunk of an upload.
    ///
    /// Chunks being processed are left to the attempt that holds them.
    fn enqueue_chunks(&self, upload: &Upload) -> Result<(), IngestError> {
        if upload.status.is_terminal() {
            return Ok(());
        }
        for chunk in self.store().list_chunks(upload.id)? {
            if chunk.status == ChunkStatus::Queued {
                self.queue.enqueue(&Task::ProcessChunk {
                    upload_id: upload.id,
                    chunk_index: chunk.index,
                })?;
            }
        }
        Ok(())
    }

    /// Process one chunk and report its outcome.
    ///
    /// A retryable failure with attempts left is returned so the queue redelivers the task after
    /// its backoff. Permanent failures are recorded and the task succeeds.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn process_chunk(&self, upload_id: UploadId, index: u32) -> Result<(), IngestError> {
        let (upload, chunk) = match self
            .state
            .start_chunk(upload_id, index, OffsetDateTime::now_utc())?
        {
            ChunkStart::Run(upload, chunk) => (upload, chunk),
            ChunkStart::Skip => {
                tracing::debug!("Chunk {} of upload {} needs no work", index, upload_id);
                return Ok(());
            }
            ChunkStart::InFlight => {
                tracing::debug!(
                    "Chunk {} of upload {} is held by another attempt",
                    index,
                    upload_id
                );
                return Ok(());
            }
            ChunkStart::Exhausted(_) => return self.publish_upload(upload_id),
        };

        let result = match tokio::time::timeout(self.chunk_timeout, self.run_chunk(&upload, &chunk))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(IngestError::ChunkTimeout {
                upload_id,
                index,
                seconds: self.chunk_timeout.as_secs(),
            }),
        };

        match result {
            Ok(counts) => match self.state.complete_chunk(upload_id, index, counts)? {
                Completion::Recorded {
                    completed: true, ..
                } => self.publish_upload(upload_id),
                // A chunk finishing after its upload failed still changed the aggregates.
                Completion::Recorded { upload, .. } if upload.status.is_terminal() => {
                    self.publish_upload(upload_id)
                }
                Completion::Recorded { .. } => self.publish_progress(upload_id),
                Completion::Duplicate(_) => Ok(()),
            },
            Err(err) => match self.state.record_chunk_failure(upload_id, index, &err)? {
                FailureOutcome::Retry(_) => Err(err),
                FailureOutcome::Failed { failed: true, .. } => self.publish_upload(upload_id),
                FailureOutcome::Failed { .. } | FailureOutcome::Ignored => Ok(()),
            },
        }
    }

    /// Read, reduce and merge a chunk.
    ///
    /// Partial aggregates are stored before merging, so every merged aggregate is also on record.
    async fn run_chunk(&self, upload: &Upload, chunk: &Chunk) -> Result<ChunkCounts, IngestError> {
        let outcome = self.processor.process(upload, chunk).await?;
        for partial in &outcome.partials {
            self.store().put_partial(partial)?;
        }
        let applied = self.merger.merge_all(&outcome.partials)?;
        tracing::debug!(
            "Chunk {} merged {} of {} cities",
            chunk.index,
            applied,
            outcome.partials.len()
        );
        ROWS.with_label_values(&["valid"])
            .inc_by(outcome.valid_lines);
        ROWS.with_label_values(&["invalid"])
            .inc_by(outcome.invalid_lines);
        Ok(ChunkCounts {
            valid_lines: outcome.valid_lines,
            invalid_lines: outcome.invalid_lines,
        })
    }

    /// Enqueue a cache update for every city an upload touched.
    fn publish_upload(&self, upload_id: UploadId) -> Result<(), IngestError> {
        let cities = self.store().upload_cities(upload_id)?;
        if cities.is_empty() {
            return Ok(());
        }
        self.queue.enqueue(&Task::UpdateCache {
            upload_id: Some(upload_id),
            cities,
        })
    }

    /// Enqueue an intermediate cache update after every N chunk completions.
    fn publish_progress(&self, upload_id: UploadId) -> Result<(), IngestError> {
        if self.publish_every == 0 {
            return Ok(());
        }
        let succeeded = self
            .store()
            .list_chunks(upload_id)?
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Succeeded)
            .count();
        if succeeded % self.publish_every as usize == 0 {
            self.publish_upload(upload_id)?;
        }
        Ok(())
    }

    /// Fail the upload of a chunk whose task was dead-lettered, unless the chunk is still owned.
    ///
    /// A chunk that succeeded, or that another attempt is processing, still reports its own
    /// outcome.
    fn abandon_chunk(
        &self,
        upload_id: UploadId,
        index: u32,
        error: &IngestError,
    ) -> Result<(), IngestError> {
        match self.store().get_chunk(upload_id, index)? {
            Some(chunk)
                if matches!(chunk.status, ChunkStatus::Succeeded | ChunkStatus::Processing) =>
            {
                tracing::info!(
                    "Chunk {} of upload {} is {}, keeping the upload",
                    index,
                    upload_id,
                    chunk.status
                );
                Ok(())
            }
            _ => {
                self.state
                    .fail_upload(upload_id, &format!("chunk {index}: {error}"))?;
                self.publish_upload(upload_id)
            }
        }
    }

    /// Publish the statistics of some cities.
    ///
    /// Every city is attempted; a cache write failure is returned afterwards so the whole task is
    /// redelivered. Publishing is idempotent.
    async fn update_cache(
        &self,
        cities: &std::collections::BTreeSet<String>,
    ) -> Result<(), IngestError> {
        let mut failure = None;
        for city_id in cities {
            match self.cache.publish(city_id).await {
                Ok(_) => {}
                Err(err @ IngestError::CacheWrite { .. }) => failure = Some(err),
                Err(err) => return Err(err),
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl TaskHandler for Dispatcher {
    async fn handle(&self, task: &Task, attempt: u32) -> Result<(), IngestError> {
        tracing::debug!("Handling {} attempt {}", task.idempotency_key(), attempt);
        match task {
            Task::ProcessUpload { upload_id } => self.dispatch_upload(*upload_id).await,
            Task::ProcessChunk {
                upload_id,
                chunk_index,
            } => self.process_chunk(*upload_id, *chunk_index).await,
            Task::UpdateCache { cities, .. } => self.update_cache(cities).await,
            Task::RefreshAllCaches => self.cache.refresh_all().await.map(|_| ()),
        }
    }

    /// Make sure an abandoned task leaves no upload unfinished and no cache entry trusted.
    async fn dead_letter(&self, task: &Task, error: &IngestError) {
        let result = match task {
            Task::ProcessUpload { upload_id } => self
                .state
                .fail_upload(*upload_id, &error.to_string())
                .map(|_| ()),
            Task::ProcessChunk {
                upload_id,
                chunk_index,
            } => self.abandon_chunk(*upload_id, *chunk_index, error),
            Task::UpdateCache { cities, .. } => self.cache.mark_stale(cities).await,
            Task::RefreshAllCaches => Ok(()),
        };
        if let Err(err) = result {
            tracing::error!(
                "Failed to clean up after dead-lettered task {}: {}",
                task.idempotency_key(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::cache_store::{CacheStore, MemoryCacheStore};
    use crate::cache_sync::cache_key;
    use crate::models::{FileRef, UploadStatus};
    use crate::resource_manager::ResourceManager;
    use crate::task_queue::{QueueName, RetryPolicy};
    use bytes::Bytes;
    use hashbrown::HashMap;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use tokio::sync::Semaphore;

    /// Four 18-byte lines of NYC, split into two chunks of two lines.
    const DATA: &str = concat!(
        "NYC,10,1704067200\n",
        "NYC,20,1704067200\n",
        "NYC,30,1704067200\n",
        "NYC,40,1704067200\n",
    );
    const CHUNK_SIZE: u64 = 36;

    /// Blob store that can slow down or fail every read, and hold back reads at one offset.
    struct TestBlobStore {
        inner: MemoryBlobStore,
        delay_ms: AtomicU64,
        failing: AtomicBool,
        held_offset: Option<u64>,
        gate: Semaphore,
    }

    impl TestBlobStore {
        fn new(held_offset: Option<u64>) -> Arc<Self> {
            Arc::new(TestBlobStore {
                inner: MemoryBlobStore::new(),
                delay_ms: AtomicU64::new(0),
                failing: AtomicBool::new(false),
                held_offset,
                gate: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl BlobStore for TestBlobStore {
        async fn read(
            &self,
            upload_id: UploadId,
            offset: u64,
            length: u64,
        ) -> Result<Bytes, IngestError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(IngestError::ShortRead {
                    expected: length,
                    received: 0,
                });
            }
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.held_offset == Some(offset) {
                let _permit = self.gate.acquire().await?;
            }
            self.inner.read(upload_id, offset, length).await
        }

        async fn size(&self, upload_id: UploadId) -> Result<u64, IngestError> {
            self.inner.size(upload_id).await
        }

        async fn put(&self, upload_id: UploadId, data: Bytes) -> Result<(), IngestError> {
            self.inner.put(upload_id, data).await
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        state: UploadStateMachine,
        cache: Arc<MemoryCacheStore>,
        queue: TaskQueue,
        blob_store: Arc<TestBlobStore>,
    }

    impl Fixture {
        fn new(blob_store: Arc<TestBlobStore>, chunk_attempts: u32, publish_every: u32) -> Self {
            Self::with_timeout(blob_store, chunk_attempts, publish_every, Duration::from_secs(10))
        }

        fn with_timeout(
            blob_store: Arc<TestBlobStore>,
            chunk_attempts: u32,
            publish_every: u32,
            chunk_timeout: Duration,
        ) -> Self {
            let store = RecordStore::temporary().unwrap();
            let state = UploadStateMachine::new(store.clone(), chunk_attempts, chunk_timeout);
            let cache = Arc::new(MemoryCacheStore::new());
            let queue = TaskQueue::new(
                RetryPolicy {
                    max_attempts: chunk_attempts,
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(5),
                },
                HashMap::from([(QueueName::ChunkProcessing, 2)]),
            );
            let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
                state: state.clone(),
                merger: AggregateMerger::new(store.clone(), 8),
                processor: ChunkProcessor::new(
                    blob_store.clone(),
                    Arc::new(ResourceManager::new(None, None, None)),
                    ParseRules::default(),
                    false,
                ),
                blob_store: blob_store.clone(),
                cache: CacheSynchronizer::new(store, cache.clone(), 1),
                queue: queue.clone(),
                rules: ParseRules::default(),
                chunk_size: CHUNK_SIZE,
                chunk_timeout,
                publish_every,
            }));
            Fixture {
                dispatcher,
                state,
                cache,
                queue,
                blob_store,
            }
        }

        /// Store the readings and record a pending upload for them.
        async fn upload(&self) -> UploadId {
            let file_ref = FileRef::reserve("data.csv");
            self.blob_store
                .put(file_ref.upload_id, Bytes::from_static(DATA.as_bytes()))
                .await
                .unwrap();
            let (upload, _) = self
                .state
                .create_upload(&file_ref, "alice", DATA.len() as u64)
                .unwrap();
            upload.id
        }

        async fn cached_count(&self) -> Option<(u64, bool)> {
            self.cache
                .get(&cache_key("NYC"))
                .await
                .unwrap()
                .map(|(entry, _)| (entry.stats.count, entry.partial))
        }
    }

    fn chunk_task(upload_id: UploadId, chunk_index: u32) -> Task {
        Task::ProcessChunk {
            upload_id,
            chunk_index,
        }
    }

    #[tokio::test]
    async fn timed_out_chunk_is_retried_then_fails() {
        let fixture =
            Fixture::with_timeout(TestBlobStore::new(None), 2, 0, Duration::from_millis(50));
        let upload_id = fixture.upload().await;
        let dispatcher = &fixture.dispatcher;
        dispatcher
            .handle(&Task::ProcessUpload { upload_id }, 1)
            .await
            .unwrap();
        fixture.blob_store.delay_ms.store(500, Ordering::SeqCst);

        let err = dispatcher
            .handle(&chunk_task(upload_id, 0), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ChunkTimeout { index: 0, .. }));
        let chunk = fixture.state.store().get_chunk(upload_id, 0).unwrap().unwrap();
        assert_eq!(ChunkStatus::Queued, chunk.status);
        assert_eq!(1, chunk.attempts);

        // The last attempt also times out and fails the upload.
        dispatcher.handle(&chunk_task(upload_id, 0), 2).await.unwrap();
        let report = fixture.state.status_report(upload_id).unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
        assert_eq!(1, report.chunks_failed);
        assert!(report.error_summary.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn duplicate_delivery_of_running_chunk_is_a_no_op() {
        let fixture = Fixture::new(TestBlobStore::new(Some(CHUNK_SIZE)), 3, 0);
        let upload_id = fixture.upload().await;
        let dispatcher = fixture.dispatcher.clone();
        dispatcher
            .handle(&Task::ProcessUpload { upload_id }, 1)
            .await
            .unwrap();
        let running = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.handle(&chunk_task(upload_id, 1), 1).await }
        });
        while fixture.state.store().get_chunk(upload_id, 1).unwrap().unwrap().status
            != ChunkStatus::Processing
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher.handle(&chunk_task(upload_id, 1), 1).await.unwrap();
        // Dispatching again does not enqueue the running chunk either.
        dispatcher
            .handle(&Task::ProcessUpload { upload_id }, 1)
            .await
            .unwrap();
        fixture.blob_store.gate.add_permits(1);
        running.await.unwrap().unwrap();
        let chunk = fixture.state.store().get_chunk(upload_id, 1).unwrap().unwrap();
        assert_eq!((ChunkStatus::Succeeded, 1), (chunk.status, chunk.attempts));
        assert_eq!(
            UploadStatus::Processing,
            fixture.state.status_report(upload_id).unwrap().status
        );
    }

    #[tokio::test]
    async fn progress_is_published_every_chunk() {
        let fixture = Fixture::new(TestBlobStore::new(Some(CHUNK_SIZE)), 3, 1);
        let upload_id = fixture.upload().await;
        fixture.queue.start(fixture.dispatcher.clone());
        fixture
            .queue
            .enqueue(&Task::ProcessUpload { upload_id })
            .unwrap();

        // Chunk 1 is held back, so the first entry covers chunk 0 alone.
        tokio::time::timeout(Duration::from_secs(10), async {
            while fixture.cached_count().await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(Some((2, true)), fixture.cached_count().await);

        fixture.blob_store.gate.add_permits(1);
        fixture.queue.wait_idle().await;
        assert_eq!(Some((4, false)), fixture.cached_count().await);
        fixture.queue.shutdown().await;
    }

    #[tokio::test]
    async fn dead_lettered_chunk_fails_only_unowned_chunks() {
        let fixture = Fixture::new(TestBlobStore::new(None), 3, 0);
        let upload_id = fixture.upload().await;
        let dispatcher = &fixture.dispatcher;
        dispatcher
            .handle(&Task::ProcessUpload { upload_id }, 1)
            .await
            .unwrap();
        let error = IngestError::ShortRead {
            expected: 36,
            received: 0,
        };

        // A chunk held by a running attempt keeps its upload alive.
        fixture
            .state
            .start_chunk(upload_id, 0, OffsetDateTime::now_utc())
            .unwrap();
        dispatcher.dead_letter(&chunk_task(upload_id, 0), &error).await;
        assert_eq!(
            UploadStatus::Processing,
            fixture.state.status_report(upload_id).unwrap().status
        );

        // A queued chunk nobody will process fails it.
        dispatcher.dead_letter(&chunk_task(upload_id, 1), &error).await;
        let report = fixture.state.status_report(upload_id).unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
        assert!(report.error_summary.unwrap().starts_with("chunk 1: "));
    }

    #[tokio::test]
    async fn dispatch_that_runs_out_of_retries_fails_upload() {
        let fixture = Fixture::new(TestBlobStore::new(None), 2, 0);
        let upload_id = fixture.upload().await;
        fixture.blob_store.failing.store(true, Ordering::SeqCst);
        fixture.queue.start(fixture.dispatcher.clone());
        fixture
            .queue
            .enqueue(&Task::ProcessUpload { upload_id })
            .unwrap();
        fixture.queue.wait_idle().await;

        let report = fixture.state.status_report(upload_id).unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
        assert_eq!(0, report.chunks_total);
        assert!(report.error_summary.is_some());
        fixture.queue.shutdown().await;
    }

    #[tokio::test]
    async fn dead_lettered_cache_update_marks_cities_stale() {
        let fixture = Fixture::new(TestBlobStore::new(None), 3, 0);
        let upload_id = fixture.upload().await;
        fixture.queue.start(fixture.dispatcher.clone());
        fixture
            .queue
            .enqueue(&Task::ProcessUpload { upload_id })
            .unwrap();
        fixture.queue.wait_idle().await;
        assert_eq!(Some((4, false)), fixture.cached_count().await);

        let cities = BTreeSet::from(["NYC".to_string()]);
        let task = Task::UpdateCache {
            upload_id: Some(upload_id),
            cities,
        };
        let error = IngestError::CacheWrite {
            key: cache_key("NYC"),
            reason: "unavailable".to_string(),
        };
        fixture.dispatcher.dead_letter(&task, &error).await;
        let (entry, _) = fixture.cache.get(&cache_key("NYC")).await.unwrap().unwrap();
        assert!(entry.stale);
        fixture.queue.shutdown().await;
    }
}
