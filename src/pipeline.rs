//! The ingestion pipeline and its exposed operations.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::task::JoinHandle;

use crate::aggregate_merger::AggregateMerger;
use crate::blob_store::{BlobStore, FsBlobStore, S3BlobStore};
use crate::cache_store::{CacheStore, DiskCacheStore, MemoryCacheStore};
use crate::cache_sync::CacheSynchronizer;
use crate::chunk_processor::{ChunkProcessor, ParseRules};
use crate::config::{BlobStoreSettings, Settings};
use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::error::IngestError;
use crate::models::{
    CityList, CityStatistics, CitySummary, FileRef, SubmitResponse, UploadId, UploadList,
    UploadStatus, UploadStatusReport,
};
use crate::record_store::RecordStore;
use crate::resource_manager::ResourceManager;
use crate::s3_client::{S3Client, S3Credentials};
use crate::task_queue::{QueueName, RetryPolicy, Task, TaskQueue};
use crate::upload_state::UploadStateMachine;

/// Largest number of uploads returned by [Pipeline::list_uploads]
pub const UPLOAD_LIST_LIMIT: usize = 100;

/// Chunked ingestion and aggregation of temperature readings
pub struct Pipeline {
    settings: Settings,
    store: RecordStore,
    blob_store: Arc<dyn BlobStore>,
    state: UploadStateMachine,
    cache: CacheSynchronizer,
    queue: TaskQueue,
    dispatcher: Arc<Dispatcher>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Open the stores named by the settings.
    pub async fn open(settings: Settings) -> Result<Self, IngestError> {
        settings.check()?;
        let store = RecordStore::open(settings.database_path())?;
        let resource_manager = Arc::new(ResourceManager::new(
            settings.s3_connection_limit,
            settings.memory_limit,
            Some(settings.chunk_workers),
        ));
        let blob_store: Arc<dyn BlobStore> = match &settings.blob_store {
            BlobStoreSettings::Fs { root } => {
                tokio::fs::create_dir_all(root).await?;
                Arc::new(FsBlobStore::new(root.clone()))
            }
            BlobStoreSettings::S3 {
                url,
                bucket,
                prefix,
                access_key,
                secret_key,
            } => {
                let credentials = match (access_key, secret_key) {
                    (Some(access_key), Some(secret_key)) => {
                        S3Credentials::access_key(access_key, secret_key)
                    }
                    _ => S3Credentials::None,
                };
                Arc::new(S3BlobStore::new(
                    S3Client::new(url, credentials),
                    bucket,
                    prefix,
                    resource_manager.clone(),
                ))
            }
        };
        let cache_store: Arc<dyn CacheStore> = match &settings.cache_path {
            Some(path) => Arc::new(DiskCacheStore::open(path)?),
            None => Arc::new(MemoryCacheStore::new()),
        };
        tracing::info!(
            "Opened record store at {}",
            settings.database_path().display()
        );
        Ok(Self::with_stores(
            settings,
            store,
            blob_store,
            cache_store,
            resource_manager,
        ))
    }

    /// Assemble a pipeline over existing stores.
    pub fn with_stores(
        settings: Settings,
        store: RecordStore,
        blob_store: Arc<dyn BlobStore>,
        cache_store: Arc<dyn CacheStore>,
        resource_manager: Arc<ResourceManager>,
    ) -> Self {
        let state = UploadStateMachine::new(
            store.clone(),
            settings.chunk_attempts,
            settings.chunk_timeout,
        );
        let cache = CacheSynchronizer::new(
            store.clone(),
            cache_store,
            settings.cache_write_attempts,
        );
        let queue = TaskQueue::new(
            RetryPolicy {
                max_attempts: settings.task_attempts,
                base: settings.retry_backoff,
                max: settings.retry_backoff_max,
            },
            HashMap::from([
                (QueueName::FileProcessing, settings.dispatch_workers),
                (QueueName::ChunkProcessing, settings.chunk_workers),
                (QueueName::CacheUpdates, settings.cache_workers),
            ]),
        );
        let rules = ParseRules::from_settings(&settings);
        let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
            state: state.clone(),
            merger: AggregateMerger::new(store.clone(), settings.merge_attempts),
            processor: ChunkProcessor::new(
                blob_store.clone(),
                resource_manager,
                rules.clone(),
                settings.use_rayon,
            ),
            blob_store: blob_store.clone(),
            cache: cache.clone(),
            queue: queue.clone(),
            rules,
            chunk_size: settings.chunk_size,
            chunk_timeout: settings.chunk_timeout,
            publish_every: settings.cache_publish_every,
        }));
        Pipeline {
            settings,
            store,
            blob_store,
            state,
            cache,
            queue,
            dispatcher,
            refresher: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start the workers, resume unfinished uploads and schedule cache reconciliation.
    pub fn start(&self) -> Result<(), IngestError> {
        self.recover()?;
        self.queue.start(self.dispatcher.clone());
        if let Some(interval) = self.settings.cache_refresh_interval {
            let queue = self.queue.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes at once.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(err) = queue.enqueue(&Task::RefreshAllCaches) {
                        tracing::info!("Stopping cache reconciliation: {}", err);
                        break;
                    }
                }
            });
            *self
                .refresher
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        }
        Ok(())
    }

    /// Enqueue the dispatch task of every upload left unfinished by a previous process.
    fn recover(&self) -> Result<(), IngestError> {
        for upload in self.store.list_uploads()? {
            if upload.status.is_terminal() {
                continue;
            }
            if upload.status == UploadStatus::Processing {
                let reclaimed = self.state.reclaim_chunks(upload.id)?;
                if reclaimed > 0 {
                    tracing::info!("Reclaimed {} chunks of upload {}", reclaimed, upload.id);
                }
            }
            tracing::info!("Resuming upload {} ({})", upload.id, upload.status);
            self.queue
                .enqueue(&Task::ProcessUpload { upload_id: upload.id })?;
        }
        Ok(())
    }

    /// Stop the workers and flush the record store.
    pub async fn shutdown(&self) -> Result<(), IngestError> {
        let refresher = self
            .refresher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(refresher) = refresher {
            refresher.abort();
        }
        self.queue.shutdown().await;
        self.store.flush().await
    }

    /// Wait until no task is queued, running or waiting for a retry.
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    /// Store a received file and submit it.
    #[tracing::instrument(level = "DEBUG", skip(self, data), fields(size = data.len()))]
    pub async fn receive_upload(
        &self,
        filename: &str,
        owner: &str,
        data: Bytes,
    ) -> Result<SubmitResponse, IngestError> {
        let file_ref = FileRef::reserve(filename);
        self.blob_store.put(file_ref.upload_id, data).await?;
        let upload_id = self.submit_upload(&file_ref, owner).await?;
        Ok(SubmitResponse {
            upload_id,
            status: self.store.upload(upload_id)?.status,
            status_url: format!("/v1/uploads/{upload_id}/status"),
        })
    }

    /// Create an upload for a stored file and enqueue its dispatch.
    ///
    /// Submitting the same file reference again returns the same upload.
    pub async fn submit_upload(
        &self,
        file_ref: &FileRef,
        owner: &str,
    ) -> Result<UploadId, IngestError> {
        let size = self.blob_store.size(file_ref.upload_id).await?;
        let (upload, created) = self.state.create_upload(file_ref, owner, size)?;
        if created || upload.status == UploadStatus::Pending {
            self.queue
                .enqueue(&Task::ProcessUpload { upload_id: upload.id })?;
        }
        if created {
            tracing::info!(
                "Upload {} of {} ({} bytes) submitted by {}",
                upload.id,
                upload.filename,
                size,
                owner
            );
        }
        Ok(upload.id)
    }

    pub fn get_upload_status(&self, upload_id: UploadId) -> Result<UploadStatusReport, IngestError> {
        self.state.status_report(upload_id)
    }

    /// List an owner's uploads, newest first.
    pub fn list_uploads(&self, owner: &str) -> Result<UploadList, IngestError> {
        let mut uploads: Vec<_> = self
            .store
            .list_uploads()?
            .into_iter()
            .filter(|upload| upload.owner == owner)
            .collect();
        uploads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let results = uploads
            .iter()
            .take(UPLOAD_LIST_LIMIT)
            .map(|upload| self.state.status_report(upload.id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UploadList {
            count: uploads.len(),
            results,
        })
    }

    /// List every city with merged readings.
    pub fn list_cities(&self) -> Result<CityList, IngestError> {
        let results = self
            .store
            .list_cities()?
            .iter()
            .map(|city_id| self.city_summary(city_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CityList {
            count: results.len(),
            results,
        })
    }

    /// Describe one city from its durable aggregates.
    pub fn get_city(&self, city_id: &str) -> Result<CitySummary, IngestError> {
        let summary = self.city_summary(city_id)?;
        if summary.uploads == 0 {
            return Err(IngestError::CityNotFound(city_id.to_string()));
        }
        Ok(summary)
    }

    fn city_summary(&self, city_id: &str) -> Result<CitySummary, IngestError> {
        let aggregates = self.store.list_city_aggregates(city_id)?;
        Ok(CitySummary {
            city_id: city_id.to_string(),
            reading_count: aggregates.iter().map(|aggregate| aggregate.stats.count).sum(),
            uploads: u32::try_from(aggregates.len())?,
        })
    }

    pub async fn get_city_statistics(&self, city_id: &str) -> Result<CityStatistics, IngestError> {
        self.cache.statistics(city_id).await
    }

    /// Cancel an unfinished upload.
    ///
    /// Aggregates merged so far are kept and republished as partial.
    pub async fn cancel_upload(
        &self,
        upload_id: UploadId,
    ) -> Result<UploadStatusReport, IngestError> {
        self.state.cancel(upload_id)?;
        let cities = self.store.upload_cities(upload_id)?;
        if !cities.is_empty() {
            self.queue.enqueue(&Task::UpdateCache {
                upload_id: Some(upload_id),
                cities,
            })?;
        }
        self.state.status_report(upload_id)
    }

    pub async fn refresh_city_cache(&self, city_id: &str) -> Result<CityStatistics, IngestError> {
        self.cache.refresh_city(city_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_pipeline, test_settings};

    fn pipeline() -> Arc<Pipeline> {
        test_pipeline()
    }

    #[tokio::test]
    async fn upload_to_statistics() {
        let pipeline = pipeline();
        pipeline.start().unwrap();
        let data = "city_id,temp,timestamp\n\
                    NYC,10.5,2024-01-01T00:00:00Z\n\
                    LON,4,2024-01-01T00:00:00Z\n\
                    NYC,20.5,1704067200\n";
        let response = pipeline
            .receive_upload("data.csv", "alice", Bytes::from(data))
            .await
            .unwrap();
        assert_eq!(
            format!("/v1/uploads/{}/status", response.upload_id),
            response.status_url
        );
        pipeline.wait_idle().await;
        let report = pipeline.get_upload_status(response.upload_id).unwrap();
        assert_eq!(UploadStatus::Completed, report.status);
        assert_eq!(3, report.valid_rows);
        assert!(report.chunks_total > 1);
        let nyc = pipeline.get_city_statistics("NYC").await.unwrap();
        assert_eq!(2, nyc.count);
        assert_eq!(Some(15.5), nyc.mean);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_file_fails_upload() {
        let pipeline = pipeline();
        pipeline.start().unwrap();
        let response = pipeline
            .receive_upload("data.csv", "alice", Bytes::from("city,temp,when\nNYC,1,2\n"))
            .await
            .unwrap();
        pipeline.wait_idle().await;
        let report = pipeline.get_upload_status(response.upload_id).unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
        assert!(report.error_summary.unwrap().contains("malformed input"));
        assert_eq!(0, report.chunks_total);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn submit_is_idempotent() {
        let pipeline = pipeline();
        let file_ref = FileRef::reserve("data.csv");
        pipeline
            .blob_store
            .put(file_ref.upload_id, Bytes::from("NYC,1,1704067200\n"))
            .await
            .unwrap();
        let first = pipeline.submit_upload(&file_ref, "alice").await.unwrap();
        let second = pipeline.submit_upload(&file_ref, "alice").await.unwrap();
        assert_eq!(first, second);
        pipeline.start().unwrap();
        pipeline.wait_idle().await;
        assert_eq!(
            UploadStatus::Completed,
            pipeline.get_upload_status(first).unwrap().status
        );
        // Both dispatch deliveries were applied once.
        assert_eq!(1, pipeline.get_city_statistics("NYC").await.unwrap().count);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn submit_without_file() {
        let pipeline = pipeline();
        let file_ref = FileRef::reserve("data.csv");
        assert!(matches!(
            pipeline.submit_upload(&file_ref, "alice").await,
            Err(IngestError::BlobNotFound(id)) if id == file_ref.upload_id
        ));
    }

    #[tokio::test]
    async fn cancel_before_processing() {
        let pipeline = pipeline();
        let response = pipeline
            .receive_upload("data.csv", "alice", Bytes::from("NYC,1,1704067200\n"))
            .await
            .unwrap();
        let report = pipeline.cancel_upload(response.upload_id).await.unwrap();
        assert_eq!(UploadStatus::Failed, report.status);
        assert_eq!(Some("cancelled".to_string()), report.error_summary);
        pipeline.start().unwrap();
        pipeline.wait_idle().await;
        assert!(matches!(
            pipeline.get_city_statistics("NYC").await,
            Err(IngestError::CityNotFound(_))
        ));
        assert!(matches!(
            pipeline.cancel_upload(response.upload_id).await,
            Err(IngestError::InvalidTransition { .. })
        ));
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unfinished_uploads_resume_on_start() {
        let pipeline = pipeline();
        let file_ref = FileRef::reserve("data.csv");
        pipeline
            .blob_store
            .put(file_ref.upload_id, Bytes::from("NYC,1,1704067200\nNYC,3,1704067200\n"))
            .await
            .unwrap();
        let upload_id = pipeline.submit_upload(&file_ref, "alice").await.unwrap();
        // Simulate a crash after the upload was recorded but before its task ran.
        pipeline.queue.shutdown().await;
        let restarted = Pipeline::with_stores(
            test_settings(),
            pipeline.store.clone(),
            pipeline.blob_store.clone(),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(ResourceManager::new(None, None, None)),
        );
        restarted.start().unwrap();
        restarted.wait_idle().await;
        assert_eq!(
            UploadStatus::Completed,
            restarted.get_upload_status(upload_id).unwrap().status
        );
        assert_eq!(Some(2.0), restarted.get_city_statistics("NYC").await.unwrap().mean);
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn refresh_unknown_city() {
        let pipeline = pipeline();
        assert!(matches!(
            pipeline.refresh_city_cache("NYC").await,
            Err(IngestError::CityNotFound(_))
        ));
    }
}
