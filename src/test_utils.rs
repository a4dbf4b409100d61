use crate::blob_store::MemoryBlobStore;
use crate::cache_store::MemoryCacheStore;
use crate::config::Settings;
use crate::pipeline::Pipeline;
use crate::record_store::RecordStore;
use crate::resource_manager::ResourceManager;

use std::sync::Arc;
use std::time::Duration;

use axum::response::Response;

/// Authorization header value for user `alice`.
pub(crate) const BASIC_ALICE: &str = "Basic YWxpY2U6c2VjcmV0";

/// Authorization header value for user `bob`.
pub(crate) const BASIC_BOB: &str = "Basic Ym9iOnNlY3JldA==";

/// Settings with small chunks and fast retries.
pub(crate) fn test_settings() -> Settings {
    Settings {
        chunk_size: 32,
        retry_backoff: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(5),
        chunk_workers: 4,
        ..Settings::default()
    }
}

/// Create a pipeline over in-memory stores and a temporary record store.
pub(crate) fn test_pipeline() -> Arc<Pipeline> {
    Arc::new(Pipeline::with_stores(
        test_settings(),
        RecordStore::temporary().unwrap(),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryCacheStore::new()),
        Arc::new(ResourceManager::new(None, None, None)),
    ))
}

// Jump through the hoops to get the body as a string.
pub(crate) async fn body_string(response: Response) -> String {
    String::from_utf8(
        hyper::body::to_bytes(response.into_body())
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap()
}
