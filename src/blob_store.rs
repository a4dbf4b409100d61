//! Storage of uploaded files.
//!
//! The pipeline never holds a whole file: the splitter and processors read byte ranges through
//! [BlobStore::read]. The API layer stores a file once with [BlobStore::put] before submitting it.

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use bytes::Bytes;
use hashbrown::HashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;

use crate::error::IngestError;
use crate::models::UploadId;
use crate::resource_manager::ResourceManager;
use crate::s3_client::S3Client;

/// Random access store of uploaded files, keyed by upload id
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read exactly `length` bytes starting at `offset`.
    ///
    /// Fails with [IngestError::ShortRead] if fewer bytes are available and with
    /// [IngestError::BlobNotFound] if no file is stored for the upload.
    async fn read(&self, upload_id: UploadId, offset: u64, length: u64)
        -> Result<Bytes, IngestError>;

    /// Size of the stored file in bytes.
    async fn size(&self, upload_id: UploadId) -> Result<u64, IngestError>;

    /// Store a file, replacing any previous content.
    async fn put(&self, upload_id: UploadId, data: Bytes) -> Result<(), IngestError>;
}

fn check_length(data: Bytes, expected: u64) -> Result<Bytes, IngestError> {
    let received = data.len() as u64;
    if received == expected {
        Ok(data)
    } else {
        Err(IngestError::ShortRead { expected, received })
    }
}

/// Files on the local filesystem, one per upload under a root directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        FsBlobStore { root }
    }

    fn path(&self, upload_id: UploadId) -> PathBuf {
        self.root.join(upload_id.to_string())
    }
}

fn not_found(upload_id: UploadId) -> impl FnOnce(std::io::Error) -> IngestError {
    move |err| {
        if err.kind() == ErrorKind::NotFound {
            IngestError::BlobNotFound(upload_id)
        } else {
            err.into()
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn read(
        &self,
        upload_id: UploadId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, IngestError> {
        let mut file = tokio::fs::File::open(self.path(upload_id))
            .await
            .map_err(not_found(upload_id))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(usize::try_from(length)?);
        file.take(length).read_to_end(&mut buf).await?;
        check_length(buf.into(), length)
    }

    async fn size(&self, upload_id: UploadId) -> Result<u64, IngestError> {
        let metadata = tokio::fs::metadata(self.path(upload_id))
            .await
            .map_err(not_found(upload_id))?;
        Ok(metadata.len())
    }

    async fn put(&self, upload_id: UploadId, data: Bytes) -> Result<(), IngestError> {
        tokio::fs::create_dir_all(&self.root).await?;
        // Write beside the final path and rename so readers never see a partial file.
        let path = self.path(upload_id);
        let partial = path.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(())
    }
}

/// Files held in memory
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<UploadId, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(
        &self,
        upload_id: UploadId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, IngestError> {
        let blobs = self.blobs.read().await;
        let data = blobs
            .get(&upload_id)
            .ok_or(IngestError::BlobNotFound(upload_id))?;
        let start = usize::try_from(offset)?.min(data.len());
        let end = usize::try_from(offset.saturating_add(length))?.min(data.len());
        check_length(data.slice(start..end), length)
    }

    async fn size(&self, upload_id: UploadId) -> Result<u64, IngestError> {
        self.blobs
            .read()
            .await
            .get(&upload_id)
            .map(|data| data.len() as u64)
            .ok_or(IngestError::BlobNotFound(upload_id))
    }

    async fn put(&self, upload_id: UploadId, data: Bytes) -> Result<(), IngestError> {
        self.blobs.write().await.insert(upload_id, data);
        Ok(())
    }
}

/// Objects in an S3-compatible object store, named `<prefix><upload id>`
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    prefix: String,
    resource_manager: Arc<ResourceManager>,
}

impl S3BlobStore {
    pub fn new(
        client: S3Client,
        bucket: &str,
        prefix: &str,
        resource_manager: Arc<ResourceManager>,
    ) -> Self {
        S3BlobStore {
            client,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            resource_manager,
        }
    }

    fn key(&self, upload_id: UploadId) -> String {
        format!("{}{}", self.prefix, upload_id)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn read(
        &self,
        upload_id: UploadId,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, IngestError> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let _conn_permits = self.resource_manager.s3_connection().await?;
        let data = self
            .client
            .download_range(&self.bucket, &self.key(upload_id), offset, length)
            .await
            .map_err(|err| match err {
                IngestError::S3GetObject(SdkError::ServiceError(ref e))
                    if matches!(e.err(), GetObjectError::NoSuchKey(_)) =>
                {
                    IngestError::BlobNotFound(upload_id)
                }
                err => err,
            })?;
        check_length(data, length)
    }

    #[tracing::instrument(level = "DEBUG", skip(self))]
    async fn size(&self, upload_id: UploadId) -> Result<u64, IngestError> {
        let _conn_permits = self.resource_manager.s3_connection().await?;
        self.client
            .object_size(&self.bucket, &self.key(upload_id))
            .await
            .map_err(|err| match err {
                IngestError::S3HeadObject(SdkError::ServiceError(ref e))
                    if matches!(e.err(), HeadObjectError::NotFound(_)) =>
                {
                    IngestError::BlobNotFound(upload_id)
                }
                err => err,
            })
    }

    #[tracing::instrument(level = "DEBUG", skip(self, data))]
    async fn put(&self, upload_id: UploadId, data: Bytes) -> Result<(), IngestError> {
        let _conn_permits = self.resource_manager.s3_connection().await?;
        self.client
            .upload_object(&self.bucket, &self.key(upload_id), data)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use uuid::Uuid;

    const DATA: &[u8] = b"NYC,10,1700000000\nLON,12.5,1700000001\n";

    async fn exercise(store: &dyn BlobStore) {
        let id = Uuid::new_v4();
        assert!(matches!(
            store.size(id).await,
            Err(IngestError::BlobNotFound(missing)) if missing == id
        ));
        assert!(matches!(
            store.read(id, 0, 1).await,
            Err(IngestError::BlobNotFound(_))
        ));

        store.put(id, Bytes::from_static(DATA)).await.unwrap();
        assert_eq!(DATA.len() as u64, store.size(id).await.unwrap());
        assert_eq!(&DATA[..18], &store.read(id, 0, 18).await.unwrap()[..]);
        assert_eq!(&DATA[18..], &store.read(id, 18, 20).await.unwrap()[..]);
        assert!(store.read(id, 5, 0).await.unwrap().is_empty());
        match store.read(id, 30, 100).await {
            Err(IngestError::ShortRead { expected, received }) => {
                assert_eq!(100, expected);
                assert_eq!(8, received);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn memory_store() {
        exercise(&MemoryBlobStore::new()).await;
    }

    #[tokio::test]
    async fn fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("blobs"));
        exercise(&store).await;
    }

    #[tokio::test]
    async fn fs_store_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());
        let id = Uuid::new_v4();
        store.put(id, Bytes::from_static(b"first")).await.unwrap();
        store.put(id, Bytes::from_static(b"2nd")).await.unwrap();
        assert_eq!(3, store.size(id).await.unwrap());
        assert!(!dir.path().join(format!("{id}.partial")).exists());
    }

    #[test]
    fn s3_key() {
        let url = Url::parse("http://localhost:9000").unwrap();
        let store = S3BlobStore::new(
            S3Client::new(&url, crate::s3_client::S3Credentials::None),
            "bucket",
            "uploads/",
            Arc::new(ResourceManager::new(None, None, None)),
        );
        let id = Uuid::nil();
        assert_eq!(
            "uploads/00000000-0000-0000-0000-000000000000",
            store.key(id)
        );
    }
}
