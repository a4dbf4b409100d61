//! S3 access for the blob store: ranged reads, object sizes and uploads.

use crate::error::IngestError;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use bytes::{Bytes, BytesMut};
use tracing::Instrument;
use url::Url;

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum S3Credentials {
    AccessKey {
        access_key: String,
        secret_key: String,
    },
    None,
}

impl S3Credentials {
    /// Create an access key credential.
    pub fn access_key(access_key: &str, secret_key: &str) -> Self {
        S3Credentials::AccessKey {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }
}

/// S3 client object.
#[derive(Clone)]
pub struct S3Client {
    /// Underlying AWS SDK S3 client object.
    client: Client,
}

impl S3Client {
    /// Creates an S3Client object
    ///
    /// # Arguments
    ///
    /// * `url`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub fn new(url: &Url, credentials: S3Credentials) -> Self {
        let region = Region::new("us-east-1");
        let builder = aws_sdk_s3::Config::builder().behavior_version(BehaviorVersion::latest());
        let builder = match credentials {
            S3Credentials::AccessKey {
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::from_keys(access_key, secret_key, None);
                builder.credentials_provider(credentials)
            }
            S3Credentials::None => builder,
        };
        let s3_config = builder
            .region(Some(region))
            .endpoint_url(url.to_string())
            .force_path_style(true)
            .build();
        let client = Client::from_conf(s3_config);
        Self { client }
    }

    /// Downloads `length` bytes of an object starting at `offset`
    ///
    /// # Arguments
    ///
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `offset`: First byte to read
    /// * `length`: Number of bytes to read, at least 1
    pub async fn download_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, IngestError> {
        let mut response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(byte_range(offset, length))
            .send()
            .instrument(tracing::Span::current())
            .await?;
        // Fail if the content length header is missing.
        let content_length: usize = response
            .content_length()
            .ok_or(IngestError::S3ContentLengthMissing)?
            .try_into()?;

        let mut buf = BytesMut::with_capacity(content_length);
        // Iterate over the streaming response, copying data into the buffer.
        while let Some(bytes) = response
            .body
            .try_next()
            .instrument(tracing::Span::current())
            .await?
        {
            buf.extend_from_slice(&bytes)
        }
        Ok(buf.freeze())
    }

    /// Returns the size of an object in bytes.
    pub async fn object_size(&self, bucket: &str, key: &str) -> Result<u64, IngestError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .instrument(tracing::Span::current())
            .await?;
        Ok(response
            .content_length()
            .ok_or(IngestError::S3ContentLengthMissing)?
            .try_into()?)
    }

    /// Uploads an object.
    pub async fn upload_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> Result<(), IngestError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .instrument(tracing::Span::current())
            .await?;
        Ok(())
    }
}

/// HTTP Range header value selecting `length` bytes from `offset`.
///
/// Range ends are inclusive, so `length` must not be 0.
pub fn byte_range(offset: u64, length: u64) -> String {
    format!("bytes={}-{}", offset, offset + length - 1)
}
