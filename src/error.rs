//! Error handling.

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_smithy_types::byte_stream::error::Error as ByteStreamError;
use axum::{
    extract::rejection::QueryRejection,
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tokio::sync::AcquireError;
use tracing::{event, Level};
use uuid::Uuid;

use crate::models::UploadStatus;
use crate::task_queue::QueueName;

/// Ingestion pipeline error type
///
/// This type encapsulates the various errors that may occur while ingesting an upload or serving
/// its statistics. Each variant may result in a different API error response, and is classified
/// as retryable or fatal by [IngestError::is_retryable].
#[derive(Debug, Error)]
pub enum IngestError {
    /// The uploaded file is structurally invalid
    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    /// Too many lines of a chunk failed validation
    #[error("too many invalid lines in chunk ({invalid} of {total} lines, threshold {threshold_pct}%)")]
    ChunkValidation {
        invalid: u64,
        total: u64,
        threshold_pct: f64,
    },

    /// The durable record store is temporarily unavailable
    #[error("record store unavailable")]
    TransientStore(#[from] sled::Error),

    /// The blob store returned less data than requested
    #[error("short read from blob store ({received} of {expected} bytes)")]
    ShortRead { expected: u64, received: u64 },

    /// Error reading from or writing to the local blob store
    #[error("blob store I/O error")]
    BlobIo(#[from] std::io::Error),

    /// Concurrent merges kept invalidating each other
    #[error("merge of city {city_id} abandoned after {attempts} conflicting attempts")]
    MergeConflict { city_id: String, attempts: u32 },

    /// Error writing to the cache store
    #[error("failed to write cache entry {key}: {reason}")]
    CacheWrite { key: String, reason: String },

    /// Error reading from the cache store
    #[error("failed to read cache entry {key}: {reason}")]
    CacheRead { key: String, reason: String },

    /// Unknown upload
    #[error("upload {0} not found")]
    UploadNotFound(Uuid),

    /// No aggregates have been merged for the city
    #[error("no statistics available for city {0}")]
    CityNotFound(String),

    /// The blob store holds no file for the upload
    #[error("no file stored for upload {0}")]
    BlobNotFound(Uuid),

    /// A record was stored under a key that does not match its content
    #[error("corrupt record {key}")]
    CorruptRecord { key: String },

    /// An upload status change that the lifecycle does not allow
    #[error("upload cannot move from {from} to {to}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },

    /// Work was requested for an upload that has been cancelled
    #[error("upload {0} was cancelled")]
    Cancelled(Uuid),

    /// A chunk task did not report an outcome within its deadline
    #[error("chunk {index} of upload {upload_id} timed out after {seconds}s")]
    ChunkTimeout {
        upload_id: Uuid,
        index: u32,
        seconds: u64,
    },

    /// Insufficient memory to process a chunk
    #[error("Insufficient memory to process chunk ({requested} > {total})")]
    InsufficientMemory { requested: usize, total: usize },

    /// A task was enqueued after the queue shut down
    #[error("task queue {0} is closed")]
    QueueClosed(QueueName),

    /// Error (de)serialising a record
    #[error("failed to (de)serialise record")]
    Serialization(#[from] serde_json::Error),

    /// Error reading object data from S3
    #[error("error receiving object from S3 storage")]
    S3ByteStream(#[from] ByteStreamError),

    /// Missing Content-Length header in S3 response.
    #[error("S3 response missing Content-Length header")]
    S3ContentLengthMissing,

    /// Error while retrieving an object from S3
    #[error("error retrieving object from S3 storage")]
    S3GetObject(#[from] SdkError<GetObjectError>),

    /// Error while retrieving object metadata from S3
    #[error("error retrieving object metadata from S3 storage")]
    S3HeadObject(#[from] SdkError<HeadObjectError>),

    /// Error while storing an object in S3
    #[error("error storing object in S3 storage")]
    S3PutObject(#[from] SdkError<PutObjectError>),

    /// Error acquiring a semaphore
    #[error("error acquiring resources")]
    SemaphoreAcquireError(#[from] AcquireError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Error deserialising request query parameters
    #[error("request data is not valid")]
    RequestQueryRejection(#[from] QueryRejection),

    /// Error validating request data
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Invalid service settings
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// The HTTP server failed
    #[error("HTTP server error")]
    Server(#[source] std::io::Error),

    /// The request carries no Basic authorization header naming its owner
    #[error("missing or invalid Basic authorization header")]
    MissingCredentials,
}

impl IngestError {
    /// Whether a task that failed with this error may succeed when delivered again.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::ChunkValidation { .. }
            | IngestError::TransientStore(_)
            | IngestError::ShortRead { .. }
            | IngestError::BlobIo(_)
            | IngestError::MergeConflict { .. }
            | IngestError::CacheWrite { .. }
            | IngestError::CacheRead { .. }
            | IngestError::ChunkTimeout { .. }
            | IngestError::S3ByteStream(_)
            | IngestError::S3ContentLengthMissing
            | IngestError::S3HeadObject(_)
            | IngestError::S3PutObject(_) => true,

            // Missing objects will not appear by retrying.
            IngestError::S3GetObject(sdk_error) => !matches!(
                sdk_error,
                SdkError::ServiceError(e) if matches!(e.err(), GetObjectError::NoSuchKey(_))
            ),

            IngestError::MalformedInput { .. }
            | IngestError::UploadNotFound(_)
            | IngestError::CityNotFound(_)
            | IngestError::BlobNotFound(_)
            | IngestError::CorruptRecord { .. }
            | IngestError::InvalidTransition { .. }
            | IngestError::Cancelled(_)
            | IngestError::InsufficientMemory { .. }
            | IngestError::QueueClosed(_)
            | IngestError::Serialization(_)
            | IngestError::SemaphoreAcquireError(_)
            | IngestError::TryFromInt(_)
            | IngestError::RequestQueryRejection(_)
            | IngestError::RequestDataValidation(_)
            | IngestError::InvalidSettings(_)
            | IngestError::Server(_)
            | IngestError::MissingCredentials => false,
        }
    }
}

impl IntoResponse for IngestError {
    /// Convert from an `IngestError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut causes = Vec::new();
        let mut current = error.source();
        while let Some(source) = current {
            causes.push(source.to_string());
            current = source.source();
        }
        causes.dedup();
        let caused_by = (!causes.is_empty()).then_some(causes);
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    fn unauthorised<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::UNAUTHORIZED, error)
    }

    fn not_found<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    fn conflict<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::CONFLICT, error)
    }

    fn service_unavailable<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, error)
    }

    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<IngestError> for ErrorResponse {
    /// Convert from an `IngestError` into an `ErrorResponse`.
    fn from(error: IngestError) -> Self {
        let response = match &error {
            // Bad request
            IngestError::MalformedInput { .. }
            | IngestError::ChunkValidation { .. }
            | IngestError::InsufficientMemory { .. }
            | IngestError::RequestQueryRejection(_)
            | IngestError::RequestDataValidation(_) => Self::bad_request(&error),

            // Unauthorised
            IngestError::MissingCredentials => Self::unauthorised(&error),

            // Not found
            IngestError::UploadNotFound(_)
            | IngestError::CityNotFound(_)
            | IngestError::BlobNotFound(_) => Self::not_found(&error),

            // Conflict
            IngestError::InvalidTransition { .. }
            | IngestError::Cancelled(_) => Self::conflict(&error),

            // Service unavailable
            IngestError::TransientStore(_)
            | IngestError::MergeConflict { .. }
            | IngestError::QueueClosed(_) => Self::service_unavailable(&error),

            // Internal server error
            IngestError::ShortRead { .. }
            | IngestError::BlobIo(_)
            | IngestError::CacheWrite { .. }
            | IngestError::CacheRead { .. }
            | IngestError::CorruptRecord { .. }
            | IngestError::ChunkTimeout { .. }
            | IngestError::Serialization(_)
            | IngestError::S3ByteStream(_)
            | IngestError::S3ContentLengthMissing
            | IngestError::S3HeadObject(_)
            | IngestError::S3PutObject(_)
            | IngestError::SemaphoreAcquireError(_)
            | IngestError::TryFromInt(_)
            | IngestError::InvalidSettings(_)
            | IngestError::Server(_) => Self::internal_server_error(&error),

            IngestError::S3GetObject(sdk_error) => match &sdk_error {
                SdkError::ServiceError(get_obj_error) => {
                    let get_obj_error = get_obj_error.err();
                    match get_obj_error {
                        GetObjectError::NoSuchKey(_) => Self::not_found(&error),
                        GetObjectError::InvalidObjectState(_) => Self::bad_request(&error),
                        // Quite a lot of error cases end up as unhandled. Attempt to determine
                        // the error from the code.
                        _ => match get_obj_error.code() {
                            Some("NoSuchBucket") => Self::not_found(&error),
                            Some("InvalidAccessKeyId")
                            | Some("SignatureDoesNotMatch")
                            | Some("AccessDenied") => Self::unauthorised(&error),
                            _ => Self::internal_server_error(&error),
                        },
                    }
                }
                // The enum is marked as non-exhaustive
                _ => Self::internal_server_error(&error),
            },
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
