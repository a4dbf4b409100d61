//! Records of the ingestion pipeline and the request/response types of the API.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use crate::operations::Stats;

/// Identity of an upload.
pub type UploadId = Uuid;

/// Lifecycle of an upload
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UploadStatus {
    /// File received, splitting not yet started
    Pending,
    /// Chunk plan being computed
    Chunking,
    /// Chunks being processed and merged
    Processing,
    /// Every chunk succeeded and was merged
    Completed,
    /// A chunk exhausted its attempts, the file was malformed or the upload was cancelled
    Failed,
}

impl UploadStatus {
    /// Returns true for the states an upload never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if an upload in this state may move to `next`.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Chunking)
                | (Pending, Failed)
                | (Chunking, Chunking)
                | (Chunking, Processing)
                | (Chunking, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

/// Lifecycle of a chunk
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChunkStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Reference to a file the API layer has placed in the blob store.
///
/// The API layer reserves the upload id, stores the file's bytes under it and then submits the
/// reference.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FileRef {
    /// Upload id under which the blob is stored
    pub upload_id: UploadId,
    /// Name of the file as uploaded
    pub filename: String,
}

impl FileRef {
    /// Reserve a new upload id for a file.
    pub fn reserve(filename: &str) -> Self {
        FileRef {
            upload_id: Uuid::new_v4(),
            filename: filename.to_string(),
        }
    }
}

/// One ingestion job
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Upload {
    pub id: UploadId,
    /// Identity of the submitter
    pub owner: String,
    pub filename: String,
    /// Size of the file in bytes
    pub size: u64,
    /// Length in bytes of the header line, 0 for headerless files
    pub header_len: u64,
    /// Number of chunks, known once the chunk plan is installed
    pub chunk_count: Option<u32>,
    pub status: UploadStatus,
    /// Distinct failure reasons reported so far
    pub failure_reasons: BTreeSet<String>,
    pub cancelled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Upload {
    /// Return a new pending upload.
    pub fn new(file_ref: &FileRef, owner: &str, size: u64, now: OffsetDateTime) -> Self {
        Upload {
            id: file_ref.upload_id,
            owner: owner.to_string(),
            filename: file_ref.filename.clone(),
            size,
            header_len: 0,
            chunk_count: None,
            status: UploadStatus::Pending,
            failure_reasons: BTreeSet::new(),
            cancelled: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Distinct failure reasons joined into one line, if any.
    pub fn error_summary(&self) -> Option<String> {
        if self.failure_reasons.is_empty() {
            None
        } else {
            Some(
                self.failure_reasons
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        }
    }
}

/// A contiguous, line-aligned byte range of an upload's file
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ChunkRange {
    /// 0-based sequence index
    pub index: u32,
    pub offset: u64,
    pub length: u64,
}

impl ChunkRange {
    /// Offset one past the last byte of the range.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Processing state of one chunk of an upload
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Chunk {
    pub upload_id: UploadId,
    pub index: u32,
    pub offset: u64,
    pub length: u64,
    pub status: ChunkStatus,
    /// Number of processing attempts started
    pub attempts: u32,
    pub valid_lines: u64,
    pub invalid_lines: u64,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Chunk {
    /// Return a queued chunk covering `range`.
    pub fn queued(upload_id: UploadId, range: &ChunkRange, now: OffsetDateTime) -> Self {
        Chunk {
            upload_id,
            index: range.index,
            offset: range.offset,
            length: range.length,
            status: ChunkStatus::Queued,
            attempts: 0,
            valid_lines: 0,
            invalid_lines: 0,
            last_error: None,
            started_at: None,
            updated_at: now,
        }
    }

    pub fn range(&self) -> ChunkRange {
        ChunkRange {
            index: self.index,
            offset: self.offset,
            length: self.length,
        }
    }
}

/// One validated temperature reading
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub city_id: String,
    /// Temperature in hundredths of a degree Celsius
    pub temperature: i64,
    pub timestamp: OffsetDateTime,
}

/// Reduction of the readings of one city within one chunk
///
/// Written once and never modified. Its identity is (upload id, chunk index, city id).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PartialAggregate {
    pub upload_id: UploadId,
    pub chunk_index: u32,
    pub city_id: String,
    pub stats: Stats,
}

/// Merge of all partial aggregates of one city within one upload
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CityAggregate {
    pub upload_id: UploadId,
    pub city_id: String,
    pub stats: Stats,
    /// Chunk indices already folded into `stats`
    pub merged_chunks: BTreeSet<u32>,
    /// Incremented by every applied merge
    pub version: u64,
}

impl CityAggregate {
    /// Return an aggregate with nothing merged into it.
    pub fn empty(upload_id: UploadId, city_id: &str) -> Self {
        CityAggregate {
            upload_id,
            city_id: city_id.to_string(),
            stats: Stats::default(),
            merged_chunks: BTreeSet::new(),
            version: 0,
        }
    }
}

/// Read-optimised snapshot of a city's aggregate across all uploads
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CacheEntry {
    pub city_id: String,
    pub stats: Stats,
    /// Number of uploads contributing to `stats`
    pub uploads: u32,
    /// True if any contributing upload had not completed
    pub partial: bool,
    /// Marked by invalidation, rebuilt on the next read
    pub stale: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

/// Query parameters of an upload request
#[derive(Debug, Deserialize, PartialEq, Validate)]
#[serde(deny_unknown_fields)]
pub struct UploadParams {
    /// Name of the uploaded file
    #[validate(length(min = 1, max = 255, message = "filename must be 1 to 255 characters"))]
    pub filename: String,
}

/// Response to an accepted upload
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub upload_id: UploadId,
    pub status: UploadStatus,
    pub status_url: String,
}

/// Processing status of an upload, read from the durable records
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct UploadStatusReport {
    pub upload_id: UploadId,
    pub filename: String,
    pub owner: String,
    pub status: UploadStatus,
    pub chunks_total: u32,
    pub chunks_succeeded: u32,
    pub chunks_failed: u32,
    pub error_summary: Option<String>,
    pub valid_rows: u64,
    pub invalid_rows: u64,
    /// Percentage of chunks in a terminal state
    pub progress: f64,
    /// True for a failed upload whose merged aggregates remain visible
    pub partial: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Statistics of one city, served from the cache
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct CityStatistics {
    pub city_id: String,
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub cache_version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub uploads: u32,
    pub partial: bool,
}

impl CityStatistics {
    /// Render a cache entry stored under `version`.
    pub fn from_entry(entry: &CacheEntry, version: u64) -> Self {
        CityStatistics {
            city_id: entry.city_id.clone(),
            count: entry.stats.count,
            min: entry.stats.min_celsius(),
            max: entry.stats.max_celsius(),
            mean: entry.stats.mean_celsius(),
            cache_version: version,
            as_of: entry.as_of,
            uploads: entry.uploads,
            partial: entry.partial,
        }
    }
}

/// Most recent uploads of one owner
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct UploadList {
    /// Number of uploads the owner has, including those not listed
    pub count: usize,
    /// Newest first
    pub results: Vec<UploadStatusReport>,
}

/// A city with readings, read from the durable aggregates
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct CitySummary {
    pub city_id: String,
    /// Valid readings merged across every upload
    pub reading_count: u64,
    pub uploads: u32,
}

/// Every city with readings, ordered by id
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct CityList {
    pub count: usize,
    pub results: Vec<CitySummary>,
}
