//! Splitting of an uploaded file into line-aligned chunks.
//!
//! A plan covers the whole file: the first chunk starts at offset 0 and includes the header line,
//! if any, and every later chunk starts immediately after the previous one ends. Boundaries are
//! placed just after a newline, so no record straddles two chunks. The last chunk ends at the end
//! of the file, with or without a trailing newline.

use crate::blob_store::BlobStore;
use crate::chunk_processor::{parse_line, ParseRules};
use crate::error::IngestError;
use crate::models::{ChunkRange, UploadId};

/// Size of the reads used to search for a newline.
const WINDOW: u64 = 64 * 1024;

/// Longest accepted first line, which is read whole to detect a header.
const MAX_FIRST_LINE: u64 = 1024 * 1024;

/// Expected header columns, each with its accepted names.
const HEADER_COLUMNS: [&[&str]; 3] = [&["city_id"], &["temp", "temperature"], &["timestamp"]];

/// Chunk plan of an upload
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkPlan {
    /// Length in bytes of the header line including its terminator, 0 if the file has no header
    pub header_len: u64,
    /// Chunk ranges in index order
    pub ranges: Vec<ChunkRange>,
}

/// Column names that mark a first line as an attempted header.
const HEADER_WORDS: [&str; 6] = ["city_id", "city", "temp", "temperature", "timestamp", "time"];

/// Returns true if a line names the expected columns.
///
/// Column names are compared case-insensitively after trimming.
pub fn is_header(line: &str) -> bool {
    let columns: Vec<String> = line
        .split(',')
        .map(|column| column.trim().to_lowercase())
        .collect();
    columns.len() == HEADER_COLUMNS.len()
        && columns
            .iter()
            .zip(HEADER_COLUMNS)
            .all(|(column, names)| names.contains(&column.as_str()))
}

/// Returns true if any column of a line is a column name rather than a value.
///
/// Such a line is a header, well formed or not. Any other first line is a record.
pub fn looks_like_header(line: &str) -> bool {
    line.split(',')
        .map(|column| column.trim().to_lowercase())
        .any(|column| HEADER_WORDS.contains(&column.as_str()))
}

/// Splits files into chunk plans
pub struct ChunkSplitter<'a> {
    blob_store: &'a dyn BlobStore,
    rules: &'a ParseRules,
    target_size: u64,
}

impl<'a> ChunkSplitter<'a> {
    pub fn new(blob_store: &'a dyn BlobStore, rules: &'a ParseRules, target_size: u64) -> Self {
        ChunkSplitter {
            blob_store,
            rules,
            target_size: target_size.max(1),
        }
    }

    /// Compute the chunk plan of an upload's file of `size` bytes.
    ///
    /// Fails with [IngestError::MalformedInput] for an empty file, a file holding only a header
    /// and a file whose first line looks like a header but is not the expected one.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn split(&self, upload_id: UploadId, size: u64) -> Result<ChunkPlan, IngestError> {
        if size == 0 {
            return Err(malformed("file is empty"));
        }
        let header_len = self.header_len(upload_id, size).await?;
        if header_len >= size {
            return Err(malformed("file contains no records"));
        }

        let mut ranges = Vec::new();
        let mut start = 0;
        while start < size {
            let index = u32::try_from(ranges.len())?;
            let mut tentative = start.saturating_add(self.target_size);
            if index == 0 {
                // The first chunk holds at least one byte past the header.
                tentative = tentative.max(header_len + 1);
            }
            let end = if tentative >= size {
                size
            } else {
                match self.find_newline(upload_id, tentative - 1, size).await? {
                    Some(newline) => newline + 1,
                    None => size,
                }
            };
            ranges.push(ChunkRange {
                index,
                offset: start,
                length: end - start,
            });
            start = end;
        }
        tracing::debug!("Split {} bytes into {} chunks", size, ranges.len());
        Ok(ChunkPlan { header_len, ranges })
    }

    /// Detect the header line and return its length.
    async fn header_len(&self, upload_id: UploadId, size: u64) -> Result<u64, IngestError> {
        let line_end = match self.find_newline(upload_id, 0, size.min(MAX_FIRST_LINE)).await? {
            Some(newline) => newline,
            None if size <= MAX_FIRST_LINE => size,
            None => return Err(malformed("first line is too long")),
        };
        let data = self.blob_store.read(upload_id, 0, line_end).await?;
        let line = data.strip_suffix(b"\r").unwrap_or(&data[..]);
        let Ok(line) = std::str::from_utf8(line) else {
            return Ok(0);
        };
        if is_header(line) {
            Ok((line_end + 1).min(size))
        } else if looks_like_header(line) && parse_line(line, self.rules).is_err() {
            Err(malformed(
                "header must name the columns city_id, temp and timestamp",
            ))
        } else {
            // A record, valid or not; an invalid one is counted when its chunk is processed.
            Ok(0)
        }
    }

    /// Return the offset of the first newline at or after `from` and before `limit`.
    async fn find_newline(
        &self,
        upload_id: UploadId,
        from: u64,
        limit: u64,
    ) -> Result<Option<u64>, IngestError> {
        let mut offset = from;
        while offset < limit {
            let length = WINDOW.min(limit - offset);
            let window = self.blob_store.read(upload_id, offset, length).await?;
            if let Some(position) = window.iter().position(|b| *b == b'\n') {
                return Ok(Some(offset + position as u64));
            }
            offset += length;
        }
        Ok(None)
    }
}

fn malformed(reason: &str) -> IngestError {
    IngestError::MalformedInput {
        reason: reason.to_string(),
    }
}
