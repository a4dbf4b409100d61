//! Parsing and reduction of one chunk of an upload.
//!
//! Each line of a chunk is `city_id,temperature,timestamp`, optionally followed by further
//! columns which are ignored. Lines are validated one by one; invalid lines are counted and
//! sampled for diagnostics without aborting the chunk, unless they exceed the configured fraction
//! of the chunk's lines. The valid readings are reduced to one [PartialAggregate] per city.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::blob_store::BlobStore;
use crate::config::Settings;
use crate::error::IngestError;
use crate::models::{Chunk, PartialAggregate, Reading, Upload, UploadId};
use crate::operations::{celsius_to_centi, Stats};
use crate::resource_manager::ResourceManager;

/// Longest accepted city id, in characters.
pub const MAX_CITY_ID_LEN: usize = 100;

/// Naive date-time formats, interpreted as UTC.
const NAIVE_FORMATS: &[&[FormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[day]/[month]/[year] [hour]:[minute]:[second]"),
    format_description!("[month]/[day]/[year] [hour]:[minute]:[second]"),
];

/// Date-time with a numeric offset lacking the colon, e.g. `2024-01-15T10:30:00+0100`.
const COMPACT_OFFSET_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][offset_hour sign:mandatory][offset_minute]"
);

/// Rules applied to the lines of a chunk
#[derive(Clone, Debug, PartialEq)]
pub struct ParseRules {
    /// Lowest plausible temperature in degrees Celsius
    pub min_temperature: f64,
    /// Highest plausible temperature in degrees Celsius
    pub max_temperature: f64,
    /// Largest fraction of invalid lines a chunk may contain
    pub invalid_line_threshold: f64,
    /// Number of invalid line messages kept
    pub error_sample_limit: usize,
}

impl Default for ParseRules {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ParseRules {
    pub fn from_settings(settings: &Settings) -> Self {
        ParseRules {
            min_temperature: settings.min_temperature,
            max_temperature: settings.max_temperature,
            invalid_line_threshold: settings.invalid_line_threshold,
            error_sample_limit: settings.error_sample_limit,
        }
    }
}

/// Reason a line was rejected
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LineError {
    #[error("expected at least 3 columns, found {0}")]
    TooFewColumns(usize),

    #[error("line is not valid UTF-8")]
    NotUtf8,

    #[error("empty city id")]
    EmptyCityId,

    #[error("city id longer than {} characters", MAX_CITY_ID_LEN)]
    CityIdTooLong,

    #[error("city id contains control characters")]
    InvalidCityId,

    #[error("invalid temperature {0:?}")]
    InvalidTemperature(String),

    #[error("temperature {value} outside [{min}, {max}]")]
    TemperatureOutOfRange { value: f64, min: f64, max: f64 },

    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
}

/// Parse one line of text into a reading.
///
/// The line must not include its terminator. Fields are trimmed.
pub fn parse_line(line: &str, rules: &ParseRules) -> Result<Reading, LineError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 {
        return Err(LineError::TooFewColumns(fields.len()));
    }
    let city_id = parse_city_id(fields[0])?;
    let celsius: f64 = fields[1]
        .parse()
        .map_err(|_| LineError::InvalidTemperature(fields[1].to_string()))?;
    if !celsius.is_finite() {
        return Err(LineError::InvalidTemperature(fields[1].to_string()));
    }
    if celsius < rules.min_temperature || celsius > rules.max_temperature {
        return Err(LineError::TemperatureOutOfRange {
            value: celsius,
            min: rules.min_temperature,
            max: rules.max_temperature,
        });
    }
    let timestamp = parse_timestamp(fields[2])?;
    Ok(Reading {
        city_id: city_id.to_string(),
        temperature: celsius_to_centi(celsius),
        timestamp,
    })
}

fn parse_city_id(city_id: &str) -> Result<&str, LineError> {
    if city_id.is_empty() {
        Err(LineError::EmptyCityId)
    } else if city_id.chars().count() > MAX_CITY_ID_LEN {
        Err(LineError::CityIdTooLong)
    } else if city_id.chars().any(char::is_control) {
        Err(LineError::InvalidCityId)
    } else {
        Ok(city_id)
    }
}

/// Parse a timestamp in any of the accepted formats.
///
/// Accepts Unix seconds (integer or fractional), RFC 3339, ISO 8601 date-times with a compact
/// offset, and the naive formats in [NAIVE_FORMATS], which are taken as UTC.
pub fn parse_timestamp(timestamp: &str) -> Result<OffsetDateTime, LineError> {
    let invalid = || LineError::InvalidTimestamp(timestamp.to_string());
    if let Ok(seconds) = timestamp.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(seconds).map_err(|_| invalid());
    }
    if let Ok(seconds) = timestamp.parse::<f64>() {
        if !seconds.is_finite() {
            return Err(invalid());
        }
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9).round() as i128;
        return OffsetDateTime::from_unix_timestamp_nanos(whole as i128 * 1_000_000_000 + nanos)
            .map_err(|_| invalid());
    }
    if let Ok(datetime) = OffsetDateTime::parse(timestamp, &Rfc3339) {
        return Ok(datetime);
    }
    if let Ok(datetime) = OffsetDateTime::parse(timestamp, COMPACT_OFFSET_FORMAT) {
        return Ok(datetime);
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| PrimitiveDateTime::parse(timestamp, format).ok())
        .map(PrimitiveDateTime::assume_utc)
        .ok_or_else(invalid)
}

/// Result of processing one chunk
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkOutcome {
    /// One partial aggregate per city, ordered by city id
    pub partials: Vec<PartialAggregate>,
    pub valid_lines: u64,
    pub invalid_lines: u64,
    /// Sample of invalid line messages with 1-based line numbers within the chunk
    pub errors: Vec<String>,
}

/// Parse and reduce the bytes of one chunk.
///
/// Blank lines count as neither valid nor invalid. The result depends only on the input bytes, so
/// processing the same range twice yields the same partial aggregates.
pub fn process_bytes(
    upload_id: UploadId,
    chunk_index: u32,
    data: &[u8],
    rules: &ParseRules,
) -> Result<ChunkOutcome, IngestError> {
    let mut cities: BTreeMap<String, Stats> = BTreeMap::new();
    let mut outcome = ChunkOutcome::default();
    for (number, line) in data.split(|b| *b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let parsed = match std::str::from_utf8(line) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => parse_line(line, rules),
            Err(_) => Err(LineError::NotUtf8),
        };
        match parsed {
            Ok(reading) => {
                outcome.valid_lines += 1;
                cities
                    .entry(reading.city_id)
                    .or_default()
                    .push(reading.temperature);
            }
            Err(err) => {
                outcome.invalid_lines += 1;
                if outcome.errors.len() < rules.error_sample_limit {
                    outcome.errors.push(format!("line {}: {}", number + 1, err));
                }
            }
        }
    }

    let total = outcome.valid_lines + outcome.invalid_lines;
    if total > 0 && outcome.invalid_lines as f64 / total as f64 > rules.invalid_line_threshold {
        return Err(IngestError::ChunkValidation {
            invalid: outcome.invalid_lines,
            total,
            threshold_pct: (rules.invalid_line_threshold * 10000.0).round() / 100.0,
        });
    }

    outcome.partials = cities
        .into_iter()
        .map(|(city_id, stats)| PartialAggregate {
            upload_id,
            chunk_index,
            city_id,
            stats,
        })
        .collect();
    Ok(outcome)
}

/// Reads chunks from the blob store and reduces them
pub struct ChunkProcessor {
    blob_store: Arc<dyn BlobStore>,
    resource_manager: Arc<ResourceManager>,
    rules: ParseRules,
    use_rayon: bool,
}

impl ChunkProcessor {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        resource_manager: Arc<ResourceManager>,
        rules: ParseRules,
        use_rayon: bool,
    ) -> Self {
        ChunkProcessor {
            blob_store,
            resource_manager,
            rules,
            use_rayon,
        }
    }

    /// Read exactly the chunk's byte range and reduce it.
    ///
    /// The header line of the upload is skipped when processing the first chunk.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(upload_id = %chunk.upload_id, index = chunk.index))]
    pub async fn process(&self, upload: &Upload, chunk: &Chunk) -> Result<ChunkOutcome, IngestError> {
        let _mem_permits = self
            .resource_manager
            .chunk_memory(usize::try_from(chunk.length)?)
            .await?;
        let data = self
            .blob_store
            .read(chunk.upload_id, chunk.offset, chunk.length)
            .await?;
        let skip = if chunk.offset == 0 {
            usize::try_from(upload.header_len.min(chunk.length))?
        } else {
            0
        };
        let data = data.slice(skip..);
        let outcome = if self.use_rayon {
            let _task_permit = self.resource_manager.parse_task().await?;
            let rules = self.rules.clone();
            let (upload_id, index) = (chunk.upload_id, chunk.index);
            tokio_rayon::spawn(move || process_bytes(upload_id, index, &data, &rules)).await?
        } else {
            process_bytes(chunk.upload_id, chunk.index, &data, &self.rules)?
        };
        if !outcome.errors.is_empty() {
            tracing::debug!(
                "{} invalid lines in chunk, first: {}",
                outcome.invalid_lines,
                outcome.errors[0]
            );
        }
        Ok(outcome)
    }

    /// Process a chunk held in memory, for benchmarks and tests.
    pub fn process_slice(
        &self,
        upload_id: UploadId,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkOutcome, IngestError> {
        process_bytes(upload_id, chunk_index, &data, &self.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::models::{ChunkRange, FileRef};
    use uuid::Uuid;

    fn rules() -> ParseRules {
        ParseRules::default()
    }

    #[test]
    fn valid_line() {
        let reading = parse_line("NYC, 21.5 ,2024-01-15T10:30:00Z", &rules()).unwrap();
        assert_eq!("NYC", reading.city_id);
        assert_eq!(2150, reading.temperature);
        assert_eq!(1705314600, reading.timestamp.unix_timestamp());
    }

    #[test]
    fn extra_columns_ignored() {
        let reading = parse_line("LON,-3,1700000000,station 4,extra", &rules()).unwrap();
        assert_eq!(-300, reading.temperature);
    }

    #[test]
    fn invalid_lines() {
        let rules = rules();
        assert_eq!(
            Err(LineError::TooFewColumns(2)),
            parse_line("NYC,12", &rules)
        );
        assert_eq!(
            Err(LineError::EmptyCityId),
            parse_line(" ,12,1700000000", &rules)
        );
        assert_eq!(
            Err(LineError::CityIdTooLong),
            parse_line(&format!("{},12,1700000000", "x".repeat(101)), &rules)
        );
        assert_eq!(
            Err(LineError::InvalidCityId),
            parse_line("NY\u{0}C,12,1700000000", &rules)
        );
        assert_eq!(
            Err(LineError::InvalidTemperature("warm".to_string())),
            parse_line("NYC,warm,1700000000", &rules)
        );
        assert_eq!(
            Err(LineError::InvalidTemperature("NaN".to_string())),
            parse_line("NYC,NaN,1700000000", &rules)
        );
        assert!(matches!(
            parse_line("NYC,100.5,1700000000", &rules),
            Err(LineError::TemperatureOutOfRange { .. })
        ));
        assert_eq!(
            Err(LineError::InvalidTimestamp("yesterday".to_string())),
            parse_line("NYC,12,yesterday", &rules)
        );
    }

    #[test]
    fn range_is_inclusive() {
        let rules = rules();
        assert!(parse_line("NYC,-100,1700000000", &rules).is_ok());
        assert!(parse_line("NYC,100,1700000000", &rules).is_ok());
    }

    #[test]
    fn timestamp_formats() {
        let expected = 1705314600;
        for timestamp in [
            "1705314600",
            "1705314600.0",
            "2024-01-15T10:30:00Z",
            "2024-01-15T11:30:00+01:00",
            "2024-01-15T11:30:00+0100",
            "2024-01-15T10:30:00",
            "2024-01-15T10:30:00.000",
            "2024-01-15 10:30:00",
            "2024-01-15 10:30:00.5",
            "15/01/2024 10:30:00",
            "01/15/2024 10:30:00",
        ] {
            let parsed = parse_timestamp(timestamp)
                .unwrap_or_else(|err| panic!("{timestamp}: {err}"));
            assert_eq!(expected, parsed.unix_timestamp(), "{timestamp}");
        }
        let fractional = parse_timestamp("1705314600.25").unwrap();
        assert_eq!(250_000_000, fractional.nanosecond());
    }

    #[test]
    fn chunk_reduction() {
        let data = b"NYC,10,1700000000\r\nLON,5,1700000000\n\n  \nNYC,20,1700000001\nbad\nNYC,30,1700000002";
        let id = Uuid::new_v4();
        let outcome = process_bytes(id, 3, data, &rules()).unwrap();
        assert_eq!(4, outcome.valid_lines);
        assert_eq!(1, outcome.invalid_lines);
        assert_eq!(
            vec!["line 6: expected at least 3 columns, found 1".to_string()],
            outcome.errors
        );
        assert_eq!(2, outcome.partials.len());
        let lon = &outcome.partials[0];
        assert_eq!(("LON", 3, id), (lon.city_id.as_str(), lon.chunk_index, lon.upload_id));
        assert_eq!(1, lon.stats.count);
        let nyc = &outcome.partials[1];
        assert_eq!(3, nyc.stats.count);
        assert_eq!(6000, nyc.stats.sum);
        assert_eq!(1000, nyc.stats.min);
        assert_eq!(3000, nyc.stats.max);
    }

    #[test]
    fn reprocessing_is_deterministic() {
        let data = b"B,1,1700000000\nA,2,1700000000\nB,3,1700000000\n";
        let id = Uuid::new_v4();
        assert_eq!(
            process_bytes(id, 0, data, &rules()).unwrap(),
            process_bytes(id, 0, data, &rules()).unwrap()
        );
    }

    #[test]
    fn threshold_exceeded() {
        // 4 of 10 lines invalid against a 30% threshold.
        let mut data = String::new();
        for i in 0..6 {
            data.push_str(&format!("NYC,{i},1700000000\n"));
        }
        for _ in 0..4 {
            data.push_str("NYC,not-a-number,1700000000\n");
        }
        let err = process_bytes(Uuid::new_v4(), 0, data.as_bytes(), &rules()).unwrap_err();
        match err {
            IngestError::ChunkValidation {
                invalid,
                total,
                threshold_pct,
            } => {
                assert_eq!((4, 10, 30.0), (invalid, total, threshold_pct));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        // Exactly 30% invalid is accepted.
        let data = b"a,1,1700000000\nb,2,1700000000\nc,3,1700000000\nd,4,1700000000\ne,5,1700000000\nf,6,1700000000\ng,7,1700000000\nx\ny\nz\n";
        let outcome = process_bytes(Uuid::new_v4(), 0, data, &rules()).unwrap();
        assert_eq!(3, outcome.invalid_lines);
    }

    #[test]
    fn error_sample_is_bounded() {
        let rules = ParseRules {
            invalid_line_threshold: 1.0,
            error_sample_limit: 2,
            ..rules()
        };
        let outcome = process_bytes(Uuid::new_v4(), 0, b"x\ny\nz\n", &rules).unwrap();
        assert_eq!(3, outcome.invalid_lines);
        assert_eq!(2, outcome.errors.len());
        assert!(outcome.partials.is_empty());
    }

    #[test]
    fn invalid_utf8() {
        let rules = ParseRules {
            invalid_line_threshold: 1.0,
            ..rules()
        };
        let outcome = process_bytes(Uuid::new_v4(), 0, b"\xff\xfe,1,2\n", &rules).unwrap();
        assert_eq!(1, outcome.invalid_lines);
        assert_eq!(vec!["line 1: line is not valid UTF-8".to_string()], outcome.errors);
    }

    async fn process_from_store(use_rayon: bool) {
        let data = b"city_id,temp,timestamp\nNYC,10,1700000000\nNYC,20,1700000000\n";
        let store = Arc::new(MemoryBlobStore::new());
        let file_ref = FileRef::reserve("nyc.csv");
        store
            .put(file_ref.upload_id, Bytes::from_static(data))
            .await
            .unwrap();
        let mut upload = Upload::new(&file_ref, "alice", data.len() as u64, OffsetDateTime::now_utc());
        upload.header_len = 23;
        let processor = ChunkProcessor::new(
            store,
            Arc::new(ResourceManager::new(None, Some(1 << 20), Some(1))),
            rules(),
            use_rayon,
        );
        let first = Chunk::queued(
            upload.id,
            &ChunkRange {
                index: 0,
                offset: 0,
                length: 41,
            },
            OffsetDateTime::now_utc(),
        );
        let outcome = processor.process(&upload, &first).await.unwrap();
        assert_eq!((1, 0), (outcome.valid_lines, outcome.invalid_lines));
        assert_eq!(1000, outcome.partials[0].stats.sum);

        let second = Chunk::queued(
            upload.id,
            &ChunkRange {
                index: 1,
                offset: 41,
                length: 18,
            },
            OffsetDateTime::now_utc(),
        );
        let outcome = processor.process(&upload, &second).await.unwrap();
        assert_eq!(1, outcome.valid_lines);
        assert_eq!(2000, outcome.partials[0].stats.sum);
    }

    #[tokio::test]
    async fn process_chunk() {
        process_from_store(false).await;
    }

    #[tokio::test]
    async fn process_chunk_rayon() {
        process_from_store(true).await;
    }
}
