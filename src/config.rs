//! Pipeline settings derived from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use byte_unit::Byte;
use expanduser::expanduser;
use url::Url;
use validator::{Validate, ValidationError};

use crate::cli::{BlobStoreKind, CommandLineArgs};
use crate::error::IngestError;

/// Backend holding uploaded files
#[derive(Clone, Debug, PartialEq)]
pub enum BlobStoreSettings {
    /// One file per upload under `root`
    Fs { root: PathBuf },
    /// One object per upload named `<prefix><upload id>`
    S3 {
        url: Url,
        bucket: String,
        prefix: String,
        access_key: Option<String>,
        secret_key: Option<String>,
    },
}

/// Validated settings of the ingestion pipeline
#[derive(Clone, Debug, Validate)]
#[validate(schema(function = "validate_settings"))]
pub struct Settings {
    /// Directory of the record database
    pub data_dir: PathBuf,
    pub blob_store: BlobStoreSettings,
    /// Directory of an on-disk statistics cache, in memory if `None`
    pub cache_path: Option<PathBuf>,
    /// Target chunk size in bytes
    #[validate(range(min = 1))]
    pub chunk_size: u64,
    /// Largest fraction of invalid lines a chunk may contain
    #[validate(range(min = 0.0, max = 1.0))]
    pub invalid_line_threshold: f64,
    #[validate(range(min = 1))]
    pub chunk_attempts: u32,
    #[validate(range(min = 1))]
    pub task_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    #[validate(range(min = 1))]
    pub merge_attempts: u32,
    #[validate(range(min = 1))]
    pub cache_write_attempts: u32,
    pub chunk_timeout: Duration,
    /// Publish statistics after every N chunk completions, 0 to disable
    pub cache_publish_every: u32,
    /// Interval of full cache reconciliation, `None` to disable
    pub cache_refresh_interval: Option<Duration>,
    #[validate(range(min = 1))]
    pub dispatch_workers: usize,
    #[validate(range(min = 1))]
    pub chunk_workers: usize,
    #[validate(range(min = 1))]
    pub cache_workers: usize,
    pub min_temperature: f64,
    pub max_temperature: f64,
    pub error_sample_limit: usize,
    pub use_rayon: bool,
    /// Memory limit in bytes for chunk data held in flight
    pub memory_limit: Option<usize>,
    pub s3_connection_limit: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = PathBuf::from("thermocline-data");
        Settings {
            blob_store: BlobStoreSettings::Fs {
                root: data_dir.join("blobs"),
            },
            data_dir,
            cache_path: None,
            chunk_size: 1024 * 1024,
            invalid_line_threshold: 0.3,
            chunk_attempts: 3,
            task_attempts: 5,
            retry_backoff: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(300_000),
            merge_attempts: 16,
            cache_write_attempts: 3,
            chunk_timeout: Duration::from_secs(300),
            cache_publish_every: 0,
            cache_refresh_interval: None,
            dispatch_workers: 1,
            chunk_workers: default_chunk_workers(),
            cache_workers: 1,
            min_temperature: -100.0,
            max_temperature: 100.0,
            error_sample_limit: 100,
            use_rayon: false,
            memory_limit: None,
            s3_connection_limit: None,
        }
    }
}

impl Settings {
    /// Build and validate settings from command line arguments.
    pub fn from_args(args: &CommandLineArgs) -> Result<Self, IngestError> {
        let data_dir = expand_path(&args.data_dir)?;
        let blob_store = match args.blob_store {
            BlobStoreKind::Fs => BlobStoreSettings::Fs {
                root: match &args.blob_dir {
                    Some(dir) => expand_path(dir)?,
                    None => data_dir.join("blobs"),
                },
            },
            BlobStoreKind::S3 => {
                let url = args.s3_url.as_deref().ok_or_else(|| {
                    IngestError::InvalidSettings("--s3-url is required for the S3 blob store".into())
                })?;
                let url = Url::parse(url)
                    .map_err(|err| IngestError::InvalidSettings(format!("--s3-url: {err}")))?;
                let bucket = args.s3_bucket.clone().ok_or_else(|| {
                    IngestError::InvalidSettings(
                        "--s3-bucket is required for the S3 blob store".into(),
                    )
                })?;
                BlobStoreSettings::S3 {
                    url,
                    bucket,
                    prefix: args.s3_prefix.clone(),
                    access_key: args.s3_access_key.clone(),
                    secret_key: args.s3_secret_key.clone(),
                }
            }
        };
        let memory_limit = match &args.memory_limit {
            Some(limit) => Some(usize::try_from(parse_size(limit, "--memory-limit")?)?),
            None => None,
        };
        let settings = Settings {
            data_dir,
            blob_store,
            cache_path: args.cache_path.as_deref().map(expand_path).transpose()?,
            chunk_size: parse_size(&args.chunk_size, "--chunk-size")?,
            invalid_line_threshold: args.invalid_line_threshold,
            chunk_attempts: args.chunk_attempts,
            task_attempts: args.task_attempts,
            retry_backoff: Duration::from_millis(args.retry_backoff_ms),
            retry_backoff_max: Duration::from_millis(args.retry_backoff_max_ms),
            merge_attempts: args.merge_attempts,
            cache_write_attempts: args.cache_write_attempts,
            chunk_timeout: Duration::from_secs(args.chunk_timeout),
            cache_publish_every: args.cache_publish_every,
            cache_refresh_interval: (args.cache_refresh_interval > 0)
                .then(|| Duration::from_secs(args.cache_refresh_interval)),
            dispatch_workers: args.dispatch_workers,
            chunk_workers: args.chunk_workers.unwrap_or_else(default_chunk_workers),
            cache_workers: args.cache_workers,
            min_temperature: args.min_temperature,
            max_temperature: args.max_temperature,
            error_sample_limit: args.error_sample_limit,
            use_rayon: args.use_rayon,
            memory_limit,
            s3_connection_limit: args.s3_connection_limit,
        };
        settings.check()?;
        Ok(settings)
    }

    /// Validate the settings.
    pub fn check(&self) -> Result<(), IngestError> {
        self.validate()
            .map_err(|err| IngestError::InvalidSettings(err.to_string()))
    }

    /// Path of the record database.
    pub fn database_path(&self) -> &Path {
        &self.data_dir
    }
}

/// One worker per CPU, leaving one for the dispatcher and the API.
fn default_chunk_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn expand_path(path: &str) -> Result<PathBuf, IngestError> {
    expanduser(path).map_err(|err| IngestError::InvalidSettings(format!("{path}: {err}")))
}

fn parse_size(size: &str, option: &str) -> Result<u64, IngestError> {
    Byte::parse_str(size, /* ignore case */ true)
        .map(|bytes| bytes.as_u64())
        .map_err(|err| IngestError::InvalidSettings(format!("{option}: {err}")))
}

fn validate_settings(settings: &Settings) -> Result<(), ValidationError> {
    if !(settings.min_temperature < settings.max_temperature) {
        let mut error = ValidationError::new("temperature_range");
        error.message = Some("min_temperature must be less than max_temperature".into());
        return Err(error);
    }
    // The queue must deliver a chunk task at least as often as the chunk may be attempted.
    if settings.task_attempts < settings.chunk_attempts {
        let mut error = ValidationError::new("task_attempts");
        error.message = Some("task_attempts must not be less than chunk_attempts".into());
        return Err(error);
    }
    if settings.retry_backoff > settings.retry_backoff_max {
        let mut error = ValidationError::new("retry_backoff");
        error.message = Some("retry backoff must not exceed its maximum".into());
        return Err(error);
    }
    Ok(())
}
