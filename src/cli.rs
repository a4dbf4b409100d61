//! Command Line Interface (CLI) arguments.

use clap::{Parser, ValueEnum};

/// Where uploaded files are kept
#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum BlobStoreKind {
    /// Files on the local filesystem
    Fs,
    /// Objects in an S3-compatible object store
    S3,
}

/// Thermocline command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "THERMOCLINE_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "THERMOCLINE_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "THERMOCLINE_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/thermocline/certs/cert.pem",
        env = "THERMOCLINE_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/thermocline/certs/key.pem",
        env = "THERMOCLINE_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "THERMOCLINE_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "THERMOCLINE_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for parsing chunks.
    #[arg(long, default_value_t = false, env = "THERMOCLINE_USE_RAYON")]
    pub use_rayon: bool,
    /// Directory holding the record database
    #[arg(
        long,
        default_value = "~/.local/share/thermocline",
        env = "THERMOCLINE_DATA_DIR"
    )]
    pub data_dir: String,
    /// Backend for uploaded files
    #[arg(long, value_enum, default_value_t = BlobStoreKind::Fs, env = "THERMOCLINE_BLOB_STORE")]
    pub blob_store: BlobStoreKind,
    /// Directory for uploaded files when using the filesystem blob store, defaults to
    /// `<data-dir>/blobs`
    #[arg(long, env = "THERMOCLINE_BLOB_DIR")]
    pub blob_dir: Option<String>,
    /// URL of the S3-compatible object store
    #[arg(long, env = "THERMOCLINE_S3_URL")]
    pub s3_url: Option<String>,
    /// Bucket holding uploaded files
    #[arg(long, env = "THERMOCLINE_S3_BUCKET")]
    pub s3_bucket: Option<String>,
    /// Prefix of the object keys of uploaded files
    #[arg(long, default_value = "uploads/", env = "THERMOCLINE_S3_PREFIX")]
    pub s3_prefix: String,
    /// S3 access key
    #[arg(long, env = "THERMOCLINE_S3_ACCESS_KEY")]
    pub s3_access_key: Option<String>,
    /// S3 secret key
    #[arg(long, env = "THERMOCLINE_S3_SECRET_KEY")]
    pub s3_secret_key: Option<String>,
    /// Maximum number of simultaneous S3 connections
    #[arg(long, env = "THERMOCLINE_S3_CONNECTION_LIMIT")]
    pub s3_connection_limit: Option<usize>,
    /// Directory for an on-disk statistics cache, in memory if unset
    #[arg(long, env = "THERMOCLINE_CACHE_PATH")]
    pub cache_path: Option<String>,
    /// Target chunk size, e.g. "1 MiB"
    #[arg(long, default_value = "1 MiB", env = "THERMOCLINE_CHUNK_SIZE")]
    pub chunk_size: String,
    /// Memory limit for chunk data held in flight, e.g. "512 MiB"
    #[arg(long, env = "THERMOCLINE_MEMORY_LIMIT")]
    pub memory_limit: Option<String>,
    /// Largest fraction of invalid lines a chunk may contain
    #[arg(long, default_value_t = 0.3, env = "THERMOCLINE_INVALID_LINE_THRESHOLD")]
    pub invalid_line_threshold: f64,
    /// Number of processing attempts of a chunk before it fails permanently
    #[arg(long, default_value_t = 3, env = "THERMOCLINE_CHUNK_ATTEMPTS")]
    pub chunk_attempts: u32,
    /// Number of deliveries of a task before it is dead-lettered
    #[arg(long, default_value_t = 5, env = "THERMOCLINE_TASK_ATTEMPTS")]
    pub task_attempts: u32,
    /// Base delay in milliseconds before a failed task is delivered again
    #[arg(long, default_value_t = 1000, env = "THERMOCLINE_RETRY_BACKOFF_MS")]
    pub retry_backoff_ms: u64,
    /// Maximum delay in milliseconds before a failed task is delivered again
    #[arg(long, default_value_t = 300_000, env = "THERMOCLINE_RETRY_BACKOFF_MAX_MS")]
    pub retry_backoff_max_ms: u64,
    /// Number of compare-and-swap attempts of one aggregate merge
    #[arg(long, default_value_t = 16, env = "THERMOCLINE_MERGE_ATTEMPTS")]
    pub merge_attempts: u32,
    /// Number of attempts of one cache write
    #[arg(long, default_value_t = 3, env = "THERMOCLINE_CACHE_WRITE_ATTEMPTS")]
    pub cache_write_attempts: u32,
    /// Deadline in seconds for a chunk task to report an outcome
    #[arg(long, default_value_t = 300, env = "THERMOCLINE_CHUNK_TIMEOUT")]
    pub chunk_timeout: u64,
    /// Publish statistics after every N chunk completions, 0 to publish on completion only
    #[arg(long, default_value_t = 0, env = "THERMOCLINE_CACHE_PUBLISH_EVERY")]
    pub cache_publish_every: u32,
    /// Interval in seconds between full cache reconciliations, 0 to disable
    #[arg(long, default_value_t = 0, env = "THERMOCLINE_CACHE_REFRESH_INTERVAL")]
    pub cache_refresh_interval: u64,
    /// Number of workers of the file processing queue
    #[arg(long, default_value_t = 1, env = "THERMOCLINE_DISPATCH_WORKERS")]
    pub dispatch_workers: usize,
    /// Number of workers of the chunk processing queue, defaults to the number of CPUs - 1
    #[arg(long, env = "THERMOCLINE_CHUNK_WORKERS")]
    pub chunk_workers: Option<usize>,
    /// Number of workers of the cache update queue
    #[arg(long, default_value_t = 1, env = "THERMOCLINE_CACHE_WORKERS")]
    pub cache_workers: usize,
    /// Lowest plausible temperature in degrees Celsius
    #[arg(long, default_value_t = -100.0, allow_hyphen_values = true, env = "THERMOCLINE_MIN_TEMPERATURE")]
    pub min_temperature: f64,
    /// Highest plausible temperature in degrees Celsius
    #[arg(long, default_value_t = 100.0, env = "THERMOCLINE_MAX_TEMPERATURE")]
    pub max_temperature: f64,
    /// Number of invalid line messages kept per chunk
    #[arg(long, default_value_t = 100, env = "THERMOCLINE_ERROR_SAMPLE_LIMIT")]
    pub error_sample_limit: usize,
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
