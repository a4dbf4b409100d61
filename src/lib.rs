//! This crate provides a service that ingests large files of timestamped temperature readings and
//! maintains per-city statistics over them.
//!
//! An uploaded file is split into line-aligned chunks which are parsed and reduced in parallel.
//! Each chunk produces one partial aggregate per city, and partial aggregates are merged into
//! per-upload city aggregates. Every step is driven by tasks that may be delivered more than once,
//! and every effect is keyed so that a repeated delivery changes nothing. An upload is reported
//! completed only once every chunk has been durably merged, and the merged statistics are
//! published to a versioned read cache.
//!
//! The service is built on top of a number of open source components.
//!
//! * [Tokio](tokio), the most popular asynchronous Rust runtime.
//! * [Axum](axum) web framework, built by the Tokio team, on top of the [hyper] HTTP library.
//! * [sled], an embedded database holding the uploads, chunks and aggregates.
//! * [Serde](serde) performs (de)serialisation of records, tasks and JSON responses.
//! * [AWS SDK for S3](aws-sdk-s3) is used to read uploaded files from S3-compatible object stores.
//! * [cached] provides the in-memory and on-disk statistics caches.

pub mod aggregate_merger;
pub mod app;
pub mod blob_store;
pub mod cache_store;
pub mod cache_sync;
pub mod chunk_processor;
pub mod chunk_splitter;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod models;
pub mod operations;
pub mod pipeline;
pub mod record_store;
pub mod resource_manager;
pub mod s3_client;
pub mod server;
pub mod task_queue;
#[cfg(test)]
pub mod test_utils;
pub mod tracing;
pub mod upload_state;
pub mod validated_query;
