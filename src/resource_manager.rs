//! Limits on the resources held by chunks being processed.
//!
//! Chunk workers take permits before reading a chunk's bytes, before each request to the S3
//! endpoint and before handing a chunk to the parsing thread pool. Permits are released when
//! dropped.

use crate::error::IngestError;

use tokio::sync::{Semaphore, SemaphorePermit};

/// A fixed number of permits
#[derive(Debug)]
struct Pool {
    permits: Semaphore,
    size: usize,
}

impl Pool {
    fn new(size: usize) -> Self {
        Pool {
            permits: Semaphore::new(size),
            size,
        }
    }

    async fn take(&self, n: usize) -> Result<SemaphorePermit<'_>, IngestError> {
        Ok(self.permits.acquire_many(n.try_into()?).await?)
    }
}

/// Bounds shared by every chunk worker. An absent limit means the resource is unlimited.
#[derive(Debug)]
pub struct ResourceManager {
    /// Concurrent requests to the S3 endpoint
    s3_connections: Option<Pool>,
    /// Bytes of chunk data held in memory
    chunk_memory: Option<Pool>,
    /// Chunks being parsed on the thread pool at once
    parse_tasks: Option<Pool>,
}

impl ResourceManager {
    pub fn new(
        s3_connection_limit: Option<usize>,
        chunk_memory_limit: Option<usize>,
        parse_task_limit: Option<usize>,
    ) -> Self {
        Self {
            s3_connections: s3_connection_limit.map(Pool::new),
            chunk_memory: chunk_memory_limit.map(Pool::new),
            parse_tasks: parse_task_limit.map(Pool::new),
        }
    }

    /// Wait for a free S3 connection.
    pub async fn s3_connection(&self) -> Result<Option<SemaphorePermit>, IngestError> {
        take(&self.s3_connections, 1).await
    }

    /// Reserve memory for a chunk of `length` bytes, waiting until other chunks release enough.
    ///
    /// A chunk larger than the whole budget could never be admitted, so it fails at once with
    /// [IngestError::InsufficientMemory].
    pub async fn chunk_memory(&self, length: usize) -> Result<Option<SemaphorePermit>, IngestError> {
        if let Some(pool) = &self.chunk_memory {
            if length > pool.size {
                return Err(IngestError::InsufficientMemory {
                    requested: length,
                    total: pool.size,
                });
            }
        }
        take(&self.chunk_memory, length).await
    }

    /// Wait for a slot on the parsing thread pool.
    pub async fn parse_task(&self) -> Result<Option<SemaphorePermit>, IngestError> {
        take(&self.parse_tasks, 1).await
    }
}

async fn take(pool: &Option<Pool>, n: usize) -> Result<Option<SemaphorePermit>, IngestError> {
    match pool {
        Some(pool) => pool.take(n).await.map(Some),
        None => Ok(None),
    }
}
