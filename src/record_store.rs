//! Durable keyed records of the pipeline, kept in a sled database.
//!
//! Four trees hold the records, each value serialised as JSON:
//!
//! * `uploads`: upload id
//! * `chunks`: upload id ‖ chunk index (big endian)
//! * `partials`: upload id ‖ chunk index ‖ city id
//! * `city_aggregates`: city id ‖ 0x00 ‖ upload id
//!
//! Big endian indices keep a prefix scan in chunk order. City ids never contain NUL, so the
//! separator keeps one city's aggregates contiguous.
//!
//! Single records are updated with compare-and-swap. Invariants spanning an upload and its chunks
//! are maintained in sled transactions over the `uploads` and `chunks` trees, see
//! [RecordStore::transaction].

use std::collections::BTreeSet;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, Transactional,
};
use sled::{Db, IVec, Tree};

use crate::error::IngestError;
use crate::models::{Chunk, CityAggregate, PartialAggregate, Upload, UploadId};

/// Result of an operation inside a [RecordStore::transaction].
pub type TxResult<T> = Result<T, ConflictableTransactionError<IngestError>>;

/// Abort the enclosing transaction with an error.
pub fn abort<E: Into<IngestError>>(error: E) -> ConflictableTransactionError<IngestError> {
    ConflictableTransactionError::Abort(error.into())
}

/// A record together with the stored bytes it was decoded from.
///
/// Passing the snapshot back to a compare-and-swap makes the swap succeed only if nobody wrote
/// the record in between.
#[derive(Clone, Debug)]
pub struct Snapshot<T> {
    pub value: T,
    raw: IVec,
}

/// Durable record store
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
    uploads: Tree,
    chunks: Tree,
    partials: Tree,
    city_aggregates: Tree,
}

impl RecordStore {
    /// Open or create the database in a directory.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        tracing::info!("Opening record store at {}", path.display());
        Self::from_db(sled::open(path)?)
    }

    /// Create a database that is removed when dropped.
    pub fn temporary() -> Result<Self, IngestError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, IngestError> {
        Ok(RecordStore {
            uploads: db.open_tree("uploads")?,
            chunks: db.open_tree("chunks")?,
            partials: db.open_tree("partials")?,
            city_aggregates: db.open_tree("city_aggregates")?,
            db,
        })
    }

    /// Return a number greater than any returned before, across restarts.
    pub fn next_version(&self) -> Result<u64, IngestError> {
        // generate_id starts at 0, which cache stores treat as "never written".
        Ok(self.db.generate_id()? + 1)
    }

    /// Flush dirty buffers to disk.
    pub async fn flush(&self) -> Result<(), IngestError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Create an upload record unless one already exists with the same id.
    ///
    /// Returns the stored record and whether this call created it.
    pub fn insert_upload(&self, upload: &Upload) -> Result<(Upload, bool), IngestError> {
        let key = upload.id.as_bytes();
        match self
            .uploads
            .compare_and_swap(key, None as Option<&[u8]>, Some(encode(upload)?))?
        {
            Ok(()) => Ok((upload.clone(), true)),
            Err(err) => {
                let current = err.current.ok_or_else(|| IngestError::CorruptRecord {
                    key: upload_key_name(upload.id),
                })?;
                Ok((decode(&upload_key_name(upload.id), &current)?, false))
            }
        }
    }

    pub fn get_upload(&self, upload_id: UploadId) -> Result<Option<Upload>, IngestError> {
        self.uploads
            .get(upload_id.as_bytes())?
            .map(|raw| decode(&upload_key_name(upload_id), &raw))
            .transpose()
    }

    /// Return an upload, failing with [IngestError::UploadNotFound] if it does not exist.
    pub fn upload(&self, upload_id: UploadId) -> Result<Upload, IngestError> {
        self.get_upload(upload_id)?
            .ok_or(IngestError::UploadNotFound(upload_id))
    }

    pub fn list_uploads(&self) -> Result<Vec<Upload>, IngestError> {
        self.uploads
            .iter()
            .map(|entry| {
                let (key, raw) = entry?;
                decode(&format!("uploads/{key:?}"), &raw)
            })
            .collect()
    }

    pub fn get_chunk(&self, upload_id: UploadId, index: u32) -> Result<Option<Chunk>, IngestError> {
        self.chunks
            .get(chunk_key(upload_id, index))?
            .map(|raw| decode(&chunk_key_name(upload_id, index), &raw))
            .transpose()
    }

    /// Return the chunks of an upload in index order.
    pub fn list_chunks(&self, upload_id: UploadId) -> Result<Vec<Chunk>, IngestError> {
        self.chunks
            .scan_prefix(upload_id.as_bytes())
            .map(|entry| {
                let (_, raw) = entry?;
                decode(&format!("chunks/{upload_id}"), &raw)
            })
            .collect()
    }

    /// Store a partial aggregate unless one exists with the same identity.
    ///
    /// Partial aggregates are immutable, so a second write of the same identity is dropped.
    /// Returns true if this call stored the record.
    pub fn put_partial(&self, partial: &PartialAggregate) -> Result<bool, IngestError> {
        let key = partial_key(partial.upload_id, partial.chunk_index, &partial.city_id);
        Ok(self
            .partials
            .compare_and_swap(key, None as Option<&[u8]>, Some(encode(partial)?))?
            .is_ok())
    }

    /// Return the partial aggregates of one chunk.
    pub fn list_partials(
        &self,
        upload_id: UploadId,
        index: u32,
    ) -> Result<Vec<PartialAggregate>, IngestError> {
        self.partials
            .scan_prefix(chunk_key(upload_id, index))
            .map(|entry| {
                let (_, raw) = entry?;
                decode(&chunk_key_name(upload_id, index), &raw)
            })
            .collect()
    }

    /// Return the cities with readings in any chunk of an upload.
    pub fn upload_cities(&self, upload_id: UploadId) -> Result<BTreeSet<String>, IngestError> {
        let prefix_len = upload_id.as_bytes().len() + 4;
        self.partials
            .scan_prefix(upload_id.as_bytes())
            .keys()
            .map(|key| {
                let key = key?;
                String::from_utf8(key[prefix_len..].to_vec()).map_err(|_| {
                    IngestError::CorruptRecord {
                        key: format!("partials/{upload_id}"),
                    }
                })
            })
            .collect()
    }

    pub fn get_city_aggregate(
        &self,
        city_id: &str,
        upload_id: UploadId,
    ) -> Result<Option<Snapshot<CityAggregate>>, IngestError> {
        self.city_aggregates
            .get(city_aggregate_key(city_id, upload_id))?
            .map(|raw| {
                Ok(Snapshot {
                    value: decode(&city_aggregate_key_name(city_id, upload_id), &raw)?,
                    raw,
                })
            })
            .transpose()
    }

    /// Replace a city aggregate if the stored record still matches `current`.
    ///
    /// `current` is `None` when the aggregate did not exist at read time. Returns false if the
    /// record changed since it was read.
    pub fn swap_city_aggregate(
        &self,
        current: Option<&Snapshot<CityAggregate>>,
        new: &CityAggregate,
    ) -> Result<bool, IngestError> {
        let key = city_aggregate_key(&new.city_id, new.upload_id);
        Ok(self
            .city_aggregates
            .compare_and_swap(
                key,
                current.map(|snapshot| snapshot.raw.clone()),
                Some(encode(new)?),
            )?
            .is_ok())
    }

    /// Return the aggregates of a city across all uploads.
    pub fn list_city_aggregates(&self, city_id: &str) -> Result<Vec<CityAggregate>, IngestError> {
        self.city_aggregates
            .scan_prefix(city_prefix(city_id))
            .map(|entry| {
                let (_, raw) = entry?;
                decode(&format!("city_aggregates/{city_id}"), &raw)
            })
            .collect()
    }

    /// Return every city with an aggregate.
    pub fn list_cities(&self) -> Result<BTreeSet<String>, IngestError> {
        let mut cities = BTreeSet::new();
        for key in self.city_aggregates.iter().keys() {
            let key = key?;
            let end = key.iter().position(|b| *b == 0).unwrap_or(key.len());
            let city = std::str::from_utf8(&key[..end]).map_err(|_| IngestError::CorruptRecord {
                key: format!("city_aggregates/{key:?}"),
            })?;
            cities.insert(city.to_string());
        }
        Ok(cities)
    }

    /// Run `f` atomically over the upload and chunk records.
    ///
    /// sled may run `f` more than once when transactions conflict, so it must not have side
    /// effects outside the transaction. Aborting with an error returns that error.
    pub fn transaction<F, R>(&self, f: F) -> Result<R, IngestError>
    where
        F: Fn(&UploadTxn) -> TxResult<R>,
    {
        (&self.uploads, &self.chunks)
            .transaction(|(uploads, chunks)| f(&UploadTxn { uploads, chunks }))
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => IngestError::TransientStore(err),
            })
    }
}

/// View of the upload and chunk records inside a transaction
pub struct UploadTxn<'a> {
    uploads: &'a TransactionalTree,
    chunks: &'a TransactionalTree,
}

impl UploadTxn<'_> {
    /// Return an upload, aborting with [IngestError::UploadNotFound] if it does not exist.
    pub fn upload(&self, upload_id: UploadId) -> TxResult<Upload> {
        let raw = self
            .uploads
            .get(upload_id.as_bytes())?
            .ok_or_else(|| abort(IngestError::UploadNotFound(upload_id)))?;
        decode(&upload_key_name(upload_id), &raw).map_err(abort)
    }

    pub fn put_upload(&self, upload: &Upload) -> TxResult<()> {
        self.uploads
            .insert(&upload.id.as_bytes()[..], encode(upload).map_err(abort)?)?;
        Ok(())
    }

    pub fn chunk(&self, upload_id: UploadId, index: u32) -> TxResult<Option<Chunk>> {
        self.chunks
            .get(chunk_key(upload_id, index))?
            .map(|raw| decode(&chunk_key_name(upload_id, index), &raw).map_err(abort))
            .transpose()
    }

    pub fn put_chunk(&self, chunk: &Chunk) -> TxResult<()> {
        self.chunks.insert(
            chunk_key(chunk.upload_id, chunk.index),
            encode(chunk).map_err(abort)?,
        )?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, IngestError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(key: &str, raw: &[u8]) -> Result<T, IngestError> {
    serde_json::from_slice(raw).map_err(|err| {
        tracing::error!("Failed to decode record {}: {}", key, err);
        IngestError::CorruptRecord {
            key: key.to_string(),
        }
    })
}

fn chunk_key(upload_id: UploadId, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(upload_id.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn partial_key(upload_id: UploadId, index: u32, city_id: &str) -> Vec<u8> {
    let mut key = chunk_key(upload_id, index);
    key.extend_from_slice(city_id.as_bytes());
    key
}

fn city_prefix(city_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(city_id.len() + 17);
    key.extend_from_slice(city_id.as_bytes());
    key.push(0);
    key
}

fn city_aggregate_key(city_id: &str, upload_id: UploadId) -> Vec<u8> {
    let mut key = city_prefix(city_id);
    key.extend_from_slice(upload_id.as_bytes());
    key
}

fn upload_key_name(upload_id: UploadId) -> String {
    format!("uploads/{upload_id}")
}

fn chunk_key_name(upload_id: UploadId, index: u32) -> String {
    format!("chunks/{upload_id}/{index}")
}

fn city_aggregate_key_name(city_id: &str, upload_id: UploadId) -> String {
    format!("city_aggregates/{city_id}/{upload_id}")
}
