//! Merging of partial aggregates into per-upload city aggregates.

use crate::error::IngestError;
use crate::metrics::{DUPLICATE_MERGES, MERGE_RETRIES};
use crate::models::{CityAggregate, PartialAggregate};
use crate::record_store::RecordStore;

/// Result of merging one partial aggregate
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    /// The partial aggregate was folded into the returned aggregate
    Applied(CityAggregate),
    /// The chunk had already been merged; the stored aggregate is returned unchanged
    AlreadyMerged(CityAggregate),
}

impl MergeOutcome {
    pub fn aggregate(&self) -> &CityAggregate {
        match self {
            MergeOutcome::Applied(aggregate) | MergeOutcome::AlreadyMerged(aggregate) => aggregate,
        }
    }
}

/// Fold a partial aggregate into the current city aggregate.
///
/// Returns `None` if the partial's chunk is already recorded as merged.
pub fn fold(current: Option<&CityAggregate>, partial: &PartialAggregate) -> Option<CityAggregate> {
    let mut next = current
        .cloned()
        .unwrap_or_else(|| CityAggregate::empty(partial.upload_id, &partial.city_id));
    if !next.merged_chunks.insert(partial.chunk_index) {
        return None;
    }
    next.stats = next.stats.merge(partial.stats);
    next.version += 1;
    Some(next)
}

/// Merges partial aggregates with compare-and-swap on the stored city aggregate
#[derive(Clone)]
pub struct AggregateMerger {
    store: RecordStore,
    max_attempts: u32,
}

impl AggregateMerger {
    pub fn new(store: RecordStore, max_attempts: u32) -> Self {
        AggregateMerger {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Merge one partial aggregate into its upload's city aggregate.
    ///
    /// A swap that loses a race is retried at once against the new state, up to the configured
    /// number of attempts, after which [IngestError::MergeConflict] is returned.
    #[tracing::instrument(level = "DEBUG", skip_all, fields(city_id = %partial.city_id, chunk = partial.chunk_index))]
    pub fn merge(&self, partial: &PartialAggregate) -> Result<MergeOutcome, IngestError> {
        for attempt in 1..=self.max_attempts {
            let snapshot = self
                .store
                .get_city_aggregate(&partial.city_id, partial.upload_id)?;
            let current = snapshot.as_ref().map(|snapshot| &snapshot.value);
            let Some(next) = fold(current, partial) else {
                DUPLICATE_MERGES.inc();
                tracing::debug!("Chunk already merged");
                return Ok(MergeOutcome::AlreadyMerged(
                    current.cloned().unwrap_or_else(|| {
                        CityAggregate::empty(partial.upload_id, &partial.city_id)
                    }),
                ));
            };
            if self.store.swap_city_aggregate(snapshot.as_ref(), &next)? {
                return Ok(MergeOutcome::Applied(next));
            }
            MERGE_RETRIES.inc();
            tracing::debug!("Merge attempt {} lost a race", attempt);
        }
        Err(IngestError::MergeConflict {
            city_id: partial.city_id.clone(),
            attempts: self.max_attempts,
        })
    }

    /// Merge the partial aggregates of a chunk, returning the number applied.
    pub fn merge_all(&self, partials: &[PartialAggregate]) -> Result<usize, IngestError> {
        let mut applied = 0;
        for partial in partials {
            if let MergeOutcome::Applied(_) = self.merge(partial)? {
                applied += 1;
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::Stats;
    use uuid::Uuid;

    fn partial(upload_id: Uuid, index: u32, temps: &[i64]) -> PartialAggregate {
        PartialAggregate {
            upload_id,
            chunk_index: index,
            city_id: "NYC".to_string(),
            stats: temps.iter().copied().collect(),
        }
    }

    #[test]
    fn fold_is_idempotent_per_chunk() {
        let id = Uuid::new_v4();
        let first = fold(None, &partial(id, 0, &[1000, 2000])).unwrap();
        assert_eq!(1, first.version);
        assert_eq!(2, first.stats.count);
        assert_eq!(None, fold(Some(&first), &partial(id, 0, &[1000, 2000])));
        let second = fold(Some(&first), &partial(id, 1, &[-500])).unwrap();
        assert_eq!(2, second.version);
        assert_eq!(
            [1000, 2000, -500].into_iter().collect::<Stats>(),
            second.stats
        );
        assert_eq!(vec![0, 1], second.merged_chunks.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn merge_applies_once() {
        let store = RecordStore::temporary().unwrap();
        let merger = AggregateMerger::new(store.clone(), 4);
        let id = Uuid::new_v4();
        let outcome = merger.merge(&partial(id, 0, &[1000])).unwrap();
        assert!(matches!(outcome, MergeOutcome::Applied(_)));
        let outcome = merger.merge(&partial(id, 0, &[1000])).unwrap();
        assert!(matches!(outcome, MergeOutcome::AlreadyMerged(_)));
        assert_eq!(1, outcome.aggregate().stats.count);
        let stored = store.get_city_aggregate("NYC", id).unwrap().unwrap().value;
        assert_eq!(1, stored.version);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let id = Uuid::new_v4();
        let partials = [
            partial(id, 0, &[1000, 2000]),
            partial(id, 1, &[3000]),
            partial(id, 2, &[-400, 50]),
        ];
        let forward = RecordStore::temporary().unwrap();
        AggregateMerger::new(forward.clone(), 4)
            .merge_all(&partials)
            .unwrap();
        let reverse = RecordStore::temporary().unwrap();
        let mut reversed = partials.to_vec();
        reversed.reverse();
        AggregateMerger::new(reverse.clone(), 4)
            .merge_all(&reversed)
            .unwrap();
        let a = forward.get_city_aggregate("NYC", id).unwrap().unwrap().value;
        let b = reverse.get_city_aggregate("NYC", id).unwrap().unwrap().value;
        assert_eq!(a, b);
        assert_eq!(5, a.stats.count);
    }

    #[test]
    fn concurrent_merges_are_serialised() {
        let store = RecordStore::temporary().unwrap();
        let id = Uuid::new_v4();
        let handles: Vec<_> = (0..8u32)
            .map(|index| {
                let merger = AggregateMerger::new(store.clone(), 1000);
                std::thread::spawn(move || {
                    merger.merge(&partial(id, index, &[100 * i64::from(index)]))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        let aggregate = store.get_city_aggregate("NYC", id).unwrap().unwrap().value;
        assert_eq!(8, aggregate.stats.count);
        assert_eq!(2800, aggregate.stats.sum);
        assert_eq!(8, aggregate.version);
        assert_eq!(8, aggregate.merged_chunks.len());
    }
}
