//! Bounded cache of prefetched query results.

use std::collections::VecDeque;

use hashbrown::HashMap;

use hornet_common::ids::{FragmentId, PartitionId, TxnId};
use hornet_engine::value::RowSet;

type CacheKey = (TxnId, FragmentId, PartitionId, u64);

/// Per-partition cache keyed by (txn, fragment, partition, param-hash).
///
/// Eviction is FIFO over insertions; entries also go away when their
/// transaction finishes.
#[derive(Debug)]
pub struct QueryCache {
    entries: HashMap<CacheKey, RowSet>,
    order: VecDeque<CacheKey>,
    capacity: usize,
}

impl QueryCache {
    /// Creates a cache bounded to `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Stores one prefetched result.
    pub fn add_result(
        &mut self,
        txn_id: TxnId,
        fragment: FragmentId,
        partition: PartitionId,
        param_hash: u64,
        rows: RowSet,
    ) {
        let key = (txn_id, fragment, partition, param_hash);
        if self.entries.insert(key, rows).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            let _ = self.entries.remove(&oldest);
        }
    }

    /// Looks up a prefetched result.
    #[must_use]
    pub fn get_result(
        &self,
        txn_id: TxnId,
        fragment: FragmentId,
        partition: PartitionId,
        param_hash: u64,
    ) -> Option<&RowSet> {
        self.entries.get(&(txn_id, fragment, partition, param_hash))
    }

    /// Drops every entry belonging to a finished transaction.
    pub fn purge_transaction(&mut self, txn_id: TxnId) {
        self.entries.retain(|key, _| key.0 != txn_id);
        self.order.retain(|key| key.0 != txn_id);
    }

    /// Number of cached results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
