//! Canonical identifier types used across the executor, engine, and transaction crates.

/// Numeric partition identifier inside a cluster.
pub type PartitionId = u16;

/// Numeric site identifier. A site hosts one executor per local partition.
pub type SiteId = u16;

/// Monotonic transaction identifier allocated by the transaction initializer.
///
/// Ids are globally ordered; the lock queue releases transactions to partitions
/// in id order, which is what makes cross-partition serialization work.
pub type TxnId = u64;

/// Opaque client request handle echoed back on the response.
pub type ClientHandle = u64;

/// Catalog identifier of a table.
pub type TableId = u32;

/// Catalog identifier of a stored procedure.
pub type ProcedureId = u32;

/// Catalog identifier of a plan fragment.
pub type FragmentId = u32;

/// Identifier of an output/input dependency edge inside one batch.
pub type DependencyId = u32;

/// Engine undo token. Signed so the sentinels below stay representable.
pub type UndoToken = i64;

/// Sentinel for "no token has been assigned yet".
pub const NULL_UNDO_TOKEN: UndoToken = -1;

/// Sentinel for "execute without undo logging".
pub const DISABLE_UNDO_TOKEN: UndoToken = i64::MAX;

/// Strongly typed partition-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u16);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero because the cluster always requires at least one
    /// owning partition.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Ordered, deduplicated set of partition ids.
///
/// Small enough to keep as a sorted vector: predicted partition sets rarely
/// exceed a handful of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSet {
    partitions: Vec<PartitionId>,
}

impl PartitionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding a single partition.
    #[must_use]
    pub fn singleton(partition: PartitionId) -> Self {
        Self {
            partitions: vec![partition],
        }
    }

    /// Inserts one partition. Returns `false` when it was already present.
    pub fn insert(&mut self, partition: PartitionId) -> bool {
        match self.partitions.binary_search(&partition) {
            Ok(_) => false,
            Err(position) => {
                self.partitions.insert(position, partition);
                true
            }
        }
    }

    /// Returns whether the partition is in the set.
    #[must_use]
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.partitions.binary_search(&partition).is_ok()
    }

    /// Returns whether the set covers every id in `other`.
    #[must_use]
    pub fn is_superset_of(&self, other: &PartitionSet) -> bool {
        other.iter().all(|partition| self.contains(partition))
    }

    /// Merges all ids from `other` into this set.
    pub fn extend_from(&mut self, other: &PartitionSet) {
        for partition in other.iter() {
            let _ = self.insert(partition);
        }
    }

    /// Number of partitions in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Iterates partitions in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.partitions.iter().copied()
    }
}

impl FromIterator<PartitionId> for PartitionSet {
    fn from_iter<I: IntoIterator<Item = PartitionId>>(iter: I) -> Self {
        let mut set = Self::new();
        for partition in iter {
            let _ = set.insert(partition);
        }
        set
    }
}

/// Returns the site hosting a partition when partitions are striped evenly
/// across sites.
#[must_use]
pub fn site_for_partition(partition: PartitionId, partitions_per_site: u16) -> SiteId {
    if partitions_per_site == 0 {
        return 0;
    }
    partition / partitions_per_site
}
