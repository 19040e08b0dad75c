//! Coordinator seam and same-site peer routing.

use hashbrown::HashMap;

use hornet_common::error::{HornetError, HornetResult, Status};
use hornet_common::ids::{PartitionId, PartitionSet, SiteId, TxnId, site_for_partition};
use hornet_txn::work::{TransactionWorkRequest, WorkResult, WorkResultSender};

use crate::messages::InternalMessage;
use crate::work_queue::WorkSender;

/// RPC surface toward other sites, consumed by one executor.
///
/// Calls are fire-and-forget; results come back through the typed one-shot
/// senders handed over with each request.
pub trait Coordinator {
    /// Ships a batched work request to a remote site. Results for each
    /// contained fragment arrive on `results`.
    ///
    /// # Errors
    ///
    /// Returns an error when the site is unreachable.
    fn transaction_work(
        &mut self,
        request: TransactionWorkRequest,
        target_site: SiteId,
        results: WorkResultSender,
    ) -> HornetResult<()>;

    /// Starts 2PC phase one at the given partitions.
    ///
    /// # Errors
    ///
    /// Returns an error when the prepare cannot be delivered.
    fn transaction_prepare(&mut self, txn_id: TxnId, partitions: &PartitionSet) -> HornetResult<()>;

    /// Delivers the terminal commit/abort decision to every touched
    /// partition. `requeue` asks the transaction system to re-execute the
    /// transaction afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the finish cannot be delivered.
    fn transaction_finish(&mut self, txn_id: TxnId, status: Status, requeue: bool)
    -> HornetResult<()>;

    /// Forwards a prefetch result to the transaction's base partition.
    ///
    /// # Errors
    ///
    /// Returns an error when the result cannot be delivered.
    fn transaction_prefetch_result(&mut self, txn_id: TxnId, result: WorkResult)
    -> HornetResult<()>;

    /// Last resort: an invariant broke and the whole cluster must stop.
    fn shutdown_cluster(&mut self, error: HornetError);
}

/// Work-queue senders for the executors co-located on this site.
#[derive(Debug, Default, Clone)]
pub struct PeerExecutorMap {
    partitions_per_site: u16,
    senders: HashMap<PartitionId, WorkSender>,
}

impl PeerExecutorMap {
    /// Creates an empty map for a site layout.
    #[must_use]
    pub fn new(partitions_per_site: u16) -> Self {
        Self {
            partitions_per_site,
            senders: HashMap::new(),
        }
    }

    /// Registers the work-queue sender of a peer executor.
    pub fn register(&mut self, partition: PartitionId, sender: WorkSender) {
        let _ = self.senders.insert(partition, sender);
    }

    /// Site hosting the given partition.
    #[must_use]
    pub fn site_of(&self, partition: PartitionId) -> SiteId {
        site_for_partition(partition, self.partitions_per_site)
    }

    /// Whether the partition lives on the same site as `local_partition`.
    #[must_use]
    pub fn is_local_site(&self, local_partition: PartitionId, partition: PartitionId) -> bool {
        self.site_of(local_partition) == self.site_of(partition)
    }

    /// Enqueues a message on a peer executor's work queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the peer is unknown or gone.
    pub fn queue_to(&self, partition: PartitionId, message: InternalMessage) -> HornetResult<()> {
        let Some(sender) = self.senders.get(&partition) else {
            return Err(HornetError::InvalidState("no peer executor for partition"));
        };
        sender.send(message)
    }
}
