//! Undo-token allocation and the per-round token decision table.

use hornet_common::config::ExecutorConfig;
use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{
    DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN, PartitionId, UndoToken,
};
use hornet_txn::arena::TxnSlot;

/// Monotonic undo-token source for one partition.
#[derive(Debug)]
pub struct UndoTokenManager {
    partition_id: PartitionId,
    last_undo_token: UndoToken,
    last_committed: UndoToken,
}

impl UndoTokenManager {
    /// Creates the manager with the partition's token range seed.
    #[must_use]
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            last_undo_token: i64::from(partition_id) * 1_000_000,
            last_committed: NULL_UNDO_TOKEN,
        }
    }

    /// Partition this manager allocates for.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Last token handed out.
    #[must_use]
    pub fn last_undo_token(&self) -> UndoToken {
        self.last_undo_token
    }

    /// Last token committed at this partition.
    #[must_use]
    pub fn last_committed(&self) -> UndoToken {
        self.last_committed
    }

    /// Allocates a fresh token.
    pub fn next(&mut self) -> UndoToken {
        self.last_undo_token += 1;
        self.last_undo_token
    }

    /// Records a committed token.
    ///
    /// # Errors
    ///
    /// Returns an error when the token does not strictly increase over the
    /// last committed one; the caller treats that as fatal.
    pub fn note_committed(&mut self, token: UndoToken) -> HornetResult<()> {
        if token <= self.last_committed {
            return Err(HornetError::EngineFault(format!(
                "commit token {token} is not above last committed {}",
                self.last_committed
            )));
        }
        self.last_committed = token;
        Ok(())
    }

    /// Picks the token for a transaction's next execution round at this
    /// partition.
    ///
    /// Speculative rounds always take a fresh token. Read-only rounds reuse
    /// the prior token, or run with undo logging disabled when there is none.
    /// Write rounds take a fresh token on the first round, for any
    /// multi-partition transaction, and under the force-undo configuration;
    /// otherwise they reuse the prior token, unless the estimator declares the
    /// remainder safe enough to turn logging off entirely.
    pub fn calculate_next(
        &mut self,
        txn: &TxnSlot,
        partition: PartitionId,
        read_only: bool,
        config: &ExecutorConfig,
    ) -> UndoToken {
        let last_token = txn.last_undo_token(partition);
        let single_partition = txn.predict_single_partition();

        let mut token = if txn.is_speculative() {
            self.next()
        } else if read_only {
            if last_token == NULL_UNDO_TOKEN {
                DISABLE_UNDO_TOKEN
            } else {
                last_token
            }
        } else if last_token == NULL_UNDO_TOKEN || !single_partition || config.force_undo_logging {
            self.next()
        } else if let TxnSlot::Local(local) = txn
            && let Some(estimate) = local.remainder_estimate()
        {
            if !config.allow_undo_logging_disable
                || !estimate.valid
                || estimate.abortable
                || !estimate.read_only_remainder
            {
                last_token
            } else {
                DISABLE_UNDO_TOKEN
            }
        } else {
            last_token
        };

        // Tokens never move backwards relative to what this partition already
        // handed out.
        if token < self.last_undo_token {
            token = self.last_undo_token;
        }
        token
    }
}
