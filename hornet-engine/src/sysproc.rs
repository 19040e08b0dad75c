//! Registry of system-procedure plan fragments.
//!
//! Populated once during boot, then shared read-only by every executor in the
//! process. Sysproc fragments run against this registry instead of the storage
//! engine.

use std::sync::Arc;

use hashbrown::HashMap;

use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{FragmentId, TxnId};

use crate::engine::EngineError;
use crate::value::{ParameterSet, RowSet};

/// One system-procedure fragment implementation.
pub trait SysprocFragment: Send + Sync {
    /// Executes the fragment for the given transaction.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the fragment aborts.
    fn execute(
        &self,
        txn_id: TxnId,
        params: &ParameterSet,
        inputs: &[RowSet],
    ) -> Result<RowSet, EngineError>;
}

/// Process-wide fragment-id → sysproc handler table.
#[derive(Default)]
pub struct SysprocRegistry {
    handlers: HashMap<FragmentId, Arc<dyn SysprocFragment>>,
}

impl SysprocRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fragment handler.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment id is already registered.
    pub fn register(
        &mut self,
        fragment: FragmentId,
        handler: Arc<dyn SysprocFragment>,
    ) -> HornetResult<()> {
        if self.handlers.contains_key(&fragment) {
            return Err(HornetError::InvalidConfig(
                "sysproc fragment registered twice",
            ));
        }
        let _ = self.handlers.insert(fragment, handler);
        Ok(())
    }

    /// Looks up the handler for a fragment id.
    #[must_use]
    pub fn get(&self, fragment: FragmentId) -> Option<&Arc<dyn SysprocFragment>> {
        self.handlers.get(&fragment)
    }
}
