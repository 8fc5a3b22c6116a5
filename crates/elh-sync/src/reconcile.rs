use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use elh_core::{CollectionKey, Record};
use elh_storage::{CheckpointError, CheckpointStore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Stored,
    /// Same index delivered again this run; the slot was overwritten with the new record.
    Redelivered,
    /// The collection is gone or the index is outside its reference sequence.
    Rejected,
}

/// Folds completed fetches of one collection into the checkpoint.
///
/// One reconciler exists per collection batch and is driven by a single task, so writes
/// into `items` never race. Every accepted completion is persisted before `apply` returns.
pub struct Reconciler {
    store: Arc<CheckpointStore>,
    key: CollectionKey,
    metadata: BTreeMap<String, String>,
    delivered: HashSet<usize>,
}

impl Reconciler {
    /// `metadata` is collection-level data discovered during this run; it is merged into
    /// entries that are still unset.
    pub fn new(
        store: Arc<CheckpointStore>,
        key: CollectionKey,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            store,
            key,
            metadata,
            delivered: HashSet::new(),
        }
    }

    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    pub fn delivered(&self) -> usize {
        self.delivered.len()
    }

    pub async fn apply(&mut self, index: usize, record: Record) -> Result<Applied, CheckpointError> {
        let key = &self.key;
        let metadata = &self.metadata;
        let accepted = self
            .store
            .update(|file| {
                let Some(state) = file.collections.get_mut(key) else {
                    return false;
                };
                if index >= state.refs.len() {
                    return false;
                }
                if state.items.len() < state.refs.len() {
                    state.align_items();
                }
                state.items[index] = record;
                state.merge_metadata(metadata);
                true
            })
            .await;

        if !accepted {
            warn!(collection = %self.key, index, "completion has no slot in the checkpoint, not stored");
            return Ok(Applied::Rejected);
        }

        let first_delivery = self.delivered.insert(index);
        let outcome = self.store.persist().await?;
        debug!(collection = %self.key, index, ?outcome, "completion reconciled");

        Ok(if first_delivery {
            Applied::Stored
        } else {
            Applied::Redelivered
        })
    }
}
