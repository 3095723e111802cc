//! # Indexing Metadata Tracker
//!
//! Maintains `last_index`, `last_link_index` and `last_link` on entity rows.
//! An entity is stale for the indexer when `last_index < last_write` and needs
//! linking when `last_link < last_write`. These are metadata-only patches;
//! version arrays are never touched here.

use crate::error::StoreResult;
use crate::model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId};
use crate::store::{EntityPatch, LinkMark, StorageBackend, WriteOp, WriteSet};
use crate::version::{Version, NEVER};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

pub struct IndexingTracker {
    backend: Arc<dyn StorageBackend>,
    page_size: usize,
}

impl IndexingTracker {
    pub fn new(backend: Arc<dyn StorageBackend>, page_size: usize) -> Self {
        Self {
            backend,
            page_size: page_size.max(1),
        }
    }

    /// Record that each entity was indexed at the `last_write` the indexer saw.
    ///
    /// Entities written again since are left stale. Returns how many rows were marked.
    #[instrument(skip(self, ids), level = "debug")]
    pub fn mark_as_indexed(
        &self,
        ids: &BTreeMap<EntitySetId, BTreeMap<EntityKeyId, Version>>,
    ) -> StoreResult<usize> {
        let mut writes = WriteSet::new();
        let mut count = 0;
        for (entity_set_id, entities) in ids {
            for (entity_key_id, last_write) in entities {
                let key = EntityDataKey::new(*entity_set_id, *entity_key_id);
                let current = self.backend.get_entity(&key)?;
                if current.is_some_and(|row| row.last_write == *last_write) {
                    count += 1;
                }
                writes.push(WriteOp::PatchEntity(
                    key,
                    EntityPatch {
                        last_index: Some(*last_write),
                        if_last_write: Some(*last_write),
                        ..Default::default()
                    },
                ));
            }
        }
        self.backend.apply(writes)?;
        debug!(count, "marked entities as indexed");
        Ok(count)
    }

    /// Force the indexer to pick these entities up again.
    #[instrument(skip(self, ids), level = "debug")]
    pub fn mark_needs_indexing(
        &self,
        ids: &BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
    ) -> StoreResult<usize> {
        let keys = ids.iter().flat_map(|(entity_set_id, keys)| {
            keys.iter()
                .map(move |entity_key_id| EntityDataKey::new(*entity_set_id, *entity_key_id))
        });
        self.patch_all(
            keys,
            EntityPatch {
                last_index: Some(NEVER),
                ..Default::default()
            },
        )
    }

    /// Stamp `last_link_index` on every member of each linking id.
    #[instrument(skip(self, linking_ids), level = "debug")]
    pub fn mark_linking_ids_as_indexed(
        &self,
        linking_ids: &BTreeMap<LinkingId, Version>,
    ) -> StoreResult<usize> {
        let mut writes = WriteSet::new();
        for (linking_id, indexed_at) in linking_ids {
            for row in self.backend.entities_with_linking_id(*linking_id)? {
                if row.linked_to(None) != Some(*linking_id) {
                    continue;
                }
                writes.push(WriteOp::PatchEntity(
                    row.key(),
                    EntityPatch {
                        last_link_index: Some(*indexed_at),
                        ..Default::default()
                    },
                ));
            }
        }
        let count = writes.len();
        self.backend.apply(writes)?;
        Ok(count)
    }

    /// Reset `last_link` so the linker treats these entities as unlinked.
    #[instrument(skip(self, keys), level = "debug")]
    pub fn mark_needs_to_be_linked(&self, keys: &[EntityDataKey]) -> StoreResult<usize> {
        self.patch_all(
            keys.iter().copied(),
            EntityPatch {
                last_link: Some(LinkMark::Reset),
                ..Default::default()
            },
        )
    }

    /// Mark entities as linked up to their current `last_write`.
    #[instrument(skip(self, keys), level = "debug")]
    pub fn mark_as_linked(&self, keys: &[EntityDataKey]) -> StoreResult<usize> {
        self.patch_all(
            keys.iter().copied(),
            EntityPatch {
                last_link: Some(LinkMark::CaughtUp),
                ..Default::default()
            },
        )
    }

    /// Live entities of a set whose index is older than their last write.
    pub fn entities_needing_indexing(
        &self,
        entity_set_id: EntitySetId,
        limit: usize,
    ) -> StoreResult<Vec<EntityDataKey>> {
        let mut out = Vec::new();
        let mut after = None;
        while out.len() < limit {
            let page = self
                .backend
                .scan_entities(entity_set_id, after, self.page_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.entity_key_id);
            out.extend(
                page.iter()
                    .filter(|row| row.needs_indexing())
                    .map(|row| row.key())
                    .take(limit - out.len()),
            );
        }
        Ok(out)
    }

    fn patch_all(
        &self,
        keys: impl Iterator<Item = EntityDataKey>,
        patch: EntityPatch,
    ) -> StoreResult<usize> {
        let mut writes = WriteSet::new();
        for key in keys {
            writes.push(WriteOp::PatchEntity(key, patch.clone()));
        }
        let count = writes.len();
        self.backend.apply(writes)?;
        Ok(count)
    }
}
