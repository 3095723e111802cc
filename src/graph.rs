//! # Association Graph
//!
//! Edges connect a source and a destination entity through an association
//! entity. Edges carry their own version array so a clear leaves a tombstone
//! while a delete removes the edge row.

use crate::error::StoreResult;
use crate::model::{EntityDataKey, EntitySetId, WriteEvent};
use crate::store::{AssociationEdge, EdgeKey, StorageBackend, WriteOp, WriteSet};
use crate::version::VersionClock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Restricts which edges `edges_touching` returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    /// Only edges whose source is in one of these sets.
    pub src_entity_sets: Option<BTreeSet<EntitySetId>>,
    /// Only edges whose destination is in one of these sets.
    pub dst_entity_sets: Option<BTreeSet<EntitySetId>>,
    /// Include edges whose latest version is a tombstone.
    pub include_cleared: bool,
}

impl EdgeFilter {
    fn accepts(&self, edge: &AssociationEdge) -> bool {
        if !self.include_cleared && !edge.is_live(None) {
            return false;
        }
        let in_sets = |sets: &Option<BTreeSet<EntitySetId>>, key: &EntityDataKey| {
            sets.as_ref()
                .map_or(true, |sets| sets.contains(&key.entity_set_id))
        };
        in_sets(&self.src_entity_sets, &edge.src) && in_sets(&self.dst_entity_sets, &edge.dst)
    }
}

pub struct GraphService {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn VersionClock>,
}

impl GraphService {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn VersionClock>) -> Self {
        Self { backend, clock }
    }

    /// Create (or revive) edges at a fresh version.
    #[instrument(skip(self, edges), level = "debug")]
    pub fn create_edges(&self, edges: &[EdgeKey]) -> StoreResult<WriteEvent> {
        let version = self.clock.next_version();
        let mut writes = WriteSet::new();
        for edge in edges {
            writes.push(WriteOp::AppendEdgeVersion(*edge, version));
        }
        self.backend.apply(writes)?;
        Ok(WriteEvent::new(version, edges.len()))
    }

    /// Edges touching any of `keys` as source, destination or edge entity.
    pub fn edges_touching(
        &self,
        keys: &[EntityDataKey],
        filter: &EdgeFilter,
    ) -> StoreResult<Vec<AssociationEdge>> {
        let mut edges = BTreeMap::new();
        for key in keys {
            for edge in self.backend.edges_touching(key)? {
                if filter.accepts(&edge) {
                    edges.insert(edge.key(), edge);
                }
            }
        }
        Ok(edges.into_values().collect())
    }

    /// Tombstone edges at a fresh version.
    #[instrument(skip(self, edges), level = "debug")]
    pub fn clear_edges(&self, edges: &[EdgeKey]) -> StoreResult<WriteEvent> {
        let version = self.clock.next_version();
        let mut writes = WriteSet::new();
        for edge in edges {
            writes.push(WriteOp::AppendEdgeVersion(*edge, -version.abs()));
        }
        self.backend.apply(writes)?;
        debug!(count = edges.len(), version, "cleared edges");
        Ok(WriteEvent::new(version, edges.len()))
    }

    #[instrument(skip(self, edges), level = "debug")]
    pub fn delete_edges(&self, edges: &[EdgeKey]) -> StoreResult<WriteEvent> {
        let version = self.clock.next_version();
        let mut writes = WriteSet::new();
        for edge in edges {
            writes.push(WriteOp::DeleteEdge(*edge));
        }
        self.backend.apply(writes)?;
        debug!(count = edges.len(), "deleted edges");
        Ok(WriteEvent::new(version, edges.len()))
    }
}
