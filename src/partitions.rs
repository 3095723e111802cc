//! # Partition Resolver
//!
//! Maps an entity set to its partition list and partitions version, and an
//! entity key to one partition of that list. New entity sets receive a default
//! assignment on first use. Repartitioning installs a new list under the next
//! partitions version; rows already written keep the partition they were
//! routed to.

use crate::error::{StoreError, StoreResult};
use crate::model::{EntityKeyId, EntitySetId};
use crate::store::{PartitionAssignment, StorageBackend, WriteOp, WriteSet};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::{debug, info};

/// Route an entity key to one of `partitions`.
///
/// The list is sorted before indexing, so the result depends only on the set
/// of partitions and never on the order the caller supplies them in.
pub fn route_partition(entity_key_id: EntityKeyId, partitions: &[i32]) -> i32 {
    if partitions.is_empty() {
        return 0;
    }
    let mut sorted = partitions.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = FxHasher::default();
    hasher.write(entity_key_id.as_bytes());
    let index = (hasher.finish() % sorted.len() as u64) as usize;
    sorted[index]
}

pub struct PartitionResolver {
    backend: Arc<dyn StorageBackend>,
    default_partition_count: usize,
    cache: RwLock<HashMap<EntitySetId, PartitionAssignment>>,
    /// Held for reading across validate-and-commit, for writing by repartition.
    epoch_gate: RwLock<()>,
    init_lock: Mutex<()>,
}

impl PartitionResolver {
    pub fn new(backend: Arc<dyn StorageBackend>, default_partition_count: usize) -> Self {
        Self {
            backend,
            default_partition_count: default_partition_count.max(1),
            cache: RwLock::new(HashMap::new()),
            epoch_gate: RwLock::new(()),
            init_lock: Mutex::new(()),
        }
    }

    /// Current assignment of `entity_set_id`, creating the default one if absent.
    pub fn partitions_for(&self, entity_set_id: EntitySetId) -> StoreResult<PartitionAssignment> {
        if let Some(assignment) = self.cache.read().get(&entity_set_id) {
            return Ok(assignment.clone());
        }
        let _init = self.init_lock.lock();
        if let Some(assignment) = self.backend.partition_assignment(entity_set_id)? {
            self.cache.write().insert(entity_set_id, assignment.clone());
            return Ok(assignment);
        }

        let assignment = PartitionAssignment {
            partitions: (0..self.default_partition_count as i32).collect(),
            version: 1,
        };
        let mut writes = WriteSet::new();
        writes.push(WriteOp::PutPartitions(entity_set_id, assignment.clone()));
        self.backend.apply(writes)?;
        debug!(%entity_set_id, count = assignment.partitions.len(), "assigned default partitions");
        self.cache.write().insert(entity_set_id, assignment.clone());
        Ok(assignment)
    }

    /// Partition of one entity key under the set's current assignment.
    pub fn partition_of(
        &self,
        entity_set_id: EntitySetId,
        entity_key_id: EntityKeyId,
    ) -> StoreResult<i32> {
        let assignment = self.partitions_for(entity_set_id)?;
        Ok(route_partition(entity_key_id, &assignment.partitions))
    }

    /// Install a new partition list under the next partitions version.
    pub fn repartition(
        &self,
        entity_set_id: EntitySetId,
        partitions: Vec<i32>,
    ) -> StoreResult<PartitionAssignment> {
        let mut partitions = partitions;
        partitions.sort_unstable();
        partitions.dedup();
        if partitions.is_empty() || partitions.iter().any(|partition| *partition < 0) {
            return Err(StoreError::InvalidPartitions {
                entity_set_id,
                reason: "partition list must be non-empty and non-negative".to_string(),
            });
        }

        let current = self.partitions_for(entity_set_id)?;
        let _gate = self.epoch_gate.write();
        let assignment = PartitionAssignment {
            partitions,
            version: current.version + 1,
        };
        let mut writes = WriteSet::new();
        writes.push(WriteOp::PutPartitions(entity_set_id, assignment.clone()));
        self.backend.apply(writes)?;
        self.cache.write().insert(entity_set_id, assignment.clone());
        info!(
            %entity_set_id,
            version = assignment.version,
            count = assignment.partitions.len(),
            "repartitioned entity set"
        );
        Ok(assignment)
    }

    /// Apply `writes` only if the set is still at `expected_version`.
    ///
    /// Repartition cannot interleave between the check and the write.
    pub fn commit_at(
        &self,
        entity_set_id: EntitySetId,
        expected_version: i32,
        writes: WriteSet,
    ) -> StoreResult<()> {
        let _gate = self.epoch_gate.read();
        let actual = self
            .cache
            .read()
            .get(&entity_set_id)
            .map(|assignment| assignment.version);
        let actual = match actual {
            Some(version) => version,
            None => self.partitions_for(entity_set_id)?.version,
        };
        if actual != expected_version {
            return Err(StoreError::PartitionsVersionConflict {
                entity_set_id,
                expected: expected_version,
                actual,
            });
        }
        self.backend.apply(writes)?;
        Ok(())
    }
}
