//! # Property Store
//!
//! Versioned writes, tombstones and hard deletes of entity and property rows.
//!
//! Each versioned call draws one version from the clock, locks the affected
//! entity rows in key order, stages every row change in memory and commits a
//! single [`WriteSet`]. Re-submitting a call with the same version is a no-op because
//! version arrays only ever gain entries they do not already hold.

use crate::blob::{blob_key, BlobStore};
use crate::catalog::AuthorizedPropertyTypes;
use crate::config::defaults;
use crate::error::{StoreError, StoreResult};
use crate::locks::LockTable;
use crate::model::{
    EntityDataKey, EntityKeyId, EntityProperties, EntitySetId, PropertyTypeId, PropertyValue,
    ValueHash, WriteEvent,
};
use crate::partitions::{route_partition, PartitionResolver};
use crate::store::{
    EntityRow, PartitionAssignment, PropertyRow, StorageBackend, StoredValue, WriteOp, WriteSet,
};
use crate::version::{Version, VersionClock, NEVER};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Entities submitted to a write call, keyed by entity key id.
pub type EntityBatch = HashMap<EntityKeyId, EntityProperties>;

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    pub lock_timeout: Duration,
    /// Entity keys per hard-delete statement, capped at [`defaults::MAX_DELETE_CHUNK_SIZE`].
    pub delete_chunk_size: usize,
    pub blob_delete_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(defaults::DEFAULT_LOCK_TIMEOUT_MS),
            delete_chunk_size: defaults::DEFAULT_DELETE_CHUNK_SIZE,
            blob_delete_batch_size: defaults::DEFAULT_BLOB_DELETE_BATCH_SIZE,
        }
    }
}

impl StoreOptions {
    fn chunk_size(&self) -> usize {
        self.delete_chunk_size.clamp(1, defaults::MAX_DELETE_CHUNK_SIZE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplaceMode {
    None,
    /// Tombstone only the property types present in the payload.
    Partial,
    /// Tombstone every authorized property type.
    Full,
}

struct PendingBlob {
    key: String,
    bytes: Vec<u8>,
    content_type: String,
}

/// One entity and its property rows, loaded under lock and mutated in memory.
struct StagedEntity {
    row: EntityRow,
    existed: bool,
    entity_dirty: bool,
    properties: BTreeMap<(PropertyTypeId, ValueHash), PropertyRow>,
    dirty: BTreeSet<(PropertyTypeId, ValueHash)>,
}

impl StagedEntity {
    fn load(
        backend: &dyn StorageBackend,
        key: EntityDataKey,
        assignment: Option<&PartitionAssignment>,
    ) -> StoreResult<Self> {
        let existing = backend.get_entity(&key)?;
        let existed = existing.is_some();
        let row = match (existing, assignment) {
            (Some(row), _) => row,
            (None, Some(assignment)) => EntityRow::new(
                key,
                route_partition(key.entity_key_id, &assignment.partitions),
                assignment.version,
            ),
            (None, None) => EntityRow::new(key, 0, 0),
        };
        let properties = backend
            .properties_of(&key)?
            .into_iter()
            .map(|property| ((property.property_type_id, property.hash), property))
            .collect();
        Ok(Self {
            row,
            existed,
            entity_dirty: false,
            properties,
            dirty: BTreeSet::new(),
        })
    }

    fn record(&mut self, version: Version) {
        self.row.record(version);
        self.entity_dirty = true;
    }

    /// Append `-version` to every live property row selected by `include`.
    fn tombstone_properties(
        &mut self,
        version: Version,
        include: impl Fn(PropertyTypeId) -> bool,
    ) -> usize {
        let mut count = 0;
        for (id, property) in self.properties.iter_mut() {
            if include(id.0) && property.is_live(None) {
                property.record(-version.abs());
                self.dirty.insert(*id);
                count += 1;
            }
        }
        count
    }

    fn write_values(
        &mut self,
        property_type_id: PropertyTypeId,
        values: &[PropertyValue],
        version: Version,
        blobs: &mut Vec<PendingBlob>,
    ) {
        let key = self.row.key();
        for value in values {
            let hash = value.content_hash();
            let id = (property_type_id, hash);
            if let Some(existing) = self.properties.get_mut(&id) {
                existing.record(version);
                self.dirty.insert(id);
                continue;
            }
            let stored = match value {
                PropertyValue::Binary {
                    bytes,
                    content_type,
                } => {
                    let blob = blob_key(key.entity_set_id, key.entity_key_id, property_type_id, &hash);
                    blobs.push(PendingBlob {
                        key: blob.clone(),
                        bytes: bytes.clone(),
                        content_type: content_type.clone(),
                    });
                    StoredValue::Blob {
                        key: blob,
                        content_type: content_type.clone(),
                    }
                }
                other => StoredValue::Inline(other.clone()),
            };
            let mut row = PropertyRow {
                entity_set_id: key.entity_set_id,
                entity_key_id: key.entity_key_id,
                partition: self.row.partition,
                property_type_id,
                hash,
                value: stored,
                versions: Vec::new(),
                version: 0,
                last_write: NEVER,
            };
            row.record(version);
            self.properties.insert(id, row);
            self.dirty.insert(id);
        }
    }

    fn emit(self, writes: &mut WriteSet) {
        if self.entity_dirty {
            writes.push(WriteOp::PutEntity(self.row));
        }
        let mut properties = self.properties;
        for id in self.dirty {
            if let Some(row) = properties.remove(&id) {
                writes.push(WriteOp::PutProperty(row));
            }
        }
    }
}

pub struct PropertyStore {
    backend: Arc<dyn StorageBackend>,
    resolver: Arc<PartitionResolver>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn VersionClock>,
    locks: Arc<LockTable<EntityDataKey>>,
    options: StoreOptions,
}

impl PropertyStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        resolver: Arc<PartitionResolver>,
        blobs: Arc<dyn BlobStore>,
        clock: Arc<dyn VersionClock>,
        options: StoreOptions,
    ) -> Self {
        Self {
            backend,
            resolver,
            blobs,
            clock,
            locks: LockTable::new("entity"),
            options,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Append one new version to every submitted entity and value.
    #[instrument(skip(self, entities, authorized), level = "debug")]
    pub fn upsert_entities(
        &self,
        entity_set_id: EntitySetId,
        entities: &EntityBatch,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        self.write_entities(entity_set_id, entities, authorized, ReplaceMode::None)
    }

    /// Tombstone every authorized property of each entity, then upsert.
    #[instrument(skip(self, entities, authorized), level = "debug")]
    pub fn replace_entities(
        &self,
        entity_set_id: EntitySetId,
        entities: &EntityBatch,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        self.write_entities(entity_set_id, entities, authorized, ReplaceMode::Full)
    }

    /// Tombstone only the submitted property types of each entity, then upsert.
    #[instrument(skip(self, entities, authorized), level = "debug")]
    pub fn partial_replace_entities(
        &self,
        entity_set_id: EntitySetId,
        entities: &EntityBatch,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        self.write_entities(entity_set_id, entities, authorized, ReplaceMode::Partial)
    }

    fn validate(
        entity_set_id: EntitySetId,
        entities: &EntityBatch,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<()> {
        for (entity_key_id, properties) in entities {
            for (property_type_id, values) in properties {
                let Some(property_type) = authorized.get(property_type_id) else {
                    return Err(StoreError::UnauthorizedProperty {
                        entity_set_id,
                        entity_key_id: *entity_key_id,
                        property_type_id: *property_type_id,
                    });
                };
                if let Some(value) = values
                    .iter()
                    .find(|value| value.data_type() != property_type.datatype)
                {
                    return Err(StoreError::InvalidValue {
                        property_type_id: *property_type_id,
                        reason: format!(
                            "expected {:?}, got {:?}",
                            property_type.datatype,
                            value.data_type()
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn write_entities(
        &self,
        entity_set_id: EntitySetId,
        entities: &EntityBatch,
        authorized: &AuthorizedPropertyTypes,
        mode: ReplaceMode,
    ) -> StoreResult<WriteEvent> {
        Self::validate(entity_set_id, entities, authorized)?;
        let assignment = self.resolver.partitions_for(entity_set_id)?;
        let keys: BTreeSet<EntityDataKey> = entities
            .keys()
            .map(|id| EntityDataKey::new(entity_set_id, *id))
            .collect();
        let _guard = self
            .locks
            .lock_all(keys.iter().copied(), self.options.lock_timeout)?;

        let tombstone_version = (mode != ReplaceMode::None).then(|| self.clock.next_version());
        let version = self.clock.next_version();
        let mut writes = WriteSet::new();
        let mut blobs = Vec::new();
        let mut per_partition: BTreeMap<i32, usize> = BTreeMap::new();
        let mut staged_count = 0;

        for key in &keys {
            let Some(properties) = entities.get(&key.entity_key_id) else {
                continue;
            };
            let mut staged = StagedEntity::load(&*self.backend, *key, Some(&assignment))?;
            if staged.row.last_write > version {
                warn!(%key, last_write = staged.row.last_write, version, "row carries a newer write");
                continue;
            }
            if let Some(tombstone) = tombstone_version {
                match mode {
                    ReplaceMode::Full => {
                        staged.tombstone_properties(tombstone, |id| authorized.contains_key(&id));
                    }
                    ReplaceMode::Partial => {
                        staged.tombstone_properties(tombstone, |id| properties.contains_key(&id));
                    }
                    ReplaceMode::None => {}
                }
            }
            staged.record(version);
            let ordered: BTreeMap<_, _> = properties.iter().collect();
            for (property_type_id, values) in ordered {
                staged.write_values(*property_type_id, values, version, &mut blobs);
            }
            *per_partition.entry(staged.row.partition).or_default() += 1;
            staged_count += 1;
            staged.emit(&mut writes);
        }

        if staged_count != entities.len() {
            error!(
                %entity_set_id,
                expected = entities.len(),
                actual = staged_count,
                "staged entity count mismatch"
            );
            return Err(StoreError::ConflictingVersionInvariantViolation {
                context: format!("write to entity set {entity_set_id}"),
                expected: entities.len(),
                actual: staged_count,
            });
        }
        for (partition, count) in &per_partition {
            debug!(partition, count, version, "staged partition batch");
        }

        self.put_blobs(blobs)?;
        self.resolver
            .commit_at(entity_set_id, assignment.version, writes)?;
        Ok(WriteEvent::new(version, staged_count))
    }

    fn put_blobs(&self, blobs: Vec<PendingBlob>) -> StoreResult<()> {
        let mut seen = BTreeSet::new();
        for blob in blobs {
            if seen.insert(blob.key.clone()) {
                self.blobs
                    .put(&blob.key, &blob.bytes, &blob.content_type)
                    .map_err(StoreError::Backend)?;
            }
        }
        Ok(())
    }

    /// Soft delete: append a tombstone to each entity and its authorized properties.
    #[instrument(skip(self, entity_key_ids, authorized), level = "debug")]
    pub fn clear_entities(
        &self,
        entity_set_id: EntitySetId,
        entity_key_ids: &[EntityKeyId],
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        let version = self.clock.next_version();
        let mut completed = 0;
        for chunk in entity_key_ids.chunks(self.options.chunk_size()) {
            let keys = chunk
                .iter()
                .map(|id| EntityDataKey::new(entity_set_id, *id));
            completed += self
                .clear_chunk(keys.collect(), authorized, version)
                .map_err(|err| err.after(completed))?;
        }
        Ok(WriteEvent::new(version, completed))
    }

    /// Soft delete every entity of a set.
    #[instrument(skip(self, authorized), level = "debug")]
    pub fn clear_entity_set(
        &self,
        entity_set_id: EntitySetId,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        let version = self.clock.next_version();
        let mut completed = 0;
        let mut after = None;
        loop {
            let page = self
                .backend
                .scan_entities(entity_set_id, after, self.options.chunk_size())
                .map_err(|err| StoreError::Backend(err).after(completed))?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.entity_key_id);
            let keys = page.iter().map(EntityRow::key).collect();
            completed += self
                .clear_chunk(keys, authorized, version)
                .map_err(|err| err.after(completed))?;
        }
        Ok(WriteEvent::new(version, completed))
    }

    fn clear_chunk(
        &self,
        keys: BTreeSet<EntityDataKey>,
        authorized: &AuthorizedPropertyTypes,
        version: Version,
    ) -> StoreResult<usize> {
        let _guard = self
            .locks
            .lock_all(keys.iter().copied(), self.options.lock_timeout)?;
        let mut writes = WriteSet::new();
        let mut count = 0;
        for key in keys {
            let mut staged = StagedEntity::load(&*self.backend, key, None)?;
            if !staged.existed {
                continue;
            }
            staged.tombstone_properties(version, |id| authorized.contains_key(&id));
            staged.record(-version.abs());
            staged.emit(&mut writes);
            count += 1;
        }
        self.backend.apply(writes)?;
        debug!(count, version, "cleared entities");
        Ok(count)
    }

    /// Hard delete: remove authorized property rows, then entity rows left
    /// without properties, then the blobs those rows referenced.
    ///
    /// Nothing versioned survives a hard delete, so no version is drawn and
    /// the event carries [`NEVER`].
    #[instrument(skip(self, entity_key_ids, authorized), level = "debug")]
    pub fn delete_entity_data(
        &self,
        entity_set_id: EntitySetId,
        entity_key_ids: &[EntityKeyId],
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        let mut completed = 0;
        for chunk in entity_key_ids.chunks(self.options.chunk_size()) {
            let keys = chunk
                .iter()
                .map(|id| EntityDataKey::new(entity_set_id, *id))
                .collect();
            completed += self
                .delete_chunk(keys, authorized)
                .map_err(|err| err.after(completed))?;
        }
        Ok(WriteEvent::new(NEVER, completed))
    }

    /// Hard delete every entity of a set.
    #[instrument(skip(self, authorized), level = "debug")]
    pub fn delete_entity_set_data(
        &self,
        entity_set_id: EntitySetId,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<WriteEvent> {
        let mut completed = 0;
        let mut after = None;
        loop {
            let page = self
                .backend
                .scan_entities(entity_set_id, after, self.options.chunk_size())
                .map_err(|err| StoreError::Backend(err).after(completed))?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.entity_key_id);
            let keys = page.iter().map(EntityRow::key).collect();
            completed += self
                .delete_chunk(keys, authorized)
                .map_err(|err| err.after(completed))?;
        }
        Ok(WriteEvent::new(NEVER, completed))
    }

    fn delete_chunk(
        &self,
        keys: BTreeSet<EntityDataKey>,
        authorized: &AuthorizedPropertyTypes,
    ) -> StoreResult<usize> {
        let _guard = self
            .locks
            .lock_all(keys.iter().copied(), self.options.lock_timeout)?;
        let mut writes = WriteSet::new();
        let mut blob_keys = Vec::new();
        let mut count = 0;
        for key in keys {
            let entity = self.backend.get_entity(&key)?;
            let mut retained = 0;
            for property in self.backend.properties_of(&key)? {
                if !authorized.contains_key(&property.property_type_id) {
                    retained += 1;
                    continue;
                }
                if let StoredValue::Blob { key: blob, .. } = &property.value {
                    blob_keys.push(blob.clone());
                }
                writes.push(WriteOp::DeleteProperty(property.key()));
            }
            if entity.is_some() && retained == 0 {
                writes.push(WriteOp::DeleteEntity(key));
                count += 1;
            }
        }
        self.backend.apply(writes)?;
        self.delete_blobs(blob_keys);
        debug!(count, "hard deleted entities");
        Ok(count)
    }

    fn delete_blobs(&self, mut keys: Vec<String>) {
        keys.sort();
        keys.dedup();
        for batch in keys.chunks(self.options.blob_delete_batch_size.max(1)) {
            if let Err(err) = self.blobs.delete_many(batch) {
                warn!(count = batch.len(), error = %err, "failed to delete blobs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::catalog::PropertyType;
    use crate::model::DataType;
    use crate::store::{FailingBackend, MemoryBackend};
    use crate::version::ManualClock;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        blobs: Arc<MemoryBlobStore>,
        clock: Arc<ManualClock>,
        store: PropertyStore,
        set: EntitySetId,
        name: PropertyType,
        photo: PropertyType,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let blobs = Arc::new(MemoryBlobStore::new());
            let clock = Arc::new(ManualClock::starting_at(100));
            let resolver = Arc::new(PartitionResolver::new(backend.clone(), 4));
            let store = PropertyStore::new(
                backend.clone(),
                resolver,
                blobs.clone(),
                clock.clone(),
                StoreOptions::default(),
            );
            Self {
                backend,
                blobs,
                clock,
                store,
                set: EntitySetId::random(),
                name: PropertyType::new("general.name", DataType::Text),
                photo: PropertyType::new("general.photo", DataType::Binary),
            }
        }

        fn authorized(&self) -> AuthorizedPropertyTypes {
            [
                (self.name.id, self.name.clone()),
                (self.photo.id, self.photo.clone()),
            ]
            .into_iter()
            .collect()
        }

        fn live_values(&self, key: EntityKeyId, property_type_id: PropertyTypeId) -> usize {
            self.backend
                .properties_of(&EntityDataKey::new(self.set, key))
                .unwrap()
                .iter()
                .filter(|row| row.property_type_id == property_type_id && row.is_live(None))
                .count()
        }
    }

    fn batch(key: EntityKeyId, property: PropertyTypeId, values: Vec<PropertyValue>) -> EntityBatch {
        let mut properties = EntityProperties::new();
        properties.insert(property, values);
        [(key, properties)].into_iter().collect()
    }

    #[test]
    fn upsert_shares_one_version_across_the_batch() {
        let fx = Fixture::new();
        let mut entities = EntityBatch::new();
        for _ in 0..5 {
            let mut properties = EntityProperties::new();
            properties.insert(fx.name.id, vec![PropertyValue::text("x")]);
            entities.insert(EntityKeyId::random(), properties);
        }
        let event = fx
            .store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        assert_eq!(event, WriteEvent::new(100, 5));
        for key in entities.keys() {
            let row = fx
                .backend
                .get_entity(&EntityDataKey::new(fx.set, *key))
                .unwrap()
                .unwrap();
            assert_eq!(row.versions, vec![100]);
            assert_eq!(row.partitions_version, 1);
        }
    }

    #[test]
    fn unauthorized_property_fails_before_any_write() {
        let fx = Fixture::new();
        let mut entities = EntityBatch::new();
        for i in 0..10 {
            let mut properties = EntityProperties::new();
            let property = if i == 5 {
                PropertyTypeId::random()
            } else {
                fx.name.id
            };
            properties.insert(property, vec![PropertyValue::text("x")]);
            entities.insert(EntityKeyId::random(), properties);
        }
        let err = fx
            .store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap_err();
        assert!(matches!(err, StoreError::UnauthorizedProperty { .. }));
        assert_eq!(fx.backend.entity_count(), 0);
        assert_eq!(fx.backend.property_row_count(), 0);
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let fx = Fixture::new();
        let entities = batch(EntityKeyId::random(), fx.name.id, vec![PropertyValue::Int64(3)]);
        let err = fx
            .store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[test]
    fn binary_values_are_offloaded_by_content_hash() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        let photo = PropertyValue::binary(vec![9; 64], "image/png");
        let entities = batch(key, fx.photo.id, vec![photo.clone()]);
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();

        let expected = blob_key(fx.set, key, fx.photo.id, &photo.content_hash());
        assert!(fx.blobs.contains(&expected));
        let rows = fx.backend.properties_of(&EntityDataKey::new(fx.set, key)).unwrap();
        assert!(matches!(&rows[0].value, StoredValue::Blob { key, .. } if *key == expected));
    }

    #[test]
    fn partial_replace_leaves_other_properties_alone() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        let mut properties = EntityProperties::new();
        properties.insert(fx.name.id, vec![PropertyValue::text("old")]);
        properties.insert(fx.photo.id, vec![PropertyValue::binary(vec![1], "image/png")]);
        let entities: EntityBatch = [(key, properties)].into_iter().collect();
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();

        fx.store
            .partial_replace_entities(
                fx.set,
                &batch(key, fx.name.id, vec![PropertyValue::text("new")]),
                &fx.authorized(),
            )
            .unwrap();
        assert_eq!(fx.live_values(key, fx.name.id), 1);
        assert_eq!(fx.live_values(key, fx.photo.id), 1);

        fx.store
            .replace_entities(
                fx.set,
                &batch(key, fx.name.id, vec![PropertyValue::text("newest")]),
                &fx.authorized(),
            )
            .unwrap();
        assert_eq!(fx.live_values(key, fx.name.id), 1);
        assert_eq!(fx.live_values(key, fx.photo.id), 0);
    }

    #[test]
    fn replacing_with_the_same_value_keeps_it_live() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        let entities = batch(key, fx.name.id, vec![PropertyValue::text("same")]);
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        fx.store
            .replace_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        assert_eq!(fx.live_values(key, fx.name.id), 1);
    }

    #[test]
    fn clear_tombstones_without_removing_rows() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        fx.store
            .upsert_entities(
                fx.set,
                &batch(key, fx.name.id, vec![PropertyValue::text("a")]),
                &fx.authorized(),
            )
            .unwrap();
        fx.clock.set(200);
        let event = fx
            .store
            .clear_entities(fx.set, &[key, EntityKeyId::random()], &fx.authorized())
            .unwrap();
        assert_eq!(event, WriteEvent::new(200, 1));
        let row = fx
            .backend
            .get_entity(&EntityDataKey::new(fx.set, key))
            .unwrap()
            .unwrap();
        assert_eq!(row.versions, vec![100, -200]);
        assert_eq!(fx.backend.property_row_count(), 1);
        assert_eq!(fx.live_values(key, fx.name.id), 0);
    }

    #[test]
    fn hard_delete_removes_rows_and_blobs() {
        let fx = Fixture::new();
        let keys: Vec<EntityKeyId> = (0..3).map(|_| EntityKeyId::random()).collect();
        let mut entities = EntityBatch::new();
        for (i, key) in keys.iter().enumerate() {
            let mut properties = EntityProperties::new();
            properties.insert(fx.photo.id, vec![PropertyValue::binary(vec![i as u8], "image/png")]);
            entities.insert(*key, properties);
        }
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        assert_eq!(fx.blobs.len(), 3);

        let event = fx
            .store
            .delete_entity_set_data(fx.set, &fx.authorized())
            .unwrap();
        assert_eq!(event.count, 3);
        assert_eq!(fx.backend.entity_count(), 0);
        assert_eq!(fx.backend.property_row_count(), 0);
        assert!(fx.blobs.is_empty());
    }

    #[test]
    fn blob_delete_failure_does_not_block_row_deletion() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        fx.store
            .upsert_entities(
                fx.set,
                &batch(key, fx.photo.id, vec![PropertyValue::binary(vec![7], "image/png")]),
                &fx.authorized(),
            )
            .unwrap();
        fx.blobs.set_failing(true);
        let event = fx
            .store
            .delete_entity_data(fx.set, &[key], &fx.authorized())
            .unwrap();
        assert_eq!(event.count, 1);
        assert_eq!(fx.backend.entity_count(), 0);
    }

    #[test]
    fn hard_delete_keeps_entities_with_unauthorized_properties() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        let mut properties = EntityProperties::new();
        properties.insert(fx.name.id, vec![PropertyValue::text("a")]);
        properties.insert(fx.photo.id, vec![PropertyValue::binary(vec![1], "image/png")]);
        fx.store
            .upsert_entities(fx.set, &[(key, properties)].into_iter().collect(), &fx.authorized())
            .unwrap();

        let only_name: AuthorizedPropertyTypes =
            [(fx.name.id, fx.name.clone())].into_iter().collect();
        let event = fx
            .store
            .delete_entity_data(fx.set, &[key], &only_name)
            .unwrap();
        assert_eq!(event.count, 0);
        assert_eq!(fx.backend.entity_count(), 1);
        assert_eq!(fx.live_values(key, fx.photo.id), 1);
    }

    #[test]
    fn write_behind_a_newer_row_fails_the_batch() {
        let fx = Fixture::new();
        let (stale, fresh) = (EntityKeyId::random(), EntityKeyId::random());
        let values = vec![PropertyValue::text("a")];
        fx.clock.set(300);
        fx.store
            .upsert_entities(fx.set, &batch(stale, fx.name.id, values.clone()), &fx.authorized())
            .unwrap();

        fx.clock.set(150);
        let mut entities = batch(stale, fx.name.id, values.clone());
        entities.extend(batch(fresh, fx.name.id, values));
        let err = fx
            .store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConflictingVersionInvariantViolation {
                expected: 2,
                actual: 1,
                ..
            }
        ));
        assert!(fx
            .backend
            .get_entity(&EntityDataKey::new(fx.set, fresh))
            .unwrap()
            .is_none());
        let row = fx
            .backend
            .get_entity(&EntityDataKey::new(fx.set, stale))
            .unwrap()
            .unwrap();
        assert_eq!(row.versions, vec![300]);
    }

    #[test]
    fn hard_delete_draws_no_version() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        fx.store
            .upsert_entities(
                fx.set,
                &batch(key, fx.name.id, vec![PropertyValue::text("a")]),
                &fx.authorized(),
            )
            .unwrap();
        let event = fx
            .store
            .delete_entity_data(fx.set, &[key], &fx.authorized())
            .unwrap();
        assert_eq!(event, WriteEvent::new(NEVER, 1));
        let event = fx
            .store
            .delete_entity_set_data(fx.set, &fx.authorized())
            .unwrap();
        assert_eq!(event, WriteEvent::new(NEVER, 0));
        assert_eq!(fx.clock.next_version(), 101);
    }

    #[test]
    fn failed_chunk_reports_the_chunks_already_committed() {
        let backend = Arc::new(FailingBackend::new());
        let store = PropertyStore::new(
            backend.clone(),
            Arc::new(PartitionResolver::new(backend.clone(), 4)),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(ManualClock::starting_at(100)),
            StoreOptions {
                delete_chunk_size: 1,
                ..Default::default()
            },
        );
        let fx = Fixture::new();
        let keys: Vec<EntityKeyId> = (0..3).map(|_| EntityKeyId::random()).collect();
        let mut entities = EntityBatch::new();
        for key in &keys {
            entities.extend(batch(*key, fx.name.id, vec![PropertyValue::text("a")]));
        }
        store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();

        backend.fail_after(1);
        let err = store
            .clear_entities(fx.set, &keys, &fx.authorized())
            .unwrap_err();
        match &err {
            StoreError::PartialFailure { completed, source } => {
                assert_eq!(*completed, 1);
                assert!(matches!(**source, StoreError::Backend(_)));
            }
            other => panic!("unexpected error {other}"),
        }
        let live = keys
            .iter()
            .filter(|key| {
                backend
                    .get_entity(&EntityDataKey::new(fx.set, **key))
                    .unwrap()
                    .is_some_and(|row| row.is_live(None))
            })
            .count();
        assert_eq!(live, 2);
    }

    #[test]
    fn resubmitting_the_same_version_is_a_no_op() {
        let fx = Fixture::new();
        let key = EntityKeyId::random();
        let entities = batch(key, fx.name.id, vec![PropertyValue::text("a")]);
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        fx.clock.set(100);
        fx.store
            .upsert_entities(fx.set, &entities, &fx.authorized())
            .unwrap();
        let rows = fx
            .backend
            .properties_of(&EntityDataKey::new(fx.set, key))
            .unwrap();
        assert_eq!(rows[0].versions, vec![100]);
    }
}
