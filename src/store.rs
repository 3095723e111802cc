//! # Store Module
//!
//! Persisted row layout and the storage backend abstraction.
//!
//! Four tables back the engine: entity rows (`ids`), property value rows
//! (`data`), linking match scores (`matches`) and association edges
//! (`edges`). Mutations are expressed as a [`WriteSet`] that a backend applies
//! atomically; row patches are applied against the current row inside that
//! atomic step so metadata updates never clobber concurrently appended versions.

use crate::model::{
    EntityDataKey, EntityKeyId, EntitySetId, LinkingId, PropertyTypeId, PropertyValue, ValueHash,
};
use crate::version::{self, Version, NEVER};
use anyhow::Result;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Partition list of an entity set and its epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub partitions: Vec<i32>,
    pub version: i32,
}

/// One row of the `ids` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub entity_set_id: EntitySetId,
    pub entity_key_id: EntityKeyId,
    pub partition: i32,
    pub partitions_version: i32,
    pub versions: Vec<Version>,
    pub version: Version,
    pub linking_id: Option<LinkingId>,
    /// Version history of the linking assignment, same sign discipline as `versions`.
    pub linking_versions: Vec<Version>,
    /// Version at which each linking id took effect, in version order.
    pub linking_history: Vec<(Version, LinkingId)>,
    pub last_write: Version,
    pub last_index: Version,
    pub last_link: Version,
    pub last_link_index: Version,
}

impl EntityRow {
    pub fn new(key: EntityDataKey, partition: i32, partitions_version: i32) -> Self {
        Self {
            entity_set_id: key.entity_set_id,
            entity_key_id: key.entity_key_id,
            partition,
            partitions_version,
            versions: Vec::new(),
            version: 0,
            linking_id: None,
            linking_versions: Vec::new(),
            linking_history: Vec::new(),
            last_write: NEVER,
            last_index: NEVER,
            last_link: NEVER,
            last_link_index: NEVER,
        }
    }

    pub fn key(&self) -> EntityDataKey {
        EntityDataKey::new(self.entity_set_id, self.entity_key_id)
    }

    pub fn is_live(&self, as_of: Option<Version>) -> bool {
        version::is_live(&self.versions, as_of)
    }

    /// Record a write (positive) or tombstone (negative) version.
    pub fn record(&mut self, version: Version) {
        version::append(&mut self.versions, version);
        self.version = version::latest(&self.versions);
        self.last_write = self.last_write.max(version.abs());
    }

    /// The cluster this entity belongs to at `as_of`, if any.
    pub fn linked_to(&self, as_of: Option<Version>) -> Option<LinkingId> {
        if !version::is_live(&self.linking_versions, as_of) {
            return None;
        }
        match as_of {
            None => self.linking_id,
            Some(as_of) => self
                .linking_history
                .iter()
                .rev()
                .find(|(version, _)| *version <= as_of)
                .map(|(_, linking_id)| *linking_id),
        }
    }

    pub fn needs_linking(&self) -> bool {
        self.last_link < self.last_write
    }

    pub fn needs_indexing(&self) -> bool {
        self.last_index < self.last_write
    }
}

/// Where the bytes of a property value live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Inline(PropertyValue),
    Blob { key: String, content_type: String },
}

/// One row of the `data` table: a single value of a single property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRow {
    pub entity_set_id: EntitySetId,
    pub entity_key_id: EntityKeyId,
    pub partition: i32,
    pub property_type_id: PropertyTypeId,
    pub hash: ValueHash,
    pub value: StoredValue,
    pub versions: Vec<Version>,
    pub version: Version,
    pub last_write: Version,
}

impl PropertyRow {
    pub fn key(&self) -> PropertyKey {
        PropertyKey {
            entity: EntityDataKey::new(self.entity_set_id, self.entity_key_id),
            property_type_id: self.property_type_id,
            hash: self.hash,
        }
    }

    pub fn is_live(&self, as_of: Option<Version>) -> bool {
        version::is_live(&self.versions, as_of)
    }

    pub fn record(&mut self, version: Version) {
        version::append(&mut self.versions, version);
        self.version = version::latest(&self.versions);
        self.last_write = self.last_write.max(version.abs());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKey {
    pub entity: EntityDataKey,
    pub property_type_id: PropertyTypeId,
    pub hash: ValueHash,
}

/// Directed match score between two entities inside one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchEdge {
    pub linking_id: LinkingId,
    pub src: EntityDataKey,
    pub dst: EntityDataKey,
    pub score: f64,
}

impl MatchEdge {
    pub fn key(&self) -> MatchKey {
        MatchKey {
            linking_id: self.linking_id,
            src: self.src,
            dst: self.dst,
        }
    }

    pub fn touches(&self, key: &EntityDataKey) -> bool {
        self.src == *key || self.dst == *key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub linking_id: LinkingId,
    pub src: EntityDataKey,
    pub dst: EntityDataKey,
}

/// Association edge: `edge` is an entity of an association entity set
/// connecting `src` to `dst`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationEdge {
    pub src: EntityDataKey,
    pub dst: EntityDataKey,
    pub edge: EntityDataKey,
    pub versions: Vec<Version>,
    pub version: Version,
}

impl AssociationEdge {
    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            src: self.src,
            dst: self.dst,
            edge: self.edge,
        }
    }

    pub fn is_live(&self, as_of: Option<Version>) -> bool {
        version::is_live(&self.versions, as_of)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub src: EntityDataKey,
    pub dst: EntityDataKey,
    pub edge: EntityDataKey,
}

impl EdgeKey {
    pub fn endpoints(&self) -> [EntityDataKey; 3] {
        [self.src, self.dst, self.edge]
    }
}

/// How `last_link` should change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMark {
    /// Reset to "never linked".
    Reset,
    /// Linked up to the row's current `last_write`.
    CaughtUp,
}

/// Change to a row's linking assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkingChange {
    Assign { linking_id: LinkingId, version: Version },
    Tombstone { version: Version },
}

/// Metadata-only update to an entity row. Never touches `versions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    pub last_index: Option<Version>,
    pub last_link_index: Option<Version>,
    pub last_link: Option<LinkMark>,
    pub linking: Option<LinkingChange>,
    /// Only apply when the row's `last_write` still equals this value.
    pub if_last_write: Option<Version>,
}

impl EntityPatch {
    pub fn apply_to(&self, row: &mut EntityRow) -> bool {
        if let Some(expected) = self.if_last_write {
            if row.last_write != expected {
                return false;
            }
        }
        if let Some(last_index) = self.last_index {
            row.last_index = last_index;
        }
        if let Some(last_link_index) = self.last_link_index {
            row.last_link_index = last_link_index;
        }
        match self.last_link {
            Some(LinkMark::Reset) => row.last_link = NEVER,
            Some(LinkMark::CaughtUp) => row.last_link = row.last_write,
            None => {}
        }
        match self.linking {
            Some(LinkingChange::Assign {
                linking_id,
                version,
            }) => {
                let at = version.abs();
                let known = row
                    .linking_history
                    .iter()
                    .any(|entry| *entry == (at, linking_id));
                if !known {
                    row.linking_history.retain(|(existing, _)| *existing != at);
                    row.linking_history.push((at, linking_id));
                    row.linking_history.sort_by_key(|(existing, _)| *existing);
                }
                row.linking_id = row.linking_history.last().map(|(_, id)| *id);
                version::append(&mut row.linking_versions, version);
            }
            Some(LinkingChange::Tombstone { version }) => {
                version::append(&mut row.linking_versions, -version.abs());
            }
            None => {}
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutEntity(EntityRow),
    PatchEntity(EntityDataKey, EntityPatch),
    DeleteEntity(EntityDataKey),
    PutProperty(PropertyRow),
    DeleteProperty(PropertyKey),
    PutMatch(MatchEdge),
    DeleteMatch(MatchKey),
    /// Append a version to an edge, creating it when absent.
    AppendEdgeVersion(EdgeKey, Version),
    DeleteEdge(EdgeKey),
    PutPartitions(EntitySetId, PartitionAssignment),
}

/// Ordered list of mutations applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, other: WriteSet) {
        self.ops.extend(other.ops);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Relational-style backing store.
///
/// Reads are point or bounded-range lookups; `apply` must be atomic.
pub trait StorageBackend: Send + Sync {
    fn get_entity(&self, key: &EntityDataKey) -> Result<Option<EntityRow>>;

    /// Entity rows of one set in key order, strictly after `after`, at most `limit`.
    fn scan_entities(
        &self,
        entity_set_id: EntitySetId,
        after: Option<EntityKeyId>,
        limit: usize,
    ) -> Result<Vec<EntityRow>>;

    fn properties_of(&self, key: &EntityDataKey) -> Result<Vec<PropertyRow>>;

    /// Rows whose `linking_id` column equals `linking_id` (tombstoned assignments included).
    fn entities_with_linking_id(&self, linking_id: LinkingId) -> Result<Vec<EntityRow>>;

    fn matches_of_cluster(&self, linking_id: LinkingId) -> Result<Vec<MatchEdge>>;

    fn matches_touching(&self, key: &EntityDataKey) -> Result<Vec<MatchEdge>>;

    fn edges_touching(&self, key: &EntityDataKey) -> Result<Vec<AssociationEdge>>;

    fn partition_assignment(&self, entity_set_id: EntitySetId)
        -> Result<Option<PartitionAssignment>>;

    fn apply(&self, writes: WriteSet) -> Result<()>;

    fn get_entities(&self, keys: &[EntityDataKey]) -> Result<Vec<EntityRow>> {
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = self.get_entity(key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn checkpoint(&self, _path: &Path) -> Result<()> {
        anyhow::bail!("checkpoint is not supported by this backend")
    }
}

#[derive(Debug, Default)]
struct Tables {
    entities: BTreeMap<EntityDataKey, EntityRow>,
    properties: HashMap<EntityDataKey, BTreeMap<(PropertyTypeId, ValueHash), PropertyRow>>,
    matches: BTreeMap<MatchKey, MatchEdge>,
    match_index: HashMap<EntityDataKey, BTreeSet<MatchKey>>,
    edges: BTreeMap<EdgeKey, AssociationEdge>,
    edge_index: HashMap<EntityDataKey, BTreeSet<EdgeKey>>,
    linking_index: HashMap<LinkingId, BTreeSet<EntityDataKey>>,
    partitions: HashMap<EntitySetId, PartitionAssignment>,
}

impl Tables {
    fn put_entity(&mut self, row: EntityRow) {
        let key = row.key();
        let previous = self.entities.get(&key).and_then(|old| old.linking_id);
        if previous != row.linking_id {
            if let Some(old) = previous {
                self.unindex_linking(old, &key);
            }
            if let Some(new) = row.linking_id {
                self.linking_index.entry(new).or_default().insert(key);
            }
        }
        self.entities.insert(key, row);
    }

    fn unindex_linking(&mut self, linking_id: LinkingId, key: &EntityDataKey) {
        if let Some(members) = self.linking_index.get_mut(&linking_id) {
            members.remove(key);
            if members.is_empty() {
                self.linking_index.remove(&linking_id);
            }
        }
    }

    fn delete_entity(&mut self, key: &EntityDataKey) {
        if let Some(row) = self.entities.remove(key) {
            if let Some(linking_id) = row.linking_id {
                self.unindex_linking(linking_id, key);
            }
        }
    }

    fn put_match(&mut self, edge: MatchEdge) {
        let key = edge.key();
        self.match_index.entry(edge.src).or_default().insert(key);
        self.match_index.entry(edge.dst).or_default().insert(key);
        self.matches.insert(key, edge);
    }

    fn delete_match(&mut self, key: &MatchKey) {
        if self.matches.remove(key).is_some() {
            for endpoint in [key.src, key.dst] {
                if let Some(keys) = self.match_index.get_mut(&endpoint) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.match_index.remove(&endpoint);
                    }
                }
            }
        }
    }

    fn append_edge_version(&mut self, key: EdgeKey, version: Version) {
        let edge = self.edges.entry(key).or_insert_with(|| AssociationEdge {
            src: key.src,
            dst: key.dst,
            edge: key.edge,
            versions: Vec::new(),
            version: 0,
        });
        version::append(&mut edge.versions, version);
        edge.version = version::latest(&edge.versions);
        for endpoint in key.endpoints() {
            self.edge_index.entry(endpoint).or_default().insert(key);
        }
    }

    fn delete_edge(&mut self, key: &EdgeKey) {
        if self.edges.remove(key).is_some() {
            for endpoint in key.endpoints() {
                if let Some(keys) = self.edge_index.get_mut(&endpoint) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.edge_index.remove(&endpoint);
                    }
                }
            }
        }
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::PutEntity(row) => self.put_entity(row),
            WriteOp::PatchEntity(key, patch) => {
                if let Some(mut row) = self.entities.get(&key).cloned() {
                    if patch.apply_to(&mut row) {
                        self.put_entity(row);
                    }
                }
            }
            WriteOp::DeleteEntity(key) => self.delete_entity(&key),
            WriteOp::PutProperty(row) => {
                let entity = EntityDataKey::new(row.entity_set_id, row.entity_key_id);
                self.properties
                    .entry(entity)
                    .or_default()
                    .insert((row.property_type_id, row.hash), row);
            }
            WriteOp::DeleteProperty(key) => {
                if let Some(rows) = self.properties.get_mut(&key.entity) {
                    rows.remove(&(key.property_type_id, key.hash));
                    if rows.is_empty() {
                        self.properties.remove(&key.entity);
                    }
                }
            }
            WriteOp::PutMatch(edge) => self.put_match(edge),
            WriteOp::DeleteMatch(key) => self.delete_match(&key),
            WriteOp::AppendEdgeVersion(key, version) => self.append_edge_version(key, version),
            WriteOp::DeleteEdge(key) => self.delete_edge(&key),
            WriteOp::PutPartitions(entity_set_id, assignment) => {
                self.partitions.insert(entity_set_id, assignment);
            }
        }
    }
}

/// In-memory backend. One writer lock makes every `apply` atomic.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.tables.read().entities.len()
    }

    pub fn property_row_count(&self) -> usize {
        self.tables.read().properties.values().map(BTreeMap::len).sum()
    }
}

impl StorageBackend for MemoryBackend {
    fn get_entity(&self, key: &EntityDataKey) -> Result<Option<EntityRow>> {
        Ok(self.tables.read().entities.get(key).cloned())
    }

    fn scan_entities(
        &self,
        entity_set_id: EntitySetId,
        after: Option<EntityKeyId>,
        limit: usize,
    ) -> Result<Vec<EntityRow>> {
        let tables = self.tables.read();
        let start = EntityDataKey::new(
            entity_set_id,
            after.unwrap_or(EntityKeyId(uuid::Uuid::nil())),
        );
        Ok(tables
            .entities
            .range(start..)
            .skip_while(|(key, _)| after.is_some() && **key == start)
            .take_while(|(key, _)| key.entity_set_id == entity_set_id)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn properties_of(&self, key: &EntityDataKey) -> Result<Vec<PropertyRow>> {
        Ok(self
            .tables
            .read()
            .properties
            .get(key)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn entities_with_linking_id(&self, linking_id: LinkingId) -> Result<Vec<EntityRow>> {
        let tables = self.tables.read();
        Ok(tables
            .linking_index
            .get(&linking_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|key| tables.entities.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn matches_of_cluster(&self, linking_id: LinkingId) -> Result<Vec<MatchEdge>> {
        let bound = |byte: u8| {
            let key = EntityDataKey::new(
                EntitySetId::from_bytes([byte; 16]),
                EntityKeyId::from_bytes([byte; 16]),
            );
            MatchKey {
                linking_id,
                src: key,
                dst: key,
            }
        };
        let tables = self.tables.read();
        Ok(tables
            .matches
            .range(bound(0x00)..=bound(0xff))
            .map(|(_, edge)| edge.clone())
            .collect())
    }

    fn matches_touching(&self, key: &EntityDataKey) -> Result<Vec<MatchEdge>> {
        let tables = self.tables.read();
        Ok(tables
            .match_index
            .get(key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|match_key| tables.matches.get(match_key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn edges_touching(&self, key: &EntityDataKey) -> Result<Vec<AssociationEdge>> {
        let tables = self.tables.read();
        Ok(tables
            .edge_index
            .get(key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|edge_key| tables.edges.get(edge_key).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn partition_assignment(
        &self,
        entity_set_id: EntitySetId,
    ) -> Result<Option<PartitionAssignment>> {
        Ok(self.tables.read().partitions.get(&entity_set_id).cloned())
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        let mut tables = self.tables.write();
        for op in writes.into_ops() {
            tables.apply(op);
        }
        Ok(())
    }
}

/// [`MemoryBackend`] whose `apply` starts failing once a budget of commits is spent.
#[cfg(test)]
pub(crate) struct FailingBackend {
    inner: MemoryBackend,
    applies_left: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FailingBackend {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            applies_left: std::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    /// Let `applies` more commits through, then fail every one after.
    pub(crate) fn fail_after(&self, applies: usize) {
        self.applies_left
            .store(applies, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl StorageBackend for FailingBackend {
    fn get_entity(&self, key: &EntityDataKey) -> Result<Option<EntityRow>> {
        self.inner.get_entity(key)
    }

    fn scan_entities(
        &self,
        entity_set_id: EntitySetId,
        after: Option<EntityKeyId>,
        limit: usize,
    ) -> Result<Vec<EntityRow>> {
        self.inner.scan_entities(entity_set_id, after, limit)
    }

    fn properties_of(&self, key: &EntityDataKey) -> Result<Vec<PropertyRow>> {
        self.inner.properties_of(key)
    }

    fn entities_with_linking_id(&self, linking_id: LinkingId) -> Result<Vec<EntityRow>> {
        self.inner.entities_with_linking_id(linking_id)
    }

    fn matches_of_cluster(&self, linking_id: LinkingId) -> Result<Vec<MatchEdge>> {
        self.inner.matches_of_cluster(linking_id)
    }

    fn matches_touching(&self, key: &EntityDataKey) -> Result<Vec<MatchEdge>> {
        self.inner.matches_touching(key)
    }

    fn edges_touching(&self, key: &EntityDataKey) -> Result<Vec<AssociationEdge>> {
        self.inner.edges_touching(key)
    }

    fn partition_assignment(
        &self,
        entity_set_id: EntitySetId,
    ) -> Result<Option<PartitionAssignment>> {
        self.inner.partition_assignment(entity_set_id)
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        use std::sync::atomic::Ordering;
        let spent = self
            .applies_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_err();
        if spent {
            anyhow::bail!("injected commit failure");
        }
        self.inner.apply(writes)
    }
}
