//! # Read Path
//!
//! Streams entities with their authorized property values, either current or
//! as of a read-version. Results are produced by a forward-only cursor that
//! loads one page of entity rows at a time and can be resumed from the last
//! key it returned.
//!
//! Linking reads walk the same pages and emit each cluster when the scan
//! reaches its first in-scope member, so a position covers clusters too.

use crate::blob::BlobStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{
    EntityDataKey, EntityKeyId, EntitySetId, LinkingId, PropertyMap, PropertyTypeId, PropertyValue,
};
use crate::store::{EntityRow, PropertyRow, StorageBackend, StoredValue};
use crate::version::Version;
use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::warn;

/// Value predicate applied to one property type.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyFilter {
    /// At least one value equals one of these.
    Equals(PropertyTypeId, Vec<PropertyValue>),
    /// At least one numeric value lies in `[min, max]`.
    Range {
        property_type_id: PropertyTypeId,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// At least one text value contains the needle, case-insensitively.
    Contains(PropertyTypeId, String),
}

impl PropertyFilter {
    pub fn property_type_id(&self) -> PropertyTypeId {
        match self {
            PropertyFilter::Equals(id, _) | PropertyFilter::Contains(id, _) => *id,
            PropertyFilter::Range {
                property_type_id, ..
            } => *property_type_id,
        }
    }

    fn matches(&self, value: &PropertyValue) -> bool {
        match self {
            PropertyFilter::Equals(_, candidates) => {
                let hash = value.content_hash();
                candidates
                    .iter()
                    .any(|candidate| candidate.content_hash() == hash)
            }
            PropertyFilter::Range { min, max, .. } => value.as_f64().is_some_and(|number| {
                min.map_or(true, |min| number >= min) && max.map_or(true, |max| number <= max)
            }),
            PropertyFilter::Contains(_, needle) => match value {
                PropertyValue::Text(text) => text.to_lowercase().contains(&needle.to_lowercase()),
                _ => false,
            },
        }
    }

    fn accepts(&self, properties: &PropertyMap) -> bool {
        properties
            .get(&self.property_type_id())
            .is_some_and(|values| values.iter().any(|value| self.matches(value)))
    }
}

/// Which entities of a set to read.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySelection {
    All,
    Keys(BTreeSet<EntityKeyId>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityQuery {
    pub keys_by_entity_set: BTreeMap<EntitySetId, KeySelection>,
    /// Property types each set may return. Sets missing here return nothing.
    pub authorized: BTreeMap<EntitySetId, BTreeSet<PropertyTypeId>>,
    pub filters: Vec<PropertyFilter>,
    pub as_of: Option<Version>,
    /// Group results by linking id instead of entity key id.
    pub linking: bool,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self {
            keys_by_entity_set: BTreeMap::new(),
            authorized: BTreeMap::new(),
            filters: Vec::new(),
            as_of: None,
            linking: false,
        }
    }

    pub fn entity_set(
        mut self,
        entity_set_id: EntitySetId,
        selection: KeySelection,
        authorized: impl IntoIterator<Item = PropertyTypeId>,
    ) -> Self {
        self.keys_by_entity_set.insert(entity_set_id, selection);
        self.authorized
            .insert(entity_set_id, authorized.into_iter().collect());
        self
    }

    pub fn filter(mut self, filter: PropertyFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn as_of(mut self, version: Version) -> Self {
        self.as_of = Some(version);
        self
    }

    pub fn linking(mut self) -> Self {
        self.linking = true;
        self
    }
}

impl Default for EntityQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadKey {
    Entity(EntityDataKey),
    Linking(LinkingId),
}

/// One result: a single entity, or every member of a linking cluster keyed
/// by its own entity data key so entity sets are never conflated.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRow {
    pub key: ReadKey,
    pub entities: BTreeMap<EntityDataKey, PropertyMap>,
}

impl ReadRow {
    /// Properties of a single-entity row.
    pub fn properties(&self) -> Option<&PropertyMap> {
        match self.key {
            ReadKey::Entity(key) => self.entities.get(&key),
            ReadKey::Linking(_) => None,
        }
    }
}

pub struct EntityReader {
    backend: Arc<dyn StorageBackend>,
    blobs: Arc<dyn BlobStore>,
    page_size: usize,
}

impl EntityReader {
    pub fn new(backend: Arc<dyn StorageBackend>, blobs: Arc<dyn BlobStore>, page_size: usize) -> Self {
        Self {
            backend,
            blobs,
            page_size: page_size.max(1),
        }
    }

    /// Lazily read the entities selected by `query`.
    pub fn read(&self, query: EntityQuery) -> EntityCursor {
        EntityCursor::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.blobs),
            self.page_size,
            query,
        )
    }

    /// Authorized properties of one entity, or `None` if it is not live at `as_of`.
    pub fn get_entity(
        &self,
        key: EntityDataKey,
        authorized: &BTreeSet<PropertyTypeId>,
        as_of: Option<Version>,
    ) -> StoreResult<Option<PropertyMap>> {
        let Some(row) = self.backend.get_entity(&key)? else {
            return Ok(None);
        };
        if !row.is_live(as_of) {
            return Ok(None);
        }
        Ok(Some(resolve_properties(
            &*self.backend,
            &*self.blobs,
            &key,
            authorized,
            as_of,
        )?))
    }
}

fn resolve_properties(
    backend: &dyn StorageBackend,
    blobs: &dyn BlobStore,
    key: &EntityDataKey,
    authorized: &BTreeSet<PropertyTypeId>,
    as_of: Option<Version>,
) -> StoreResult<PropertyMap> {
    let mut properties = PropertyMap::new();
    for row in backend.properties_of(key)? {
        if !authorized.contains(&row.property_type_id) || !row.is_live(as_of) {
            continue;
        }
        if let Some(value) = materialize(blobs, &row) {
            properties.entry(row.property_type_id).or_default().push(value);
        }
    }
    Ok(properties)
}

fn materialize(blobs: &dyn BlobStore, row: &PropertyRow) -> Option<PropertyValue> {
    match &row.value {
        StoredValue::Inline(value) => Some(value.clone()),
        StoredValue::Blob { key, content_type } => match blobs.get(std::slice::from_ref(key)) {
            Ok(mut bytes) if bytes.len() == 1 => bytes.pop().map(|bytes| PropertyValue::Binary {
                bytes,
                content_type: content_type.clone(),
            }),
            Ok(bytes) => {
                let err = StoreError::Deserialization {
                    what: format!("blob {key}"),
                    reason: format!("expected 1 object, got {}", bytes.len()),
                };
                warn!(error = %err, "dropping binary value");
                None
            }
            Err(err) => {
                warn!(blob = %key, error = %err, "blob store read failed, dropping binary value");
                None
            }
        },
    }
}

enum Phase {
    /// Walking entity sets in order.
    Entities {
        sets: VecDeque<(EntitySetId, KeySelection)>,
        after: Option<EntityKeyId>,
    },
    Done,
}

/// Forward-only, restartable result cursor.
pub struct EntityCursor {
    backend: Arc<dyn StorageBackend>,
    blobs: Arc<dyn BlobStore>,
    page_size: usize,
    query: EntityQuery,
    phase: Phase,
    /// Results paired with the scanned key that produced them.
    buffer: VecDeque<(EntityDataKey, ReadRow)>,
    /// First in-scope member of recently seen clusters.
    cluster_owners: LruCache<LinkingId, EntityDataKey>,
    last_key: Option<EntityDataKey>,
}

impl EntityCursor {
    fn new(
        backend: Arc<dyn StorageBackend>,
        blobs: Arc<dyn BlobStore>,
        page_size: usize,
        query: EntityQuery,
    ) -> Self {
        let sets = query
            .keys_by_entity_set
            .iter()
            .map(|(id, selection)| (*id, selection.clone()))
            .collect();
        Self {
            backend,
            blobs,
            page_size,
            query,
            phase: Phase::Entities { sets, after: None },
            buffer: VecDeque::new(),
            cluster_owners: LruCache::new(
                NonZeroUsize::new(page_size).unwrap_or(NonZeroUsize::MIN),
            ),
            last_key: None,
        }
    }

    /// Scanned key behind the last result handed out: the entity itself, or
    /// the first in-scope member of a linking cluster.
    pub fn position(&self) -> Option<EntityDataKey> {
        self.last_key
    }

    /// Skip every entity, and every cluster first reached, up to and including `position`.
    pub fn resume_after(mut self, position: EntityDataKey) -> Self {
        if let Phase::Entities { sets, after } = &mut self.phase {
            while sets
                .front()
                .is_some_and(|(id, _)| *id < position.entity_set_id)
            {
                sets.pop_front();
            }
            if sets
                .front()
                .is_some_and(|(id, _)| *id == position.entity_set_id)
            {
                *after = Some(position.entity_key_id);
            }
        }
        self.last_key = Some(position);
        self
    }

    fn next_page(&mut self) -> StoreResult<()> {
        let rows = match &mut self.phase {
            Phase::Done => return Ok(()),
            Phase::Entities { sets, after } => {
                let Some((entity_set_id, selection)) = sets.front().cloned() else {
                    self.phase = Phase::Done;
                    return Ok(());
                };
                let rows = match &selection {
                    KeySelection::All => {
                        self.backend
                            .scan_entities(entity_set_id, *after, self.page_size)?
                    }
                    KeySelection::Keys(keys) => {
                        let page: Vec<EntityDataKey> = keys
                            .iter()
                            .filter(|key| after.map_or(true, |after| **key > after))
                            .take(self.page_size)
                            .map(|key| EntityDataKey::new(entity_set_id, *key))
                            .collect();
                        self.backend.get_entities(&page)?
                    }
                };
                match rows.last() {
                    Some(last) => *after = Some(last.entity_key_id),
                    None => {
                        sets.pop_front();
                        *after = None;
                    }
                }
                rows
            }
        };

        for row in rows {
            if !row.is_live(self.query.as_of) {
                continue;
            }
            let key = row.key();
            if self.query.linking {
                if let Some(linking_id) = row.linked_to(self.query.as_of) {
                    if let Some(cluster) = self.read_cluster_owned_by(&row, linking_id)? {
                        self.buffer.push_back((key, cluster));
                    }
                }
                continue;
            }
            if let Some(properties) = self.read_entity(&row)? {
                self.buffer.push_back((
                    key,
                    ReadRow {
                        key: ReadKey::Entity(key),
                        entities: BTreeMap::from([(key, properties)]),
                    },
                ));
            }
        }
        Ok(())
    }

    fn read_entity(&self, row: &EntityRow) -> StoreResult<Option<PropertyMap>> {
        let empty = BTreeSet::new();
        let authorized = self
            .query
            .authorized
            .get(&row.entity_set_id)
            .unwrap_or(&empty);
        let properties = resolve_properties(
            &*self.backend,
            &*self.blobs,
            &row.key(),
            authorized,
            self.query.as_of,
        )?;
        if self.query.filters.iter().all(|filter| filter.accepts(&properties)) {
            Ok(Some(properties))
        } else {
            Ok(None)
        }
    }

    /// Whether the scan visits `key`.
    fn scans(&self, key: &EntityDataKey) -> bool {
        match self.query.keys_by_entity_set.get(&key.entity_set_id) {
            Some(KeySelection::All) => true,
            Some(KeySelection::Keys(keys)) => keys.contains(&key.entity_key_id),
            None => false,
        }
    }

    /// The cluster `row` belongs to, but only when `row` is the first member
    /// the scan reaches. Members from every queried set are included.
    fn read_cluster_owned_by(
        &mut self,
        row: &EntityRow,
        linking_id: LinkingId,
    ) -> StoreResult<Option<ReadRow>> {
        let key = row.key();
        if self
            .cluster_owners
            .get(&linking_id)
            .is_some_and(|owner| *owner != key)
        {
            return Ok(None);
        }
        let as_of = self.query.as_of;
        let mut members = vec![row.clone()];
        for member in self.backend.entities_with_linking_id(linking_id)? {
            if member.key() != key
                && self.query.keys_by_entity_set.contains_key(&member.entity_set_id)
                && member.is_live(as_of)
                && member.linked_to(as_of) == Some(linking_id)
            {
                members.push(member);
            }
        }
        let owner = members
            .iter()
            .map(EntityRow::key)
            .filter(|member| self.scans(member))
            .fold(key, std::cmp::min);
        self.cluster_owners.put(linking_id, owner);
        if owner != key {
            return Ok(None);
        }

        let mut entities = BTreeMap::new();
        for member in &members {
            if let Some(properties) = self.read_entity(member)? {
                entities.insert(member.key(), properties);
            }
        }
        if entities.is_empty() {
            return Ok(None);
        }
        Ok(Some(ReadRow {
            key: ReadKey::Linking(linking_id),
            entities,
        }))
    }
}

impl Iterator for EntityCursor {
    type Item = StoreResult<ReadRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((position, row)) = self.buffer.pop_front() {
                self.last_key = Some(position);
                return Some(Ok(row));
            }
            if matches!(self.phase, Phase::Done) {
                return None;
            }
            if let Err(err) = self.next_page() {
                self.phase = Phase::Done;
                return Some(Err(err));
            }
        }
    }
}
