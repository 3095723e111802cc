//! RocksDB-backed [`StorageBackend`].
//!
//! One column family per table plus `linking_index` for the secondary
//! indexes (cluster membership, match endpoints, edge endpoints). Every
//! [`WriteSet`] becomes a single RocksDB `WriteBatch`.

use crate::model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId};
use crate::store::{
    AssociationEdge, EdgeKey, EntityRow, MatchEdge, MatchKey, PartitionAssignment, PropertyKey,
    PropertyRow, StorageBackend, WriteOp, WriteSet,
};
use crate::version;
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor,
    Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::debug;

const CF_IDS: &str = "ids";
const CF_DATA: &str = "data";
const CF_MATCHES: &str = "matches";
const CF_EDGES: &str = "edges";
const CF_LINKING_INDEX: &str = "linking_index";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const PARTITIONS_PREFIX: &[u8] = b"partitions/";

const TAG_MEMBER: u8 = b'L';
const TAG_MATCH_ENDPOINT: u8 = b'M';
const TAG_EDGE_ENDPOINT: u8 = b'E';

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RocksOpenOptions {
    pub repair: bool,
    pub block_cache_mb: usize,
    pub write_buffer_mb: usize,
    pub entity_cache_capacity: usize,
}

impl Default for RocksOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            block_cache_mb: crate::config::defaults::DEFAULT_BLOCK_CACHE_MB,
            write_buffer_mb: crate::config::defaults::DEFAULT_WRITE_BUFFER_MB,
            entity_cache_capacity: crate::config::defaults::DEFAULT_ENTITY_CACHE_CAPACITY,
        }
    }
}

pub struct RocksBackend {
    db: DB,
    /// Serializes `apply` and entity cache fills.
    write_lock: Mutex<()>,
    cache: Mutex<LruCache<EntityDataKey, EntityRow>>,
}

impl RocksBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, RocksOpenOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: RocksOpenOptions) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path, &options)?;
        validate_or_init_manifest(&db)?;
        let capacity = NonZeroUsize::new(options.entity_cache_capacity.max(1))
            .ok_or_else(|| anyhow!("entity cache capacity must be positive"))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    fn get_value<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for entry in self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(bincode::deserialize(&value)?);
        }
        Ok(out)
    }

    /// Keys of `linking_index` under `prefix`, with the prefix stripped.
    fn index_suffixes(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        for entry in self.db.iterator_cf(
            self.cf(CF_LINKING_INDEX)?,
            IteratorMode::From(prefix, Direction::Forward),
        ) {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(key[prefix.len()..].to_vec());
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }
}

/// Rows read or written so far by the batch being assembled, so later ops in
/// the same `WriteSet` observe earlier ones.
#[derive(Default)]
struct Staged {
    entities: HashMap<EntityDataKey, Option<EntityRow>>,
    edges: HashMap<EdgeKey, Option<AssociationEdge>>,
}

impl RocksBackend {
    fn staged_entity(&self, staged: &mut Staged, key: EntityDataKey) -> Result<Option<EntityRow>> {
        if let Some(row) = staged.entities.get(&key) {
            return Ok(row.clone());
        }
        let row = self.get_value::<EntityRow>(CF_IDS, &key.to_bytes())?;
        staged.entities.insert(key, row.clone());
        Ok(row)
    }

    fn stage_put_entity(
        &self,
        batch: &mut WriteBatch,
        staged: &mut Staged,
        row: EntityRow,
    ) -> Result<()> {
        let key = row.key();
        let previous = self
            .staged_entity(staged, key)?
            .and_then(|old| old.linking_id);
        let index_cf = self.cf(CF_LINKING_INDEX)?;
        if previous != row.linking_id {
            if let Some(old) = previous {
                batch.delete_cf(index_cf, member_index_key(old, &key));
            }
            if let Some(new) = row.linking_id {
                batch.put_cf(index_cf, member_index_key(new, &key), []);
            }
        }
        batch.put_cf(self.cf(CF_IDS)?, key.to_bytes(), bincode::serialize(&row)?);
        staged.entities.insert(key, Some(row));
        Ok(())
    }

    fn stage(&self, batch: &mut WriteBatch, staged: &mut Staged, op: WriteOp) -> Result<()> {
        match op {
            WriteOp::PutEntity(row) => self.stage_put_entity(batch, staged, row)?,
            WriteOp::PatchEntity(key, patch) => {
                if let Some(mut row) = self.staged_entity(staged, key)? {
                    if patch.apply_to(&mut row) {
                        self.stage_put_entity(batch, staged, row)?;
                    }
                }
            }
            WriteOp::DeleteEntity(key) => {
                if let Some(row) = self.staged_entity(staged, key)? {
                    if let Some(linking_id) = row.linking_id {
                        batch.delete_cf(self.cf(CF_LINKING_INDEX)?, member_index_key(linking_id, &key));
                    }
                }
                batch.delete_cf(self.cf(CF_IDS)?, key.to_bytes());
                staged.entities.insert(key, None);
            }
            WriteOp::PutProperty(row) => {
                batch.put_cf(
                    self.cf(CF_DATA)?,
                    property_key_bytes(&row.key()),
                    bincode::serialize(&row)?,
                );
            }
            WriteOp::DeleteProperty(key) => {
                batch.delete_cf(self.cf(CF_DATA)?, property_key_bytes(&key));
            }
            WriteOp::PutMatch(edge) => {
                let key = edge.key();
                let index_cf = self.cf(CF_LINKING_INDEX)?;
                for endpoint in [key.src, key.dst] {
                    batch.put_cf(index_cf, match_index_key(&endpoint, &key), []);
                }
                batch.put_cf(self.cf(CF_MATCHES)?, match_key_bytes(&key), bincode::serialize(&edge)?);
            }
            WriteOp::DeleteMatch(key) => {
                let index_cf = self.cf(CF_LINKING_INDEX)?;
                for endpoint in [key.src, key.dst] {
                    batch.delete_cf(index_cf, match_index_key(&endpoint, &key));
                }
                batch.delete_cf(self.cf(CF_MATCHES)?, match_key_bytes(&key));
            }
            WriteOp::AppendEdgeVersion(key, version) => {
                let existing = match staged.edges.get(&key) {
                    Some(edge) => edge.clone(),
                    None => self.get_value::<AssociationEdge>(CF_EDGES, &edge_key_bytes(&key))?,
                };
                let mut edge = existing.unwrap_or_else(|| AssociationEdge {
                    src: key.src,
                    dst: key.dst,
                    edge: key.edge,
                    versions: Vec::new(),
                    version: 0,
                });
                version::append(&mut edge.versions, version);
                edge.version = version::latest(&edge.versions);
                let index_cf = self.cf(CF_LINKING_INDEX)?;
                for endpoint in key.endpoints() {
                    batch.put_cf(index_cf, edge_index_key(&endpoint, &key), []);
                }
                batch.put_cf(self.cf(CF_EDGES)?, edge_key_bytes(&key), bincode::serialize(&edge)?);
                staged.edges.insert(key, Some(edge));
            }
            WriteOp::DeleteEdge(key) => {
                let index_cf = self.cf(CF_LINKING_INDEX)?;
                for endpoint in key.endpoints() {
                    batch.delete_cf(index_cf, edge_index_key(&endpoint, &key));
                }
                batch.delete_cf(self.cf(CF_EDGES)?, edge_key_bytes(&key));
                staged.edges.insert(key, None);
            }
            WriteOp::PutPartitions(entity_set_id, assignment) => {
                batch.put_cf(
                    self.cf(CF_METADATA)?,
                    partitions_key(entity_set_id),
                    bincode::serialize(&assignment)?,
                );
            }
        }
        Ok(())
    }
}

impl StorageBackend for RocksBackend {
    fn get_entity(&self, key: &EntityDataKey) -> Result<Option<EntityRow>> {
        if let Some(row) = self.cache.lock().get(key) {
            return Ok(Some(row.clone()));
        }
        // Misses fill under the write lock; a row read before an `apply`
        // must never replace the row that `apply` cached.
        let _guard = self.write_lock.lock();
        if let Some(row) = self.cache.lock().get(key) {
            return Ok(Some(row.clone()));
        }
        let row = self.get_value::<EntityRow>(CF_IDS, &key.to_bytes())?;
        if let Some(row) = &row {
            self.cache.lock().put(*key, row.clone());
        }
        Ok(row)
    }

    fn scan_entities(
        &self,
        entity_set_id: EntitySetId,
        after: Option<EntityKeyId>,
        limit: usize,
    ) -> Result<Vec<EntityRow>> {
        let prefix = entity_set_id.as_bytes().to_vec();
        let start = match after {
            Some(after) => EntityDataKey::new(entity_set_id, after).to_bytes().to_vec(),
            None => prefix.clone(),
        };
        let mut rows = Vec::new();
        for entry in self
            .db
            .iterator_cf(self.cf(CF_IDS)?, IteratorMode::From(&start, Direction::Forward))
        {
            if rows.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            if !key.starts_with(&prefix) {
                break;
            }
            if after.is_some() && *key == start[..] {
                continue;
            }
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn properties_of(&self, key: &EntityDataKey) -> Result<Vec<PropertyRow>> {
        self.scan_prefix(CF_DATA, &key.to_bytes())
    }

    fn entities_with_linking_id(&self, linking_id: LinkingId) -> Result<Vec<EntityRow>> {
        let mut prefix = vec![TAG_MEMBER];
        prefix.extend_from_slice(linking_id.as_bytes());
        let mut rows = Vec::new();
        for suffix in self.index_suffixes(&prefix)? {
            let key = EntityDataKey::from_bytes(&suffix)
                .ok_or_else(|| anyhow!("corrupt linking index entry for {linking_id}"))?;
            if let Some(row) = self.get_entity(&key)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn matches_of_cluster(&self, linking_id: LinkingId) -> Result<Vec<MatchEdge>> {
        self.scan_prefix(CF_MATCHES, linking_id.as_bytes())
    }

    fn matches_touching(&self, key: &EntityDataKey) -> Result<Vec<MatchEdge>> {
        let mut prefix = vec![TAG_MATCH_ENDPOINT];
        prefix.extend_from_slice(&key.to_bytes());
        let mut edges = Vec::new();
        for suffix in self.index_suffixes(&prefix)? {
            if let Some(edge) = self.get_value::<MatchEdge>(CF_MATCHES, &suffix)? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    fn edges_touching(&self, key: &EntityDataKey) -> Result<Vec<AssociationEdge>> {
        let mut prefix = vec![TAG_EDGE_ENDPOINT];
        prefix.extend_from_slice(&key.to_bytes());
        let mut edges = Vec::new();
        for suffix in self.index_suffixes(&prefix)? {
            if let Some(edge) = self.get_value::<AssociationEdge>(CF_EDGES, &suffix)? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    fn partition_assignment(
        &self,
        entity_set_id: EntitySetId,
    ) -> Result<Option<PartitionAssignment>> {
        self.get_value(CF_METADATA, &partitions_key(entity_set_id))
    }

    fn apply(&self, writes: WriteSet) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let op_count = writes.len();
        let mut batch = WriteBatch::default();
        let mut staged = Staged::default();
        for op in writes.into_ops() {
            self.stage(&mut batch, &mut staged, op)?;
        }
        self.db.write(batch)?;

        let mut cache = self.cache.lock();
        for (key, row) in staged.entities {
            match row {
                Some(row) => {
                    cache.put(key, row);
                }
                None => {
                    cache.pop(&key);
                }
            }
        }
        debug!(ops = op_count, "applied write batch");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        RocksBackend::flush(self)
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        RocksBackend::checkpoint(self, path)
    }
}

impl Drop for RocksBackend {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: impl AsRef<Path>, options: &RocksOpenOptions) -> Result<DB> {
    let mut db_options = Options::default();
    db_options.create_if_missing(true);
    db_options.create_missing_column_families(true);
    db_options.set_paranoid_checks(true);
    db_options.set_write_buffer_size(options.write_buffer_mb.max(1) * 1024 * 1024);

    let cache = Cache::new_lru_cache(options.block_cache_mb.max(1) * 1024 * 1024);
    let mut table_options = BlockBasedOptions::default();
    table_options.set_block_cache(&cache);

    let cf_options = || {
        let mut cf = Options::default();
        cf.set_block_based_table_factory(&table_options);
        cf
    };
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_IDS, cf_options()),
        ColumnFamilyDescriptor::new(CF_DATA, cf_options()),
        ColumnFamilyDescriptor::new(CF_MATCHES, cf_options()),
        ColumnFamilyDescriptor::new(CF_EDGES, cf_options()),
        ColumnFamilyDescriptor::new(CF_LINKING_INDEX, cf_options()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&db_options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn property_key_bytes(key: &PropertyKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 16 + 32);
    out.extend_from_slice(&key.entity.to_bytes());
    out.extend_from_slice(key.property_type_id.as_bytes());
    out.extend_from_slice(&key.hash.0);
    out
}

fn match_key_bytes(key: &MatchKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 64);
    out.extend_from_slice(key.linking_id.as_bytes());
    out.extend_from_slice(&key.src.to_bytes());
    out.extend_from_slice(&key.dst.to_bytes());
    out
}

fn edge_key_bytes(key: &EdgeKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    for endpoint in key.endpoints() {
        out.extend_from_slice(&endpoint.to_bytes());
    }
    out
}

fn member_index_key(linking_id: LinkingId, key: &EntityDataKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 16 + 32);
    out.push(TAG_MEMBER);
    out.extend_from_slice(linking_id.as_bytes());
    out.extend_from_slice(&key.to_bytes());
    out
}

fn match_index_key(endpoint: &EntityDataKey, key: &MatchKey) -> Vec<u8> {
    let mut out = vec![TAG_MATCH_ENDPOINT];
    out.extend_from_slice(&endpoint.to_bytes());
    out.extend_from_slice(&match_key_bytes(key));
    out
}

fn edge_index_key(endpoint: &EntityDataKey, key: &EdgeKey) -> Vec<u8> {
    let mut out = vec![TAG_EDGE_ENDPOINT];
    out.extend_from_slice(&endpoint.to_bytes());
    out.extend_from_slice(&edge_key_bytes(key));
    out
}

fn partitions_key(entity_set_id: EntitySetId) -> Vec<u8> {
    let mut out = PARTITIONS_PREFIX.to_vec();
    out.extend_from_slice(entity_set_id.as_bytes());
    out
}
