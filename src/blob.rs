//! Content-addressed storage for binary property values.
//!
//! Property rows hold only the blob key; the bytes live behind a
//! [`BlobStore`]. Keys have the form
//! `{entitySetId}/{entityKeyId}/{propertyTypeId}/{contentHashHex}`.

use crate::model::{EntityKeyId, EntitySetId, PropertyTypeId, ValueHash};
use anyhow::{anyhow, Context, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub fn blob_key(
    entity_set_id: EntitySetId,
    entity_key_id: EntityKeyId,
    property_type_id: PropertyTypeId,
    hash: &ValueHash,
) -> String {
    format!(
        "{}/{}/{}/{}",
        entity_set_id.0,
        entity_key_id.0,
        property_type_id.0,
        hash.to_hex()
    )
}

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    /// Fetch every key, in order. Fails if any key is missing.
    fn get(&self, keys: &[String]) -> Result<Vec<Vec<u8>>>;
}

/// Blob store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, (Vec<u8>, String)>>,
    failing: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .get(key)
            .map(|(_, content_type)| content_type.clone())
    }

    /// Make every subsequent call fail, simulating an unreachable service.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(anyhow!("blob store unavailable"))
        } else {
            Ok(())
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        self.check_available()?;
        self.objects
            .write()
            .insert(key.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects.write().remove(key);
        Ok(())
    }

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.check_available()?;
        let mut objects = self.objects.write();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn get(&self, keys: &[String]) -> Result<Vec<Vec<u8>>> {
        self.check_available()?;
        let objects = self.objects.read();
        keys.iter()
            .map(|key| {
                objects
                    .get(key)
                    .map(|(bytes, _)| bytes.clone())
                    .ok_or_else(|| anyhow!("blob {key} not found"))
            })
            .collect()
    }
}

/// Blob store rooted at a local directory; each key maps to a file path.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating blob root {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(anyhow!("invalid blob key {key}"));
        }
        Ok(self.root.join(key))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.path_of(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).with_context(|| format!("writing blob {key}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting blob {key}")),
        }
    }

    fn get(&self, keys: &[String]) -> Result<Vec<Vec<u8>>> {
        keys.iter()
            .map(|key| {
                let path = self.path_of(key)?;
                fs::read(&path).with_context(|| format!("reading blob {key}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyValue;
    use tempfile::tempdir;

    #[test]
    fn key_layout_matches_collaborator_contract() {
        let set = EntitySetId::random();
        let entity = EntityKeyId::random();
        let property = PropertyTypeId::random();
        let hash = PropertyValue::binary(vec![1, 2], "image/png").content_hash();
        let key = blob_key(set, entity, property, &hash);
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], set.0.to_string());
        assert_eq!(parts[3], hash.to_hex());
    }

    #[test]
    fn local_store_round_trips_and_deletes() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();
        let key = "a/b/c/d".to_string();
        store.put(&key, b"payload", "text/plain").unwrap();
        assert_eq!(store.get(&[key.clone()]).unwrap(), vec![b"payload".to_vec()]);
        store.delete_many(&[key.clone()]).unwrap();
        assert!(store.get(&[key.clone()]).is_err());
        store.delete(&key).unwrap();
    }

    #[test]
    fn local_store_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();
        assert!(store.put("../escape", b"x", "text/plain").is_err());
    }

    #[test]
    fn failing_memory_store_reports_errors() {
        let store = MemoryBlobStore::new();
        store.put("k", b"v", "text/plain").unwrap();
        store.set_failing(true);
        assert!(store.get(&["k".to_string()]).is_err());
        store.set_failing(false);
        assert_eq!(store.content_type("k").as_deref(), Some("text/plain"));
    }
}
