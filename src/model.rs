//! # Data Model
//!
//! Identifiers, typed property values and content hashing shared by the
//! property store, the linking graph and the deletion orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl $name {
            /// Draw a fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", $prefix, self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a named collection of entities.
    EntitySetId,
    "es"
);
uuid_id!(
    /// Identifier of one entity inside an entity set.
    EntityKeyId,
    "ek"
);
uuid_id!(
    /// Identifier of a property type.
    PropertyTypeId,
    "pt"
);
uuid_id!(
    /// Identifier of an entity type (a schema: a set of property types).
    EntityTypeId,
    "et"
);
uuid_id!(
    /// Canonical identifier of a cluster of duplicate entities.
    LinkingId,
    "ln"
);

/// Uniquely identifies one entity's row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityDataKey {
    pub entity_set_id: EntitySetId,
    pub entity_key_id: EntityKeyId,
}

impl EntityDataKey {
    pub fn new(entity_set_id: EntitySetId, entity_key_id: EntityKeyId) -> Self {
        Self {
            entity_set_id,
            entity_key_id,
        }
    }

    /// Encode as 32 bytes (entity set id followed by entity key id).
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(self.entity_set_id.as_bytes());
        out[16..].copy_from_slice(self.entity_key_id.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 32 {
            return None;
        }
        let set: [u8; 16] = bytes[..16].try_into().ok()?;
        let key: [u8; 16] = bytes[16..32].try_into().ok()?;
        Some(Self::new(
            EntitySetId::from_bytes(set),
            EntityKeyId::from_bytes(key),
        ))
    }
}

impl fmt::Display for EntityDataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_set_id.0, self.entity_key_id.0)
    }
}

/// Scalar datatype tag supplied by the property-type metadata collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Text,
    Int64,
    Double,
    Boolean,
    Binary,
    /// Milliseconds since the UNIX epoch.
    Timestamp,
    Guid,
}

impl DataType {
    fn tag(self) -> u8 {
        match self {
            DataType::Text => 1,
            DataType::Int64 => 2,
            DataType::Double => 3,
            DataType::Boolean => 4,
            DataType::Binary => 5,
            DataType::Timestamp => 6,
            DataType::Guid => 7,
        }
    }
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Text(String),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    Binary {
        bytes: Vec<u8>,
        content_type: String,
    },
    Timestamp(i64),
    Guid(Uuid),
}

impl PropertyValue {
    pub fn text(value: impl Into<String>) -> Self {
        PropertyValue::Text(value.into())
    }

    pub fn binary(bytes: impl Into<Vec<u8>>, content_type: impl Into<String>) -> Self {
        PropertyValue::Binary {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            PropertyValue::Text(_) => DataType::Text,
            PropertyValue::Int64(_) => DataType::Int64,
            PropertyValue::Double(_) => DataType::Double,
            PropertyValue::Boolean(_) => DataType::Boolean,
            PropertyValue::Binary { .. } => DataType::Binary,
            PropertyValue::Timestamp(_) => DataType::Timestamp,
            PropertyValue::Guid(_) => DataType::Guid,
        }
    }

    /// Deterministic content hash of the typed value.
    ///
    /// The datatype tag is hashed first so equal byte payloads of different
    /// types never share a hash. Binary values hash their bytes only; the
    /// content type is metadata, not identity.
    pub fn content_hash(&self) -> ValueHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[self.data_type().tag()]);
        match self {
            PropertyValue::Text(value) => {
                hasher.update(value.as_bytes());
            }
            PropertyValue::Int64(value) | PropertyValue::Timestamp(value) => {
                hasher.update(&value.to_le_bytes());
            }
            PropertyValue::Double(value) => {
                hasher.update(&canonical_f64_bits(*value).to_le_bytes());
            }
            PropertyValue::Boolean(value) => {
                hasher.update(&[u8::from(*value)]);
            }
            PropertyValue::Binary { bytes, .. } => {
                hasher.update(bytes);
            }
            PropertyValue::Guid(value) => {
                hasher.update(value.as_bytes());
            }
        }
        ValueHash(*hasher.finalize().as_bytes())
    }

    /// Numeric view used by range filters.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Int64(value) | PropertyValue::Timestamp(value) => Some(*value as f64),
            PropertyValue::Double(value) => Some(*value),
            _ => None,
        }
    }
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// 256-bit content hash of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueHash(pub [u8; 32]);

impl ValueHash {
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ValueHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Values keyed by property type, as submitted by writers.
pub type EntityProperties = HashMap<PropertyTypeId, Vec<PropertyValue>>;

/// Values keyed by property type, as returned by readers (deduplicated by hash).
pub type PropertyMap = BTreeMap<PropertyTypeId, Vec<PropertyValue>>;

/// Result of a write or delete call: the version applied and the number of
/// entities it touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEvent {
    pub version: i64,
    pub count: usize,
}

impl WriteEvent {
    pub fn new(version: i64, count: usize) -> Self {
        Self { version, count }
    }

    pub fn empty(version: i64) -> Self {
        Self { version, count: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = PropertyValue::text("alice");
        let b = PropertyValue::text("alice");
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_distinguishes_types_with_equal_payloads() {
        let int = PropertyValue::Int64(1);
        let ts = PropertyValue::Timestamp(1);
        let text = PropertyValue::text("1");
        assert_ne!(int.content_hash(), ts.content_hash());
        assert_ne!(int.content_hash(), text.content_hash());
        assert_ne!(PropertyValue::Boolean(true).content_hash(), PropertyValue::Int64(1).content_hash());
    }

    #[test]
    fn content_hash_has_no_collisions_across_distinct_values() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..2_000i64 {
            assert!(seen.insert(PropertyValue::Int64(i).content_hash()));
            assert!(seen.insert(PropertyValue::text(format!("v{i}")).content_hash()));
            assert!(seen.insert(PropertyValue::Double(i as f64 + 0.5).content_hash()));
        }
    }

    #[test]
    fn signed_zero_hashes_identically() {
        assert_eq!(
            PropertyValue::Double(0.0).content_hash(),
            PropertyValue::Double(-0.0).content_hash()
        );
    }

    #[test]
    fn binary_hash_ignores_content_type() {
        let a = PropertyValue::binary(vec![1, 2, 3], "image/png");
        let b = PropertyValue::binary(vec![1, 2, 3], "application/octet-stream");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().to_hex().len(), 64);
    }

    #[test]
    fn entity_data_key_bytes_round_trip() {
        let key = EntityDataKey::new(EntitySetId::random(), EntityKeyId::random());
        assert_eq!(EntityDataKey::from_bytes(&key.to_bytes()), Some(key));
    }
}
