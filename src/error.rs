//! Error taxonomy surfaced to callers of the store.
//!
//! Failures are always phrased in terms of entity sets, entity keys and
//! property types. Storage-engine failures are wrapped in [`StoreError::Backend`].

use crate::catalog::AclKey;
use crate::model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId, PropertyTypeId};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "property type {property_type_id} is not authorized for entity {entity_key_id} in entity set {entity_set_id}"
    )]
    UnauthorizedProperty {
        entity_set_id: EntitySetId,
        entity_key_id: EntityKeyId,
        property_type_id: PropertyTypeId,
    },

    #[error("operation forbidden: missing permissions on {} acl key(s)", .acl_keys.len())]
    ForbiddenOperation { acl_keys: Vec<AclKey> },

    #[error("internal consistency violation in {context}: expected {expected} entries, found {actual}")]
    ConflictingVersionInvariantViolation {
        context: String,
        expected: usize,
        actual: usize,
    },

    #[error("timed out after {waited_ms}ms acquiring lock on {what}")]
    LockTimeout { what: String, waited_ms: u64 },

    #[error("failed to deserialize {what}: {reason}")]
    Deserialization { what: String, reason: String },

    #[error(
        "partitions of entity set {entity_set_id} changed during write (expected version {expected}, found {actual})"
    )]
    PartitionsVersionConflict {
        entity_set_id: EntitySetId,
        expected: i32,
        actual: i32,
    },

    #[error("invalid partitions for entity set {entity_set_id}: {reason}")]
    InvalidPartitions {
        entity_set_id: EntitySetId,
        reason: String,
    },

    #[error("entity {key} already belongs to cluster {linking_id}")]
    ClusterMembership {
        key: EntityDataKey,
        linking_id: LinkingId,
    },

    #[error("unknown entity set {0}")]
    UnknownEntitySet(EntitySetId),

    #[error("unknown property type {0}")]
    UnknownPropertyType(PropertyTypeId),

    #[error("invalid value for property type {property_type_id}: {reason}")]
    InvalidValue {
        property_type_id: PropertyTypeId,
        reason: String,
    },

    #[error("{completed} update(s) completed before failure: {source}")]
    PartialFailure {
        completed: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("storage backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Wrap `self` with the number of updates that had already been committed.
    pub fn after(self, completed: usize) -> Self {
        if completed == 0 {
            return self;
        }
        match self {
            StoreError::PartialFailure {
                completed: inner,
                source,
            } => StoreError::PartialFailure {
                completed: completed + inner,
                source,
            },
            other => StoreError::PartialFailure {
                completed,
                source: Box::new(other),
            },
        }
    }

    /// Updates committed before this error, zero unless it is a partial failure.
    pub fn completed(&self) -> usize {
        match self {
            StoreError::PartialFailure { completed, .. } => *completed,
            _ => 0,
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::LockTimeout { .. } | StoreError::PartitionsVersionConflict { .. }
        )
    }
}
