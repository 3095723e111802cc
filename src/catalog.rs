//! Entity-type and property-type metadata, plus authorization.
//!
//! Both are owned outside the store and treated as read-only inputs. The
//! in-memory implementations back the facade and the tests.

use crate::model::{DataType, EntitySetId, EntityTypeId, PropertyTypeId};
use anyhow::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Path of securable object ids, e.g. `[entity_set_id]` or
/// `[entity_set_id, property_type_id]`.
pub type AclKey = Vec<Uuid>;

pub fn entity_set_acl_key(entity_set_id: EntitySetId) -> AclKey {
    vec![entity_set_id.0]
}

pub fn property_acl_key(entity_set_id: EntitySetId, property_type_id: PropertyTypeId) -> AclKey {
    vec![entity_set_id.0, property_type_id.0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    Read,
    Write,
    Owner,
}

impl Permission {
    /// Owner implies write; write implies read.
    pub fn satisfies(self, required: Permission) -> bool {
        self >= required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    pub id: PropertyTypeId,
    /// Fully qualified name, `namespace.name`.
    pub fqn: String,
    pub datatype: DataType,
}

impl PropertyType {
    pub fn new(fqn: impl Into<String>, datatype: DataType) -> Self {
        Self {
            id: PropertyTypeId::random(),
            fqn: fqn.into(),
            datatype,
        }
    }

    pub fn is_binary(&self) -> bool {
        self.datatype == DataType::Binary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub property_types: Vec<PropertyTypeId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySetFlags {
    pub association: bool,
    pub audit: bool,
    pub linking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySet {
    pub id: EntitySetId,
    pub name: String,
    pub entity_type_id: EntityTypeId,
    pub flags: EntitySetFlags,
    /// Normal entity sets a linking entity set draws from.
    pub linked_entity_sets: Vec<EntitySetId>,
}

impl EntitySet {
    pub fn new(name: impl Into<String>, entity_type_id: EntityTypeId) -> Self {
        Self {
            id: EntitySetId::random(),
            name: name.into(),
            entity_type_id,
            flags: EntitySetFlags::default(),
            linked_entity_sets: Vec::new(),
        }
    }

    pub fn association(mut self) -> Self {
        self.flags.association = true;
        self
    }

    pub fn audit(mut self) -> Self {
        self.flags.audit = true;
        self
    }

    pub fn is_association(&self) -> bool {
        self.flags.association
    }

    pub fn is_audit(&self) -> bool {
        self.flags.audit
    }
}

/// Authorized property types of one entity set, keyed by id.
pub type AuthorizedPropertyTypes = BTreeMap<PropertyTypeId, PropertyType>;

/// Entity-type / property-type metadata collaborator.
pub trait EntityMetadata: Send + Sync {
    fn entity_set(&self, entity_set_id: EntitySetId) -> Result<Option<EntitySet>>;

    fn entity_type(&self, entity_type_id: EntityTypeId) -> Result<Option<EntityType>>;

    fn property_type(&self, property_type_id: PropertyTypeId) -> Result<Option<PropertyType>>;

    /// Property types of the set's entity type. Unknown ids are skipped.
    fn property_types_of_set(&self, entity_set_id: EntitySetId) -> Result<AuthorizedPropertyTypes> {
        let mut out = AuthorizedPropertyTypes::new();
        let Some(entity_set) = self.entity_set(entity_set_id)? else {
            return Ok(out);
        };
        let Some(entity_type) = self.entity_type(entity_set.entity_type_id)? else {
            return Ok(out);
        };
        for id in entity_type.property_types {
            if let Some(property_type) = self.property_type(id)? {
                out.insert(id, property_type);
            }
        }
        Ok(out)
    }
}

/// Authorization collaborator.
pub trait Authorizer: Send + Sync {
    /// Return the acl keys of `requests` that `principals` lack.
    fn unauthorized(
        &self,
        requests: &[(AclKey, Permission)],
        principals: &[Principal],
    ) -> Result<Vec<AclKey>>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entity_sets: RwLock<HashMap<EntitySetId, EntitySet>>,
    entity_types: RwLock<HashMap<EntityTypeId, EntityType>>,
    property_types: RwLock<HashMap<PropertyTypeId, PropertyType>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_property_type(&self, property_type: PropertyType) -> PropertyTypeId {
        let id = property_type.id;
        self.property_types.write().insert(id, property_type);
        id
    }

    pub fn add_entity_type(&self, property_types: Vec<PropertyTypeId>) -> EntityTypeId {
        let id = EntityTypeId::random();
        self.entity_types.write().insert(
            id,
            EntityType {
                id,
                property_types,
            },
        );
        id
    }

    pub fn add_entity_set(&self, entity_set: EntitySet) -> EntitySetId {
        let id = entity_set.id;
        self.entity_sets.write().insert(id, entity_set);
        id
    }
}

impl EntityMetadata for InMemoryCatalog {
    fn entity_set(&self, entity_set_id: EntitySetId) -> Result<Option<EntitySet>> {
        Ok(self.entity_sets.read().get(&entity_set_id).cloned())
    }

    fn entity_type(&self, entity_type_id: EntityTypeId) -> Result<Option<EntityType>> {
        Ok(self.entity_types.read().get(&entity_type_id).cloned())
    }

    fn property_type(&self, property_type_id: PropertyTypeId) -> Result<Option<PropertyType>> {
        Ok(self.property_types.read().get(&property_type_id).cloned())
    }
}

/// Grant table. A principal holding a permission on an acl key also holds
/// every weaker permission on it.
#[derive(Debug, Default)]
pub struct InMemoryAuthorizer {
    grants: RwLock<HashMap<(AclKey, Principal), Permission>>,
    superusers: RwLock<HashSet<Principal>>,
}

impl InMemoryAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, principal: &Principal, acl_key: AclKey, permission: Permission) {
        let mut grants = self.grants.write();
        let entry = grants
            .entry((acl_key, principal.clone()))
            .or_insert(permission);
        if permission > *entry {
            *entry = permission;
        }
    }

    pub fn revoke(&self, principal: &Principal, acl_key: &AclKey) {
        self.grants
            .write()
            .remove(&(acl_key.clone(), principal.clone()));
    }

    /// Principal passes every check.
    pub fn add_superuser(&self, principal: Principal) {
        self.superusers.write().insert(principal);
    }

    fn holds(&self, principal: &Principal, acl_key: &AclKey, required: Permission) -> bool {
        if self.superusers.read().contains(principal) {
            return true;
        }
        self.grants
            .read()
            .get(&(acl_key.clone(), principal.clone()))
            .is_some_and(|granted| granted.satisfies(required))
    }
}

impl Authorizer for InMemoryAuthorizer {
    fn unauthorized(
        &self,
        requests: &[(AclKey, Permission)],
        principals: &[Principal],
    ) -> Result<Vec<AclKey>> {
        let mut denied = Vec::new();
        for (acl_key, required) in requests {
            let allowed = principals
                .iter()
                .any(|principal| self.holds(principal, acl_key, *required));
            if !allowed && !denied.contains(acl_key) {
                denied.push(acl_key.clone());
            }
        }
        Ok(denied)
    }
}
