use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use entityvault::catalog::{
    entity_set_acl_key, property_acl_key, AuthorizedPropertyTypes, EntityMetadata, EntitySet,
    InMemoryAuthorizer, InMemoryCatalog, Permission, Principal, PropertyType,
};
use entityvault::model::{DataType, EntityKeyId, EntitySetId, PropertyTypeId, PropertyValue};
use entityvault::property_store::EntityBatch;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct PeopleSchema {
    pub catalog: Arc<InMemoryCatalog>,
    pub authorizer: Arc<InMemoryAuthorizer>,
    pub people: EntitySetId,
    pub places: EntitySetId,
    pub visits: EntitySetId,
    pub audit_log: EntitySetId,
    pub name: PropertyTypeId,
    pub age: PropertyTypeId,
    pub photo: PropertyTypeId,
    pub admin: Principal,
}

#[allow(dead_code)]
impl PeopleSchema {
    pub fn authorized(&self, entity_set_id: EntitySetId) -> AuthorizedPropertyTypes {
        self.catalog
            .property_types_of_set(entity_set_id)
            .expect("in-memory catalog")
    }

    pub fn grant_all(&self, principal: &Principal, entity_set_id: EntitySetId, permission: Permission) {
        self.authorizer
            .grant(principal, entity_set_acl_key(entity_set_id), permission);
        for property_type_id in self.authorized(entity_set_id).keys() {
            self.authorizer.grant(
                principal,
                property_acl_key(entity_set_id, *property_type_id),
                permission,
            );
        }
    }
}

/// Person, place and visit sets plus an audit association set; `admin` owns all of them.
pub fn people_schema() -> PeopleSchema {
    let catalog = Arc::new(InMemoryCatalog::new());
    let authorizer = Arc::new(InMemoryAuthorizer::new());

    let name = catalog.add_property_type(PropertyType::new("general.name", DataType::Text));
    let age = catalog.add_property_type(PropertyType::new("person.age", DataType::Int64));
    let photo = catalog.add_property_type(PropertyType::new("person.photo", DataType::Binary));

    let person_type = catalog.add_entity_type(vec![name, age, photo]);
    let named_type = catalog.add_entity_type(vec![name]);

    let people = catalog.add_entity_set(EntitySet::new("people", person_type));
    let places = catalog.add_entity_set(EntitySet::new("places", named_type));
    let visits = catalog.add_entity_set(EntitySet::new("visits", named_type).association());
    let audit_log =
        catalog.add_entity_set(EntitySet::new("audit_log", named_type).association().audit());

    let schema = PeopleSchema {
        catalog,
        authorizer,
        people,
        places,
        visits,
        audit_log,
        name,
        age,
        photo,
        admin: Principal::new("admin"),
    };
    for entity_set_id in [people, places, visits, audit_log] {
        schema.grant_all(&schema.admin, entity_set_id, Permission::Owner);
    }
    schema
}

pub fn generate_people(schema: &PeopleSchema, count: usize, seed: u64) -> EntityBatch {
    let mut rng = StdRng::seed_from_u64(seed);
    let first_names = ["Ada", "Grace", "Alan", "Edsger", "Barbara", "Ken"];
    let last_names = ["Lovelace", "Hopper", "Turing", "Dijkstra", "Liskov", "Thompson"];

    let mut batch = EntityBatch::with_capacity(count);
    for _ in 0..count {
        let key = EntityKeyId(Uuid::from_u128(rng.random::<u128>()));
        let full_name = format!(
            "{} {}",
            first_names[rng.random_range(0..first_names.len())],
            last_names[rng.random_range(0..last_names.len())]
        );
        let mut properties = HashMap::new();
        properties.insert(schema.name, vec![PropertyValue::text(full_name)]);
        properties.insert(schema.age, vec![PropertyValue::Int64(rng.random_range(18..90))]);
        if rng.random_bool(0.2) {
            let bytes: Vec<u8> = (0..32).map(|_| rng.random::<u8>()).collect();
            properties.insert(schema.photo, vec![PropertyValue::binary(bytes, "image/png")]);
        }
        batch.insert(key, properties);
    }
    batch
}

#[allow(dead_code)]
pub fn named_batch(schema: &PeopleSchema, names: &[&str]) -> EntityBatch {
    names
        .iter()
        .map(|name| {
            let mut properties = HashMap::new();
            properties.insert(schema.name, vec![PropertyValue::text(*name)]);
            (EntityKeyId::random(), properties)
        })
        .collect()
}
