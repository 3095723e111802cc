#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use entityvault::blob::MemoryBlobStore;
use entityvault::model::{EntityDataKey, EntityKeyId, PropertyTypeId, PropertyValue};
use entityvault::version::ManualClock;
use entityvault::{EntityVault, StoreError, VaultConfig};
use test_support::{generate_people, people_schema};

#[test]
fn one_bad_entity_fails_the_whole_batch() -> anyhow::Result<()> {
    let schema = people_schema();
    let vault = EntityVault::builder(VaultConfig::default())
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .build()?;
    let authorized = schema.authorized(schema.people);

    let mut batch = generate_people(&schema, 20, 8);
    let rogue = EntityKeyId::random();
    batch.insert(
        rogue,
        HashMap::from([(PropertyTypeId::random(), vec![PropertyValue::text("x")])]),
    );

    let err = vault
        .store()
        .upsert_entities(schema.people, &batch, &authorized)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::UnauthorizedProperty { entity_key_id, .. } if entity_key_id == rogue
    ));
    for id in batch.keys() {
        assert!(vault
            .backend()
            .get_entity(&EntityDataKey::new(schema.people, *id))?
            .is_none());
    }
    Ok(())
}

#[test]
fn blob_store_outage_aborts_before_rows_are_written() -> anyhow::Result<()> {
    let schema = people_schema();
    let blobs = Arc::new(MemoryBlobStore::new());
    let vault = EntityVault::builder(VaultConfig::default())
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .blobs(blobs.clone())
        .build()?;
    let authorized = schema.authorized(schema.people);

    let id = EntityKeyId::random();
    let batch = HashMap::from([(
        id,
        HashMap::from([(
            schema.photo,
            vec![PropertyValue::binary(vec![1, 2, 3], "image/png")],
        )]),
    )]);
    blobs.set_failing(true);
    assert!(vault
        .store()
        .upsert_entities(schema.people, &batch, &authorized)
        .is_err());
    assert!(vault
        .backend()
        .get_entity(&EntityDataKey::new(schema.people, id))?
        .is_none());

    blobs.set_failing(false);
    vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    assert_eq!(blobs.len(), 1);
    Ok(())
}

#[test]
fn one_version_is_shared_by_every_row_of_a_call() -> anyhow::Result<()> {
    let schema = people_schema();
    let clock = Arc::new(ManualClock::starting_at(7_000));
    let vault = EntityVault::builder(VaultConfig::default())
        .clock(clock)
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .build()?;
    let authorized = schema.authorized(schema.people);
    let batch = generate_people(&schema, 15, 30);

    let event = vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    assert_eq!(event.count, 15);

    let mut versions = BTreeSet::new();
    for id in batch.keys() {
        let key = EntityDataKey::new(schema.people, *id);
        let row = vault.backend().get_entity(&key)?.expect("row written");
        versions.insert(row.version);
        for property in vault.backend().properties_of(&key)? {
            versions.insert(property.version);
        }
    }
    assert_eq!(versions, BTreeSet::from([event.version]));
    Ok(())
}
