#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::BTreeSet;
use std::sync::Arc;

use entityvault::config::{ConfigOverrides, StorageOverrides};
use entityvault::model::EntityDataKey;
use entityvault::persistence::RocksBackend;
use entityvault::version::ManualClock;
use entityvault::{EntityVault, StorageBackend, VaultConfig};
use tempfile::tempdir;
use test_support::{generate_people, people_schema, PeopleSchema};

fn open(
    schema: &PeopleSchema,
    dir: &std::path::Path,
    clock: Arc<ManualClock>,
) -> anyhow::Result<EntityVault> {
    let config = VaultConfig::load(
        None,
        ConfigOverrides {
            storage: Some(StorageOverrides {
                data_dir: Some(dir.to_path_buf()),
                repair: None,
            }),
            ..Default::default()
        },
    )?;
    EntityVault::builder(config)
        .clock(clock)
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .build()
}

#[test]
fn rows_blobs_and_clusters_survive_reopen() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let schema = people_schema();
    let batch = generate_people(&schema, 50, 99);
    let authorized = schema.authorized(schema.people);
    let readable: BTreeSet<_> = authorized.keys().copied().collect();
    let keys: Vec<EntityDataKey> = batch
        .keys()
        .map(|id| EntityDataKey::new(schema.people, *id))
        .collect();

    let linking_id = {
        let vault = open(&schema, dir.path(), Arc::new(ManualClock::starting_at(1_000)))?;
        vault.store().upsert_entities(schema.people, &batch, &authorized)?;
        vault.store().clear_entities(schema.people, &[keys[0].entity_key_id], &authorized)?;
        let outcome = vault.linking().lock_clusters_do_work_and_commit(
            keys[1],
            &BTreeSet::from([keys[2]]),
            &vault.threshold_clusterer(vec![(keys[1], keys[2], 0.95)]),
        )?;
        vault.flush()?;
        outcome.linking_id
    };

    let vault = open(&schema, dir.path(), Arc::new(ManualClock::starting_at(5_000)))?;
    assert!(vault.reader().get_entity(keys[0], &readable, None)?.is_none());
    assert!(vault.reader().get_entity(keys[0], &readable, Some(1_000))?.is_some());
    for key in &keys[1..] {
        let properties = vault
            .reader()
            .get_entity(*key, &readable, None)?
            .expect("live after reopen");
        let original = &batch[&key.entity_key_id];
        for (property_type_id, values) in original {
            assert_eq!(&properties[property_type_id], values);
        }
    }

    let ids = vault
        .linking()
        .get_linking_ids(&BTreeSet::from([keys[1], keys[2]]))?;
    assert!(ids.values().all(|id| *id == linking_id));
    assert_eq!(vault.linking().get_match_scores(&keys[2])?.len(), 1);
    Ok(())
}

#[test]
fn checkpoint_opens_as_an_independent_store() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let schema = people_schema();
    let batch = generate_people(&schema, 10, 1);
    let authorized = schema.authorized(schema.people);

    let vault = open(&schema, dir.path(), Arc::new(ManualClock::starting_at(10)))?;
    vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    let snapshot = dir.path().join("snapshot");
    vault.checkpoint(&snapshot)?;

    let all: Vec<_> = batch.keys().copied().collect();
    vault.store().delete_entity_data(schema.people, &all, &authorized)?;
    assert!(vault.backend().scan_entities(schema.people, None, 100)?.is_empty());

    let restored = RocksBackend::open(&snapshot)?;
    assert_eq!(restored.scan_entities(schema.people, None, 100)?.len(), 10);
    Ok(())
}
