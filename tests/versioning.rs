#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use entityvault::model::{EntityDataKey, EntityKeyId, PropertyValue};
use entityvault::query::{EntityQuery, KeySelection, PropertyFilter};
use entityvault::version::ManualClock;
use entityvault::{EntityVault, StoreResult, VaultConfig};
use test_support::{generate_people, named_batch, people_schema, PeopleSchema};

fn vault(schema: &PeopleSchema, clock: Arc<ManualClock>) -> anyhow::Result<EntityVault> {
    EntityVault::builder(VaultConfig::default())
        .clock(clock)
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .build()
}

#[test]
fn clear_is_visible_only_after_its_version() -> anyhow::Result<()> {
    let schema = people_schema();
    let clock = Arc::new(ManualClock::starting_at(100));
    let vault = vault(&schema, clock.clone())?;
    let authorized = schema.authorized(schema.people);
    let readable: BTreeSet<_> = authorized.keys().copied().collect();

    let batch = named_batch(&schema, &["A"]);
    let id = *batch.keys().next().expect("one entity");
    let key = EntityDataKey::new(schema.people, id);
    let written = vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    assert_eq!(written.version, 100);

    clock.set(200);
    vault.store().clear_entities(schema.people, &[id], &authorized)?;

    let before = vault.reader().get_entity(key, &readable, Some(150))?;
    assert_eq!(
        before.and_then(|properties| properties.get(&schema.name).cloned()),
        Some(vec![PropertyValue::text("A")])
    );
    assert!(vault.reader().get_entity(key, &readable, None)?.is_none());

    let row = vault.backend().get_entity(&key)?.expect("cleared rows are kept");
    assert_eq!(row.versions, vec![100, -200]);

    vault.store().delete_entity_data(schema.people, &[id], &authorized)?;
    assert!(vault.backend().get_entity(&key)?.is_none());
    assert!(vault.backend().properties_of(&key)?.is_empty());
    assert!(vault.reader().get_entity(key, &readable, Some(150))?.is_none());
    Ok(())
}

#[test]
fn replace_keeps_history_for_as_of_reads() -> anyhow::Result<()> {
    let schema = people_schema();
    let clock = Arc::new(ManualClock::starting_at(10));
    let vault = vault(&schema, clock.clone())?;
    let authorized = schema.authorized(schema.people);
    let readable: BTreeSet<_> = authorized.keys().copied().collect();

    let id = EntityKeyId::random();
    let key = EntityDataKey::new(schema.people, id);
    let first = HashMap::from([(
        id,
        HashMap::from([
            (schema.name, vec![PropertyValue::text("Ada")]),
            (schema.age, vec![PropertyValue::Int64(36)]),
        ]),
    )]);
    vault.store().upsert_entities(schema.people, &first, &authorized)?;

    clock.set(50);
    let second = HashMap::from([(
        id,
        HashMap::from([(schema.name, vec![PropertyValue::text("Ada Lovelace")])]),
    )]);
    let event = vault.store().replace_entities(schema.people, &second, &authorized)?;
    assert_eq!(event.version, 51);

    let now = vault.reader().get_entity(key, &readable, None)?.expect("live");
    assert_eq!(now[&schema.name], vec![PropertyValue::text("Ada Lovelace")]);
    assert!(!now.contains_key(&schema.age));

    let then = vault.reader().get_entity(key, &readable, Some(20))?.expect("live at 20");
    assert_eq!(then[&schema.name], vec![PropertyValue::text("Ada")]);
    assert_eq!(then[&schema.age], vec![PropertyValue::Int64(36)]);
    Ok(())
}

#[test]
fn replaying_a_write_at_the_same_version_changes_nothing() -> anyhow::Result<()> {
    let schema = people_schema();
    let clock = Arc::new(ManualClock::starting_at(500));
    let vault = vault(&schema, clock.clone())?;
    let authorized = schema.authorized(schema.people);
    let batch = generate_people(&schema, 25, 11);

    vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    let snapshot = |vault: &EntityVault| -> anyhow::Result<Vec<_>> {
        let mut rows = Vec::new();
        for id in batch.keys() {
            let key = EntityDataKey::new(schema.people, *id);
            rows.push((vault.backend().get_entity(&key)?, vault.backend().properties_of(&key)?));
        }
        Ok(rows)
    };
    let before = snapshot(&vault)?;

    clock.set(500);
    vault.store().upsert_entities(schema.people, &batch, &authorized)?;
    assert_eq!(before, snapshot(&vault)?);
    Ok(())
}

#[test]
fn cursor_filters_and_resumes() -> anyhow::Result<()> {
    let schema = people_schema();
    let vault = vault(&schema, Arc::new(ManualClock::starting_at(1)))?;
    let authorized = schema.authorized(schema.people);
    let batch = generate_people(&schema, 40, 3);
    vault.store().upsert_entities(schema.people, &batch, &authorized)?;

    let query = || {
        EntityQuery::new()
            .entity_set(schema.people, KeySelection::All, authorized.keys().copied())
            .filter(PropertyFilter::Range {
                property_type_id: schema.age,
                min: Some(18.0),
                max: Some(50.0),
            })
    };
    let expected = batch
        .values()
        .filter(|properties| {
            properties[&schema.age]
                .iter()
                .any(|value| matches!(value, PropertyValue::Int64(age) if *age <= 50))
        })
        .count();

    let mut cursor = vault.reader().read(query());
    let head: Vec<_> = cursor.by_ref().take(5).collect::<StoreResult<_>>()?;
    let position = cursor.position().expect("cursor moved");
    let tail: Vec<_> = vault
        .reader()
        .read(query())
        .resume_after(position)
        .collect::<StoreResult<_>>()?;

    assert_eq!(head.len(), expected.min(5));
    let mut seen: BTreeSet<_> = head.iter().map(|row| row.key).collect();
    for row in &tail {
        assert!(seen.insert(row.key), "row returned twice");
    }
    assert_eq!(seen.len(), expected);
    Ok(())
}
