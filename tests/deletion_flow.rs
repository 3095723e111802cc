#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::BTreeSet;
use std::sync::Arc;

use entityvault::blob::MemoryBlobStore;
use entityvault::catalog::{Permission, Principal};
use entityvault::deletion::DeleteType;
use entityvault::linking::InMemoryFeedback;
use entityvault::model::{EntityDataKey, EntityKeyId};
use entityvault::store::EdgeKey;
use entityvault::{EntityVault, StoreError, VaultConfig};
use test_support::{generate_people, named_batch, people_schema, PeopleSchema};

struct World {
    schema: PeopleSchema,
    vault: EntityVault,
    blobs: Arc<MemoryBlobStore>,
    feedback: Arc<InMemoryFeedback>,
    people: Vec<EntityDataKey>,
    place: EntityDataKey,
    visits: Vec<EntityDataKey>,
}

/// Every person visits one place; the first person also has an audit record.
fn world(people_count: usize) -> anyhow::Result<World> {
    let schema = people_schema();
    let blobs = Arc::new(MemoryBlobStore::new());
    let feedback = Arc::new(InMemoryFeedback::new());
    let vault = EntityVault::builder(VaultConfig::default())
        .metadata(schema.catalog.clone())
        .authorizer(schema.authorizer.clone())
        .blobs(blobs.clone())
        .feedback(feedback.clone())
        .build()?;

    let write = |set, batch: &entityvault::property_store::EntityBatch| -> anyhow::Result<Vec<EntityDataKey>> {
        vault.store().upsert_entities(set, batch, &schema.authorized(set))?;
        Ok(batch.keys().map(|id| EntityDataKey::new(set, *id)).collect())
    };
    let people = write(schema.people, &generate_people(&schema, people_count, 5))?;
    let place = write(schema.places, &named_batch(&schema, &["Analytical Engine"]))?[0];
    let visit_names: Vec<String> = (0..people_count).map(|i| format!("visit {i}")).collect();
    let visit_refs: Vec<&str> = visit_names.iter().map(String::as_str).collect();
    let visits = write(schema.visits, &named_batch(&schema, &visit_refs))?;
    let audit = write(schema.audit_log, &named_batch(&schema, &["created"]))?[0];

    let mut edges: Vec<EdgeKey> = people
        .iter()
        .zip(&visits)
        .map(|(person, visit)| EdgeKey {
            src: *person,
            dst: place,
            edge: *visit,
        })
        .collect();
    edges.push(EdgeKey {
        src: people[0],
        dst: place,
        edge: audit,
    });
    vault.graph().create_edges(&edges)?;

    Ok(World {
        schema,
        vault,
        blobs,
        feedback,
        people,
        place,
        visits,
    })
}

fn live(vault: &EntityVault, key: &EntityDataKey) -> anyhow::Result<bool> {
    Ok(vault
        .backend()
        .get_entity(key)?
        .is_some_and(|row| row.is_live(None)))
}

#[test]
fn deleting_a_set_removes_associations_blobs_and_audit_rows() -> anyhow::Result<()> {
    let w = world(30)?;
    let report = w.vault.deletion().clear_or_delete_entity_set(
        w.schema.people,
        DeleteType::Delete,
        &[w.schema.admin.clone()],
    )?;
    assert_eq!(report.entities, 30);
    assert_eq!(report.associations, 31);
    assert_eq!(report.edges, 31);

    for key in w.people.iter().chain(&w.visits) {
        assert!(w.vault.backend().get_entity(key)?.is_none());
    }
    assert!(w.blobs.is_empty());
    assert!(live(&w.vault, &w.place)?);
    assert!(w.vault.backend().edges_touching(&w.place)?.is_empty());
    Ok(())
}

#[test]
fn clearing_preserves_the_audit_trail() -> anyhow::Result<()> {
    let w = world(3)?;
    let report = w.vault.deletion().clear_or_delete_entities(
        w.schema.people,
        &BTreeSet::from([w.people[0].entity_key_id]),
        DeleteType::Clear,
        &[w.schema.admin.clone()],
    )?;
    assert_eq!(report.entities, 1);
    assert_eq!(report.associations, 1);

    let audit_edges: Vec<_> = w
        .vault
        .backend()
        .edges_touching(&w.people[0])?
        .into_iter()
        .filter(|edge| edge.edge.entity_set_id == w.schema.audit_log)
        .collect();
    assert_eq!(audit_edges.len(), 1);
    assert!(audit_edges[0].is_live(None));
    assert!(live(&w.vault, &audit_edges[0].edge)?);
    assert!(!live(&w.vault, &w.people[0])?);
    assert!(live(&w.vault, &w.people[1])?);
    Ok(())
}

#[test]
fn any_missing_permission_rejects_the_whole_request() -> anyhow::Result<()> {
    let w = world(4)?;
    let analyst = Principal::new("analyst");
    w.schema.grant_all(&analyst, w.schema.people, Permission::Owner);
    w.schema.grant_all(&analyst, w.schema.places, Permission::Owner);

    let err = w
        .vault
        .deletion()
        .clear_or_delete_entities(
            w.schema.people,
            &w.people.iter().map(|key| key.entity_key_id).collect(),
            DeleteType::Delete,
            &[analyst],
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::ForbiddenOperation { .. }));
    for key in w.people.iter().chain(&w.visits) {
        assert!(live(&w.vault, key)?);
    }
    Ok(())
}

#[test]
fn neighbour_deletion_follows_the_requested_direction() -> anyhow::Result<()> {
    let w = world(2)?;
    let unrelated = EntityKeyId::random();
    let report = w.vault.deletion().clear_or_delete_entities_and_neighbors(
        w.schema.people,
        &BTreeSet::from([w.people[1].entity_key_id, unrelated]),
        &BTreeSet::new(),
        &BTreeSet::from([w.schema.places]),
        DeleteType::Clear,
        &[w.schema.admin.clone()],
    )?;
    assert_eq!(report.entities, 2);
    assert!(!live(&w.vault, &w.place)?);
    assert!(live(&w.vault, &w.people[0])?);
    Ok(())
}

#[test]
fn hard_delete_drops_the_entity_from_its_cluster() -> anyhow::Result<()> {
    let w = world(3)?;
    let (a, b, c) = (w.people[0], w.people[1], w.people[2]);
    w.vault.linking().lock_clusters_do_work_and_commit(
        a,
        &BTreeSet::from([b, c]),
        &w.vault.threshold_clusterer(vec![(b, a, 0.9), (c, a, 0.9), (b, c, 0.9)]),
    )?;
    w.feedback.add_positive(b, c);

    let report = w.vault.deletion().clear_or_delete_entities(
        w.schema.people,
        &BTreeSet::from([b.entity_key_id]),
        DeleteType::Delete,
        &[w.schema.admin.clone()],
    )?;
    // The confirmed (b, c) match goes too once b's row is gone.
    assert_eq!(report.match_edges, 2);
    assert!(w.vault.linking().get_match_scores(&b)?.is_empty());
    let remaining = w.vault.linking().get_match_scores(&c)?;
    assert_eq!(remaining.len(), 1);
    assert!(!remaining[0].touches(&b));

    let clusters = w.vault.linking().get_clusters_for_ids(&BTreeSet::from([c]))?;
    assert_eq!(clusters.len(), 1);
    for cluster in clusters.values() {
        assert_eq!(cluster.keys().copied().collect::<BTreeSet<_>>(), BTreeSet::from([a, c]));
    }
    Ok(())
}
