//! # Deletion Orchestrator
//!
//! Computes the authorized closure of a deletion (targets, the association
//! entities connecting them, and the edges those associations carry), checks
//! every permission up front, then drives the graph, property store and
//! linking service. Associations always go before the entities they connect.

use crate::catalog::{
    entity_set_acl_key, property_acl_key, AclKey, AuthorizedPropertyTypes, Authorizer,
    EntityMetadata, EntitySet, Permission, Principal,
};
use crate::config::defaults;
use crate::error::{StoreError, StoreResult};
use crate::graph::{EdgeFilter, GraphService};
use crate::linking::{LinkingFeedback, LinkingService};
use crate::model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId};
use crate::property_store::PropertyStore;
use crate::store::{EdgeKey, MatchKey};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteType {
    /// Soft delete: tombstone versions, keep rows.
    Clear,
    /// Hard delete: remove rows.
    Delete,
}

impl DeleteType {
    pub fn required_permission(self) -> Permission {
        match self {
            DeleteType::Clear => Permission::Write,
            DeleteType::Delete => Permission::Owner,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub entities: usize,
    pub associations: usize,
    pub edges: usize,
    pub match_edges: usize,
}

impl DeletionReport {
    /// Rows, edges and match scores written so far.
    pub fn updates(&self) -> usize {
        self.entities + self.associations + self.edges + self.match_edges
    }
}

impl AddAssign for DeletionReport {
    fn add_assign(&mut self, other: Self) {
        self.entities += other.entities;
        self.associations += other.associations;
        self.edges += other.edges;
        self.match_edges += other.match_edges;
    }
}

/// Everything one deletion touches, resolved before any write.
#[derive(Debug, Default)]
struct DeletionPlan {
    targets: BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
    target_edges: BTreeMap<EntitySetId, BTreeSet<EdgeKey>>,
    associations: BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
    association_edges: BTreeMap<EntitySetId, BTreeSet<EdgeKey>>,
    authorized: BTreeMap<EntitySetId, AuthorizedPropertyTypes>,
    entity_sets: BTreeMap<EntitySetId, EntitySet>,
}

impl DeletionPlan {
    fn is_target(&self, key: &EntityDataKey) -> bool {
        self.targets
            .get(&key.entity_set_id)
            .is_some_and(|keys| keys.contains(&key.entity_key_id))
    }
}

pub struct DeletionOrchestrator {
    store: Arc<PropertyStore>,
    graph: Arc<GraphService>,
    linking: Arc<LinkingService>,
    metadata: Arc<dyn EntityMetadata>,
    authorizer: Arc<dyn Authorizer>,
    feedback: Arc<dyn LinkingFeedback>,
    chunk_size: usize,
}

impl DeletionOrchestrator {
    pub fn new(
        store: Arc<PropertyStore>,
        graph: Arc<GraphService>,
        linking: Arc<LinkingService>,
        metadata: Arc<dyn EntityMetadata>,
        authorizer: Arc<dyn Authorizer>,
        feedback: Arc<dyn LinkingFeedback>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            graph,
            linking,
            metadata,
            authorizer,
            feedback,
            chunk_size: chunk_size.clamp(1, defaults::MAX_DELETE_CHUNK_SIZE),
        }
    }

    /// Clear or delete every entity of a set along with its associations.
    #[instrument(skip(self, principals), level = "debug")]
    pub fn clear_or_delete_entity_set(
        &self,
        entity_set_id: EntitySetId,
        delete_type: DeleteType,
        principals: &[Principal],
    ) -> StoreResult<DeletionReport> {
        let keys = self.all_keys_of(entity_set_id)?;
        let targets = BTreeMap::from([(entity_set_id, keys)]);
        self.run(targets, delete_type, principals)
    }

    #[instrument(skip(self, entity_key_ids, principals), level = "debug")]
    pub fn clear_or_delete_entities(
        &self,
        entity_set_id: EntitySetId,
        entity_key_ids: &BTreeSet<EntityKeyId>,
        delete_type: DeleteType,
        principals: &[Principal],
    ) -> StoreResult<DeletionReport> {
        let targets = BTreeMap::from([(entity_set_id, entity_key_ids.clone())]);
        self.run(targets, delete_type, principals)
    }

    /// Clear or delete entities together with their neighbours in the given
    /// source and destination entity sets.
    #[instrument(skip(self, entity_key_ids, principals), level = "debug")]
    pub fn clear_or_delete_entities_and_neighbors(
        &self,
        entity_set_id: EntitySetId,
        entity_key_ids: &BTreeSet<EntityKeyId>,
        src_entity_set_ids: &BTreeSet<EntitySetId>,
        dst_entity_set_ids: &BTreeSet<EntitySetId>,
        delete_type: DeleteType,
        principals: &[Principal],
    ) -> StoreResult<DeletionReport> {
        let mut targets = BTreeMap::from([(entity_set_id, entity_key_ids.clone())]);
        let keys: Vec<EntityDataKey> = entity_key_ids
            .iter()
            .map(|id| EntityDataKey::new(entity_set_id, *id))
            .collect();
        let filter = EdgeFilter {
            include_cleared: delete_type == DeleteType::Delete,
            ..Default::default()
        };
        for edge in self.graph.edges_touching(&keys, &filter)? {
            let neighbour = if edge.dst.entity_set_id == entity_set_id
                && entity_key_ids.contains(&edge.dst.entity_key_id)
                && src_entity_set_ids.contains(&edge.src.entity_set_id)
            {
                edge.src
            } else if edge.src.entity_set_id == entity_set_id
                && entity_key_ids.contains(&edge.src.entity_key_id)
                && dst_entity_set_ids.contains(&edge.dst.entity_set_id)
            {
                edge.dst
            } else {
                continue;
            };
            targets
                .entry(neighbour.entity_set_id)
                .or_default()
                .insert(neighbour.entity_key_id);
        }
        self.run(targets, delete_type, principals)
    }

    fn all_keys_of(&self, entity_set_id: EntitySetId) -> StoreResult<BTreeSet<EntityKeyId>> {
        let backend = self.store.backend();
        let mut keys = BTreeSet::new();
        let mut after = None;
        loop {
            let page = backend.scan_entities(entity_set_id, after, self.chunk_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.entity_key_id);
            keys.extend(page.iter().map(|row| row.entity_key_id));
        }
        Ok(keys)
    }

    fn entity_set(&self, entity_set_id: EntitySetId) -> StoreResult<EntitySet> {
        self.metadata
            .entity_set(entity_set_id)?
            .ok_or(StoreError::UnknownEntitySet(entity_set_id))
    }

    fn run(
        &self,
        targets: BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
        delete_type: DeleteType,
        principals: &[Principal],
    ) -> StoreResult<DeletionReport> {
        let plan = self.plan(targets, delete_type)?;
        self.authorize(&plan, delete_type, principals)?;
        let report = self.execute(&plan, delete_type)?;
        debug!(
            entities = report.entities,
            associations = report.associations,
            edges = report.edges,
            match_edges = report.match_edges,
            ?delete_type,
            "deletion finished"
        );
        Ok(report)
    }

    fn plan(
        &self,
        targets: BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
        delete_type: DeleteType,
    ) -> StoreResult<DeletionPlan> {
        let mut plan = DeletionPlan {
            targets,
            ..Default::default()
        };
        for entity_set_id in plan.targets.keys().copied().collect::<Vec<_>>() {
            let entity_set = self.entity_set(entity_set_id)?;
            plan.entity_sets.insert(entity_set_id, entity_set);
        }

        let filter = EdgeFilter {
            include_cleared: delete_type == DeleteType::Delete,
            ..Default::default()
        };
        let mut preserved = BTreeSet::new();
        for (entity_set_id, keys) in &plan.targets {
            let keys: Vec<EntityDataKey> = keys
                .iter()
                .map(|id| EntityDataKey::new(*entity_set_id, *id))
                .collect();
            for chunk in keys.chunks(self.chunk_size) {
                for edge in self.graph.edges_touching(chunk, &filter)? {
                    let association = edge.edge;
                    if plan.is_target(&association) {
                        plan.target_edges
                            .entry(association.entity_set_id)
                            .or_default()
                            .insert(edge.key());
                        continue;
                    }
                    plan.associations
                        .entry(association.entity_set_id)
                        .or_default()
                        .insert(association.entity_key_id);
                    plan.association_edges
                        .entry(association.entity_set_id)
                        .or_default()
                        .insert(edge.key());
                }
            }
        }

        for entity_set_id in plan.associations.keys().copied().collect::<Vec<_>>() {
            if plan.entity_sets.contains_key(&entity_set_id) {
                continue;
            }
            let entity_set = self.entity_set(entity_set_id)?;
            if entity_set.is_audit() && delete_type == DeleteType::Clear {
                preserved.insert(entity_set_id);
                continue;
            }
            plan.entity_sets.insert(entity_set_id, entity_set);
        }
        for entity_set_id in &preserved {
            plan.associations.remove(entity_set_id);
            plan.association_edges.remove(entity_set_id);
        }
        if !preserved.is_empty() {
            debug!(count = preserved.len(), "preserving audit associations on clear");
        }

        for entity_set_id in plan.entity_sets.keys() {
            let authorized = self.metadata.property_types_of_set(*entity_set_id)?;
            plan.authorized.insert(*entity_set_id, authorized);
        }
        Ok(plan)
    }

    /// Fail with every missing acl key before anything is written.
    fn authorize(
        &self,
        plan: &DeletionPlan,
        delete_type: DeleteType,
        principals: &[Principal],
    ) -> StoreResult<()> {
        let required = delete_type.required_permission();
        let mut requests: Vec<(AclKey, Permission)> = Vec::new();
        for (entity_set_id, entity_set) in &plan.entity_sets {
            if entity_set.is_audit() {
                continue;
            }
            requests.push((entity_set_acl_key(*entity_set_id), required));
            if let Some(property_types) = plan.authorized.get(entity_set_id) {
                for property_type_id in property_types.keys() {
                    requests.push((property_acl_key(*entity_set_id, *property_type_id), required));
                }
            }
        }
        let acl_keys = self.authorizer.unauthorized(&requests, principals)?;
        if acl_keys.is_empty() {
            Ok(())
        } else {
            Err(StoreError::ForbiddenOperation { acl_keys })
        }
    }

    fn execute(&self, plan: &DeletionPlan, delete_type: DeleteType) -> StoreResult<DeletionReport> {
        let mut report = DeletionReport::default();

        let associations: Vec<StoreResult<DeletionReport>> = plan
            .associations
            .par_iter()
            .map(|(entity_set_id, keys)| {
                let mut partial = DeletionReport {
                    edges: self
                        .remove_edges(plan.association_edges.get(entity_set_id), delete_type)?,
                    ..Default::default()
                };
                partial.associations = self
                    .remove_entities(plan, *entity_set_id, keys, delete_type)
                    .map_err(|err| err.after(partial.updates()))?;
                Ok(partial)
            })
            .collect();
        merge_partials(&mut report, associations)?;

        let targets: Vec<StoreResult<DeletionReport>> = plan
            .targets
            .par_iter()
            .map(|(entity_set_id, keys)| self.remove_targets(plan, *entity_set_id, keys, delete_type))
            .collect();
        merge_partials(&mut report, targets)?;
        Ok(report)
    }

    fn remove_targets(
        &self,
        plan: &DeletionPlan,
        entity_set_id: EntitySetId,
        keys: &BTreeSet<EntityKeyId>,
        delete_type: DeleteType,
    ) -> StoreResult<DeletionReport> {
        let mut partial = DeletionReport {
            edges: self.remove_edges(plan.target_edges.get(&entity_set_id), delete_type)?,
            ..Default::default()
        };
        let linked = !plan
            .entity_sets
            .get(&entity_set_id)
            .is_some_and(EntitySet::is_association);
        let data_keys: BTreeSet<EntityDataKey> = keys
            .iter()
            .map(|id| EntityDataKey::new(entity_set_id, *id))
            .collect();

        // Confirmed matches are protected only while the row still exists.
        if linked && delete_type == DeleteType::Delete {
            partial.match_edges += self
                .release_neighborhoods(&data_keys)
                .map_err(|err| err.after(partial.updates()))?;
        }
        partial.entities = self
            .remove_entities(plan, entity_set_id, keys, delete_type)
            .map_err(|err| err.after(partial.updates()))?;
        if linked {
            let removed = match delete_type {
                DeleteType::Delete => self.linking.purge_removed(&data_keys),
                DeleteType::Clear => self.tombstone_members(&data_keys),
            };
            partial.match_edges += removed.map_err(|err| err.after(partial.updates()))?;
        }
        Ok(partial)
    }

    fn remove_edges(
        &self,
        edges: Option<&BTreeSet<EdgeKey>>,
        delete_type: DeleteType,
    ) -> StoreResult<usize> {
        let Some(edges) = edges else {
            return Ok(0);
        };
        let edges: Vec<EdgeKey> = edges.iter().copied().collect();
        let mut count = 0;
        for chunk in edges.chunks(self.chunk_size) {
            let event = match delete_type {
                DeleteType::Clear => self.graph.clear_edges(chunk),
                DeleteType::Delete => self.graph.delete_edges(chunk),
            }
            .map_err(|err| err.after(count))?;
            count += event.count;
        }
        Ok(count)
    }

    fn remove_entities(
        &self,
        plan: &DeletionPlan,
        entity_set_id: EntitySetId,
        keys: &BTreeSet<EntityKeyId>,
        delete_type: DeleteType,
    ) -> StoreResult<usize> {
        let empty = AuthorizedPropertyTypes::new();
        let authorized = plan.authorized.get(&entity_set_id).unwrap_or(&empty);
        let keys: Vec<EntityKeyId> = keys.iter().copied().collect();
        let mut count = 0;
        for chunk in keys.chunks(self.chunk_size) {
            let event = match delete_type {
                DeleteType::Clear => self.store.clear_entities(entity_set_id, chunk, authorized),
                DeleteType::Delete => {
                    self.store.delete_entity_data(entity_set_id, chunk, authorized)
                }
            }
            .map_err(|err| err.after(count))?;
            count += event.count;
        }
        Ok(count)
    }

    /// Drop the unconfirmed match edges of entities about to be deleted.
    fn release_neighborhoods(&self, keys: &BTreeSet<EntityDataKey>) -> StoreResult<usize> {
        let mut count = 0;
        for key in keys {
            let positives = self
                .feedback
                .positive_feedbacks(key)
                .map_err(StoreError::Backend)?;
            count += self.linking.delete_neighborhood(*key, &positives)?;
        }
        Ok(count)
    }

    /// Take cleared entities out of their clusters. Returns match edges removed.
    fn tombstone_members(&self, keys: &BTreeSet<EntityDataKey>) -> StoreResult<usize> {
        let mut by_cluster: BTreeMap<LinkingId, BTreeSet<EntityDataKey>> = BTreeMap::new();
        for (key, linking_id) in self.linking.get_linking_ids(keys)? {
            by_cluster.entry(linking_id).or_default().insert(key);
        }
        let mut removed: BTreeSet<MatchKey> = BTreeSet::new();
        for (linking_id, members) in &by_cluster {
            for member in members {
                removed.extend(
                    self.linking
                        .get_match_scores(member)?
                        .iter()
                        .filter(|edge| edge.linking_id == *linking_id)
                        .map(|edge| edge.key()),
                );
            }
            self.linking.tombstone_links(*linking_id, members)?;
        }
        Ok(removed.len())
    }
}

/// Fold per-set results. A failure carries everything already committed.
fn merge_partials(
    report: &mut DeletionReport,
    results: Vec<StoreResult<DeletionReport>>,
) -> StoreResult<()> {
    let mut failure = None;
    let mut failed_progress = 0;
    for result in results {
        match result {
            Ok(partial) => *report += partial,
            Err(err) => match failure {
                None => failure = Some(err),
                Some(_) => failed_progress += err.completed(),
            },
        }
    }
    match failure {
        Some(err) => Err(err.after(report.updates() + failed_progress)),
        None => Ok(()),
    }
}
