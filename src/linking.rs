//! # Linking Graph Service
//!
//! Clusters likely-duplicate entities under a canonical [`LinkingId`].
//!
//! Cluster mutation always happens inside a [`ClusterTransaction`]: the
//! involved linking ids are locked in sorted order, changes are buffered, and
//! `commit` applies them as one atomic write. Dropping an uncommitted
//! transaction discards the buffer, so a failing work callback leaves no
//! partial cluster behind.

use crate::dsu::EntityDsu;
use crate::error::{StoreError, StoreResult};
use crate::locks::{LockGuard, LockTable};
use crate::model::{EntityDataKey, EntityKeyId, EntitySetId, LinkingId, WriteEvent};
use crate::store::{
    EntityPatch, LinkMark, LinkingChange, MatchEdge, MatchKey, StorageBackend, WriteOp, WriteSet,
};
use crate::version::{Version, VersionClock};
use anyhow::anyhow;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Adjacency of one cluster: member -> (matched member -> score).
pub type Cluster = BTreeMap<EntityDataKey, BTreeMap<EntityDataKey, f64>>;

/// Clusters keyed by linking id.
pub type Clusters = BTreeMap<LinkingId, Cluster>;

#[derive(Debug, Clone, Copy)]
pub struct LinkingOptions {
    pub lock_timeout: Duration,
    /// Extra attempts when cluster membership shifts between lookup and lock.
    pub cluster_lookup_retries: usize,
    pub page_size: usize,
}

impl Default for LinkingOptions {
    fn default() -> Self {
        use crate::config::defaults;
        Self {
            lock_timeout: Duration::from_millis(defaults::DEFAULT_LOCK_TIMEOUT_MS),
            cluster_lookup_retries: defaults::DEFAULT_CLUSTER_LOOKUP_RETRIES,
            page_size: defaults::DEFAULT_READ_PAGE_SIZE,
        }
    }
}

/// Snapshot handed to a [`ClusterWork`] callback, taken under lock.
#[derive(Debug, Clone)]
pub struct ClusterWorkInput {
    pub candidate: EntityDataKey,
    pub candidate_set: BTreeSet<EntityDataKey>,
    pub clusters: Clusters,
    /// Locked, unused id the work may assign to a brand-new cluster.
    pub fresh_linking_id: LinkingId,
}

/// Cluster decided by a [`ClusterWork`] callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterUpdate {
    pub linking_id: LinkingId,
    pub members: BTreeSet<EntityDataKey>,
    pub scores: BTreeMap<(EntityDataKey, EntityDataKey), f64>,
}

/// Clustering decision run against a locked snapshot. Must be deterministic
/// given its input.
pub trait ClusterWork {
    fn cluster(&self, input: &ClusterWorkInput) -> anyhow::Result<ClusterUpdate>;
}

impl<F> ClusterWork for F
where
    F: Fn(&ClusterWorkInput) -> anyhow::Result<ClusterUpdate>,
{
    fn cluster(&self, input: &ClusterWorkInput) -> anyhow::Result<ClusterUpdate> {
        self(input)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub linking_id: LinkingId,
    pub members: BTreeSet<EntityDataKey>,
    /// Previously separate clusters folded into `linking_id`.
    pub merged: BTreeSet<LinkingId>,
    /// Former members that are no longer in any cluster.
    pub dropped: BTreeSet<EntityDataKey>,
    pub version: Version,
}

/// Default clustering: union-find over scores at or above `threshold`.
///
/// The candidate's old edges are replaced by `scores`. The surviving id is
/// the largest locked cluster overlapping the candidate's component, ties
/// going to the smallest linking id; with no overlap the fresh id is used.
#[derive(Debug, Clone)]
pub struct ThresholdClusterer {
    threshold: f64,
    scores: Vec<(EntityDataKey, EntityDataKey, f64)>,
}

impl ThresholdClusterer {
    pub fn new(threshold: f64, scores: Vec<(EntityDataKey, EntityDataKey, f64)>) -> Self {
        Self { threshold, scores }
    }
}

impl ClusterWork for ThresholdClusterer {
    fn cluster(&self, input: &ClusterWorkInput) -> anyhow::Result<ClusterUpdate> {
        let candidate = input.candidate;
        let mut edges: BTreeMap<(EntityDataKey, EntityDataKey), f64> = BTreeMap::new();
        for cluster in input.clusters.values() {
            for (src, targets) in cluster {
                for (dst, score) in targets {
                    if *src != candidate && *dst != candidate {
                        edges.insert((*src, *dst), *score);
                    }
                }
            }
        }
        for (src, dst, score) in &self.scores {
            if !(0.0..=1.0).contains(score) {
                return Err(anyhow!("match score {score} for {src} -> {dst} is outside [0, 1]"));
            }
            if src != dst {
                edges.insert((*src, *dst), *score);
            }
        }
        edges.retain(|_, score| *score >= self.threshold);

        let mut dsu = EntityDsu::new();
        dsu.add(candidate);
        for cluster in input.clusters.values() {
            for member in cluster.keys() {
                dsu.add(*member);
            }
        }
        for (src, dst) in edges.keys() {
            dsu.union(*src, *dst);
        }
        let members = dsu.component_of(candidate);

        let linking_id = input
            .clusters
            .iter()
            .filter(|(_, cluster)| cluster.keys().any(|member| members.contains(member)))
            .max_by(|(left_id, left), (right_id, right)| {
                left.len()
                    .cmp(&right.len())
                    .then_with(|| right_id.cmp(left_id))
            })
            .map(|(id, _)| *id)
            .unwrap_or(input.fresh_linking_id);

        let scores = edges
            .into_iter()
            .filter(|((src, dst), _)| members.contains(src) && members.contains(dst))
            .collect();
        Ok(ClusterUpdate {
            linking_id,
            members,
            scores,
        })
    }
}

/// Human feedback that protects specific match edges from removal.
pub trait LinkingFeedback: Send + Sync {
    fn positive_feedbacks(&self, key: &EntityDataKey) -> anyhow::Result<BTreeSet<EntityDataKey>>;
}

#[derive(Debug, Default)]
pub struct InMemoryFeedback {
    positives: RwLock<HashMap<EntityDataKey, BTreeSet<EntityDataKey>>>,
}

impl InMemoryFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `a` and `b` were confirmed as the same entity.
    pub fn add_positive(&self, a: EntityDataKey, b: EntityDataKey) {
        let mut positives = self.positives.write();
        positives.entry(a).or_default().insert(b);
        positives.entry(b).or_default().insert(a);
    }
}

impl LinkingFeedback for InMemoryFeedback {
    fn positive_feedbacks(&self, key: &EntityDataKey) -> anyhow::Result<BTreeSet<EntityDataKey>> {
        Ok(self.positives.read().get(key).cloned().unwrap_or_default())
    }
}

/// Buffered cluster mutation holding locks on `linking_ids`.
pub struct ClusterTransaction<'a> {
    service: &'a LinkingService,
    _guard: LockGuard<LinkingId>,
    _claims: Option<LockGuard<EntityDataKey>>,
    linking_ids: BTreeSet<LinkingId>,
    writes: WriteSet,
    version: Version,
    committed: bool,
}

impl<'a> ClusterTransaction<'a> {
    pub fn linking_ids(&self) -> &BTreeSet<LinkingId> {
        &self.linking_ids
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Current state of the locked clusters.
    pub fn clusters(&self) -> StoreResult<Clusters> {
        self.service.load_clusters(&self.linking_ids)
    }

    fn ensure_locked(&self, linking_id: LinkingId) -> StoreResult<()> {
        if self.linking_ids.contains(&linking_id) {
            Ok(())
        } else {
            Err(StoreError::Backend(anyhow!(
                "cluster {linking_id} is not locked by this transaction"
            )))
        }
    }

    pub fn put_score(
        &mut self,
        linking_id: LinkingId,
        src: EntityDataKey,
        dst: EntityDataKey,
        score: f64,
    ) -> StoreResult<()> {
        self.ensure_locked(linking_id)?;
        self.writes.push(WriteOp::PutMatch(MatchEdge {
            linking_id,
            src,
            dst,
            score,
        }));
        Ok(())
    }

    pub fn delete_score(&mut self, key: MatchKey) -> StoreResult<()> {
        self.ensure_locked(key.linking_id)?;
        self.writes.push(WriteOp::DeleteMatch(key));
        Ok(())
    }

    /// Point `key` at `linking_id` and mark it linked.
    pub fn assign(&mut self, key: EntityDataKey, linking_id: LinkingId) -> StoreResult<()> {
        self.ensure_locked(linking_id)?;
        self.writes.push(WriteOp::PatchEntity(
            key,
            EntityPatch {
                linking: Some(LinkingChange::Assign {
                    linking_id,
                    version: self.version,
                }),
                last_link: Some(LinkMark::CaughtUp),
                ..Default::default()
            },
        ));
        Ok(())
    }

    /// Tombstone the linking assignment of `key` and queue it for relinking.
    pub fn tombstone(&mut self, key: EntityDataKey) {
        self.writes.push(WriteOp::PatchEntity(
            key,
            EntityPatch {
                linking: Some(LinkingChange::Tombstone {
                    version: self.version,
                }),
                last_link: Some(LinkMark::Reset),
                ..Default::default()
            },
        ));
    }

    /// Lock `keys` until commit and reject any already claimed by a cluster
    /// outside this transaction.
    fn claim(&mut self, keys: &BTreeSet<EntityDataKey>) -> StoreResult<()> {
        let guard = self
            .service
            .member_locks
            .lock_all(keys.iter().copied(), self.service.options.lock_timeout)?;
        self._claims = Some(guard);
        for key in keys {
            if let Some(row) = self.service.backend.get_entity(key)? {
                if let Some(linking_id) = row.linked_to(None) {
                    if !self.linking_ids.contains(&linking_id) {
                        return Err(StoreError::ClusterMembership {
                            key: *key,
                            linking_id,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_update(
        &mut self,
        input: &ClusterWorkInput,
        update: ClusterUpdate,
    ) -> StoreResult<ClusterOutcome> {
        self.ensure_locked(update.linking_id)?;
        for (src, dst) in update.scores.keys() {
            if !update.members.contains(src) || !update.members.contains(dst) {
                return Err(StoreError::Backend(anyhow!(
                    "score {src} -> {dst} references a key outside cluster {}",
                    update.linking_id
                )));
            }
        }
        let previous: BTreeSet<EntityDataKey> = input
            .clusters
            .values()
            .flat_map(|cluster| cluster.keys().copied())
            .collect();
        let joining: BTreeSet<EntityDataKey> =
            update.members.difference(&previous).copied().collect();
        self.claim(&joining)?;

        for (linking_id, cluster) in &input.clusters {
            for (src, targets) in cluster {
                for dst in targets.keys() {
                    self.delete_score(MatchKey {
                        linking_id: *linking_id,
                        src: *src,
                        dst: *dst,
                    })?;
                }
            }
        }
        for ((src, dst), score) in &update.scores {
            self.put_score(update.linking_id, *src, *dst, *score)?;
        }
        for member in &update.members {
            self.assign(*member, update.linking_id)?;
        }
        let dropped: BTreeSet<EntityDataKey> =
            previous.difference(&update.members).copied().collect();
        for key in &dropped {
            self.tombstone(*key);
        }
        let merged = input
            .clusters
            .keys()
            .filter(|id| **id != update.linking_id)
            .copied()
            .collect();

        Ok(ClusterOutcome {
            linking_id: update.linking_id,
            members: update.members,
            merged,
            dropped,
            version: self.version,
        })
    }

    /// Apply every buffered change atomically.
    pub fn commit(mut self) -> StoreResult<WriteEvent> {
        let writes = std::mem::take(&mut self.writes);
        let count = writes.len();
        self.service.backend.apply(writes)?;
        self.committed = true;
        Ok(WriteEvent::new(self.version, count))
    }
}

impl Drop for ClusterTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.writes.is_empty() {
            debug!(
                clusters = self.linking_ids.len(),
                discarded = self.writes.len(),
                "rolled back cluster transaction"
            );
        }
    }
}

pub struct LinkingService {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn VersionClock>,
    cluster_locks: Arc<LockTable<LinkingId>>,
    /// Held on entities joining a cluster, from claim check to commit.
    member_locks: Arc<LockTable<EntityDataKey>>,
    options: LinkingOptions,
}

impl LinkingService {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn VersionClock>,
        options: LinkingOptions,
    ) -> Self {
        Self {
            backend,
            clock,
            cluster_locks: LockTable::new("cluster"),
            member_locks: LockTable::new("member"),
            options,
        }
    }

    /// Live entities of a set written since they were last linked.
    pub fn get_entities_needing_linking(
        &self,
        entity_set_id: EntitySetId,
        limit: usize,
    ) -> LinkingCandidates {
        LinkingCandidates::new(
            Arc::clone(&self.backend),
            vec![entity_set_id],
            limit,
            self.options.page_size,
            CandidateKind::NeedsLinking,
        )
    }

    /// Live entities of the given sets that belong to no cluster.
    pub fn get_entities_not_linked(
        &self,
        entity_set_ids: &BTreeSet<EntitySetId>,
        limit: usize,
    ) -> LinkingCandidates {
        LinkingCandidates::new(
            Arc::clone(&self.backend),
            entity_set_ids.iter().copied().collect(),
            limit,
            self.options.page_size,
            CandidateKind::NotLinked,
        )
    }

    fn cluster_ids_touching<'k>(
        &self,
        keys: impl IntoIterator<Item = &'k EntityDataKey>,
    ) -> StoreResult<BTreeSet<LinkingId>> {
        let mut ids = BTreeSet::new();
        for key in keys {
            if let Some(row) = self.backend.get_entity(key)? {
                if let Some(linking_id) = row.linked_to(None) {
                    ids.insert(linking_id);
                }
            }
            for edge in self.backend.matches_touching(key)? {
                ids.insert(edge.linking_id);
            }
        }
        Ok(ids)
    }

    fn load_clusters(&self, linking_ids: &BTreeSet<LinkingId>) -> StoreResult<Clusters> {
        let mut clusters = Clusters::new();
        for linking_id in linking_ids {
            let mut cluster = Cluster::new();
            for row in self.backend.entities_with_linking_id(*linking_id)? {
                if row.linked_to(None) == Some(*linking_id) {
                    cluster.entry(row.key()).or_default();
                }
            }
            for edge in self.backend.matches_of_cluster(*linking_id)? {
                cluster.entry(edge.dst).or_default();
                cluster.entry(edge.src).or_default().insert(edge.dst, edge.score);
            }
            if !cluster.is_empty() {
                clusters.insert(*linking_id, cluster);
            }
        }
        Ok(clusters)
    }

    /// Every cluster that contains, or has a match edge touching, one of `keys`.
    pub fn get_clusters_for_ids(&self, keys: &BTreeSet<EntityDataKey>) -> StoreResult<Clusters> {
        let ids = self.cluster_ids_touching(keys)?;
        self.load_clusters(&ids)
    }

    /// Lock `linking_ids` in sorted order and open a transaction over them.
    pub fn lock_clusters_for_updates(
        &self,
        linking_ids: BTreeSet<LinkingId>,
    ) -> StoreResult<ClusterTransaction<'_>> {
        let guard = self
            .cluster_locks
            .lock_all(linking_ids.iter().copied(), self.options.lock_timeout)?;
        Ok(ClusterTransaction {
            service: self,
            _guard: guard,
            _claims: None,
            linking_ids,
            writes: WriteSet::new(),
            version: self.clock.next_version(),
            committed: false,
        })
    }

    /// Lock every cluster touching `candidate` or `candidate_set`, run `work`
    /// on the locked snapshot and commit its decision atomically.
    #[instrument(skip(self, candidate_set, work), level = "debug")]
    pub fn lock_clusters_do_work_and_commit<W: ClusterWork + ?Sized>(
        &self,
        candidate: EntityDataKey,
        candidate_set: &BTreeSet<EntityDataKey>,
        work: &W,
    ) -> StoreResult<ClusterOutcome> {
        let mut keys = candidate_set.clone();
        keys.insert(candidate);

        let mut conflict = None;
        for attempt in 0..=self.options.cluster_lookup_retries {
            let ids = self.cluster_ids_touching(&keys)?;
            let fresh_linking_id = LinkingId::random();
            let mut locked = ids.clone();
            locked.insert(fresh_linking_id);
            let mut transaction = self.lock_clusters_for_updates(locked)?;

            if self.cluster_ids_touching(&keys)? != ids {
                warn!(attempt, %candidate, "cluster membership changed while locking, retrying");
                conflict = None;
                continue;
            }
            let input = ClusterWorkInput {
                candidate,
                candidate_set: keys.clone(),
                clusters: self.load_clusters(&ids)?,
                fresh_linking_id,
            };
            let update = work.cluster(&input).map_err(StoreError::Backend)?;
            let outcome = match transaction.apply_update(&input, update) {
                Ok(outcome) => outcome,
                Err(err @ StoreError::ClusterMembership { .. }) => {
                    warn!(attempt, %candidate, error = %err, "member claimed by another cluster, retrying");
                    conflict = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            transaction.commit()?;
            debug!(
                linking_id = %outcome.linking_id,
                members = outcome.members.len(),
                merged = outcome.merged.len(),
                dropped = outcome.dropped.len(),
                "committed cluster update"
            );
            return Ok(outcome);
        }

        Err(conflict.unwrap_or_else(|| StoreError::LockTimeout {
            what: format!("clusters of {candidate}"),
            waited_ms: self.options.lock_timeout.as_millis() as u64,
        }))
    }

    /// Assign `linking_id` to every listed member.
    #[instrument(skip(self, cluster), level = "debug")]
    pub fn create_or_update_link(
        &self,
        linking_id: LinkingId,
        cluster: &BTreeMap<EntitySetId, BTreeSet<EntityKeyId>>,
    ) -> StoreResult<WriteEvent> {
        let members: BTreeSet<EntityDataKey> = cluster
            .iter()
            .flat_map(|(entity_set_id, keys)| {
                keys.iter()
                    .map(move |key| EntityDataKey::new(*entity_set_id, *key))
            })
            .collect();
        let mut transaction = self.lock_clusters_for_updates(BTreeSet::from([linking_id]))?;
        transaction.claim(&members)?;
        for member in &members {
            transaction.assign(*member, linking_id)?;
        }
        let version = transaction.version();
        transaction.commit()?;
        Ok(WriteEvent::new(version, members.len()))
    }

    /// Persist the scored edges of a cluster and assign it to every endpoint.
    #[instrument(skip(self, scores), level = "debug")]
    pub fn update_linking_information(
        &self,
        linking_id: LinkingId,
        scores: &Cluster,
    ) -> StoreResult<WriteEvent> {
        let mut members = BTreeSet::new();
        for (src, targets) in scores {
            members.insert(*src);
            members.extend(targets.keys().copied());
        }
        let mut transaction = self.lock_clusters_for_updates(BTreeSet::from([linking_id]))?;
        transaction.claim(&members)?;
        for (src, targets) in scores {
            for (dst, score) in targets {
                transaction.put_score(linking_id, *src, *dst, *score)?;
            }
        }
        for member in &members {
            transaction.assign(*member, linking_id)?;
        }
        let version = transaction.version();
        transaction.commit()?;
        Ok(WriteEvent::new(version, members.len()))
    }

    /// Remove members from a cluster, leaving the rest intact.
    #[instrument(skip(self, to_remove), level = "debug")]
    pub fn tombstone_links(
        &self,
        linking_id: LinkingId,
        to_remove: &BTreeSet<EntityDataKey>,
    ) -> StoreResult<WriteEvent> {
        let mut transaction = self.lock_clusters_for_updates(BTreeSet::from([linking_id]))?;
        let mut count = 0;
        for key in to_remove {
            let linked = self
                .backend
                .get_entity(key)?
                .and_then(|row| row.linked_to(None));
            if linked == Some(linking_id) {
                transaction.tombstone(*key);
                count += 1;
            }
        }
        for edge in self.backend.matches_of_cluster(linking_id)? {
            if to_remove.contains(&edge.src) || to_remove.contains(&edge.dst) {
                transaction.delete_score(edge.key())?;
            }
        }
        let version = transaction.version();
        transaction.commit()?;
        Ok(WriteEvent::new(version, count))
    }

    /// Remove every match edge touching `entity` except those to members of
    /// `positive_feedbacks`. Returns the number of edges removed.
    #[instrument(skip(self, positive_feedbacks), level = "debug")]
    pub fn delete_neighborhood(
        &self,
        entity: EntityDataKey,
        positive_feedbacks: &BTreeSet<EntityDataKey>,
    ) -> StoreResult<usize> {
        let linking_ids: BTreeSet<LinkingId> = self
            .backend
            .matches_touching(&entity)?
            .iter()
            .map(|edge| edge.linking_id)
            .collect();
        if linking_ids.is_empty() {
            return Ok(0);
        }
        let mut transaction = self.lock_clusters_for_updates(linking_ids)?;
        let mut count = 0;
        for edge in self.backend.matches_touching(&entity)? {
            if !transaction.linking_ids().contains(&edge.linking_id) {
                continue;
            }
            let other = if edge.src == entity { edge.dst } else { edge.src };
            if positive_feedbacks.contains(&other) {
                continue;
            }
            transaction.delete_score(edge.key())?;
            count += 1;
        }
        transaction.commit()?;
        Ok(count)
    }

    /// Drop every remaining match edge of `keys` whose entity row is gone.
    /// Returns the number of edges removed.
    pub fn purge_removed(&self, keys: &BTreeSet<EntityDataKey>) -> StoreResult<usize> {
        let mut count = 0;
        for key in keys {
            if self.backend.get_entity(key)?.is_none() {
                count += self.delete_neighborhood(*key, &BTreeSet::new())?;
            }
        }
        Ok(count)
    }

    /// Remove the score between `a` and `b` in both directions.
    pub fn delete_match_score(
        &self,
        linking_id: LinkingId,
        a: EntityDataKey,
        b: EntityDataKey,
    ) -> StoreResult<usize> {
        let mut transaction = self.lock_clusters_for_updates(BTreeSet::from([linking_id]))?;
        let mut count = 0;
        for edge in self.backend.matches_touching(&a)? {
            if edge.linking_id == linking_id && edge.touches(&b) && edge.src != edge.dst {
                transaction.delete_score(edge.key())?;
                count += 1;
            }
        }
        transaction.commit()?;
        Ok(count)
    }

    pub fn get_match_scores(&self, key: &EntityDataKey) -> StoreResult<Vec<MatchEdge>> {
        Ok(self.backend.matches_touching(key)?)
    }

    /// Current linking id of each key that belongs to a cluster.
    pub fn get_linking_ids(
        &self,
        keys: &BTreeSet<EntityDataKey>,
    ) -> StoreResult<BTreeMap<EntityDataKey, LinkingId>> {
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(linking_id) = self
                .backend
                .get_entity(key)?
                .and_then(|row| row.linked_to(None))
            {
                out.insert(*key, linking_id);
            }
        }
        Ok(out)
    }

    /// Live members of each cluster, restricted to `normal_entity_set_ids`.
    pub fn get_entity_key_ids_of_linking_ids(
        &self,
        linking_ids: &BTreeSet<LinkingId>,
        normal_entity_set_ids: &BTreeSet<EntitySetId>,
    ) -> StoreResult<BTreeMap<LinkingId, BTreeSet<EntityDataKey>>> {
        let mut out = BTreeMap::new();
        for linking_id in linking_ids {
            let members: BTreeSet<EntityDataKey> = self
                .backend
                .entities_with_linking_id(*linking_id)?
                .into_iter()
                .filter(|row| {
                    normal_entity_set_ids.contains(&row.entity_set_id)
                        && row.version > 0
                        && row.linked_to(None) == Some(*linking_id)
                })
                .map(|row| row.key())
                .collect();
            if !members.is_empty() {
                out.insert(*linking_id, members);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateKind {
    NeedsLinking,
    NotLinked,
}

/// Bounded, lazily paged stream of linking candidates.
pub struct LinkingCandidates {
    backend: Arc<dyn StorageBackend>,
    sets: VecDeque<EntitySetId>,
    after: Option<EntityKeyId>,
    remaining: usize,
    page_size: usize,
    kind: CandidateKind,
    buffer: VecDeque<EntityDataKey>,
    last: Option<EntityDataKey>,
}

impl LinkingCandidates {
    fn new(
        backend: Arc<dyn StorageBackend>,
        mut sets: Vec<EntitySetId>,
        limit: usize,
        page_size: usize,
        kind: CandidateKind,
    ) -> Self {
        sets.sort();
        sets.dedup();
        Self {
            backend,
            sets: sets.into(),
            after: None,
            remaining: limit,
            page_size: page_size.max(1),
            kind,
            buffer: VecDeque::new(),
            last: None,
        }
    }

    /// Last key handed out; pass to `resume_after` to continue later.
    pub fn position(&self) -> Option<EntityDataKey> {
        self.last
    }

    pub fn resume_after(mut self, position: EntityDataKey) -> Self {
        while self
            .sets
            .front()
            .is_some_and(|set| *set < position.entity_set_id)
        {
            self.sets.pop_front();
        }
        if self.sets.front() == Some(&position.entity_set_id) {
            self.after = Some(position.entity_key_id);
        }
        self
    }

    fn fill(&mut self) -> StoreResult<bool> {
        while self.buffer.is_empty() {
            let Some(entity_set_id) = self.sets.front().copied() else {
                return Ok(false);
            };
            let page = self
                .backend
                .scan_entities(entity_set_id, self.after, self.page_size)?;
            match page.last() {
                Some(last) => self.after = Some(last.entity_key_id),
                None => {
                    self.sets.pop_front();
                    self.after = None;
                    continue;
                }
            }
            let kind = self.kind;
            self.buffer.extend(
                page.iter()
                    .filter(|row| row.is_live(None))
                    .filter(|row| match kind {
                        CandidateKind::NeedsLinking => row.needs_linking(),
                        CandidateKind::NotLinked => row.linked_to(None).is_none(),
                    })
                    .map(|row| row.key()),
            );
        }
        Ok(true)
    }
}

impl Iterator for LinkingCandidates {
    type Item = StoreResult<EntityDataKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match self.fill() {
            Ok(true) => {
                let key = self.buffer.pop_front()?;
                self.remaining -= 1;
                self.last = Some(key);
                Some(Ok(key))
            }
            Ok(false) => None,
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{EntityRow, MemoryBackend};
    use crate::version::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        service: LinkingService,
        set: EntitySetId,
    }

    impl Fixture {
        fn new() -> Self {
            let backend = Arc::new(MemoryBackend::new());
            let service = LinkingService::new(
                backend.clone(),
                Arc::new(ManualClock::starting_at(1_000)),
                LinkingOptions {
                    lock_timeout: Duration::from_millis(200),
                    ..Default::default()
                },
            );
            Self {
                backend,
                service,
                set: EntitySetId::random(),
            }
        }

        fn entity(&self) -> EntityDataKey {
            let key = EntityDataKey::new(self.set, EntityKeyId::random());
            let mut row = EntityRow::new(key, 0, 1);
            row.record(10);
            let mut writes = WriteSet::new();
            writes.push(WriteOp::PutEntity(row));
            self.backend.apply(writes).unwrap();
            key
        }

        fn link(
            &self,
            candidate: EntityDataKey,
            others: &[EntityDataKey],
            scores: Vec<(EntityDataKey, EntityDataKey, f64)>,
        ) -> ClusterOutcome {
            let clusterer = ThresholdClusterer::new(0.75, scores);
            self.service
                .lock_clusters_do_work_and_commit(
                    candidate,
                    &others.iter().copied().collect(),
                    &clusterer,
                )
                .unwrap()
        }
    }

    #[test]
    fn merge_extends_existing_cluster_under_same_id() {
        let fx = Fixture::new();
        let (e1, e2, e3) = (fx.entity(), fx.entity(), fx.entity());
        let first = fx.link(e2, &[e1], vec![(e2, e1, 0.9)]);
        assert_eq!(first.members, BTreeSet::from([e1, e2]));

        let second = fx.link(e3, &[e2], vec![(e3, e2, 0.8)]);
        assert_eq!(second.linking_id, first.linking_id);
        assert_eq!(second.members, BTreeSet::from([e1, e2, e3]));

        let clusters = fx.service.get_clusters_for_ids(&BTreeSet::from([e3])).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[&first.linking_id].len(), 3);
    }

    #[test]
    fn bridging_candidate_merges_two_clusters() {
        let fx = Fixture::new();
        let (a, b, c, d, bridge) = (fx.entity(), fx.entity(), fx.entity(), fx.entity(), fx.entity());
        let left = fx.link(a, &[b], vec![(a, b, 0.9)]);
        let right = fx.link(c, &[d], vec![(c, d, 0.9), (c, bridge, 0.1)]);
        let merged = fx.link(bridge, &[b, c], vec![(bridge, b, 0.95), (bridge, c, 0.95)]);

        assert_eq!(merged.members.len(), 5);
        assert!(merged.linking_id == left.linking_id || merged.linking_id == right.linking_id);
        assert_eq!(merged.merged.len(), 1);
        let ids = fx
            .service
            .get_linking_ids(&BTreeSet::from([a, b, c, d, bridge]))
            .unwrap();
        assert!(ids.values().all(|id| *id == merged.linking_id));
    }

    #[test]
    fn failing_work_rolls_back() {
        let fx = Fixture::new();
        let (a, b) = (fx.entity(), fx.entity());
        let failing = |_: &ClusterWorkInput| -> anyhow::Result<ClusterUpdate> {
            Err(anyhow!("scorer unavailable"))
        };
        let err = fx
            .service
            .lock_clusters_do_work_and_commit(a, &BTreeSet::from([b]), &failing)
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(fx.service.get_linking_ids(&BTreeSet::from([a, b])).unwrap().is_empty());
        assert!(fx.backend.matches_touching(&a).unwrap().is_empty());
    }

    #[test]
    fn work_cannot_claim_members_of_unlocked_clusters() {
        let fx = Fixture::new();
        let (a, b, outsider) = (fx.entity(), fx.entity(), fx.entity());
        let other = fx.link(outsider, &[], vec![]);
        let attempts = AtomicUsize::new(0);
        let greedy = |input: &ClusterWorkInput| -> anyhow::Result<ClusterUpdate> {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok(ClusterUpdate {
                linking_id: input.fresh_linking_id,
                members: BTreeSet::from([a, b, outsider]),
                scores: BTreeMap::new(),
            })
        };
        let err = fx
            .service
            .lock_clusters_do_work_and_commit(a, &BTreeSet::from([b]), &greedy)
            .unwrap_err();
        assert!(matches!(err, StoreError::ClusterMembership { linking_id, .. } if linking_id == other.linking_id));
        assert_eq!(
            attempts.load(Ordering::SeqCst),
            LinkingOptions::default().cluster_lookup_retries + 1
        );
        assert!(fx.service.get_linking_ids(&BTreeSet::from([a, b])).unwrap().is_empty());
    }

    #[test]
    fn racing_links_of_the_same_pair_share_one_cluster() {
        let fx = Fixture::new();
        let (a, b) = (fx.entity(), fx.entity());
        let barrier = Barrier::new(2);
        let calls = AtomicUsize::new(0);
        let clusterer = ThresholdClusterer::new(0.75, vec![(a, b, 0.9)]);
        let work = |input: &ClusterWorkInput| -> anyhow::Result<ClusterUpdate> {
            // Both first attempts finish their lookup before either claims.
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                barrier.wait();
            }
            clusterer.cluster(input)
        };

        let outcomes: Vec<ClusterOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = [a, b]
                .into_iter()
                .map(|candidate| {
                    let other = if candidate == a { b } else { a };
                    let service = &fx.service;
                    let work = &work;
                    scope.spawn(move || {
                        service.lock_clusters_do_work_and_commit(
                            candidate,
                            &BTreeSet::from([other]),
                            work,
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap().unwrap())
                .collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcomes[0].linking_id, outcomes[1].linking_id);
        let ids = fx.service.get_linking_ids(&BTreeSet::from([a, b])).unwrap();
        assert!(ids.values().all(|id| *id == outcomes[0].linking_id));
        let clusters = fx.service.get_clusters_for_ids(&BTreeSet::from([a, b])).unwrap();
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn purge_removed_only_touches_deleted_rows() {
        let fx = Fixture::new();
        let (a, b, c) = (fx.entity(), fx.entity(), fx.entity());
        let outcome = fx.link(a, &[b, c], vec![(a, b, 0.9), (b, c, 0.9)]);

        assert_eq!(fx.service.purge_removed(&BTreeSet::from([b])).unwrap(), 0);
        let mut writes = WriteSet::new();
        writes.push(WriteOp::DeleteEntity(b));
        fx.backend.apply(writes).unwrap();
        assert_eq!(fx.service.purge_removed(&BTreeSet::from([b])).unwrap(), 2);

        let clusters = fx.service.get_clusters_for_ids(&BTreeSet::from([a])).unwrap();
        let members: BTreeSet<EntityDataKey> =
            clusters[&outcome.linking_id].keys().copied().collect();
        assert_eq!(members, BTreeSet::from([a, c]));
    }

    #[test]
    fn tombstone_links_keeps_remaining_members() {
        let fx = Fixture::new();
        let (a, b, c) = (fx.entity(), fx.entity(), fx.entity());
        fx.link(a, &[b], vec![(a, b, 0.9)]);
        let outcome = fx.link(c, &[b], vec![(c, b, 0.9)]);

        fx.service
            .tombstone_links(outcome.linking_id, &BTreeSet::from([c]))
            .unwrap();
        let members = fx
            .service
            .get_entity_key_ids_of_linking_ids(
                &BTreeSet::from([outcome.linking_id]),
                &BTreeSet::from([fx.set]),
            )
            .unwrap();
        assert_eq!(members[&outcome.linking_id], BTreeSet::from([a, b]));
        assert!(fx.backend.get_entity(&c).unwrap().unwrap().needs_linking());
        assert!(fx.backend.matches_touching(&c).unwrap().is_empty());
    }

    #[test]
    fn delete_neighborhood_spares_positive_feedback() {
        let fx = Fixture::new();
        let (a, b, c) = (fx.entity(), fx.entity(), fx.entity());
        fx.link(a, &[b, c], vec![(a, b, 0.9), (a, c, 0.9)]);
        let removed = fx
            .service
            .delete_neighborhood(a, &BTreeSet::from([b]))
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = fx.service.get_match_scores(&a).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].touches(&b));
    }

    #[test]
    fn candidates_are_bounded_and_restartable() {
        let fx = Fixture::new();
        for _ in 0..7 {
            fx.entity();
        }
        let mut first = fx.service.get_entities_needing_linking(fx.set, 3);
        let taken: Vec<EntityDataKey> = first.by_ref().collect::<StoreResult<_>>().unwrap();
        assert_eq!(taken.len(), 3);
        let position = first.position().unwrap();
        let rest: Vec<EntityDataKey> = fx
            .service
            .get_entities_needing_linking(fx.set, 100)
            .resume_after(position)
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(rest.len(), 4);
        assert!(rest.iter().all(|key| !taken.contains(key)));

        let unlinked = fx
            .service
            .get_entities_not_linked(&BTreeSet::from([fx.set]), 100)
            .count();
        assert_eq!(unlinked, 7);
    }

    #[test]
    fn create_or_update_link_assigns_every_member() {
        let fx = Fixture::new();
        let (a, b) = (fx.entity(), fx.entity());
        let linking_id = LinkingId::random();
        let cluster = BTreeMap::from([(fx.set, BTreeSet::from([a.entity_key_id, b.entity_key_id]))]);
        let event = fx.service.create_or_update_link(linking_id, &cluster).unwrap();
        assert_eq!(event.count, 2);
        let ids = fx.service.get_linking_ids(&BTreeSet::from([a, b])).unwrap();
        assert_eq!(ids.len(), 2);

        let scores = Cluster::from([(a, BTreeMap::from([(b, 0.7)]))]);
        fx.service.update_linking_information(linking_id, &scores).unwrap();
        assert_eq!(fx.service.delete_match_score(linking_id, b, a).unwrap(), 1);
    }
}
