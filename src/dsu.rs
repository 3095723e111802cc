//! # Disjoint Set Union
//!
//! Union-find over entity data keys with union by rank and path halving.
//! Used to turn above-threshold match edges into connected components.

use crate::model::EntityDataKey;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default)]
pub struct EntityDsu {
    parent: FxHashMap<EntityDataKey, EntityDataKey>,
    rank: FxHashMap<EntityDataKey, u32>,
    component_count: usize,
}

impl EntityDsu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `key` as a singleton. No-op if already present.
    pub fn add(&mut self, key: EntityDataKey) {
        if self.parent.contains_key(&key) {
            return;
        }
        self.parent.insert(key, key);
        self.rank.insert(key, 0);
        self.component_count += 1;
    }

    pub fn contains(&self, key: &EntityDataKey) -> bool {
        self.parent.contains_key(key)
    }

    /// Root of `key`; untracked keys are their own root.
    pub fn find(&mut self, key: EntityDataKey) -> EntityDataKey {
        let mut current = key;
        loop {
            let Some(&parent) = self.parent.get(&current) else {
                return current;
            };
            if parent == current {
                return current;
            }
            let grandparent = self.parent.get(&parent).copied().unwrap_or(parent);
            self.parent.insert(current, grandparent);
            current = grandparent;
        }
    }

    /// Merge the components of `a` and `b`. Returns false if already joined.
    pub fn union(&mut self, a: EntityDataKey, b: EntityDataKey) -> bool {
        self.add(a);
        self.add(b);
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }
        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);
        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a);
        } else {
            self.parent.insert(root_b, root_a);
            self.rank.insert(root_a, rank_a + 1);
        }
        self.component_count -= 1;
        true
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    /// Every component, keyed by its smallest member for stable ordering.
    pub fn components(&mut self) -> BTreeMap<EntityDataKey, BTreeSet<EntityDataKey>> {
        let keys: Vec<EntityDataKey> = self.parent.keys().copied().collect();
        let mut by_root: FxHashMap<EntityDataKey, BTreeSet<EntityDataKey>> = FxHashMap::default();
        for key in keys {
            let root = self.find(key);
            by_root.entry(root).or_default().insert(key);
        }
        by_root
            .into_values()
            .filter_map(|members| members.first().copied().map(|first| (first, members)))
            .collect()
    }

    /// Members of the component containing `key`.
    pub fn component_of(&mut self, key: EntityDataKey) -> BTreeSet<EntityDataKey> {
        let root = self.find(key);
        let keys: Vec<EntityDataKey> = self.parent.keys().copied().collect();
        let mut members = BTreeSet::new();
        for candidate in keys {
            if self.find(candidate) == root {
                members.insert(candidate);
            }
        }
        if members.is_empty() {
            members.insert(key);
        }
        members
    }
}
