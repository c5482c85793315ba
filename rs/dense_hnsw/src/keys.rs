use smallvec::SmallVec;
use std::collections::HashMap;

use crate::{error::IndexError, graph::NodeId};

/// Node ids of one key, in insertion order.
pub type KeyNodes = SmallVec<[NodeId; 1]>;

/// Bidirectional relation between external keys and node ids.
///
/// Every node id belongs to exactly one key. A key owns exactly one node id
/// unless the map is multi-valued.
#[derive(Clone, Debug, Default)]
pub struct KeyMap {
    multi: bool,
    forward: HashMap<u64, KeyNodes>,
    owners: Vec<Option<u64>>,
    vectors: usize,
}

impl KeyMap {
    pub fn new(multi: bool) -> Self {
        Self {
            multi,
            ..Default::default()
        }
    }

    /// Rebuilds a map from `(key, node ids)` entries, rejecting ids that are
    /// out of `slots`, not `live`, or owned twice.
    pub fn from_entries<F>(
        multi: bool,
        entries: Vec<(u64, Vec<NodeId>)>,
        slots: usize,
        live: F,
    ) -> Result<Self, IndexError>
    where
        F: Fn(NodeId) -> bool,
    {
        let mut map = Self::new(multi);
        map.owners.resize(slots, None);
        map.forward.reserve(entries.len());

        for (key, nodes) in entries {
            if nodes.is_empty() || (!multi && nodes.len() > 1) {
                return Err(IndexError::corrupt(format!(
                    "key {key} maps to {} nodes",
                    nodes.len()
                )));
            }
            if map.forward.contains_key(&key) {
                return Err(IndexError::corrupt(format!("key {key} appears twice")));
            }
            for &id in &nodes {
                let owner = map
                    .owners
                    .get_mut(id as usize)
                    .filter(|owner| owner.is_none() && live(id));
                match owner {
                    Some(owner) => *owner = Some(key),
                    None => {
                        return Err(IndexError::corrupt(format!(
                            "key {key} maps to invalid node {id}"
                        )));
                    }
                }
            }
            map.vectors += nodes.len();
            map.forward.insert(key, KeyNodes::from_vec(nodes));
        }
        Ok(map)
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Number of node ids owned by all keys.
    pub fn vectors_len(&self) -> usize {
        self.vectors
    }

    pub fn contains(&self, key: u64) -> bool {
        self.forward.contains_key(&key)
    }

    pub fn count(&self, key: u64) -> usize {
        self.forward.get(&key).map_or(0, |nodes| nodes.len())
    }

    pub fn nodes(&self, key: u64) -> Option<&[NodeId]> {
        self.forward.get(&key).map(|nodes| nodes.as_slice())
    }

    pub fn key_of(&self, id: NodeId) -> Option<u64> {
        self.owners.get(id as usize).copied().flatten()
    }

    /// Fails with `DuplicateKey` if `key` cannot take another node.
    pub fn check_insert(&self, key: u64) -> Result<(), IndexError> {
        if !self.multi && self.forward.contains_key(&key) {
            return Err(IndexError::DuplicateKey { key });
        }
        Ok(())
    }

    /// Associates node `id` with `key`. Call [`KeyMap::check_insert`] first.
    pub fn insert(&mut self, key: u64, id: NodeId) {
        let slot = id as usize;
        if self.owners.len() <= slot {
            self.owners.resize(slot + 1, None);
        }
        self.owners[slot] = Some(key);
        self.forward.entry(key).or_default().push(id);
        self.vectors += 1;
    }

    /// Removes `key` and returns the node ids it owned.
    pub fn remove(&mut self, key: u64) -> Option<KeyNodes> {
        let nodes = self.forward.remove(&key)?;
        for &id in &nodes {
            if let Some(owner) = self.owners.get_mut(id as usize) {
                *owner = None;
            }
        }
        self.vectors -= nodes.len();
        Some(nodes)
    }

    /// Node ids owned by any key, ascending.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter_map(|(id, owner)| owner.map(|_| id as NodeId))
    }

    /// All entries sorted by key, for deterministic persistence.
    pub fn entries(&self) -> Vec<(u64, Vec<NodeId>)> {
        let mut entries: Vec<(u64, Vec<NodeId>)> = self
            .forward
            .iter()
            .map(|(&key, nodes)| (key, nodes.to_vec()))
            .collect();
        entries.sort_unstable_by_key(|(key, _)| *key);
        entries
    }

    pub fn reserve(&mut self, slots: usize) -> Result<(), IndexError> {
        self.owners
            .try_reserve_exact(slots.saturating_sub(self.owners.len()))
            .map_err(|_| IndexError::CapacityExceeded { capacity: slots })
    }

    pub fn memory_usage(&self) -> usize {
        self.forward.capacity() * (size_of::<u64>() + size_of::<KeyNodes>())
            + self.owners.capacity() * size_of::<Option<u64>>()
    }
}
