//! Per-resource node-weight tables.
//!
//! A table maps node → weight plus two pieces of bookkeeping: `count`, the
//! number of instances (or promoted instances) already placed on the node
//! by the current pass, and `unusable`, a marker set by non-negative score
//! merging for nodes that must be skipped without being outright banned.
//!
//! Tables are `BTreeMap`s keyed by node index so iteration order, and
//! therefore every tie-break downstream, is identical across runs.

use std::collections::BTreeMap;
use std::collections::btree_map;

use hagrid_core::Score;
use serde::{Deserialize, Serialize};

use crate::types::NodeIdx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeWeight {
    pub weight: Score,
    pub count: u32,
    pub unusable: bool,
}

impl NodeWeight {
    pub fn new(weight: Score) -> Self {
        Self {
            weight,
            count: 0,
            unusable: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeWeights {
    entries: BTreeMap<NodeIdx, NodeWeight>,
}

impl NodeWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeIdx) -> Option<&NodeWeight> {
        self.entries.get(&node)
    }

    pub fn get_mut(&mut self, node: NodeIdx) -> Option<&mut NodeWeight> {
        self.entries.get_mut(&node)
    }

    pub fn weight(&self, node: NodeIdx) -> Option<Score> {
        self.entries.get(&node).map(|w| w.weight)
    }

    pub fn contains(&self, node: NodeIdx) -> bool {
        self.entries.contains_key(&node)
    }

    /// Insert or overwrite the weight for a node, keeping its bookkeeping.
    pub fn set_weight(&mut self, node: NodeIdx, weight: Score) {
        self.entries.entry(node).or_default().weight = weight;
    }

    /// Entry for a node, created with `weight` if absent.
    pub fn entry_or_insert(&mut self, node: NodeIdx, weight: Score) -> &mut NodeWeight {
        self.entries.entry(node).or_insert_with(|| NodeWeight::new(weight))
    }

    pub fn remove(&mut self, node: NodeIdx) -> Option<NodeWeight> {
        self.entries.remove(&node)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, NodeIdx, NodeWeight> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, NodeIdx, NodeWeight> {
        self.entries.iter_mut()
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset_counts(&mut self) {
        for w in self.entries.values_mut() {
            w.count = 0;
        }
    }

    pub fn clear_unusable(&mut self) {
        for w in self.entries.values_mut() {
            w.unusable = false;
        }
    }
}

impl FromIterator<(NodeIdx, Score)> for NodeWeights {
    fn from_iter<T: IntoIterator<Item = (NodeIdx, Score)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(node, weight)| (node, NodeWeight::new(weight)))
                .collect(),
        }
    }
}

impl<'a> IntoIterator for &'a NodeWeights {
    type Item = (&'a NodeIdx, &'a NodeWeight);
    type IntoIter = btree_map::Iter<'a, NodeIdx, NodeWeight>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_node_order() {
        let weights: NodeWeights = [(NodeIdx(2), 5), (NodeIdx(0), 1), (NodeIdx(1), 3)]
            .into_iter()
            .collect();
        let order: Vec<_> = weights.nodes().collect();
        assert_eq!(order, vec![NodeIdx(0), NodeIdx(1), NodeIdx(2)]);
    }

    #[test]
    fn set_weight_keeps_bookkeeping() {
        let mut weights = NodeWeights::new();
        weights.entry_or_insert(NodeIdx(0), 10).count = 2;
        weights.set_weight(NodeIdx(0), 40);
        let entry = weights.get(NodeIdx(0)).unwrap();
        assert_eq!(entry.weight, 40);
        assert_eq!(entry.count, 2);
    }

    #[test]
    fn reset_counts_zeroes_every_node() {
        let mut weights: NodeWeights = [(NodeIdx(0), 0), (NodeIdx(1), 0)].into_iter().collect();
        weights.get_mut(NodeIdx(0)).unwrap().count = 1;
        weights.get_mut(NodeIdx(1)).unwrap().count = 3;
        weights.reset_counts();
        assert!(weights.iter().all(|(_, w)| w.count == 0));
    }
}
