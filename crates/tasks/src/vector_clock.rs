/// Vector clocks for ordering a device's offline operations
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Per-installation identifier, the local axis of every vector clock
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Result of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Self dominates other: >= on every node, > on at least one
    Greater,
    /// Other dominates self
    Lesser,
    /// Neither dominates, including exact equality
    Concurrent,
}

impl ClockOrdering {
    pub fn reverse(self) -> Self {
        match self {
            Self::Greater => Self::Lesser,
            Self::Lesser => Self::Greater,
            Self::Concurrent => Self::Concurrent,
        }
    }
}

/// Vector clock for tracking causal dependencies.
///
/// Serialized in canonical form: a list of `(node, counter)` pairs sorted by
/// node id, so equal clocks always produce identical bytes. A zero counter
/// is the same as an absent node, for equality and for serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<(NodeId, u64)>", into = "Vec<(NodeId, u64)>")]
pub struct VectorClock {
    clocks: HashMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// Get the current value for a node
    pub fn get(&self, node: &NodeId) -> u64 {
        *self.clocks.get(node).unwrap_or(&0)
    }

    /// Increment the counter for a node. Only ever called with the local
    /// node's own id.
    pub fn increment(&mut self, node: &NodeId) -> &mut Self {
        *self.clocks.entry(node.clone()).or_insert(0) += 1;
        self
    }

    /// Pairwise max of both clocks. Neither input is modified.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (node, &count) in &other.clocks {
            let current = merged.clocks.entry(node.clone()).or_insert(0);
            *current = (*current).max(count);
        }
        merged
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let nodes: BTreeSet<_> = self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut less = false;
        let mut greater = false;

        for node in nodes {
            let self_val = self.get(node);
            let other_val = other.get(node);

            if self_val < other_val {
                less = true;
            }
            if self_val > other_val {
                greater = true;
            }
        }

        match (greater, less) {
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Lesser,
            _ => ClockOrdering::Concurrent,
        }
    }

    pub fn dominates(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Greater
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.values().all(|&count| count == 0)
    }

    pub fn to_canonical_form(&self) -> Vec<(NodeId, u64)> {
        let mut pairs: Vec<_> = self
            .clocks
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(node, &count)| (node.clone(), count))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn from_canonical_form(pairs: Vec<(NodeId, u64)>) -> Self {
        let mut clocks = HashMap::with_capacity(pairs.len());
        for (node, count) in pairs {
            let current = clocks.entry(node).or_insert(0);
            *current = count.max(*current);
        }
        Self { clocks }
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.to_canonical_form() == other.to_canonical_form()
    }
}

impl Eq for VectorClock {}

impl From<Vec<(NodeId, u64)>> for VectorClock {
    fn from(pairs: Vec<(NodeId, u64)>) -> Self {
        Self::from_canonical_form(pairs)
    }
}

impl From<VectorClock> for Vec<(NodeId, u64)> {
    fn from(clock: VectorClock) -> Self {
        clock.to_canonical_form()
    }
}
