//! Reasoning tree: nodes, UCB1 scoring, and bounded snapshots.
//!
//! The tree is a flat `{id -> node}` map with parent/child links held by
//! value, never by ownership, so there are no reference cycles and snapshot
//! serialization is a plain map copy. Mutation happens only on the owning
//! engine's logical thread of control; nothing here needs a lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::text::{round_to, truncate_chars};

/// Snapshot truncation caps, so payloads stay bounded regardless of how much
/// output an execution produced.
pub const CONTENT_SNAPSHOT_CAP: usize = 300;
pub const CODE_SNAPSHOT_CAP: usize = 500;
pub const STDOUT_SNAPSHOT_CAP: usize = 300;
pub const STDERR_SNAPSHOT_CAP: usize = 200;

/// Generate a fresh opaque node id.
pub fn make_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// What a node in the reasoning tree represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// The user's question (tree root)
    Root,
    /// A textual plan without code yet
    Strategy,
    /// An executable code fragment
    Code,
    /// The output of a code execution
    Result,
    /// A final synthesized answer
    Answer,
    /// A candidate rubric (rubric variant)
    Hypothesis,
    /// A refined rubric (rubric variant)
    Refinement,
    /// The best rubric, marked at the end of a discovery run
    Final,
}

/// A node in the reasoning tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningNode {
    pub id: String,
    pub content: String,
    pub kind: NodeKind,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub visits: u64,
    pub total_value: f64,
    pub depth: u32,

    /// The executed code fragment, for `code` nodes.
    pub code: String,
    /// Captured stdout from execution (bounded by the sandbox).
    pub stdout: String,
    /// Captured stderr from execution (bounded by the sandbox).
    pub stderr: String,
    /// Bounded variable reprs after execution.
    pub variables: BTreeMap<String, String>,
    pub execution_ms: f64,
}

impl ReasoningNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            kind,
            parent_id: None,
            children: Vec::new(),
            visits: 0,
            total_value: 0.0,
            depth: 0,
            code: String::new(),
            stdout: String::new(),
            stderr: String::new(),
            variables: BTreeMap::new(),
            execution_ms: 0.0,
        }
    }

    /// Mean back-propagated value; zero while unvisited.
    pub fn avg_value(&self) -> f64 {
        if self.visits > 0 {
            self.total_value / self.visits as f64
        } else {
            0.0
        }
    }

    /// UCB1 selection score. Unvisited nodes are infinitely attractive so
    /// they are explored before any sibling is repeated.
    pub fn ucb_score(&self, parent_visits: u64, exploration: f64) -> f64 {
        if self.visits == 0 {
            return f64::INFINITY;
        }
        let exploitation = self.total_value / self.visits as f64;
        let explore =
            exploration * ((parent_visits as f64).ln() / self.visits as f64).sqrt();
        exploitation + explore
    }

    /// Bounded, serializable view of this node.
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            content: truncate_chars(&self.content, CONTENT_SNAPSHOT_CAP),
            node_type: self.kind,
            parent_id: self.parent_id.clone(),
            children: self.children.clone(),
            visits: self.visits,
            total_value: round_to(self.total_value, 4),
            avg_value: round_to(self.avg_value(), 4),
            depth: self.depth,
            code: truncate_chars(&self.code, CODE_SNAPSHOT_CAP),
            stdout: truncate_chars(&self.stdout, STDOUT_SNAPSHOT_CAP),
            stderr: truncate_chars(&self.stderr, STDERR_SNAPSHOT_CAP),
            variables: self.variables.clone(),
            execution_ms: self.execution_ms,
        }
    }
}

/// Serialized node as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub content: String,
    pub node_type: NodeKind,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
    pub visits: u64,
    pub total_value: f64,
    pub avg_value: f64,
    pub depth: u32,
    pub code: String,
    pub stdout: String,
    pub stderr: String,
    pub variables: BTreeMap<String, String>,
    pub execution_ms: f64,
}

/// Full immutable snapshot of a tree, keyed by node id.
pub type TreeSnapshot = BTreeMap<String, NodeSnapshot>;

/// The id-keyed reasoning tree owned by one engine.
#[derive(Debug, Default)]
pub struct ReasoningTree {
    nodes: HashMap<String, ReasoningNode>,
    root_id: Option<String>,
}

impl ReasoningTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the root node. Panics in debug builds if called twice.
    pub fn insert_root(&mut self, mut node: ReasoningNode) -> String {
        debug_assert!(self.root_id.is_none(), "tree already has a root");
        node.parent_id = None;
        node.depth = 0;
        let id = node.id.clone();
        self.root_id = Some(id.clone());
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Attach a child under `parent_id`, fixing up depth and links.
    pub fn attach(&mut self, parent_id: &str, mut node: ReasoningNode) -> Option<String> {
        let parent_depth = self.nodes.get(parent_id)?.depth;
        node.parent_id = Some(parent_id.to_string());
        node.depth = parent_depth + 1;
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        if let Some(parent) = self.nodes.get_mut(parent_id) {
            parent.children.push(id.clone());
        }
        Some(id)
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&ReasoningNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ReasoningNode> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReasoningNode> {
        self.nodes.values()
    }

    /// UCB1 descent from the root to a leaf (a node with no children).
    ///
    /// The parent-visit count floors at 1 so the very first descent does not
    /// take a logarithm of zero.
    pub fn select_leaf(&self, exploration: f64) -> Option<String> {
        let mut current = self.root_id.clone()?;
        loop {
            let node = self.nodes.get(&current)?;
            if node.children.is_empty() {
                return Some(current);
            }
            let parent_visits = node.visits.max(1);
            let best = node
                .children
                .iter()
                .filter_map(|cid| self.nodes.get(cid))
                .max_by(|a, b| {
                    a.ucb_score(parent_visits, exploration)
                        .partial_cmp(&b.ucb_score(parent_visits, exploration))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })?;
            current = best.id.clone();
        }
    }

    /// Walk parent links from `node_id` to the root, adding one visit and
    /// the scalar value to every node on the path (root included).
    pub fn backpropagate(&mut self, node_id: &str, value: f64) {
        let mut current = Some(node_id.to_string());
        while let Some(id) = current {
            match self.nodes.get_mut(&id) {
                Some(node) => {
                    node.visits += 1;
                    node.total_value += value;
                    current = node.parent_id.clone();
                }
                None => break,
            }
        }
    }

    /// Full immutable snapshot of every node.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn small_tree() -> (ReasoningTree, String, String, String) {
        let mut tree = ReasoningTree::new();
        let root = tree.insert_root(ReasoningNode::new(make_id(), NodeKind::Root, "q"));
        let a = tree
            .attach(&root, ReasoningNode::new(make_id(), NodeKind::Code, "a"))
            .unwrap();
        let b = tree
            .attach(&root, ReasoningNode::new(make_id(), NodeKind::Code, "b"))
            .unwrap();
        (tree, root, a, b)
    }

    #[test]
    fn test_attach_sets_depth_and_links() {
        let (tree, root, a, _b) = small_tree();
        let child = tree.get(&a).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id.as_deref(), Some(root.as_str()));
        let parent = tree.get(&root).unwrap();
        assert_eq!(
            parent.children.iter().filter(|c| **c == a).count(),
            1,
            "parent's child list must contain the id exactly once"
        );
    }

    #[test]
    fn test_unvisited_ucb_is_infinite() {
        let (tree, _root, a, _b) = small_tree();
        let node = tree.get(&a).unwrap();
        assert_eq!(node.ucb_score(10, std::f64::consts::SQRT_2), f64::INFINITY);
    }

    #[test]
    fn test_unvisited_child_selected_before_repeats() {
        let (mut tree, _root, a, b) = small_tree();
        // Visit `a` with a high value; `b` is still unvisited.
        tree.backpropagate(&a, 0.9);
        let selected = tree.select_leaf(std::f64::consts::SQRT_2).unwrap();
        assert_eq!(selected, b);
    }

    #[test]
    fn test_backpropagate_increments_whole_path() {
        let (mut tree, root, a, _b) = small_tree();
        tree.backpropagate(&a, 0.8);

        let leaf = tree.get(&a).unwrap();
        assert_eq!(leaf.visits, 1);
        assert_eq!(leaf.total_value, 0.8);

        let root_node = tree.get(&root).unwrap();
        assert_eq!(root_node.visits, 1);
        assert_eq!(root_node.total_value, 0.8);
    }

    #[test]
    fn test_avg_value_zero_when_unvisited() {
        let node = ReasoningNode::new("n", NodeKind::Code, "x");
        assert_eq!(node.avg_value(), 0.0);
    }

    #[test]
    fn test_snapshot_truncates_and_rounds() {
        let mut node = ReasoningNode::new("n", NodeKind::Code, "c".repeat(1000));
        node.code = "x".repeat(1000);
        node.stdout = "o".repeat(1000);
        node.stderr = "e".repeat(1000);
        node.visits = 3;
        node.total_value = 1.0;

        let snap = node.snapshot();
        assert_eq!(snap.content.chars().count(), CONTENT_SNAPSHOT_CAP);
        assert_eq!(snap.code.chars().count(), CODE_SNAPSHOT_CAP);
        assert_eq!(snap.stdout.chars().count(), STDOUT_SNAPSHOT_CAP);
        assert_eq!(snap.stderr.chars().count(), STDERR_SNAPSHOT_CAP);
        assert_eq!(snap.avg_value, 0.3333);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_statistics() {
        let (mut tree, _root, a, b) = small_tree();
        tree.backpropagate(&a, 0.7);
        tree.backpropagate(&b, 0.2);

        let snapshot = tree.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: TreeSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, snapshot);
        for (id, node) in &parsed {
            if let Some(parent_id) = &node.parent_id {
                let parent = &parsed[parent_id];
                assert_eq!(parent.children.iter().filter(|c| *c == id).count(), 1);
                assert_eq!(node.depth, parent.depth + 1);
            }
        }
    }

    proptest! {
        /// After k back-propagations, visits along each path grew by exactly
        /// one per propagation and the root saw every one of them.
        #[test]
        fn prop_backprop_conserves_visits(values in proptest::collection::vec(0.0f64..1.0, 1..30)) {
            let (mut tree, root, a, b) = small_tree();
            for (i, v) in values.iter().enumerate() {
                let target = if i % 2 == 0 { &a } else { &b };
                tree.backpropagate(target, *v);
            }
            let root_node = tree.get(&root).unwrap();
            prop_assert_eq!(root_node.visits as usize, values.len());

            let leaf_visits = tree.get(&a).unwrap().visits + tree.get(&b).unwrap().visits;
            prop_assert_eq!(leaf_visits as usize, values.len());

            let total: f64 = values.iter().sum();
            prop_assert!((root_node.total_value - total).abs() < 1e-9);
        }
    }
}
