//! Phylogenetic tree topology with mutable branch lengths.
//!
//! Uses arena-style storage: nodes live in a flat `Vec<Node>` and are
//! referenced by `NodeId` (a `usize` index). Parent/child links are indices,
//! so the tree clones cheaply and has no ownership cycles.
//!
//! A [`Tree`] is validated once at construction and then exposes
//! materialized pre-order and post-order sequences. The topology is
//! immutable afterwards; only branch lengths change.

use sylva_core::{Result, Summarizable, SylvaError};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// A single node in a phylogenetic tree.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Node {
    /// Index of this node in the arena.
    pub id: NodeId,
    /// Parent node (None for root).
    pub parent: Option<NodeId>,
    /// Child nodes, in insertion order.
    pub children: Vec<NodeId>,
    /// Length of the edge to the parent, in expected substitutions per site.
    /// Ignored for the root.
    pub branch_length: f64,
    /// Taxon or clade label.
    pub name: Option<String>,
}

impl Node {
    /// True if this node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node has no parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Incremental construction of a [`Tree`], starting from a lone root.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    nodes: Vec<Node>,
}

impl TreeBuilder {
    /// Start a tree with an unnamed root (id 0).
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                id: 0,
                parent: None,
                children: Vec::new(),
                branch_length: 0.0,
                name: None,
            }],
        }
    }

    /// The root id (always 0 for builder-made trees).
    pub fn root(&self) -> NodeId {
        0
    }

    /// Add a child to `parent` and return its `NodeId`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: Option<&str>,
        branch_length: f64,
    ) -> Result<NodeId> {
        if parent >= self.nodes.len() {
            return Err(SylvaError::InvalidInput(format!(
                "parent index {} out of range ({})",
                parent,
                self.nodes.len()
            )));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            branch_length,
            name: name.map(str::to_string),
        });
        self.nodes[parent].children.push(id);
        Ok(id)
    }

    /// Validate and freeze the topology.
    pub fn build(self) -> Result<Tree> {
        Tree::from_nodes(self.nodes, 0)
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated phylogenetic tree stored as an arena of nodes.
///
/// Invariants checked at construction:
/// - the root has exactly 2 (rooted) or 3 (unrooted, trifurcating) children;
/// - every node is reachable from the root exactly once;
/// - parent and child links agree;
/// - every non-root branch length is finite and non-negative.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tree {
    nodes: Vec<Node>,
    root: NodeId,
    preorder: Vec<NodeId>,
    postorder: Vec<NodeId>,
    leaves: Vec<NodeId>,
}

impl Tree {
    /// Create a tree from pre-built nodes and a root index.
    pub fn from_nodes(nodes: Vec<Node>, root: NodeId) -> Result<Self> {
        let n = nodes.len();
        if root >= n {
            return Err(SylvaError::Topology(format!(
                "root index {} out of range ({})",
                root, n
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if node.id != i {
                return Err(SylvaError::Topology(format!(
                    "node at arena slot {} carries id {}",
                    i, node.id
                )));
            }
            if i != root {
                match node.parent {
                    None => {
                        return Err(SylvaError::Topology(format!(
                            "node {} has no parent but is not the root",
                            i
                        )))
                    }
                    Some(p) if p >= n => {
                        return Err(SylvaError::Topology(format!(
                            "node {} has out-of-range parent {}",
                            i, p
                        )))
                    }
                    Some(p) => {
                        let listed = nodes[p].children.iter().filter(|&&c| c == i).count();
                        if listed != 1 {
                            return Err(SylvaError::Topology(format!(
                                "node {} is listed {} times among the children of {}",
                                i, listed, p
                            )));
                        }
                    }
                }
                if !node.branch_length.is_finite() || node.branch_length < 0.0 {
                    return Err(SylvaError::Topology(format!(
                        "node {} has invalid branch length {}",
                        i, node.branch_length
                    )));
                }
            }
            for &c in &node.children {
                if c >= n || nodes[c].parent != Some(i) {
                    return Err(SylvaError::Topology(format!(
                        "child {} of node {} does not point back to it",
                        c, i
                    )));
                }
            }
        }
        if nodes[root].parent.is_some() {
            return Err(SylvaError::Topology("root has a parent".into()));
        }
        let degree = nodes[root].children.len();
        if degree != 2 && degree != 3 {
            return Err(SylvaError::Topology(format!(
                "root must have 2 or 3 children, found {}",
                degree
            )));
        }

        // Iterative pre-order; a revisit means a cycle or shared child.
        let mut visited = vec![false; n];
        let mut preorder = Vec::with_capacity(n);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if visited[id] {
                return Err(SylvaError::Topology(format!(
                    "node {} is reachable more than once",
                    id
                )));
            }
            visited[id] = true;
            preorder.push(id);
            for &child in nodes[id].children.iter().rev() {
                stack.push(child);
            }
        }
        if preorder.len() != n {
            return Err(SylvaError::Topology(format!(
                "{} of {} nodes are unreachable from the root",
                n - preorder.len(),
                n
            )));
        }

        // Post-order: reverse of a right-to-left pre-order.
        let mut postorder = Vec::with_capacity(n);
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            postorder.push(id);
            for &child in &nodes[id].children {
                stack.push(child);
            }
        }
        postorder.reverse();

        let leaves = nodes.iter().filter(|n| n.is_leaf()).map(|n| n.id).collect();

        Ok(Self {
            nodes,
            root,
            preorder,
            postorder,
            leaves,
        })
    }

    /// Build a tree from a parent array (`None` marks the root) and per-node
    /// branch lengths. Children are ordered by ascending id.
    pub fn from_parents(parents: &[Option<NodeId>], branch_lengths: &[f64]) -> Result<Self> {
        if parents.len() != branch_lengths.len() {
            return Err(SylvaError::InvalidInput(format!(
                "{} parents but {} branch lengths",
                parents.len(),
                branch_lengths.len()
            )));
        }
        let roots: Vec<NodeId> = (0..parents.len()).filter(|&i| parents[i].is_none()).collect();
        if roots.len() != 1 {
            return Err(SylvaError::Topology(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        let mut nodes: Vec<Node> = (0..parents.len())
            .map(|i| Node {
                id: i,
                parent: parents[i],
                children: Vec::new(),
                branch_length: branch_lengths[i],
                name: None,
            })
            .collect();
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                if p >= nodes.len() {
                    return Err(SylvaError::Topology(format!(
                        "node {} has out-of-range parent {}",
                        i, p
                    )));
                }
                nodes[p].children.push(i);
            }
        }
        Self::from_nodes(nodes, roots[0])
    }

    /// Access a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// The root node id.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Total number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf nodes.
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Leaf ids in ascending order.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// True if `id` is a leaf. Out-of-range ids are not leaves.
    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes.get(id).map_or(false, Node::is_leaf)
    }

    /// Children of `id` (empty for leaves and out-of-range ids).
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Parent of `id`, `None` for the root.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id).and_then(|n| n.parent)
    }

    /// Length of the edge above `id` (0 for the root).
    pub fn branch_length(&self, id: NodeId) -> f64 {
        if id == self.root {
            return 0.0;
        }
        self.nodes.get(id).map_or(0.0, |n| n.branch_length)
    }

    /// Replace the length of the edge above `id`.
    pub fn set_branch_length(&mut self, id: NodeId, length: f64) -> Result<()> {
        if id == self.root {
            return Err(SylvaError::InvalidInput("the root has no edge".into()));
        }
        if !length.is_finite() || length < 0.0 {
            return Err(SylvaError::InvalidInput(format!(
                "branch length must be finite and non-negative, got {}",
                length
            )));
        }
        let node = self.nodes.get_mut(id).ok_or_else(|| {
            SylvaError::InvalidInput(format!("node index {} out of range", id))
        })?;
        node.branch_length = length;
        Ok(())
    }

    /// Current branch lengths indexed by node id (root entry is 0).
    pub fn branch_lengths(&self) -> Vec<f64> {
        (0..self.nodes.len()).map(|id| self.branch_length(id)).collect()
    }

    /// Pre-order (parent before children) node sequence.
    pub fn preorder(&self) -> &[NodeId] {
        &self.preorder
    }

    /// Post-order (children before parent) node sequence.
    pub fn postorder(&self) -> &[NodeId] {
        &self.postorder
    }

    /// Non-root nodes in pre-order; each identifies the edge above it.
    pub fn edges(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.preorder.iter().copied().filter(move |&id| id != self.root)
    }

    /// Siblings of `id`: the other children of its parent.
    pub fn siblings(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let parent_children = self.parent(id).map_or(&[][..], |p| self.children(p));
        parent_children.iter().copied().filter(move |&c| c != id)
    }

    /// `id` followed by each ancestor up to and including the root.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cur = Some(id);
        while let Some(node) = cur {
            path.push(node);
            cur = self.parent(node);
        }
        path
    }

    /// Maximum number of edges from the root to any leaf.
    pub fn depth(&self) -> usize {
        let mut depth = vec![0usize; self.nodes.len()];
        let mut max = 0;
        for &id in &self.preorder {
            if let Some(p) = self.nodes[id].parent {
                depth[id] = depth[p] + 1;
                max = max.max(depth[id]);
            }
        }
        max
    }

    /// Sum of all branch lengths.
    pub fn total_length(&self) -> f64 {
        self.edges().map(|id| self.nodes[id].branch_length).sum()
    }

    /// Leaf with the given name, if any.
    pub fn find_leaf(&self, name: &str) -> Option<NodeId> {
        self.leaves
            .iter()
            .copied()
            .find(|&id| self.nodes[id].name.as_deref() == Some(name))
    }

    /// True when the root is bifurcating.
    pub fn is_rooted(&self) -> bool {
        self.nodes[self.root].children.len() == 2
    }
}

impl Summarizable for Tree {
    fn summary(&self) -> String {
        let leaves = self.leaf_count();
        format!(
            "Tree: {} nodes ({} leaves, {} internal), {}",
            self.node_count(),
            leaves,
            self.node_count() - leaves,
            if self.is_rooted() { "rooted" } else { "unrooted" }
        )
    }
}
