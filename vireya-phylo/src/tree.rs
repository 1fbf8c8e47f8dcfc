//! Arena-based phylogenetic tree with a cached preorder traversal list.
//!
//! Nodes live in a `Vec` and refer to each other by [`NodeId`] index. The tree
//! is rooted at a tip; each node stores its parent, leftmost child, and right
//! sibling, plus doubly-linked `prev_preorder`/`next_preorder` pointers that
//! are maintained incrementally by the rearrangement primitives in
//! [`crate::tree_manip`]. Whole-tree iteration therefore never needs to
//! re-walk the structure.

use vireya_core::Summarizable;

/// Index of a node in the tree's arena.
pub type NodeId = usize;

/// Smallest edge length the setter will store. Shorter edges produce singular
/// or log-of-zero terms in transition-probability formulas downstream.
pub const MIN_EDGE_LEN: f64 = 1e-8;

/// One taxon (tip) or ancestral split (internal node).
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) number: usize,
    pub(crate) parent: Option<NodeId>,
    pub(crate) lchild: Option<NodeId>,
    pub(crate) rsib: Option<NodeId>,
    pub(crate) prev_preorder: Option<NodeId>,
    pub(crate) next_preorder: Option<NodeId>,
    pub(crate) edge_len: f64,
    pub(crate) is_tip: bool,
    pub(crate) selected: bool,
}

impl Node {
    fn new(number: usize, is_tip: bool) -> Self {
        Self {
            number,
            parent: None,
            lchild: None,
            rsib: None,
            prev_preorder: None,
            next_preorder: None,
            edge_len: 0.0,
            is_tip,
            selected: false,
        }
    }
}

/// Rooted phylogenetic tree over an arena of [`Node`]s.
///
/// The root is always a tip; its single child is called the *subroot*. Every
/// topology or edge-length mutation clears the cached node counts and the
/// cached tree identity.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) nodes: Vec<Node>,
    pub(crate) first_preorder: Option<NodeId>,
    pub(crate) last_preorder: Option<NodeId>,
    pub(crate) n_tips: usize,
    pub(crate) n_internals: usize,
    pub(crate) counts_valid: bool,
    pub(crate) id_valid: bool,
}

impl Tree {
    /// Create an empty tree. Use the builders in [`crate::tree_manip`] to
    /// populate it.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            first_preorder: None,
            last_preorder: None,
            n_tips: 0,
            n_internals: 0,
            counts_valid: false,
            id_valid: false,
        }
    }

    /// Add a detached node to the arena and return its id.
    pub fn add_node(&mut self, number: usize, is_tip: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(number, is_tip));
        self.invalidate_counts();
        self.invalidate_id();
        id
    }

    /// Total number of nodes in the arena.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The tip at which the tree is rooted.
    ///
    /// # Panics
    ///
    /// Panics if the tree is empty.
    pub fn root(&self) -> NodeId {
        self.first_preorder.expect("tree has no root")
    }

    /// The root tip's single child.
    pub fn subroot(&self) -> NodeId {
        self.nodes[self.root()]
            .lchild
            .expect("root tip has no child")
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn lchild(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].lchild
    }

    pub fn rsib(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].rsib
    }

    pub fn is_tip(&self, id: NodeId) -> bool {
        self.nodes[id].is_tip
    }

    pub fn is_internal(&self, id: NodeId) -> bool {
        !self.nodes[id].is_tip
    }

    /// Whether `id` is the tip serving as the root.
    pub fn is_root(&self, id: NodeId) -> bool {
        self.first_preorder == Some(id)
    }

    pub fn number(&self, id: NodeId) -> usize {
        self.nodes[id].number
    }

    pub fn edge_len(&self, id: NodeId) -> f64 {
        self.nodes[id].edge_len
    }

    /// Set the edge length above `id`, clamping to [`MIN_EDGE_LEN`].
    pub fn set_edge_len(&mut self, id: NodeId, len: f64) {
        self.nodes[id].edge_len = len.max(MIN_EDGE_LEN);
        self.invalidate_id();
    }

    pub fn is_selected(&self, id: NodeId) -> bool {
        self.nodes[id].selected
    }

    /// Mark `id` as touched by the in-flight proposal.
    pub fn select_node(&mut self, id: NodeId) {
        self.nodes[id].selected = true;
    }

    pub fn unselect_node(&mut self, id: NodeId) {
        self.nodes[id].selected = false;
    }

    /// Iterate over the children of `id`, left to right.
    pub fn children(&self, id: NodeId) -> Children<'_> {
        Children {
            tree: self,
            next: self.nodes[id].lchild,
        }
    }

    pub fn count_children(&self, id: NodeId) -> usize {
        self.children(id).count()
    }

    /// Iterate the whole tree in preorder via the cached traversal list.
    pub fn preorder(&self) -> Preorder<'_> {
        Preorder {
            tree: self,
            next: self.first_preorder,
        }
    }

    /// Number of tip nodes, recounting if a mutation invalidated the cache.
    pub fn n_tips(&mut self) -> usize {
        self.refresh_counts();
        self.n_tips
    }

    /// Number of internal nodes, recounting if necessary.
    pub fn n_internals(&mut self) -> usize {
        self.refresh_counts();
        self.n_internals
    }

    pub fn counts_valid(&self) -> bool {
        self.counts_valid
    }

    pub fn id_valid(&self) -> bool {
        self.id_valid
    }

    pub(crate) fn invalidate_counts(&mut self) {
        self.counts_valid = false;
    }

    pub(crate) fn invalidate_id(&mut self) {
        self.id_valid = false;
    }

    fn refresh_counts(&mut self) {
        if self.counts_valid {
            return;
        }
        let mut tips = 0;
        let mut internals = 0;
        let mut next = self.first_preorder;
        while let Some(id) = next {
            if self.nodes[id].is_tip {
                tips += 1;
            } else {
                internals += 1;
            }
            next = self.nodes[id].next_preorder;
        }
        self.n_tips = tips;
        self.n_internals = internals;
        self.counts_valid = true;
    }

    /// Last node, in preorder, of the clade rooted at `s`.
    pub(crate) fn find_last_preorder_in_clade(&self, s: NodeId) -> NodeId {
        let mut nd = s;
        while let Some(child) = self.find_rightmost_child(nd) {
            nd = child;
        }
        nd
    }

    pub(crate) fn find_rightmost_child(&self, u: NodeId) -> Option<NodeId> {
        let mut child = self.nodes[u].lchild?;
        while let Some(sib) = self.nodes[child].rsib {
            child = sib;
        }
        Some(child)
    }

    /// The immediate left sibling of `s`, if any.
    pub(crate) fn find_left_sib(&self, s: NodeId) -> Option<NodeId> {
        let parent = self.nodes[s].parent?;
        let mut child = self.nodes[parent].lchild?;
        if child == s {
            return None;
        }
        while let Some(sib) = self.nodes[child].rsib {
            if sib == s {
                return Some(child);
            }
            child = sib;
        }
        None
    }

    /// Rebuild the cached preorder list from the parent/child/sibling links.
    ///
    /// The rearrangement primitives keep the list consistent incrementally;
    /// this full rebuild is used by tree builders and by the consistency
    /// checker in tests.
    pub fn refresh_preorder(&mut self) {
        let Some(root) = self.first_preorder else {
            return;
        };
        let mut stack: Vec<NodeId> = vec![root];
        let mut prev: Option<NodeId> = None;
        while let Some(id) = stack.pop() {
            self.nodes[id].prev_preorder = prev;
            self.nodes[id].next_preorder = None;
            if let Some(p) = prev {
                self.nodes[p].next_preorder = Some(id);
            }
            prev = Some(id);
            // Push children right-to-left so the leftmost is visited first.
            let mut rev: Vec<NodeId> = self.children(id).collect();
            rev.reverse();
            stack.extend(rev);
        }
        self.last_preorder = prev;
    }

    /// Verify that the cached preorder list visits exactly the reachable
    /// nodes, in the order implied by the parent/child/sibling links, with
    /// consistent back-pointers. Used by tests after every mutation.
    pub fn check_preorder_consistency(&self) -> bool {
        let Some(root) = self.first_preorder else {
            return self.nodes.is_empty();
        };
        // Expected order from the structural links.
        let mut expected = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            expected.push(id);
            let mut rev: Vec<NodeId> = self.children(id).collect();
            rev.reverse();
            stack.extend(rev);
        }
        // Actual order from the cached list.
        let mut actual = Vec::new();
        let mut next = Some(root);
        while let Some(id) = next {
            actual.push(id);
            if actual.len() > self.nodes.len() {
                return false; // cycle
            }
            next = self.nodes[id].next_preorder;
        }
        if expected != actual {
            return false;
        }
        if self.last_preorder != actual.last().copied() {
            return false;
        }
        // Back-pointers must mirror the forward chain.
        let mut prev = None;
        for &id in &actual {
            if self.nodes[id].prev_preorder != prev {
                return false;
            }
            prev = Some(id);
        }
        // Every child must point back to its parent.
        for &id in &actual {
            for child in self.children(id) {
                if self.nodes[child].parent != Some(id) {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Summarizable for Tree {
    fn summary(&self) -> String {
        let n = self.preorder().count();
        format!(
            "Tree: {} nodes, rooted at tip {}",
            n,
            self.first_preorder.map_or(0, |r| self.nodes[r].number)
        )
    }
}

/// Iterator over the children of a node.
pub struct Children<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Children<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.nodes[id].rsib;
        Some(id)
    }
}

/// Preorder iterator driven by the cached traversal list.
pub struct Preorder<'a> {
    tree: &'a Tree,
    next: Option<NodeId>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.next?;
        self.next = self.tree.nodes[id].next_preorder;
        Some(id)
    }
}
