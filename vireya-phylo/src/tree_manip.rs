//! Tree construction and rearrangement primitives.
//!
//! Everything here is built on two inverse operations, [`detach_subtree`] and
//! [`insert_subtree`], which splice a whole clade out of (or into) both the
//! structural links and the cached preorder list in time proportional to the
//! clade size. The NNI swaps used by topology proposals are compositions of
//! the pair, which makes them exactly self-inverse: applying the same swap
//! twice restores the original child order, preorder list and all.

use vireya_core::rng::Xorshift64;
use vireya_core::{Result, VireyaError};

use crate::dist::Distribution;
use crate::tree::{NodeId, Tree};

/// Which side of the target to insert on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertSide {
    Left,
    Right,
}

/// Splice the clade rooted at `s` out of the tree.
///
/// Afterwards `s` has no parent, no right sibling, and its clade forms a
/// detached preorder chain. `s` must not be the root tip.
pub fn detach_subtree(tree: &mut Tree, s: NodeId) {
    debug_assert!(!tree.is_root(s), "cannot detach the root tip");
    let s_par = tree.nodes[s].parent.expect("detach_subtree: s has no parent");
    let s_lsib = tree.find_left_sib(s);
    let s_rsib = tree.nodes[s].rsib;
    let s_prev = tree.nodes[s]
        .prev_preorder
        .expect("detach_subtree: s has no preorder predecessor");
    let slast = tree.find_last_preorder_in_clade(s);
    let slast_next = tree.nodes[slast].next_preorder;

    // Structural links.
    match s_lsib {
        Some(lsib) => tree.nodes[lsib].rsib = s_rsib,
        None => tree.nodes[s_par].lchild = s_rsib,
    }
    tree.nodes[s].parent = None;
    tree.nodes[s].rsib = None;

    // The clade occupies a contiguous preorder block [s, slast]; splice it out.
    tree.nodes[s_prev].next_preorder = slast_next;
    match slast_next {
        Some(after) => tree.nodes[after].prev_preorder = Some(s_prev),
        None => tree.last_preorder = Some(s_prev),
    }
    tree.nodes[s].prev_preorder = None;
    tree.nodes[slast].next_preorder = None;

    tree.invalidate_counts();
    tree.invalidate_id();
}

/// Attach the detached clade rooted at `s` as a child of `u`.
///
/// With no `target_sib`, `InsertSide::Left` makes `s` the leftmost child and
/// `InsertSide::Right` the rightmost. With `target_sib` (which must already be
/// a child of `u`), `s` lands immediately to the given side of it.
pub fn insert_subtree(
    tree: &mut Tree,
    s: NodeId,
    u: NodeId,
    side: InsertSide,
    target_sib: Option<NodeId>,
) {
    debug_assert!(tree.nodes[s].parent.is_none(), "s must be detached");
    debug_assert!(
        target_sib.map_or(true, |t| tree.nodes[t].parent == Some(u)),
        "target_sib must be a child of u"
    );

    let slast = tree.find_last_preorder_in_clade(s);
    let u_lchild = tree.nodes[u].lchild;
    let u_rchild = tree.find_rightmost_child(u);

    // Normalize: reduce every case to "leftmost", "rightmost", or "right of a
    // specific existing sibling".
    let mut side = side;
    let mut target = target_sib;
    if side == InsertSide::Left && target == u_lchild {
        target = None;
    }
    if side == InsertSide::Right && target == u_rchild {
        target = None;
    }
    if side == InsertSide::Left {
        if let Some(t) = target {
            target = tree.find_left_sib(t);
            side = InsertSide::Right;
        }
    }

    match (side, target) {
        (InsertSide::Right, None) => {
            // Append as rightmost child, after u's entire current clade.
            let ulast = tree.find_last_preorder_in_clade(u);
            let ulast_next = tree.nodes[ulast].next_preorder;
            tree.nodes[s].parent = Some(u);
            tree.nodes[s].rsib = None;
            match u_rchild {
                Some(rc) => tree.nodes[rc].rsib = Some(s),
                None => tree.nodes[u].lchild = Some(s),
            }
            tree.nodes[ulast].next_preorder = Some(s);
            tree.nodes[s].prev_preorder = Some(ulast);
            tree.nodes[slast].next_preorder = ulast_next;
            match ulast_next {
                Some(after) => tree.nodes[after].prev_preorder = Some(slast),
                None => tree.last_preorder = Some(slast),
            }
        }
        (InsertSide::Left, None) => {
            // Prepend as leftmost child, immediately after u in preorder.
            let u_next = tree.nodes[u].next_preorder;
            tree.nodes[s].parent = Some(u);
            tree.nodes[s].rsib = u_lchild;
            tree.nodes[u].lchild = Some(s);
            tree.nodes[s].prev_preorder = Some(u);
            tree.nodes[u].next_preorder = Some(s);
            tree.nodes[slast].next_preorder = u_next;
            match u_next {
                Some(after) => tree.nodes[after].prev_preorder = Some(slast),
                None => tree.last_preorder = Some(slast),
            }
        }
        (InsertSide::Right, Some(t)) => {
            // Immediately right of t; t is not the rightmost child here, so
            // the node after t's clade exists.
            let t_rsib = tree.nodes[t].rsib;
            let tlast = tree.find_last_preorder_in_clade(t);
            let tlast_next = tree.nodes[tlast].next_preorder;
            tree.nodes[s].parent = Some(u);
            tree.nodes[s].rsib = t_rsib;
            tree.nodes[t].rsib = Some(s);
            tree.nodes[tlast].next_preorder = Some(s);
            tree.nodes[s].prev_preorder = Some(tlast);
            tree.nodes[slast].next_preorder = tlast_next;
            if let Some(after) = tlast_next {
                tree.nodes[after].prev_preorder = Some(slast);
            } else {
                tree.last_preorder = Some(slast);
            }
        }
        (InsertSide::Left, Some(_)) => unreachable!("normalized away above"),
    }

    tree.invalidate_counts();
    tree.invalidate_id();
}

/// Detach the clade rooted at `s` and reattach it as the rightmost child of
/// `u`. `s` must not be an ancestor of `u`.
pub fn sib_to_child(tree: &mut Tree, u: NodeId, s: NodeId) {
    detach_subtree(tree, s);
    insert_subtree(tree, s, u, InsertSide::Right, None);
}

/// Move `u`'s leftmost child so it becomes the immediate left sibling of `w`.
pub fn lchild_to_lsib(tree: &mut Tree, u: NodeId, w: NodeId) {
    let a = tree.nodes[u].lchild.expect("lchild_to_lsib: u has no child");
    debug_assert!(a != w, "cannot move a node next to itself");
    let v = tree.nodes[w].parent.expect("lchild_to_lsib: w has no parent");
    detach_subtree(tree, a);
    insert_subtree(tree, a, v, InsertSide::Left, Some(w));
}

/// Move `u`'s rightmost child so it becomes the immediate right sibling of
/// `w`.
pub fn rchild_to_rsib(tree: &mut Tree, u: NodeId, w: NodeId) {
    let a = tree
        .find_rightmost_child(u)
        .expect("rchild_to_rsib: u has no child");
    debug_assert!(a != w, "cannot move a node next to itself");
    let v = tree.nodes[w].parent.expect("rchild_to_rsib: w has no parent");
    detach_subtree(tree, a);
    insert_subtree(tree, a, v, InsertSide::Right, Some(w));
}

/// Nearest-neighbor interchange: exchange the clades rooted at `swap1` and
/// `swap2`, each taking over the other's exact position among its siblings.
///
/// The two nodes must stand in the nephew/uncle relation across one internal
/// edge (one's grandparent is the other's parent), so neither is an ancestor
/// of the other. Calling this twice with the same arguments is a no-op.
pub fn nni_swap(tree: &mut Tree, swap1: NodeId, swap2: NodeId) {
    let p1 = tree.nodes[swap1].parent.expect("nni_swap: swap1 has no parent");
    let p2 = tree.nodes[swap2].parent.expect("nni_swap: swap2 has no parent");
    debug_assert!(
        tree.nodes[p1].parent == Some(p2) || tree.nodes[p2].parent == Some(p1),
        "nni_swap arguments must be nephew and uncle"
    );
    let ls1 = tree.find_left_sib(swap1);
    let ls2 = tree.find_left_sib(swap2);

    detach_subtree(tree, swap1);
    detach_subtree(tree, swap2);

    match ls1 {
        Some(sib) => insert_subtree(tree, swap2, p1, InsertSide::Right, Some(sib)),
        None => insert_subtree(tree, swap2, p1, InsertSide::Left, None),
    }
    match ls2 {
        Some(sib) => insert_subtree(tree, swap1, p2, InsertSide::Right, Some(sib)),
        None => insert_subtree(tree, swap1, p2, InsertSide::Left, None),
    }
}

/// NNI variant used when the "uncle" in a proposal is the focal node's own
/// grandparent: swap the clade rooted at `swap1` with everything on the far
/// side of the edge between `swap1`'s parent and grandparent.
///
/// Self-inverse, like [`nni_swap`].
pub fn nni_swap_special(tree: &mut Tree, swap1: NodeId) {
    let v = tree.nodes[swap1]
        .parent
        .expect("nni_swap_special: swap1 has no parent");
    let u = tree.nodes[v]
        .parent
        .expect("nni_swap_special: parent of swap1 is the subroot");

    let mut r = tree
        .find_rightmost_child(u)
        .expect("nni_swap_special: u has no children");
    if r == v {
        r = swap1;
    }
    let mut l = tree.nodes[u].lchild.expect("nni_swap_special: u has no children");
    if l == v {
        l = swap1;
    }

    // Pull u's other children down next to swap1...
    while tree.nodes[u].lchild != Some(v) {
        lchild_to_lsib(tree, u, swap1);
    }
    while tree.nodes[v].rsib.is_some() {
        rchild_to_rsib(tree, u, swap1);
    }
    // ...and push v's former children up next to v.
    while tree.nodes[v].lchild != Some(l) {
        lchild_to_lsib(tree, v, v);
    }
    while tree.nodes[r].rsib.is_some() {
        rchild_to_rsib(tree, v, v);
    }
}

/// Build a star tree: tip number 0 as the root, one internal hub, and the
/// remaining `ntips - 1` tips as children of the hub. Every edge length is
/// drawn from `edge_len_dist`.
pub fn star_tree(
    ntips: usize,
    edge_len_dist: &dyn Distribution,
    rng: &mut Xorshift64,
) -> Result<Tree> {
    if ntips < 2 {
        return Err(VireyaError::InvalidInput(
            "star_tree: need at least 2 tips".into(),
        ));
    }
    let mut tree = Tree::new();
    let root = tree.add_node(0, true);
    tree.first_preorder = Some(root);
    tree.last_preorder = Some(root);

    let hub = tree.add_node(ntips, false);
    tree.set_edge_len(hub, edge_len_dist.sample(rng));
    insert_subtree(&mut tree, hub, root, InsertSide::Left, None);

    for number in 1..ntips {
        let tip = tree.add_node(number, true);
        tree.set_edge_len(tip, edge_len_dist.sample(rng));
        insert_subtree(&mut tree, tip, hub, InsertSide::Right, None);
    }
    Ok(tree)
}

/// Build a random binary topology by sequential edge splitting.
///
/// Starts from the 3-tip star and, for each additional tip, splits the edge
/// above a uniformly chosen non-root node with a new internal node. Tips are
/// numbered `0..ntips`, internals from `ntips` upward. Edge lengths come from
/// `edge_len_dist`.
pub fn random_tree(
    ntips: usize,
    edge_len_dist: &dyn Distribution,
    rng: &mut Xorshift64,
) -> Result<Tree> {
    if ntips < 3 {
        return Err(VireyaError::InvalidInput(
            "random_tree: need at least 3 tips".into(),
        ));
    }
    let mut tree = star_tree(3, edge_len_dist, rng)?;
    // star_tree numbered the hub 3; renumber it to follow all tips.
    let hub = tree.subroot();
    tree.nodes[hub].number = ntips;

    for k in 3..ntips {
        // Choose the edge to split: any node other than the root tip.
        let candidates: Vec<NodeId> = tree.preorder().filter(|&n| !tree.is_root(n)).collect();
        let nd = candidates[rng.sample_uint(candidates.len())];

        let p = tree.nodes[nd].parent.expect("non-root node has a parent");
        let left_sib = tree.find_left_sib(nd);
        let v = tree.add_node(ntips + k - 2, false);
        tree.set_edge_len(v, edge_len_dist.sample(rng));
        let t = tree.add_node(k, true);
        tree.set_edge_len(t, edge_len_dist.sample(rng));

        // Replace nd with v in p's child list, then hang nd and the new tip
        // under v.
        detach_subtree(&mut tree, nd);
        match left_sib {
            Some(sib) => insert_subtree(&mut tree, v, p, InsertSide::Right, Some(sib)),
            None => insert_subtree(&mut tree, v, p, InsertSide::Left, None),
        }
        insert_subtree(&mut tree, nd, v, InsertSide::Right, None);
        insert_subtree(&mut tree, t, v, InsertSide::Right, None);
    }
    Ok(tree)
}
