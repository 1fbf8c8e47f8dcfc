//! The Larget-Simon LOCAL move: a Metropolis-Hastings proposal that jointly
//! perturbs three contiguous edge lengths and, with some probability, the
//! topology via a nearest-neighbor interchange.
//!
//! The move picks an internal node Y (with parent U below the root tip), a
//! child X of Y, and either a sibling Z of Y or U itself. The three-edge path
//! X-Y-U-Z is stretched by a factor `exp(λ(u - 0.5))` and one of the two
//! interior nodes slides to a uniform position on the stretched path; sliding
//! past the far node swaps the X and Z clades. On a star tree (one internal
//! node) the move degenerates to a multiplicative change of one edge length.
//!
//! Rejection is exact: topology is un-swapped, edge lengths are restored from
//! the saved originals, and the likelihood arrays come back from cache, so a
//! rejected proposal leaves every bit of state as it was.

use vireya_core::Result;

use crate::tree::NodeId;
use crate::tree_manip::{nni_swap, nni_swap_special};
use crate::updater::{ChainState, Updater, UpdaterKind};

/// Larget-Simon LOCAL move with tuning constant λ.
pub struct LargetSimonMove {
    name: String,
    weight: u32,
    lambda: f64,
    fixed: bool,
    // Bookkeeping for the in-flight proposal.
    star_mode: bool,
    topol_changed: bool,
    nd_x: Option<NodeId>,
    nd_y: Option<NodeId>,
    nd_z: Option<NodeId>,
    orig_x: f64,
    orig_y: f64,
    orig_z: f64,
    swap1: Option<NodeId>,
    /// `None` with `topol_changed` set means the special swap was used.
    swap2: Option<NodeId>,
    star_node: Option<NodeId>,
    star_orig_len: f64,
    prev_likelihood_root: Option<NodeId>,
    n_accepted: usize,
    n_attempted: usize,
}

impl LargetSimonMove {
    pub fn new(lambda: f64) -> Self {
        Self {
            name: "larget_simon_local".into(),
            weight: 1,
            lambda,
            fixed: false,
            star_mode: false,
            topol_changed: false,
            nd_x: None,
            nd_y: None,
            nd_z: None,
            orig_x: 0.0,
            orig_y: 0.0,
            orig_z: 0.0,
            swap1: None,
            swap2: None,
            star_node: None,
            star_orig_len: 0.0,
            prev_likelihood_root: None,
            n_accepted: 0,
            n_attempted: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn set_lambda(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    pub fn n_accepted(&self) -> usize {
        self.n_accepted
    }

    pub fn n_attempted(&self) -> usize {
        self.n_attempted
    }

    fn reset(&mut self) {
        self.star_mode = false;
        self.topol_changed = false;
        self.nd_x = None;
        self.nd_y = None;
        self.nd_z = None;
        self.swap1 = None;
        self.swap2 = None;
        self.star_node = None;
    }

    /// Log Hastings ratio plus the affected-edge prior before and after.
    fn propose_star(&mut self, state: &mut ChainState) -> (f64, f64, f64) {
        let candidates: Vec<NodeId> = state
            .tree
            .preorder()
            .filter(|&n| !state.tree.is_root(n))
            .collect();
        let nd = candidates[state.rng.sample_uint(candidates.len())];
        let orig = state.tree.edge_len(nd);
        let u = state.rng.next_f64();
        let factor = (self.lambda * (u - 0.5)).exp();
        state.tree.set_edge_len(nd, orig * factor);
        state.tree.select_node(nd);
        self.star_node = Some(nd);
        self.star_orig_len = orig;

        let prior = state.edge_prior_for(nd);
        let prior_before = prior.ln_pdf(orig);
        let prior_after = prior.ln_pdf(state.tree.edge_len(nd));

        let anchor = if state.tree.is_tip(nd) {
            state.tree.parent(nd).expect("non-root tip has a parent")
        } else {
            nd
        };
        state.likelihood.use_as_likelihood_root(anchor);
        state.likelihood.invalidate_away_from_node_caching(&state.tree, nd);
        state.likelihood.invalidate_both_ends_caching(&state.tree, nd);

        (factor.ln(), prior_before, prior_after)
    }

    fn propose_default(&mut self, state: &mut ChainState) -> (f64, f64, f64) {
        // Y: an internal node whose parent is itself below the root tip.
        let root = state.tree.root();
        let eligible: Vec<NodeId> = state
            .tree
            .preorder()
            .filter(|&n| state.tree.is_internal(n) && state.tree.parent(n) != Some(root))
            .collect();
        let nd_y = eligible[state.rng.sample_uint(eligible.len())];
        let orig_y = state.tree.edge_len(nd_y);

        // X: a uniformly chosen child of Y.
        let y_children = state.tree.count_children(nd_y);
        let x_index = state.rng.sample_uint(y_children);
        let nd_x = state
            .tree
            .children(nd_y)
            .nth(x_index)
            .expect("child index in range");
        let orig_x = state.tree.edge_len(nd_x);

        // Z: either U itself (its edge continues the path upward) or one of
        // Y's siblings.
        let nd_u = state.tree.parent(nd_y).expect("Y is below the subroot");
        let u_children = state.tree.count_children(nd_u);
        let which = state.rng.sample_uint(u_children);
        let nd_z = if which == 0 {
            nd_u
        } else {
            let mut k = 1;
            let mut chosen = None;
            for c in state.tree.children(nd_u) {
                if c == nd_y {
                    continue;
                }
                if k == which {
                    chosen = Some(c);
                    break;
                }
                k += 1;
            }
            chosen.expect("sibling index in range")
        };
        let orig_z = state.tree.edge_len(nd_z);

        // Stretch the three-edge path and slide one interior node.
        let m = orig_x + orig_y + orig_z;
        let expand = state.rng.next_f64();
        let mstar = m * (self.lambda * (expand - 0.5)).exp();
        let scale = mstar / m;
        let (x, y, z) = (orig_x * scale, orig_y * scale, orig_z * scale);
        let xstar = state.rng.next_f64() * mstar;
        let moving_y = state.rng.next_f64() < 0.5;

        let (new_x, new_y, new_z);
        if moving_y && xstar <= x + y {
            new_x = xstar;
            new_y = x + y - xstar;
            new_z = z;
        } else if !moving_y && xstar <= y + z {
            new_x = x;
            new_y = y + z - xstar;
            new_z = xstar;
        } else {
            // The sliding node crossed the far end: swap the outer clades.
            self.topol_changed = true;
            if nd_z != nd_u {
                self.swap1 = Some(nd_x);
                self.swap2 = Some(nd_z);
                nni_swap(&mut state.tree, nd_x, nd_z);
            } else {
                self.swap1 = Some(nd_x);
                self.swap2 = None;
                nni_swap_special(&mut state.tree, nd_x);
            }
            if moving_y {
                new_x = x + y;
                new_y = xstar - x - y;
                new_z = x + y + z - xstar;
            } else {
                new_x = x + y + z - xstar;
                new_y = xstar - y - z;
                new_z = y + z;
            }
        }

        let prior_before = state.edge_prior_for(nd_x).ln_pdf(orig_x)
            + state.edge_prior_for(nd_y).ln_pdf(orig_y)
            + state.edge_prior_for(nd_z).ln_pdf(orig_z);

        state.tree.set_edge_len(nd_x, new_x);
        state.tree.set_edge_len(nd_y, new_y);
        state.tree.set_edge_len(nd_z, new_z);
        state.tree.select_node(nd_x);
        state.tree.select_node(nd_y);
        state.tree.select_node(nd_z);

        let prior_after = state.edge_prior_for(nd_x).ln_pdf(state.tree.edge_len(nd_x))
            + state.edge_prior_for(nd_y).ln_pdf(state.tree.edge_len(nd_y))
            + state.edge_prior_for(nd_z).ln_pdf(state.tree.edge_len(nd_z));

        self.nd_x = Some(nd_x);
        self.nd_y = Some(nd_y);
        self.nd_z = Some(nd_z);
        self.orig_x = orig_x;
        self.orig_y = orig_y;
        self.orig_z = orig_z;

        state.likelihood.use_as_likelihood_root(nd_y);
        state
            .likelihood
            .invalidate_away_from_node_caching(&state.tree, nd_y);
        state
            .likelihood
            .invalidate_both_ends_caching(&state.tree, nd_y);

        // Three lengths drawn from a stretched total of three segments.
        (3.0 * scale.ln(), prior_before, prior_after)
    }

    fn accept(&mut self, state: &mut ChainState) {
        state.likelihood.discard_caches();
        if self.star_mode {
            state.tree.unselect_node(self.star_node.expect("star proposal"));
        } else {
            state.tree.unselect_node(self.nd_x.expect("proposal"));
            state.tree.unselect_node(self.nd_y.expect("proposal"));
            state.tree.unselect_node(self.nd_z.expect("proposal"));
        }
    }

    fn revert(&mut self, state: &mut ChainState) {
        if self.star_mode {
            let nd = self.star_node.expect("star proposal");
            state.tree.set_edge_len(nd, self.star_orig_len);
            state.tree.unselect_node(nd);
        } else {
            // Undo the swap before touching edge lengths so every length
            // lands back on the node that originally carried it.
            if self.topol_changed {
                match self.swap2 {
                    Some(z) => nni_swap(&mut state.tree, self.swap1.expect("swap"), z),
                    None => nni_swap_special(&mut state.tree, self.swap1.expect("swap")),
                }
            }
            let (nd_x, nd_y, nd_z) = (
                self.nd_x.expect("proposal"),
                self.nd_y.expect("proposal"),
                self.nd_z.expect("proposal"),
            );
            state.tree.set_edge_len(nd_x, self.orig_x);
            state.tree.set_edge_len(nd_y, self.orig_y);
            state.tree.set_edge_len(nd_z, self.orig_z);
            state.tree.unselect_node(nd_x);
            state.tree.unselect_node(nd_y);
            state.tree.unselect_node(nd_z);
        }
        state.likelihood.restore_caches();
        state.likelihood.set_likelihood_root(self.prev_likelihood_root);
    }
}

impl Updater for LargetSimonMove {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn kind(&self) -> UpdaterKind {
        UpdaterKind::Move
    }

    fn is_fixed(&self) -> bool {
        self.fixed
    }

    fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    fn update(&mut self, state: &mut ChainState) -> Result<bool> {
        if self.fixed {
            return Ok(false);
        }
        self.reset();
        self.n_attempted += 1;
        self.prev_likelihood_root = state.likelihood.likelihood_root();
        self.star_mode = state.tree.n_internals() == 1;

        let prev_ln_like = state.last_ln_like;
        let (ln_hastings, prior_before, prior_after) = if self.star_mode {
            self.propose_star(state)
        } else {
            self.propose_default(state)
        };

        let curr_ln_like = state.likelihood.calc_ln_l(&state.tree);
        // Prior terms for unaffected edges are identical on both sides and
        // cancel, so only the affected edges enter the ratio.
        let ln_accept = state.heated(curr_ln_like, prior_after)
            - state.heated(prev_ln_like, prior_before)
            + ln_hastings;

        let accepted = ln_accept >= 0.0
            || state.rng.next_f64().max(f64::MIN_POSITIVE).ln() <= ln_accept;
        if accepted {
            self.n_accepted += 1;
            state.last_ln_like = curr_ln_like;
            state.refresh_last_ln_prior();
            self.accept(state);
            Ok(true)
        } else {
            self.revert(state);
            Ok(false)
        }
    }
}
