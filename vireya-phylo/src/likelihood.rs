//! Tree likelihood under a substitution model, with directional conditional
//! likelihood arrays.
//!
//! Every internal node can hold two CLAs: a *filial* array (likelihood of the
//! node's clade, conditional on the state at the node) and a *parental* array
//! (likelihood of everything outside the clade, excluding the node's own
//! edge, conditional on the state at the node's parent). The log likelihood
//! is harvested at any internal node by combining its two arrays across its
//! own edge; time reversibility makes the choice of harvest node irrelevant.
//!
//! Invalidation is directional: editing the edge above node `N` stales the
//! filial arrays of `N`'s strict ancestors and the parental arrays of every
//! other node. The caching variants divert stale arrays into per-node cache
//! slots and record each diversion in a transaction log, so a rejected
//! proposal can restore the pre-proposal arrays bit for bit.

use std::collections::HashMap;

use vireya_core::{Result, VireyaError};

use crate::cla::{ClaHandle, ClaPool};
use crate::subst_model::SubstitutionModel;
use crate::tree::{NodeId, Tree};
use crate::LN_ZERO;

/// Accumulated edges before underflow protection rescales a CLA.
const UNDERFLOW_TRIGGER_EDGES: usize = 50;
/// Rescaling aims the largest partial in each pattern at this value.
const UNDERFLOW_TARGET: f64 = 10_000.0;

/// Site patterns: per-tip state codes plus a weight for each pattern.
///
/// `None` marks missing data, which contributes a partial of one for every
/// state (the state is marginalized out).
#[derive(Debug, Clone)]
pub struct PatternData {
    /// `tip_states[tip_number][pattern]`
    tip_states: Vec<Vec<Option<u8>>>,
    counts: Vec<f64>,
    n_patterns: usize,
}

impl PatternData {
    /// Create pattern data directly. Every tip needs one state per pattern,
    /// and state codes must be below `n_states`.
    pub fn new(tip_states: Vec<Vec<Option<u8>>>, counts: Vec<f64>, n_states: usize) -> Result<Self> {
        let n_patterns = counts.len();
        if n_patterns == 0 {
            return Err(VireyaError::InvalidInput(
                "PatternData: need at least one pattern".into(),
            ));
        }
        for (tip, states) in tip_states.iter().enumerate() {
            if states.len() != n_patterns {
                return Err(VireyaError::InvalidInput(format!(
                    "PatternData: tip {tip} has {} states, expected {n_patterns}",
                    states.len()
                )));
            }
            if states.iter().flatten().any(|&s| s as usize >= n_states) {
                return Err(VireyaError::InvalidInput(format!(
                    "PatternData: tip {tip} has a state code >= {n_states}"
                )));
            }
        }
        if counts.iter().any(|&c| c <= 0.0) {
            return Err(VireyaError::InvalidInput(
                "PatternData: pattern counts must be positive".into(),
            ));
        }
        Ok(Self {
            tip_states,
            counts,
            n_patterns,
        })
    }

    /// Compress aligned sequences (one `Vec` of site states per tip) into
    /// unique patterns with counts.
    pub fn from_sequences(sequences: &[Vec<Option<u8>>], n_states: usize) -> Result<Self> {
        let n_tips = sequences.len();
        if n_tips == 0 {
            return Err(VireyaError::InvalidInput(
                "PatternData: need at least one sequence".into(),
            ));
        }
        let n_sites = sequences[0].len();
        if sequences.iter().any(|s| s.len() != n_sites) {
            return Err(VireyaError::InvalidInput(
                "PatternData: sequences must all have the same length".into(),
            ));
        }
        let mut order: Vec<Vec<Option<u8>>> = Vec::new();
        let mut index: HashMap<Vec<Option<u8>>, usize> = HashMap::new();
        let mut counts: Vec<f64> = Vec::new();
        for site in 0..n_sites {
            let column: Vec<Option<u8>> = sequences.iter().map(|s| s[site]).collect();
            match index.get(&column) {
                Some(&p) => counts[p] += 1.0,
                None => {
                    index.insert(column.clone(), order.len());
                    order.push(column);
                    counts.push(1.0);
                }
            }
        }
        let n_patterns = counts.len();
        let tip_states = (0..n_tips)
            .map(|tip| (0..n_patterns).map(|p| order[p][tip]).collect())
            .collect();
        Self::new(tip_states, counts, n_states)
    }

    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    pub fn n_tips(&self) -> usize {
        self.tip_states.len()
    }

    pub fn count(&self, pattern: usize) -> f64 {
        self.counts[pattern]
    }

    /// Partial likelihood contributed by a tip: a delta on the observed
    /// state, or one everywhere for missing data.
    fn tip_value(&self, tip_number: usize, pattern: usize, state: usize) -> f64 {
        match self.tip_states[tip_number][pattern] {
            Some(s) => (s as usize == state) as u8 as f64,
            None => 1.0,
        }
    }
}

/// Which of a node's two arrays an invalidation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Filial,
    Parental,
}

#[derive(Debug, Default)]
struct NodeCla {
    filial: Option<ClaHandle>,
    parental: Option<ClaHandle>,
    cached_filial: Option<ClaHandle>,
    cached_parental: Option<ClaHandle>,
}

/// Likelihood machinery for one tree: the substitution model, the site
/// patterns, the CLA pool, and the per-node array bookkeeping.
pub struct TreeLikelihood {
    model: Box<dyn SubstitutionModel>,
    data: PatternData,
    rates: Vec<f64>,
    rate_probs: Vec<f64>,
    pool: ClaPool,
    node_clas: Vec<NodeCla>,
    likelihood_root: Option<NodeId>,
    cache_log: Vec<(NodeId, Slot)>,
    underflow_trigger: usize,
}

impl TreeLikelihood {
    /// Create the likelihood machinery. `rates` and `rate_probs` define the
    /// among-site rate categories; pass `[1.0]` / `[1.0]` for rate
    /// homogeneity.
    pub fn new(
        model: Box<dyn SubstitutionModel>,
        data: PatternData,
        rates: Vec<f64>,
        rate_probs: Vec<f64>,
    ) -> Result<Self> {
        if rates.is_empty() || rates.len() != rate_probs.len() {
            return Err(VireyaError::InvalidInput(
                "TreeLikelihood: rates and rate_probs must be equal-length and nonempty".into(),
            ));
        }
        if rates.iter().any(|&r| r < 0.0) {
            return Err(VireyaError::InvalidInput(
                "TreeLikelihood: rates must be nonnegative".into(),
            ));
        }
        let prob_sum: f64 = rate_probs.iter().sum();
        if (prob_sum - 1.0).abs() > 1e-8 {
            return Err(VireyaError::InvalidInput(format!(
                "TreeLikelihood: rate probabilities sum to {prob_sum}, expected 1"
            )));
        }
        let pool = ClaPool::new(data.n_patterns(), rates.len(), model.n_states());
        Ok(Self {
            model,
            data,
            rates,
            rate_probs,
            pool,
            node_clas: Vec::new(),
            likelihood_root: None,
            cache_log: Vec::new(),
            underflow_trigger: UNDERFLOW_TRIGGER_EDGES,
        })
    }

    pub fn model(&self) -> &dyn SubstitutionModel {
        self.model.as_ref()
    }

    pub fn data(&self) -> &PatternData {
        &self.data
    }

    pub fn pool(&self) -> &ClaPool {
        &self.pool
    }

    /// Override the underflow-protection trigger (edges between rescalings).
    pub fn set_underflow_trigger(&mut self, edges: usize) {
        self.underflow_trigger = edges.max(1);
    }

    pub fn likelihood_root(&self) -> Option<NodeId> {
        self.likelihood_root
    }

    /// Direct the next harvest to `node` (or its parent, if `node` is a tip).
    pub fn use_as_likelihood_root(&mut self, node: NodeId) {
        self.likelihood_root = Some(node);
    }

    /// Restore a previously saved harvest anchor (possibly unset).
    pub fn set_likelihood_root(&mut self, node: Option<NodeId>) {
        self.likelihood_root = node;
    }

    fn sync_node_storage(&mut self, tree: &Tree) {
        while self.node_clas.len() < tree.n_nodes() {
            self.node_clas.push(NodeCla::default());
        }
    }

    /// Internal node whose own edge the harvest crosses.
    fn focal_node(&self, tree: &Tree) -> NodeId {
        match self.likelihood_root {
            None => tree.subroot(),
            Some(n) if tree.is_root(n) => tree.subroot(),
            Some(n) if tree.is_tip(n) => tree.parent(n).expect("tip has a parent"),
            Some(n) => n,
        }
    }

    fn ancestor_flags(&self, tree: &Tree, node: NodeId) -> Vec<bool> {
        let mut flags = vec![false; tree.n_nodes()];
        let mut up = tree.parent(node);
        while let Some(a) = up {
            flags[a] = true;
            up = tree.parent(a);
        }
        flags
    }

    fn drop_slot(&mut self, node: NodeId, slot: Slot, cache: bool) {
        let entry = &mut self.node_clas[node];
        let taken = match slot {
            Slot::Filial => entry.filial.take(),
            Slot::Parental => entry.parental.take(),
        };
        if cache {
            let cached = match slot {
                Slot::Filial => &mut entry.cached_filial,
                Slot::Parental => &mut entry.cached_parental,
            };
            match taken {
                Some(handle) => {
                    debug_assert!(cached.is_none(), "cache slot already holds an array");
                    *cached = Some(handle);
                    self.cache_log.push((node, slot));
                }
                // An empty slot still goes on the log: anything computed in
                // its place during the proposal is stale after a revert and
                // must be cleared then.
                None => {
                    if cached.is_none() {
                        self.cache_log.push((node, slot));
                    }
                }
            }
        } else if let Some(handle) = taken {
            self.pool.check_in(handle);
        }
    }

    fn invalidate_away_impl(&mut self, tree: &Tree, focal: NodeId, cache: bool) {
        self.sync_node_storage(tree);
        let ancestors = self.ancestor_flags(tree, focal);
        for node in tree.preorder().collect::<Vec<_>>() {
            if ancestors[node] {
                self.drop_slot(node, Slot::Filial, cache);
            } else {
                self.drop_slot(node, Slot::Parental, cache);
            }
        }
    }

    /// Mark everything that depends on the edge above `focal` as stale:
    /// filial arrays of strict ancestors, parental arrays of all other nodes.
    pub fn invalidate_away_from_node(&mut self, tree: &Tree, focal: NodeId) {
        self.invalidate_away_impl(tree, focal, false);
    }

    /// Stale `focal`'s own two arrays.
    pub fn invalidate_both_ends(&mut self, tree: &Tree, focal: NodeId) {
        self.sync_node_storage(tree);
        self.drop_slot(focal, Slot::Filial, false);
        self.drop_slot(focal, Slot::Parental, false);
    }

    /// Caching variant of [`invalidate_away_from_node`]: stale arrays move
    /// into cache slots and onto the transaction log instead of back to the
    /// pool.
    pub fn invalidate_away_from_node_caching(&mut self, tree: &Tree, focal: NodeId) {
        self.invalidate_away_impl(tree, focal, true);
    }

    /// Caching variant of [`invalidate_both_ends`].
    pub fn invalidate_both_ends_caching(&mut self, tree: &Tree, focal: NodeId) {
        self.sync_node_storage(tree);
        self.drop_slot(focal, Slot::Filial, true);
        self.drop_slot(focal, Slot::Parental, true);
    }

    pub fn has_pending_cache(&self) -> bool {
        !self.cache_log.is_empty()
    }

    /// Put every cached array back into service, discarding whatever was
    /// recomputed in its place. Restores the exact pre-proposal arrays.
    pub fn restore_caches(&mut self) {
        while let Some((node, slot)) = self.cache_log.pop() {
            let entry = &mut self.node_clas[node];
            let (working, cached) = match slot {
                Slot::Filial => (&mut entry.filial, &mut entry.cached_filial),
                Slot::Parental => (&mut entry.parental, &mut entry.cached_parental),
            };
            if let Some(recomputed) = working.take() {
                self.pool.check_in(recomputed);
            }
            *working = cached.take();
        }
    }

    /// Drop every cached array, keeping the recomputed ones.
    pub fn discard_caches(&mut self) {
        while let Some((node, slot)) = self.cache_log.pop() {
            let entry = &mut self.node_clas[node];
            let cached = match slot {
                Slot::Filial => entry.cached_filial.take(),
                Slot::Parental => entry.cached_parental.take(),
            };
            if let Some(handle) = cached {
                self.pool.check_in(handle);
            }
        }
    }

    /// Compute the log likelihood, refreshing exactly the stale arrays.
    ///
    /// The focal node's filial array is always recomputed, so the caller can
    /// change the focal node's own edge length between calls without any
    /// invalidation.
    pub fn calc_ln_l(&mut self, tree: &Tree) -> f64 {
        self.sync_node_storage(tree);
        let focal = self.focal_node(tree);
        self.drop_slot(focal, Slot::Filial, false);
        self.ensure_filial(tree, focal);
        self.ensure_parental(tree, focal);
        self.harvest(tree, focal)
    }

    fn ensure_filial(&mut self, tree: &Tree, node: NodeId) {
        if tree.is_tip(node) {
            return;
        }
        let mut order = Vec::new();
        let mut stack = vec![node];
        while let Some(x) = stack.pop() {
            if tree.is_tip(x) || self.node_clas[x].filial.is_some() {
                continue;
            }
            order.push(x);
            stack.extend(tree.children(x));
        }
        // Reversed discovery order visits children before parents.
        for &x in order.iter().rev() {
            self.compute_filial(tree, x);
        }
    }

    fn ensure_parental(&mut self, tree: &Tree, node: NodeId) {
        let subroot = tree.subroot();
        let mut chain = Vec::new();
        let mut x = node;
        loop {
            if self.node_clas[x].parental.is_some() {
                break;
            }
            chain.push(x);
            if x == subroot {
                break;
            }
            x = tree.parent(x).expect("node below subroot has a parent");
        }
        for &x in chain.iter().rev() {
            if x == subroot {
                self.compute_parental_base(tree, x);
            } else {
                let w = tree.parent(x).expect("non-subroot node has a parent");
                let siblings: Vec<NodeId> = tree.children(w).filter(|&s| s != x).collect();
                for s in siblings {
                    self.ensure_filial(tree, s);
                }
                self.compute_parental(tree, x);
            }
        }
    }

    /// Rescale one CLA's partials toward [`UNDERFLOW_TARGET`] and fold the
    /// scaling into the per-pattern log corrections.
    fn apply_underflow_protection(partials: &mut [f64], uf: &mut [f64], nr: usize, ns: usize) {
        let np = uf.len();
        let stride = nr * ns;
        for p in 0..np {
            let span = &mut partials[p * stride..(p + 1) * stride];
            let max = span.iter().cloned().fold(0.0_f64, f64::max);
            if max <= 0.0 {
                continue;
            }
            let f = (UNDERFLOW_TARGET / max).ln().floor();
            if f != 0.0 {
                let scale = f.exp();
                for v in span.iter_mut() {
                    *v *= scale;
                }
                uf[p] += f;
            }
        }
    }

    fn compute_filial(&mut self, tree: &Tree, node: NodeId) {
        let np = self.data.n_patterns();
        let nr = self.rates.len();
        let ns = self.model.n_states();
        let mut partials = vec![1.0; np * nr * ns];
        let mut uf = vec![0.0; np];
        let mut nedges = 0usize;
        let mut pmat = vec![0.0; ns * ns];

        for child in tree.children(node) {
            nedges += 1;
            let t = tree.edge_len(child);
            let child_handle = if tree.is_tip(child) {
                None
            } else {
                Some(
                    self.node_clas[child]
                        .filial
                        .expect("child filial computed before parent"),
                )
            };
            if let Some(h) = child_handle {
                let child_cla = self.pool.get(h);
                for p in 0..np {
                    uf[p] += child_cla.uf[p];
                }
                nedges += child_cla.underflow_edges;
            }
            let tip_number = tree.number(child);
            for (r, &rate) in self.rates.iter().enumerate() {
                self.model.calc_p_matrix(t * rate, &mut pmat);
                for p in 0..np {
                    for i in 0..ns {
                        let mut sum = 0.0;
                        for j in 0..ns {
                            let cv = match child_handle {
                                Some(h) => self.pool.get(h).partials[(p * nr + r) * ns + j],
                                None => self.data.tip_value(tip_number, p, j),
                            };
                            sum += pmat[i * ns + j] * cv;
                        }
                        partials[(p * nr + r) * ns + i] *= sum;
                    }
                }
            }
        }

        if nedges >= self.underflow_trigger {
            Self::apply_underflow_protection(&mut partials, &mut uf, nr, ns);
            nedges = 0;
        }

        let handle = self.pool.check_out();
        let cla = self.pool.get_mut(handle);
        cla.partials.copy_from_slice(&partials);
        cla.uf.copy_from_slice(&uf);
        cla.underflow_edges = nedges;
        self.node_clas[node].filial = Some(handle);
    }

    /// Parental array for the subroot: just the root tip's partials, since
    /// the subroot's clade covers the whole tree below the root.
    fn compute_parental_base(&mut self, tree: &Tree, subroot: NodeId) {
        let np = self.data.n_patterns();
        let nr = self.rates.len();
        let ns = self.model.n_states();
        let root_number = tree.number(tree.root());
        let handle = self.pool.check_out();
        let cla = self.pool.get_mut(handle);
        for p in 0..np {
            for r in 0..nr {
                for j in 0..ns {
                    cla.partials[(p * nr + r) * ns + j] = self.data.tip_value(root_number, p, j);
                }
            }
        }
        cla.uf.fill(0.0);
        cla.underflow_edges = 0;
        self.node_clas[subroot].parental = Some(handle);
    }

    fn compute_parental(&mut self, tree: &Tree, node: NodeId) {
        let np = self.data.n_patterns();
        let nr = self.rates.len();
        let ns = self.model.n_states();
        let w = tree.parent(node).expect("non-subroot node has a parent");
        let w_handle = self.node_clas[w]
            .parental
            .expect("parent parental computed before child");

        let mut partials = vec![0.0; np * nr * ns];
        let mut uf = vec![0.0; np];
        let mut pmat = vec![0.0; ns * ns];

        // Bring the view at w's parent down across w's own edge. The matrix
        // is applied in the reversed direction (row = state at w); time
        // reversibility squares this with the frequency weights applied once
        // at the harvest node.
        let t_w = tree.edge_len(w);
        let mut nedges = 1usize;
        {
            let w_cla = self.pool.get(w_handle);
            nedges += w_cla.underflow_edges;
            for p in 0..np {
                uf[p] += w_cla.uf[p];
            }
        }
        for (r, &rate) in self.rates.iter().enumerate() {
            self.model.calc_p_matrix(t_w * rate, &mut pmat);
            for p in 0..np {
                for j in 0..ns {
                    let mut sum = 0.0;
                    for m in 0..ns {
                        sum += pmat[j * ns + m]
                            * self.pool.get(w_handle).partials[(p * nr + r) * ns + m];
                    }
                    partials[(p * nr + r) * ns + j] = sum;
                }
            }
        }

        // Fold in w's other subtrees.
        for sib in tree.children(w).filter(|&s| s != node).collect::<Vec<_>>() {
            nedges += 1;
            let t = tree.edge_len(sib);
            let sib_handle = if tree.is_tip(sib) {
                None
            } else {
                Some(
                    self.node_clas[sib]
                        .filial
                        .expect("sibling filial computed before parental"),
                )
            };
            if let Some(h) = sib_handle {
                let sib_cla = self.pool.get(h);
                for p in 0..np {
                    uf[p] += sib_cla.uf[p];
                }
                nedges += sib_cla.underflow_edges;
            }
            let tip_number = tree.number(sib);
            for (r, &rate) in self.rates.iter().enumerate() {
                self.model.calc_p_matrix(t * rate, &mut pmat);
                for p in 0..np {
                    for j in 0..ns {
                        let mut sum = 0.0;
                        for k in 0..ns {
                            let sv = match sib_handle {
                                Some(h) => self.pool.get(h).partials[(p * nr + r) * ns + k],
                                None => self.data.tip_value(tip_number, p, k),
                            };
                            sum += pmat[j * ns + k] * sv;
                        }
                        partials[(p * nr + r) * ns + j] *= sum;
                    }
                }
            }
        }

        if nedges >= self.underflow_trigger {
            Self::apply_underflow_protection(&mut partials, &mut uf, nr, ns);
            nedges = 0;
        }

        let handle = self.pool.check_out();
        let cla = self.pool.get_mut(handle);
        cla.partials.copy_from_slice(&partials);
        cla.uf.copy_from_slice(&uf);
        cla.underflow_edges = nedges;
        self.node_clas[node].parental = Some(handle);
    }

    fn harvest(&self, tree: &Tree, focal: NodeId) -> f64 {
        let np = self.data.n_patterns();
        let nr = self.rates.len();
        let ns = self.model.n_states();
        let fil = self.pool.get(self.node_clas[focal].filial.expect("focal filial"));
        let par = self.pool.get(self.node_clas[focal].parental.expect("focal parental"));
        let pi = self.model.frequencies();
        let t = tree.edge_len(focal);

        let pmats: Vec<Vec<f64>> = self
            .rates
            .iter()
            .map(|&rate| {
                let mut m = vec![0.0; ns * ns];
                self.model.calc_p_matrix(t * rate, &mut m);
                m
            })
            .collect();

        let mut lnl = 0.0;
        for p in 0..np {
            let mut site = 0.0;
            for r in 0..nr {
                let pmat = &pmats[r];
                let mut rate_sum = 0.0;
                for i in 0..ns {
                    let mut across = 0.0;
                    for j in 0..ns {
                        across += pmat[i * ns + j] * par.partials[(p * nr + r) * ns + j];
                    }
                    rate_sum += pi[i] * fil.partials[(p * nr + r) * ns + i] * across;
                }
                site += self.rate_probs[r] * rate_sum;
            }
            if site <= 0.0 {
                return LN_ZERO;
            }
            lnl += self.data.count(p) * (site.ln() - fil.uf[p] - par.uf[p]);
        }
        lnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::ExponentialDist;
    use crate::subst_model::Jc69;
    use crate::tree_manip::{random_tree, star_tree};
    use vireya_core::rng::Xorshift64;

    /// Brute-force likelihood for a star tree (root tip 0, hub, tips
    /// 1..ntips): enumerate the hub state directly.
    fn star_ln_l_reference(tree: &Tree, data: &PatternData) -> f64 {
        let model = Jc69::new();
        let hub = tree.subroot();
        let mut p_hub = [0.0; 16];
        model.calc_p_matrix(tree.edge_len(hub), &mut p_hub);
        let root_number = tree.number(tree.root());
        let tips: Vec<(usize, [f64; 16])> = tree
            .children(hub)
            .map(|c| {
                let mut p = [0.0; 16];
                model.calc_p_matrix(tree.edge_len(c), &mut p);
                (tree.number(c), p)
            })
            .collect();
        let mut lnl = 0.0;
        for pat in 0..data.n_patterns() {
            let mut site = 0.0;
            for s_root in 0..4 {
                let root_v = data.tip_value(root_number, pat, s_root);
                if root_v == 0.0 {
                    continue;
                }
                for h in 0..4 {
                    let mut term = 0.25 * root_v * p_hub[s_root * 4 + h];
                    for (num, p) in &tips {
                        let mut sum = 0.0;
                        for s in 0..4 {
                            sum += p[h * 4 + s] * data.tip_value(*num, pat, s);
                        }
                        term *= sum;
                    }
                    site += term;
                }
            }
            lnl += data.count(pat) * site.ln();
        }
        lnl
    }

    fn small_data() -> PatternData {
        // Four tips, five patterns, one with missing data.
        let tip_states = vec![
            vec![Some(0), Some(1), Some(2), Some(3), Some(0)],
            vec![Some(0), Some(1), Some(3), Some(3), Some(1)],
            vec![Some(0), Some(2), Some(2), Some(3), None],
            vec![Some(0), Some(1), Some(2), Some(0), Some(2)],
        ];
        PatternData::new(tip_states, vec![3.0, 1.0, 1.0, 2.0, 1.0], 4).unwrap()
    }

    fn jc_likelihood(data: PatternData) -> TreeLikelihood {
        TreeLikelihood::new(Box::new(Jc69::new()), data, vec![1.0], vec![1.0]).unwrap()
    }

    fn random_data(n_tips: usize, n_patterns: usize, rng: &mut Xorshift64) -> PatternData {
        let tip_states = (0..n_tips)
            .map(|_| {
                (0..n_patterns)
                    .map(|_| Some(rng.sample_uint(4) as u8))
                    .collect()
            })
            .collect();
        PatternData::new(tip_states, vec![1.0; n_patterns], 4).unwrap()
    }

    #[test]
    fn pattern_compression_merges_identical_columns() {
        let sequences = vec![
            vec![Some(0), Some(1), Some(0), Some(1)],
            vec![Some(2), Some(3), Some(2), Some(3)],
        ];
        let data = PatternData::from_sequences(&sequences, 4).unwrap();
        assert_eq!(data.n_patterns(), 2);
        assert_eq!(data.count(0), 2.0);
        assert_eq!(data.count(1), 2.0);
    }

    #[test]
    fn pattern_data_validates_shape() {
        assert!(PatternData::new(vec![vec![Some(0)], vec![]], vec![1.0], 4).is_err());
        assert!(PatternData::new(vec![vec![Some(4)]], vec![1.0], 4).is_err());
        assert!(PatternData::new(vec![vec![Some(0)]], vec![0.0], 4).is_err());
    }

    #[test]
    fn star_tree_matches_brute_force() {
        let mut rng = Xorshift64::new(5);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = star_tree(4, &edges, &mut rng).unwrap();
        let data = small_data();
        let reference = star_ln_l_reference(&tree, &data);
        let mut like = jc_likelihood(data);
        let lnl = like.calc_ln_l(&tree);
        assert!(
            (lnl - reference).abs() < 1e-10,
            "engine {lnl} vs brute force {reference}"
        );
    }

    #[test]
    fn four_taxon_jc_reference_value() {
        // Fixed seed, star topology, all edges 0.1: the result is pinned to
        // an independently computed reference value.
        let mut rng = Xorshift64::new(13579);
        let edges = ExponentialDist::new(10.0).unwrap();
        let mut tree = star_tree(4, &edges, &mut rng).unwrap();
        for n in tree.preorder().collect::<Vec<_>>() {
            if !tree.is_root(n) {
                tree.set_edge_len(n, 0.1);
            }
        }
        let data = random_data(4, 20, &mut rng);
        let mut like = jc_likelihood(data);
        let lnl = like.calc_ln_l(&tree);
        let expected = -157.99967452018402;
        assert!(
            (lnl - expected).abs() < 1e-10,
            "got {lnl}, expected {expected}"
        );
    }

    #[test]
    fn likelihood_is_invariant_to_harvest_node() {
        let mut rng = Xorshift64::new(31);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = random_tree(8, &edges, &mut rng).unwrap();
        let data = random_data(8, 12, &mut rng);
        let mut like = jc_likelihood(data);
        let baseline = like.calc_ln_l(&tree);
        for node in tree.preorder().collect::<Vec<_>>() {
            like.use_as_likelihood_root(node);
            let lnl = like.calc_ln_l(&tree);
            assert!(
                (lnl - baseline).abs() < 1e-8,
                "harvest at node {node} gave {lnl}, expected {baseline}"
            );
        }
    }

    #[test]
    fn repeated_evaluation_reuses_arrays() {
        let mut rng = Xorshift64::new(77);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = random_tree(6, &edges, &mut rng).unwrap();
        let data = random_data(6, 5, &mut rng);
        let mut like = jc_likelihood(data);
        let first = like.calc_ln_l(&tree);
        let allocated = like.pool().capacity();
        for _ in 0..10 {
            let again = like.calc_ln_l(&tree);
            assert_eq!(again, first, "no state changed between evaluations");
        }
        assert_eq!(
            like.pool().capacity(),
            allocated,
            "steady-state evaluation must not allocate new arrays"
        );
        assert!(like.pool().is_conserved());
    }

    #[test]
    fn edge_change_at_focal_node_needs_no_invalidation() {
        let mut rng = Xorshift64::new(19);
        let edges = ExponentialDist::new(10.0).unwrap();
        let mut tree = random_tree(5, &edges, &mut rng).unwrap();
        let data = random_data(5, 6, &mut rng);
        let focal = tree.subroot();
        let mut like = jc_likelihood(data.clone());
        like.use_as_likelihood_root(focal);
        let before = like.calc_ln_l(&tree);

        tree.set_edge_len(focal, tree.edge_len(focal) * 2.0);
        let after = like.calc_ln_l(&tree);
        assert_ne!(before, after, "focal edge length must affect the result");

        // A fresh engine agrees, so the incremental path saw the new length.
        let mut fresh = jc_likelihood(data);
        fresh.use_as_likelihood_root(focal);
        let expected = fresh.calc_ln_l(&tree);
        assert!((after - expected).abs() < 1e-12);
    }

    #[test]
    fn restore_caches_is_bit_exact() {
        let mut rng = Xorshift64::new(23);
        let edges = ExponentialDist::new(10.0).unwrap();
        let mut tree = random_tree(7, &edges, &mut rng).unwrap();
        let data = random_data(7, 9, &mut rng);
        let mut like = jc_likelihood(data);
        let before = like.calc_ln_l(&tree);

        // Propose: change an edge with caching invalidation, evaluate.
        let victim = tree.subroot();
        let old_len = tree.edge_len(victim);
        like.invalidate_away_from_node_caching(&tree, victim);
        like.invalidate_both_ends_caching(&tree, victim);
        tree.set_edge_len(victim, old_len * 3.0);
        let proposed = like.calc_ln_l(&tree);
        assert_ne!(proposed, before);

        // Reject: revert the edge and restore the cached arrays.
        tree.set_edge_len(victim, old_len);
        like.restore_caches();
        assert!(!like.has_pending_cache());
        let restored = like.calc_ln_l(&tree);
        assert_eq!(
            restored.to_bits(),
            before.to_bits(),
            "rejected proposal must leave the likelihood bit-identical"
        );
        assert!(like.pool().is_conserved());
    }

    #[test]
    fn discard_caches_returns_arrays_to_pool() {
        let mut rng = Xorshift64::new(29);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = random_tree(6, &edges, &mut rng).unwrap();
        let data = random_data(6, 4, &mut rng);
        let mut like = jc_likelihood(data);
        let _ = like.calc_ln_l(&tree);

        let victim = tree.subroot();
        like.invalidate_away_from_node_caching(&tree, victim);
        assert!(like.has_pending_cache());
        let accepted = like.calc_ln_l(&tree);
        like.discard_caches();
        assert!(!like.has_pending_cache());
        assert!(like.pool().is_conserved());
        let again = like.calc_ln_l(&tree);
        assert_eq!(again, accepted);
    }

    #[test]
    fn underflow_protection_preserves_the_likelihood() {
        let mut rng = Xorshift64::new(41);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = random_tree(40, &edges, &mut rng).unwrap();
        let data = random_data(40, 6, &mut rng);

        let mut protected = jc_likelihood(data.clone());
        protected.set_underflow_trigger(5);
        let with_scaling = protected.calc_ln_l(&tree);

        let mut unprotected = jc_likelihood(data);
        unprotected.set_underflow_trigger(usize::MAX);
        let without_scaling = unprotected.calc_ln_l(&tree);

        assert!(with_scaling.is_finite());
        assert!(
            (with_scaling - without_scaling).abs() < 1e-6,
            "scaled {with_scaling} vs unscaled {without_scaling}"
        );
    }

    #[test]
    fn missing_data_marginalizes_over_states() {
        let mut rng = Xorshift64::new(53);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = star_tree(3, &edges, &mut rng).unwrap();

        // One pattern with tip 2 missing.
        let missing = PatternData::new(
            vec![vec![Some(0)], vec![Some(1)], vec![None]],
            vec![1.0],
            4,
        )
        .unwrap();
        let mut like = jc_likelihood(missing);
        let lnl_missing = like.calc_ln_l(&tree);

        // Sum of the four resolved likelihoods.
        let mut total = 0.0;
        for s in 0..4u8 {
            let resolved = PatternData::new(
                vec![vec![Some(0)], vec![Some(1)], vec![Some(s)]],
                vec![1.0],
                4,
            )
            .unwrap();
            let mut l = jc_likelihood(resolved);
            total += l.calc_ln_l(&tree).exp();
        }
        assert!(
            (lnl_missing.exp() - total).abs() < 1e-12,
            "missing data must marginalize the tip state"
        );
    }

    #[test]
    fn rate_mixture_averages_single_rate_likelihoods() {
        let mut rng = Xorshift64::new(67);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = star_tree(3, &edges, &mut rng).unwrap();
        let data = || {
            PatternData::new(
                vec![vec![Some(0)], vec![Some(1)], vec![Some(2)]],
                vec![1.0],
                4,
            )
            .unwrap()
        };
        let (rates, probs) = (vec![0.5, 1.5], vec![0.4, 0.6]);
        let mut mixed =
            TreeLikelihood::new(Box::new(Jc69::new()), data(), rates.clone(), probs.clone())
                .unwrap();
        let lnl_mixed = mixed.calc_ln_l(&tree);

        // With one pattern, the mixture likelihood is the probability-weighted
        // average of per-rate likelihoods on rate-scaled trees.
        let mut expected = 0.0;
        for (&r, &p) in rates.iter().zip(probs.iter()) {
            let mut scaled = tree.clone();
            for n in tree.preorder().collect::<Vec<_>>() {
                if !tree.is_root(n) {
                    scaled.set_edge_len(n, tree.edge_len(n) * r);
                }
            }
            let mut single = jc_likelihood(data());
            expected += p * single.calc_ln_l(&scaled).exp();
        }
        assert!(
            (lnl_mixed.exp() - expected).abs() < 1e-13,
            "mixture {} vs weighted average {expected}",
            lnl_mixed.exp()
        );
    }

    #[test]
    fn invariable_sites_category_uses_identity_transitions() {
        // A zero-rate category contributes only when all tips share a state.
        let mut rng = Xorshift64::new(71);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = star_tree(3, &edges, &mut rng).unwrap();
        let constant = PatternData::new(
            vec![vec![Some(2)], vec![Some(2)], vec![Some(2)]],
            vec![1.0],
            4,
        )
        .unwrap();
        let variable = PatternData::new(
            vec![vec![Some(0)], vec![Some(1)], vec![Some(2)]],
            vec![1.0],
            4,
        )
        .unwrap();
        let pinv = 0.3;
        let engine = |d: PatternData| {
            TreeLikelihood::new(
                Box::new(Jc69::new()),
                d,
                vec![0.0, 1.0],
                vec![pinv, 1.0 - pinv],
            )
            .unwrap()
        };
        let lnl_const = engine(constant.clone()).calc_ln_l(&tree);
        let lnl_var = engine(variable.clone()).calc_ln_l(&tree);
        // Variable pattern: invariable category contributes zero.
        let mut plain_var = jc_likelihood(variable);
        let base_var = plain_var.calc_ln_l(&tree);
        assert!((lnl_var - ((1.0 - pinv).ln() + base_var)).abs() < 1e-12);
        // Constant pattern: invariable category contributes pinv * freq.
        let mut plain_const = jc_likelihood(constant);
        let base_const = plain_const.calc_ln_l(&tree);
        let expected = pinv * 0.25 + (1.0 - pinv) * base_const.exp();
        assert!((lnl_const.exp() - expected).abs() < 1e-13);
    }

    #[test]
    fn pattern_counts_weight_the_log_likelihood() {
        let mut rng = Xorshift64::new(61);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = star_tree(3, &edges, &mut rng).unwrap();
        let single = PatternData::new(
            vec![vec![Some(0)], vec![Some(1)], vec![Some(2)]],
            vec![1.0],
            4,
        )
        .unwrap();
        let doubled = PatternData::new(
            vec![vec![Some(0)], vec![Some(1)], vec![Some(2)]],
            vec![2.0],
            4,
        )
        .unwrap();
        let mut a = jc_likelihood(single);
        let mut b = jc_likelihood(doubled);
        let la = a.calc_ln_l(&tree);
        let lb = b.calc_ln_l(&tree);
        assert!((lb - 2.0 * la).abs() < 1e-12);
    }
}
