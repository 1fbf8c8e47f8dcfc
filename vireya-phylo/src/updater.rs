//! MCMC updaters: the common trait, the shared chain state they act on, and
//! the edge-length parameter updater.
//!
//! An updater owns its tuning state (a slice sampler, a proposal scale) and
//! mutates the shared [`ChainState`] when invoked. Moves propose and then
//! accept or reject; parameters slice-sample directly from the heated
//! posterior and never reject.

use vireya_core::rng::Xorshift64;
use vireya_core::Result;

use crate::dist::Distribution;
use crate::likelihood::TreeLikelihood;
use crate::slice_sampler::SliceSampler;
use crate::tree::{NodeId, Tree};
use crate::LN_ZERO;

/// How the chain heats the posterior for Metropolis coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatingMode {
    /// Raise the whole posterior to the heating power.
    Standard,
    /// Raise only the likelihood; the prior stays cold.
    LikelihoodOnly,
}

/// Categories used to order updaters when a chain is finalized: topology
/// moves first, then edge-length parameters, hyperparameters, and finally
/// other model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdaterKind {
    Move,
    EdgeLenParam,
    HyperParam,
    ModelParam,
}

/// Everything an updater may touch: the tree, the likelihood machinery, the
/// generator, the running log posterior, and the prior/heating configuration.
pub struct ChainState {
    pub tree: Tree,
    pub likelihood: TreeLikelihood,
    pub rng: Xorshift64,
    pub last_ln_like: f64,
    pub last_ln_prior: f64,
    pub heating_power: f64,
    pub heating_mode: HeatingMode,
    /// Prior on external (tip) edge lengths.
    pub edge_len_prior: Box<dyn Distribution>,
    /// Prior on internal edge lengths; external prior applies when absent.
    pub internal_edge_len_prior: Option<Box<dyn Distribution>>,
}

impl ChainState {
    pub fn new(
        tree: Tree,
        likelihood: TreeLikelihood,
        rng: Xorshift64,
        edge_len_prior: Box<dyn Distribution>,
    ) -> Self {
        Self {
            tree,
            likelihood,
            rng,
            last_ln_like: LN_ZERO,
            last_ln_prior: LN_ZERO,
            heating_power: 1.0,
            heating_mode: HeatingMode::Standard,
            edge_len_prior,
            internal_edge_len_prior: None,
        }
    }

    /// Prior applying to the edge above `node`.
    pub fn edge_prior_for(&self, node: NodeId) -> &dyn Distribution {
        if self.tree.is_tip(node) {
            self.edge_len_prior.as_ref()
        } else {
            self.internal_edge_len_prior
                .as_deref()
                .unwrap_or(self.edge_len_prior.as_ref())
        }
    }

    /// Log prior over all edge lengths in the current tree.
    pub fn ln_edge_prior(&self) -> f64 {
        let root = self.tree.root();
        self.tree
            .preorder()
            .filter(|&n| n != root)
            .map(|n| self.edge_prior_for(n).ln_pdf(self.tree.edge_len(n)))
            .sum()
    }

    /// Combine log likelihood and log prior under the heating scheme.
    pub fn heated(&self, ln_like: f64, ln_prior: f64) -> f64 {
        match self.heating_mode {
            HeatingMode::Standard => self.heating_power * (ln_like + ln_prior),
            HeatingMode::LikelihoodOnly => self.heating_power * ln_like + ln_prior,
        }
    }

    pub fn refresh_last_ln_like(&mut self) {
        self.last_ln_like = self.likelihood.calc_ln_l(&self.tree);
    }

    pub fn refresh_last_ln_prior(&mut self) {
        self.last_ln_prior = self.ln_edge_prior();
    }
}

/// One MCMC updater: a Metropolis-Hastings move or a slice-sampled
/// parameter.
pub trait Updater {
    fn name(&self) -> &str;

    /// Times per cycle this updater runs.
    fn weight(&self) -> u32;

    fn kind(&self) -> UpdaterKind;

    fn is_move(&self) -> bool {
        self.kind() == UpdaterKind::Move
    }

    fn is_fixed(&self) -> bool;

    fn set_fixed(&mut self, fixed: bool);

    /// Perform one update. Returns whether the chain state changed (moves
    /// report acceptance; parameters report whether they ran).
    fn update(&mut self, state: &mut ChainState) -> Result<bool>;
}

/// Slice-sampled updater for the length of one edge.
///
/// The harvest is anchored at the edge's node (or its parent, for a tip)
/// before sampling, so each slice evaluation only recomputes that node's
/// filial array; the rest of the tree's arrays are invalidated once, up
/// front.
pub struct EdgeLenParam {
    name: String,
    node: NodeId,
    sampler: SliceSampler,
    weight: u32,
    fixed: bool,
}

impl EdgeLenParam {
    pub fn new(node: NodeId, starting_len: f64) -> Self {
        Self {
            name: format!("edge_len_{node}"),
            node,
            sampler: SliceSampler::new(starting_len, 0.1),
            weight: 1,
            fixed: false,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    pub fn sampler(&self) -> &SliceSampler {
        &self.sampler
    }

    /// Retune the slice width from accumulated diagnostics.
    pub fn adapt(&mut self, multiplier: f64) {
        self.sampler.adapt_simple(multiplier);
        self.sampler.reset_diagnostics();
    }
}

impl Updater for EdgeLenParam {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn kind(&self) -> UpdaterKind {
        UpdaterKind::EdgeLenParam
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
        let node = self.node;
        let anchor = if state.tree.is_tip(node) {
            state.tree.parent(node).expect("edge node has a parent")
        } else {
            node
        };
        state.likelihood.use_as_likelihood_root(anchor);
        // One invalidation covers the whole sweep: every slice evaluation
        // only changes the focal node's own edge, which the harvest reads
        // fresh each time.
        state.likelihood.invalidate_away_from_node(&state.tree, node);
        self.sampler.set_x0(state.tree.edge_len(node));

        let heating_power = state.heating_power;
        let heating_mode = state.heating_mode;
        let ChainState {
            tree,
            likelihood,
            rng,
            edge_len_prior,
            internal_edge_len_prior,
            ..
        } = state;
        let prior: &dyn Distribution = if tree.is_tip(node) {
            edge_len_prior.as_ref()
        } else {
            internal_edge_len_prior
                .as_deref()
                .unwrap_or(edge_len_prior.as_ref())
        };

        let target = |len: f64| -> f64 {
            if len <= 0.0 {
                return LN_ZERO;
            }
            tree.set_edge_len(node, len);
            let ln_like = likelihood.calc_ln_l(tree);
            let ln_prior = prior.ln_pdf(len);
            match heating_mode {
                HeatingMode::Standard => heating_power * (ln_like + ln_prior),
                HeatingMode::LikelihoodOnly => heating_power * ln_like + ln_prior,
            }
        };
        let new_len = self.sampler.sample(target, rng);

        state.tree.set_edge_len(node, new_len);
        state.refresh_last_ln_like();
        state.refresh_last_ln_prior();
        Ok(true)
    }
}
