//! Bayesian phylogenetic MCMC for the Vireya ecosystem.
//!
//! `vireya-phylo` provides the sampling engine that sits on top of
//! [`vireya_core`]'s primitives:
//!
//! - **Tree data structures** — [`tree`]: arena-based rooted trees with a
//!   cached preorder traversal
//! - **Rearrangement** — [`tree_manip`]: subtree pruning/grafting primitives
//!   and exactly-invertible NNI swaps
//! - **Likelihood** — [`likelihood`]: directional conditional likelihood
//!   arrays with pooled storage, cache-based revert, and underflow protection
//! - **Models** — [`subst_model`]: JC69 and HKY85 transition probabilities
//! - **Sampling** — [`slice_sampler`]: univariate slice sampling with
//!   adaptation; [`larget_simon`]: the LOCAL topology move
//! - **Chain plumbing** — [`updater`] and [`chain`]: weighted update cycles
//!   over a shared chain state

pub mod chain;
pub mod cla;
pub mod dist;
pub mod larget_simon;
pub mod likelihood;
pub mod slice_sampler;
pub mod subst_model;
pub mod tree;
pub mod tree_manip;
pub mod updater;

/// Log-space stand-in for a zero likelihood or density.
pub const LN_ZERO: f64 = -f64::MAX;

pub use chain::ChainManager;
pub use larget_simon::LargetSimonMove;
pub use likelihood::{PatternData, TreeLikelihood};
pub use slice_sampler::SliceSampler;
pub use tree::{Node, NodeId, Tree};
pub use updater::{ChainState, EdgeLenParam, HeatingMode, Updater, UpdaterKind};
