//! The MCMC chain manager: owns the shared state and a finalized roster of
//! updaters, and runs them in weighted cycles.

use vireya_core::{Result, Summarizable, VireyaError};

use crate::updater::{ChainState, Updater};

/// Runs a set of updaters against one [`ChainState`].
///
/// Updaters are registered in any order; [`finalize`](ChainManager::finalize)
/// sorts them into the canonical order (moves, then edge-length parameters,
/// then hyperparameters, then model parameters) and initializes the cached
/// log posterior.
pub struct ChainManager {
    updaters: Vec<Box<dyn Updater>>,
    state: ChainState,
    finalized: bool,
    cycles_run: usize,
}

impl ChainManager {
    pub fn new(state: ChainState) -> Self {
        Self {
            updaters: Vec::new(),
            state,
            finalized: false,
            cycles_run: 0,
        }
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ChainState {
        &mut self.state
    }

    pub fn add_updater(&mut self, updater: Box<dyn Updater>) {
        self.updaters.push(updater);
        self.finalized = false;
    }

    pub fn updater_names(&self) -> Vec<&str> {
        self.updaters.iter().map(|u| u.name()).collect()
    }

    pub fn n_updaters(&self) -> usize {
        self.updaters.len()
    }

    pub fn cycles_run(&self) -> usize {
        self.cycles_run
    }

    /// Sort the updaters into canonical order and refresh the cached log
    /// likelihood and log prior. Must be called before running cycles.
    pub fn finalize(&mut self) -> Result<()> {
        if self.updaters.is_empty() {
            return Err(VireyaError::InvalidInput(
                "ChainManager: no updaters registered".into(),
            ));
        }
        self.updaters.sort_by_key(|u| u.kind());
        self.state.refresh_last_ln_like();
        self.state.refresh_last_ln_prior();
        self.finalized = true;
        Ok(())
    }

    /// One full cycle: every updater runs `weight()` times, in order.
    pub fn run_cycle(&mut self) -> Result<()> {
        if !self.finalized {
            return Err(VireyaError::InvalidInput(
                "ChainManager: finalize() before running cycles".into(),
            ));
        }
        for i in 0..self.updaters.len() {
            for _ in 0..self.updaters[i].weight() {
                self.updaters[i].update(&mut self.state)?;
            }
        }
        self.cycles_run += 1;
        Ok(())
    }

    pub fn run(&mut self, n_cycles: usize) -> Result<()> {
        for _ in 0..n_cycles {
            self.run_cycle()?;
        }
        Ok(())
    }
}

impl Summarizable for ChainManager {
    fn summary(&self) -> String {
        format!(
            "chain: {} updaters, {} cycles, ln L = {:.4}, ln prior = {:.4}",
            self.updaters.len(),
            self.cycles_run,
            self.state.last_ln_like,
            self.state.last_ln_prior
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::ExponentialDist;
    use crate::larget_simon::LargetSimonMove;
    use crate::likelihood::{PatternData, TreeLikelihood};
    use crate::subst_model::Jc69;
    use crate::tree::NodeId;
    use crate::tree_manip::random_tree;
    use crate::updater::EdgeLenParam;
    use vireya_core::rng::Xorshift64;

    fn build_state(n_tips: usize, seed: u64) -> ChainState {
        let mut rng = Xorshift64::new(seed);
        let edges = ExponentialDist::new(10.0).unwrap();
        let tree = random_tree(n_tips, &edges, &mut rng).unwrap();
        let tip_states = (0..n_tips)
            .map(|_| (0..10).map(|_| Some(rng.sample_uint(4) as u8)).collect())
            .collect();
        let data = PatternData::new(tip_states, vec![1.0; 10], 4).unwrap();
        let likelihood =
            TreeLikelihood::new(Box::new(Jc69::new()), data, vec![1.0], vec![1.0]).unwrap();
        ChainState::new(
            tree,
            likelihood,
            rng,
            Box::new(ExponentialDist::new(2.0).unwrap()),
        )
    }

    fn build_manager(n_tips: usize, seed: u64) -> ChainManager {
        let state = build_state(n_tips, seed);
        let edge_nodes: Vec<NodeId> = state
            .tree
            .preorder()
            .filter(|&n| !state.tree.is_root(n))
            .collect();
        let mut manager = ChainManager::new(state);
        for n in edge_nodes {
            let len = manager.state().tree.edge_len(n);
            manager.add_updater(Box::new(EdgeLenParam::new(n, len)));
        }
        manager.add_updater(Box::new(LargetSimonMove::new(0.5).with_weight(3)));
        manager
    }

    #[test]
    fn finalize_orders_moves_before_parameters() {
        let mut manager = build_manager(5, 101);
        manager.finalize().unwrap();
        let names = manager.updater_names();
        assert_eq!(
            names[0], "larget_simon_local",
            "moves run before edge-length parameters"
        );
        assert!(names[1].starts_with("edge_len_"));
    }

    #[test]
    fn finalize_requires_updaters_and_initializes_posterior() {
        let state = build_state(4, 103);
        let mut empty = ChainManager::new(state);
        assert!(empty.finalize().is_err());

        let mut manager = build_manager(4, 103);
        manager.finalize().unwrap();
        assert!(manager.state().last_ln_like.is_finite());
        assert!(manager.state().last_ln_prior.is_finite());
        assert!(manager.summary().contains("updaters"));
    }

    #[test]
    fn cycles_require_finalization() {
        let mut manager = build_manager(4, 105);
        assert!(manager.run_cycle().is_err());
        manager.finalize().unwrap();
        assert!(manager.run_cycle().is_ok());
        assert_eq!(manager.cycles_run(), 1);
    }

    #[test]
    fn long_run_conserves_arrays_and_tracks_the_posterior() {
        let mut manager = build_manager(6, 107);
        manager.finalize().unwrap();
        for _ in 0..25 {
            manager.run_cycle().unwrap();
            let state = manager.state_mut();
            assert!(state.tree.check_preorder_consistency());
            assert!(state.likelihood.pool().is_conserved());
            assert!(!state.likelihood.has_pending_cache());
            let fresh = state.likelihood.calc_ln_l(&state.tree);
            assert!(
                (state.last_ln_like - fresh).abs() < 1e-8,
                "cached log likelihood drifted from a fresh evaluation"
            );
            let fresh_prior = state.ln_edge_prior();
            assert!((state.last_ln_prior - fresh_prior).abs() < 1e-10);
        }
        assert_eq!(manager.cycles_run(), 25);
    }

    #[test]
    fn topology_eventually_changes_under_the_local_move() {
        let mut manager = build_manager(6, 109);
        manager.finalize().unwrap();
        let numbering = |manager: &ChainManager| -> Vec<usize> {
            manager
                .state()
                .tree
                .preorder()
                .map(|n| manager.state().tree.number(n))
                .collect()
        };
        let before = numbering(&manager);
        let mut changed = false;
        for _ in 0..50 {
            manager.run_cycle().unwrap();
            if numbering(&manager) != before {
                changed = true;
            }
        }
        // 150 LOCAL proposals on a 6-tip tree essentially always accept at
        // least one topology change.
        assert!(changed, "expected at least one accepted NNI");
    }
}
