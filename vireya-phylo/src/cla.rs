//! Conditional likelihood array (CLA) storage.
//!
//! Partial likelihoods are expensive to allocate, so a [`ClaPool`] owns every
//! array and hands out [`ClaHandle`]s. Invalidating a node returns its handle
//! to the pool; the next node that needs workspace checks one out again. The
//! pool tracks checkouts and returns so conservation (`in_use + free ==
//! capacity`) can be asserted at any point.

/// One conditional likelihood array: per-pattern, per-rate, per-state partial
/// likelihoods plus the underflow-correction bookkeeping that rides with them.
#[derive(Debug, Clone)]
pub struct CondLikelihood {
    /// Layout: `partials[(pattern * n_rates + rate) * n_states + state]`.
    pub(crate) partials: Vec<f64>,
    /// Per-pattern accumulated log scaling factor applied to the partials.
    pub(crate) uf: Vec<f64>,
    /// Edges accumulated since scaling was last applied.
    pub(crate) underflow_edges: usize,
}

impl CondLikelihood {
    fn new(n_patterns: usize, n_rates: usize, n_states: usize) -> Self {
        Self {
            partials: vec![0.0; n_patterns * n_rates * n_states],
            uf: vec![0.0; n_patterns],
            underflow_edges: 0,
        }
    }

    fn reset(&mut self) {
        self.partials.fill(0.0);
        self.uf.fill(0.0);
        self.underflow_edges = 0;
    }
}

/// Opaque ticket for a checked-out [`CondLikelihood`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaHandle(usize);

/// Fixed-shape pool of conditional likelihood arrays.
#[derive(Debug)]
pub struct ClaPool {
    storage: Vec<CondLikelihood>,
    free: Vec<ClaHandle>,
    n_patterns: usize,
    n_rates: usize,
    n_states: usize,
    n_checkouts: usize,
    n_returns: usize,
}

impl ClaPool {
    /// Create an empty pool whose arrays will have the given shape.
    pub fn new(n_patterns: usize, n_rates: usize, n_states: usize) -> Self {
        Self {
            storage: Vec::new(),
            free: Vec::new(),
            n_patterns,
            n_rates,
            n_states,
            n_checkouts: 0,
            n_returns: 0,
        }
    }

    /// Check out an array, reusing a returned one when possible. Reused
    /// arrays come back zeroed.
    pub fn check_out(&mut self) -> ClaHandle {
        self.n_checkouts += 1;
        if let Some(handle) = self.free.pop() {
            self.storage[handle.0].reset();
            handle
        } else {
            let handle = ClaHandle(self.storage.len());
            self.storage
                .push(CondLikelihood::new(self.n_patterns, self.n_rates, self.n_states));
            handle
        }
    }

    /// Return an array to the pool.
    pub fn check_in(&mut self, handle: ClaHandle) {
        debug_assert!(
            !self.free.contains(&handle),
            "double check-in of CLA handle"
        );
        self.n_returns += 1;
        self.free.push(handle);
    }

    pub fn get(&self, handle: ClaHandle) -> &CondLikelihood {
        &self.storage[handle.0]
    }

    pub fn get_mut(&mut self, handle: ClaHandle) -> &mut CondLikelihood {
        &mut self.storage[handle.0]
    }

    /// Total arrays ever allocated.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Arrays currently sitting in the free list.
    pub fn n_free(&self) -> usize {
        self.free.len()
    }

    /// Arrays currently checked out.
    pub fn n_in_use(&self) -> usize {
        self.n_checkouts - self.n_returns
    }

    pub fn n_checkouts(&self) -> usize {
        self.n_checkouts
    }

    pub fn n_returns(&self) -> usize {
        self.n_returns
    }

    pub fn n_patterns(&self) -> usize {
        self.n_patterns
    }

    pub fn n_rates(&self) -> usize {
        self.n_rates
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    /// Conservation check: every array is either checked out or free.
    pub fn is_conserved(&self) -> bool {
        self.n_in_use() + self.n_free() == self.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_out_allocates_then_reuses() {
        let mut pool = ClaPool::new(3, 2, 4);
        let a = pool.check_out();
        let b = pool.check_out();
        assert_eq!(pool.capacity(), 2);
        assert_ne!(a, b);

        pool.check_in(a);
        let c = pool.check_out();
        assert_eq!(c, a, "free list should be reused before allocating");
        assert_eq!(pool.capacity(), 2);
        pool.check_in(b);
        pool.check_in(c);
    }

    #[test]
    fn reused_arrays_come_back_zeroed() {
        let mut pool = ClaPool::new(2, 1, 4);
        let a = pool.check_out();
        pool.get_mut(a).partials[3] = 0.5;
        pool.get_mut(a).uf[1] = 2.0;
        pool.get_mut(a).underflow_edges = 7;
        pool.check_in(a);

        let b = pool.check_out();
        assert_eq!(b, a);
        let cla = pool.get(b);
        assert!(cla.partials.iter().all(|&x| x == 0.0));
        assert!(cla.uf.iter().all(|&x| x == 0.0));
        assert_eq!(cla.underflow_edges, 0);
    }

    #[test]
    fn conservation_holds_through_churn() {
        let mut pool = ClaPool::new(5, 4, 4);
        let mut held = Vec::new();
        for round in 0..10 {
            for _ in 0..(round % 4) + 1 {
                held.push(pool.check_out());
                assert!(pool.is_conserved());
            }
            while held.len() > round % 3 {
                pool.check_in(held.pop().unwrap());
                assert!(pool.is_conserved());
            }
        }
        assert_eq!(pool.n_in_use(), pool.n_checkouts() - pool.n_returns());
    }

    #[test]
    fn array_shape_matches_pool() {
        let mut pool = ClaPool::new(7, 3, 4);
        let h = pool.check_out();
        assert_eq!(pool.get(h).partials.len(), 7 * 3 * 4);
        assert_eq!(pool.get(h).uf.len(), 7);
    }
}
