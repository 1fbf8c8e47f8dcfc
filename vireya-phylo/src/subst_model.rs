//! Nucleotide substitution models.
//!
//! A model supplies equilibrium state frequencies and fills a transition
//! probability matrix for a given edge length (expected substitutions per
//! site). State order is A, C, G, T; transitions are A↔G and C↔T.

use vireya_core::{Result, VireyaError};

/// Number of nucleotide states.
pub const N_STATES: usize = 4;

/// A time-reversible nucleotide substitution model.
pub trait SubstitutionModel {
    /// Number of character states.
    fn n_states(&self) -> usize {
        N_STATES
    }

    /// Model name for reports.
    fn name(&self) -> &'static str;

    /// Equilibrium state frequencies, summing to one.
    fn frequencies(&self) -> &[f64];

    /// Fill `p` (row-major `n_states × n_states`, row = ancestral state) with
    /// transition probabilities for an edge of length `t`.
    fn calc_p_matrix(&self, t: f64, p: &mut [f64]);
}

/// Jukes-Cantor (1969) model: equal frequencies, one exchangeability.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Jc69 {
    freqs: [f64; N_STATES],
}

impl Jc69 {
    pub fn new() -> Self {
        Self {
            freqs: [0.25; N_STATES],
        }
    }
}

impl Default for Jc69 {
    fn default() -> Self {
        Self::new()
    }
}

impl SubstitutionModel for Jc69 {
    fn name(&self) -> &'static str {
        "JC69"
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn calc_p_matrix(&self, t: f64, p: &mut [f64]) {
        debug_assert_eq!(p.len(), N_STATES * N_STATES);
        let e = (-4.0 * t / 3.0).exp();
        let same = 0.25 + 0.75 * e;
        let diff = 0.25 - 0.25 * e;
        for i in 0..N_STATES {
            for j in 0..N_STATES {
                p[i * N_STATES + j] = if i == j { same } else { diff };
            }
        }
    }
}

/// Hasegawa-Kishino-Yano (1985) model: arbitrary frequencies plus a
/// transition/transversion rate ratio κ.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Hky85 {
    freqs: [f64; N_STATES],
    kappa: f64,
    /// Rate normalization so edge lengths are expected substitutions per site.
    beta: f64,
}

impl Hky85 {
    /// Create an HKY85 model. Frequencies must be positive and sum to one
    /// (within 1e-8); `kappa` must be positive.
    pub fn new(freqs: [f64; N_STATES], kappa: f64) -> Result<Self> {
        if kappa <= 0.0 || !kappa.is_finite() {
            return Err(VireyaError::InvalidInput(
                "Hky85: kappa must be positive and finite".into(),
            ));
        }
        if freqs.iter().any(|&f| f <= 0.0) {
            return Err(VireyaError::InvalidInput(
                "Hky85: frequencies must all be positive".into(),
            ));
        }
        let sum: f64 = freqs.iter().sum();
        if (sum - 1.0).abs() > 1e-8 {
            return Err(VireyaError::InvalidInput(format!(
                "Hky85: frequencies sum to {sum}, expected 1"
            )));
        }
        let [pi_a, pi_c, pi_g, pi_t] = freqs;
        let mean_rate = 2.0 * kappa * (pi_a * pi_g + pi_c * pi_t)
            + 2.0 * (pi_a + pi_g) * (pi_c + pi_t);
        Ok(Self {
            freqs,
            kappa,
            beta: 1.0 / mean_rate,
        })
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    /// Sum of the frequencies in the purine or pyrimidine group containing
    /// state `j`.
    fn group_freq(&self, j: usize) -> f64 {
        match j {
            0 | 2 => self.freqs[0] + self.freqs[2], // purines A, G
            _ => self.freqs[1] + self.freqs[3],     // pyrimidines C, T
        }
    }

    fn same_group(i: usize, j: usize) -> bool {
        (i % 2) == (j % 2)
    }
}

impl SubstitutionModel for Hky85 {
    fn name(&self) -> &'static str {
        "HKY85"
    }

    fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    fn calc_p_matrix(&self, t: f64, p: &mut [f64]) {
        debug_assert_eq!(p.len(), N_STATES * N_STATES);
        let e1 = (-self.beta * t).exp();
        for j in 0..N_STATES {
            let pi_j = self.freqs[j];
            let g = self.group_freq(j);
            // Eigenvalue for within-group (transition) decay.
            let a_j = 1.0 + g * (self.kappa - 1.0);
            let e2 = (-self.beta * t * a_j).exp();
            for i in 0..N_STATES {
                p[i * N_STATES + j] = if i == j {
                    pi_j + pi_j * (1.0 / g - 1.0) * e1 + ((g - pi_j) / g) * e2
                } else if Self::same_group(i, j) {
                    pi_j + pi_j * (1.0 / g - 1.0) * e1 - (pi_j / g) * e2
                } else {
                    pi_j * (1.0 - e1)
                };
            }
        }
    }
}
