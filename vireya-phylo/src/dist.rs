//! Probability distributions used as priors, edge-length generators, and
//! slice-sampler targets.
//!
//! Each distribution validates its parameters at construction and then
//! exposes the [`Distribution`] capability set: `sample`, `ln_pdf`, `cdf`.
//! Out-of-domain densities return the [`crate::LN_ZERO`] sentinel rather
//! than erroring, so acceptance-ratio arithmetic can proceed.

use core::f64::consts::PI;

use vireya_core::rng::Xorshift64;
use vireya_core::{Result, VireyaError};

use crate::LN_ZERO;

/// Error function via Abramowitz & Stegun 7.1.26 (max error ~1.5e-7).
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Natural log of the gamma function via the Lanczos approximation (g=7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];

    if x < 0.5 {
        // Reflection formula: Γ(x) = π / (sin(πx) · Γ(1-x))
        let log_pi_over_sin = (PI / (PI * x).sin()).ln();
        log_pi_over_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = 0.99999999999980993_f64;
        for (i, &c) in COEFFS.iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5; // g + 0.5
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}

/// Regularized lower incomplete gamma function P(a, x).
///
/// Series expansion for `x < a + 1`, continued fraction (modified Lentz)
/// otherwise.
pub fn gammp(a: f64, x: f64) -> Result<f64> {
    if a <= 0.0 || x < 0.0 {
        return Err(VireyaError::InvalidInput(
            "gammp: requires a > 0 and x >= 0".into(),
        ));
    }
    if x == 0.0 {
        return Ok(0.0);
    }
    let ln_pre = a * x.ln() - x - ln_gamma(a);
    if x < a + 1.0 {
        // Series representation.
        let mut term = 1.0 / a;
        let mut sum = term;
        let mut ap = a;
        for _ in 0..200 {
            ap += 1.0;
            term *= x / ap;
            sum += term;
            if term.abs() < sum.abs() * 1e-12 {
                break;
            }
        }
        Ok((ln_pre.exp() * sum).min(1.0))
    } else {
        // Continued fraction for Q(a, x), then P = 1 - Q.
        let tiny = 1e-30_f64;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..=200 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-12 {
                break;
            }
        }
        Ok((1.0 - ln_pre.exp() * h).max(0.0))
    }
}

/// A univariate probability distribution: the duck-typed density contract
/// consumed by priors, tree builders, and the slice sampler's test targets.
pub trait Distribution {
    /// Draw one variate using the injected generator.
    fn sample(&self, rng: &mut Xorshift64) -> f64;

    /// Natural log of the density at `x`, or [`LN_ZERO`] out of domain.
    fn ln_pdf(&self, x: f64) -> f64;

    /// Cumulative distribution function at `x`.
    fn cdf(&self, x: f64) -> f64;

    /// Distribution mean.
    fn mean(&self) -> f64;
}

fn sample_standard_normal(rng: &mut Xorshift64) -> f64 {
    // Box-Muller; reject u1 == 0 so the log stays finite.
    let mut u1 = rng.next_f64();
    while u1 == 0.0 {
        u1 = rng.next_f64();
    }
    let u2 = rng.next_f64();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Exponential distribution with rate parameter λ.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExponentialDist {
    lambda: f64,
}

impl ExponentialDist {
    /// Create a new exponential distribution. `lambda` must be positive.
    pub fn new(lambda: f64) -> Result<Self> {
        if lambda <= 0.0 || !lambda.is_finite() {
            return Err(VireyaError::InvalidInput(
                "ExponentialDist: lambda must be positive and finite".into(),
            ));
        }
        Ok(Self { lambda })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }
}

impl Distribution for ExponentialDist {
    fn sample(&self, rng: &mut Xorshift64) -> f64 {
        let mut u = rng.next_f64();
        while u == 0.0 {
            u = rng.next_f64();
        }
        -u.ln() / self.lambda
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        if x < 0.0 {
            return LN_ZERO;
        }
        self.lambda.ln() - self.lambda * x
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            0.0
        } else {
            1.0 - (-self.lambda * x).exp()
        }
    }

    fn mean(&self) -> f64 {
        1.0 / self.lambda
    }
}

/// Normal (Gaussian) distribution with parameters μ and σ.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NormalDist {
    mu: f64,
    sigma: f64,
}

impl NormalDist {
    /// Create a new normal distribution. `sigma` must be positive.
    pub fn new(mu: f64, sigma: f64) -> Result<Self> {
        if sigma <= 0.0 || !sigma.is_finite() {
            return Err(VireyaError::InvalidInput(
                "NormalDist: sigma must be positive and finite".into(),
            ));
        }
        Ok(Self { mu, sigma })
    }

    /// Standard normal distribution N(0, 1).
    pub fn standard() -> Self {
        Self {
            mu: 0.0,
            sigma: 1.0,
        }
    }
}

impl Distribution for NormalDist {
    fn sample(&self, rng: &mut Xorshift64) -> f64 {
        self.mu + self.sigma * sample_standard_normal(rng)
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.sigma;
        -0.5 * z * z - self.sigma.ln() - 0.5 * (2.0 * PI).ln()
    }

    fn cdf(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.sigma;
        0.5 * (1.0 + erf(z / core::f64::consts::SQRT_2))
    }

    fn mean(&self) -> f64 {
        self.mu
    }
}

/// Gamma distribution with shape α and scale θ (mean αθ).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GammaDist {
    shape: f64,
    scale: f64,
}

impl GammaDist {
    /// Create a new gamma distribution. Both parameters must be positive.
    pub fn new(shape: f64, scale: f64) -> Result<Self> {
        if shape <= 0.0 || scale <= 0.0 || !shape.is_finite() || !scale.is_finite() {
            return Err(VireyaError::InvalidInput(
                "GammaDist: shape and scale must be positive and finite".into(),
            ));
        }
        Ok(Self { shape, scale })
    }

    fn sample_shape_ge_one(shape: f64, rng: &mut Xorshift64) -> f64 {
        // Marsaglia & Tsang (2000) squeeze method.
        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        loop {
            let z = sample_standard_normal(rng);
            let v = 1.0 + c * z;
            if v <= 0.0 {
                continue;
            }
            let v3 = v * v * v;
            let mut u = rng.next_f64();
            while u == 0.0 {
                u = rng.next_f64();
            }
            if u.ln() < 0.5 * z * z + d - d * v3 + d * v3.ln() {
                return d * v3;
            }
        }
    }
}

impl Distribution for GammaDist {
    fn sample(&self, rng: &mut Xorshift64) -> f64 {
        if self.shape >= 1.0 {
            self.scale * Self::sample_shape_ge_one(self.shape, rng)
        } else {
            // Boost for shape < 1: X ~ Gamma(shape+1) * U^(1/shape).
            let g = Self::sample_shape_ge_one(self.shape + 1.0, rng);
            let mut u = rng.next_f64();
            while u == 0.0 {
                u = rng.next_f64();
            }
            self.scale * g * u.powf(1.0 / self.shape)
        }
    }

    fn ln_pdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return LN_ZERO;
        }
        (self.shape - 1.0) * x.ln() - x / self.scale
            - ln_gamma(self.shape)
            - self.shape * self.scale.ln()
    }

    fn cdf(&self, x: f64) -> f64 {
        if x <= 0.0 {
            0.0
        } else {
            gammp(self.shape, x / self.scale).unwrap_or(0.0)
        }
    }

    fn mean(&self) -> f64 {
        self.shape * self.scale
    }
}
