//! Univariate slice sampling (Neal 2003) with the stepping-out and shrinkage
//! procedures, overrelaxed sampling, and three unit-width adaptation schemes.
//!
//! The sampler keeps the current point and its tuning state; the target is
//! passed to each call as a closure returning the log density (use
//! [`crate::LN_ZERO`] outside the support). Diagnostics accumulate across
//! calls so the adaptation schemes can be driven from observed behavior.

use vireya_core::rng::Xorshift64;
use vireya_core::{Result, VireyaError};

const BISECTION_MAX_STEPS: u32 = 100;
const BRACKET_MAX_STEPS: u32 = 1000;

/// Slice sampler for one real-valued parameter.
#[derive(Debug, Clone)]
pub struct SliceSampler {
    x0: f64,
    w: f64,
    max_units: u32,
    // y-conditional adaptation: unit width W(y) = multiplier * (a + b * y).
    ycond_on: bool,
    ycond_a: f64,
    ycond_b: f64,
    ycond_multiplier: f64,
    // Diagnostics.
    func_evals: usize,
    expansions: usize,
    failed_samples: usize,
    num_samples: usize,
    num_overrelaxed_samples: usize,
    sum_values: f64,
    sum_widths: f64,
    sum_diffs: f64,
    min_x: f64,
    max_x: f64,
    mode_x: f64,
    mode_ln_fx: f64,
}

impl SliceSampler {
    /// Create a sampler starting at `x0` with unit width `w`.
    pub fn new(x0: f64, w: f64) -> Self {
        Self {
            x0,
            w: if w > 0.0 { w } else { 1.0 },
            max_units: 100,
            ycond_on: false,
            ycond_a: 0.0,
            ycond_b: 0.0,
            ycond_multiplier: 1.0,
            func_evals: 0,
            expansions: 0,
            failed_samples: 0,
            num_samples: 0,
            num_overrelaxed_samples: 0,
            sum_values: 0.0,
            sum_widths: 0.0,
            sum_diffs: 0.0,
            min_x: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            mode_x: x0,
            mode_ln_fx: f64::NEG_INFINITY,
        }
    }

    pub fn x0(&self) -> f64 {
        self.x0
    }

    /// Move the current point (e.g. after an external change to the
    /// parameter this sampler drives).
    pub fn set_x0(&mut self, x0: f64) {
        self.x0 = x0;
    }

    pub fn w(&self) -> f64 {
        self.w
    }

    /// Cap on the total stepping-out units (Neal's `m`).
    pub fn set_max_units(&mut self, max_units: u32) {
        self.max_units = max_units.max(1);
    }

    pub fn func_evals(&self) -> usize {
        self.func_evals
    }

    /// Stepping-out expansions performed across all draws (the realized
    /// portion of the unit budget).
    pub fn expansions(&self) -> usize {
        self.expansions
    }

    pub fn failed_samples(&self) -> usize {
        self.failed_samples
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_overrelaxed_samples(&self) -> usize {
        self.num_overrelaxed_samples
    }

    /// Smallest and largest values ever accepted.
    pub fn sampled_range(&self) -> (f64, f64) {
        (self.min_x, self.max_x)
    }

    /// Mean of the values accepted since the last diagnostics reset, or
    /// `None` before the first draw.
    pub fn mean_value(&self) -> Option<f64> {
        if self.num_samples > 0 {
            Some(self.sum_values / self.num_samples as f64)
        } else {
            None
        }
    }

    /// Best point seen so far and its log density.
    pub fn mode(&self) -> (f64, f64) {
        (self.mode_x, self.mode_ln_fx)
    }

    pub fn reset_diagnostics(&mut self) {
        self.func_evals = 0;
        self.expansions = 0;
        self.failed_samples = 0;
        self.num_samples = 0;
        self.num_overrelaxed_samples = 0;
        self.sum_values = 0.0;
        self.sum_widths = 0.0;
        self.sum_diffs = 0.0;
        self.min_x = f64::INFINITY;
        self.max_x = f64::NEG_INFINITY;
        self.mode_ln_fx = f64::NEG_INFINITY;
    }

    fn eval<F: FnMut(f64) -> f64>(&mut self, lnf: &mut F, x: f64) -> f64 {
        self.func_evals += 1;
        lnf(x)
    }

    fn unit_width(&self, ln_y: f64) -> f64 {
        if self.ycond_on {
            let w = self.ycond_multiplier * (self.ycond_a + self.ycond_b * ln_y.exp());
            if w > 0.0 {
                return w;
            }
        }
        self.w
    }

    fn record_accept(&mut self, x: f64, ln_fx: f64, cropped_width: f64) {
        self.num_samples += 1;
        self.sum_values += x;
        self.sum_widths += cropped_width;
        self.sum_diffs += (x - self.x0).abs();
        if x < self.min_x {
            self.min_x = x;
        }
        if x > self.max_x {
            self.max_x = x;
        }
        if ln_fx > self.mode_ln_fx {
            self.mode_ln_fx = ln_fx;
            self.mode_x = x;
        }
        self.x0 = x;
    }

    /// Draw the next value from the density `exp(lnf)`.
    ///
    /// Stepping-out followed by shrinkage; never rejects, so this always
    /// returns a new (possibly unchanged) point.
    pub fn sample<F: FnMut(f64) -> f64>(&mut self, mut lnf: F, rng: &mut Xorshift64) -> f64 {
        let ln_fx0 = self.eval(&mut lnf, self.x0);
        debug_assert!(
            ln_fx0.is_finite(),
            "slice sampler started outside the support"
        );
        // Slice level: ln y = ln f(x0) + ln U.
        let ln_y = ln_fx0 + rng.next_f64().max(f64::MIN_POSITIVE).ln();
        let w = self.unit_width(ln_y);

        // Random initial interval of width w around x0.
        let u = rng.next_f64();
        let mut left = self.x0 - w * u;
        let mut right = left + w;

        // Split the stepping-out budget randomly between the two directions.
        let v = rng.next_f64();
        let mut j = (self.max_units as f64 * v) as u32;
        let mut k = self.max_units - 1 - j;
        while j > 0 && self.eval(&mut lnf, left) >= ln_y {
            left -= w;
            j -= 1;
            self.expansions += 1;
        }
        while k > 0 && self.eval(&mut lnf, right) >= ln_y {
            right += w;
            k -= 1;
            self.expansions += 1;
        }

        // Shrinkage: sample within [left, right], cropping on failure.
        loop {
            let x = rng.uniform(left, right);
            let ln_fx = self.eval(&mut lnf, x);
            if ln_fx >= ln_y {
                self.record_accept(x, ln_fx, right - left);
                return x;
            }
            self.failed_samples += 1;
            if x > self.x0 {
                right = x;
            } else {
                left = x;
            }
        }
    }

    /// Overrelaxed update (Neal 2003, section 5.1): locate both slice edges
    /// by bisection and reflect the current point through their midpoint.
    ///
    /// Fails if the reflected point lands below the slice, which indicates a
    /// multimodal target or an insufficient bisection tolerance.
    pub fn overrelaxed_sample<F: FnMut(f64) -> f64>(
        &mut self,
        mut lnf: F,
        rng: &mut Xorshift64,
    ) -> Result<f64> {
        self.num_overrelaxed_samples += 1;
        let ln_fx0 = self.eval(&mut lnf, self.x0);
        let ln_y = ln_fx0 + rng.next_f64().max(f64::MIN_POSITIVE).ln();
        let (left, right) = self.find_slice_interval(&mut lnf, self.x0, ln_fx0, ln_y, 1e-6)?;
        let x = left + right - self.x0;
        let ln_fx = self.eval(&mut lnf, x);
        if ln_fx < ln_y {
            return Err(VireyaError::SliceBracket(
                "overrelaxed point fell below the slice; target may be multimodal".into(),
            ));
        }
        self.record_accept(x, ln_fx, right - left);
        Ok(x)
    }

    /// Locate the two points where `lnf` crosses `ln_y0`, starting from
    /// `x0` (with `ln_fx0 = lnf(x0)`).
    ///
    /// Steps outward in units of the current width, then bisects each
    /// bracket down to `tol`. Fails when a bracket puts both endpoints on
    /// the same side of the level, which happens when `x0` sits in a valley
    /// between modes.
    pub fn find_slice_interval<F: FnMut(f64) -> f64>(
        &mut self,
        lnf: &mut F,
        x0: f64,
        ln_fx0: f64,
        ln_y0: f64,
        tol: f64,
    ) -> Result<(f64, f64)> {
        let w = self.w;

        // Left bracket: step down until lnf drops below the level.
        let mut above = ln_fx0;
        let mut left = x0 - w;
        let mut ln_left = self.eval(lnf, left);
        let mut steps = 0;
        while ln_left >= ln_y0 {
            steps += 1;
            if steps > BRACKET_MAX_STEPS {
                return Err(VireyaError::SliceBracket(
                    "left slice edge not found within the step budget".into(),
                ));
            }
            above = ln_left;
            left -= w;
            ln_left = self.eval(lnf, left);
        }
        let left_edge = self.bisection_squeeze(
            lnf,
            left,
            ln_left,
            left + w,
            above,
            ln_y0,
            tol,
            BISECTION_MAX_STEPS,
        )?;

        // Right bracket, symmetrically.
        let mut above = ln_fx0;
        let mut right = x0 + w;
        let mut ln_right = self.eval(lnf, right);
        let mut steps = 0;
        while ln_right >= ln_y0 {
            steps += 1;
            if steps > BRACKET_MAX_STEPS {
                return Err(VireyaError::SliceBracket(
                    "right slice edge not found within the step budget".into(),
                ));
            }
            above = ln_right;
            right += w;
            ln_right = self.eval(lnf, right);
        }
        let right_edge = self.bisection_squeeze(
            lnf,
            right - w,
            above,
            right,
            ln_right,
            ln_y0,
            tol,
            BISECTION_MAX_STEPS,
        )?;

        Ok((left_edge, right_edge))
    }

    /// Bisect toward the point where `lnf` crosses `ln_y0`. Exactly one of
    /// the two endpoints must lie below the level.
    #[allow(clippy::too_many_arguments)]
    fn bisection_squeeze<F: FnMut(f64) -> f64>(
        &mut self,
        lnf: &mut F,
        a: f64,
        ln_fa: f64,
        b: f64,
        ln_fb: f64,
        ln_y0: f64,
        tol: f64,
        steps_left: u32,
    ) -> Result<f64> {
        let a_below = ln_fa < ln_y0;
        let b_below = ln_fb < ln_y0;
        if a_below == b_below {
            return Err(VireyaError::SliceBracket(
                "bracket endpoints on the same side of the slice level".into(),
            ));
        }
        let mid = 0.5 * (a + b);
        if 0.5 * (b - a).abs() < tol || steps_left == 0 {
            return Ok(mid);
        }
        let ln_fm = self.eval(lnf, mid);
        if (ln_fm < ln_y0) == a_below {
            self.bisection_squeeze(lnf, mid, ln_fm, b, ln_fb, ln_y0, tol, steps_left - 1)
        } else {
            self.bisection_squeeze(lnf, a, ln_fa, mid, ln_fm, ln_y0, tol, steps_left - 1)
        }
    }

    /// Set the unit width to `multiplier` times the mean cropped slice width
    /// observed so far.
    pub fn adapt_simple(&mut self, multiplier: f64) {
        self.ycond_on = false;
        if self.num_samples > 0 {
            let w = multiplier * self.sum_widths / self.num_samples as f64;
            if w > 0.0 {
                self.w = w;
            }
        }
    }

    /// Set the unit width to `multiplier` times the mean absolute move
    /// distance (Neal's suggestion).
    pub fn adapt_neal(&mut self, multiplier: f64) {
        self.ycond_on = false;
        if self.num_samples > 0 {
            let w = multiplier * self.sum_diffs / self.num_samples as f64;
            if w > 0.0 {
                self.w = w;
            }
        }
    }

    /// Fit a linear map from slice level to unit width by measuring the
    /// slice interval at two levels below the tracked mode, then use that
    /// map (scaled by `multiplier`) for subsequent draws.
    pub fn adapt_y_conditional<F: FnMut(f64) -> f64>(
        &mut self,
        from_ends: f64,
        multiplier: f64,
        mut lnf: F,
    ) -> Result<()> {
        if !(0.0..0.5).contains(&from_ends) || from_ends == 0.0 {
            return Err(VireyaError::InvalidInput(
                "adapt_y_conditional: from_ends must be in (0, 0.5)".into(),
            ));
        }
        if !self.mode_ln_fx.is_finite() {
            return Err(VireyaError::InvalidInput(
                "adapt_y_conditional: no samples drawn yet, mode is unknown".into(),
            ));
        }
        let (mode_x, mode_ln) = (self.mode_x, self.mode_ln_fx);
        let ln_y1 = from_ends.ln() + mode_ln;
        let ln_y2 = (1.0 - from_ends).ln() + mode_ln;
        let (l1, r1) = self.find_slice_interval(&mut lnf, mode_x, mode_ln, ln_y1, 0.01)?;
        let (l2, r2) = self.find_slice_interval(&mut lnf, mode_x, mode_ln, ln_y2, 0.01)?;
        let (w1, w2) = (r1 - l1, r2 - l2);
        let (y1, y2) = (ln_y1.exp(), ln_y2.exp());
        self.ycond_b = (w1 - w2) / (y1 - y2);
        self.ycond_a = w1 - self.ycond_b * y1;
        self.ycond_multiplier = multiplier;
        self.ycond_on = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{Distribution, ExponentialDist, NormalDist};

    #[test]
    fn standard_normal_moments_recovered() {
        let target = NormalDist::standard();
        let mut sampler = SliceSampler::new(0.1, 2.0);
        let mut rng = Xorshift64::new(8675309);
        // Burn in and adapt the unit width.
        for _ in 0..500 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        sampler.adapt_simple(0.5);
        sampler.reset_diagnostics();

        let n = 100_000;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        for _ in 0..n {
            let x = sampler.sample(|x| target.ln_pdf(x), &mut rng);
            sum += x;
            sum_sq += x * x;
        }
        let mean = sum / n as f64;
        let sd = (sum_sq / n as f64 - mean * mean).sqrt();
        assert!(mean.abs() < 0.02, "sample mean {mean} too far from 0");
        assert!((sd - 1.0).abs() < 0.02, "sample sd {sd} too far from 1");
    }

    #[test]
    fn exponential_mean_recovered() {
        let target = ExponentialDist::new(2.0).unwrap();
        let mut sampler = SliceSampler::new(0.5, 1.0);
        let mut rng = Xorshift64::new(24601);
        for _ in 0..500 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        sampler.adapt_neal(1.5);
        sampler.reset_diagnostics();

        let n = 100_000;
        let mut sum = 0.0;
        for _ in 0..n {
            sum += sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        let mean = sum / n as f64;
        assert!(
            (mean - 0.5).abs() < 0.01,
            "sample mean {mean} too far from 0.5"
        );
        let (lo, _hi) = sampler.sampled_range();
        assert!(lo >= 0.0, "support is nonnegative but sampled {lo}");
    }

    #[test]
    fn diagnostics_accumulate_and_reset() {
        let target = NormalDist::standard();
        let mut sampler = SliceSampler::new(0.0, 1.0);
        let mut rng = Xorshift64::new(3);
        for _ in 0..50 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        assert_eq!(sampler.num_samples(), 50);
        assert!(sampler.func_evals() >= 50, "every draw evaluates the target");
        assert!(
            sampler.expansions() > 0,
            "unit width 1 on N(0, 1) must step out sometimes"
        );
        let (mode_x, mode_ln) = sampler.mode();
        assert!(mode_ln.is_finite());
        assert!(mode_x.abs() < 3.0, "mode estimate {mode_x} implausible");
        let mean = sampler.mean_value().expect("draws were recorded");
        assert!(mean.abs() < 1.0, "running mean {mean} implausible for N(0, 1)");
        sampler.reset_diagnostics();
        assert_eq!(sampler.num_samples(), 0);
        assert_eq!(sampler.func_evals(), 0);
        assert_eq!(sampler.mean_value(), None);
    }

    #[test]
    fn adapt_simple_tracks_slice_width() {
        let target = NormalDist::new(0.0, 5.0).unwrap();
        let mut sampler = SliceSampler::new(0.0, 0.01);
        // The default unit budget caps the stepped-out interval at about
        // 100 * 0.01 = 1, well short of this target's scale; widen it so the
        // observed slice widths reflect the target rather than the cap.
        sampler.set_max_units(10_000);
        let mut rng = Xorshift64::new(17);
        for _ in 0..200 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        sampler.adapt_simple(0.5);
        assert!(
            sampler.w() > 0.5,
            "unit width {} should grow toward the target scale",
            sampler.w()
        );
    }

    #[test]
    fn step_out_interval_is_capped_by_the_unit_budget() {
        let target = NormalDist::new(0.0, 5.0).unwrap();
        let mut sampler = SliceSampler::new(0.0, 0.01);
        let mut rng = Xorshift64::new(17);
        for _ in 0..200 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        // 100 units of width 0.01 bound every interval near 1, so the mean
        // cropped width cannot exceed the cap no matter how wide the target.
        sampler.adapt_simple(0.5);
        assert!(
            sampler.w() <= 0.5 + 1e-9,
            "unit width {} cannot exceed half the budget-capped interval",
            sampler.w()
        );
        assert!(sampler.w() > 0.1, "adaptation should still track the cap");
    }

    #[test]
    fn overrelaxed_sample_stays_on_slice() {
        let target = NormalDist::standard();
        let mut sampler = SliceSampler::new(0.3, 1.0);
        let mut rng = Xorshift64::new(99);
        for _ in 0..100 {
            let x = sampler
                .overrelaxed_sample(|x| target.ln_pdf(x), &mut rng)
                .expect("unimodal target must not fail");
            assert!(x.is_finite());
        }
        assert_eq!(sampler.num_overrelaxed_samples(), 100);
    }

    #[test]
    fn y_conditional_adaptation_samples_correctly() {
        let target = NormalDist::standard();
        let mut sampler = SliceSampler::new(0.0, 1.0);
        let mut rng = Xorshift64::new(55);
        for _ in 0..500 {
            sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        sampler
            .adapt_y_conditional(0.1, 1.0, |x| target.ln_pdf(x))
            .expect("adaptation on a unimodal target");
        sampler.reset_diagnostics();
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            sum += sampler.sample(|x| target.ln_pdf(x), &mut rng);
        }
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.05, "sample mean {mean} too far from 0");
    }

    #[test]
    fn bracket_failure_reported_for_bimodal_valley() {
        // Two well-separated modes at ±3; x0 sits in the valley.
        let mut lnf = |x: f64| {
            let a = (-(x + 3.0) * (x + 3.0)).exp();
            let b = (-(x - 3.0) * (x - 3.0)).exp();
            (a + b).ln()
        };
        let mut sampler = SliceSampler::new(0.0, 0.5);
        let ln_fx0 = lnf(0.0);
        // Level above the valley floor but below the peaks.
        let ln_y0 = -0.5;
        assert!(ln_fx0 < ln_y0, "test setup: x0 must start below the level");
        let err = sampler
            .find_slice_interval(&mut lnf, 0.0, ln_fx0, ln_y0, 1e-6)
            .unwrap_err();
        assert!(
            matches!(err, VireyaError::SliceBracket(_)),
            "expected a bracket failure, got {err}"
        );
    }
}
