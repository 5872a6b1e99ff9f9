//! Davies (1980), "The distribution of a linear combination of chi-squared random
//! variables", Applied Statistics algorithm AS 155.
//!
//! The distribution function is recovered by numerically inverting the
//! characteristic function. Truncation and integration-interval choices are driven
//! by explicit error bounds, so the result carries a guaranteed absolute accuracy
//! unless a fault is reported.

use super::{QuadFormError, TailProbability};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// ln(2) / 8
const LOG28: f64 = 0.0866;

/// Divisors tried when tightening the truncation point.
const TRUNCATION_DIVISORS: [f64; 4] = [2.0, 1.4, 1.2, 1.1];

/// Radices used to detect significant round-off in the final integral.
const ROUNDOFF_RADICES: [f64; 4] = [1.0, 2.0, 4.0, 8.0];

/// One `λ · χ²(df, nc)` term of the linear combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChiSquareTerm {
    pub weight: f64,
    pub degrees_of_freedom: u32,
    pub noncentrality: f64,
}

impl ChiSquareTerm {
    pub fn central(weight: f64) -> Self {
        Self {
            weight,
            degrees_of_freedom: 1,
            noncentrality: 0.0,
        }
    }
}

/// Result of a distribution-function evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaviesOutcome {
    /// `Pr(Q < c)`.
    pub cdf: f64,
    /// Absolute sum of the integrand, a bound on the round-off scale.
    pub error_scale: f64,
    /// Total number of integration terms evaluated.
    pub terms: usize,
    /// Number of integrations performed (auxiliary plus main).
    pub integrations: usize,
    /// Set when round-off error could be significant relative to the accuracy.
    pub roundoff_suspect: bool,
}

impl DaviesOutcome {
    fn exact(cdf: f64) -> Self {
        Self {
            cdf,
            error_scale: 0.0,
            terms: 0,
            integrations: 0,
            roundoff_suspect: false,
        }
    }
}

/// Davies' method with a fixed accuracy target and a cap on integration terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Davies {
    /// Maximum absolute error of the returned probability.
    pub accuracy: f64,
    /// Maximum number of integration terms (and bound-evaluation steps).
    pub term_limit: usize,
}

impl Default for Davies {
    fn default() -> Self {
        Self {
            accuracy: 1e-7,
            term_limit: 1_000_000,
        }
    }
}

impl Davies {
    pub fn new(accuracy: f64, term_limit: usize) -> Self {
        Self {
            accuracy,
            term_limit,
        }
    }

    /// Distribution function `Pr(Σ λⱼ χ²(nⱼ, δⱼ) + σ·N(0,1) < c)`.
    pub fn cdf(
        &self,
        c: f64,
        terms: &[ChiSquareTerm],
        sigma: f64,
    ) -> Result<DaviesOutcome, QuadFormError> {
        if !c.is_finite() {
            return Err(QuadFormError::NonFiniteOffset(c));
        }
        if !(self.accuracy > 0.0) {
            return Err(QuadFormError::InvalidParameters(
                "accuracy must be strictly positive",
            ));
        }
        if !sigma.is_finite() {
            return Err(QuadFormError::InvalidParameters(
                "normal coefficient must be finite",
            ));
        }
        for (index, term) in terms.iter().enumerate() {
            if !term.weight.is_finite() {
                return Err(QuadFormError::NonFiniteWeight {
                    index,
                    value: term.weight,
                });
            }
            if !(term.noncentrality >= 0.0) || !term.noncentrality.is_finite() {
                return Err(QuadFormError::InvalidParameters(
                    "noncentrality parameters must be finite and non-negative",
                ));
            }
        }

        let mut integrator = Integrator::new(c, terms, sigma, self.term_limit);
        match integrator.run(self.accuracy) {
            Ok(outcome) => Ok(outcome),
            Err(Fault::StepLimit) => Err(QuadFormError::IntegrationSetup {
                term_limit: self.term_limit,
            }),
            Err(Fault::TermLimit) => Err(QuadFormError::AccuracyNotAchieved {
                term_limit: self.term_limit,
                accuracy: self.accuracy,
            }),
        }
    }
}

impl TailProbability for Davies {
    fn upper_tail(&self, offset: f64, weights: &[f64]) -> Result<f64, QuadFormError> {
        let terms: Vec<ChiSquareTerm> = weights.iter().copied().map(ChiSquareTerm::central).collect();
        let outcome = self.cdf(offset, &terms, 0.0)?;
        if outcome.roundoff_suspect {
            log::debug!(
                "Davies' method: round-off may be significant (error scale {:.3e}, {} terms).",
                outcome.error_scale,
                outcome.terms
            );
        }
        Ok((1.0 - outcome.cdf).clamp(0.0, 1.0))
    }
}

/// Internal early exits of the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    /// Too many bound evaluations while locating integration parameters.
    StepLimit,
    /// Required integration terms exceed the limit.
    TermLimit,
}

#[inline]
fn exp1(x: f64) -> f64 {
    if x < -50.0 { 0.0 } else { x.exp() }
}

/// `ln(1 + x)` when `first`, otherwise `ln(1 + x) - x`; series expansion near zero.
fn log1(x: f64, first: bool) -> f64 {
    if x.abs() > 0.1 {
        if first {
            (1.0 + x).ln()
        } else {
            (1.0 + x).ln() - x
        }
    } else {
        let mut y = x / (2.0 + x);
        let mut term = 2.0 * y * y * y;
        let mut k = 3.0;
        let mut s = if first { 2.0 } else { -x } * y;
        y *= y;
        let mut s1 = s + term / k;
        while s1 != s {
            k += 2.0;
            term *= y;
            s = s1;
            s1 = s + term / k;
        }
        s
    }
}

struct Integrator<'a> {
    terms: &'a [ChiSquareTerm],
    c: f64,
    sigsq: f64,
    lmax: f64,
    lmin: f64,
    mean: f64,
    intl: f64,
    ersm: f64,
    count: usize,
    limit: usize,
    /// Term indices ordered by decreasing |weight|, built lazily.
    order: Option<Vec<usize>>,
    fail: bool,
}

impl<'a> Integrator<'a> {
    fn new(c: f64, terms: &'a [ChiSquareTerm], sigma: f64, limit: usize) -> Self {
        Self {
            terms,
            c,
            sigsq: sigma * sigma,
            lmax: 0.0,
            lmin: 0.0,
            mean: 0.0,
            intl: 0.0,
            ersm: 0.0,
            count: 0,
            limit,
            order: None,
            fail: false,
        }
    }

    fn counter(&mut self) -> Result<(), Fault> {
        self.count += 1;
        if self.count > self.limit {
            Err(Fault::StepLimit)
        } else {
            Ok(())
        }
    }

    fn ordered_terms(&mut self) -> Vec<usize> {
        if let Some(order) = &self.order {
            return order.clone();
        }
        let terms = self.terms;
        let mut order: Vec<usize> = (0..terms.len()).collect();
        order.sort_by(|&a, &b| terms[b].weight.abs().total_cmp(&terms[a].weight.abs()));
        self.order = Some(order.clone());
        order
    }

    /// Bound on the tail probability using the mgf; also returns the cutoff point.
    fn errbd(&mut self, u: f64) -> Result<(f64, f64), Fault> {
        self.counter()?;
        let mut xconst = u * self.sigsq;
        let mut sum1 = u * xconst;
        let u = 2.0 * u;
        for term in self.terms.iter().rev() {
            let nj = f64::from(term.degrees_of_freedom);
            let lj = term.weight;
            let ncj = term.noncentrality;
            let x = u * lj;
            let y = 1.0 - x;
            xconst += lj * (ncj / y + nj) / y;
            sum1 += ncj * (x / y) * (x / y) + nj * (x * x / y + log1(-x, false));
        }
        Ok((exp1(-0.5 * sum1), xconst))
    }

    /// Finds a cutoff so that `P(Q > cutoff) < accx` when `*upn > 0`, or
    /// `P(Q < cutoff) < accx` otherwise.
    fn ctff(&mut self, accx: f64, upn: &mut f64) -> Result<f64, Fault> {
        let mut u2 = *upn;
        let mut u1 = 0.0;
        let mut c1 = self.mean;
        let rb = 2.0 * if u2 > 0.0 { self.lmax } else { self.lmin };

        let mut c2;
        loop {
            let (bound, cutoff) = self.errbd(u2 / (1.0 + u2 * rb))?;
            c2 = cutoff;
            if bound <= accx {
                break;
            }
            u1 = u2;
            c1 = c2;
            u2 *= 2.0;
        }

        let mut ratio = (c1 - self.mean) / (c2 - self.mean);
        while ratio < 0.9 {
            let u = (u1 + u2) / 2.0;
            let (bound, cutoff) = self.errbd(u / (1.0 + u * rb))?;
            if bound > accx {
                u1 = u;
                c1 = cutoff;
            } else {
                u2 = u;
                c2 = cutoff;
            }
            ratio = (c1 - self.mean) / (c2 - self.mean);
        }
        *upn = u2;
        Ok(c2)
    }

    /// Bound on the integration error due to truncation at `u`.
    fn truncation(&mut self, u: f64, tausq: f64) -> Result<f64, Fault> {
        self.counter()?;
        let mut sum1 = 0.0;
        let mut prod2 = 0.0;
        let mut prod3 = 0.0;
        let mut s = 0u64;
        let sum2 = (self.sigsq + tausq) * u * u;
        let mut prod1 = 2.0 * sum2;
        let u = 2.0 * u;

        for term in self.terms {
            let lj = term.weight;
            let ncj = term.noncentrality;
            let nj = f64::from(term.degrees_of_freedom);
            let x = (u * lj) * (u * lj);
            sum1 += ncj * x / (1.0 + x);
            if x > 1.0 {
                prod2 += nj * x.ln();
                prod3 += nj * log1(x, true);
                s += u64::from(term.degrees_of_freedom);
            } else {
                prod1 += nj * log1(x, true);
            }
        }
        sum1 *= 0.5;
        prod2 += prod1;
        prod3 += prod1;

        let x = exp1(-sum1 - 0.25 * prod2) / PI;
        let y = exp1(-sum1 - 0.25 * prod3) / PI;
        let mut err1 = if s == 0 { 1.0 } else { x * 2.0 / s as f64 };
        let err2 = if prod3 > 1.0 { 2.5 * y } else { 1.0 };
        if err2 < err1 {
            err1 = err2;
        }
        let x = 0.5 * sum2;
        let err2 = if x <= y { 1.0 } else { y / x };
        Ok(if err1 < err2 { err1 } else { err2 })
    }

    /// Finds `u` with `truncation(u) < accx` and `truncation(u / 1.2) > accx`.
    fn findu(&mut self, utx: &mut f64, accx: f64) -> Result<(), Fault> {
        let mut ut = *utx;
        let mut u = ut / 4.0;
        if self.truncation(u, 0.0)? > accx {
            u = ut;
            while self.truncation(u, 0.0)? > accx {
                ut *= 4.0;
                u = ut;
            }
        } else {
            ut = u;
            u /= 4.0;
            while self.truncation(u, 0.0)? <= accx {
                ut = u;
                u /= 4.0;
            }
        }
        for divisor in TRUNCATION_DIVISORS {
            u = ut / divisor;
            if self.truncation(u, 0.0)? <= accx {
                ut = u;
            }
        }
        *utx = ut;
        Ok(())
    }

    /// Integrates with `nterm` terms at step `interv`. The auxiliary pass multiplies
    /// the integrand by `1 - exp(-tausq u² / 2)`.
    fn integrate(&mut self, nterm: usize, interv: f64, tausq: f64, main: bool) {
        let inpi = interv / PI;
        for k in (0..=nterm).rev() {
            let u = (k as f64 + 0.5) * interv;
            let mut sum1 = -2.0 * u * self.c;
            let mut sum2 = sum1.abs();
            let mut sum3 = -0.5 * self.sigsq * u * u;
            for term in self.terms.iter().rev() {
                let nj = f64::from(term.degrees_of_freedom);
                let x = 2.0 * term.weight * u;
                let y = x * x;
                sum3 -= 0.25 * nj * log1(y, true);
                let y = term.noncentrality * x / (1.0 + y);
                let z = nj * x.atan() + y;
                sum1 += z;
                sum2 += z.abs();
                sum3 -= 0.5 * x * y;
            }
            let mut x = inpi * exp1(sum3) / u;
            if !main {
                x *= 1.0 - exp1(-0.5 * tausq * u * u);
            }
            self.intl += (0.5 * sum1).sin() * x;
            self.ersm += 0.5 * sum2 * x;
        }
    }

    /// Coefficient of `tausq` in the error when the convergence factor
    /// `exp(-tausq u² / 2)` is used and the distribution is evaluated at `x`.
    fn cfe(&mut self, x: f64) -> Result<f64, Fault> {
        self.counter()?;
        let order = self.ordered_terms();
        let mut axl = x.abs();
        let sxl = if x > 0.0 { 1.0 } else { -1.0 };
        let mut sum1 = 0.0;
        for j in (0..order.len()).rev() {
            let term = self.terms[order[j]];
            if term.weight * sxl > 0.0 {
                let lj = term.weight.abs();
                let axl1 = axl - lj * (f64::from(term.degrees_of_freedom) + term.noncentrality);
                let axl2 = lj / LOG28;
                if axl1 > axl2 {
                    axl = axl1;
                } else {
                    if axl > axl2 {
                        axl = axl2;
                    }
                    sum1 = (axl - axl1) / lj;
                    for &idx in order[..j].iter() {
                        let other = self.terms[idx];
                        sum1 += f64::from(other.degrees_of_freedom) + other.noncentrality;
                    }
                    break;
                }
            }
        }
        if sum1 > 100.0 {
            self.fail = true;
            Ok(1.0)
        } else {
            Ok(2f64.powf(sum1 / 4.0) / (PI * axl * axl))
        }
    }

    fn run(&mut self, accuracy: f64) -> Result<DaviesOutcome, Fault> {
        let c = self.c;
        let mut acc1 = accuracy;
        let mut xlim = self.limit as f64;
        let mut terms_used = 0usize;
        let mut integrations = 0usize;

        let mut sd = self.sigsq;
        for term in self.terms {
            let nj = f64::from(term.degrees_of_freedom);
            let lj = term.weight;
            let ncj = term.noncentrality;
            sd += lj * lj * (2.0 * nj + 4.0 * ncj);
            self.mean += lj * (nj + ncj);
            if self.lmax < lj {
                self.lmax = lj;
            } else if self.lmin > lj {
                self.lmin = lj;
            }
        }
        // No random component: a point mass at zero.
        if sd == 0.0 {
            return Ok(DaviesOutcome::exact(if c > 0.0 { 1.0 } else { 0.0 }));
        }
        let sd = sd.sqrt();
        let almx = if self.lmax < -self.lmin { -self.lmin } else { self.lmax };

        // Starting values for findu and ctff.
        let mut utx = 16.0 / sd;
        let mut up = 4.5 / sd;
        let mut un = -up;

        // Truncation point with no convergence factor.
        self.findu(&mut utx, 0.5 * acc1)?;
        if c != 0.0 && almx > 0.07 * sd {
            let tausq = 0.25 * acc1 / self.cfe(c)?;
            if self.fail {
                self.fail = false;
            } else if self.truncation(utx, tausq)? < 0.2 * acc1 {
                self.sigsq += tausq;
                self.findu(&mut utx, 0.25 * acc1)?;
            }
        }
        acc1 *= 0.5;

        let (interval, xnt) = loop {
            // Range of the distribution; quit if c lies outside it.
            let d1 = self.ctff(acc1, &mut up)? - c;
            if d1 < 0.0 {
                return Ok(DaviesOutcome::exact(1.0));
            }
            let d2 = c - self.ctff(acc1, &mut un)?;
            if d2 < 0.0 {
                return Ok(DaviesOutcome::exact(0.0));
            }

            let interval = 2.0 * PI / d1.max(d2);
            let xnt = utx / interval;
            let xntm = 3.0 / acc1.sqrt();
            if xnt <= xntm * 1.5 {
                break (interval, xnt);
            }

            // Auxiliary integration with a convergence factor.
            if xntm > xlim {
                return Err(Fault::TermLimit);
            }
            let ntm = (xntm + 0.5).floor() as usize;
            let interval_aux = utx / ntm as f64;
            let x = 2.0 * PI / interval_aux;
            if x <= c.abs() {
                break (interval, xnt);
            }
            let tausq = 0.33 * acc1 / (1.1 * (self.cfe(c - x)? + self.cfe(c + x)?));
            if self.fail {
                break (interval, xnt);
            }
            acc1 *= 0.67;
            self.integrate(ntm, interval_aux, tausq, false);
            xlim -= xntm;
            self.sigsq += tausq;
            integrations += 1;
            terms_used += ntm + 1;

            self.findu(&mut utx, 0.25 * acc1)?;
            acc1 *= 0.75;
        };

        if xnt > xlim {
            return Err(Fault::TermLimit);
        }
        let nt = (xnt + 0.5).floor() as usize;
        self.integrate(nt, interval, 0.0, true);
        integrations += 1;
        terms_used += nt + 1;

        let cdf = 0.5 - self.intl;
        let up = self.ersm;
        let x = up + accuracy / 10.0;
        let roundoff_suspect = ROUNDOFF_RADICES.iter().any(|&rat| rat * x == rat * up);

        Ok(DaviesOutcome {
            cdf,
            error_scale: self.ersm,
            terms: terms_used,
            integrations,
            roundoff_suspect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn chi_square_one_critical_value() {
        let davies = Davies::default();
        let p = davies.upper_tail(3.841458820694124, &[1.0]).unwrap();
        assert_abs_diff_eq!(p, 0.05, epsilon = 1e-5);
    }

    #[test]
    fn two_unit_weights_give_exponential_tail() {
        // χ²₂ has survival function exp(-x / 2).
        let davies = Davies::default();
        for &x in &[0.5, 2.0, 4.0, 9.0] {
            let p = davies.upper_tail(x, &[1.0, 1.0]).unwrap();
            assert_abs_diff_eq!(p, (-x / 2.0f64).exp(), epsilon = 1e-5);
        }
    }

    #[test]
    fn scaled_weights_match_rescaled_offset() {
        let davies = Davies::default();
        let a = davies.upper_tail(6.0, &[3.0, 1.5, 0.5]).unwrap();
        let b = davies.upper_tail(2.0, &[1.0, 0.5, 1.0 / 6.0]).unwrap();
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }

    #[test]
    fn symmetric_difference_is_half() {
        let davies = Davies::default();
        let p = davies.upper_tail(0.0, &[1.0, -1.0]).unwrap();
        assert_abs_diff_eq!(p, 0.5, epsilon = 1e-5);
    }

    #[test]
    fn non_negative_form_is_always_above_zero() {
        let davies = Davies::default();
        let p = davies.upper_tail(0.0, &[1.0, 1.0, 0.0, 0.0]).unwrap();
        assert_abs_diff_eq!(p, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn empty_form_is_a_point_mass_at_zero() {
        let davies = Davies::default();
        assert_eq!(davies.upper_tail(0.0, &[]).unwrap(), 1.0);
        assert_eq!(davies.upper_tail(0.5, &[0.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn rejects_non_finite_weights() {
        let davies = Davies::default();
        let err = davies.upper_tail(1.0, &[1.0, f64::NAN]).unwrap_err();
        assert!(matches!(err, QuadFormError::NonFiniteWeight { index: 1, .. }));
    }

    #[test]
    fn log1_series_matches_direct_evaluation() {
        for &x in &[-0.09, -0.01, 0.0, 0.03, 0.0999] {
            assert_abs_diff_eq!(log1(x, true), (1.0f64 + x).ln(), epsilon = 1e-14);
            assert_abs_diff_eq!(log1(x, false), (1.0f64 + x).ln() - x, epsilon = 1e-14);
        }
    }

    #[test]
    fn four_degrees_of_freedom_match_closed_form() {
        // χ²₄ has survival function exp(-x / 2) · (1 + x / 2).
        let davies = Davies::default();
        let term = ChiSquareTerm {
            weight: 1.0,
            degrees_of_freedom: 4,
            noncentrality: 0.0,
        };
        for &x in &[1.0, 3.0, 7.5] {
            let outcome = davies.cdf(x, &[term], 0.0).unwrap();
            let survival = (-x / 2.0f64).exp() * (1.0 + x / 2.0);
            assert_abs_diff_eq!(1.0 - outcome.cdf, survival, epsilon = 1e-5);
        }
    }

    #[test]
    fn noncentral_chi_square_matches_shifted_normal() {
        // χ²₁(δ) = (N + √δ)², so Pr(Q < c) = Φ(√c − √δ) − Φ(−√c − √δ). With √δ = 2 and
        // √c = 2 + z₀.₉₇₅ the second term is below 1e-8.
        let davies = Davies::default();
        let term = ChiSquareTerm {
            weight: 1.0,
            degrees_of_freedom: 1,
            noncentrality: 4.0,
        };
        let root = 2.0 + 1.959963984540054;
        let outcome = davies.cdf(root * root, &[term], 0.0).unwrap();
        assert_abs_diff_eq!(outcome.cdf, 0.975, epsilon = 1e-5);
        assert!(outcome.integrations >= 1);
    }

    #[test]
    fn normal_term_alone_gives_normal_quantiles() {
        let davies = Davies::default();
        let sigma = 2.5;
        let median = davies.cdf(0.0, &[], sigma).unwrap();
        assert_abs_diff_eq!(median.cdf, 0.5, epsilon = 1e-5);
        let upper = davies.cdf(sigma * 1.959963984540054, &[], sigma).unwrap();
        assert_abs_diff_eq!(upper.cdf, 0.975, epsilon = 1e-5);
    }

    #[test]
    fn invalid_noncentrality_and_normal_term_are_rejected() {
        let davies = Davies::default();
        let term = ChiSquareTerm {
            weight: 1.0,
            degrees_of_freedom: 1,
            noncentrality: -1.0,
        };
        assert!(matches!(
            davies.cdf(1.0, &[term], 0.0),
            Err(QuadFormError::InvalidParameters(_))
        ));
        assert!(matches!(
            davies.cdf(1.0, &[ChiSquareTerm::central(1.0)], f64::INFINITY),
            Err(QuadFormError::InvalidParameters(_))
        ));
    }

    #[test]
    fn upper_tail_decreases_with_offset() {
        let davies = Davies::default();
        let weights = [2.0, 1.0, 0.5, -0.3];
        let mut previous = 1.0;
        for step in 0..10 {
            let p = davies.upper_tail(step as f64, &weights).unwrap();
            assert!(p <= previous + 1e-6, "p({step}) = {p} > {previous}");
            previous = p;
        }
    }
}
