//! Robust correction-curve fitting.
//!
//! The matched `(reference, instrumental)` magnitude pairs are sorted by
//! instrumental magnitude, their offsets are smoothed with a
//! magnitude-adaptive running median to suppress outliers, and the correction
//! curve is then fitted to the smoothed reference magnitudes. Residuals are
//! down-weighted by `(m − 8)²` so the bright end, where there are few stars, is
//! not pulled around by the faint majority.
//!
//! The polynomial part is solved in powers of the centred magnitude
//! `u = (m − center) / half_range`, which keeps the quartic columns well
//! conditioned. With the log term's shape `(p2, p3)` frozen the curve is linear
//! in its remaining parameters, so the pure polynomial and every shape on a
//! small grid are solved exactly by SVD. The cheapest of those and the caller's
//! seed starts a Levenberg–Marquardt polish over all eight parameters. The
//! returned curve never costs more than the seed.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{PhotocalError, Result};
use crate::stats::adaptive_median_filter;

use super::curve::{log10_one_plus_pow10, pow10_logistic, CalibrationCurve, NUM_PARAMS};

/// Magnitude around which the residual weight `(m − 8)²` vanishes.
const WEIGHT_PIVOT_MAG: f64 = 8.0;

/// Degree of the polynomial part of the curve.
const POLY_DEGREE: usize = 4;

/// Log-term slopes `p2` tried when choosing the starting curve.
const SHAPE_SLOPES: [f64; 6] = [-2.0, -1.0, -0.5, 0.5, 1.0, 2.0];

/// Quantiles of the fit magnitudes tried as the log-term knee `p3`.
const SHAPE_KNEE_QUANTILES: [f64; 5] = [0.1, 0.3, 0.5, 0.7, 0.9];

/// Singular values below this, after unit-norm column scaling, are treated as zero.
const SVD_EPS: f64 = 1e-10;

/// Levenberg–Marquardt settings.
#[derive(Debug, Clone)]
pub struct LmConfig {
    /// Maximum number of accepted + rejected steps. Default 400.
    pub max_iterations: u32,
    /// Initial damping. Default 1e-3.
    pub initial_lambda: f64,
    /// Stop when the relative cost decrease falls below this. Default 1.49e-8.
    pub ftol: f64,
    /// Stop when the relative step size falls below this. Default 1.49e-8.
    pub xtol: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 400,
            initial_lambda: 1e-3,
            ftol: 1.49e-8,
            xtol: 1.49e-8,
        }
    }
}

/// A fitted correction curve and its convergence diagnostics.
#[derive(Debug, Clone)]
pub struct CurveFit {
    pub curve: CalibrationCurve,
    /// Number of Levenberg–Marquardt iterations performed.
    pub iterations: u32,
    /// Final weighted sum of squared residuals. Never above the seed's.
    pub cost: f64,
    /// `true` if the Levenberg–Marquardt polish met a tolerance within `max_iterations`.
    pub converged: bool,
    /// Instrumental magnitudes of the fit sample, sorted ascending.
    pub sorted_mags: Vec<f64>,
    /// Median-filtered `reference − instrumental` offsets, aligned with `sorted_mags`.
    pub smoothed_offsets: Vec<f64>,
}

/// Median filter + nonlinear least squares fitter for the correction curve.
#[derive(Debug, Clone, Default)]
pub struct RobustCurveFitter {
    pub lm: LmConfig,
}

impl RobustCurveFitter {
    pub fn new(lm: LmConfig) -> Self {
        Self { lm }
    }

    /// Fit the correction curve mapping `instrumental` to `reference` magnitudes.
    ///
    /// `reference` and `instrumental` are paired by index. `seed` is normally
    /// [`CalibrationCurve::offset`] of the median offset; the result is never
    /// worse than it.
    pub fn fit(&self, reference: &[f64], instrumental: &[f64], seed: CalibrationCurve) -> Result<CurveFit> {
        if reference.len() != instrumental.len() {
            return Err(PhotocalError::InvalidInput(format!(
                "{} reference magnitudes for {} instrumental magnitudes",
                reference.len(),
                instrumental.len()
            )));
        }

        let mut order: Vec<usize> = (0..instrumental.len()).collect();
        order.sort_by(|&a, &b| {
            instrumental[a]
                .partial_cmp(&instrumental[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let sorted_mags: Vec<f64> = order.iter().map(|&i| instrumental[i]).collect();
        let offsets: Vec<f64> = order.iter().map(|&i| reference[i] - instrumental[i]).collect();
        let smoothed_offsets = adaptive_median_filter(&sorted_mags, &offsets);

        let samples = Samples::new(&sorted_mags, &smoothed_offsets);
        if samples.len() < NUM_PARAMS {
            return Err(PhotocalError::DegenerateFit(format!(
                "{} samples for {} parameters",
                samples.len(),
                NUM_PARAMS
            )));
        }

        let basis = Basis::spanning(&samples.mags);
        let seed_cost = samples.cost(|m| seed.eval(m));
        debug!(
            "Fitting correction curve to {} stars ({:.2} .. {:.2} mag), seed p0={:.4} cost={:.3e}",
            samples.len(),
            samples.mags.first().copied().unwrap_or(f64::NAN),
            samples.mags.last().copied().unwrap_or(f64::NAN),
            seed.params[0],
            seed_cost
        );

        let (start, start_cost) = starting_curve(&samples, basis, &seed);
        if !start_cost.is_finite() {
            return Err(PhotocalError::DegenerateFit("no finite starting curve".into()));
        }

        let (polished, iterations, converged) = levenberg_marquardt(&samples, start, &self.lm)?;
        let mut curve = polished.to_curve();
        let mut cost = samples.cost(|m| curve.eval(m));
        if seed_cost.is_finite() && (!curve.is_finite() || cost.is_nan() || cost > seed_cost) {
            debug!("Fitted cost {:.3e} above the seed's {:.3e}; keeping the seed", cost, seed_cost);
            curve = seed;
            cost = seed_cost;
        }
        if !curve.is_finite() || !cost.is_finite() {
            return Err(PhotocalError::DegenerateFit("non-finite fit parameters".into()));
        }

        debug!(
            "LM finished after {} iterations, cost={:.3e} (start {:.3e}), converged={}",
            iterations, cost, start_cost, converged
        );

        Ok(CurveFit {
            curve,
            iterations,
            cost,
            converged,
            sorted_mags,
            smoothed_offsets,
        })
    }
}

// ── Fit samples ─────────────────────────────────────────────────────────────

/// Fit magnitudes, their targets `m + smoothed offset` and residual weights `1 / (m − 8)²`.
struct Samples {
    mags: Vec<f64>,
    targets: Vec<f64>,
    weights: Vec<f64>,
}

impl Samples {
    /// A star exactly at the pivot would carry infinite weight and is dropped.
    fn new(sorted_mags: &[f64], smoothed_offsets: &[f64]) -> Self {
        let mut samples = Self {
            mags: Vec::with_capacity(sorted_mags.len()),
            targets: Vec::with_capacity(sorted_mags.len()),
            weights: Vec::with_capacity(sorted_mags.len()),
        };
        for (&m, &offset) in sorted_mags.iter().zip(smoothed_offsets) {
            let d = m - WEIGHT_PIVOT_MAG;
            if d.abs() > 1e-6 {
                samples.mags.push(m);
                samples.targets.push(m + offset);
                samples.weights.push(1.0 / (d * d));
            }
        }
        samples
    }

    fn len(&self) -> usize {
        self.mags.len()
    }

    fn residuals(&self, eval: impl Fn(f64) -> f64) -> DVector<f64> {
        DVector::from_iterator(
            self.len(),
            self.mags
                .iter()
                .zip(&self.targets)
                .zip(&self.weights)
                .map(|((&m, &t), &w)| (t - eval(m)) * w),
        )
    }

    fn cost(&self, eval: impl Fn(f64) -> f64) -> f64 {
        self.residuals(eval).norm_squared()
    }
}

// ── Centred parameterization ────────────────────────────────────────────────

/// Affine map `u = (m − center) / scale` taking the fit magnitudes onto `[-1, 1]`.
#[derive(Debug, Clone, Copy)]
struct Basis {
    center: f64,
    scale: f64,
}

impl Basis {
    fn spanning(sorted_mags: &[f64]) -> Self {
        let lo = sorted_mags.first().copied().unwrap_or(0.0);
        let hi = sorted_mags.last().copied().unwrap_or(0.0);
        let half = 0.5 * (hi - lo);
        Self {
            center: 0.5 * (lo + hi),
            scale: if half > 1e-6 { half } else { 1.0 },
        }
    }

    fn u(&self, m: f64) -> f64 {
        (m - self.center) / self.scale
    }
}

/// Parameter slot of the coefficient of `m^k` (or `u^k`).
fn poly_index(k: usize) -> usize {
    if k == 0 {
        0
    } else {
        3 + k
    }
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// The correction curve with its polynomial part in powers of `u`:
/// `q0 + p1·log10(10^(p2·(m − p3)) + 1) + q1·u + q2·u² + q3·u³ + q4·u⁴`,
/// stored in the same slots as [`CalibrationCurve::params`].
#[derive(Debug, Clone, Copy)]
struct ScaledCurve {
    basis: Basis,
    params: [f64; NUM_PARAMS],
}

impl ScaledCurve {
    fn from_curve(basis: Basis, curve: &CalibrationCurve) -> Self {
        let mut params = curve.params;
        for k in 0..=POLY_DEGREE {
            let q: f64 = (k..=POLY_DEGREE)
                .map(|j| curve.params[poly_index(j)] * binomial(j, k) * basis.center.powi((j - k) as i32))
                .sum();
            params[poly_index(k)] = q * basis.scale.powi(k as i32);
        }
        Self { basis, params }
    }

    fn to_curve(&self) -> CalibrationCurve {
        let Basis { center, scale } = self.basis;
        let mut params = self.params;
        for j in 0..=POLY_DEGREE {
            params[poly_index(j)] = (j..=POLY_DEGREE)
                .map(|k| self.params[poly_index(k)] * binomial(k, j) * (-center).powi((k - j) as i32) / scale.powi(k as i32))
                .sum();
        }
        CalibrationCurve::new(params)
    }

    fn eval(&self, m: f64) -> f64 {
        let p = &self.params;
        let u = self.basis.u(m);
        p[0] + p[1] * log10_one_plus_pow10(p[2] * (m - p[3])) + u * (p[4] + u * (p[5] + u * (p[6] + u * p[7])))
    }

    fn gradient(&self, m: f64) -> [f64; NUM_PARAMS] {
        let p = &self.params;
        let u = self.basis.u(m);
        let t = p[2] * (m - p[3]);
        let s = pow10_logistic(t);
        let u2 = u * u;
        [
            1.0,
            log10_one_plus_pow10(t),
            p[1] * s * (m - p[3]),
            -p[1] * s * p[2],
            u,
            u2,
            u2 * u,
            u2 * u2,
        ]
    }

    fn is_finite(&self) -> bool {
        self.params.iter().all(|p| p.is_finite())
    }
}

// ── Starting curve ──────────────────────────────────────────────────────────

/// Scale every column to unit norm and return the norms. All-zero columns keep scale 1.
fn normalize_columns(matrix: &mut DMatrix<f64>) -> Vec<f64> {
    (0..matrix.ncols())
        .map(|col| {
            let norm = matrix.column(col).norm();
            if norm > 1e-300 {
                matrix.column_mut(col).scale_mut(1.0 / norm);
                norm
            } else {
                1.0
            }
        })
        .collect()
}

/// Exact weighted least squares for the linear parameters with the log-term
/// shape frozen at `(slope, knee)`, or with no log term when `shape` is `None`.
fn solve_linear(samples: &Samples, basis: Basis, shape: Option<(f64, f64)>) -> Option<ScaledCurve> {
    let n = samples.len();
    let ncols = POLY_DEGREE + 1 + usize::from(shape.is_some());
    let mut design = DMatrix::<f64>::zeros(n, ncols);
    let mut rhs = DVector::<f64>::zeros(n);

    for (row, ((&m, &t), &w)) in samples
        .mags
        .iter()
        .zip(&samples.targets)
        .zip(&samples.weights)
        .enumerate()
    {
        let u = basis.u(m);
        let mut power = 1.0;
        for k in 0..=POLY_DEGREE {
            design[(row, k)] = w * power;
            power *= u;
        }
        if let Some((slope, knee)) = shape {
            design[(row, POLY_DEGREE + 1)] = w * log10_one_plus_pow10(slope * (m - knee));
        }
        rhs[row] = w * t;
    }

    let scale = normalize_columns(&mut design);
    let coef = design.svd(true, true).solve(&rhs, SVD_EPS).ok()?;

    let mut params = [0.0; NUM_PARAMS];
    for k in 0..=POLY_DEGREE {
        params[poly_index(k)] = coef[k] / scale[k];
    }
    if let Some((slope, knee)) = shape {
        params[1] = coef[POLY_DEGREE + 1] / scale[POLY_DEGREE + 1];
        params[2] = slope;
        params[3] = knee;
    }
    let curve = ScaledCurve { basis, params };
    curve.is_finite().then_some(curve)
}

/// The cheapest of the seed, the best pure polynomial and the best curve on the
/// log-term shape grid, with its cost.
fn starting_curve(samples: &Samples, basis: Basis, seed: &CalibrationCurve) -> (ScaledCurve, f64) {
    let last = samples.len() - 1;
    let knees: Vec<f64> = SHAPE_KNEE_QUANTILES
        .iter()
        .map(|q| samples.mags[(last as f64 * q).round() as usize])
        .collect();
    let shapes = std::iter::once(None).chain(
        SHAPE_SLOPES
            .iter()
            .flat_map(|&slope| knees.iter().map(move |&knee| Some((slope, knee)))),
    );

    let mut best = ScaledCurve::from_curve(basis, seed);
    let mut best_cost = samples.cost(|m| best.eval(m));
    if !best.is_finite() || best_cost.is_nan() {
        best_cost = f64::INFINITY;
    }

    for shape in shapes {
        let Some(candidate) = solve_linear(samples, basis, shape) else {
            continue;
        };
        let cost = samples.cost(|m| candidate.eval(m));
        if cost < best_cost {
            best = candidate;
            best_cost = cost;
        }
    }
    (best, best_cost)
}

// ── Levenberg–Marquardt ─────────────────────────────────────────────────────

/// Jacobian of the residual vector with respect to the scaled parameters.
fn jacobian(samples: &Samples, curve: &ScaledCurve) -> DMatrix<f64> {
    let mut jac = DMatrix::<f64>::zeros(samples.len(), NUM_PARAMS);
    for (row, (&m, &w)) in samples.mags.iter().zip(&samples.weights).enumerate() {
        for (col, gk) in curve.gradient(m).iter().enumerate() {
            jac[(row, col)] = -gk * w;
        }
    }
    jac
}

fn levenberg_marquardt(samples: &Samples, start: ScaledCurve, cfg: &LmConfig) -> Result<(ScaledCurve, u32, bool)> {
    let mut curve = start;
    let mut r = samples.residuals(|m| curve.eval(m));
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(PhotocalError::DegenerateFit("non-finite initial residuals".into()));
    }

    let mut lambda = cfg.initial_lambda;
    let mut iterations = 0u32;
    let mut converged = false;

    while iterations < cfg.max_iterations {
        if cost == 0.0 {
            converged = true;
            break;
        }
        iterations += 1;

        // Jacobi scaling. All-zero columns (p2/p3 while p1 = 0) stay inactive for this step.
        let mut jac = jacobian(samples, &curve);
        let scale = normalize_columns(&mut jac);

        let jt = jac.transpose();
        let mut a = &jt * &jac;
        for k in 0..NUM_PARAMS {
            a[(k, k)] += lambda;
        }
        let g = -(&jt * &r);

        let step_scaled = a
            .svd(true, true)
            .solve(&g, 1e-12)
            .map_err(|e| PhotocalError::DegenerateFit(e.to_string()))?;

        let mut trial = curve;
        let mut step_norm = 0.0;
        for k in 0..NUM_PARAMS {
            let dk = step_scaled[k] / scale[k];
            trial.params[k] += dk;
            step_norm += dk * dk;
        }
        let step_norm = step_norm.sqrt();

        let r_trial = samples.residuals(|m| trial.eval(m));
        let cost_trial = r_trial.norm_squared();

        if trial.is_finite() && cost_trial.is_finite() && cost_trial < cost {
            let decrease = cost - cost_trial;
            let param_norm = curve.params.iter().map(|p| p * p).sum::<f64>().sqrt();
            curve = trial;
            r = r_trial;
            cost = cost_trial;
            lambda = (lambda / 10.0).max(1e-12);

            if decrease <= cfg.ftol * cost || step_norm <= cfg.xtol * (param_norm + cfg.xtol) {
                converged = true;
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e16 {
                // No downhill step left at any damping: at a minimum.
                converged = true;
                break;
            }
        }
    }

    Ok((curve, iterations, converged))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Weighted cost of `curve` against the targets the fitter actually used.
    fn cost_of(fit: &CurveFit, curve: &CalibrationCurve) -> f64 {
        Samples::new(&fit.sorted_mags, &fit.smoothed_offsets).cost(|m| curve.eval(m))
    }

    /// 150 stars over 10..18 mag with a deterministic ±`amplitude` jitter.
    fn jittered(zero_point: f64, amplitude: f64) -> (Vec<f64>, Vec<f64>) {
        let instrumental: Vec<f64> = (0..150).map(|i| 10.0 + 8.0 * i as f64 / 149.0).collect();
        let reference = instrumental
            .iter()
            .enumerate()
            .map(|(i, m)| m + zero_point + amplitude * (i as f64 * 12.9898).sin())
            .collect();
        (reference, instrumental)
    }

    #[test]
    fn recovers_constant_offset() {
        let instrumental: Vec<f64> = (0..25).map(|i| 9.0 + i as f64 * 0.3).collect();
        let reference: Vec<f64> = instrumental.iter().map(|m| m + 2.5).collect();
        let fit = RobustCurveFitter::default()
            .fit(&reference, &instrumental, CalibrationCurve::constant(2.5))
            .unwrap();
        for (&m, &r) in instrumental.iter().zip(&reference) {
            assert!((fit.curve.eval(m) - r).abs() < 1e-3, "m={m}");
        }
    }

    #[test]
    fn recovers_quadratic_trend() {
        let instrumental: Vec<f64> = (0..30).map(|i| 9.0 + i as f64 * 0.25).collect();
        let reference: Vec<f64> = instrumental
            .iter()
            .map(|m| 1.0 + 1.02 * m + 0.003 * (m - 12.0) * (m - 12.0))
            .collect();
        let fit = RobustCurveFitter::default()
            .fit(&reference, &instrumental, CalibrationCurve::constant(1.0))
            .unwrap();
        // Median filtering of a smooth trend is exact away from the padded ends
        for (&m, &r) in instrumental.iter().zip(&reference).skip(3).take(20) {
            assert!((fit.curve.eval(m) - r).abs() < 0.02, "m={m}");
        }
    }

    #[test]
    fn outlier_is_suppressed() {
        let instrumental: Vec<f64> = (0..25).map(|i| 10.0 + i as f64 * 0.2).collect();
        let mut reference: Vec<f64> = instrumental.iter().map(|m| m + 2.5).collect();
        reference[12] += 1.5;
        let fit = RobustCurveFitter::default()
            .fit(&reference, &instrumental, CalibrationCurve::constant(2.5))
            .unwrap();
        assert!((fit.curve.eval(instrumental[12]) - (instrumental[12] + 2.5)).abs() < 0.01);
    }

    #[test]
    fn cost_never_exceeds_the_true_curve() {
        for zero_point in [2.5, -1.0] {
            let (reference, instrumental) = jittered(zero_point, 0.03);
            let fit = RobustCurveFitter::default()
                .fit(&reference, &instrumental, CalibrationCurve::offset(zero_point))
                .unwrap();
            let truth = CalibrationCurve::offset(zero_point);
            let truth_cost = cost_of(&fit, &truth);
            assert!(
                fit.cost <= truth_cost * (1.0 + 1e-9),
                "zp {zero_point}: cost {:e} above the true curve's {:e}",
                fit.cost,
                truth_cost
            );
            let worst = instrumental
                .iter()
                .map(|&m| (fit.curve.eval(m) - truth.eval(m)).abs())
                .fold(0.0, f64::max);
            assert!(worst < 0.1, "zp {zero_point}: worst residual {worst}");
        }
    }

    #[test]
    fn wild_seed_is_not_trusted() {
        let (reference, instrumental) = jittered(2.5, 0.0);
        let seed = CalibrationCurve::new([40.0, 3.0, 5.0, 12.0, -2.0, 0.1, 0.01, -1e-3]);
        let fit = RobustCurveFitter::default().fit(&reference, &instrumental, seed).unwrap();
        assert!(fit.cost <= cost_of(&fit, &seed));
        for &m in &instrumental {
            assert!((fit.curve.eval(m) - (m + 2.5)).abs() < 1e-3, "m={m}");
        }
    }

    #[test]
    fn never_worse_than_the_seed() {
        let (reference, instrumental) = jittered(0.7, 0.05);
        let seed = CalibrationCurve::offset(0.7);
        let fit = RobustCurveFitter::default().fit(&reference, &instrumental, seed).unwrap();
        assert!(fit.cost <= cost_of(&fit, &seed));
    }

    #[test]
    fn iteration_cap_is_reported() {
        let (reference, instrumental) = jittered(2.5, 0.03);
        let lm = LmConfig {
            max_iterations: 0,
            ..Default::default()
        };
        let fit = RobustCurveFitter::new(lm)
            .fit(&reference, &instrumental, CalibrationCurve::offset(2.5))
            .unwrap();
        assert!(!fit.converged);
        assert_eq!(fit.iterations, 0);
        // The exact linear starting solve is kept
        assert!(fit.cost <= cost_of(&fit, &CalibrationCurve::offset(2.5)));
    }

    #[test]
    fn default_fit_converges() {
        let (reference, instrumental) = jittered(2.5, 0.03);
        let fit = RobustCurveFitter::default()
            .fit(&reference, &instrumental, CalibrationCurve::offset(2.5))
            .unwrap();
        assert!(fit.converged);
    }

    #[test]
    fn centred_parameters_round_trip() {
        let basis = Basis::spanning(&[10.0, 18.0]);
        let curve = CalibrationCurve::new([0.3, 0.7, 0.4, 12.0, 0.9, 0.01, -0.001, 1e-5]);
        let scaled = ScaledCurve::from_curve(basis, &curve);
        for m in [10.0, 12.5, 15.0, 18.0] {
            assert!((scaled.eval(m) - curve.eval(m)).abs() < 1e-9, "m={m}");
        }
        let back = scaled.to_curve();
        for (a, b) in back.params.iter().zip(&curve.params) {
            assert!((a - b).abs() < 1e-9 * b.abs().max(1.0));
        }
    }

    #[test]
    fn too_few_samples_is_degenerate() {
        let err = RobustCurveFitter::default()
            .fit(&[12.0, 13.0], &[10.0, 11.0], CalibrationCurve::constant(2.0))
            .unwrap_err();
        assert!(matches!(err, PhotocalError::DegenerateFit(_)));
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let err = RobustCurveFitter::default()
            .fit(&[12.0], &[], CalibrationCurve::constant(0.0))
            .unwrap_err();
        assert!(matches!(err, PhotocalError::InvalidInput(_)));
    }
}
