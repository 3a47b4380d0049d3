//! The instrumental-to-reference magnitude correction curve.
//!
//! ```text
//! z(m) = p0 + p1·log10(10^(p2·(m − p3)) + 1) + p4·m + p5·m² + p6·m³ + p7·m⁴
//! ```
//!
//! The softplus-like log term models the non-linear response at the bright end
//! and the quartic absorbs the slow color/airmass trend across the field.

use std::f64::consts::LN_10;

pub const NUM_PARAMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationCurve {
    pub params: [f64; NUM_PARAMS],
}

/// `log10(10^t + 1)` without overflow for large `t`.
pub(crate) fn log10_one_plus_pow10(t: f64) -> f64 {
    if t > 0.0 {
        t + (10f64.powf(-t)).ln_1p() / LN_10
    } else {
        (10f64.powf(t)).ln_1p() / LN_10
    }
}

/// `10^t / (10^t + 1)`, the derivative of [`log10_one_plus_pow10`].
pub(crate) fn pow10_logistic(t: f64) -> f64 {
    if t > 0.0 {
        1.0 / (1.0 + 10f64.powf(-t))
    } else {
        let u = 10f64.powf(t);
        u / (u + 1.0)
    }
}

impl CalibrationCurve {
    pub fn new(params: [f64; NUM_PARAMS]) -> Self {
        Self { params }
    }

    /// Curve with every parameter zero except the constant term.
    pub fn constant(offset: f64) -> Self {
        let mut params = [0.0; NUM_PARAMS];
        params[0] = offset;
        Self { params }
    }

    /// `z(m) = m + offset`: the identity response shifted by a zero point.
    pub fn offset(offset: f64) -> Self {
        let mut params = [0.0; NUM_PARAMS];
        params[0] = offset;
        params[4] = 1.0;
        Self { params }
    }

    pub fn eval(&self, m: f64) -> f64 {
        let p = &self.params;
        let t = p[2] * (m - p[3]);
        let m2 = m * m;
        p[0] + p[1] * log10_one_plus_pow10(t) + p[4] * m + p[5] * m2 + p[6] * m2 * m + p[7] * m2 * m2
    }

    /// Partial derivatives of `eval(m)` with respect to each parameter.
    pub fn gradient(&self, m: f64) -> [f64; NUM_PARAMS] {
        let p = &self.params;
        let t = p[2] * (m - p[3]);
        let s = pow10_logistic(t);
        let m2 = m * m;
        [
            1.0,
            log10_one_plus_pow10(t),
            p[1] * s * (m - p[3]),
            -p[1] * s * p[2],
            m,
            m2,
            m2 * m,
            m2 * m2,
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.params.iter().all(|p| p.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_curve() {
        let c = CalibrationCurve::constant(2.5);
        // p1 = 0 kills the log term
        assert!((c.eval(12.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn linear_identity_plus_offset() {
        let c = CalibrationCurve::new([2.5, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]);
        assert!((c.eval(13.0) - 15.5).abs() < 1e-12);
        assert_eq!(CalibrationCurve::offset(2.5), c);
    }

    #[test]
    fn log_term_is_stable() {
        let c = CalibrationCurve::new([0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        // For large t, log10(10^t + 1) -> t
        assert!((c.eval(400.0) - 400.0).abs() < 1e-9);
        assert!(c.eval(-400.0).abs() < 1e-9);
        assert!((c.eval(0.0) - 2f64.log10()).abs() < 1e-12);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let c = CalibrationCurve::new([0.3, 0.7, 0.4, 12.0, 0.9, 0.01, -0.001, 1e-5]);
        let m = 13.7;
        let g = c.gradient(m);
        for k in 0..NUM_PARAMS {
            let h = 1e-6 * c.params[k].abs().max(1.0);
            let mut up = c;
            let mut dn = c;
            up.params[k] += h;
            dn.params[k] -= h;
            let fd = (up.eval(m) - dn.eval(m)) / (2.0 * h);
            assert!(
                (fd - g[k]).abs() < 1e-4 * g[k].abs().max(1.0),
                "param {k}: analytic {} vs numeric {}",
                g[k],
                fd
            );
        }
    }
}
