//! Per-detection calibrated-magnitude uncertainty from the local scatter of the fit sample.
//!
//! For a detection of calibrated magnitude `c`, the window is every fit-sample
//! star whose calibrated magnitude lies strictly within `c ± window_mag`. The
//! scatter of `reference − calibrated` over the window is measured twice: once
//! over the whole window, and again after trimming members beyond a robust
//! threshold.

use crate::stats::{median, population_std};

/// Second-pass trim threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UncertaintyTrim {
    /// Keep `|diff| < k × first-pass scatter`.
    RmsMultiple(f64),
    /// Keep `|diff| < k × median(|diff|)`.
    MedianAbsMultiple(f64),
}

impl Default for UncertaintyTrim {
    fn default() -> Self {
        UncertaintyTrim::RmsMultiple(4.0)
    }
}

/// One fit-sample star as seen by the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScatterSample {
    /// Curve applied to the matched instrumental magnitude.
    pub calibrated: f64,
    /// Offset-corrected reference magnitude.
    pub reference: f64,
}

#[derive(Debug, Clone)]
pub struct UncertaintyEstimator {
    /// Half-width of the magnitude window. Default 0.75.
    pub window_mag: f64,
    pub trim: UncertaintyTrim,
}

impl Default for UncertaintyEstimator {
    fn default() -> Self {
        Self {
            window_mag: 0.75,
            trim: UncertaintyTrim::default(),
        }
    }
}

impl UncertaintyEstimator {
    pub fn new(window_mag: f64, trim: UncertaintyTrim) -> Self {
        Self { window_mag, trim }
    }

    /// Uncertainty for a detection with calibrated magnitude `calibrated`,
    /// or `None` when the window is empty or the scatter is undefined.
    pub fn estimate(&self, samples: &[ScatterSample], calibrated: f64) -> Option<f64> {
        let diffs: Vec<f64> = samples
            .iter()
            .filter(|s| s.calibrated > calibrated - self.window_mag && s.calibrated < calibrated + self.window_mag)
            .map(|s| s.reference - s.calibrated)
            .collect();
        if diffs.is_empty() {
            return None;
        }

        let threshold = match self.trim {
            UncertaintyTrim::RmsMultiple(k) => k * population_std(&diffs)?,
            UncertaintyTrim::MedianAbsMultiple(k) => {
                let abs: Vec<f64> = diffs.iter().map(|d| d.abs()).collect();
                k * median(&abs)?
            }
        };

        let trimmed: Vec<f64> = diffs.into_iter().filter(|d| d.abs() < threshold).collect();
        population_std(&trimmed).filter(|s| s.is_finite())
    }
}
