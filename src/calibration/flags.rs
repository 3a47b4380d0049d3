//! Calibration quality flags.
//!
//! Raw extractor flags are kept and three calibration bits are OR-ed on top:
//! [`FLAG_TOO_BRIGHT`], [`FLAG_TOO_FAINT`] and [`FLAG_OTHER`]. At most one of
//! the three is ever set on a detection.

use super::curve::CalibrationCurve;

/// Calibrated magnitude brighter than the curve at `min_use`.
pub const FLAG_TOO_BRIGHT: i32 = 256;
/// Calibrated magnitude fainter than the curve at `max_use`.
pub const FLAG_TOO_FAINT: i32 = 512;
/// Inside the calibrated range, but the extractor already flagged the detection.
pub const FLAG_OTHER: i32 = 1024;

pub const CALIBRATION_FLAGS: i32 = FLAG_TOO_BRIGHT | FLAG_TOO_FAINT | FLAG_OTHER;

/// Where a calibrated magnitude falls relative to the usable range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagnitudeClass {
    TooBright,
    TooFaint,
    /// Inside the range with clean raw flags.
    Usable,
    /// Inside the range but with non-zero raw flags.
    Flagged,
    /// No calibrated magnitude.
    Unmeasured,
}

impl MagnitudeClass {
    pub fn flag_bits(&self) -> i32 {
        match self {
            MagnitudeClass::TooBright => FLAG_TOO_BRIGHT,
            MagnitudeClass::TooFaint => FLAG_TOO_FAINT,
            MagnitudeClass::Flagged => FLAG_OTHER,
            MagnitudeClass::Usable | MagnitudeClass::Unmeasured => 0,
        }
    }
}

/// Routes calibrated detections into brightness classes and accumulates flag bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlagPropagator {
    /// Curve evaluated at `min_use`.
    pub threshold_bright: f64,
    /// Curve evaluated at `max_use`.
    pub threshold_faint: f64,
}

impl FlagPropagator {
    pub fn new(curve: &CalibrationCurve, min_use: f64, max_use: f64) -> Self {
        Self {
            threshold_bright: curve.eval(min_use),
            threshold_faint: curve.eval(max_use),
        }
    }

    pub fn classify(&self, calibrated: Option<f64>, raw_flags: i32) -> MagnitudeClass {
        let Some(c) = calibrated.filter(|c| c.is_finite()) else {
            return MagnitudeClass::Unmeasured;
        };
        if c < self.threshold_bright {
            MagnitudeClass::TooBright
        } else if c > self.threshold_faint {
            MagnitudeClass::TooFaint
        } else if raw_flags != 0 {
            MagnitudeClass::Flagged
        } else {
            MagnitudeClass::Usable
        }
    }

    /// `true` strictly between the two thresholds.
    pub fn strictly_inside(&self, calibrated: f64) -> bool {
        calibrated > self.threshold_bright && calibrated < self.threshold_faint
    }

    /// Raw flags with the calibration bit for this detection OR-ed in.
    pub fn propagate(&self, calibrated: Option<f64>, raw_flags: i32) -> i32 {
        raw_flags | self.classify(calibrated, raw_flags).flag_bits()
    }
}
