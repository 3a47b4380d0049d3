//! Error types for calibration and cross-epoch matching.
//!
//! Every failure mode that the engines can hit is a variant of [`PhotocalError`].
//! None of them are fatal to a processing pipeline: the engines catch them at
//! their boundary and report a [`RunStatus`] + reason (see
//! [`CalibrationOutcome`](crate::calibration::CalibrationOutcome) and
//! [`ClusterOutcome`](crate::cluster::ClusterOutcome)), so a caller can retry a
//! failed exposure with manual magnitude limits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhotocalError {
    /// Missing or malformed catalog rows, non-numeric fields, unusable geometry.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Sky matching produced zero usable pairs.
    #[error("no stars in the photometry catalog matched the reference catalog; check the target region")]
    NoMatch,

    /// The fit sample is too small to constrain the correction curve.
    #[error("not enough stars to calibrate ({stars_used} usable, need more than {required})")]
    InsufficientStars { stars_used: usize, required: usize },

    /// Least squares diverged or produced non-finite parameters.
    #[error("correction curve fit failed: {0}")]
    DegenerateFit(String),

    /// A light-curve query found no calibrated detections.
    #[error("no stars found")]
    EmptyClusterPool,

    #[error("catalog parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PhotocalError {
    /// Short reason string surfaced verbatim to the end user.
    ///
    /// Fit residuals and other numeric diagnostics are not included.
    pub fn reason(&self) -> String {
        match self {
            PhotocalError::InsufficientStars { .. } => "not enough stars to calibrate".to_string(),
            PhotocalError::DegenerateFit(_) => {
                "the calibration curve could not be fitted; try manual magnitude limits".to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PhotocalError>;

/// Status of a calibration or clustering run at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Produced a result, but it looks suspicious: large uncertainties or an
    /// unconverged curve fit.
    Warning,
    /// Nothing was produced.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stars_reason_is_stable() {
        let err = PhotocalError::InsufficientStars {
            stars_used: 5,
            required: 10,
        };
        assert_eq!(err.reason(), "not enough stars to calibrate");
        assert!(err.to_string().contains("5 usable"));
    }

    #[test]
    fn empty_pool_reason() {
        assert_eq!(PhotocalError::EmptyClusterPool.reason(), "no stars found");
    }
}
