//! Per-exposure photometric calibration.
//!
//! [`CalibrationEngine`] cross-matches an exposure's detections against a
//! reference catalog, fits the instrumental-to-reference correction curve on
//! the clean matches, and then flags and assigns an uncertainty to every
//! detection in the exposure.
//!
//! ```no_run
//! use photocal::{CalibrationConfig, CalibrationEngine, MagnitudeLimits};
//! # fn demo(reference: &photocal::ReferenceCatalog, exposure: &photocal::Exposure) {
//! let engine = CalibrationEngine::new(CalibrationConfig {
//!     pos_offset_arcsec: 2.0,
//!     ..Default::default()
//! });
//! let outcome = engine.run(reference, exposure, MagnitudeLimits::default());
//! if !outcome.success() {
//!     println!("calibration failed: {}", outcome.message);
//! }
//! # }
//! ```

pub mod curve;
pub mod fit;
pub mod flags;
pub mod uncertainty;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detection::{normalize_detections, Detection, Exposure, ReferenceCatalog};
use crate::error::{PhotocalError, Result, RunStatus};
use crate::skymatch::{SkyMatch, SkyMatcher, SkyPosition};
use crate::stats::{median, MagnitudeHistogram};

pub use curve::{CalibrationCurve, NUM_PARAMS};
pub use fit::{CurveFit, LmConfig, RobustCurveFitter};
pub use flags::{FlagPropagator, MagnitudeClass, FLAG_OTHER, FLAG_TOO_BRIGHT, FLAG_TOO_FAINT};
pub use uncertainty::{ScatterSample, UncertaintyEstimator, UncertaintyTrim};

/// Widening applied to the clean-magnitude range when recomputing from stored parameters.
const RECOMPUTE_RANGE_EPS: f64 = 1e-12;

/// Magnitudes below this are treated as extractor garbage when choosing `min_use`.
const MIN_PLAUSIBLE_MAG: f64 = -50.0;

// ── Configuration ───────────────────────────────────────────────────────────

/// Tunables for one calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Maximum reference/detection separation for a fit-sample match, in arcseconds.
    /// Default 3.0.
    pub pos_offset_arcsec: f64,
    /// Detections closer than this to any image border lose their photometry. Default 10 px.
    pub edge_dist_px: f64,
    /// Binning for the `max_use` and limiting-magnitude estimates. Default 0.25 mag over 0..20.
    pub histogram: MagnitudeHistogram,
    /// The fit needs strictly more than this many stars. Default 10.
    pub min_fit_stars: usize,
    /// When set, fit-sample stars must also satisfy
    /// `|ref − matched − median_offset| < offset_clip`. Default `None`.
    pub offset_clip: Option<f64>,
    /// Half-width of the local uncertainty window in magnitudes. Default 0.75.
    pub uncertainty_window_mag: f64,
    /// Second-pass trim of the uncertainty scatter. Default `RmsMultiple(4.0)`.
    pub uncertainty_trim: UncertaintyTrim,
    /// Mean estimated uncertainty (over every detection, unestimated ones counting
    /// as zero) above which a run is reported as a warning. Default 0.02 mag.
    pub warn_uncertainty: f64,
    /// Flags must be below this for a star to enter the sample when recomputing
    /// from stored parameters. Default 10.
    pub recompute_max_flag: i32,
    /// Cell size of the sky index used for matching. Default 10 arcsec.
    pub match_cell_arcsec: f64,
    pub lm: LmConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            pos_offset_arcsec: 3.0,
            edge_dist_px: 10.0,
            histogram: MagnitudeHistogram::default(),
            min_fit_stars: 10,
            offset_clip: None,
            uncertainty_window_mag: 0.75,
            uncertainty_trim: UncertaintyTrim::default(),
            warn_uncertainty: 0.02,
            recompute_max_flag: 10,
            match_cell_arcsec: 10.0,
            lm: LmConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Settings for narrow-band (H-alpha) exposures: matches more than 0.75 mag
    /// from the median offset are left out of the fit.
    pub fn narrow_band() -> Self {
        Self {
            offset_clip: Some(0.75),
            ..Default::default()
        }
    }
}

/// Optional manual overrides of the usable instrumental-magnitude range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MagnitudeLimits {
    pub min_use: Option<f64>,
    pub max_use: Option<f64>,
}

impl MagnitudeLimits {
    pub fn new(min_use: f64, max_use: f64) -> Self {
        Self {
            min_use: Some(min_use),
            max_use: Some(max_use),
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────────────

/// Summary of one exposure's calibration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub fit_parameters: [f64; NUM_PARAMS],
    /// Brightest instrumental magnitude in the fit sample.
    pub usable_magnitude_min: f64,
    /// Faintest instrumental magnitude in the fit sample.
    pub usable_magnitude_max: f64,
    pub stars_used: u32,
    /// Median `reference − instrumental` over the fit sample; the fit seed.
    pub median_offset: f64,
    /// Mode of the calibrated magnitudes of unflagged detections.
    pub limiting_magnitude: Option<f64>,
}

impl CalibrationResult {
    pub fn curve(&self) -> CalibrationCurve {
        CalibrationCurve::new(self.fit_parameters)
    }
}

/// One detection after calibration. `None` fields are never written as 0 or -99.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CalibratedDetection {
    pub source_entry_id: u64,
    pub calibrated_magnitude: Option<f64>,
    pub calibrated_error: Option<f64>,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub fwhm_deg: f64,
    pub x: f64,
    pub y: f64,
    /// Raw extractor flags with the calibration bits OR-ed in.
    pub flags: i32,
    pub raw_magnitude: Option<f64>,
    pub raw_error: Option<f64>,
    pub near_edge: bool,
}

impl CalibratedDetection {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }
}

/// A successful calibration: the summary plus every detection of the exposure.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub result: CalibrationResult,
    pub detections: Vec<CalibratedDetection>,
    /// Sum of the estimated uncertainties divided by the number of detections.
    /// Detections without an estimate count as zero. `None` for an empty exposure.
    pub mean_uncertainty: Option<f64>,
    /// `false` if the curve fit stopped at its iteration cap. Always `true` when
    /// recomputing from stored parameters.
    pub fit_converged: bool,
}

/// Status + human-readable reason + calibration (absent on failure).
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub status: RunStatus,
    pub message: String,
    pub calibration: Option<Calibration>,
}

impl CalibrationOutcome {
    pub(crate) fn failure(err: &PhotocalError) -> Self {
        Self {
            status: RunStatus::Failed,
            message: err.reason(),
            calibration: None,
        }
    }

    /// `true` unless the run failed. Warnings still count as success.
    pub fn success(&self) -> bool {
        self.status != RunStatus::Failed
    }
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// A matched reference/detection pair that passed the fit-sample cuts.
#[derive(Debug, Clone, Copy)]
struct FitPair {
    reference_mag: f64,
    matched_mag: f64,
}

/// Matches, fits, flags and estimates uncertainties for one exposure at a time.
///
/// Holds only configuration; a single engine can be shared across worker threads.
#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    pub config: CalibrationConfig,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Calibrate `exposure` against `reference`. Never panics on bad data; every
    /// failure is reported through the outcome status and message.
    pub fn run(
        &self,
        reference: &ReferenceCatalog,
        exposure: &Exposure,
        limits: MagnitudeLimits,
    ) -> CalibrationOutcome {
        self.outcome(self.try_run(reference, exposure, limits))
    }

    /// Same as [`run`](Self::run) but returning the typed error.
    pub fn try_run(
        &self,
        reference: &ReferenceCatalog,
        exposure: &Exposure,
        limits: MagnitudeLimits,
    ) -> Result<Calibration> {
        validate_exposure(exposure)?;
        let cfg = &self.config;

        let ref_stars = reference.normalized();
        let detections = normalize_detections(&exposure.entries, &exposure.geometry, cfg.edge_dist_px);

        let max_use = match limits.max_use {
            Some(m) => m,
            None => {
                let mags: Vec<f64> = detections.iter().filter_map(|d| d.mag).collect();
                cfg.histogram.mode_center(&mags).ok_or(PhotocalError::NoMatch)?
            }
        };
        let min_use = match limits.min_use {
            Some(m) => m,
            None => detections
                .iter()
                .filter_map(|d| d.clean_mag())
                .filter(|&m| m > MIN_PLAUSIBLE_MAG)
                .min_by(f64::total_cmp)
                .ok_or(PhotocalError::NoMatch)?,
        };
        debug!("Magnitude range for fit sample: {:.3} < m < {:.3}", min_use, max_use);

        let matches = self.match_catalogs(&ref_stars, &detections);
        let (sample, median_offset) =
            self.select_fit_sample(&ref_stars, &detections, &matches, min_use, max_use, |flags| flags == 0)?;

        let stars_used = sample.len();
        if stars_used <= cfg.min_fit_stars {
            return Err(PhotocalError::InsufficientStars {
                stars_used,
                required: cfg.min_fit_stars,
            });
        }

        let reference_mags: Vec<f64> = sample.iter().map(|p| p.reference_mag).collect();
        let matched_mags: Vec<f64> = sample.iter().map(|p| p.matched_mag).collect();
        let fit = RobustCurveFitter::new(cfg.lm.clone()).fit(
            &reference_mags,
            &matched_mags,
            CalibrationCurve::offset(median_offset),
        )?;

        let calibration = self.apply_curve(&fit.curve, fit.converged, &detections, &sample, median_offset);
        info!(
            "Calibrated {} detections using {} stars: median offset {:.4}, limiting magnitude {:?}",
            calibration.detections.len(),
            stars_used,
            median_offset,
            calibration.result.limiting_magnitude
        );
        Ok(calibration)
    }

    /// Re-derive flags and uncertainties for an exposure from previously fitted
    /// curve parameters, without refitting.
    ///
    /// The usable range is taken from the clean detections themselves and the
    /// sample admits stars with flags below
    /// [`recompute_max_flag`](CalibrationConfig::recompute_max_flag).
    pub fn recompute_uncertainties(
        &self,
        reference: &ReferenceCatalog,
        exposure: &Exposure,
        fit_parameters: [f64; NUM_PARAMS],
    ) -> CalibrationOutcome {
        self.outcome(self.try_recompute_uncertainties(reference, exposure, fit_parameters))
    }

    pub fn try_recompute_uncertainties(
        &self,
        reference: &ReferenceCatalog,
        exposure: &Exposure,
        fit_parameters: [f64; NUM_PARAMS],
    ) -> Result<Calibration> {
        validate_exposure(exposure)?;
        let curve = CalibrationCurve::new(fit_parameters);
        if !curve.is_finite() {
            return Err(PhotocalError::InvalidInput("non-finite fit parameters".into()));
        }
        let cfg = &self.config;

        let ref_stars = reference.normalized();
        let detections = normalize_detections(&exposure.entries, &exposure.geometry, cfg.edge_dist_px);

        let clean: Vec<f64> = detections.iter().filter_map(|d| d.clean_mag()).collect();
        let min_use = clean.iter().copied().min_by(f64::total_cmp).ok_or(PhotocalError::NoMatch)?
            - RECOMPUTE_RANGE_EPS;
        let max_use = clean.iter().copied().max_by(f64::total_cmp).ok_or(PhotocalError::NoMatch)?
            + RECOMPUTE_RANGE_EPS;

        let matches = self.match_catalogs(&ref_stars, &detections);
        let max_flag = cfg.recompute_max_flag;
        let (sample, median_offset) = self.select_fit_sample(
            &ref_stars,
            &detections,
            &matches,
            min_use,
            max_use,
            |flags| flags < max_flag,
        )?;

        let calibration = self.apply_curve(&curve, true, &detections, &sample, median_offset);
        info!(
            "Recomputed uncertainties for {} detections from {} stars",
            calibration.detections.len(),
            sample.len()
        );
        Ok(calibration)
    }

    fn outcome(&self, result: Result<Calibration>) -> CalibrationOutcome {
        match result {
            Ok(calibration) => {
                let stars = calibration.result.stars_used;
                if !calibration.fit_converged {
                    warn!(
                        "Correction curve fit hit {} iterations without converging",
                        self.config.lm.max_iterations
                    );
                    return CalibrationOutcome {
                        status: RunStatus::Warning,
                        message: "correction curve fit did not converge".to_string(),
                        calibration: Some(calibration),
                    };
                }
                match calibration.mean_uncertainty {
                    Some(mean) if mean > self.config.warn_uncertainty => {
                        warn!(
                            "Mean calibrated uncertainty {:.4} mag exceeds {:.4}",
                            mean, self.config.warn_uncertainty
                        );
                        CalibrationOutcome {
                            status: RunStatus::Warning,
                            message: "uncertainty greater than expected; check the filter".to_string(),
                            calibration: Some(calibration),
                        }
                    }
                    _ => CalibrationOutcome {
                        status: RunStatus::Success,
                        message: format!("calibrated using {stars} stars"),
                        calibration: Some(calibration),
                    },
                }
            }
            Err(err) => {
                warn!("Calibration failed: {}", err);
                CalibrationOutcome::failure(&err)
            }
        }
    }

    fn match_catalogs(&self, ref_stars: &[Detection], detections: &[Detection]) -> Vec<Option<SkyMatch>> {
        let ref_pos: Vec<SkyPosition> = ref_stars.iter().map(|d| d.position).collect();
        let det_pos: Vec<SkyPosition> = detections.iter().map(|d| d.position).collect();
        SkyMatcher::new(self.config.match_cell_arcsec).match_nearest(&ref_pos, &det_pos)
    }

    /// Matched pairs passing the position, range and flag cuts, plus their
    /// median offset. The offset clip, if configured, is applied after the
    /// median is taken.
    fn select_fit_sample(
        &self,
        ref_stars: &[Detection],
        detections: &[Detection],
        matches: &[Option<SkyMatch>],
        min_use: f64,
        max_use: f64,
        accept_flags: impl Fn(i32) -> bool,
    ) -> Result<(Vec<FitPair>, f64)> {
        let cfg = &self.config;
        let mut sample: Vec<FitPair> = ref_stars
            .iter()
            .zip(matches)
            .filter_map(|(star, m)| {
                let m = m.as_ref()?;
                let det = &detections[m.index];
                let reference_mag = star.mag.filter(|_| accept_flags(star.flags))?;
                let matched_mag = det.mag.filter(|_| accept_flags(det.flags))?;
                (matched_mag > min_use && matched_mag < max_use && m.separation_arcsec < cfg.pos_offset_arcsec)
                    .then_some(FitPair {
                        reference_mag,
                        matched_mag,
                    })
            })
            .collect();

        let offsets: Vec<f64> = sample.iter().map(|p| p.reference_mag - p.matched_mag).collect();
        let median_offset = median(&offsets).ok_or(PhotocalError::NoMatch)?;

        if let Some(clip) = cfg.offset_clip {
            sample.retain(|p| (p.reference_mag - p.matched_mag - median_offset).abs() < clip);
            if sample.is_empty() {
                return Err(PhotocalError::NoMatch);
            }
        }

        debug!(
            "Fit sample: {} of {} reference stars, median offset {:.4}",
            sample.len(),
            ref_stars.len(),
            median_offset
        );
        Ok((sample, median_offset))
    }

    /// Calibrate, flag and attach uncertainties to every detection.
    fn apply_curve(
        &self,
        curve: &CalibrationCurve,
        fit_converged: bool,
        detections: &[Detection],
        sample: &[FitPair],
        median_offset: f64,
    ) -> Calibration {
        let cfg = &self.config;

        let usable_min = sample.iter().map(|p| p.matched_mag).fold(f64::INFINITY, f64::min);
        let usable_max = sample.iter().map(|p| p.matched_mag).fold(f64::NEG_INFINITY, f64::max);

        let propagator = FlagPropagator::new(curve, usable_min, usable_max);
        let estimator = UncertaintyEstimator::new(cfg.uncertainty_window_mag, cfg.uncertainty_trim);
        let scatter: Vec<ScatterSample> = sample
            .iter()
            .map(|p| ScatterSample {
                calibrated: curve.eval(p.matched_mag),
                reference: p.reference_mag,
            })
            .collect();

        let mut assigned = Vec::new();
        let calibrated: Vec<CalibratedDetection> = detections
            .iter()
            .map(|det| {
                let cal_mag = det.mag.map(|m| curve.eval(m)).filter(|c| c.is_finite());
                let flags = propagator.propagate(cal_mag, det.flags);
                let cal_err = match cal_mag {
                    Some(c) if propagator.strictly_inside(c) => {
                        let u = estimator.estimate(&scatter, c);
                        if let Some(u) = u {
                            assigned.push(u);
                        }
                        u
                    }
                    _ => det.mag_err,
                };
                CalibratedDetection {
                    source_entry_id: det.id,
                    calibrated_magnitude: cal_mag,
                    calibrated_error: cal_err,
                    ra_deg: det.position.ra_deg,
                    dec_deg: det.position.dec_deg,
                    fwhm_deg: det.fwhm_deg,
                    x: det.x,
                    y: det.y,
                    flags,
                    raw_magnitude: det.mag,
                    raw_error: det.mag_err,
                    near_edge: det.near_edge,
                }
            })
            .collect();

        let good: Vec<f64> = calibrated
            .iter()
            .filter(|d| d.flags == 0)
            .filter_map(|d| d.calibrated_magnitude)
            .collect();
        let limiting_magnitude = cfg.histogram.mode_center(&good);

        let mean_uncertainty = mean_over_detections(&assigned, calibrated.len());

        debug!(
            "Flagged {} bright, {} faint, {} other; {} uncertainties assigned",
            calibrated.iter().filter(|d| d.flags & FLAG_TOO_BRIGHT != 0).count(),
            calibrated.iter().filter(|d| d.flags & FLAG_TOO_FAINT != 0).count(),
            calibrated.iter().filter(|d| d.flags & FLAG_OTHER != 0).count(),
            assigned.len()
        );

        Calibration {
            result: CalibrationResult {
                fit_parameters: curve.params,
                usable_magnitude_min: usable_min,
                usable_magnitude_max: usable_max,
                stars_used: sample.len() as u32,
                median_offset,
                limiting_magnitude,
            },
            detections: calibrated,
            mean_uncertainty,
            fit_converged,
        }
    }
}

/// Mean of `assigned` over `n_detections` slots, the unassigned ones being zero.
fn mean_over_detections(assigned: &[f64], n_detections: usize) -> Option<f64> {
    (n_detections > 0).then(|| assigned.iter().sum::<f64>() / n_detections as f64)
}

fn validate_exposure(exposure: &Exposure) -> Result<()> {
    if exposure.geometry.naxis1 == 0 || exposure.geometry.naxis2 == 0 {
        return Err(PhotocalError::InvalidInput(format!(
            "image dimensions {}x{}",
            exposure.geometry.naxis1, exposure.geometry.naxis2
        )));
    }
    Ok(())
}
