//! # photocal
//!
//! **Photometric calibration** of astronomical exposures and **cross-epoch star
//! matching** for light curves.
//!
//! Given the detection catalog an external source extractor produced for one
//! exposure, `photocal` cross-matches it against a trusted reference catalog,
//! fits a correction curve from instrumental to reference magnitudes, and
//! flags and assigns an uncertainty to every detection. Calibrated detections
//! collected over many exposures of the same region are then merged into
//! persistent star identities, one light curve per filter.
//!
//! ## Features
//!
//! - **Spherical matching**: nearest-neighbor and fixed-radius searches on the
//!   unit sphere through a sparse cell index, exact at the poles and across RA 0/360
//! - **Robust fitting**: magnitude-adaptive median filtering, exact linear solves
//!   over a centred magnitude basis, then a weighted Levenberg–Marquardt polish
//!   of an 8-parameter correction curve
//! - **Local uncertainties**: per-detection scatter of nearby fit stars with a
//!   second, outlier-trimmed pass
//! - **Explicit missing data**: extractor sentinels (`99`, `-99`) become `None`
//!   and are never fitted or written as numbers
//! - **Region queries**: light-curve lookups by position in FK5, ICRS or galactic
//!   coordinates, in degrees, arcminutes, arcseconds or radians
//! - **Zero-copy snapshots**: calibrated catalogs serialize with
//!   [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use photocal::{
//!     catalogs, CalibratedCatalog, CalibrationConfig, CalibrationEngine, ClusterQuery,
//!     EpochClusterer, Exposure, ImageGeometry, MagnitudeLimits, ReferenceCatalog,
//! };
//!
//! let reference = ReferenceCatalog::new(
//!     "V",
//!     0.0,
//!     catalogs::load_sextractor_catalog_from_file("data/cf_V.cat").unwrap(),
//! );
//! let exposure = Exposure::new(
//!     catalogs::load_sextractor_catalog_from_file("data/exposure_0001.cat").unwrap(),
//!     ImageGeometry::new(2048, 2048),
//! )
//! .with_metadata("V", 58849.123);
//!
//! let engine = CalibrationEngine::new(CalibrationConfig::default());
//! let outcome = engine.run(&reference, &exposure, MagnitudeLimits::default());
//! let Some(calibration) = outcome.calibration else {
//!     panic!("calibration failed: {}", outcome.message);
//! };
//! println!(
//!     "{} stars used, median offset {:.3}",
//!     calibration.result.stars_used, calibration.result.median_offset
//! );
//!
//! let catalog = CalibratedCatalog::new(&exposure, &calibration);
//! catalog.save_to_file("out/exposure_0001.rkyv").unwrap();
//!
//! // Later: merge many exposures into star identities
//! let pool = photocal::build_pool(&[(1, &catalog)]);
//! let stars = EpochClusterer::default()
//!     .query(&pool, &ClusterQuery::new(83.8221, -5.3911))
//!     .unwrap();
//! for star in &stars {
//!     println!("{}: {} detections", star.key, star.member_count());
//! }
//! ```
//!
//! ## Calibration overview
//!
//! 1. **Normalize**: sentinels become `None`; detections within 10 px of the
//!    image border lose their photometry
//! 2. **Range**: `max_use` is the mode of the instrumental magnitude histogram,
//!    `min_use` the brightest clean detection (both overridable)
//! 3. **Match**: every reference star is paired with its nearest detection; clean
//!    pairs closer than 3" and inside the range form the fit sample
//! 4. **Fit**: the `reference − instrumental` offsets are median filtered and the
//!    correction curve is fitted by weighted least squares
//! 5. **Flag**: calibrated magnitudes outside the fitted range get bit 256 (too
//!    bright) or 512 (too faint); in-range detections with extractor flags get 1024
//! 6. **Uncertainty**: the scatter of fit stars within ±0.75 mag, trimmed and
//!    measured again
//!

pub mod calibration;
pub mod catalogs;
pub mod cluster;
pub mod detection;
pub mod error;
pub mod frames;
pub mod skyindex;
pub mod skymatch;
pub mod stats;

pub use calibration::{
    CalibratedDetection, Calibration, CalibrationConfig, CalibrationCurve, CalibrationEngine,
    CalibrationOutcome, CalibrationResult, FlagPropagator, LmConfig, MagnitudeClass,
    MagnitudeLimits, RobustCurveFitter, UncertaintyEstimator, UncertaintyTrim, FLAG_OTHER,
    FLAG_TOO_BRIGHT, FLAG_TOO_FAINT,
};
pub use catalogs::CalibratedCatalog;
pub use cluster::{
    build_pool, ClusterConfig, ClusterDetection, ClusterOutcome, ClusterQuery, EpochClusterer,
    LightCurvePoint, StarCluster,
};
pub use detection::{
    normalize_detections, normalize_filter, CatalogEntry, Detection, Exposure, ImageGeometry,
    ReferenceCatalog,
};
pub use error::{PhotocalError, Result, RunStatus};
pub use frames::{AngleUnit, SkyFrame};
pub use skyindex::SkyIndex;
pub use skymatch::{angle_between, SkyMatch, SkyMatcher, SkyPosition};
pub use stats::MagnitudeHistogram;
