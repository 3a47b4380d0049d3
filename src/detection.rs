//! Catalog rows as read from the source extractor, and their normalized form.
//!
//! A [`CatalogEntry`] is one row of a reference or per-exposure catalog, exactly
//! as written by the extractor, sentinels included. Before any arithmetic the
//! engine converts rows to [`Detection`]s, where "no photometry" is an explicit
//! `None` instead of a magic `99`/`-99` value.

use tracing::debug;

use crate::skymatch::SkyPosition;

/// Magnitude / magnitude-error value the extractor writes when it could not measure a source.
pub const SENTINEL_MAGNITUDE: f64 = 99.0;
/// Flag value the extractor (and older calibrated catalogs) write for "no photometry".
pub const SENTINEL_FLAGS: i32 = -99;

/// One raw catalog row.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    /// Running object number within the catalog.
    pub id: u64,
    pub ra_deg: f64,
    pub dec_deg: f64,
    pub mag: f64,
    pub mag_err: f64,
    pub fwhm_deg: f64,
    /// Pixel column (1-based, extractor convention). Zero for reference catalogs.
    pub x: f64,
    /// Pixel row (1-based, extractor convention). Zero for reference catalogs.
    pub y: f64,
    pub flags: i32,
    pub near_edge: bool,
}

impl CatalogEntry {
    pub fn position(&self) -> SkyPosition {
        SkyPosition::new(self.ra_deg, self.dec_deg)
    }

    /// `true` when the extractor marked this row as having no photometry.
    pub fn is_sentinel(&self) -> bool {
        self.mag == SENTINEL_MAGNITUDE || self.flags == SENTINEL_FLAGS || !self.mag.is_finite()
    }
}

/// Image dimensions of an exposure (`NAXIS1`, `NAXIS2`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageGeometry {
    pub naxis1: u32,
    pub naxis2: u32,
}

impl ImageGeometry {
    pub fn new(naxis1: u32, naxis2: u32) -> Self {
        Self { naxis1, naxis2 }
    }

    /// `true` if the pixel position lies within `edge_dist` pixels of any border.
    pub fn near_edge(&self, x: f64, y: f64, edge_dist: f64) -> bool {
        x < edge_dist
            || y < edge_dist
            || self.naxis1 as f64 - x < edge_dist
            || self.naxis2 as f64 - y < edge_dist
    }
}

/// A catalog row after sentinel normalization and edge rejection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: u64,
    pub position: SkyPosition,
    /// Instrumental (or, for reference rows, offset-corrected) magnitude.
    /// `None` when the row has no usable photometry.
    pub mag: Option<f64>,
    pub mag_err: Option<f64>,
    pub fwhm_deg: f64,
    pub x: f64,
    pub y: f64,
    pub flags: i32,
    pub near_edge: bool,
}

impl Detection {
    /// Normalize a raw row: sentinels become `None`.
    pub fn from_entry(entry: &CatalogEntry) -> Self {
        let (mag, mag_err) = if entry.is_sentinel() {
            (None, None)
        } else {
            let err = (entry.mag_err != SENTINEL_MAGNITUDE && entry.mag_err.is_finite())
                .then_some(entry.mag_err);
            (Some(entry.mag), err)
        };
        Self {
            id: entry.id,
            position: entry.position(),
            mag,
            mag_err,
            fwhm_deg: entry.fwhm_deg,
            x: entry.x,
            y: entry.y,
            flags: entry.flags,
            near_edge: entry.near_edge,
        }
    }

    /// Photometry that may take part in the correction-curve fit:
    /// measured and with a clean extractor flag.
    pub fn clean_mag(&self) -> Option<f64> {
        if self.flags == 0 {
            self.mag
        } else {
            None
        }
    }
}

/// Reference (master) catalog for one target and filter.
#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    pub filter: String,
    /// Additive correction applied once to every reference magnitude to align
    /// instrumental zero-points before matching.
    pub calibration_offset: f64,
    pub entries: Vec<CatalogEntry>,
}

impl ReferenceCatalog {
    pub fn new(filter: &str, calibration_offset: f64, entries: Vec<CatalogEntry>) -> Self {
        Self {
            filter: filter.to_string(),
            calibration_offset,
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalized reference stars with the calibration offset applied.
    pub fn normalized(&self) -> Vec<Detection> {
        self.entries
            .iter()
            .map(|entry| {
                let mut det = Detection::from_entry(entry);
                det.mag = det.mag.map(|m| m + self.calibration_offset);
                det
            })
            .collect()
    }
}

/// One exposure's detection catalog together with the metadata the engine needs.
#[derive(Debug, Clone)]
pub struct Exposure {
    pub entries: Vec<CatalogEntry>,
    pub geometry: ImageGeometry,
    /// Observation time in days (e.g. MJD).
    pub observation_time: f64,
    pub filter: String,
}

impl Exposure {
    pub fn new(entries: Vec<CatalogEntry>, geometry: ImageGeometry) -> Self {
        Self {
            entries,
            geometry,
            observation_time: 0.0,
            filter: String::new(),
        }
    }

    /// Attach the observation time and filter. The filter name is normalized
    /// with [`normalize_filter`].
    pub fn with_metadata(mut self, filter: &str, observation_time: f64) -> Self {
        self.filter = normalize_filter(filter);
        self.observation_time = observation_time;
        self
    }
}

/// Filter names that all mean the H-alpha narrow band.
pub const HALPHA_ALIASES: [&str; 9] = [
    "HA", "A", "A-BAND", "HA-BAND", "H-BAND", "H BAND", "HA BAND", "H-ALPHA", "H ALPHA",
];

/// Canonical filter name: trimmed, upper-cased, with every H-alpha alias mapped to `"HA"`.
pub fn normalize_filter(name: &str) -> String {
    let upper = name.trim().to_uppercase();
    if HALPHA_ALIASES.contains(&upper.as_str()) {
        "HA".to_string()
    } else {
        upper
    }
}

/// Normalize sentinels and reject detections near the image border.
///
/// Rows within `edge_dist` pixels of an edge lose their photometry and get
/// `near_edge` set, so they can never anchor the correction fit.
pub fn normalize_detections(
    entries: &[CatalogEntry],
    geometry: &ImageGeometry,
    edge_dist: f64,
) -> Vec<Detection> {
    let mut n_sentinel = 0usize;
    let mut n_edge = 0usize;

    let detections: Vec<Detection> = entries
        .iter()
        .map(|entry| {
            let mut det = Detection::from_entry(entry);
            if det.mag.is_none() {
                n_sentinel += 1;
            }
            if geometry.near_edge(entry.x, entry.y, edge_dist) {
                det.mag = None;
                det.mag_err = None;
                det.near_edge = true;
                n_edge += 1;
            }
            det
        })
        .collect();

    debug!(
        "Normalized {} detections: {} without photometry, {} within {} px of the edge",
        detections.len(),
        n_sentinel,
        n_edge,
        edge_dist
    );

    detections
}
