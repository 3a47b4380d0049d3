//! Sky positions and nearest-neighbor catalog matching on the celestial sphere.
//!
//! [`SkyMatcher::match_nearest`] pairs every reference position with its
//! nearest candidate by great-circle distance, the way a photometric
//! calibration cross-matches a reference catalog against an exposure.
//! [`SkyMatcher::pairs_within`] gives all pairs closer than a radius, which is
//! what single-linkage clustering needs.

use nalgebra::Vector3;
use rkyv::{Archive, Deserialize, Serialize};

use crate::skyindex::SkyIndex;

/// Declination used in place of ±90° so right ascension stays well defined.
pub const POLE_DEC_LIMIT_DEG: f64 = 89.99999;

pub const ARCSEC_PER_RAD: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

/// A position on the celestial sphere, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
}

impl SkyPosition {
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self { ra_deg, dec_deg }
    }

    /// Declination clamped away from the poles.
    pub fn clamped_dec_deg(&self) -> f64 {
        self.dec_deg.clamp(-POLE_DEC_LIMIT_DEG, POLE_DEC_LIMIT_DEG)
    }

    /// Unit vector pointing to this position.
    pub fn uvec(&self) -> Vector3<f64> {
        let (rasin, racos) = self.ra_deg.to_radians().sin_cos();
        let (decsin, deccos) = self.clamped_dec_deg().to_radians().sin_cos();
        Vector3::new(deccos * racos, deccos * rasin, decsin)
    }

    /// Great-circle separation to `other` in arcseconds.
    pub fn separation_arcsec(&self, other: &SkyPosition) -> f64 {
        angle_between(&self.uvec(), &other.uvec()) * ARCSEC_PER_RAD
    }
}

/// Angle between two unit vectors in radians.
///
/// Uses `atan2(|a × b|, a · b)`, which stays accurate at sub-arcsecond separations
/// where `acos` of the dot product loses precision.
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.cross(b).norm().atan2(a.dot(b))
}

/// The nearest candidate for one reference position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyMatch {
    /// Index into the candidate slice.
    pub index: usize,
    pub separation_arcsec: f64,
}

/// Angular cross-matcher.
#[derive(Debug, Clone)]
pub struct SkyMatcher {
    /// Cell size of the spatial index. Only affects speed, never results.
    pub cell_size_arcsec: f64,
}

impl Default for SkyMatcher {
    fn default() -> Self {
        Self {
            cell_size_arcsec: 10.0,
        }
    }
}

impl SkyMatcher {
    pub fn new(cell_size_arcsec: f64) -> Self {
        Self { cell_size_arcsec }
    }

    fn cell_size_rad(&self) -> f64 {
        self.cell_size_arcsec / ARCSEC_PER_RAD
    }

    /// For every reference position, the nearest candidate and its separation.
    ///
    /// The entry is `None` only when `candidates` is empty. Ties resolve to the
    /// lowest candidate index.
    pub fn match_nearest(
        &self,
        reference: &[SkyPosition],
        candidates: &[SkyPosition],
    ) -> Vec<Option<SkyMatch>> {
        let index = SkyIndex::new(self.cell_size_rad(), candidates);
        reference
            .iter()
            .map(|pos| {
                index.nearest(&pos.uvec()).map(|(idx, sep)| SkyMatch {
                    index: idx,
                    separation_arcsec: sep * ARCSEC_PER_RAD,
                })
            })
            .collect()
    }

    /// All index pairs `(i, j)` with `i < j` separated by at most `radius_arcsec`,
    /// with their separation in arcseconds. Sorted by `(i, j)`.
    pub fn pairs_within(
        &self,
        positions: &[SkyPosition],
        radius_arcsec: f64,
    ) -> Vec<(usize, usize, f64)> {
        let radius_rad = radius_arcsec / ARCSEC_PER_RAD;
        let index = SkyIndex::new(self.cell_size_rad().max(radius_rad), positions);
        let mut pairs = Vec::new();
        for i in 0..positions.len() {
            for (j, sep) in index.query_with_separation(index.uvec(i), radius_rad) {
                if j > i {
                    pairs.push((i, j, sep * ARCSEC_PER_RAD));
                }
            }
        }
        pairs
    }
}
