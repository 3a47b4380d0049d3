//! Spatial index over sky positions for cone searches and nearest-neighbor lookups.
//!
//! `SkyIndex` bins unit vectors with a HEALPix-style spherical partition:
//! latitude is split into `3 * nside` bins in `z = sin(dec)`, and longitude
//! into `4 * nside` bins in right ascension. Only occupied cells are stored,
//! so `nside` can be chosen from the angular scale of the data (arcseconds for
//! a single exposure) without allocating the whole sphere.
//!
//! Query flow:
//! 1. Compute candidate cells intersecting the cone around a direction.
//! 2. If that is more cells than there are points, scan all points instead.
//! 3. Apply the exact angular filter.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use nalgebra::Vector3;

use crate::skymatch::{angle_between, SkyPosition};

/// Largest `nside` used; keeps `lat * n_lon + lon` well inside `u64`.
const MAX_NSIDE: u32 = 1 << 22;

#[derive(Debug, Clone)]
pub struct SkyIndex {
    nside: u32,
    n_lat: u32,
    n_lon: u32,
    vectors: Vec<Vector3<f64>>,
    cells: HashMap<u64, Vec<u32>>,
}

impl SkyIndex {
    /// Build an index over `positions` with cells of roughly `cell_size_rad` across.
    pub fn new(cell_size_rad: f64, positions: &[SkyPosition]) -> Self {
        let nside = if cell_size_rad.is_finite() && cell_size_rad > 0.0 {
            ((PI / 2.0) / cell_size_rad).ceil().clamp(1.0, MAX_NSIDE as f64) as u32
        } else {
            1
        };
        let n_lat = 3 * nside;
        let n_lon = 4 * nside;

        let vectors: Vec<Vector3<f64>> = positions.iter().map(|p| p.uvec()).collect();
        let mut cells: HashMap<u64, Vec<u32>> = HashMap::new();
        for (idx, v) in vectors.iter().enumerate() {
            let cell = Self::cell_for_uvec(n_lat, n_lon, v);
            cells.entry(cell).or_default().push(idx as u32);
        }

        Self {
            nside,
            n_lat,
            n_lon,
            vectors,
            cells,
        }
    }

    /// Return the index resolution parameter.
    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Unit vector of the point stored at `idx`.
    pub fn uvec(&self, idx: usize) -> &Vector3<f64> {
        &self.vectors[idx]
    }

    /// Indices of all points within `radius_rad` (inclusive) of `dir`, sorted ascending.
    pub fn query_indices(&self, dir: &Vector3<f64>, radius_rad: f64) -> Vec<usize> {
        self.query_with_separation(dir, radius_rad)
            .into_iter()
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Points within `radius_rad` of `dir` with their separation in radians,
    /// sorted by index.
    pub fn query_with_separation(&self, dir: &Vector3<f64>, radius_rad: f64) -> Vec<(usize, f64)> {
        if self.is_empty() || !(radius_rad >= 0.0) {
            return Vec::new();
        }
        let radius = radius_rad.min(PI);
        let dir = normalize_or_fallback(dir);

        let mut out = Vec::new();
        match self.candidate_cells(&dir, radius) {
            Some(cells) => {
                for cell in cells {
                    if let Some(members) = self.cells.get(&cell) {
                        for &idx in members {
                            self.push_if_within(idx as usize, &dir, radius, &mut out);
                        }
                    }
                }
            }
            None => {
                for idx in 0..self.vectors.len() {
                    self.push_if_within(idx, &dir, radius, &mut out);
                }
            }
        }

        out.sort_unstable_by_key(|&(idx, _)| idx);
        out.dedup_by_key(|&mut (idx, _)| idx);
        out
    }

    /// Nearest point to `dir` and its separation in radians.
    ///
    /// Ties resolve to the lowest index. Returns `None` only for an empty index.
    pub fn nearest(&self, dir: &Vector3<f64>) -> Option<(usize, f64)> {
        if self.is_empty() {
            return None;
        }
        // Start at one cell width and grow; any point closer than the best hit
        // inside the cone is itself inside the cone.
        let mut radius = (PI / 2.0) / self.nside as f64;
        loop {
            let hits = self.query_with_separation(dir, radius);
            let best = hits.into_iter().min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            if best.is_some() || radius >= PI {
                return best;
            }
            radius = (radius * 4.0).min(PI);
        }
    }

    fn push_if_within(&self, idx: usize, dir: &Vector3<f64>, radius: f64, out: &mut Vec<(usize, f64)>) {
        let sep = angle_between(dir, &self.vectors[idx]);
        if sep <= radius {
            out.push((idx, sep));
        }
    }

    /// Cell keys overlapping the cone, or `None` when a linear scan is cheaper.
    fn candidate_cells(&self, dir: &Vector3<f64>, radius: f64) -> Option<Vec<u64>> {
        let z_step = 2.0 / self.n_lat as f64;
        let lon_step = TAU / self.n_lon as f64;

        let dec0 = dir.z.clamp(-1.0, 1.0).asin();
        let dec_lo = dec0 - radius;
        let dec_hi = dec0 + radius;
        let contains_pole = dec_hi >= PI / 2.0 || dec_lo <= -PI / 2.0;

        // Pad by one bin so points sitting on a bin boundary are never missed.
        let z_min = (dec_lo.max(-PI / 2.0).sin() - z_step).max(-1.0);
        let z_max = (dec_hi.min(PI / 2.0).sin() + z_step).min(1.0);
        let lat_start = Self::z_to_lat_bin(self.n_lat, z_min);
        let lat_end = Self::z_to_lat_bin(self.n_lat, z_max);

        // Widest RA excursion of a cone that does not contain a pole.
        let lon_half_span = if contains_pole {
            PI
        } else {
            (radius.sin() / dec0.cos()).min(1.0).asin() + lon_step
        };

        let mut phi = dir.y.atan2(dir.x);
        if phi < 0.0 {
            phi += TAU;
        }

        let mut cells = Vec::new();
        let budget = self.vectors.len();
        for lat_bin in lat_start..=lat_end {
            if 2.0 * lon_half_span >= TAU {
                if cells.len() + self.n_lon as usize > budget {
                    return None;
                }
                for lon_bin in 0..self.n_lon {
                    cells.push(lat_bin as u64 * self.n_lon as u64 + lon_bin as u64);
                }
                continue;
            }

            let start = Self::phi_to_lon_bin(self.n_lon, wrap_angle(phi - lon_half_span));
            let end = Self::phi_to_lon_bin(self.n_lon, wrap_angle(phi + lon_half_span));
            let span = if start <= end {
                (end - start + 1) as usize
            } else {
                (self.n_lon - start + end + 1) as usize
            };
            if cells.len() + span > budget {
                return None;
            }
            let mut lon_bin = start;
            for _ in 0..span {
                cells.push(lat_bin as u64 * self.n_lon as u64 + lon_bin as u64);
                lon_bin = (lon_bin + 1) % self.n_lon;
            }
        }
        Some(cells)
    }

    fn cell_for_uvec(n_lat: u32, n_lon: u32, v: &Vector3<f64>) -> u64 {
        let mut phi = v.y.atan2(v.x);
        if phi < 0.0 {
            phi += TAU;
        }
        let lat_bin = Self::z_to_lat_bin(n_lat, v.z);
        let lon_bin = Self::phi_to_lon_bin(n_lon, phi);
        lat_bin as u64 * n_lon as u64 + lon_bin as u64
    }

    fn z_to_lat_bin(n_lat: u32, z: f64) -> u32 {
        let u = ((z.clamp(-1.0, 1.0) + 1.0) * 0.5).clamp(0.0, 1.0);
        let idx = (u * n_lat as f64).floor() as u32;
        idx.min(n_lat - 1)
    }

    fn phi_to_lon_bin(n_lon: u32, phi: f64) -> u32 {
        let u = (phi / TAU).clamp(0.0, 1.0 - f64::EPSILON);
        let idx = (u * n_lon as f64).floor() as u32;
        idx.min(n_lon - 1)
    }
}

fn wrap_angle(theta_rad: f64) -> f64 {
    theta_rad.rem_euclid(TAU)
}

fn normalize_or_fallback(v: &Vector3<f64>) -> Vector3<f64> {
    let n = v.norm();
    if n > 0.0 {
        v / n
    } else {
        Vector3::new(1.0, 0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arcsec(a: f64) -> f64 {
        (a / 3600.0).to_radians()
    }

    fn brute_force(positions: &[SkyPosition], center: &SkyPosition, radius: f64) -> Vec<usize> {
        let dir = center.uvec();
        positions
            .iter()
            .enumerate()
            .filter(|(_, p)| angle_between(&dir, &p.uvec()) <= radius)
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn cone_query_finds_nearby_points() {
        let positions = vec![
            SkyPosition::new(0.0, 0.0),
            SkyPosition::new(2.0, 1.0),
            SkyPosition::new(40.0, -10.0),
        ];
        let index = SkyIndex::new(1.0_f64.to_radians(), &positions);
        let hits = index.query_indices(&SkyPosition::new(0.5, 0.25).uvec(), 3.0_f64.to_radians());
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn cone_query_handles_ra_wraparound() {
        let positions = vec![
            SkyPosition::new(359.0, 0.0),
            SkyPosition::new(1.0, 0.0),
            SkyPosition::new(180.0, 0.0),
        ];
        let index = SkyIndex::new(0.5_f64.to_radians(), &positions);
        let hits = index.query_indices(&SkyPosition::new(0.0, 0.0).uvec(), 3.0_f64.to_radians());
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn arcsecond_grid_matches_brute_force() {
        // A dense grid around (150, 2) with ~2" spacing
        let mut positions = Vec::new();
        for i in 0..40 {
            for j in 0..40 {
                positions.push(SkyPosition::new(
                    150.0 + i as f64 * 0.00055,
                    2.0 + j as f64 * 0.00055,
                ));
            }
        }
        let index = SkyIndex::new(arcsec(3.0), &positions);
        for center in [
            SkyPosition::new(150.01, 2.01),
            SkyPosition::new(150.0, 2.0),
            SkyPosition::new(150.02, 2.005),
        ] {
            let hits = index.query_indices(&center.uvec(), arcsec(5.0));
            assert_eq!(hits, brute_force(&positions, &center, arcsec(5.0)));
        }
    }

    #[test]
    fn query_near_pole() {
        let positions = vec![
            SkyPosition::new(0.0, 89.9999),
            SkyPosition::new(180.0, 89.9999),
            SkyPosition::new(90.0, 80.0),
        ];
        let index = SkyIndex::new(arcsec(10.0), &positions);
        let hits = index.query_indices(&SkyPosition::new(45.0, 90.0).uvec(), arcsec(2.0));
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn nearest_grows_search_radius() {
        let positions = vec![SkyPosition::new(10.0, 10.0), SkyPosition::new(12.0, 10.0)];
        let index = SkyIndex::new(arcsec(1.0), &positions);
        let (idx, sep) = index.nearest(&SkyPosition::new(11.9, 10.0).uvec()).unwrap();
        assert_eq!(idx, 1);
        assert!(sep > 0.0 && sep < 0.2_f64.to_radians());
    }

    #[test]
    fn nearest_on_empty_index() {
        let index = SkyIndex::new(arcsec(1.0), &[]);
        assert!(index.nearest(&SkyPosition::new(0.0, 0.0).uvec()).is_none());
    }
}
