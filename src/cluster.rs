//! Cross-epoch star identities.
//!
//! Calibrated detections of one sky region, collected over many exposures and
//! filters, are merged into [`StarCluster`]s: detections connected by a chain
//! of hops no longer than the merge radius (single linkage) are taken to be
//! the same physical star. Each cluster then provides a light curve per filter.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::calibration::CalibratedDetection;
use crate::catalogs::CalibratedCatalog;
use crate::detection::normalize_filter;
use crate::error::{PhotocalError, Result, RunStatus};
use crate::frames::{AngleUnit, SkyFrame};
use crate::skymatch::{SkyMatcher, SkyPosition, POLE_DEC_LIMIT_DEG};
use crate::stats::median;

/// Tunables for clustering and region queries.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Single-linkage cut in arcseconds (inclusive). Default 3.0.
    pub merge_radius_arcsec: f64,
    /// Query radius used by [`ClusterQuery::new`]. Default 5.0 arcsec.
    pub default_query_radius_arcsec: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            merge_radius_arcsec: 3.0,
            default_query_radius_arcsec: 5.0,
        }
    }
}

/// One calibrated detection together with the exposure it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDetection {
    /// Unique across the pool.
    pub id: u64,
    pub observation_id: u64,
    /// Observation time in days.
    pub observation_time: f64,
    /// Normalized filter name.
    pub filter: String,
    pub detection: CalibratedDetection,
}

impl ClusterDetection {
    pub fn new(
        id: u64,
        observation_id: u64,
        observation_time: f64,
        filter: &str,
        detection: CalibratedDetection,
    ) -> Self {
        Self {
            id,
            observation_id,
            observation_time,
            filter: normalize_filter(filter),
            detection,
        }
    }

    pub fn position(&self) -> SkyPosition {
        self.detection.position()
    }

    /// Calibrated magnitude if present and finite.
    pub fn magnitude(&self) -> Option<f64> {
        self.detection.calibrated_magnitude.filter(|m| m.is_finite())
    }
}

/// Flatten calibrated catalogs into a detection pool. Ids are assigned
/// sequentially in input order.
pub fn build_pool(catalogs: &[(u64, &CalibratedCatalog)]) -> Vec<ClusterDetection> {
    let mut next_id = 0u64;
    let mut pool = Vec::new();
    for (observation_id, catalog) in catalogs {
        for det in &catalog.detections {
            pool.push(ClusterDetection::new(
                next_id,
                *observation_id,
                catalog.observation_time,
                &catalog.filter,
                det.clone(),
            ));
            next_id += 1;
        }
    }
    pool
}

/// One light-curve sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightCurvePoint {
    pub observation_time: f64,
    pub magnitude: f64,
    pub error: Option<f64>,
    pub observation_id: u64,
}

/// A persistent stellar identity assembled from detections across exposures.
#[derive(Debug, Clone, PartialEq)]
pub struct StarCluster {
    /// `"{median_ra} {median_dec}"`.
    pub key: String,
    /// Sorted by observation time, then id.
    pub members: Vec<ClusterDetection>,
    pub centroid_ra_deg: f64,
    pub centroid_dec_deg: f64,
    /// Brightest calibrated magnitude among the members.
    pub representative_magnitude: f64,
    pub per_filter_median_magnitude: BTreeMap<String, f64>,
}

impl StarCluster {
    fn from_members(mut members: Vec<ClusterDetection>) -> Option<Self> {
        members.sort_by(|a, b| {
            a.observation_time
                .total_cmp(&b.observation_time)
                .then(a.id.cmp(&b.id))
        });

        let ras: Vec<f64> = members.iter().map(|m| m.detection.ra_deg).collect();
        let decs: Vec<f64> = members.iter().map(|m| m.detection.dec_deg).collect();
        let centroid_ra_deg = median_ra(&ras)?;
        let centroid_dec_deg = median(&decs)?;

        let representative_magnitude = members
            .iter()
            .filter_map(|m| m.magnitude())
            .min_by(f64::total_cmp)?;

        let mut by_filter: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for m in &members {
            if let Some(mag) = m.magnitude() {
                by_filter.entry(m.filter.clone()).or_default().push(mag);
            }
        }
        let per_filter_median_magnitude = by_filter
            .into_iter()
            .filter_map(|(filter, mags)| median(&mags).map(|med| (filter, med)))
            .collect();

        Some(Self {
            key: format!("{:?} {:?}", centroid_ra_deg, centroid_dec_deg),
            members,
            centroid_ra_deg,
            centroid_dec_deg,
            representative_magnitude,
            per_filter_median_magnitude,
        })
    }

    pub fn member_ids(&self) -> Vec<u64> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn centroid(&self) -> SkyPosition {
        SkyPosition::new(self.centroid_ra_deg, self.centroid_dec_deg)
    }

    /// Filters with at least one calibrated member.
    pub fn filters(&self) -> Vec<&str> {
        self.per_filter_median_magnitude.keys().map(|f| f.as_str()).collect()
    }

    /// Calibrated magnitudes in `filter` (after normalization), ordered by time.
    pub fn light_curve(&self, filter: &str) -> Vec<LightCurvePoint> {
        let filter = normalize_filter(filter);
        self.members
            .iter()
            .filter(|m| m.filter == filter)
            .filter_map(|m| {
                Some(LightCurvePoint {
                    observation_time: m.observation_time,
                    magnitude: m.magnitude()?,
                    error: m.detection.calibrated_error,
                    observation_id: m.observation_id,
                })
            })
            .collect()
    }
}

/// Median right ascension, unwrapped around the first value so clusters
/// straddling RA 0/360 do not average to the far side of the sky.
fn median_ra(ras: &[f64]) -> Option<f64> {
    let reference = *ras.first()?;
    let unwrapped: Vec<f64> = ras
        .iter()
        .map(|&ra| reference + wrap_degrees(ra - reference))
        .collect();
    median(&unwrapped).map(|m| m.rem_euclid(360.0))
}

/// Wrap an angle difference to [-180, 180).
fn wrap_degrees(d: f64) -> f64 {
    (d + 180.0).rem_euclid(360.0) - 180.0
}

/// Box selection around a position, the way light-curve requests are made.
///
/// The center is held in FK5 J2000 degrees, the frame detections are stored in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterQuery {
    pub center_ra_deg: f64,
    pub center_dec_deg: f64,
    pub radius_arcsec: f64,
}

impl ClusterQuery {
    /// Query around an FK5 position in degrees with the default 5" radius.
    pub fn new(center_ra_deg: f64, center_dec_deg: f64) -> Self {
        Self {
            center_ra_deg,
            center_dec_deg,
            radius_arcsec: ClusterConfig::default().default_query_radius_arcsec,
        }
    }

    /// Query around `(lon, lat)` given in `units` and `frame`, converted to FK5.
    ///
    /// ```
    /// use photocal::{AngleUnit, ClusterQuery, SkyFrame};
    ///
    /// // The galactic center, searched within 0.1'
    /// let q = ClusterQuery::in_frame(0.0, 0.0, AngleUnit::Degree, SkyFrame::Galactic)
    ///     .unwrap()
    ///     .with_radius_in(0.1, AngleUnit::Arcminute);
    /// assert!((q.center_ra_deg - 266.405).abs() < 1e-3);
    /// assert!((q.radius_arcsec - 6.0).abs() < 1e-12);
    /// ```
    pub fn in_frame(lon: f64, lat: f64, units: AngleUnit, frame: SkyFrame) -> Result<Self> {
        let center = frame.to_fk5(lon, lat, units)?;
        Ok(Self::new(center.ra_deg, center.dec_deg))
    }

    pub fn with_radius(mut self, radius_arcsec: f64) -> Self {
        self.radius_arcsec = radius_arcsec;
        self
    }

    pub fn with_radius_in(self, radius: f64, units: AngleUnit) -> Self {
        self.with_radius(units.to_arcsec(radius))
    }

    fn validate(&self) -> Result<()> {
        let center_ok = self.center_ra_deg.is_finite() && self.center_dec_deg.abs() <= 90.0;
        let radius_ok = self.radius_arcsec.is_finite() && self.radius_arcsec >= 0.0;
        if !(center_ok && radius_ok) {
            return Err(PhotocalError::InvalidInput(format!(
                "query at ({}, {}) with radius {}\"",
                self.center_ra_deg, self.center_dec_deg, self.radius_arcsec
            )));
        }
        Ok(())
    }

    /// `|dec − dec0| ≤ r` and `|ra − ra0| ≤ r / cos(dec0)`, with RA wrap-around.
    pub fn contains(&self, position: &SkyPosition) -> bool {
        let dec0 = self.center_dec_deg.clamp(-POLE_DEC_LIMIT_DEG, POLE_DEC_LIMIT_DEG);
        let half_dec = self.radius_arcsec / 3600.0;
        let half_ra = half_dec / dec0.to_radians().cos();
        (position.dec_deg - dec0).abs() <= half_dec
            && wrap_degrees(position.ra_deg - self.center_ra_deg).abs() <= half_ra
    }
}

/// Status + human-readable reason + clusters (empty on failure).
#[derive(Debug, Clone)]
pub struct ClusterOutcome {
    /// `Success` or `Failed`; clustering has no warning condition.
    pub status: RunStatus,
    pub message: String,
    pub clusters: Vec<StarCluster>,
}

impl ClusterOutcome {
    pub(crate) fn failure(err: &PhotocalError) -> Self {
        Self {
            status: RunStatus::Failed,
            message: err.reason(),
            clusters: Vec::new(),
        }
    }

    /// `true` unless the run failed.
    pub fn success(&self) -> bool {
        self.status != RunStatus::Failed
    }

    /// Cluster by key.
    pub fn get(&self, key: &str) -> Option<&StarCluster> {
        self.clusters.iter().find(|c| c.key == key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.clusters.iter().map(|c| c.key.as_str()).collect()
    }
}

/// Turns a pool of calibrated detections into star identities.
#[derive(Debug, Clone, Default)]
pub struct EpochClusterer {
    pub config: ClusterConfig,
}

impl EpochClusterer {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Single-linkage clustering of every detection with a calibrated magnitude.
    ///
    /// Clusters are ordered by representative magnitude (brightest first), then key.
    pub fn cluster(&self, pool: &[ClusterDetection]) -> Result<Vec<StarCluster>> {
        let usable: Vec<&ClusterDetection> = pool.iter().filter(|d| d.magnitude().is_some()).collect();
        if usable.is_empty() {
            return Err(PhotocalError::EmptyClusterPool);
        }

        let positions: Vec<SkyPosition> = usable.iter().map(|d| d.position()).collect();
        let pairs = SkyMatcher::new(self.config.merge_radius_arcsec)
            .pairs_within(&positions, self.config.merge_radius_arcsec);

        let mut sets = DisjointSets::new(usable.len());
        for &(i, j, _) in &pairs {
            sets.union(i, j);
        }

        let mut groups: BTreeMap<usize, Vec<ClusterDetection>> = BTreeMap::new();
        for (idx, det) in usable.iter().enumerate() {
            groups.entry(sets.find(idx)).or_default().push((*det).clone());
        }

        let mut clusters: Vec<StarCluster> = groups
            .into_values()
            .filter_map(StarCluster::from_members)
            .collect();
        clusters.sort_by(|a, b| {
            a.representative_magnitude
                .total_cmp(&b.representative_magnitude)
                .then_with(|| a.key.cmp(&b.key))
        });

        debug!(
            "Clustered {} detections ({} linked pairs) into {} stars",
            usable.len(),
            pairs.len(),
            clusters.len()
        );
        Ok(clusters)
    }

    /// Select detections with `query` and cluster them.
    pub fn query(&self, pool: &[ClusterDetection], query: &ClusterQuery) -> Result<Vec<StarCluster>> {
        query.validate()?;
        let selected: Vec<ClusterDetection> = pool
            .iter()
            .filter(|d| query.contains(&d.position()))
            .cloned()
            .collect();
        debug!(
            "Query ({}, {}) r={}\" selected {} of {} detections",
            query.center_ra_deg,
            query.center_dec_deg,
            query.radius_arcsec,
            selected.len(),
            pool.len()
        );
        self.cluster(&selected)
    }

    /// [`query`](Self::query) (or [`cluster`](Self::cluster) when `query` is
    /// `None`) with failures reported as an outcome.
    pub fn run(&self, pool: &[ClusterDetection], query: Option<&ClusterQuery>) -> ClusterOutcome {
        let result = match query {
            Some(q) => self.query(pool, q),
            None => self.cluster(pool),
        };
        match result {
            Ok(clusters) => ClusterOutcome {
                status: RunStatus::Success,
                message: format!("{} stars found", clusters.len()),
                clusters,
            },
            Err(err) => {
                warn!("Clustering failed: {}", err);
                ClusterOutcome::failure(&err)
            }
        }
    }
}

// ── Union-find ──────────────────────────────────────────────────────────────

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(id: u64, ra: f64, dec: f64, mag: Option<f64>, filter: &str, time: f64) -> ClusterDetection {
        ClusterDetection::new(
            id,
            id / 10,
            time,
            filter,
            CalibratedDetection {
                source_entry_id: id,
                calibrated_magnitude: mag,
                calibrated_error: mag.map(|_| 0.01),
                ra_deg: ra,
                dec_deg: dec,
                fwhm_deg: 0.0005,
                x: 100.0,
                y: 100.0,
                flags: 0,
                raw_magnitude: mag.map(|m| m - 2.5),
                raw_error: Some(0.01),
                near_edge: false,
            },
        )
    }

    #[test]
    fn close_pair_merges_far_star_does_not() {
        let pool = vec![
            det(1, 10.0, 20.0, Some(12.0), "V", 1.0),
            det(2, 10.0003, 20.0, Some(12.1), "V", 2.0),
            det(3, 10.01, 20.0, Some(14.0), "V", 1.0),
        ];
        let clusters = EpochClusterer::default().cluster(&pool).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].member_ids(), vec![1, 2]);
        assert_eq!(clusters[0].representative_magnitude, 12.0);
        assert_eq!(clusters[1].member_ids(), vec![3]);
    }

    #[test]
    fn chain_links_transitively() {
        // 2" hops: 0-1 and 1-2 link, 0-2 are 4" apart
        let step = 2.0 / 3600.0;
        let pool = vec![
            det(1, 50.0, 0.0, Some(13.0), "V", 1.0),
            det(2, 50.0 + step, 0.0, Some(13.0), "V", 2.0),
            det(3, 50.0 + 2.0 * step, 0.0, Some(13.0), "V", 3.0),
        ];
        let clusters = EpochClusterer::default().cluster(&pool).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_count(), 3);
        assert!((clusters[0].centroid_ra_deg - (50.0 + step)).abs() < 1e-12);
    }

    #[test]
    fn uncalibrated_detections_are_ignored() {
        let pool = vec![det(1, 10.0, 20.0, None, "V", 1.0)];
        let err = EpochClusterer::default().cluster(&pool).unwrap_err();
        assert!(matches!(err, PhotocalError::EmptyClusterPool));
        let outcome = EpochClusterer::default().run(&pool, None);
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.success());
        assert_eq!(outcome.message, "no stars found");
    }

    #[test]
    fn per_filter_medians_and_light_curve() {
        let pool = vec![
            det(1, 10.0, 20.0, Some(12.0), "V", 3.0),
            det(2, 10.0, 20.0001, Some(12.2), "V", 1.0),
            det(3, 10.0001, 20.0, Some(12.4), "v", 2.0),
            det(4, 10.0, 20.0, Some(11.0), "H-alpha", 4.0),
        ];
        let clusters = EpochClusterer::default().cluster(&pool).unwrap();
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_eq!(c.filters(), vec!["HA", "V"]);
        assert!((c.per_filter_median_magnitude["V"] - 12.2).abs() < 1e-12);
        assert_eq!(c.per_filter_median_magnitude["HA"], 11.0);
        assert_eq!(c.representative_magnitude, 11.0);

        let lc = c.light_curve("V");
        let times: Vec<f64> = lc.iter().map(|p| p.observation_time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
        assert_eq!(c.light_curve("ha").len(), 1);
    }

    #[test]
    fn median_ra_across_zero() {
        let ra = median_ra(&[359.9999, 0.0001, 0.0002]).unwrap();
        assert!((ra - 0.0001).abs() < 1e-9);
        let ra = median_ra(&[359.9998, 359.9999, 0.0001]).unwrap();
        assert!((ra - 359.9999).abs() < 1e-9);
    }

    #[test]
    fn query_box_wraps_ra() {
        let q = ClusterQuery::new(0.0, 0.0);
        assert_eq!(q.radius_arcsec, 5.0);
        assert!(q.contains(&SkyPosition::new(359.999, 0.0)));
        assert!(q.contains(&SkyPosition::new(0.001, 0.001)));
        assert!(!q.contains(&SkyPosition::new(0.002, 0.0)));
        assert!(!q.contains(&SkyPosition::new(0.0, 0.002)));
    }

    #[test]
    fn query_at_pole_uses_clamped_dec() {
        let q = ClusterQuery::new(0.0, 90.0).with_radius(5.0);
        assert!(q.contains(&SkyPosition::new(120.0, 89.9995)));
    }

    #[test]
    fn query_selects_then_clusters() {
        let pool = vec![
            det(1, 10.0, 20.0, Some(12.0), "V", 1.0),
            det(2, 10.0003, 20.0, Some(12.1), "V", 2.0),
            det(3, 10.01, 20.0, Some(14.0), "V", 1.0),
        ];
        let clusters = EpochClusterer::default()
            .query(&pool, &ClusterQuery::new(10.0, 20.0))
            .unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].member_count(), 2);

        let outcome = EpochClusterer::default().run(&pool, Some(&ClusterQuery::new(200.0, -30.0)));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.message, "no stars found");

        let outcome = EpochClusterer::default().run(&pool, Some(&ClusterQuery::new(10.0, 20.0)));
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.message, "1 stars found");
    }

    #[test]
    fn query_units_and_frames() {
        let q = ClusterQuery::in_frame(600.0, 1200.0, AngleUnit::Arcminute, SkyFrame::Fk5)
            .unwrap()
            .with_radius_in(0.5, AngleUnit::Arcminute);
        assert_eq!((q.center_ra_deg, q.center_dec_deg), (10.0, 20.0));
        assert_eq!(q.radius_arcsec, 30.0);

        // A galactic position round-tripped through the FK5 center it maps to
        let gal = ClusterQuery::in_frame(0.0, 0.0, AngleUnit::Degree, SkyFrame::Galactic).unwrap();
        assert_eq!(gal.radius_arcsec, 5.0);
        let pool = vec![det(1, gal.center_ra_deg, gal.center_dec_deg + 1.0 / 3600.0, Some(12.0), "V", 1.0)];
        let clusters = EpochClusterer::default().query(&pool, &gal).unwrap();
        assert_eq!(clusters.len(), 1);

        let icrs = ClusterQuery::in_frame(10.0, 20.0, AngleUnit::Degree, SkyFrame::Icrs).unwrap();
        let shift = SkyPosition::new(icrs.center_ra_deg, icrs.center_dec_deg)
            .separation_arcsec(&SkyPosition::new(10.0, 20.0));
        assert!(shift < 0.05, "frame bias {shift}\"");
    }

    #[test]
    fn invalid_query_is_rejected() {
        let pool = vec![det(1, 10.0, 20.0, Some(12.0), "V", 1.0)];
        let clusterer = EpochClusterer::default();
        for q in [
            ClusterQuery::new(10.0, 20.0).with_radius(-1.0),
            ClusterQuery::new(10.0, 95.0),
            ClusterQuery::new(f64::NAN, 20.0),
        ] {
            let err = clusterer.query(&pool, &q).unwrap_err();
            assert!(matches!(err, PhotocalError::InvalidInput(_)));
        }
        let outcome = clusterer.run(&pool, Some(&ClusterQuery::new(10.0, 20.0).with_radius(f64::NAN)));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.starts_with("invalid input"));
        assert!(ClusterQuery::in_frame(0.0, 100.0, AngleUnit::Degree, SkyFrame::Galactic).is_err());
    }
}
