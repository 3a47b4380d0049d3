//! Cross-epoch clustering of calibrated exposures into light curves.


use photocal::{
    build_pool, AngleUnit, CalibratedCatalog, CalibratedDetection, CalibrationEngine,
    ClusterDetection, ClusterQuery, EpochClusterer, MagnitudeLimits, RunStatus, SkyFrame,
    SkyPosition, StarCluster,
};
use test_data::{grid_pixel, pixel_to_sky, synthetic_field, uniform_mags};

const N_STARS: usize = 40;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

fn detection(id: u64, ra: f64, dec: f64, mag: Option<f64>) -> CalibratedDetection {
    CalibratedDetection {
        source_entry_id: id,
        calibrated_magnitude: mag,
        calibrated_error: mag.map(|_| 0.01),
        ra_deg: ra,
        dec_deg: dec,
        fwhm_deg: 0.0008,
        x: 500.0,
        y: 500.0,
        flags: 0,
        raw_magnitude: mag.map(|m| m - 2.5),
        raw_error: mag.map(|_| 0.01),
        near_edge: false,
    }
}

/// Five calibrated exposures of the same field in three filters.
fn calibrated_epochs() -> (Vec<f64>, Vec<CalibratedCatalog>) {
    let ref_mags = uniform_mags(100, N_STARS, 10.0, 17.0);
    let epochs = [
        ("V", 58000.1, 2.5),
        ("B", 58000.2, 2.9),
        ("V", 58001.1, 2.4),
        ("H-alpha", 58001.2, 4.0),
        ("v", 58002.1, 2.6),
    ];

    let engine = CalibrationEngine::default();
    let catalogs = epochs
        .iter()
        .enumerate()
        .map(|(i, &(filter, time, zp))| {
            let field = synthetic_field(200 + i as u64, &ref_mags, zp, 0.02);
            let exposure = field.exposure.with_metadata(filter, time);
            let outcome = engine.run(&field.reference, &exposure, MagnitudeLimits::new(0.0, 30.0));
            assert!(outcome.success(), "epoch {i} failed: {}", outcome.message);
            CalibratedCatalog::new(&exposure, &outcome.calibration.unwrap())
        })
        .collect();
    (ref_mags, catalogs)
}

fn pool_from(catalogs: &[CalibratedCatalog]) -> Vec<ClusterDetection> {
    let tagged: Vec<(u64, &CalibratedCatalog)> = catalogs
        .iter()
        .enumerate()
        .map(|(i, c)| (i as u64 + 1, c))
        .collect();
    build_pool(&tagged)
}

fn true_star(cluster: &StarCluster) -> usize {
    let id = cluster.members[0].detection.source_entry_id;
    assert!(cluster.members.iter().all(|m| m.detection.source_entry_id == id));
    (id - 1) as usize
}

#[test]
fn test_epochs_merge_into_one_cluster_per_star() {
    init_tracing();
    let (ref_mags, catalogs) = calibrated_epochs();
    let pool = pool_from(&catalogs);
    assert_eq!(pool.len(), 5 * N_STARS);

    let outcome = EpochClusterer::default().run(&pool, None);
    assert_eq!(outcome.status, RunStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.clusters.len(), N_STARS);

    for cluster in &outcome.clusters {
        assert_eq!(cluster.member_count(), 5);
        let truth = ref_mags[true_star(cluster)];

        assert_eq!(cluster.filters(), vec!["B", "HA", "V"]);
        let v = cluster.per_filter_median_magnitude["V"];
        assert!((v - truth).abs() < 0.1, "V median {v} vs {truth}");

        let lc = cluster.light_curve("V");
        assert_eq!(lc.len(), 3);
        assert!(lc.windows(2).all(|w| w[0].observation_time <= w[1].observation_time));
        assert_eq!(cluster.light_curve("HA").len(), 1);

        let min_member = cluster
            .members
            .iter()
            .filter_map(|m| m.magnitude())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(cluster.representative_magnitude, min_member);
        assert!(outcome.get(&cluster.key).is_some());
    }

    // Brightest first
    assert!(outcome
        .clusters
        .windows(2)
        .all(|w| w[0].representative_magnitude <= w[1].representative_magnitude));
}

#[test]
fn test_query_selects_one_star() {
    init_tracing();
    let (_, catalogs) = calibrated_epochs();
    let pool = pool_from(&catalogs);

    let (x, y) = grid_pixel(7, N_STARS);
    let (ra, dec) = pixel_to_sky(x, y);
    let stars = EpochClusterer::default()
        .query(&pool, &ClusterQuery::new(ra, dec))
        .unwrap();
    assert_eq!(stars.len(), 1);
    assert_eq!(true_star(&stars[0]), 7);
    assert_eq!(stars[0].member_count(), 5);
    let sep = stars[0].centroid().separation_arcsec(&SkyPosition::new(ra, dec));
    assert!(sep < 1.0, "centroid {sep}\" from the star");

    let empty = EpochClusterer::default().run(&pool, Some(&ClusterQuery::new(ra + 1.0, dec)));
    assert_eq!(empty.status, RunStatus::Failed);
    assert!(!empty.success());
    assert_eq!(empty.message, "no stars found");
}

#[test]
fn test_query_in_other_units_and_frame() {
    init_tracing();
    let (_, catalogs) = calibrated_epochs();
    let pool = pool_from(&catalogs);

    let (x, y) = grid_pixel(12, N_STARS);
    let (ra, dec) = pixel_to_sky(x, y);
    // ICRS differs from FK5 by ~20 mas, well inside a 0.05' box
    let query = ClusterQuery::in_frame(ra * 60.0, dec * 60.0, AngleUnit::Arcminute, SkyFrame::Icrs)
        .unwrap()
        .with_radius_in(0.05, AngleUnit::Arcminute);
    let outcome = EpochClusterer::default().run(&pool, Some(&query));
    assert_eq!(outcome.status, RunStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.clusters.len(), 1);
    assert_eq!(true_star(&outcome.clusters[0]), 12);
}

#[test]
fn test_reclustering_centroids_is_stable() {
    init_tracing();
    let (_, catalogs) = calibrated_epochs();
    let clusterer = EpochClusterer::default();
    let clusters = clusterer.cluster(&pool_from(&catalogs)).unwrap();

    let centroids: Vec<ClusterDetection> = clusters
        .iter()
        .enumerate()
        .map(|(i, c)| {
            ClusterDetection::new(
                i as u64,
                0,
                0.0,
                "V",
                detection(i as u64, c.centroid_ra_deg, c.centroid_dec_deg, Some(c.representative_magnitude)),
            )
        })
        .collect();
    let again = clusterer.cluster(&centroids).unwrap();

    assert_eq!(again.len(), clusters.len());
    for (a, b) in clusters.iter().zip(&again) {
        assert_eq!(a.key, b.key);
        assert_eq!(a.centroid_ra_deg, b.centroid_ra_deg);
        assert_eq!(a.centroid_dec_deg, b.centroid_dec_deg);
    }
}

#[test]
fn test_two_close_detections_form_one_star() {
    init_tracing();
    let ra = 150.0;
    let dec = 2.0;
    let pool = vec![
        ClusterDetection::new(1, 1, 58000.0, "V", detection(1, ra, dec, Some(12.3))),
        ClusterDetection::new(2, 2, 58001.0, "V", detection(1, ra, dec + 1.0 / 3600.0, Some(12.1))),
    ];
    let outcome = EpochClusterer::default().run(&pool, None);
    assert!(outcome.success());
    assert_eq!(outcome.clusters.len(), 1);

    let star = &outcome.clusters[0];
    assert_eq!(star.member_ids(), vec![1, 2]);
    assert!((star.centroid_ra_deg - ra).abs() < 1e-12);
    assert!((star.centroid_dec_deg - (dec + 0.5 / 3600.0)).abs() < 1e-12);
    assert_eq!(star.representative_magnitude, 12.1);
    assert!((star.per_filter_median_magnitude["V"] - 12.2).abs() < 1e-12);
}

#[test]
fn test_empty_pool_reports_no_stars() {
    init_tracing();
    let outcome = EpochClusterer::default().run(&[], None);
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.message, "no stars found");
    assert!(outcome.clusters.is_empty());

    // Detections without photometry are not clustered
    let pool = vec![ClusterDetection::new(1, 1, 58000.0, "V", detection(1, 150.0, 2.0, None))];
    let outcome = EpochClusterer::default().run(&pool, None);
    assert!(!outcome.success());
    assert_eq!(outcome.message, "no stars found");
}
