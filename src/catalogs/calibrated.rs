//! Calibrated catalog output.
//!
//! One exposure's calibration is written either as a text catalog (header
//! block, one summary line, one row per detection) for downstream tools, or
//! as an rkyv snapshot that loads back without parsing.

use std::io::Write;
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::calibration::{CalibratedDetection, Calibration, CalibrationResult};
use crate::detection::Exposure;
use crate::error::Result;

/// Token written in place of a missing value.
pub const NULL_TOKEN: &str = "null";

const HEADER: &str = "\
#   1 NUMBER                 Running object number
#   2 MAG_CAL                Calibrated Kron-like elliptical aperture magnitude         [mag]
#   3 MAG_CAL_ERR            Error of MAG_CAL                                           [mag]
#   4 X_IMAGE                Object position along x                                    [pixel]
#   5 Y_IMAGE                Object position along y                                    [pixel]
#   6 ALPHA_J2000            Right ascension of barycenter (J2000)                      [deg]
#   7 DELTA_J2000            Declination of barycenter (J2000)                          [deg]
#   8 FWHM_WORLD             FWHM assuming a gaussian core                              [deg]
#   9 FLAGS                  Extraction flags
#  10 MAG_AUTO               Kron-like elliptical aperture magnitude                    [mag]
#  11 MAGERR_AUTO            RMS error for AUTO magnitude                               [mag]
# Extra info in first line contains:
# a) Time of Observations [days]
# b) Number of detected stars
# c) Number of detected stars used for calibration
# d) Median Offset in calibration [mag]
# e) Limiting Magnitude [mag]
# f) Fit parameters in calibration
";

/// Everything persisted for one calibrated exposure.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct CalibratedCatalog {
    /// Observation time in days.
    pub observation_time: f64,
    pub filter: String,
    pub result: CalibrationResult,
    pub detections: Vec<CalibratedDetection>,
}

fn fmt_opt(value: Option<f64>, width: usize, precision: usize) -> String {
    match value.filter(|v| v.is_finite()) {
        Some(v) => format!("{v:width$.precision$}"),
        None => format!("{:>width$}", NULL_TOKEN),
    }
}

impl CalibratedCatalog {
    pub fn new(exposure: &Exposure, calibration: &Calibration) -> Self {
        Self {
            observation_time: exposure.observation_time,
            filter: exposure.filter.clone(),
            result: calibration.result.clone(),
            detections: calibration.detections.clone(),
        }
    }

    /// Write the text catalog.
    pub fn write_text<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(HEADER.as_bytes())?;

        let r = &self.result;
        let params: Vec<String> = r.fit_parameters.iter().map(|p| p.to_string()).collect();
        writeln!(
            w,
            "{:12.4} {:5} {:5} {:8.4} {} {}",
            self.observation_time,
            self.detections.len(),
            r.stars_used,
            r.median_offset,
            fmt_opt(r.limiting_magnitude, 6, 3),
            params.join(" ")
        )?;

        for d in &self.detections {
            writeln!(
                w,
                "{:5} {} {} {:8.3} {:8.3} {:11.7} {:11.7} {:11.9} {:3} {} {}",
                d.source_entry_id,
                fmt_opt(d.calibrated_magnitude, 8, 4),
                fmt_opt(d.calibrated_error, 6, 4),
                d.x,
                d.y,
                d.ra_deg,
                d.dec_deg,
                d.fwhm_deg,
                d.flags,
                fmt_opt(d.raw_magnitude, 8, 4),
                fmt_opt(d.raw_error, 6, 4),
            )?;
        }
        Ok(())
    }

    pub fn write_text_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let mut buf = Vec::new();
        self.write_text(&mut buf)?;
        write_atomically(path, &buf)?;
        info!("Wrote calibrated catalog {} ({} rows)", path.display(), self.detections.len());
        Ok(())
    }

    /// Serialize to rkyv bytes.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Save as an rkyv snapshot in one bulk write: a temporary sibling file is
    /// written first and then renamed over `path`.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        write_atomically(path, &bytes)?;
        info!("Saved calibrated catalog to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let catalog = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded calibrated catalog {}: {} detections, {} stars used",
            path.display(),
            catalog.detections.len(),
            catalog.result.stars_used
        );
        Ok(catalog)
    }
}

/// Convenience wrapper around [`CalibratedCatalog::write_text`].
pub fn write_calibrated_catalog<W: Write>(writer: W, catalog: &CalibratedCatalog) -> Result<()> {
    catalog.write_text(writer)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
