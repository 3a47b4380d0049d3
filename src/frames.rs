//! Angle units and celestial frames accepted for query positions.
//!
//! Detections carry FK5 J2000 right ascension and declination, so a position
//! given in another frame is rotated into FK5 before it is compared with them.

use nalgebra::{Matrix3, Vector3};

use crate::error::{PhotocalError, Result};
use crate::skymatch::SkyPosition;

const ARCSEC_TO_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// ICRS to galactic rotation, row-major (Hipparcos definition of the galactic
/// pole and origin).
#[allow(clippy::excessive_precision)]
const ICRS_TO_GALACTIC: [[f64; 3]; 3] = [
    [-0.054875560416215368, -0.873437090234885049, -0.483835015548713227],
    [0.494109427875583674, -0.444829629960011178, 0.746982244497218891],
    [-0.867666149019004701, -0.198076373431201528, 0.455983776175066922],
];

/// Unit of an angle given at the query boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AngleUnit {
    #[default]
    Degree,
    Arcminute,
    Arcsecond,
    Radian,
}

impl AngleUnit {
    pub fn to_degrees(self, value: f64) -> f64 {
        match self {
            AngleUnit::Degree => value,
            AngleUnit::Arcminute => value / 60.0,
            AngleUnit::Arcsecond => value / 3600.0,
            AngleUnit::Radian => value.to_degrees(),
        }
    }

    pub fn to_arcsec(self, value: f64) -> f64 {
        match self {
            AngleUnit::Degree => value * 3600.0,
            AngleUnit::Arcminute => value * 60.0,
            AngleUnit::Arcsecond => value,
            AngleUnit::Radian => value.to_degrees() * 3600.0,
        }
    }
}

/// Celestial frame of a query position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkyFrame {
    /// FK5, equinox J2000. The frame detections are stored in.
    #[default]
    Fk5,
    Icrs,
    /// Galactic longitude and latitude.
    Galactic,
}

impl SkyFrame {
    /// Rotate `(lon, lat)` in this frame to FK5 J2000 degrees.
    ///
    /// Fails on non-finite input or a latitude beyond ±90°.
    pub fn to_fk5(self, lon: f64, lat: f64, units: AngleUnit) -> Result<SkyPosition> {
        let lon_deg = units.to_degrees(lon);
        let lat_deg = units.to_degrees(lat);
        if !lon_deg.is_finite() || !lat_deg.is_finite() || lat_deg.abs() > 90.0 {
            return Err(PhotocalError::InvalidInput(format!(
                "position ({lon}, {lat}) {units:?} in {self:?}"
            )));
        }
        let fk5 = match self {
            SkyFrame::Fk5 => return Ok(SkyPosition::new(lon_deg.rem_euclid(360.0), lat_deg)),
            SkyFrame::Icrs => icrs_to_fk5() * unit_vector(lon_deg, lat_deg),
            SkyFrame::Galactic => icrs_to_fk5() * galactic_to_icrs() * unit_vector(lon_deg, lat_deg),
        };
        Ok(from_unit_vector(&fk5))
    }
}

fn unit_vector(lon_deg: f64, lat_deg: f64) -> Vector3<f64> {
    let (lonsin, loncos) = lon_deg.to_radians().sin_cos();
    let (latsin, latcos) = lat_deg.to_radians().sin_cos();
    Vector3::new(latcos * loncos, latcos * lonsin, latsin)
}

fn from_unit_vector(v: &Vector3<f64>) -> SkyPosition {
    let ra = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    let dec = v.z.atan2(v.x.hypot(v.y)).to_degrees();
    SkyPosition::new(ra, dec)
}

fn galactic_to_icrs() -> Matrix3<f64> {
    let m = ICRS_TO_GALACTIC;
    Matrix3::new(
        m[0][0], m[0][1], m[0][2], //
        m[1][0], m[1][1], m[1][2], //
        m[2][0], m[2][1], m[2][2],
    )
    .transpose()
}

/// IAU 2000 frame bias from ICRS to FK5 J2000: `Rx(−dε)·Ry(dψ·sin ε0)·Rz(dα0)`.
fn icrs_to_fk5() -> Matrix3<f64> {
    const D_PSI: f64 = -0.041775 * ARCSEC_TO_RAD;
    const D_EPS: f64 = -0.0068192 * ARCSEC_TO_RAD;
    const D_RA0: f64 = -0.0146 * ARCSEC_TO_RAD;
    const EPS0: f64 = 84381.448 * ARCSEC_TO_RAD;
    rot_x(-D_EPS) * rot_y(D_PSI * EPS0.sin()) * rot_z(D_RA0)
}

// Frame rotations: the coordinates of a fixed vector in axes turned by `a`.

fn rot_x(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(1.0, 0.0, 0.0, 0.0, c, s, 0.0, -s, c)
}

fn rot_y(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, 0.0, -s, 0.0, 1.0, 0.0, s, 0.0, c)
}

fn rot_z(a: f64) -> Matrix3<f64> {
    let (s, c) = a.sin_cos();
    Matrix3::new(c, s, 0.0, -s, c, 0.0, 0.0, 0.0, 1.0)
}
