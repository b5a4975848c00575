// Tilt geometry of the three-point piezo platform.
//
// The actuators sit at the vertices of an equilateral triangle and move
// along parallel lines; a rotation about either symmetry axis is a fixed
// linear combination of the three vertex displacements.

use std::str::FromStr;

use crate::error::{Result, RigError};

/// Default triangle side length, from the assembly's CAD model (cm)
pub const DEFAULT_SIDE_CM: f64 = 9.128;

pub const MICRONS_PER_CM: f64 = 1.0e4;

/// The two independent tilt directions of the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Tilt that lifts vertex 1 against vertices 2 and 3
    Theta,
    /// Tilt about the axis through vertex 1
    Phi,
}

impl FromStr for Axis {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Axis> {
        match s {
            "theta" => Ok(Axis::Theta),
            "phi" => Ok(Axis::Phi),
            other => Err(RigError::UnknownAxis(other.to_string())),
        }
    }
}

/// A per-call channel target: one value for all three channels, or an
/// explicit per-channel vector
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Scalar(f64),
    Vector([f64; 3]),
}

impl From<f64> for Target {
    fn from(value: f64) -> Self {
        Target::Scalar(value)
    }
}

impl From<[f64; 3]> for Target {
    fn from(values: [f64; 3]) -> Self {
        Target::Vector(values)
    }
}

impl Target {
    /// Per-channel values, broadcasting a scalar to all three channels
    pub fn spread(self) -> [f64; 3] {
        match self {
            Target::Scalar(v) => [v; 3],
            Target::Vector(v) => v,
        }
    }
}

/// Lever-arm matrix for a tilt axis: how one radian of rotation projects
/// onto the three vertex displacements, in microns of travel per unit sine.
pub fn axis_matrix(axis: Axis, side_cm: f64) -> [f64; 3] {
    let lever = side_cm * MICRONS_PER_CM;
    match axis {
        Axis::Theta => {
            let s = -f64::sqrt(3.0) / 4.0 * lever;
            [s, -0.5 * s, -0.5 * s]
        }
        Axis::Phi => [0.0, -0.5 * lever, 0.5 * lever],
    }
}

/// Per-channel drive adjustments for a rotation.
///
/// `drive_per_micron` converts vertex travel to the backend's drive unit;
/// `travel_scale` is the backend's travel-range calibration factor.
pub fn rotation_adjustments(
    axis: Axis,
    side_cm: f64,
    angle: f64,
    drive_per_micron: f64,
    travel_scale: f64,
) -> [f64; 3] {
    let matrix = axis_matrix(axis, side_cm);
    matrix.map(|coeff| -coeff * angle.sin() * drive_per_micron * travel_scale)
}

/// Largest rotation angle (radians) that keeps the platform clear of a
/// surface a measured `min_separation_um` away.
///
/// The controller itself does not range-check angles; callers are expected
/// to derive their limit from an independent separation measurement and stay
/// inside it.
pub fn max_safe_angle(min_separation_um: f64, side_cm: f64) -> f64 {
    (min_separation_um / (side_cm * MICRONS_PER_CM / 2.0)).asin()
}
