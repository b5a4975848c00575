// Assembly control module
//
// Provides:
// - tilt geometry of the three-point platform (axis matrices, safe-angle
//   helper)
// - the AttractorAssembly controller mapping rotations and translations
//   onto per-channel actuator targets

pub mod controller;
pub mod geometry;

pub use controller::{AssemblyConfig, AttractorAssembly, POSITION_TRAVEL_SCALE, VOLTS_PER_MICRON};
pub use geometry::{axis_matrix, max_safe_angle, Axis, Target, DEFAULT_SIDE_CM};
