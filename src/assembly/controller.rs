// High-level controller for the absorber attractor assembly.
//
// Maps triangle-symmetric rotation and translation commands onto the three
// collinear actuator targets, driving whichever backend it was built with.

use tracing::{debug, info, warn};

use super::geometry::{rotation_adjustments, Axis, Target, DEFAULT_SIDE_CM};
use crate::error::{Result, RigError};
use crate::piezo::{Actuator, Channel, ControlMode, LoopControl};

/// Piezo stroke per drive volt for the 710-series stacks: 150 V sweeps
/// 1150 um of travel
pub const VOLTS_PER_MICRON: f64 = 150.0 / 1150.0;

/// Travel-range calibration factor applied by the position backend.
///
/// Inherited from the commissioning calibration as the ratio 10/150; whether
/// it is a genuine gear ratio or a stale unit conversion is under review, so
/// it stays a named parameter rather than being folded into the matrices.
pub const POSITION_TRAVEL_SCALE: f64 = 10.0 / 150.0;

/// Assembly calibration, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblyConfig {
    /// Triangle side length in cm
    pub side_cm: f64,
    /// Backend drive units per micron of vertex travel
    pub drive_per_micron: f64,
    /// Backend travel-range calibration factor
    pub travel_scale: f64,
}

impl AssemblyConfig {
    /// Defaults for the closed-loop position backend (targets in microns)
    pub fn position_mode() -> Self {
        Self {
            side_cm: DEFAULT_SIDE_CM,
            drive_per_micron: 1.0,
            travel_scale: POSITION_TRAVEL_SCALE,
        }
    }

    /// Defaults for the open-loop voltage backend (targets in volts)
    pub fn voltage_mode() -> Self {
        Self {
            side_cm: DEFAULT_SIDE_CM,
            drive_per_micron: VOLTS_PER_MICRON,
            travel_scale: 1.0,
        }
    }
}

/// Geometry controller for the three-actuator platform.
///
/// Angle and distance inputs are deliberately not range-checked here:
/// keeping the platform clear of the opposing surface requires an
/// independent separation measurement, so callers derive their own limit
/// (see [`super::geometry::max_safe_angle`]) before commanding a rotation.
/// Silent clamping would hide an unsafe configuration.
pub struct AttractorAssembly<A: Actuator> {
    actuator: A,
    config: AssemblyConfig,
}

impl<A: Actuator> AttractorAssembly<A> {
    /// Wrap a backend, running its safety setup (output limits, gains)
    /// before any motion can be commanded
    pub fn new(mut actuator: A, config: AssemblyConfig) -> Result<Self> {
        actuator.prepare()?;
        info!(
            "Assembly ready: side {} cm, {} drive/um, travel scale {}",
            config.side_cm, config.drive_per_micron, config.travel_scale
        );
        Ok(Self { actuator, config })
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Direct access to the backend, for per-channel operations the
    /// geometry layer does not cover
    pub fn actuator(&mut self) -> &mut A {
        &mut self.actuator
    }

    /// Command all three channels, in channel order. A scalar target is
    /// broadcast to every channel.
    pub fn set_all(&mut self, target: impl Into<Target>) -> Result<()> {
        let values = target.into().spread();
        for ch in Channel::ALL {
            self.actuator.set_target(ch, values[ch.index()])?;
        }
        Ok(())
    }

    /// Read all three channels, in channel order.
    ///
    /// On closed-loop hardware the readings come from the measurement
    /// register, so they may differ from the last commanded targets.
    pub fn get_all(&mut self) -> Result<[f64; 3]> {
        let mut values = [0.0; 3];
        for ch in Channel::ALL {
            values[ch.index()] = self.actuator.get_target(ch)?;
        }
        Ok(values)
    }

    /// Rotate the platform about a tilt axis by `angle` radians and return
    /// the commanded targets.
    ///
    /// With `start = None` the move is anchored on a fresh [`get_all`]
    /// reading; passing the previous return value instead re-anchors on the
    /// last commanded targets, which avoids accumulating measurement drift
    /// over repeated moves (the original survey scripts do exactly that).
    ///
    /// [`get_all`]: Self::get_all
    pub fn rotate(&mut self, angle: f64, axis: Axis, start: Option<[f64; 3]>) -> Result<[f64; 3]> {
        let start = match start {
            Some(values) => values,
            None => self.get_all()?,
        };
        let adjustments = rotation_adjustments(
            axis,
            self.config.side_cm,
            angle,
            self.config.drive_per_micron,
            self.config.travel_scale,
        );
        debug!(
            "Rotate {:?} by {} rad: adjustments {:?}",
            axis, angle, adjustments
        );

        let mut targets = [0.0; 3];
        for i in 0..3 {
            targets[i] = start[i] + adjustments[i];
        }
        self.set_all(targets)?;
        Ok(targets)
    }

    /// Move all three channels by the same scalar distance, preserving the
    /// platform's plane, and return the commanded targets.
    ///
    /// Only a scalar is meaningful here; a per-channel vector would be a
    /// disguised tilt, so it is rejected before any command is issued.
    pub fn translate(
        &mut self,
        distance: impl Into<Target>,
        start: Option<[f64; 3]>,
    ) -> Result<[f64; 3]> {
        let distance = match distance.into() {
            Target::Scalar(d) => d,
            Target::Vector(_) => return Err(RigError::ScalarRequired),
        };
        let start = match start {
            Some(values) => values,
            None => self.get_all()?,
        };

        let targets = start.map(|v| v + distance);
        self.set_all(targets)?;
        Ok(targets)
    }

    /// Release the backend's connection
    pub fn close(&mut self) -> Result<()> {
        self.actuator.close()
    }
}

impl<A: Actuator + LoopControl> AttractorAssembly<A> {
    /// Open every channel's servo loop
    pub fn open_loop_all(&mut self) -> Result<()> {
        for ch in Channel::ALL {
            self.actuator.set_mode(ch, ControlMode::OpenLoop)?;
        }
        Ok(())
    }

    /// Close every channel's servo loop
    pub fn closed_loop_all(&mut self) -> Result<()> {
        for ch in Channel::ALL {
            self.actuator.set_mode(ch, ControlMode::ClosedLoop)?;
        }
        Ok(())
    }
}

impl<A: Actuator> Drop for AttractorAssembly<A> {
    fn drop(&mut self) {
        // Idempotent, so an earlier explicit close makes this a no-op
        if let Err(e) = self.actuator.close() {
            warn!("Failed to close actuator on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RigError;
    use crate::piezo::{Bpc303, MockTransport};

    fn mock_assembly() -> AttractorAssembly<Bpc303<MockTransport>> {
        let driver = Bpc303::with_transport(MockTransport::new());
        AttractorAssembly::new(driver, AssemblyConfig::position_mode()).unwrap()
    }

    #[test]
    fn test_scalar_broadcast_reaches_all_channels() {
        let mut assembly = mock_assembly();
        assembly.set_all(4.0).unwrap();
        let values = assembly.get_all().unwrap();
        for v in values {
            assert!((v - 4.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_translate_rejects_vector_before_any_write() {
        let mut assembly = mock_assembly();
        let frames_before = assembly.actuator().transport().sent_frames().len();

        let result = assembly.translate([1.0, 2.0, 3.0], None);
        assert!(matches!(result, Err(RigError::ScalarRequired)));

        let frames_after = assembly.actuator().transport().sent_frames().len();
        assert_eq!(frames_before, frames_after, "no frame may reach the wire");
    }

    #[test]
    fn test_translate_scalar_moves_uniformly() {
        let mut assembly = mock_assembly();
        assembly.set_all([1.0, 2.0, 3.0]).unwrap();
        let targets = assembly.translate(0.5, None).unwrap();
        for (t, expect) in targets.iter().zip([1.5, 2.5, 3.5]) {
            assert!((t - expect).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rotate_zero_angle_is_identity() {
        let mut assembly = mock_assembly();
        let start = [5.0, 5.0, 5.0];
        let targets = assembly.rotate(0.0, Axis::Theta, Some(start)).unwrap();
        assert_eq!(targets, start);
    }

    /// Minimal voltage backend: three registers, no servo loop
    struct VoltageStub {
        volts: [f64; 3],
    }

    impl Actuator for VoltageStub {
        fn set_target(&mut self, channel: Channel, value: f64) -> crate::error::Result<()> {
            self.volts[channel.index()] = value;
            Ok(())
        }

        fn get_target(&mut self, channel: Channel) -> crate::error::Result<f64> {
            Ok(self.volts[channel.index()])
        }

        fn close(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_voltage_mode_rotation_is_unscaled() {
        use crate::assembly::geometry::axis_matrix;

        let stub = VoltageStub { volts: [0.0; 3] };
        let mut assembly = AttractorAssembly::new(stub, AssemblyConfig::voltage_mode()).unwrap();
        let config = *assembly.config();

        // The alignment rig's usual normal-orientation state, in volts
        let start = [80.0, 48.0, 80.0];
        let angle = 2.0e-4;
        let targets = assembly.rotate(angle, Axis::Phi, Some(start)).unwrap();

        let matrix = axis_matrix(Axis::Phi, config.side_cm);
        for i in 0..3 {
            let expected = start[i] - matrix[i] * angle.sin() * VOLTS_PER_MICRON;
            assert!((targets[i] - expected).abs() < 1e-9);
        }
        // No travel-range factor on this backend
        assert_eq!(config.travel_scale, 1.0);
    }

    #[test]
    fn test_safety_setup_precedes_first_motion() {
        use crate::piezo::apt::msg;

        let mut assembly = mock_assembly();
        assembly.set_all(1.0).unwrap();

        let sent = assembly.actuator().transport().sent_frames();
        let first_motion = sent
            .iter()
            .position(|f| f.id == msg::PZ_SET_OUTPUTPOS)
            .expect("a motion frame");
        let limit_writes = sent
            .iter()
            .take(first_motion)
            .filter(|f| f.id == msg::PZ_SET_OUTPUTMAXVOLTS || f.id == msg::PZ_SET_PICONSTS)
            .count();
        // Three channels, two limit registers each, all before any motion
        assert_eq!(limit_writes, 6);
    }
}
