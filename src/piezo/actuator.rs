// Backend seam between the assembly controller and the piezo hardware.

use super::apt::Channel;
use super::bpc303::ControlMode;
use crate::error::Result;

/// A three-channel actuation backend.
///
/// Targets are in the backend's drive unit: microns for the closed-loop
/// position backend, volts for the open-loop voltage backend. The assembly
/// controller folds the difference into its calibration constants.
pub trait Actuator {
    /// One-time safety setup, run before the first motion command
    fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Command one channel's target
    fn set_target(&mut self, channel: Channel, value: f64) -> Result<()>;

    /// Read one channel's current value. May legitimately differ from the
    /// last commanded target on closed-loop hardware.
    fn get_target(&mut self, channel: Channel) -> Result<f64>;

    /// Release the underlying connection. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Servo-loop control, for backends that have one
pub trait LoopControl {
    fn set_mode(&mut self, channel: Channel, mode: ControlMode) -> Result<()>;
    fn get_mode(&mut self, channel: Channel) -> Result<ControlMode>;
}
