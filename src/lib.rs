// Control stack for the absorber attractor assembly: a three-channel piezo
// platform whose tilt and separation are commanded through either a
// closed-loop position controller (BPC303, APT binary protocol) or an
// open-loop voltage controller (MDT693B, ASCII protocol).
//
// Everything is synchronous and single-threaded by design: one in-flight
// request per device, bounded read timeouts, no background polling.

pub mod assembly;
pub mod error;
pub mod piezo;

pub use assembly::{AssemblyConfig, AttractorAssembly, Axis, Target};
pub use error::{Result, RigError};
pub use piezo::{Actuator, Bpc303, Channel, ControlMode, LoopControl, Mdt693b};
