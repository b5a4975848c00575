// Piezo controller stack
//
// Provides:
// - APT binary framing, endpoint addressing and the serial transport
// - BPC303 closed-loop driver (position backend)
// - MDT693B ASCII driver (open-loop voltage backend)
// - the Actuator/LoopControl seam the assembly controller drives through
// - a scripted mock transport for hardware-free tests

pub mod actuator;
pub mod apt;
pub mod bpc303;
pub mod mdt693b;
pub mod mock;

pub use actuator::{Actuator, LoopControl};
pub use apt::{bay_of, AptMessage, Channel, SerialTransport, Transport};
pub use bpc303::{Bpc303, ControlMode, PiConstants, PzStatus, MICRONS_PER_COUNT};
pub use mdt693b::Mdt693b;
pub use mock::MockTransport;
