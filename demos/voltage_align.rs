// Voltage-mode alignment sweep over the MDT693B open-loop controller.
//
// Drives the assembly through small tilts about each axis from the normal
// orientation, printing the commanded voltages so the sweep can be compared
// against an external capacitance or camera measurement.
//
// Usage: cargo run --example voltage_align -- [port]

use attractor_rig::piezo::Mdt693b;
use attractor_rig::{AssemblyConfig, AttractorAssembly, Axis};
use std::thread::sleep;
use std::time::Duration;

/// Normal-orientation voltage state of the rig
const NORMAL_STATE: [f64; 3] = [80.0, 48.0, 80.0];

const SWEEP_STEPS: usize = 11;
const SWEEP_ANGLE_RAD: f64 = 2.0e-4;
const SETTLE: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB1".to_string());

    let mut controller = Mdt693b::open(&port)?;
    println!("Controller: {}", controller.identity()?.trim());

    let mut assembly = AttractorAssembly::new(controller, AssemblyConfig::voltage_mode())?;

    println!("Moving to normal orientation {:?} V", NORMAL_STATE);
    assembly.set_all(NORMAL_STATE)?;
    sleep(SETTLE);

    for axis in [Axis::Theta, Axis::Phi] {
        println!();
        println!("Sweeping {:?}, ±{:.1e} rad in {} steps", axis, SWEEP_ANGLE_RAD, SWEEP_STEPS);
        println!("angle_rad\tv1\tv2\tv3");

        for step in 0..SWEEP_STEPS {
            let angle = -SWEEP_ANGLE_RAD
                + 2.0 * SWEEP_ANGLE_RAD * step as f64 / (SWEEP_STEPS - 1) as f64;
            let targets = assembly.rotate(angle, axis, Some(NORMAL_STATE))?;
            sleep(SETTLE);
            println!(
                "{:+.3e}\t{:.3}\t{:.3}\t{:.3}",
                angle, targets[0], targets[1], targets[2]
            );
        }

        // Back to the reference state between axes
        assembly.set_all(NORMAL_STATE)?;
        sleep(SETTLE);
    }

    println!();
    println!("Sweep complete; assembly returned to the normal orientation.");
    assembly.close()?;
    Ok(())
}
