// Rig motion test: careful, step-by-step check of assembly-level control.
//
// IMPORTANT: Run rig_diagnostic FIRST to verify communication, and make
// sure the attractor has clearance before commanding any motion.
//
// Usage: cargo run --example rig_test -- [port]
//
// Safety features:
// - Explicit confirmation before any motion
// - Survey-scale moves only (sub-micron translations, sub-millirad tilts)
// - Returns to the start position at the end

use attractor_rig::assembly::geometry::max_safe_angle;
use attractor_rig::piezo::Bpc303;
use attractor_rig::{AssemblyConfig, AttractorAssembly, Axis};
use std::io::{self, Write};
use std::thread::sleep;
use std::time::Duration;

const TEST_TRANSLATE_UM: f64 = 0.5;
const TEST_ANGLE_RAD: f64 = 2.0e-4;
const SETTLE: Duration = Duration::from_millis(500);

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush().unwrap();
    let mut input = String::new();
    io::stdin().read_line(&mut input).unwrap();
    input.trim().eq_ignore_ascii_case("y")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    println!("Attractor rig motion test (WILL move the platform)");
    println!("Serial port: {}", port);
    println!();

    if !confirm("Have you run rig_diagnostic and verified all channels respond?") {
        println!("Please run: cargo run --example rig_diagnostic -- {}", port);
        return Ok(());
    }
    if !confirm("Does the platform have clearance for ~1 um of travel?") {
        println!("Measure the gap first; see max_safe_angle for the tilt limit.");
        return Ok(());
    }

    println!();
    println!("Opening controller and configuring safe limits...");
    let driver = Bpc303::open(&port)?;
    let config = AssemblyConfig::position_mode();
    let mut assembly = AttractorAssembly::new(driver, config)?;
    println!("  ✓ Limits configured");

    let safe_tilt = max_safe_angle(100.0, config.side_cm);
    println!(
        "  For reference: a 100 um gap allows tilts up to {:.2e} rad",
        safe_tilt
    );
    println!();

    // ========== Step 1: close the servo loops ==========
    println!("Step 1: Closing all servo loops (smooth transition)...");
    if !confirm("Proceed?") {
        return Ok(());
    }
    assembly.closed_loop_all()?;
    sleep(SETTLE);
    println!("  ✓ Loops closed");
    println!();

    // ========== Step 2: read the starting point ==========
    let start = assembly.get_all()?;
    println!(
        "Step 2: Start position: [{:.4}, {:.4}, {:.4}] um",
        start[0], start[1], start[2]
    );
    println!();

    // ========== Step 3: small translation and back ==========
    println!(
        "Step 3: Translating by {:+.2} um and back...",
        TEST_TRANSLATE_UM
    );
    if !confirm("Proceed with translation?") {
        return Ok(());
    }
    let up = assembly.translate(TEST_TRANSLATE_UM, Some(start))?;
    sleep(SETTLE);
    println!("  Commanded: [{:.4}, {:.4}, {:.4}] um", up[0], up[1], up[2]);
    let measured = assembly.get_all()?;
    println!(
        "  Measured:  [{:.4}, {:.4}, {:.4}] um",
        measured[0], measured[1], measured[2]
    );
    assembly.set_all(start)?;
    sleep(SETTLE);
    println!("  ✓ Returned to start");
    println!();

    // ========== Step 4: tiny tilt about each axis ==========
    println!("Step 4: Tilting by {:+.1e} rad about each axis...", TEST_ANGLE_RAD);
    if !confirm("Proceed with tilts?") {
        assembly.set_all(start)?;
        return Ok(());
    }
    for axis in [Axis::Theta, Axis::Phi] {
        let tilted = assembly.rotate(TEST_ANGLE_RAD, axis, Some(start))?;
        sleep(SETTLE);
        println!(
            "  {:?}: commanded [{:.4}, {:.4}, {:.4}] um",
            axis, tilted[0], tilted[1], tilted[2]
        );
        assembly.set_all(start)?;
        sleep(SETTLE);
    }
    println!("  ✓ Returned to start");
    println!();

    println!("Test complete. The assembly is back at its start position.");
    assembly.close()?;
    Ok(())
}
