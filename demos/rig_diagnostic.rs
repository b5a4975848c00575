// Rig diagnostic: read-mostly check that the piezo controller is alive.
//
// Opening the controller blinks each channel's front-panel LED (watch the
// rack); after that this tool only reads registers - it commands no motion.
//
// Usage: cargo run --example rig_diagnostic -- [port]
// Example: cargo run --example rig_diagnostic -- /dev/ttyUSB0

use attractor_rig::piezo::{Bpc303, Channel};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debug".parse().unwrap()),
        )
        .init();

    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    println!("Attractor rig diagnostic (read-only after the identify blink)");
    println!("Serial port: {}", port);
    println!();

    println!("Step 1: Opening controller (each channel LED should blink)...");
    let mut controller = match Bpc303::open(&port) {
        Ok(c) => {
            println!("  ✓ Controller opened");
            c
        }
        Err(e) => {
            println!("  ✗ Failed to open controller: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Check the port path is correct");
            println!("  - Verify the USB cable and that the rack is powered");
            println!("  - Check no other program holds the port open");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading per-channel state...");
    let mut all_ok = true;
    for ch in Channel::ALL {
        print!("  Channel {}: ", ch.number());
        match controller.get_position(ch) {
            Ok(pos) => {
                let mode = controller.get_mode(ch)?;
                let max_v = controller.get_max_output_voltage(ch)?;
                let pi = controller.get_pi_constants(ch)?;
                println!(
                    "{:.3} um, {:?}, max {:.1} V, P={} I={}",
                    pos, mode, max_v, pi.proportional, pi.integral
                );
            }
            Err(e) => {
                println!("✗ {}", e);
                all_ok = false;
            }
        }
    }
    println!();

    println!("Step 3: Status snapshot for each channel...");
    for ch in Channel::ALL {
        match controller.get_status(ch) {
            Ok(status) => println!(
                "  Channel {}: {:.3} um, {:.2} V, actuator {}, loop {}",
                ch.number(),
                status.position,
                status.voltage,
                if status.actuator_connected() {
                    "connected"
                } else {
                    "NOT CONNECTED"
                },
                if status.closed_loop() { "closed" } else { "open" },
            ),
            Err(e) => {
                println!("  Channel {}: ✗ {}", ch.number(), e);
                all_ok = false;
            }
        }
    }
    println!();

    controller.close()?;

    if all_ok {
        println!("All channels responding. Safe to run: cargo run --example rig_test");
    } else {
        println!("Some channels did not respond - fix the connection before any motion test.");
    }

    Ok(())
}
