// MDT693B three-channel open-loop piezo voltage controller.
//
// ASCII line protocol: commands are carriage-return-terminated key=value
// writes ("xvoltage=12.5\r"); queries ("xvoltage? \r") answer with a
// decimal wrapped in bracket/prompt decoration that has to be stripped
// before parsing.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use super::actuator::Actuator;
use super::apt::Channel;
use crate::error::{Result, RigError};

pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Hard output limit of the amplifier
pub const MAX_VOLTS: f64 = 150.0;

/// Decoration characters around query replies
const DECORATION: &[char] = &['[', ']', '>', '*', ' ', '\r', '\n'];

/// Front-panel axis name for a channel
fn axis_name(channel: Channel) -> &'static str {
    match channel {
        Channel::Ch1 => "x",
        Channel::Ch2 => "y",
        Channel::Ch3 => "z",
    }
}

/// Strip reply decoration and parse the remaining decimal
fn parse_reply(raw: &str) -> Result<f64> {
    let cleaned: String = raw.chars().filter(|c| !DECORATION.contains(c)).collect();
    cleaned
        .parse()
        .map_err(|_| RigError::Malformed(format!("unparseable voltage reply {:?}", raw)))
}

/// Driver for the open-loop voltage controller
pub struct Mdt693b {
    port: Option<Box<dyn SerialPort>>,
}

impl Mdt693b {
    /// Open the controller's serial line: 115200 baud, 8-N-1
    pub fn open(port_name: &str) -> Result<Self> {
        info!("Opening MDT693B on {}", port_name);
        let port = serialport::new(port_name, DEFAULT_BAUDRATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port: Some(port) })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(RigError::PortClosed)
    }

    /// Read one reply line, ending at the first terminator or at the read
    /// timeout. An empty read means the device never answered.
    fn read_line(&mut self, request: &str) -> Result<String> {
        let port = self.port_mut()?;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\r' || byte[0] == b'\n' {
                        if !line.is_empty() {
                            break;
                        }
                        // Skip terminators left over from the previous reply
                    } else {
                        line.push(byte[0]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        if line.is_empty() {
            return Err(RigError::NoReply {
                request: request.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn write_command(&mut self, command: &str) -> Result<()> {
        debug!("ASCII command {:?}", command);
        let port = self.port_mut()?;
        port.write_all(command.as_bytes())?;
        port.flush()?;
        Ok(())
    }

    /// Controller identification string
    pub fn identity(&mut self) -> Result<String> {
        self.write_command("id? \r")?;
        let port = self.port_mut()?;
        let mut raw = vec![0u8; 200];
        let n = match port.read(&mut raw) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(RigError::NoReply {
                request: "id?".to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&raw[..n]).replace('\r', "\n"))
    }

    /// Output voltage of one axis, in volts
    pub fn get_voltage(&mut self, channel: Channel) -> Result<f64> {
        let query = format!("{}voltage? \r", axis_name(channel));
        self.write_command(&query)?;
        let reply = self.read_line(query.trim_end())?;
        parse_reply(&reply)
    }

    /// Drive one axis's output voltage. No acknowledgment is expected.
    pub fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<()> {
        if !(0.0..=MAX_VOLTS).contains(&volts) {
            return Err(RigError::OutOfRange {
                what: "output voltage (V)",
                value: volts,
                min: 0.0,
                max: MAX_VOLTS,
            });
        }
        self.write_command(&format!("{}voltage={:.3}\r", axis_name(channel), volts))
    }

    /// Release the serial line. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            let _ = port.flush();
            debug!("Serial port closed");
        }
        Ok(())
    }
}

impl Actuator for Mdt693b {
    fn set_target(&mut self, channel: Channel, volts: f64) -> Result<()> {
        self.set_voltage(channel, volts)
    }

    fn get_target(&mut self, channel: Channel) -> Result<f64> {
        self.get_voltage(channel)
    }

    fn close(&mut self) -> Result<()> {
        Mdt693b::close(self)
    }
}

impl Drop for Mdt693b {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
