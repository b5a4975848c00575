// BPC303 three-channel closed-loop piezo controller driver.
//
// Built on the APT transport: each operation frames a request to the bay
// card owning the channel and converts between device counts and physical
// units.

use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use super::actuator::{Actuator, LoopControl};
use super::apt::{
    bay_of, endpoint, long_frame, msg, short_frame, AptMessage, SerialTransport, Transport,
    CHAN_IDENT, Channel,
};
use crate::error::{Result, RigError};

/// Travel per position count. Full scale (32767 counts) corresponds to the
/// strain-gauge calibrated 15 um range.
pub const MICRONS_PER_COUNT: f64 = 15.0 / 32767.0;

/// Output-voltage counts at the configured maximum voltage
const VOLTS_FULL_SCALE_COUNTS: f64 = 32767.0;

/// Hardware-safe ceiling written to every channel's max-voltage register
/// before any motion is commanded (the 710-series piezos are 150 V parts)
pub const OUTPUT_VOLTS_CEILING: f64 = 150.0;

/// Proportional gain written alongside the zeroed integral term
pub const DEFAULT_PROPORTIONAL: u8 = 100;

/// Delay between the start-updates trigger and the first status frame
const STATUS_SETTLE_MS: u64 = 200;

/// Per-channel servo-loop state.
///
/// Writes use the hardware's transitional "smooth" codes so the actuator
/// ramps between modes instead of jumping; reads report the steady-state
/// codes. The two wire values differ for the same logical mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    OpenLoop,
    ClosedLoop,
}

impl ControlMode {
    /// Steady-state code, as reported by the controller
    pub fn steady_code(self) -> u8 {
        match self {
            ControlMode::OpenLoop => 0x01,
            ControlMode::ClosedLoop => 0x02,
        }
    }

    /// Transitional code used when commanding a mode switch. Writing the
    /// steady-state code instead would make the actuator jump.
    pub fn transition_code(self) -> u8 {
        match self {
            ControlMode::OpenLoop => 0x03,
            ControlMode::ClosedLoop => 0x04,
        }
    }

    /// Decode either wire form
    pub fn from_code(code: u8) -> Option<ControlMode> {
        match code {
            0x01 | 0x03 => Some(ControlMode::OpenLoop),
            0x02 | 0x04 => Some(ControlMode::ClosedLoop),
            _ => None,
        }
    }
}

/// Proportional/integral gains of the closed-loop controller, each 0..=255
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiConstants {
    pub proportional: u8,
    pub integral: u8,
}

/// Status-bit masks reported in [`PzStatus::flags`]
pub mod status_bits {
    pub const ACTUATOR_CONNECTED: u32 = 0x0000_0001;
    pub const ZEROED: u32 = 0x0000_0010;
    pub const ZEROING: u32 = 0x0000_0020;
    pub const CLOSED_LOOP: u32 = 0x0000_0400;
}

/// One decoded status frame.
///
/// The firmware defines the full flag set; `flags` carries the raw word so
/// callers are not limited to the named accessors below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PzStatus {
    /// Measured position in microns
    pub position: f64,
    /// Output voltage in volts
    pub voltage: f64,
    /// Raw firmware status word
    pub flags: u32,
}

impl PzStatus {
    pub fn actuator_connected(&self) -> bool {
        self.flags & status_bits::ACTUATOR_CONNECTED != 0
    }

    pub fn zeroed(&self) -> bool {
        self.flags & status_bits::ZEROED != 0
    }

    pub fn zeroing(&self) -> bool {
        self.flags & status_bits::ZEROING != 0
    }

    pub fn closed_loop(&self) -> bool {
        self.flags & status_bits::CLOSED_LOOP != 0
    }
}

/// Encode a position in microns as a device count
pub fn microns_to_count(microns: f64) -> Result<i16> {
    let count = (microns / MICRONS_PER_COUNT).round();
    if count < i16::MIN as f64 || count > i16::MAX as f64 {
        return Err(RigError::OutOfRange {
            what: "position (um)",
            value: microns,
            min: i16::MIN as f64 * MICRONS_PER_COUNT,
            max: i16::MAX as f64 * MICRONS_PER_COUNT,
        });
    }
    Ok(count as i16)
}

/// Decode a device count back to microns
pub fn count_to_microns(count: i16) -> f64 {
    count as f64 * MICRONS_PER_COUNT
}

/// Driver for the three-channel closed-loop controller.
///
/// Generic over the transport so tests can substitute a scripted one; on
/// hardware it runs over [`SerialTransport`].
///
/// Hardware caveat, preserved as part of the contract: `set_position`
/// writes the servo loop's target register while `get_position` reads the
/// measured strain-gauge output, so a read immediately after a write is not
/// guaranteed to return the commanded value. Callers decide whether to
/// re-anchor follow-up moves from a fresh read or from the last commanded
/// target; blindly alternating set/get cycles accumulates drift.
pub struct Bpc303<T: Transport = SerialTransport> {
    link: T,
    /// Cached max-voltage setting used to scale the output-voltage register
    max_volts: f64,
}

impl Bpc303<SerialTransport> {
    /// Open the controller on a serial port and blink the front-panel LED of
    /// every channel as a connectivity smoke test.
    pub fn open(port_name: &str) -> Result<Self> {
        info!("Opening BPC303 on {}", port_name);
        let link = SerialTransport::open(port_name)?;
        let mut device = Self::with_transport(link);
        for ch in Channel::ALL {
            device.identify(ch)?;
        }
        Ok(device)
    }
}

impl<T: Transport> Bpc303<T> {
    /// Wrap an already-open transport
    pub fn with_transport(link: T) -> Self {
        Self {
            link,
            max_volts: OUTPUT_VOLTS_CEILING,
        }
    }

    /// Exchange a request frame, demanding a reply of the given id
    fn exchange_expect(&mut self, frame: &[u8], reply_id: u16) -> Result<AptMessage> {
        match self.link.exchange(frame)? {
            Some(reply) if reply.id == reply_id => Ok(reply),
            Some(reply) => Err(RigError::UnexpectedReply {
                expected: reply_id,
                got: reply.id,
            }),
            None => Err(RigError::NoReply {
                request: format!(
                    "message 0x{:04X} to endpoint 0x{:02X}",
                    u16::from_le_bytes([frame[0], frame[1]]),
                    frame[4] & 0x7F
                ),
            }),
        }
    }

    /// Measured position of one channel, in microns (strain-gauge register)
    pub fn get_position(&mut self, channel: Channel) -> Result<f64> {
        let req = short_frame(msg::PZ_REQ_OUTPUTPOS, CHAN_IDENT as u8, 0, bay_of(channel));
        let reply = self.exchange_expect(&req, msg::PZ_GET_OUTPUTPOS)?;
        let count = reply
            .data_i16(2)
            .ok_or_else(|| RigError::Malformed("position reply too short".into()))?;
        Ok(count_to_microns(count))
    }

    /// Command one channel's closed-loop position target, in microns.
    /// No acknowledgment is expected.
    pub fn set_position(&mut self, channel: Channel, microns: f64) -> Result<()> {
        let count = microns_to_count(microns)?;
        debug!(
            "Set position ch{} to {:.4} um ({} counts)",
            channel.number(),
            microns,
            count
        );
        let mut data = CHAN_IDENT.to_le_bytes().to_vec();
        data.extend_from_slice(&count.to_le_bytes());
        self.link
            .send(&long_frame(msg::PZ_SET_OUTPUTPOS, &data, bay_of(channel)))
    }

    /// Output voltage of one channel, in volts
    pub fn get_voltage(&mut self, channel: Channel) -> Result<f64> {
        let req = short_frame(msg::PZ_REQ_OUTPUTVOLTS, CHAN_IDENT as u8, 0, bay_of(channel));
        let reply = self.exchange_expect(&req, msg::PZ_GET_OUTPUTVOLTS)?;
        let count = reply
            .data_i16(2)
            .ok_or_else(|| RigError::Malformed("voltage reply too short".into()))?;
        Ok(count as f64 / VOLTS_FULL_SCALE_COUNTS * self.max_volts)
    }

    /// Drive one channel's output voltage. The register holds a fraction of
    /// the configured maximum voltage, so the scaling tracks the cached
    /// max-voltage setting.
    pub fn set_voltage(&mut self, channel: Channel, volts: f64) -> Result<()> {
        if !(0.0..=self.max_volts).contains(&volts) {
            return Err(RigError::OutOfRange {
                what: "output voltage (V)",
                value: volts,
                min: 0.0,
                max: self.max_volts,
            });
        }
        let count = (volts / self.max_volts * VOLTS_FULL_SCALE_COUNTS).round() as i16;
        debug!(
            "Set voltage ch{} to {:.2} V ({} counts)",
            channel.number(),
            volts,
            count
        );
        let mut data = CHAN_IDENT.to_le_bytes().to_vec();
        data.extend_from_slice(&count.to_le_bytes());
        self.link
            .send(&long_frame(msg::PZ_SET_OUTPUTVOLTS, &data, bay_of(channel)))
    }

    /// Maximum output voltage setting of one channel, in volts
    pub fn get_max_output_voltage(&mut self, channel: Channel) -> Result<f64> {
        let req = short_frame(
            msg::PZ_REQ_OUTPUTMAXVOLTS,
            CHAN_IDENT as u8,
            0,
            bay_of(channel),
        );
        let reply = self.exchange_expect(&req, msg::PZ_GET_OUTPUTMAXVOLTS)?;
        let tenths = reply
            .data_u16(2)
            .ok_or_else(|| RigError::Malformed("max-voltage reply too short".into()))?;
        let volts = tenths as f64 / 10.0;
        self.max_volts = volts;
        Ok(volts)
    }

    /// Cap one channel's output voltage. The register is in tenths of a
    /// volt.
    pub fn set_max_output_voltage(&mut self, channel: Channel, volts: f64) -> Result<()> {
        if !(0.0..=OUTPUT_VOLTS_CEILING).contains(&volts) {
            return Err(RigError::OutOfRange {
                what: "max output voltage (V)",
                value: volts,
                min: 0.0,
                max: OUTPUT_VOLTS_CEILING,
            });
        }
        let tenths = (volts * 10.0).round() as u16;
        let mut data = CHAN_IDENT.to_le_bytes().to_vec();
        data.extend_from_slice(&tenths.to_le_bytes());
        self.link
            .send(&long_frame(msg::PZ_SET_OUTPUTMAXVOLTS, &data, bay_of(channel)))?;
        self.max_volts = volts;
        Ok(())
    }

    /// Closed-loop PI gains of one channel
    pub fn get_pi_constants(&mut self, channel: Channel) -> Result<PiConstants> {
        let req = short_frame(msg::PZ_REQ_PICONSTS, CHAN_IDENT as u8, 0, bay_of(channel));
        let reply = self.exchange_expect(&req, msg::PZ_GET_PICONSTS)?;
        let (prop, integral) = match (reply.data_u16(2), reply.data_u16(4)) {
            (Some(p), Some(i)) => (p, i),
            _ => return Err(RigError::Malformed("PI reply too short".into())),
        };
        Ok(PiConstants {
            proportional: prop as u8,
            integral: integral as u8,
        })
    }

    pub fn set_pi_constants(&mut self, channel: Channel, pi: PiConstants) -> Result<()> {
        debug!(
            "Set PI ch{} to P={} I={}",
            channel.number(),
            pi.proportional,
            pi.integral
        );
        let mut data = CHAN_IDENT.to_le_bytes().to_vec();
        data.extend_from_slice(&(pi.proportional as u16).to_le_bytes());
        data.extend_from_slice(&(pi.integral as u16).to_le_bytes());
        self.link
            .send(&long_frame(msg::PZ_SET_PICONSTS, &data, bay_of(channel)))
    }

    /// Servo-loop mode of one channel
    pub fn get_mode(&mut self, channel: Channel) -> Result<ControlMode> {
        let req = short_frame(
            msg::PZ_REQ_POSCONTROLMODE,
            CHAN_IDENT as u8,
            0,
            bay_of(channel),
        );
        let reply = self.exchange_expect(&req, msg::PZ_GET_POSCONTROLMODE)?;
        ControlMode::from_code(reply.param2)
            .ok_or_else(|| RigError::Malformed(format!("unknown mode code {}", reply.param2)))
    }

    /// Switch one channel's servo loop, always via the transitional smooth
    /// code so the stage ramps to the new regime
    pub fn set_mode(&mut self, channel: Channel, mode: ControlMode) -> Result<()> {
        debug!("Set mode ch{} to {:?}", channel.number(), mode);
        self.link.send(&short_frame(
            msg::PZ_SET_POSCONTROLMODE,
            CHAN_IDENT as u8,
            mode.transition_code(),
            bay_of(channel),
        ))
    }

    /// Blink the front-panel LED of one channel's bay
    pub fn identify(&mut self, channel: Channel) -> Result<()> {
        self.link.send(&short_frame(
            msg::MOD_IDENTIFY,
            CHAN_IDENT as u8,
            0,
            bay_of(channel),
        ))
    }

    /// One status snapshot for a channel.
    ///
    /// Triggers the controller's update stream at the rack, waits for the
    /// firmware to settle, keeps the first frame for the requested channel
    /// and stops the stream again.
    pub fn get_status(&mut self, channel: Channel) -> Result<PzStatus> {
        let bay = bay_of(channel);
        self.link
            .send(&short_frame(msg::HW_START_UPDATEMSGS, 0, 0, endpoint::RACK))?;
        thread::sleep(Duration::from_millis(STATUS_SETTLE_MS));

        let frame = loop {
            match self.link.receive()? {
                Some(frame) if frame.id == msg::PZ_GET_PZSTATUSUPDATE && frame.source == bay => {
                    break frame;
                }
                // Status frames from the other bays arrive interleaved
                Some(_) => continue,
                None => {
                    let stop = short_frame(msg::HW_STOP_UPDATEMSGS, 0, 0, endpoint::RACK);
                    let _ = self.link.send(&stop);
                    return Err(RigError::NoReply {
                        request: format!("status update for bay 0x{:02X}", bay),
                    });
                }
            }
        };

        self.link
            .send(&short_frame(msg::HW_STOP_UPDATEMSGS, 0, 0, endpoint::RACK))?;
        // Drain the tail of the update stream so stale status frames cannot
        // surface as the reply to a later request
        loop {
            match self.link.receive()? {
                Some(stale) if stale.id == msg::PZ_GET_PZSTATUSUPDATE => continue,
                _ => break,
            }
        }
        self.decode_status(&frame)
    }

    fn decode_status(&self, frame: &AptMessage) -> Result<PzStatus> {
        let (volts_count, pos_count, flags) = match (
            frame.data_i16(2),
            frame.data_i16(4),
            frame.data_u32(6),
        ) {
            (Some(v), Some(p), Some(f)) => (v, p, f),
            _ => return Err(RigError::Malformed("status frame too short".into())),
        };
        Ok(PzStatus {
            position: count_to_microns(pos_count),
            voltage: volts_count as f64 / VOLTS_FULL_SCALE_COUNTS * self.max_volts,
            flags,
        })
    }

    /// Release the serial line. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.link.close()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Direct access to the transport
    pub fn transport(&mut self) -> &mut T {
        &mut self.link
    }
}

impl<T: Transport> Actuator for Bpc303<T> {
    /// Configure safe limits before any motion: cap every channel's output
    /// voltage and zero the integral term. Ordering matters; motion commands
    /// come only after this returns.
    fn prepare(&mut self) -> Result<()> {
        info!("Configuring output limits and PI gains");
        for ch in Channel::ALL {
            self.set_max_output_voltage(ch, OUTPUT_VOLTS_CEILING)?;
            self.set_pi_constants(
                ch,
                PiConstants {
                    proportional: DEFAULT_PROPORTIONAL,
                    integral: 0,
                },
            )?;
        }
        Ok(())
    }

    fn set_target(&mut self, channel: Channel, microns: f64) -> Result<()> {
        self.set_position(channel, microns)
    }

    fn get_target(&mut self, channel: Channel) -> Result<f64> {
        self.get_position(channel)
    }

    fn close(&mut self) -> Result<()> {
        Bpc303::close(self)
    }
}

impl<T: Transport> LoopControl for Bpc303<T> {
    fn set_mode(&mut self, channel: Channel, mode: ControlMode) -> Result<()> {
        Bpc303::set_mode(self, channel, mode)
    }

    fn get_mode(&mut self, channel: Channel) -> Result<ControlMode> {
        Bpc303::get_mode(self, channel)
    }
}
