// Thorlabs APT binary protocol: framing, endpoint addressing and the
// serial transport.
//
// Two frame shapes share a 6-byte header [id lo, id hi, .., .., dest, source]:
// - short: bytes 2..4 are two inline parameters
// - long:  bytes 2..4 are a little-endian payload length, dest has bit 7 set,
//          and the payload follows the header

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, RigError};

/// Default serial configuration for the BPC303 controller
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Long-frame marker on the destination byte
const LONG_FRAME_BIT: u8 = 0x80;

/// Sub-channel identifier carried by every per-bay command. The hardware
/// expects 1 here no matter which bay is addressed: at this framing layer the
/// bay address is what distinguishes channels, not this field.
pub const CHAN_IDENT: u16 = 1;

/// Protocol endpoint addresses. The host PC talks to a rack motherboard,
/// which in turn talks to one plug-in bay card per channel.
pub mod endpoint {
    pub const HOST: u8 = 0x01;
    pub const RACK: u8 = 0x11;
    /// Bay card for channel 1; bays for the remaining channels follow
    /// contiguously.
    pub const BAY0: u8 = 0x21;
    pub const USB: u8 = 0x50;
}

/// APT message identifiers used by this driver
pub mod msg {
    pub const MOD_IDENTIFY: u16 = 0x0223;
    pub const HW_START_UPDATEMSGS: u16 = 0x0011;
    pub const HW_STOP_UPDATEMSGS: u16 = 0x0012;

    pub const PZ_SET_POSCONTROLMODE: u16 = 0x0640;
    pub const PZ_REQ_POSCONTROLMODE: u16 = 0x0641;
    pub const PZ_GET_POSCONTROLMODE: u16 = 0x0642;
    pub const PZ_SET_OUTPUTVOLTS: u16 = 0x0643;
    pub const PZ_REQ_OUTPUTVOLTS: u16 = 0x0644;
    pub const PZ_GET_OUTPUTVOLTS: u16 = 0x0645;
    pub const PZ_SET_OUTPUTPOS: u16 = 0x0646;
    pub const PZ_REQ_OUTPUTPOS: u16 = 0x0647;
    pub const PZ_GET_OUTPUTPOS: u16 = 0x0648;
    pub const PZ_SET_PICONSTS: u16 = 0x0655;
    pub const PZ_REQ_PICONSTS: u16 = 0x0656;
    pub const PZ_GET_PICONSTS: u16 = 0x0657;
    pub const PZ_REQ_PZSTATUSUPDATE: u16 = 0x0660;
    pub const PZ_GET_PZSTATUSUPDATE: u16 = 0x0661;
    pub const PZ_SET_OUTPUTMAXVOLTS: u16 = 0x0680;
    pub const PZ_REQ_OUTPUTMAXVOLTS: u16 = 0x0681;
    pub const PZ_GET_OUTPUTMAXVOLTS: u16 = 0x0682;
}

/// One of the three actuator channels, arranged at the vertices of an
/// equilateral triangle. Other channel numbers do not exist on this
/// hardware, so they are unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ch1 = 1,
    Ch2 = 2,
    Ch3 = 3,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Ch1, Channel::Ch2, Channel::Ch3];

    /// Zero-based index, for array lookups
    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// One-based channel number as printed on the front panel
    pub fn number(self) -> u8 {
        self as u8
    }
}

/// Map a channel to the address of the bay card that controls it.
///
/// Pure function of the channel number: bay = BAY0 + (channel - 1).
pub fn bay_of(channel: Channel) -> u8 {
    endpoint::BAY0 + (channel as u8 - 1)
}

/// A decoded APT frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptMessage {
    pub id: u16,
    pub dest: u8,
    pub source: u8,
    /// Inline parameters (short frames only; zero for long frames)
    pub param1: u8,
    pub param2: u8,
    /// Payload (long frames only; empty for short frames)
    pub data: Vec<u8>,
}

impl AptMessage {
    pub fn data_u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn data_i16(&self, offset: usize) -> Option<i16> {
        self.data_u16(offset).map(|v| v as i16)
    }

    pub fn data_u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Build a 6-byte short frame. The source is always the host.
pub fn short_frame(id: u16, param1: u8, param2: u8, dest: u8) -> [u8; 6] {
    let [id_lo, id_hi] = id.to_le_bytes();
    [id_lo, id_hi, param1, param2, dest, endpoint::HOST]
}

/// Build a long frame carrying a payload. The source is always the host.
pub fn long_frame(id: u16, data: &[u8], dest: u8) -> Vec<u8> {
    let mut frame = Vec::with_capacity(6 + data.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
    frame.push(dest | LONG_FRAME_BIT);
    frame.push(endpoint::HOST);
    frame.extend_from_slice(data);
    frame
}

/// Pull exactly one fully-framed message off the front of `buf`, or return
/// `None` if the buffered bytes do not yet contain a complete frame.
pub fn pull_frame(buf: &mut Vec<u8>) -> Option<AptMessage> {
    if buf.len() < 6 {
        return None;
    }

    let id = u16::from_le_bytes([buf[0], buf[1]]);
    let long = buf[4] & LONG_FRAME_BIT != 0;

    let msg = if long {
        let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 6 + len {
            return None;
        }
        AptMessage {
            id,
            dest: buf[4] & !LONG_FRAME_BIT,
            source: buf[5],
            param1: 0,
            param2: 0,
            data: buf[6..6 + len].to_vec(),
        }
    } else {
        AptMessage {
            id,
            dest: buf[4],
            source: buf[5],
            param1: buf[2],
            param2: buf[3],
            data: Vec::new(),
        }
    };

    buf.drain(..6 + msg.data.len());
    Some(msg)
}

/// Blocking request/response transport over a framed byte stream.
///
/// An absent response within the timeout window is `Ok(None)`, not an error:
/// at this layer silence is a soft failure for the caller to branch on.
pub trait Transport {
    fn send(&mut self, frame: &[u8]) -> Result<()>;
    fn receive(&mut self) -> Result<Option<AptMessage>>;

    /// Send a request frame and wait for the next decoded reply
    fn exchange(&mut self, frame: &[u8]) -> Result<Option<AptMessage>> {
        self.send(frame)?;
        self.receive()
    }

    /// Release the underlying connection. Idempotent; every later operation
    /// fails with `RigError::PortClosed`.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// Serial transport for the binary backend
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    rx: Vec<u8>,
    timeout: Duration,
}

impl SerialTransport {
    /// Open the controller's serial line: fixed baud rate, hardware RTS/CTS
    /// flow control, short read timeout. Any stale bytes in the controller's
    /// buffers are flushed before the first command.
    pub fn open(port_name: &str) -> Result<Self> {
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let mut port = serialport::new(port_name, DEFAULT_BAUDRATE)
            .flow_control(serialport::FlowControl::Hardware)
            .timeout(timeout)
            .open()?;

        port.write_request_to_send(true)?;
        port.clear(serialport::ClearBuffer::All)?;

        debug!("Opened {} at {} baud", port_name, DEFAULT_BAUDRATE);
        Ok(Self {
            port: Some(port),
            rx: Vec::new(),
            timeout,
        })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(RigError::PortClosed)
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(frame)?;
        port.flush()?;
        debug!("Sent frame {:02X?}", frame);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<AptMessage>> {
        if self.port.is_none() {
            return Err(RigError::PortClosed);
        }
        let deadline = Instant::now() + self.timeout;

        loop {
            if let Some(msg) = pull_frame(&mut self.rx) {
                debug!("Decoded message 0x{:04X} from 0x{:02X}", msg.id, msg.source);
                return Ok(Some(msg));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let mut chunk = [0u8; 64];
            let port = self.port_mut()?;
            match port.read(&mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            let _ = port.flush();
            debug!("Serial port closed");
        }
        self.rx.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // Safety net against leaked hardware ports; explicit close is the
        // normal path.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bay_addresses_distinct() {
        let bays: Vec<u8> = Channel::ALL.iter().map(|&ch| bay_of(ch)).collect();
        assert_eq!(bays, vec![0x21, 0x22, 0x23]);
        // Pure function: a second evaluation gives the same mapping
        for &ch in &Channel::ALL {
            assert_eq!(bay_of(ch), endpoint::BAY0 + ch as u8 - 1);
        }
    }

    #[test]
    fn test_short_frame_layout() {
        let frame = short_frame(msg::PZ_REQ_OUTPUTPOS, 1, 0, 0x22);
        assert_eq!(frame, [0x47, 0x06, 0x01, 0x00, 0x22, 0x01]);
    }

    #[test]
    fn test_long_frame_layout() {
        let frame = long_frame(msg::PZ_SET_OUTPUTPOS, &[0x01, 0x00, 0x34, 0x12], 0x21);
        // Header: id, payload length, dest with bit 7 set, host source
        assert_eq!(&frame[..6], &[0x46, 0x06, 0x04, 0x00, 0xA1, 0x01]);
        assert_eq!(&frame[6..], &[0x01, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn test_pull_frame_short() {
        let mut buf = short_frame(msg::PZ_GET_POSCONTROLMODE, 1, 2, endpoint::HOST).to_vec();
        let msg = pull_frame(&mut buf).expect("complete frame");
        assert_eq!(msg.id, msg::PZ_GET_POSCONTROLMODE);
        assert_eq!(msg.param1, 1);
        assert_eq!(msg.param2, 2);
        assert!(msg.data.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_pull_frame_waits_for_complete_frame() {
        let full = long_frame(msg::PZ_GET_OUTPUTPOS, &[0x01, 0x00, 0xF4, 0x01], 0x01);

        // Feed the bytes in two chunks, as a serial read would
        let mut buf = full[..7].to_vec();
        assert!(pull_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 7, "partial frame must stay buffered");

        buf.extend_from_slice(&full[7..]);
        let msg = pull_frame(&mut buf).expect("complete frame");
        assert_eq!(msg.id, msg::PZ_GET_OUTPUTPOS);
        assert_eq!(msg.dest, 0x01);
        assert_eq!(msg.data_i16(2), Some(500));
    }

    #[test]
    fn test_pull_frame_consumes_one_message_at_a_time() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&short_frame(msg::MOD_IDENTIFY, 1, 0, 0x21));
        buf.extend_from_slice(&long_frame(msg::PZ_GET_PICONSTS, &[1, 0, 100, 0, 0, 0], 0x01));

        let first = pull_frame(&mut buf).unwrap();
        assert_eq!(first.id, msg::MOD_IDENTIFY);

        let second = pull_frame(&mut buf).unwrap();
        assert_eq!(second.id, msg::PZ_GET_PICONSTS);
        assert_eq!(second.data_u16(2), Some(100));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_negative_payload_values() {
        let count: i16 = -1200;
        let mut data = vec![0x01, 0x00];
        data.extend_from_slice(&count.to_le_bytes());
        let mut buf = long_frame(msg::PZ_GET_OUTPUTPOS, &data, endpoint::HOST);

        let msg = pull_frame(&mut buf).unwrap();
        assert_eq!(msg.data_i16(2), Some(-1200));
    }
}
