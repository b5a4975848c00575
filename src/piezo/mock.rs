// Scripted in-memory stand-in for the BPC303: answers APT requests from a
// per-bay register file so the driver and the assembly controller can be
// exercised without hardware. Also the failure-injection point for timeout
// tests.

use std::collections::VecDeque;

use super::apt::{
    bay_of, endpoint, msg, pull_frame, AptMessage, Channel, Transport,
};
use super::bpc303::status_bits;
use crate::error::{Result, RigError};

#[derive(Debug, Clone)]
struct BayRegisters {
    position_count: i16,
    volts_count: i16,
    max_volts_tenths: u16,
    /// Steady-state mode code; transitional writes settle here
    mode_code: u8,
    proportional: u16,
    integral: u16,
    blinks: u32,
}

impl Default for BayRegisters {
    fn default() -> Self {
        Self {
            position_count: 0,
            volts_count: 0,
            max_volts_tenths: 1500,
            mode_code: 0x01,
            proportional: 100,
            integral: 100,
            blinks: 0,
        }
    }
}

/// Simulated transport backed by an in-memory register file
pub struct MockTransport {
    bays: [BayRegisters; 3],
    pending: VecDeque<AptMessage>,
    sent: Vec<AptMessage>,
    silent: bool,
    open: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            bays: [
                BayRegisters::default(),
                BayRegisters::default(),
                BayRegisters::default(),
            ],
            pending: VecDeque::new(),
            sent: Vec::new(),
            silent: false,
            open: true,
        }
    }

    /// When silent, requests are still recorded but no reply ever arrives,
    /// as with an unplugged or wedged controller
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    /// Every frame written so far, decoded, in order
    pub fn sent_frames(&self) -> Vec<AptMessage> {
        self.sent.clone()
    }

    /// Identify blinks seen by a channel's bay
    pub fn blinks(&self, channel: Channel) -> u32 {
        self.bays[channel.index()].blinks
    }

    /// Raw position register of a channel's bay
    pub fn position_count(&self, channel: Channel) -> i16 {
        self.bays[channel.index()].position_count
    }

    fn bay_index(dest: u8) -> Option<usize> {
        let idx = dest.wrapping_sub(endpoint::BAY0) as usize;
        (idx < 3).then_some(idx)
    }

    fn reply_long(&mut self, id: u16, source: u8, data: Vec<u8>) {
        self.pending.push_back(AptMessage {
            id,
            dest: endpoint::HOST,
            source,
            param1: 0,
            param2: 0,
            data,
        });
    }

    fn reply_short(&mut self, id: u16, source: u8, param1: u8, param2: u8) {
        self.pending.push_back(AptMessage {
            id,
            dest: endpoint::HOST,
            source,
            param1,
            param2,
            data: Vec::new(),
        });
    }

    fn queue_status_frames(&mut self) {
        for ch in Channel::ALL {
            let bay = bay_of(ch);
            let regs = &self.bays[ch.index()];
            let mut flags = status_bits::ACTUATOR_CONNECTED;
            if regs.mode_code == 0x02 {
                flags |= status_bits::CLOSED_LOOP;
            }

            let mut data = 1u16.to_le_bytes().to_vec();
            data.extend_from_slice(&regs.volts_count.to_le_bytes());
            data.extend_from_slice(&regs.position_count.to_le_bytes());
            data.extend_from_slice(&flags.to_le_bytes());
            self.reply_long(msg::PZ_GET_PZSTATUSUPDATE, bay, data);
        }
    }

    fn dispatch(&mut self, frame: &AptMessage) {
        match frame.id {
            msg::HW_START_UPDATEMSGS => self.queue_status_frames(),
            msg::HW_STOP_UPDATEMSGS => {}
            _ => {
                let Some(idx) = Self::bay_index(frame.dest) else {
                    return;
                };
                let bay = endpoint::BAY0 + idx as u8;

                match frame.id {
                    msg::MOD_IDENTIFY => self.bays[idx].blinks += 1,

                    msg::PZ_SET_OUTPUTPOS => {
                        if let Some(count) = frame.data_i16(2) {
                            self.bays[idx].position_count = count;
                        }
                    }
                    msg::PZ_REQ_OUTPUTPOS => {
                        let count = self.bays[idx].position_count;
                        let mut data = 1u16.to_le_bytes().to_vec();
                        data.extend_from_slice(&count.to_le_bytes());
                        self.reply_long(msg::PZ_GET_OUTPUTPOS, bay, data);
                    }

                    msg::PZ_SET_OUTPUTVOLTS => {
                        if let Some(count) = frame.data_i16(2) {
                            self.bays[idx].volts_count = count;
                        }
                    }
                    msg::PZ_REQ_OUTPUTVOLTS => {
                        let count = self.bays[idx].volts_count;
                        let mut data = 1u16.to_le_bytes().to_vec();
                        data.extend_from_slice(&count.to_le_bytes());
                        self.reply_long(msg::PZ_GET_OUTPUTVOLTS, bay, data);
                    }

                    msg::PZ_SET_OUTPUTMAXVOLTS => {
                        if let Some(tenths) = frame.data_u16(2) {
                            self.bays[idx].max_volts_tenths = tenths;
                        }
                    }
                    msg::PZ_REQ_OUTPUTMAXVOLTS => {
                        let tenths = self.bays[idx].max_volts_tenths;
                        let mut data = 1u16.to_le_bytes().to_vec();
                        data.extend_from_slice(&tenths.to_le_bytes());
                        self.reply_long(msg::PZ_GET_OUTPUTMAXVOLTS, bay, data);
                    }

                    msg::PZ_SET_PICONSTS => {
                        if let (Some(p), Some(i)) = (frame.data_u16(2), frame.data_u16(4)) {
                            self.bays[idx].proportional = p;
                            self.bays[idx].integral = i;
                        }
                    }
                    msg::PZ_REQ_PICONSTS => {
                        let (p, i) = (self.bays[idx].proportional, self.bays[idx].integral);
                        let mut data = 1u16.to_le_bytes().to_vec();
                        data.extend_from_slice(&p.to_le_bytes());
                        data.extend_from_slice(&i.to_le_bytes());
                        self.reply_long(msg::PZ_GET_PICONSTS, bay, data);
                    }

                    // Transitional write settles to the steady-state code,
                    // which is what later reads report
                    msg::PZ_SET_POSCONTROLMODE => {
                        self.bays[idx].mode_code = match frame.param2 {
                            0x01 | 0x03 => 0x01,
                            0x02 | 0x04 => 0x02,
                            other => other,
                        };
                    }
                    msg::PZ_REQ_POSCONTROLMODE => {
                        let code = self.bays[idx].mode_code;
                        self.reply_short(msg::PZ_GET_POSCONTROLMODE, bay, 1, code);
                    }

                    _ => {}
                }
            }
        }
    }
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.open {
            return Err(RigError::PortClosed);
        }
        let mut bytes = frame.to_vec();
        let decoded = pull_frame(&mut bytes)
            .ok_or_else(|| RigError::Malformed("truncated outgoing frame".into()))?;
        self.dispatch(&decoded);
        self.sent.push(decoded);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<AptMessage>> {
        if !self.open {
            return Err(RigError::PortClosed);
        }
        if self.silent {
            return Ok(None);
        }
        Ok(self.pending.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piezo::apt::{long_frame, short_frame, CHAN_IDENT};

    #[test]
    fn test_position_echo() {
        let mut link = MockTransport::new();
        let count: i16 = 1234;
        let mut data = CHAN_IDENT.to_le_bytes().to_vec();
        data.extend_from_slice(&count.to_le_bytes());
        link.send(&long_frame(msg::PZ_SET_OUTPUTPOS, &data, 0x22)).unwrap();

        let reply = link
            .exchange(&short_frame(msg::PZ_REQ_OUTPUTPOS, 1, 0, 0x22))
            .unwrap()
            .expect("reply");
        assert_eq!(reply.id, msg::PZ_GET_OUTPUTPOS);
        assert_eq!(reply.source, 0x22);
        assert_eq!(reply.data_i16(2), Some(1234));
    }

    #[test]
    fn test_silent_mode_swallows_replies() {
        let mut link = MockTransport::new();
        link.set_silent(true);
        let reply = link
            .exchange(&short_frame(msg::PZ_REQ_OUTPUTPOS, 1, 0, 0x21))
            .unwrap();
        assert!(reply.is_none());
        // The request itself is still recorded
        assert_eq!(link.sent_frames().len(), 1);
    }

    #[test]
    fn test_identify_counts_blinks() {
        let mut link = MockTransport::new();
        link.send(&short_frame(msg::MOD_IDENTIFY, 1, 0, 0x23)).unwrap();
        link.send(&short_frame(msg::MOD_IDENTIFY, 1, 0, 0x23)).unwrap();
        assert_eq!(link.blinks(Channel::Ch3), 2);
        assert_eq!(link.blinks(Channel::Ch1), 0);
    }

    #[test]
    fn test_closed_transport_rejects_io() {
        let mut link = MockTransport::new();
        link.close().unwrap();
        assert!(matches!(
            link.send(&short_frame(msg::MOD_IDENTIFY, 1, 0, 0x21)),
            Err(RigError::PortClosed)
        ));
        assert!(matches!(link.receive(), Err(RigError::PortClosed)));
    }
}
