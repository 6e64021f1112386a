use crate::DecodeError;
use std::{fmt, time::Duration};

pub const START_BYTE: u8 = 0xDD;
pub const STOP_BYTE: u8 = 0x77;
pub const READ_BYTE: u8 = 0xA5;
const READ_LENGTH: u8 = 0x00;

/// Index of the length byte; payload follows directly after it.
pub const LENGTH_INDEX: usize = 3;
pub const PAYLOAD_OFFSET: usize = 4;
/// start, register, status, length, checksum hi/lo, stop
pub const FRAME_OVERHEAD: usize = 7;

/// Cadence observed on the device between two read requests.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Status = 0x03,
    CellVoltages = 0x04,
}

impl TryFrom<u8> for Register {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Register::Status),
            0x04 => Ok(Register::CellVoltages),
            other => Err(DecodeError::UnknownRegister(other)),
        }
    }
}

const fn read_request(register: Register) -> [u8; 7] {
    let checksum = 0u16.wrapping_sub(register as u16 + READ_LENGTH as u16);
    [
        START_BYTE,
        READ_BYTE,
        register as u8,
        READ_LENGTH,
        (checksum >> 8) as u8,
        checksum as u8,
        STOP_BYTE,
    ]
}

/// `DD A5 03 00 FF FD 77`
pub const READ_STATUS: [u8; 7] = read_request(Register::Status);
/// `DD A5 04 00 FF FC 77`
pub const READ_CELL_VOLTAGES: [u8; 7] = read_request(Register::CellVoltages);

/// Outbound read requests understood by the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadStatus,
    ReadCellVoltages,
}

impl Command {
    pub fn bytes(&self) -> &'static [u8; 7] {
        match self {
            Command::ReadStatus => &READ_STATUS,
            Command::ReadCellVoltages => &READ_CELL_VOLTAGES,
        }
    }

    pub fn register(&self) -> Register {
        match self {
            Command::ReadStatus => Register::Status,
            Command::ReadCellVoltages => Register::CellVoltages,
        }
    }
}

/// Endless alternation of the two read requests, starting with the status register.
///
/// The host decides how fast to step through it, see [`POLL_INTERVAL`].
#[derive(Debug, Clone)]
pub struct PollCycle {
    next: Command,
}

impl PollCycle {
    pub fn new() -> Self {
        Self {
            next: Command::ReadStatus,
        }
    }
}

impl Default for PollCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for PollCycle {
    type Item = Command;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next;
        self.next = match current {
            Command::ReadStatus => Command::ReadCellVoltages,
            Command::ReadCellVoltages => Command::ReadStatus,
        };
        Some(current)
    }
}

/// Two's complement of the sum of length byte and payload, truncated to 16 bit.
pub fn calc_checksum(length: u8, payload: &[u8]) -> u16 {
    let sum = payload
        .iter()
        .fold(length as u16, |acc, b| acc.wrapping_add(*b as u16));
    0u16.wrapping_sub(sum)
}

/// Checks the two checksum bytes in front of the stop byte.
///
/// The payload range is everything between the length byte and the three
/// trailing bytes, independent of what the length byte claims.
pub fn verify_checksum(frame: &[u8]) -> Result<(), DecodeError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(DecodeError::MalformedFrame(format!(
            "{} bytes is shorter than the minimum of {FRAME_OVERHEAD}",
            frame.len()
        )));
    }
    let end = frame.len() - 3;
    let computed = calc_checksum(frame[LENGTH_INDEX], &frame[PAYLOAD_OFFSET..end]);
    let received = u16::from_be_bytes([frame[end], frame[end + 1]]);
    if computed != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} frame={:02X?}",
            computed,
            received,
            frame
        );
        return Err(DecodeError::ChecksumMismatch { computed, received });
    }
    Ok(())
}

/// Checksum test for response frames, see [`verify_checksum`].
pub fn validate(frame: &[u8]) -> bool {
    verify_checksum(frame).is_ok()
}

/// Checksum test for outbound requests `DD A5 <register> <length> <chk_hi> <chk_lo> 77`.
///
/// Unlike responses, the request checksum covers the register byte as well as
/// the length byte.
pub fn verify_request(request: &[u8]) -> bool {
    if request.len() != FRAME_OVERHEAD || !has_boundaries(request) || request[1] != READ_BYTE {
        return false;
    }
    let computed = 0u16.wrapping_sub(request[2] as u16 + request[3] as u16);
    computed == u16::from_be_bytes([request[4], request[5]])
}

/// True when the bytes start with [`START_BYTE`] and end with [`STOP_BYTE`].
pub fn has_boundaries(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == START_BYTE && bytes[bytes.len() - 1] == STOP_BYTE
}

/// A response frame: `DD <register> <status> <length> <payload> <chk_hi> <chk_lo> 77`.
///
/// Construction checks the boundary bytes and that the total size matches the
/// length byte. The checksum is checked separately with [`Frame::verify_checksum`].
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn register(&self) -> u8 {
        self.0[1]
    }

    /// Status byte reported by the device, `0x00` on success.
    pub fn status(&self) -> u8 {
        self.0[2]
    }

    pub fn length(&self) -> u8 {
        self.0[LENGTH_INDEX]
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[PAYLOAD_OFFSET..self.0.len() - 3]
    }

    pub fn checksum(&self) -> u16 {
        let end = self.0.len() - 3;
        u16::from_be_bytes([self.0[end], self.0[end + 1]])
    }

    pub fn verify_checksum(&self) -> Result<(), DecodeError> {
        verify_checksum(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl TryFrom<&[u8]> for Frame {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(DecodeError::MalformedFrame(format!(
                "{} bytes is shorter than the minimum of {FRAME_OVERHEAD}",
                bytes.len()
            )));
        }
        if !has_boundaries(bytes) {
            return Err(DecodeError::MalformedFrame(format!(
                "missing start or stop byte in {bytes:02X?}"
            )));
        }
        let expected = bytes[LENGTH_INDEX] as usize + FRAME_OVERHEAD;
        if bytes.len() != expected {
            return Err(DecodeError::MalformedFrame(format!(
                "length byte announces {expected} bytes, received {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:02X?})", self.0)
    }
}

/// Builds a checksummed response frame with status byte `0x00`.
pub fn encode_frame(register: u8, payload: &[u8]) -> Result<Frame, DecodeError> {
    let length = u8::try_from(payload.len()).map_err(|_| {
        DecodeError::MalformedFrame(format!("payload of {} bytes exceeds 255", payload.len()))
    })?;
    let mut bytes = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    bytes.extend_from_slice(&[START_BYTE, register, 0x00, length]);
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(&calc_checksum(length, payload).to_be_bytes());
    bytes.push(STOP_BYTE);
    log::trace!("encode_frame: {:02X?}", bytes);
    Ok(Frame(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_requests_match_wire_bytes() {
        assert_eq!(READ_STATUS, [0xDD, 0xA5, 0x03, 0x00, 0xFF, 0xFD, 0x77]);
        assert_eq!(READ_CELL_VOLTAGES, [0xDD, 0xA5, 0x04, 0x00, 0xFF, 0xFC, 0x77]);
        assert_eq!(Command::ReadStatus.bytes(), &READ_STATUS);
        assert_eq!(Command::ReadCellVoltages.register(), Register::CellVoltages);
    }

    #[test]
    fn read_request_checksum_covers_register() {
        assert!(verify_request(&READ_STATUS));
        assert!(verify_request(&READ_CELL_VOLTAGES));
        let mut request = READ_STATUS;
        request[2] = 0x04;
        assert!(!verify_request(&request));
        // a request does not pass as a response frame
        assert!(!validate(&READ_STATUS));
    }

    #[test]
    fn poll_cycle_alternates_starting_with_status() {
        let commands: Vec<Command> = PollCycle::new().take(4).collect();
        assert_eq!(
            commands,
            vec![
                Command::ReadStatus,
                Command::ReadCellVoltages,
                Command::ReadStatus,
                Command::ReadCellVoltages
            ]
        );
    }

    #[test]
    fn checksum_is_negated_sum() {
        assert_eq!(calc_checksum(0x08, &[0x0D, 0x05, 0x0D, 0x06, 0x0D, 0x07, 0x0D, 0x08]), 0xFFAA);
        assert_eq!(calc_checksum(0, &[]), 0x0000);
    }

    #[test]
    fn encoded_frame_validates() {
        let frame = encode_frame(0x04, &[0x0D, 0x05, 0x0D, 0x06]).unwrap();
        assert_eq!(
            frame.as_bytes(),
            &[0xDD, 0x04, 0x00, 0x04, 0x0D, 0x05, 0x0D, 0x06, 0xFF, 0xD7, 0x77]
        );
        assert!(validate(frame.as_bytes()));
        assert_eq!(frame.payload(), &[0x0D, 0x05, 0x0D, 0x06]);
        assert_eq!(frame.checksum(), 0xFFD7);
        assert_eq!(frame.register(), 0x04);
        assert_eq!(frame.status(), 0x00);
        assert_eq!(frame.length(), 4);
    }

    #[test]
    fn mutating_any_payload_byte_breaks_checksum() {
        let frame = encode_frame(0x03, &[0x05, 0x14, 0xFF, 0x38, 0x00, 0x10]).unwrap();
        for i in PAYLOAD_OFFSET..frame.as_bytes().len() - 3 {
            let mut bytes = frame.as_bytes().to_vec();
            bytes[i] = bytes[i].wrapping_add(1);
            assert!(!validate(&bytes), "mutation at index {i} was not detected");
        }
    }

    #[test]
    fn checksum_mismatch_reports_both_values() {
        let mut bytes = encode_frame(0x04, &[0x0D, 0x05]).unwrap().into_bytes();
        let len = bytes.len();
        bytes[len - 2] = bytes[len - 2].wrapping_add(1);
        match verify_checksum(&bytes) {
            Err(DecodeError::ChecksumMismatch { computed, received }) => {
                assert_eq!(received, computed.wrapping_add(1));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn short_input_is_malformed_not_a_panic() {
        assert!(!validate(&[0xDD, 0x77]));
        assert!(matches!(
            Frame::try_from(&[0xDD, 0x03, 0x77][..]),
            Err(DecodeError::MalformedFrame(_))
        ));
    }

    #[test]
    fn length_mismatch_is_malformed() {
        let mut bytes = encode_frame(0x04, &[0x0D, 0x05]).unwrap().into_bytes();
        bytes[LENGTH_INDEX] = 4;
        assert!(matches!(
            Frame::try_from(bytes.as_slice()),
            Err(DecodeError::MalformedFrame(_))
        ));
    }
}
