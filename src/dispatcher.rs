use crate::protocol::{Frame, Register};
use crate::register::{CellVoltageRecord, StatusRecord};
use crate::DecodeError;

/// Outcome of routing a validated frame by its register id.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedRecord {
    Status(StatusRecord),
    CellVoltages(CellVoltageRecord),
    Unrecognized(u8),
}

/// Decodes a frame that already passed the checksum test.
///
/// Unknown registers are not an error here; a payload too short for its
/// register is.
pub fn dispatch(frame: &Frame) -> Result<DecodedRecord, DecodeError> {
    match Register::try_from(frame.register()) {
        Ok(Register::Status) => StatusRecord::decode(frame).map(DecodedRecord::Status),
        Ok(Register::CellVoltages) => {
            CellVoltageRecord::decode(frame).map(DecodedRecord::CellVoltages)
        }
        Err(_) => {
            log::debug!("Unexpected register 0x{:02X}", frame.register());
            Ok(DecodedRecord::Unrecognized(frame.register()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;

    #[test]
    fn routes_cell_voltages() {
        let frame = encode_frame(0x04, &[0x0D, 0x05]).unwrap();
        assert_eq!(
            dispatch(&frame),
            Ok(DecodedRecord::CellVoltages(CellVoltageRecord {
                millivolts: vec![3333]
            }))
        );
    }

    #[test]
    fn unknown_register_is_unrecognized() {
        let frame = encode_frame(0x05, &[0x01]).unwrap();
        assert_eq!(dispatch(&frame), Ok(DecodedRecord::Unrecognized(0x05)));
    }

    #[test]
    fn short_status_is_an_error() {
        let frame = encode_frame(0x03, &[0x01, 0x02]).unwrap();
        assert!(matches!(
            dispatch(&frame),
            Err(DecodeError::PayloadTooShort { register: 0x03, .. })
        ));
    }
}
