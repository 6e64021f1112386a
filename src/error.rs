/// Reasons a received frame is discarded instead of producing a record.
///
/// None of these are fatal: the decoder reports them and keeps accepting input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed frame - {0}")]
    MalformedFrame(String),
    #[error("Checksum mismatch - computed={computed:04X} received={received:04X}")]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("Unknown register 0x{0:02X}")]
    UnknownRegister(u8),
    #[error("Payload too short for register 0x{register:02X} - required={required} received={actual}")]
    PayloadTooShort {
        register: u8,
        required: usize,
        actual: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No reply received before the timeout elapsed")]
    Timeout,
    #[error("Received a reply for a different register")]
    UnexpectedEvent,
}
