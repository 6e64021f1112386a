//! Reassembles frames from arbitrarily chunked byte deliveries.
//!
//! Two strategies are available:
//!
//! - [`ReassemblyMode::Boundary`] mirrors the behaviour of the BMS vendor app:
//!   a chunk that starts with the start byte and ends with the stop byte is a
//!   frame, anything else is collected until the collected bytes do. A chunk
//!   whose leading byte equals the leading byte of the collected bytes is taken
//!   as a re-delivery and dropped. This can lose genuine continuation chunks
//!   that happen to start with `0xDD`, and it never gives up on a frame whose
//!   stop byte does not arrive, so memory is only bounded by the host.
//! - [`ReassemblyMode::LengthPrefixed`] cuts frames using the length byte,
//!   handles several frames per chunk and resynchronises on the next start byte
//!   after garbage or a missing stop byte.

use crate::protocol::{has_boundaries, FRAME_OVERHEAD, LENGTH_INDEX, START_BYTE, STOP_BYTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReassemblyMode {
    #[default]
    Boundary,
    LengthPrefixed,
}

/// One instance per logical connection; the partial buffer is never shared.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    mode: ReassemblyMode,
    buffer: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::with_mode(ReassemblyMode::Boundary)
    }

    pub fn length_prefixed() -> Self {
        Self::with_mode(ReassemblyMode::LengthPrefixed)
    }

    pub fn with_mode(mode: ReassemblyMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
        }
    }

    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    /// True when no partial frame is held.
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            log::debug!("Reset discards {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
    }

    /// Feeds one delivery, returning the frames completed by it in order.
    ///
    /// The returned byte runs have their boundary bytes in place; length and
    /// checksum are not verified here.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        log::trace!("feed: {:02X?}", chunk);
        if chunk.is_empty() {
            return Vec::new();
        }
        match self.mode {
            ReassemblyMode::Boundary => self.feed_boundary(chunk).into_iter().collect(),
            ReassemblyMode::LengthPrefixed => self.feed_length_prefixed(chunk),
        }
    }

    fn feed_boundary(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if has_boundaries(chunk) {
            if !self.buffer.is_empty() {
                log::warn!(
                    "Complete frame received, discarding partial frame {:02X?}",
                    self.buffer
                );
                self.buffer.clear();
            }
            return Some(chunk.to_vec());
        }

        if self.buffer.is_empty() {
            self.buffer.extend_from_slice(chunk);
            return None;
        }

        if chunk[0] == self.buffer[0] {
            log::trace!(
                "Dropping chunk repeating leading byte {:02X}: {:02X?}",
                chunk[0],
                chunk
            );
            return None;
        }

        self.buffer.extend_from_slice(chunk);
        if has_boundaries(&self.buffer) {
            return Some(std::mem::take(&mut self.buffer));
        }
        None
    }

    fn feed_length_prefixed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.buffer.iter().position(|b| *b == START_BYTE) {
                Some(0) => {}
                Some(skip) => {
                    log::debug!("Skipping {} bytes before start byte", skip);
                    self.buffer.drain(..skip);
                }
                None => {
                    if !self.buffer.is_empty() {
                        log::debug!("Skipping {} bytes without start byte", self.buffer.len());
                    }
                    self.buffer.clear();
                    break;
                }
            }
            if self.buffer.len() <= LENGTH_INDEX {
                break;
            }
            let total = self.buffer[LENGTH_INDEX] as usize + FRAME_OVERHEAD;
            if self.buffer.len() < total {
                break;
            }
            if self.buffer[total - 1] == STOP_BYTE {
                frames.push(self.buffer.drain(..total).collect());
            } else {
                log::warn!(
                    "Missing stop byte at offset {}, resynchronising: {:02X?}",
                    total - 1,
                    &self.buffer[..total]
                );
                self.buffer.drain(..1);
            }
        }
        frames
    }
}
