use crate::dispatcher::{dispatch, DecodedRecord};
use crate::event::{Event, EventKind, HandlerError, Subscribers, SubscriptionId};
use crate::protocol::Frame;
use crate::reassembler::FrameReassembler;
use crate::DecodeError;

/// Protocol session for one connection: reassembly, validation, dispatch and
/// emission to subscribers.
///
/// Feed every received chunk in arrival order through [`BmsDecoder::feed_bytes`].
/// Processing is synchronous and finishes before the call returns.
#[derive(Debug, Default)]
pub struct BmsDecoder {
    reassembler: FrameReassembler,
    subscribers: Subscribers,
}

impl BmsDecoder {
    pub fn new() -> Self {
        Self::with_reassembler(FrameReassembler::new())
    }

    pub fn with_reassembler(reassembler: FrameReassembler) -> Self {
        Self {
            reassembler,
            subscribers: Subscribers::new(),
        }
    }

    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }

    /// Drops a partially received frame, e.g. after the transport gave up waiting.
    pub fn reset(&mut self) {
        self.reassembler.reset();
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) -> Result<(), HandlerError> + 'static,
    {
        self.subscribers.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Feeds one delivery and emits an event per completed frame.
    ///
    /// The emitted events are returned as well, in emission order.
    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<Event> {
        let frames = self.reassembler.feed(chunk);
        let mut events = Vec::with_capacity(frames.len());
        for raw in frames {
            let event = process_frame(&raw);
            self.subscribers.emit(&event);
            events.push(event);
        }
        events
    }
}

/// Validates and decodes one reassembled frame into the event it produces.
pub fn process_frame(raw: &[u8]) -> Event {
    let discard = |reason: DecodeError| Event::DecodeError {
        reason,
        frame: Some(raw.to_vec()),
    };

    let frame = match Frame::try_from(raw) {
        Ok(frame) => frame,
        Err(reason) => {
            log::warn!("Discarding frame: {reason}");
            return discard(reason);
        }
    };
    if let Err(reason) = frame.verify_checksum() {
        return discard(reason);
    }

    if frame.status() != 0x00 {
        log::debug!("Device reports status 0x{:02X} in {:?}", frame.status(), frame);
    }
    log::debug!("Received {:?}", frame);
    match dispatch(&frame) {
        Ok(DecodedRecord::Status(status)) => Event::Status(status),
        Ok(DecodedRecord::CellVoltages(cells)) => Event::CellVoltages(cells),
        Ok(DecodedRecord::Unrecognized(register)) => {
            discard(DecodeError::UnknownRegister(register))
        }
        Err(reason) => discard(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_frame;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn emits_cell_voltages_to_subscribers() {
        let received = Rc::new(RefCell::new(Vec::new()));
        let mut decoder = BmsDecoder::new();
        {
            let received = Rc::clone(&received);
            decoder.subscribe(EventKind::CellVoltages, move |event| {
                received.borrow_mut().push(event.clone());
                Ok(())
            });
        }
        let frame = encode_frame(0x04, &[0x0D, 0x05, 0x0D, 0x06]).unwrap();
        let events = decoder.feed_bytes(frame.as_bytes());
        assert_eq!(events.len(), 1);
        assert_eq!(*received.borrow(), events);
    }

    #[test]
    fn unknown_register_is_reported_with_frame() {
        let mut decoder = BmsDecoder::new();
        let frame = encode_frame(0x05, &[0x01]).unwrap();
        let events = decoder.feed_bytes(frame.as_bytes());
        assert_eq!(
            events,
            vec![Event::DecodeError {
                reason: DecodeError::UnknownRegister(0x05),
                frame: Some(frame.into_bytes()),
            }]
        );
    }

    #[test]
    fn malformed_length_is_reported() {
        let mut decoder = BmsDecoder::new();
        let events = decoder.feed_bytes(&[0xDD, 0x04, 0x00, 0x02, 0xFF, 0xFE, 0x77]);
        assert!(matches!(
            events.as_slice(),
            [Event::DecodeError {
                reason: DecodeError::MalformedFrame(_),
                ..
            }]
        ));
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut decoder = BmsDecoder::new();
        let frame = encode_frame(0x04, &[0x0D, 0x05, 0x0D, 0x06]).unwrap();
        let (head, tail) = frame.as_bytes().split_at(6);
        assert!(decoder.feed_bytes(head).is_empty());
        decoder.reset();
        assert!(decoder.reassembler().is_idle());
        // the tail alone starts a new partial instead of completing the old one
        assert!(decoder.feed_bytes(tail).is_empty());
        assert_eq!(decoder.feed_bytes(frame.as_bytes()).len(), 1);
    }

    #[test]
    fn stream_continues_after_bad_frame() {
        let mut decoder = BmsDecoder::new();
        let mut bad = encode_frame(0x04, &[0x0D, 0x05]).unwrap().into_bytes();
        bad[4] = 0x00;
        let good = encode_frame(0x04, &[0x0D, 0x05]).unwrap();
        assert_eq!(decoder.feed_bytes(&bad)[0].kind(), EventKind::DecodeError);
        assert_eq!(decoder.feed_bytes(good.as_bytes())[0].kind(), EventKind::CellVoltages);
        assert!(decoder.reassembler().is_idle());
    }
}
