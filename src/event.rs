use crate::register::{CellVoltageRecord, StatusRecord};
use crate::{DecodeError, Error};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Everything the decoder reports to its subscribers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Event {
    Status(StatusRecord),
    CellVoltages(CellVoltageRecord),
    /// A frame was discarded; `frame` holds its raw bytes when there were any.
    DecodeError {
        #[cfg_attr(feature = "serde", serde(serialize_with = "serialize_display"))]
        reason: DecodeError,
        frame: Option<Vec<u8>>,
    },
}

#[cfg(feature = "serde")]
fn serialize_display<S: serde::Serializer>(
    value: &DecodeError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    CellVoltages,
    DecodeError,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Status(_) => EventKind::Status,
            Event::CellVoltages(_) => EventKind::CellVoltages,
            Event::DecodeError { .. } => EventKind::DecodeError,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked synchronously for every event of the subscribed kind.
pub type Handler = Box<dyn FnMut(&Event) -> Result<(), HandlerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Ordered registry of handlers per [`EventKind`].
///
/// Handlers run in registration order. A handler returning an error or
/// panicking is logged and does not keep later handlers from running. A
/// handler that panicked stays registered, and whatever state it shares with
/// other code may be left half updated.
#[derive(Default)]
pub struct Subscribers {
    next_id: u64,
    handlers: Vec<(SubscriptionId, EventKind, Handler)>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) -> Result<(), HandlerError> + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, kind, Box::new(handler)));
        log::trace!("subscribe {:?} to {:?}", id, kind);
        id
    }

    /// Returns false if the id was not (or no longer) registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _, _)| *handler_id != id);
        before != self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs every handler registered for the event's kind, returns how many failed.
    pub fn emit(&mut self, event: &Event) -> usize {
        let kind = event.kind();
        let mut failed = 0;
        for (id, _, handler) in self
            .handlers
            .iter_mut()
            .filter(|(_, handler_kind, _)| *handler_kind == kind)
        {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    log::warn!("Subscriber {:?} failed on {:?} event: {}", id, kind, err);
                    failed += 1;
                }
                Err(_) => {
                    log::error!("Subscriber {:?} panicked on {:?} event", id, kind);
                    failed += 1;
                }
            }
        }
        failed
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("next_id", &self.next_id)
            .field(
                "handlers",
                &self
                    .handlers
                    .iter()
                    .map(|(id, kind, _)| (id, kind))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Picks the first event of `kind` out of a reply, turning a decode failure into an error.
pub fn select(events: Vec<Event>, kind: EventKind) -> Result<Event, Error> {
    let mut failure = None;
    for event in events {
        if event.kind() == kind {
            return Ok(event);
        }
        if let Event::DecodeError { reason, .. } = event {
            failure = Some(reason);
        }
    }
    match failure {
        Some(reason) => Err(Error::Decode(reason)),
        None => Err(Error::UnexpectedEvent),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn cells(mv: u16) -> Event {
        Event::CellVoltages(CellVoltageRecord {
            millivolts: vec![mv],
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut subscribers = Subscribers::new();
        for n in 0..3 {
            let calls = Rc::clone(&calls);
            subscribers.subscribe(EventKind::CellVoltages, move |_| {
                calls.borrow_mut().push(n);
                Ok(())
            });
        }
        assert_eq!(subscribers.emit(&cells(3300)), 0);
        assert_eq!(*calls.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_handler_does_not_stop_later_ones() {
        let reached = Rc::new(RefCell::new(false));
        let mut subscribers = Subscribers::new();
        subscribers.subscribe(EventKind::CellVoltages, |_| Err("broken".into()));
        {
            let reached = Rc::clone(&reached);
            subscribers.subscribe(EventKind::CellVoltages, move |_| {
                *reached.borrow_mut() = true;
                Ok(())
            });
        }
        assert_eq!(subscribers.emit(&cells(3300)), 1);
        assert!(*reached.borrow());
    }

    #[test]
    fn panicking_handler_does_not_stop_later_ones() {
        let reached = Rc::new(RefCell::new(0));
        let mut subscribers = Subscribers::new();
        subscribers.subscribe(EventKind::CellVoltages, |_| panic!("display gone"));
        {
            let reached = Rc::clone(&reached);
            subscribers.subscribe(EventKind::CellVoltages, move |_| {
                *reached.borrow_mut() += 1;
                Ok(())
            });
        }
        assert_eq!(subscribers.emit(&cells(3300)), 1);
        assert_eq!(subscribers.emit(&cells(3301)), 1);
        assert_eq!(*reached.borrow(), 2);
        assert_eq!(subscribers.len(), 2);
    }

    #[test]
    fn only_matching_kind_is_called() {
        let count = Rc::new(RefCell::new(0));
        let mut subscribers = Subscribers::new();
        {
            let count = Rc::clone(&count);
            subscribers.subscribe(EventKind::Status, move |_| {
                *count.borrow_mut() += 1;
                Ok(())
            });
        }
        subscribers.emit(&cells(3300));
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn select_prefers_wanted_kind() {
        let failure = Event::DecodeError {
            reason: DecodeError::UnknownRegister(0x05),
            frame: None,
        };
        let selected = select(vec![failure.clone(), cells(3300)], EventKind::CellVoltages);
        assert_eq!(selected.unwrap(), cells(3300));
        assert!(matches!(
            select(vec![failure], EventKind::Status),
            Err(Error::Decode(DecodeError::UnknownRegister(0x05)))
        ));
        assert!(matches!(
            select(vec![cells(3300)], EventKind::Status),
            Err(Error::UnexpectedEvent)
        ));
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let count = Rc::new(RefCell::new(0));
        let mut subscribers = Subscribers::new();
        let id = {
            let count = Rc::clone(&count);
            subscribers.subscribe(EventKind::CellVoltages, move |_| {
                *count.borrow_mut() += 1;
                Ok(())
            })
        };
        subscribers.emit(&cells(3300));
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        subscribers.emit(&cells(3300));
        assert_eq!(*count.borrow(), 1);
        assert!(subscribers.is_empty());
    }
}
