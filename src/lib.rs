#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate decodes telemetry from JBD lithium battery management systems.
//! The BMS answers read requests with `0xDD ... 0x77` framed replies; the
//! transport (UART, BLE notifications, a socket) may split or merge them
//! arbitrarily, so the bytes go through a [`BmsDecoder`] which reassembles,
//! validates and decodes them and hands the resulting [`Event`]s to
//! subscribers.
//!
//! ```
//! use jbdbms_lib::{protocol, BmsDecoder, Event, EventKind};
//!
//! let mut decoder = BmsDecoder::new();
//! decoder.subscribe(EventKind::CellVoltages, |event| {
//!     if let Event::CellVoltages(cells) = event {
//!         println!("{:?} mV", cells.millivolts);
//!     }
//!     Ok(())
//! });
//!
//! let reply = protocol::encode_frame(0x04, &[0x0D, 0x05, 0x0D, 0x06]).unwrap();
//! let (head, tail) = reply.as_bytes().split_at(5);
//! assert!(decoder.feed_bytes(head).is_empty());
//! assert_eq!(decoder.feed_bytes(tail).len(), 1);
//! ```
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jbdbms` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the decoded records.

mod decoder;
mod error;

pub mod dispatcher;
pub mod event;
/// Frame layout, checksum and the outbound read requests.
pub mod protocol;
pub mod reassembler;
pub mod register;

pub use decoder::{process_frame, BmsDecoder};
pub use error::{DecodeError, Error};
pub use event::{Event, EventKind, SubscriptionId};

/// Synchronous client for JBD BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for JBD BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
