//! Asynchronous client for a JBD BMS on top of Tokio and `tokio-serial`.
//!
//! Subscribers registered here run inline while a reply is being decoded, so
//! the client is not `Send` and belongs on a current-thread runtime or a
//! `LocalSet`.
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::tokio_serial_async::JbdBms;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), jbdbms_lib::Error> {
//! let mut bms = JbdBms::new("/dev/ttyUSB0")?;
//! bms.set_timeout(Duration::from_millis(800));
//!
//! let status = bms.get_status().await?;
//! println!("{:.2} V, {} %", status.voltage, status.state_of_charge);
//!
//! let cells = bms.get_cell_voltages().await?;
//! println!("{:?} mV", cells.millivolts);
//! # Ok(())
//! # }
//! ```

use crate::event::{select, HandlerError};
use crate::protocol::Command;
use crate::register::{CellVoltageRecord, StatusRecord};
use crate::{BmsDecoder, Error, Event, EventKind, SubscriptionId};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct JbdBms {
    serial: tokio_serial::SerialStream,
    decoder: BmsDecoder,
    timeout: Duration,
}

impl JbdBms {
    /// Opens `port` with 9600 8N1, the factory setting of the BMS UART.
    pub fn new(port: &str) -> Result<Self> {
        let serial = tokio_serial::new(port, 9600)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        Ok(Self::with_decoder(serial, BmsDecoder::new()))
    }

    pub fn with_decoder(serial: tokio_serial::SerialStream, decoder: BmsDecoder) -> Self {
        Self {
            serial,
            decoder,
            timeout: Duration::from_millis(500),
        }
    }

    /// How long [`JbdBms::poll`] waits for a complete reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.timeout = timeout;
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) -> std::result::Result<(), HandlerError> + 'static,
    {
        self.decoder.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.decoder.unsubscribe(id)
    }

    pub async fn send(&mut self, command: Command) -> Result<()> {
        // late replies of an earlier request would collide with the next one
        loop {
            let pending = self.serial.bytes_to_read().map_err(std::io::Error::from)?;
            if pending == 0 {
                break;
            }
            log::trace!("got {pending} pending bytes");
            let mut buf: Vec<u8> = vec![0; 64];
            let received = tokio::time::timeout(self.timeout, self.serial.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            self.decoder.feed_bytes(&buf[..received]);
        }

        log::trace!("send {:?}: {:02X?}", command, command.bytes());
        tokio::time::timeout(self.timeout, self.serial.write_all(command.bytes()))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    /// Sends `command` and reads until at least one event was emitted.
    ///
    /// There is no retry. A reply that is still incomplete when the timeout
    /// elapses is dropped.
    pub async fn poll(&mut self, command: Command) -> Result<Vec<Event>> {
        self.send(command).await?;
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 64];
        loop {
            let received = match tokio::time::timeout_at(deadline, self.serial.read(&mut buf)).await
            {
                Ok(received) => received?,
                Err(_) => {
                    log::debug!("No reply to {:?} within {:?}", command, self.timeout);
                    self.decoder.reset();
                    return Err(Error::Timeout);
                }
            };
            if received == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            let events = self.decoder.feed_bytes(&buf[..received]);
            if !events.is_empty() {
                return Ok(events);
            }
        }
    }

    pub async fn get_status(&mut self) -> Result<StatusRecord> {
        match select(self.poll(Command::ReadStatus).await?, EventKind::Status)? {
            Event::Status(status) => Ok(status),
            _ => Err(Error::UnexpectedEvent),
        }
    }

    pub async fn get_cell_voltages(&mut self) -> Result<CellVoltageRecord> {
        match select(
            self.poll(Command::ReadCellVoltages).await?,
            EventKind::CellVoltages,
        )? {
            Event::CellVoltages(cells) => Ok(cells),
            _ => Err(Error::UnexpectedEvent),
        }
    }
}
