use crate::event::select;
use crate::protocol::Command;
use crate::register::{CellVoltageRecord, StatusRecord};
use crate::{BmsDecoder, Error, Event, EventKind, SubscriptionId};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Error>;

/// Granularity of the blocking reads while waiting for a reply.
const READ_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub struct JbdBms {
    serial: Box<dyn serialport::SerialPort>,
    decoder: BmsDecoder,
    timeout: Duration,
}

impl JbdBms {
    pub fn new(port: &str) -> Result<Self> {
        let serial = serialport::new(port, 9600)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_SLICE)
            .open()
            .map_err(std::io::Error::from)?;
        Ok(Self::with_decoder(serial, BmsDecoder::new()))
    }

    /// Wraps an already opened port, e.g. a BLE-UART bridge with its own settings.
    pub fn with_decoder(serial: Box<dyn serialport::SerialPort>, decoder: BmsDecoder) -> Self {
        Self {
            serial,
            decoder,
            timeout: Duration::from_millis(500),
        }
    }

    /// How long [`JbdBms::poll`] waits for a complete reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event) -> std::result::Result<(), crate::event::HandlerError> + 'static,
    {
        self.decoder.subscribe(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.decoder.unsubscribe(id)
    }

    pub fn send(&mut self, command: Command) -> Result<()> {
        // clear all incoming serial to avoid data collision
        loop {
            let pending = self
                .serial
                .bytes_to_read()
                .map_err(std::io::Error::from)?;
            if pending > 0 {
                log::trace!("Got {} pending bytes", pending);
                let mut buf: Vec<u8> = vec![0; 64];
                let received = self.serial.read(buf.as_mut_slice())?;
                // stale replies still go through the decoder so subscribers see them
                self.decoder.feed_bytes(&buf[..received]);
            } else {
                break;
            }
        }

        log::trace!("send {:?}: {:02X?}", command, command.bytes());
        self.serial.write_all(command.bytes())?;
        Ok(())
    }

    /// Sends `command` and reads until at least one event was emitted.
    ///
    /// No retry is attempted; on [`Error::Timeout`] a partial reply is dropped.
    pub fn poll(&mut self, command: Command) -> Result<Vec<Event>> {
        self.send(command)?;
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 64];
        loop {
            match self.serial.read(&mut buf) {
                Ok(0) => {}
                Ok(received) => {
                    let events = self.decoder.feed_bytes(&buf[..received]);
                    if !events.is_empty() {
                        return Ok(events);
                    }
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }
            if Instant::now() >= deadline {
                log::debug!("No reply to {:?} within {:?}", command, self.timeout);
                self.decoder.reset();
                return Err(Error::Timeout);
            }
        }
    }

    pub fn get_status(&mut self) -> Result<StatusRecord> {
        match select(self.poll(Command::ReadStatus)?, EventKind::Status)? {
            Event::Status(status) => Ok(status),
            _ => Err(Error::UnexpectedEvent),
        }
    }

    pub fn get_cell_voltages(&mut self) -> Result<CellVoltageRecord> {
        match select(self.poll(Command::ReadCellVoltages)?, EventKind::CellVoltages)? {
            Event::CellVoltages(cells) => Ok(cells),
            _ => Err(Error::UnexpectedEvent),
        }
    }
}
