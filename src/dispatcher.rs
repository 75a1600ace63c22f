//! Runs one command exchange at a time over a [`Transport`].
//!
//! An exchange drains stale input, sends the frame, waits a blind settle
//! delay, collects the reply until the line goes idle and finally validates
//! and decodes it. Nothing is retried here.

use crate::protocol::{self, ConfigBlock, Frame, RunningStatus};
use crate::transport::Transport;
use crate::Error;
use std::time::Duration;

// Upper bound for discarding stale input before a request.
pub(crate) const MAX_DRAIN_BYTES: usize = 4096;

/// Selects the settle delay the controller needs before its reply is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Query,
    Write,
}

/// Timing and size bounds of a single exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Wait after sending a query before looking for a reply.
    pub query_settle: Duration,
    /// Wait after sending a parameter write before looking for a reply.
    pub write_settle: Duration,
    /// How long to wait for the first reply byte.
    pub response_timeout: Duration,
    /// A reply is complete once the line has been quiet this long.
    pub idle_gap: Duration,
    /// Overall bound of one exchange, settle delay included.
    pub exchange_timeout: Duration,
    pub poll_interval: Duration,
    pub max_response_bytes: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            query_settle: Duration::from_millis(50),
            write_settle: Duration::from_millis(200),
            response_timeout: Duration::from_millis(1000),
            idle_gap: Duration::from_millis(10),
            exchange_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(1),
            max_response_bytes: 64,
        }
    }
}

impl Timing {
    pub fn settle(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Query => self.query_settle,
            CommandClass::Write => self.write_settle,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Owns the transport and serializes exchanges on it.
///
/// Elapsed time is accounted as the sum of the waits issued to the
/// transport, so the exchange bound holds for any [`Transport`].
#[derive(Debug)]
pub struct Dispatcher<T> {
    transport: T,
    timing: Timing,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timing(transport, Timing::default())
    }

    pub fn with_timing(transport: T, timing: Timing) -> Self {
        Self { transport, timing }
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn set_timing(&mut self, timing: Timing) {
        log::trace!("set timing to {timing:?}");
        self.timing = timing;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn drain(&mut self) -> Result<usize, Error> {
        let mut drained = 0;
        while drained < MAX_DRAIN_BYTES {
            let pending = self.transport.available()?;
            if pending == 0 {
                break;
            }
            for _ in 0..pending {
                self.transport.read_one()?;
            }
            drained += pending;
        }
        if drained > 0 {
            log::debug!("Discarded {drained} stale bytes");
        }
        Ok(drained)
    }

    fn collect(&mut self, mut elapsed: u64) -> Result<Vec<u8>, Error> {
        let poll = millis(self.timing.poll_interval).max(1);
        let response_timeout = millis(self.timing.response_timeout);
        let idle_gap = millis(self.timing.idle_gap);
        let bound = millis(self.timing.exchange_timeout);
        let cap = self.timing.max_response_bytes;

        let mut waited = 0;
        while self.transport.available()? == 0 {
            if waited >= response_timeout || elapsed >= bound {
                log::debug!("No reply after {}ms", elapsed);
                return Err(Error::NoResponse);
            }
            self.transport.wait_ms(poll);
            waited += poll;
            elapsed += poll;
        }

        let mut rx_buffer = Vec::with_capacity(protocol::FRAME_LENGTH);
        let mut idle = 0;
        loop {
            let pending = self.transport.available()?;
            if pending > 0 {
                idle = 0;
                for _ in 0..pending {
                    if rx_buffer.len() >= cap {
                        log::warn!("Reply exceeds {cap} bytes, ignoring the rest");
                        return Ok(rx_buffer);
                    }
                    rx_buffer.push(self.transport.read_one()?);
                }
            } else if idle >= idle_gap {
                break;
            } else if elapsed >= bound {
                log::warn!(
                    "Line still busy after {}ms, {} bytes received",
                    elapsed,
                    rx_buffer.len()
                );
                return Err(Error::TransportTimeout(self.timing.exchange_timeout));
            } else {
                self.transport.wait_ms(poll);
                idle += poll;
                elapsed += poll;
            }
        }
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    /// Sends `frame` and returns the raw reply bytes.
    pub fn exchange(&mut self, frame: &Frame, class: CommandClass) -> Result<Vec<u8>, Error> {
        self.drain()?;

        log::trace!("write bytes: {frame:?}");
        self.transport.write(&frame[..])?;
        self.transport.flush()?;

        let settle = millis(self.timing.settle(class));
        self.transport.wait_ms(settle);
        self.collect(settle)
    }

    pub fn query_running_status(&mut self) -> Result<RunningStatus, Error> {
        log::trace!("query running status");
        let reply = self.exchange(&protocol::build_status_query(), CommandClass::Query)?;
        RunningStatus::decode(&reply)
    }

    pub fn query_parameters(&mut self) -> Result<ConfigBlock, Error> {
        log::trace!("query parameters");
        let reply = self.exchange(&protocol::build_parameter_query(), CommandClass::Query)?;
        ConfigBlock::decode(&reply)
    }

    /// Writes a complete configuration block and checks the acknowledgement.
    ///
    /// A block that is not exactly 16 bytes is rejected before anything is
    /// sent.
    pub fn write_configuration(&mut self, config: &[u8]) -> Result<(), Error> {
        log::trace!("write configuration {config:02X?}");
        let frame = protocol::build_parameter_write(config)?;
        let reply = self.exchange(&frame, CommandClass::Write)?;
        protocol::decode_write_reply(&reply)
    }
}
