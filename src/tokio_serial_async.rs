//! Provides an asynchronous client for an MPPT solar charge controller using
//! Tokio and the `tokio-serial` crate.
//!
//! The exchange sequence matches [`crate::dispatcher::Dispatcher`], but the
//! settle delay and every wait for reply bytes yield to the runtime instead
//! of blocking the thread. Every step of an exchange, stale input drain and
//! write included, is bounded by [`Timing::exchange_timeout`]. The client
//! takes `&mut self` for every exchange, so two exchanges can never overlap
//! on the same port.
//!
//! # Example
//!
//! ```no_run
//! use mpptctl_lib::tokio_serial_async::{Error, MpptController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut controller = MpptController::new("/dev/ttyUSB0")?;
//!
//!     let status = controller.query_running_status().await?;
//!     println!("PV: {} V, {} A", status.pv_voltage, status.pv_current);
//!
//!     controller.set_load_state(true).await?;
//!     Ok(())
//! }
//! ```

use crate::dispatcher::{CommandClass, Timing, MAX_DRAIN_BYTES};
use crate::parameters::{LOAD_OUTPUT_OFF, LOAD_OUTPUT_ON};
use crate::protocol::{self, ConfigBlock, Frame, RunningStatus};
use crate::transport::DEFAULT_BAUD_RATE;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_serial::SerialPortBuilderExt;

/// Errors specific to the asynchronous Tokio serial port client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error reported by the protocol layer.
    #[error("MPPT error: {0}")]
    MpptError(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

/// Asynchronous counterpart of the blocking dispatcher.
///
/// Normally bound to a serial port, but any byte stream works, which is
/// how the client is exercised in tests.
#[derive(Debug)]
pub struct MpptController<S = tokio_serial::SerialStream> {
    stream: S,
    timing: Timing,
}

impl MpptController<tokio_serial::SerialStream> {
    /// Opens `port` at the default baud rate with default timing.
    ///
    /// # Arguments
    ///
    /// * `port`: The serial port device path, e.g. `/dev/ttyUSB0` or `COM1`.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new client or an `Error` if the port cannot be opened.
    pub fn new(port: &str) -> Result<Self> {
        Self::with_baud_rate(port, DEFAULT_BAUD_RATE)
    }

    /// Opens `port` (8N1, no flow control) at `baud_rate`.
    ///
    /// # Arguments
    ///
    /// * `port`: The serial port device path.
    /// * `baud_rate`: The line speed to configure.
    ///
    /// # Returns
    ///
    /// A `Result` containing the new client or an `Error` if the port cannot be opened.
    pub fn with_baud_rate(port: &str, baud_rate: u32) -> Result<Self> {
        log::debug!("open serial port {port} at {baud_rate} baud");
        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        Ok(Self::from_stream(serial, Timing::default()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> MpptController<S> {
    /// Wraps an already opened byte stream.
    ///
    /// # Arguments
    ///
    /// * `stream`: The connection to the controller.
    /// * `timing`: Settle delays and bounds used for every exchange.
    pub fn from_stream(stream: S, timing: Timing) -> Self {
        Self { stream, timing }
    }

    /// Replaces the timing used by subsequent exchanges.
    ///
    /// # Arguments
    ///
    /// * `timing`: The new settle delays and bounds.
    pub fn set_timing(&mut self, timing: Timing) {
        log::trace!("set timing to {timing:?}");
        self.timing = timing;
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn timed_out(&self) -> Error {
        crate::Error::TransportTimeout(self.timing.exchange_timeout).into()
    }

    fn remaining(&self, deadline: Instant) -> Result<Duration> {
        match deadline.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(self.timed_out()),
        }
    }

    /// Discards anything left over from an earlier, possibly failed, exchange.
    /// Stops once the line has been quiet for the idle gap.
    async fn drain(&mut self, deadline: Instant) -> Result<()> {
        let mut buf = [0u8; 64];
        let mut drained = 0;
        while drained < MAX_DRAIN_BYTES {
            let left = self.remaining(deadline)?;
            let wait = self.timing.idle_gap.min(left);
            match timeout(wait, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(received) => drained += received?,
                Err(_) if wait < self.timing.idle_gap => return Err(self.timed_out()),
                // line is quiet
                Err(_) => break,
            }
        }
        if drained > 0 {
            log::debug!("Discarded {drained} stale bytes");
        }
        Ok(())
    }

    async fn collect(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        let cap = self.timing.max_response_bytes;
        let mut buf = [0u8; 64];

        let first_wait = match self.remaining(deadline) {
            Ok(left) => self.timing.response_timeout.min(left),
            Err(_) => return Err(crate::Error::NoResponse.into()),
        };
        let received = match timeout(first_wait, self.stream.read(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => 0,
        };
        if received == 0 {
            log::debug!("No reply within {first_wait:?}");
            return Err(crate::Error::NoResponse.into());
        }

        let mut rx_buffer = Vec::with_capacity(protocol::FRAME_LENGTH);
        rx_buffer.extend_from_slice(&buf[..received.min(cap)]);
        while rx_buffer.len() < cap {
            let left = self.remaining(deadline)?;
            let wait = self.timing.idle_gap.min(left);
            match timeout(wait, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(received) => {
                    let received = received?.min(cap - rx_buffer.len());
                    rx_buffer.extend_from_slice(&buf[..received]);
                }
                Err(_) if wait < self.timing.idle_gap => {
                    log::warn!(
                        "Line still busy after {:?}, {} bytes received",
                        self.timing.exchange_timeout,
                        rx_buffer.len()
                    );
                    return Err(self.timed_out());
                }
                // line went idle
                Err(_) => break,
            }
        }
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        Ok(rx_buffer)
    }

    /// Sends `frame` and returns the raw reply bytes.
    ///
    /// # Arguments
    ///
    /// * `frame`: The command frame to send.
    /// * `class`: Selects the settle delay before the reply is collected.
    ///
    /// # Returns
    ///
    /// A `Result` containing the unvalidated reply, `NoResponse` if nothing
    /// arrived, or `TransportTimeout` if the exchange bound was reached.
    pub async fn exchange(&mut self, frame: &Frame, class: CommandClass) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timing.exchange_timeout;
        self.drain(deadline).await?;

        log::trace!("write bytes: {frame:?}");
        let left = self.remaining(deadline)?;
        let written = timeout(left, self.stream.write_all(&frame[..])).await;
        written.map_err(|_| self.timed_out())??;
        let left = self.remaining(deadline)?;
        let flushed = timeout(left, self.stream.flush()).await;
        flushed.map_err(|_| self.timed_out())??;

        let settle = self.timing.settle(class);
        tokio::time::sleep(settle.min(self.remaining(deadline)?)).await;
        self.collect(deadline).await
    }

    /// Asynchronously queries the running status.
    ///
    /// # Returns
    ///
    /// A `Result` containing the decoded `RunningStatus` or an `Error` if the
    /// exchange fails or the reply does not validate.
    pub async fn query_running_status(&mut self) -> Result<RunningStatus> {
        log::trace!("query running status");
        let reply = self
            .exchange(&protocol::build_status_query(), CommandClass::Query)
            .await?;
        Ok(RunningStatus::decode(&reply)?)
    }

    /// Asynchronously reads the 16 byte parameter block.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `ConfigBlock` or an `Error`.
    pub async fn query_parameters(&mut self) -> Result<ConfigBlock> {
        log::trace!("query parameters");
        let reply = self
            .exchange(&protocol::build_parameter_query(), CommandClass::Query)
            .await?;
        Ok(ConfigBlock::decode(&reply)?)
    }

    /// Writes a complete configuration block and checks the acknowledgement.
    ///
    /// # Arguments
    ///
    /// * `config`: Exactly 16 bytes. Any other size is rejected before anything is sent.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the controller acknowledged the write, otherwise an `Error`.
    pub async fn write_configuration(&mut self, config: &[u8]) -> Result<()> {
        log::trace!("write configuration {config:02X?}");
        let frame = protocol::build_parameter_write(config)?;
        let reply = self.exchange(&frame, CommandClass::Write).await?;
        Ok(protocol::decode_write_reply(&reply)?)
    }

    /// Reads the parameter block, applies `mutate` and writes it back.
    /// Nothing is written if the read fails.
    ///
    /// # Arguments
    ///
    /// * `operation`: Name used in log messages.
    /// * `mutate`: Changes the bytes the operation owns.
    ///
    /// # Returns
    ///
    /// A `Result` containing the block that was written and acknowledged.
    pub async fn update_configuration<F>(
        &mut self,
        operation: &str,
        mutate: F,
    ) -> Result<ConfigBlock>
    where
        F: FnOnce(&mut ConfigBlock),
    {
        let mut block = match self.query_parameters().await {
            Ok(block) => block,
            Err(err) => {
                log::warn!("{operation}: cannot read configuration, nothing written ({err})");
                return Err(err);
            }
        };
        log::debug!("{operation}: current configuration {block:?}");

        mutate(&mut block);

        log::debug!("{operation}: writing configuration {block:?}");
        match self.write_configuration(&block[..]).await {
            Ok(()) => {
                log::info!("{operation}: configuration acknowledged");
                Ok(block)
            }
            Err(err) => {
                log::warn!("{operation}: configuration write failed ({err})");
                Err(err)
            }
        }
    }

    /// Clears the energy counters and/or reboots the controller.
    ///
    /// # Arguments
    ///
    /// * `clear`: Clear the daily and total energy counters.
    /// * `reboot`: Reboot the controller.
    pub async fn reset_energy(&mut self, clear: bool, reboot: bool) -> Result<()> {
        self.update_configuration("reset energy", |block| {
            block.set_reset_control(clear, reboot)
        })
        .await
        .map(|_| ())
    }

    /// Sets the charging parameters, leaving the rest of the block untouched.
    ///
    /// # Arguments
    ///
    /// * `charge_current`: Raw charge current value.
    /// * `battery_type`: Raw battery type value.
    /// * `const_voltage`: Raw constant charge voltage.
    /// * `load_undervoltage`: Raw load under-voltage disconnect threshold.
    pub async fn set_charging_params(
        &mut self,
        charge_current: u8,
        battery_type: u8,
        const_voltage: u16,
        load_undervoltage: u16,
    ) -> Result<()> {
        self.update_configuration("set charging parameters", |block| {
            block.set_charging_params(
                charge_current,
                battery_type,
                const_voltage,
                load_undervoltage,
            )
        })
        .await
        .map(|_| ())
    }

    /// Sets the raw load output mode.
    ///
    /// # Arguments
    ///
    /// * `mode`: `0` switches the load off, `1` switches it on.
    pub async fn set_load_output(&mut self, mode: u8) -> Result<()> {
        self.update_configuration("set load output", |block| block.set_load_output(mode))
            .await
            .map(|_| ())
    }

    /// Switches the load output.
    ///
    /// # Arguments
    ///
    /// * `on`: `true` turns the load on.
    pub async fn set_load_state(&mut self, on: bool) -> Result<()> {
        self.set_load_output(if on { LOAD_OUTPUT_ON } else { LOAD_OUTPUT_OFF })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{response, status_response};
    use crate::protocol::FRAME_LENGTH;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn quick_timing() -> Timing {
        Timing {
            query_settle: Duration::from_millis(5),
            write_settle: Duration::from_millis(5),
            response_timeout: Duration::from_millis(50),
            idle_gap: Duration::from_millis(10),
            exchange_timeout: Duration::from_millis(300),
            ..Timing::default()
        }
    }

    /// Answers each received request with the next reply and returns the
    /// requests once the client side is dropped.
    fn controller(
        replies: Vec<Vec<u8>>,
    ) -> (MpptController<DuplexStream>, JoinHandle<Vec<Vec<u8>>>) {
        let (client, mut device) = tokio::io::duplex(256);
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            let mut replies = replies.into_iter();
            let mut request = [0u8; FRAME_LENGTH];
            while device.read_exact(&mut request).await.is_ok() {
                requests.push(request.to_vec());
                if let Some(reply) = replies.next() {
                    if device.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            }
            requests
        });
        (MpptController::from_stream(client, quick_timing()), handle)
    }

    #[tokio::test]
    async fn status_exchange() {
        let (mut client, device) = controller(vec![status_response()]);
        let status = client.query_running_status().await.unwrap();
        assert_eq!(status.pv_voltage, 20.0);
        assert_eq!(status.working_mode.label(), "Tracking");

        drop(client);
        let requests = device.await.unwrap();
        assert_eq!(requests, vec![protocol::build_status_query().to_vec()]);
    }

    #[tokio::test]
    async fn silence_is_no_response() {
        let (mut client, _device) = controller(vec![]);
        assert!(matches!(
            client.query_running_status().await,
            Err(Error::MpptError(crate::Error::NoResponse))
        ));
    }

    #[tokio::test]
    async fn failed_read_writes_nothing() {
        let (mut client, device) = controller(vec![]);
        assert!(matches!(
            client.set_load_state(true).await,
            Err(Error::MpptError(crate::Error::NoResponse))
        ));

        drop(client);
        let requests = device.await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0][3], 0x02);
    }

    #[tokio::test]
    async fn nak_is_failure() {
        let block: Vec<u8> = (0x30..0x40).collect();
        let (mut client, device) = controller(vec![response(0x02, &block), b"NAK".to_vec()]);
        assert!(matches!(
            client.set_load_output(1).await,
            Err(Error::MpptError(crate::Error::DeviceNak(marker))) if marker == "NAK"
        ));

        drop(client);
        let requests = device.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1][3], 0x01);
        assert_eq!(requests[1][4 + 11], 1);
        assert_eq!(requests[1][4..15], block[..11]);
    }

    #[tokio::test]
    async fn acknowledged_write_returns_block() {
        let (mut client, _device) = controller(vec![response(0x02, &[0; 16]), b"ACK".to_vec()]);
        let block = client
            .update_configuration("test", |block| block.set_reset_control(true, false))
            .await
            .unwrap();
        assert_eq!(block.reset_control(), 0x01);
    }

    #[tokio::test]
    async fn wrong_sized_block_is_never_sent() {
        let (mut client, device) = controller(vec![b"ACK".to_vec()]);
        assert!(matches!(
            client.write_configuration(&[0; 15]).await,
            Err(Error::MpptError(crate::Error::InvalidInput { .. }))
        ));

        drop(client);
        assert!(device.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn noisy_line_is_bounded() {
        let (client, mut device) = tokio::io::duplex(256);
        let noise = tokio::spawn(async move {
            while device.write_all(&[0x55]).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        let mut client = MpptController::from_stream(client, quick_timing());

        let started = Instant::now();
        let result = timeout(Duration::from_secs(2), client.query_running_status())
            .await
            .expect("exchange must end on its own");
        assert!(matches!(
            result,
            Err(Error::MpptError(crate::Error::TransportTimeout(_)))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));

        drop(client);
        noise.await.unwrap();
    }

    #[tokio::test]
    async fn busy_reply_is_bounded() {
        let (client, mut device) = tokio::io::duplex(256);
        let chatter = tokio::spawn(async move {
            let mut request = [0u8; FRAME_LENGTH];
            if device.read_exact(&mut request).await.is_err() {
                return;
            }
            while device.write_all(&[0xaa]).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });
        let timing = Timing {
            max_response_bytes: 4096,
            ..quick_timing()
        };
        let mut client = MpptController::from_stream(client, timing);

        let result = timeout(Duration::from_secs(2), client.query_running_status())
            .await
            .expect("exchange must end on its own");
        assert!(matches!(
            result,
            Err(Error::MpptError(crate::Error::TransportTimeout(_)))
        ));

        drop(client);
        chatter.await.unwrap();
    }
}
