use crate::dispatcher::{Dispatcher, Timing};
use crate::transport::{Transport, DEFAULT_BAUD_RATE};
use crate::Error;
use std::io::{Read, Write};
use std::time::Duration;

/// [`Transport`] over a local serial port.
pub struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.serial.name())
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    pub fn new(port: &str) -> Result<Self, Error> {
        Self::with_baud_rate(port, DEFAULT_BAUD_RATE)
    }

    pub fn with_baud_rate(port: &str, baud_rate: u32) -> Result<Self, Error> {
        log::debug!("open serial port {port} at {baud_rate} baud");
        Ok(Self {
            serial: serialport::new(port, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                // only reached by read_one, which is called once bytes are pending
                .timeout(Duration::from_millis(100))
                .open()?,
        })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.serial.write_all(bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
    }

    fn available(&mut self) -> Result<usize, Error> {
        Ok(self.serial.bytes_to_read()? as usize)
    }

    fn read_one(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        self.serial.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn wait_ms(&mut self, millis: u64) {
        std::thread::sleep(Duration::from_millis(millis));
    }
}

impl Dispatcher<SerialTransport> {
    /// Opens `port` and wraps it in a dispatcher using `timing`.
    pub fn open(port: &str, baud_rate: u32, timing: Timing) -> Result<Self, Error> {
        Ok(Self::with_timing(
            SerialTransport::with_baud_rate(port, baud_rate)?,
            timing,
        ))
    }
}
