use std::time::Duration;

/// Errors reported by the frame codec and the command dispatcher.
///
/// Every variant is recoverable at the call boundary. The library never
/// retries on its own; that decision is left to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not a single byte arrived before the response timeout elapsed.
    #[error("No response from controller")]
    NoResponse,
    /// The overall exchange bound was reached while the line was still busy.
    #[error("Exchange did not complete within {0:?}")]
    TransportTimeout(Duration),
    /// The response is too short or does not start with the response magic.
    #[error("Malformed response frame")]
    MalformedFrame,
    /// The trailing checksum byte does not match the frame contents.
    #[error("Invalid checksum - calculated={calculated:02X} received={received:02X}")]
    ChecksumMismatch { calculated: u8, received: u8 },
    /// A configuration block of the wrong size was supplied.
    #[error("Invalid configuration block length - expected={expected} received={received}")]
    InvalidInput { expected: usize, received: usize },
    /// The controller explicitly rejected a configuration write.
    #[error("Controller rejected the write ({0})")]
    DeviceNak(String),
    /// A structurally valid frame answered a different command.
    #[error("Unexpected data type - expected={expected:02X} received={received:02X}")]
    UnexpectedDataType { expected: u8, received: u8 },
    /// The reply to a configuration write carried no acknowledgement marker.
    #[error("Unexpected reply to configuration write: {0:02X?}")]
    UnexpectedReply(Vec<u8>),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}
