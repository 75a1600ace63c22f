#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mpptctl_lib
//!
//! This crate drives MPPT solar charge controllers that speak the fixed
//! 21 byte request/response protocol over a serial link. It builds and
//! validates frames, runs command exchanges, decodes telemetry and changes
//! the controller configuration through a read-modify-write cycle that is
//! checked against the controller's acknowledgement.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the client you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `mpptctl` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** [`Transport`] implementation using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing decoded data structures.
//! - `bin-dependencies`: Enables all features required by the `mpptctl` binary executable.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "serialport")]
//! # fn main() -> Result<(), mpptctl_lib::Error> {
//! use mpptctl_lib::dispatcher::{Dispatcher, Timing};
//!
//! let mut controller = Dispatcher::open("/dev/ttyUSB0", 9600, Timing::default())?;
//! let status = controller.query_running_status()?;
//! println!("battery: {} V, mode: {}", status.battery_voltage, status.working_mode);
//!
//! controller.reset_energy(true, false)?;
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serialport"))]
//! # fn main() {}
//! ```

/// Contains error types for the library.
mod error;
/// Runs a single command exchange over a transport.
pub mod dispatcher;
/// Read-modify-write configuration changes.
pub mod parameters;
/// Periodic status polling and the sink boundary.
pub mod poll;
/// Defines the frame format of the controller protocol.
pub mod protocol;
/// Byte stream abstraction the dispatcher runs on.
pub mod transport;

pub use dispatcher::{CommandClass, Dispatcher, Timing};
pub use error::Error;
pub use transport::Transport;

/// Synchronous serial transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous client for MPPT controller communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
