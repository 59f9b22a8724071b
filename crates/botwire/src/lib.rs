//! Deadline-bounded blocking TCP transport for remote device control.
//!
//! A [`DeviceConnection`] speaks a device's line-oriented command protocol
//! over one TCP connection. Every blocking line operation carries a hard
//! deadline enforced by a per-connection watchdog: when the deadline fires,
//! the watchdog shuts the socket down, the operation fails with
//! [`WireError::Timeout`], and the connection stays unusable until the
//! caller reconnects. Raw sends and serial passthrough reads share the
//! connection but are deliberately untimed.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use botwire::DeviceConnection;
//!
//! fn main() -> Result<(), botwire::WireError> {
//!     let conn = DeviceConnection::connect("192.168.1.50", "9000")?;
//!     conn.write_line("VERSION?", Duration::from_millis(250))?;
//!     let reply = conn.read_line(Duration::from_millis(250))?;
//!     println!("device answered: {reply}");
//!     conn.close();
//!     Ok(())
//! }
//! ```

pub mod connection;
pub(crate) mod deadline;
mod diag;
pub mod error;
pub mod framing;

pub use connection::{ConnectOptions, DeviceConnection};
#[cfg(feature = "diagnostics")]
pub use diag::SessionLog;
pub use error::WireError;
pub use framing::{LINE_DELIMITER, SERIAL_ESCAPE};
