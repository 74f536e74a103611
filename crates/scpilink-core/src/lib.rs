//! # SCPILink Core Library
//!
//! Core communication engine for SCPI test instruments on an RS-232 link,
//! written for the Rohde & Schwarz CMD57 and compatible equipment.
//!
//! This library provides:
//! - A line-oriented serial transport with bounded reads
//! - A command/response engine with typed reply parsing and
//!   error-queue verification for directives
//! - The two-phase baud negotiation run at connection time
//!
//! Per-instrument command tables are built on top of this crate: they supply
//! the literal SCPI text and the expected reply shape, and hold no transport
//! or timing logic themselves.
//!
//! ## Example
//!
//! ```rust,ignore
//! use scpilink_core::{Connection, ConnectionConfig};
//!
//! let config = ConnectionConfig {
//!     port_name: "/dev/ttyUSB0".to_string(),
//!     ..ConnectionConfig::default()
//! };
//! let mut dev = Connection::connect(config)?;
//!
//! let idn = dev.identify()?;
//! println!("System version: {}", idn.join(" "));
//!
//! dev.send_directive("CONF:NETWork:TYPE GSM900")?;
//! let arfcn = dev.ask_int("CONF:CHAN:BTS:CCCH:ARFCN?")?;
//! dev.close();
//! ```

#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod response;
pub mod serial;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use error::ScpiError;
pub use response::ScpiResponse;
pub use serial::{list_ports, Parity, PortInfo, SerialOptions};
pub use transport::{SerialTransport, Transport};

/// Baud rate the instrument falls back to after a factory reset or power
/// cycle; negotiation probes at this rate first.
pub const FACTORY_BAUD_RATE: u32 = 2400;

/// Target baud rate negotiation brings the instrument up to.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default reply timeout in milliseconds.
///
/// Long-running measurements need more; widen per call site with
/// [`Connection::set_timeout`] and restore the returned previous value.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Read timeout for the probe session in milliseconds.
///
/// Kept short: an instrument already at the target rate never answers
/// anything sent at the factory rate, and nothing is read during the probe.
pub const PROBE_TIMEOUT_MS: u64 = 500;
