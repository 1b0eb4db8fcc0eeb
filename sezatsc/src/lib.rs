//! Driver for Sezmi networked dual-channel ATSC tuner appliances.
//!
//! The appliance carries two LG DT3305 demodulators behind an embedded CPU
//! reachable over the local network. This crate discovers appliances on
//! link-local interfaces, drives their RF front end and demodulators over a
//! framed TCP control protocol, scans the over-the-air spectrum with both
//! demodulators in parallel, and decodes the PSIP tables out of the UDP
//! transport-stream feed into a channel directory.
//!
//! The usual flow:
//!
//! ```no_run
//! use sezatsc::{discover, Endpoint};
//!
//! # fn main() -> sezatsc::Result<()> {
//! for device in discover()? {
//!     let mut endpoint = Endpoint::open(device)?;
//!     let carriers = endpoint.scan(None, sezatsc::tuner::DEFAULT_CR_MS)?;
//!     println!("carriers: {carriers:?}");
//!     endpoint.close();
//! }
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod endpoint;
pub mod error;
pub mod iface;
pub mod psip;
pub mod term;
pub mod transport;
pub mod tuner;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use transport::{discover, ControlSocket, DiscoveredDevice};
pub use tuner::{Antenna, SignalStatus};
