//! Port enumeration/open contract
//!
//! The engine never enumerates hardware itself. A shell supplies a
//! [`PortProvider`]; tests supply one backed by `tokio::io::duplex`.

use std::collections::HashSet;

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte-stream requirements for a device link.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// An opened, connectable byte stream to a candidate device.
pub type DeviceIo = Box<dyn AsyncIo>;

/// Supplies connectable port candidates and opens them.
pub trait PortProvider: Send {
    /// Ports worth probing, minus `exclude` (ports already claimed by a
    /// connected device).
    fn list_ports(&self, exclude: &HashSet<String>) -> Vec<String>;

    /// Open a candidate at the given baud rate.
    fn open(&self, port: &str, baud_rate: u32) -> std::io::Result<DeviceIo>;
}
