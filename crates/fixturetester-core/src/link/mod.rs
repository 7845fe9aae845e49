//! Device communication layer
//!
//! - [`ports`]: the port enumeration/open contract a shell fulfills
//! - [`transport`]: text/binary links, handshake probes, reader tasks
//! - [`correlator`]: single-slot GPIO confirmation correlation

pub mod correlator;
pub mod ports;
pub mod transport;
