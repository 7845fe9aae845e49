//! Wire protocol codecs
//!
//! Two heterogeneous links speak to the fixture:
//! - binary checksum-framed frames on the STM32 link ([`frame`])
//! - newline-terminated ASCII on the Arduino link ([`text`])

pub mod frame;
pub mod text;
