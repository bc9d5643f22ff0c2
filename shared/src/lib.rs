//! Shared protocol types for Portgate: control-connection envelopes,
//! the binary frame codec for raw TCP multiplexing, and error types.

pub mod api;
pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{Error, Result};
