#![forbid(unsafe_code)]
#![doc = "Common types, error codes and connection-status constants for tlsock."]

pub mod error;
pub mod status;

pub use error::*;
pub use status::*;
