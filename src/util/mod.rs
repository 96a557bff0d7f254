//! Utility modules for the relay.
//!
//! - [`b64`] - base64url octets (RFC 7515 encoding)
//! - [`hexstr`] - canonical hex forms
//! - [`sig_down`] - graceful shutdown signal handling
//! - [`telemetry`] - tracing setup

pub mod b64;
pub mod hexstr;
pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
