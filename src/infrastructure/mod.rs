//! Infrastructure Layer
//!
//! Logging setup, the printer link service with its transports, and the
//! platform backends those transports drive.

pub mod logging;
pub mod platform;
pub mod printer;
