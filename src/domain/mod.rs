//! Domain Layer
//!
//! Transport-independent types: connection state, device identity, errors
//! and persisted settings.

pub mod address;
pub mod error;
pub mod models;
pub mod settings;
