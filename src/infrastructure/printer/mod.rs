//! Printer Module
//!
//! Connection management for receipt and label printers over classic
//! Bluetooth, BLE and USB.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    PrinterService                        │
//! │  (single task: state machine, reconnect timer, scans)    │
//! └─────────────────────┬───────────────────────────────────┘
//!          ▲            │ open / write / close
//!  signals │            ▼
//!          │  ┌─────────────────┬─────────────────┐
//!          │  │                 │                 │
//!  ┌───────┴──────┐  ┌──────────┴─────┐  ┌────────┴───────┐
//!  │   Classic    │  │      BLE       │  │      USB       │
//!  │ - connect    │  │ - GATT events  │  │ - permission   │
//!  │   thread     │  │ - FrameBuffer  │  │ - bulk OUT     │
//!  │ - read loop  │  │ - no-response  │  │ - Chunked      │
//!  │              │  │   writes       │  │   Writer       │
//!  └──────────────┘  └────────────────┘  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`service`] - Command handling and the connection state machine
//! - [`transport`] - The `Transport` trait and attempt-scoped signals
//! - [`classic`], [`ble`], [`usb`] - Concrete transports
//! - [`framing`] - Terminator-based frame reassembly
//! - [`chunking`] - Packet-size splitting for bulk transfers
//! - [`scanner`] - Scan result registry and timed BLE scans
//! - [`reconnect`] - Jittered reconnect timer

pub mod ble;
pub mod chunking;
pub mod classic;
pub mod framing;
pub mod reconnect;
pub mod scanner;
pub mod service;
pub mod transport;
pub mod usb;

pub use service::{PrinterHandle, PrinterService};
