//! Printer Link
//!
//! Connection manager for receipt and label printers reachable over classic
//! Bluetooth (RFCOMM), Bluetooth Low Energy (GATT) or USB (bulk transfers).
//!
//! A [`PrinterService`] runs as a single tokio task. Hosts talk to it through a
//! cloneable [`PrinterHandle`] and receive [`PrinterEvent`]s on a channel they
//! provide.
//!
//! ```no_run
//! use printer_link::{DeviceDescriptor, PlatformContext, PrinterService, Settings, TransportKind};
//!
//! # async fn run() -> printer_link::Result<()> {
//! let settings = Settings::default();
//! let platform = PlatformContext::detect(&settings).await;
//! let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let printer = PrinterService::new(platform, settings, tx).spawn();
//!
//! printer
//!     .connect(
//!         DeviceDescriptor::bluetooth("RPP02N", "66:22:B5:0C:3F:01"),
//!         TransportKind::ClassicBluetooth,
//!         true,
//!     )
//!     .await?;
//! printer.send_text("Hello\n").await;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod domain;
pub mod infrastructure;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use domain::error::{LinkError, Result};
pub use domain::models::{
    ConnectionState, DeviceDescriptor, LinkStatus, Payload, PrinterEvent, StateChannel,
    StatusMessage, TransportKind, UsbDeviceInfo,
};
pub use domain::settings::{Settings, SettingsService};
pub use infrastructure::platform::PlatformContext;
pub use infrastructure::printer::{PrinterHandle, PrinterService};
