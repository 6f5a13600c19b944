use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state reported to the host for one transport category.
///
/// `Failed` is transient: it is emitted once and the state collapses to `None`
/// right after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    None,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Numeric code pushed over the host event channels (0 idle, 1 connecting, 2 connected).
    pub fn event_code(&self) -> u8 {
        match self {
            Self::None | Self::Failed => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    ClassicBluetooth,
    Ble,
    Usb,
}

impl TransportKind {
    /// Event channel the state of this transport is reported on.
    pub fn channel(&self) -> StateChannel {
        match self {
            Self::ClassicBluetooth | Self::Ble => StateChannel::Bluetooth,
            Self::Usb => StateChannel::Usb,
        }
    }

    pub fn is_bluetooth(&self) -> bool {
        self.channel() == StateChannel::Bluetooth
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClassicBluetooth => "classic",
            Self::Ble => "ble",
            Self::Usb => "usb",
        };
        f.write_str(s)
    }
}

/// Bluetooth and USB state are pushed on separate host channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateChannel {
    Bluetooth,
    Usb,
}

/// Identity of a discoverable or connectable printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// MAC address for Bluetooth, device node path for USB.
    pub address: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceDescriptor {
    pub fn bluetooth(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            vendor_id: None,
            product_id: None,
        }
    }

    pub fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self {
            name: format!("{:04x}:{:04x}", vendor_id, product_id),
            address: String::new(),
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
        }
    }

    /// Vendor/product pair, present only for USB descriptors.
    pub fn usb_ids(&self) -> Option<(u16, u16)> {
        self.vendor_id.zip(self.product_id)
    }
}

/// Snapshot of an attached USB device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub name: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub device_id: u32,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id
    }
}

/// One BLE advertisement as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
}

/// Outbound payload variants accepted by `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    /// Base64-encoded raw bytes.
    Base64(String),
}

/// Notification pushed to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PrinterEvent {
    StateChanged {
        channel: StateChannel,
        state: ConnectionState,
    },
    DataReceived(Vec<u8>),
    ScanResult(DeviceDescriptor),
    ScanStarted,
    ScanStopped,
    DeviceName(String),
    Notice(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Warning,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Active transport and its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub kind: Option<TransportKind>,
    pub state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_channels() {
        assert_eq!(TransportKind::ClassicBluetooth.channel(), StateChannel::Bluetooth);
        assert_eq!(TransportKind::Ble.channel(), StateChannel::Bluetooth);
        assert_eq!(TransportKind::Usb.channel(), StateChannel::Usb);
    }

    #[test]
    fn test_event_codes() {
        assert_eq!(ConnectionState::None.event_code(), 0);
        assert_eq!(ConnectionState::Failed.event_code(), 0);
        assert_eq!(ConnectionState::Connecting.event_code(), 1);
        assert_eq!(ConnectionState::Connected.event_code(), 2);
    }

    #[test]
    fn test_usb_descriptor_ids() {
        let d = DeviceDescriptor::usb(0x0416, 0x5011);
        assert_eq!(d.usb_ids(), Some((0x0416, 0x5011)));
        assert_eq!(DeviceDescriptor::bluetooth("p", "00:11:22:33:44:55").usb_ids(), None);
    }
}
