//! Platform Module
//!
//! Device-access backends behind small traits, bundled into a
//! [`PlatformContext`] that is built once and handed to the printer service.
//!
//! ## Backends
//!
//! - [`rfcomm`] - classic Bluetooth sockets and BlueZ bond storage (Linux)
//! - `bluez` - BLE scanning and GATT through BlueZ (feature `bluez`)
//! - `libusb` - USB bulk printers through libusb (feature `usb`)
//!
//! GATT callbacks and USB permission results are delivered as typed messages
//! on channels supplied by the caller.

#[cfg(all(target_os = "linux", feature = "bluez"))]
pub mod bluez;
#[cfg(feature = "usb")]
pub mod libusb;
#[cfg(target_os = "linux")]
pub mod rfcomm;

use crate::domain::address::BluetoothAddress;
use crate::domain::error::Result;
use crate::domain::models::{Advertisement, UsbDeviceInfo};
use crate::domain::settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Client Characteristic Configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// CCCD value that turns notifications on.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// A device the local adapter is already bonded with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondedDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Classic Bluetooth adapter.
pub trait ClassicAdapter: Send + Sync {
    fn bonded_devices(&self) -> Result<Vec<BondedDevice>>;

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String>;

    /// Inquiry slows down RFCOMM connects on most stacks.
    fn cancel_discovery(&self);

    /// Create an unconnected serial channel to `address`.
    fn create_channel(&self, address: &BluetoothAddress) -> Result<Arc<dyn RfcommChannel>>;
}

/// Blocking RFCOMM stream.
///
/// `shutdown` may be called from any thread and must make a blocked
/// `connect` or `read` return an error.
pub trait RfcommChannel: Send + Sync {
    fn connect(&self) -> Result<()>;
    fn read(&self, buf: &mut [u8]) -> Result<usize>;
    fn write_all(&self, data: &[u8]) -> Result<()>;
    fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattLinkState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn has_cccd(&self) -> bool {
        self.descriptors.contains(&CCCD_UUID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Asynchronous GATT callback, one message per platform callback.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    ConnectionStateChanged(GattLinkState),
    ServicesDiscovered(Result<Vec<GattService>>),
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
    CharacteristicWritten { characteristic: Uuid, status: Result<()> },
}

pub trait BleCentral: Send + Sync {
    fn start_scan(&self, sink: mpsc::UnboundedSender<Advertisement>) -> Result<()>;
    fn stop_scan(&self);

    /// Start a GATT connection; progress arrives on `events`.
    fn connect_gatt(
        &self,
        address: &BluetoothAddress,
        auto_connect: bool,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Arc<dyn GattClient>>;

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String>;
}

/// GATT operations. Calls enqueue work; results come back as [`GattEvent`]s.
pub trait GattClient: Send + Sync {
    fn discover_services(&self) -> Result<()>;
    fn set_notification(&self, characteristic: &GattCharacteristic, enable: bool) -> Result<()>;
    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;
    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
    fn disconnect(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub transfer: TransferType,
    pub direction: Direction,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbInterfaceInfo {
    pub number: u8,
    pub endpoints: Vec<EndpointInfo>,
}

impl UsbInterfaceInfo {
    pub fn first_bulk_out(&self) -> Option<&EndpointInfo> {
        self.endpoints
            .iter()
            .find(|e| e.transfer == TransferType::Bulk && e.direction == Direction::Out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbHostEvent {
    PermissionGranted(UsbDeviceInfo),
    PermissionDenied(UsbDeviceInfo),
    Detached(u32),
}

pub trait UsbHost: Send + Sync {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Interface at position `index` of the active configuration.
    fn describe_interface(&self, device: &UsbDeviceInfo, index: u8) -> Option<UsbInterfaceInfo>;

    /// The answer, and any later detach of `device`, is sent to `sink`.
    fn request_permission(&self, device: &UsbDeviceInfo, sink: mpsc::UnboundedSender<UsbHostEvent>);

    fn open(&self, device: &UsbDeviceInfo) -> Result<Box<dyn UsbConnection>>;
}

/// Open USB device handle. Dropping it closes the device.
pub trait UsbConnection: Send {
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<()>;
    fn release_interface(&mut self, interface: u8);
    fn bulk_transfer(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;
}

/// Device access shared by every transport. Missing backends leave the
/// matching transport unavailable.
#[derive(Clone, Default)]
pub struct PlatformContext {
    pub classic: Option<Arc<dyn ClassicAdapter>>,
    pub ble: Option<Arc<dyn BleCentral>>,
    pub usb: Option<Arc<dyn UsbHost>>,
}

impl PlatformContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classic(mut self, adapter: Arc<dyn ClassicAdapter>) -> Self {
        self.classic = Some(adapter);
        self
    }

    pub fn with_ble(mut self, central: Arc<dyn BleCentral>) -> Self {
        self.ble = Some(central);
        self
    }

    pub fn with_usb(mut self, host: Arc<dyn UsbHost>) -> Self {
        self.usb = Some(host);
        self
    }

    /// Build every backend compiled into this binary that can be opened.
    #[allow(unused_variables, unused_mut)]
    pub async fn detect(settings: &Settings) -> Self {
        let mut context = Self::new();

        #[cfg(target_os = "linux")]
        {
            match rfcomm::LinuxClassicAdapter::open(settings.classic.rfcomm_channel) {
                Ok(adapter) => context.classic = Some(Arc::new(adapter)),
                Err(e) => tracing::warn!("Classic Bluetooth unavailable: {}", e),
            }
        }

        #[cfg(all(target_os = "linux", feature = "bluez"))]
        {
            match bluez::BluezCentral::new().await {
                Ok(central) => context.ble = Some(Arc::new(central)),
                Err(e) => tracing::warn!("BLE unavailable: {}", e),
            }
        }

        #[cfg(feature = "usb")]
        {
            match libusb::LibUsbHost::new() {
                Ok(host) => context.usb = Some(Arc::new(host)),
                Err(e) => tracing::warn!("USB unavailable: {}", e),
            }
        }

        tracing::info!(
            "Platform backends: classic={} ble={} usb={}",
            context.classic.is_some(),
            context.ble.is_some(),
            context.usb.is_some()
        );
        context
    }
}
