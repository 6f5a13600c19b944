//! USB host through libusb (rusb).
//!
//! There is no permission broker on desktop systems: access is granted when
//! the device node can be opened. Detach is noticed by re-enumerating.

use crate::domain::error::{LinkError, Result};
use crate::domain::models::UsbDeviceInfo;
use crate::infrastructure::platform::{
    Direction, EndpointInfo, TransferType, UsbConnection, UsbHost, UsbHostEvent, UsbInterfaceInfo,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DETACH_POLL: Duration = Duration::from_secs(1);

fn usb_error(e: rusb::Error) -> LinkError {
    match e {
        rusb::Error::Access => LinkError::PermissionDenied(e.to_string()),
        rusb::Error::NoDevice | rusb::Error::NotFound => LinkError::DeviceNotFound(e.to_string()),
        _ => LinkError::IoFailure(e.to_string()),
    }
}

fn device_id(device: &Device<Context>) -> u32 {
    ((device.bus_number() as u32) << 8) | device.address() as u32
}

fn describe(device: &Device<Context>) -> Option<UsbDeviceInfo> {
    let descriptor = device.device_descriptor().ok()?;
    let (manufacturer, product) = match device.open() {
        Ok(handle) => (
            handle.read_manufacturer_string_ascii(&descriptor).ok(),
            handle.read_product_string_ascii(&descriptor).ok(),
        ),
        Err(_) => (None, None),
    };
    Some(UsbDeviceInfo {
        name: format!(
            "/dev/bus/usb/{:03}/{:03}",
            device.bus_number(),
            device.address()
        ),
        manufacturer,
        product,
        device_id: device_id(device),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
    })
}

pub struct LibUsbHost {
    context: Context,
}

impl LibUsbHost {
    pub fn new() -> Result<Self> {
        let context = Context::new().map_err(usb_error)?;
        Ok(Self { context })
    }

    fn find(&self, id: u32) -> Result<Device<Context>> {
        find_device(&self.context, id)?
            .ok_or_else(|| LinkError::DeviceNotFound(format!("USB device {:#06x}", id)))
    }
}

fn find_device(context: &Context, id: u32) -> Result<Option<Device<Context>>> {
    let devices = context.devices().map_err(usb_error)?;
    Ok(devices.iter().find(|d| device_id(d) == id))
}

fn watch_device(
    context: Context,
    device: Device<Context>,
    info: UsbDeviceInfo,
    sink: mpsc::UnboundedSender<UsbHostEvent>,
) {
    let granted = match device.open() {
        Ok(_) => sink.send(UsbHostEvent::PermissionGranted(info.clone())).is_ok(),
        Err(rusb::Error::Access) => {
            let _ = sink.send(UsbHostEvent::PermissionDenied(info.clone()));
            false
        }
        Err(e) => {
            warn!("Opening {} failed: {}", info.name, e);
            let _ = sink.send(UsbHostEvent::PermissionDenied(info.clone()));
            false
        }
    };
    if !granted {
        return;
    }

    while !sink.is_closed() {
        thread::sleep(DETACH_POLL);
        match find_device(&context, info.device_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                info!("{} detached", info.name);
                let _ = sink.send(UsbHostEvent::Detached(info.device_id));
                return;
            }
            Err(e) => debug!("USB re-enumeration failed: {}", e),
        }
    }
}

impl UsbHost for LibUsbHost {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        let devices = self.context.devices().map_err(usb_error)?;
        Ok(devices.iter().filter_map(|d| describe(&d)).collect())
    }

    fn describe_interface(&self, device: &UsbDeviceInfo, index: u8) -> Option<UsbInterfaceInfo> {
        let device = self.find(device.device_id).ok()?;
        let config = device.active_config_descriptor().ok()?;
        let interface = config.interfaces().nth(index as usize)?;
        let descriptor = interface.descriptors().next()?;
        let endpoints = descriptor
            .endpoint_descriptors()
            .map(|e| EndpointInfo {
                address: e.address(),
                transfer: match e.transfer_type() {
                    rusb::TransferType::Control => TransferType::Control,
                    rusb::TransferType::Isochronous => TransferType::Isochronous,
                    rusb::TransferType::Bulk => TransferType::Bulk,
                    rusb::TransferType::Interrupt => TransferType::Interrupt,
                },
                direction: match e.direction() {
                    rusb::Direction::In => Direction::In,
                    rusb::Direction::Out => Direction::Out,
                },
                max_packet_size: e.max_packet_size(),
            })
            .collect();
        Some(UsbInterfaceInfo {
            number: interface.number(),
            endpoints,
        })
    }

    fn request_permission(&self, device: &UsbDeviceInfo, sink: mpsc::UnboundedSender<UsbHostEvent>) {
        let found = match self.find(device.device_id) {
            Ok(found) => found,
            Err(e) => {
                warn!("{}: {}", device.name, e);
                let _ = sink.send(UsbHostEvent::Detached(device.device_id));
                return;
            }
        };
        let context = self.context.clone();
        let info = device.clone();
        let spawned = thread::Builder::new()
            .name("usb-permission".to_string())
            .spawn(move || watch_device(context, found, info, sink));
        if let Err(e) = spawned {
            warn!("Could not start USB watcher: {}", e);
        }
    }

    fn open(&self, device: &UsbDeviceInfo) -> Result<Box<dyn UsbConnection>> {
        let handle = self.find(device.device_id)?.open().map_err(usb_error)?;
        Ok(Box::new(LibUsbConnection { handle }))
    }
}

struct LibUsbConnection {
    handle: DeviceHandle<Context>,
}

impl UsbConnection for LibUsbConnection {
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<()> {
        if force {
            if let Err(e) = self.handle.set_auto_detach_kernel_driver(true) {
                debug!("Kernel driver auto-detach unavailable: {}", e);
            }
        }
        self.handle.claim_interface(interface).map_err(usb_error)
    }

    fn release_interface(&mut self, interface: u8) {
        if let Err(e) = self.handle.release_interface(interface) {
            debug!("Releasing interface {} failed: {}", interface, e);
        }
    }

    fn bulk_transfer(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(usb_error)
    }
}
