use super::lock;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::UsbDeviceInfo;
use crate::infrastructure::platform::{
    Direction, EndpointInfo, TransferType, UsbConnection, UsbHost, UsbHostEvent, UsbInterfaceInfo,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub fn usb_printer(device_id: u32, vendor_id: u16, product_id: u16) -> UsbDeviceInfo {
    UsbDeviceInfo {
        name: format!("/dev/bus/usb/001/{:03}", device_id % 1000),
        manufacturer: Some("Printer Co".to_string()),
        product: Some("Thermal Printer".to_string()),
        device_id,
        vendor_id,
        product_id,
    }
}

/// Interface 0 with a bulk IN (0x81) and a bulk OUT (0x01) endpoint.
pub fn bulk_interface(max_packet_size: u16) -> UsbInterfaceInfo {
    UsbInterfaceInfo {
        number: 0,
        endpoints: vec![
            EndpointInfo {
                address: 0x81,
                transfer: TransferType::Bulk,
                direction: Direction::In,
                max_packet_size,
            },
            EndpointInfo {
                address: 0x01,
                transfer: TransferType::Bulk,
                direction: Direction::Out,
                max_packet_size,
            },
        ],
    }
}

#[derive(Default)]
struct UsbLog {
    transfers: Vec<Vec<u8>>,
    claims: Vec<(u8, bool)>,
    releases: Vec<u8>,
    closed: usize,
    claim_error: Option<LinkError>,
    transfer_error: Option<LinkError>,
    transfer_delay: Duration,
    started: usize,
}

#[derive(Default)]
struct HostState {
    devices: Vec<(UsbDeviceInfo, UsbInterfaceInfo)>,
    sinks: Vec<(u32, UnboundedSender<UsbHostEvent>)>,
    permission_requests: usize,
    opens: usize,
    open_error: Option<LinkError>,
    enumerate_error: Option<LinkError>,
}

/// USB host whose permission answers and detaches are driven by the test.
#[derive(Default)]
pub struct MockUsbHost {
    state: Mutex<HostState>,
    log: Arc<Mutex<UsbLog>>,
}

impl MockUsbHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, device: UsbDeviceInfo, interface: UsbInterfaceInfo) {
        lock(&self.state).devices.push((device, interface));
    }

    /// Answer pending permission requests for `device_id` with a grant.
    pub fn grant(&self, device_id: u32) -> bool {
        self.answer(device_id, UsbHostEvent::PermissionGranted)
    }

    pub fn deny(&self, device_id: u32) -> bool {
        self.answer(device_id, UsbHostEvent::PermissionDenied)
    }

    fn answer(&self, device_id: u32, event: fn(UsbDeviceInfo) -> UsbHostEvent) -> bool {
        let state = lock(&self.state);
        let Some((device, _)) = state.devices.iter().find(|(d, _)| d.device_id == device_id) else {
            return false;
        };
        let mut delivered = false;
        for (_, sink) in state.sinks.iter().filter(|(id, _)| *id == device_id) {
            delivered |= sink.send(event(device.clone())).is_ok();
        }
        delivered
    }

    /// Unplug the device and tell everyone who asked about it.
    pub fn detach(&self, device_id: u32) {
        let mut state = lock(&self.state);
        state.devices.retain(|(d, _)| d.device_id != device_id);
        for (_, sink) in state.sinks.iter().filter(|(id, _)| *id == device_id) {
            let _ = sink.send(UsbHostEvent::Detached(device_id));
        }
    }

    pub fn fail_open(&self, error: LinkError) {
        lock(&self.state).open_error = Some(error);
    }

    pub fn fail_enumeration(&self, error: LinkError) {
        lock(&self.state).enumerate_error = Some(error);
    }

    pub fn fail_claims(&self, error: LinkError) {
        lock(&self.log).claim_error = Some(error);
    }

    pub fn fail_transfers(&self, error: LinkError) {
        lock(&self.log).transfer_error = Some(error);
    }

    /// Every bulk transfer blocks for `delay` before it completes.
    pub fn delay_transfers(&self, delay: Duration) {
        lock(&self.log).transfer_delay = delay;
    }

    pub fn permission_requests(&self) -> usize {
        lock(&self.state).permission_requests
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Transfers entered, including ones still in flight.
    pub fn transfers_started(&self) -> usize {
        lock(&self.log).started
    }

    pub fn transfers(&self) -> Vec<Vec<u8>> {
        lock(&self.log).transfers.clone()
    }

    pub fn claims(&self) -> Vec<(u8, bool)> {
        lock(&self.log).claims.clone()
    }

    pub fn releases(&self) -> Vec<u8> {
        lock(&self.log).releases.clone()
    }

    pub fn connections_closed(&self) -> usize {
        lock(&self.log).closed
    }
}

impl UsbHost for MockUsbHost {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        let state = lock(&self.state);
        if let Some(e) = &state.enumerate_error {
            return Err(e.clone());
        }
        Ok(state.devices.iter().map(|(d, _)| d.clone()).collect())
    }

    fn describe_interface(&self, device: &UsbDeviceInfo, index: u8) -> Option<UsbInterfaceInfo> {
        if index != 0 {
            return None;
        }
        lock(&self.state)
            .devices
            .iter()
            .find(|(d, _)| d.device_id == device.device_id)
            .map(|(_, interface)| interface.clone())
    }

    fn request_permission(&self, device: &UsbDeviceInfo, sink: UnboundedSender<UsbHostEvent>) {
        let mut state = lock(&self.state);
        state.permission_requests += 1;
        state.sinks.push((device.device_id, sink));
    }

    fn open(&self, device: &UsbDeviceInfo) -> Result<Box<dyn UsbConnection>> {
        let mut state = lock(&self.state);
        state.opens += 1;
        if let Some(e) = &state.open_error {
            return Err(e.clone());
        }
        if !state.devices.iter().any(|(d, _)| d.device_id == device.device_id) {
            return Err(LinkError::DeviceNotFound(device.name.clone()));
        }
        Ok(Box::new(MockUsbConnection {
            log: Arc::clone(&self.log),
        }))
    }
}

struct MockUsbConnection {
    log: Arc<Mutex<UsbLog>>,
}

impl UsbConnection for MockUsbConnection {
    fn claim_interface(&mut self, interface: u8, force: bool) -> Result<()> {
        let mut log = lock(&self.log);
        log.claims.push((interface, force));
        match &log.claim_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn release_interface(&mut self, interface: u8) {
        lock(&self.log).releases.push(interface);
    }

    fn bulk_transfer(&mut self, _endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
        let delay = {
            let mut log = lock(&self.log);
            log.started += 1;
            log.transfer_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut log = lock(&self.log);
        if let Some(e) = &log.transfer_error {
            return Err(e.clone());
        }
        log.transfers.push(data.to_vec());
        Ok(data.len())
    }
}

impl Drop for MockUsbConnection {
    fn drop(&mut self) {
        lock(&self.log).closed += 1;
    }
}
