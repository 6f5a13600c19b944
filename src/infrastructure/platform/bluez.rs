//! BLE central through BlueZ (bluer).
//!
//! Each GATT client owns one worker task that serializes requests against the
//! remote device, forwards notification streams and watches the device's
//! `Connected` property.

use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::Advertisement;
use crate::infrastructure::platform::{
    BleCentral, CharacteristicProperties, GattCharacteristic, GattClient, GattEvent,
    GattLinkState, GattService, WriteType, CCCD_UUID,
};
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{AdapterEvent, DeviceEvent, DeviceProperty};
use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECT_RETRIES: u32 = 3;
const RESOLVE_POLLS: u32 = 25;

fn link_error(e: bluer::Error) -> LinkError {
    match e.kind {
        bluer::ErrorKind::NotPermitted | bluer::ErrorKind::NotAuthorized => {
            LinkError::PermissionDenied(e.to_string())
        }
        bluer::ErrorKind::NotFound | bluer::ErrorKind::DoesNotExist => {
            LinkError::DeviceNotFound(e.to_string())
        }
        _ => LinkError::IoFailure(e.to_string()),
    }
}

fn to_bluer(address: &BluetoothAddress) -> bluer::Address {
    bluer::Address::new(address.octets())
}

type NameCache = Arc<Mutex<HashMap<String, String>>>;

pub struct BluezCentral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    names: NameCache,
    scan: Mutex<Option<JoinHandle<()>>>,
}

impl BluezCentral {
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await.map_err(link_error)?;
        let adapter = session.default_adapter().await.map_err(link_error)?;
        if !adapter.is_powered().await.map_err(link_error)? {
            adapter.set_powered(true).await.map_err(link_error)?;
        }
        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
            names: Arc::new(Mutex::new(HashMap::new())),
            scan: Mutex::new(None),
        })
    }
}

async fn run_discovery(
    adapter: bluer::Adapter,
    names: NameCache,
    sink: mpsc::UnboundedSender<Advertisement>,
) {
    let discover = match adapter.discover_devices().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("BLE discovery failed: {}", e);
            return;
        }
    };
    futures::pin_mut!(discover);

    while let Some(event) = discover.next().await {
        let AdapterEvent::DeviceAdded(addr) = event else {
            continue;
        };
        let name = match adapter.device(addr) {
            Ok(device) => device.name().await.ok().flatten(),
            Err(_) => None,
        };
        if let Some(name) = &name {
            names
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(addr.to_string(), name.clone());
        }
        let advertisement = Advertisement {
            address: addr.to_string(),
            name,
        };
        if sink.send(advertisement).is_err() {
            break;
        }
    }
}

impl BleCentral for BluezCentral {
    fn start_scan(&self, sink: mpsc::UnboundedSender<Advertisement>) -> Result<()> {
        let task = tokio::spawn(run_discovery(
            self.adapter.clone(),
            Arc::clone(&self.names),
            sink,
        ));
        if let Some(previous) = self
            .scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(task) = self.scan.lock().unwrap_or_else(|e| e.into_inner()).take() {
            // dropping the discovery stream ends the BlueZ discovery session
            task.abort();
        }
    }

    fn connect_gatt(
        &self,
        address: &BluetoothAddress,
        auto_connect: bool,
        events: mpsc::UnboundedSender<GattEvent>,
    ) -> Result<Arc<dyn GattClient>> {
        let device = self.adapter.device(to_bluer(address)).map_err(link_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = GattWorker {
            device,
            events,
            characteristics: HashMap::new(),
            notifications: SelectAll::new(),
        };
        tokio::spawn(worker.run(auto_connect, rx));
        Ok(Arc::new(BluezGattClient { requests: tx }))
    }

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String> {
        self.names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address.to_string())
            .cloned()
    }
}

#[derive(Debug)]
enum GattRequest {
    DiscoverServices,
    SetNotification {
        characteristic: Uuid,
        enable: bool,
    },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    Write {
        characteristic: Uuid,
        value: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect,
}

struct BluezGattClient {
    requests: mpsc::UnboundedSender<GattRequest>,
}

impl BluezGattClient {
    fn request(&self, request: GattRequest) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| LinkError::NotConnected)
    }
}

impl GattClient for BluezGattClient {
    fn discover_services(&self) -> Result<()> {
        self.request(GattRequest::DiscoverServices)
    }

    fn set_notification(&self, characteristic: &GattCharacteristic, enable: bool) -> Result<()> {
        self.request(GattRequest::SetNotification {
            characteristic: characteristic.uuid,
            enable,
        })
    }

    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.request(GattRequest::WriteDescriptor {
            characteristic: characteristic.uuid,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.request(GattRequest::Write {
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            write_type,
        })
    }

    fn disconnect(&self) {
        let _ = self.request(GattRequest::Disconnect);
    }
}

struct GattWorker {
    device: bluer::Device,
    events: mpsc::UnboundedSender<GattEvent>,
    characteristics: HashMap<Uuid, Characteristic>,
    notifications: SelectAll<BoxStream<'static, (Uuid, Vec<u8>)>>,
}

impl GattWorker {
    fn emit(&self, event: GattEvent) {
        let _ = self.events.send(event);
    }

    async fn connect(&self, auto_connect: bool) -> bluer::Result<()> {
        let attempts = if auto_connect { CONNECT_RETRIES } else { 1 };
        let mut attempt = 1;
        loop {
            if self.device.is_connected().await? {
                return Ok(());
            }
            match self.device.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!("GATT connect attempt {} failed: {}", attempt, e);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run(mut self, auto_connect: bool, mut requests: mpsc::UnboundedReceiver<GattRequest>) {
        self.emit(GattEvent::ConnectionStateChanged(GattLinkState::Connecting));
        if let Err(e) = self.connect(auto_connect).await {
            warn!("GATT connect to {} failed: {}", self.device.address(), e);
            self.emit(GattEvent::ConnectionStateChanged(GattLinkState::Disconnected));
            return;
        }

        let device_events = match self.device.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot watch {}: {}", self.device.address(), e);
                let _ = self.device.disconnect().await;
                self.emit(GattEvent::ConnectionStateChanged(GattLinkState::Disconnected));
                return;
            }
        };
        futures::pin_mut!(device_events);
        self.emit(GattEvent::ConnectionStateChanged(GattLinkState::Connected));

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(GattRequest::Disconnect) | None => {
                        debug!("Disconnecting {}", self.device.address());
                        let _ = self.device.disconnect().await;
                        break;
                    }
                    Some(request) => self.handle(request).await,
                },
                Some((characteristic, value)) = self.notifications.next(), if !self.notifications.is_empty() => {
                    self.emit(GattEvent::CharacteristicChanged { characteristic, value });
                }
                Some(event) = device_events.next() => {
                    if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                        info!("{} disconnected", self.device.address());
                        self.emit(GattEvent::ConnectionStateChanged(GattLinkState::Disconnected));
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, request: GattRequest) {
        match request {
            GattRequest::DiscoverServices => {
                let result = self.discover().await.map_err(link_error);
                self.emit(GattEvent::ServicesDiscovered(result));
            }
            GattRequest::SetNotification {
                characteristic,
                enable,
            } => {
                if !enable {
                    return;
                }
                let Some(remote) = self.characteristics.get(&characteristic) else {
                    return;
                };
                match remote.notify().await {
                    Ok(stream) => self
                        .notifications
                        .push(stream.map(move |value| (characteristic, value)).boxed()),
                    Err(e) => debug!("Notify on {} refused: {}", characteristic, e),
                }
            }
            GattRequest::WriteDescriptor {
                characteristic,
                descriptor,
                value,
            } => {
                if descriptor == CCCD_UUID {
                    // bluetoothd writes the CCCD itself when a notify session starts
                    debug!("CCCD on {} handled by notify session", characteristic);
                    return;
                }
                if let Err(e) = self.write_descriptor(characteristic, descriptor, &value).await {
                    warn!("Descriptor write {} failed: {}", descriptor, e);
                }
            }
            GattRequest::Write {
                characteristic,
                value,
                write_type,
            } => {
                let status = match self.characteristics.get(&characteristic) {
                    Some(remote) => {
                        let op_type = match write_type {
                            WriteType::WithResponse => WriteOp::Request,
                            WriteType::WithoutResponse => WriteOp::Command,
                        };
                        let request = CharacteristicWriteRequest {
                            op_type,
                            ..Default::default()
                        };
                        remote.write_ext(&value, &request).await.map_err(link_error)
                    }
                    None => Err(LinkError::NotConnected),
                };
                self.emit(GattEvent::CharacteristicWritten {
                    characteristic,
                    status,
                });
            }
            GattRequest::Disconnect => {}
        }
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bluer::Result<()> {
        let Some(remote) = self.characteristics.get(&characteristic) else {
            return Ok(());
        };
        for d in remote.descriptors().await? {
            if d.uuid().await? == descriptor {
                d.write(value).await?;
            }
        }
        Ok(())
    }

    async fn discover(&mut self) -> bluer::Result<Vec<GattService>> {
        for _ in 0..RESOLVE_POLLS {
            if self.device.is_services_resolved().await? {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let mut services = Vec::new();
        self.characteristics.clear();
        for service in self.device.services().await? {
            let service_uuid = service.uuid().await?;
            let mut characteristics = Vec::new();
            for remote in service.characteristics().await? {
                let uuid = remote.uuid().await?;
                let flags = remote.flags().await?;
                let mut descriptors = Vec::new();
                for d in remote.descriptors().await? {
                    descriptors.push(d.uuid().await?);
                }
                // bluetoothd does not export the CCCD over D-Bus
                if (flags.notify || flags.indicate) && !descriptors.contains(&CCCD_UUID) {
                    descriptors.push(CCCD_UUID);
                }
                characteristics.push(GattCharacteristic {
                    service: service_uuid,
                    uuid,
                    properties: CharacteristicProperties {
                        write: flags.write,
                        write_without_response: flags.write_without_response,
                        notify: flags.notify,
                        indicate: flags.indicate,
                    },
                    descriptors,
                });
                self.characteristics.insert(uuid, remote);
            }
            services.push(GattService {
                uuid: service_uuid,
                characteristics,
            });
        }
        info!(
            "Resolved {} services on {}",
            services.len(),
            self.device.address()
        );
        Ok(services)
    }
}
