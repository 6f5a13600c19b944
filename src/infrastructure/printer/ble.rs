//! BLE Transport
//!
//! The platform GATT stack owns the link; this transport reacts to its
//! callbacks. After the link comes up it discovers services, subscribes to
//! every characteristic and keeps the last one carrying a CCC descriptor as
//! the write target. Notifications are reassembled into frames.

use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::{DeviceDescriptor, TransportKind};
use crate::domain::settings::BleSettings;
use crate::infrastructure::platform::{
    BleCentral, GattCharacteristic, GattClient, GattEvent, GattLinkState, GattService, WriteType,
    CCCD_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::printer::framing::FrameBuffer;
use crate::infrastructure::printer::transport::{SignalSender, Transport};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type WriteTarget = Arc<Mutex<Option<GattCharacteristic>>>;

pub struct BleTransport {
    central: Arc<dyn BleCentral>,
    settings: BleSettings,
    client: Option<Arc<dyn GattClient>>,
    write_target: WriteTarget,
    controller: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(central: Arc<dyn BleCentral>, settings: BleSettings) -> Self {
        Self {
            central,
            settings,
            client: None,
            write_target: Arc::new(Mutex::new(None)),
            controller: None,
        }
    }

    /// Characteristic outbound writes currently go to.
    pub fn write_target(&self) -> Option<GattCharacteristic> {
        lock(&self.write_target).clone()
    }
}

fn lock(target: &WriteTarget) -> std::sync::MutexGuard<'_, Option<GattCharacteristic>> {
    target.lock().unwrap_or_else(|e| e.into_inner())
}

impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn open(&mut self, target: &DeviceDescriptor, signals: SignalSender) -> Result<()> {
        let address = BluetoothAddress::parse(&target.address)?;
        self.close();

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self
            .central
            .connect_gatt(&address, self.settings.gatt_auto_connect, tx)?;
        info!("GATT connect issued to {}", address);

        let name = self
            .central
            .remote_name(&address)
            .or_else(|| Some(target.name.clone()).filter(|n| !n.is_empty()))
            .unwrap_or_else(|| address.to_string());
        signals.device_name(name);

        let controller = GattController {
            client: Arc::clone(&client),
            signals,
            frames: FrameBuffer::new(self.settings.frame_terminator),
            write_target: Arc::clone(&self.write_target),
        };
        self.controller = Some(tokio::spawn(controller.run(rx)));
        self.client = Some(client);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.abort();
        }
        if let Some(client) = self.client.take() {
            debug!("Closing GATT session");
            client.disconnect();
        }
        lock(&self.write_target).take();
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let client = self.client.as_ref().ok_or(LinkError::NotConnected)?;
        let characteristic = self.write_target().ok_or(LinkError::NotConnected)?;
        client
            .write_characteristic(&characteristic, data, WriteType::WithoutResponse)
            .map_err(|e| {
                warn!("GATT write to {} failed: {}", characteristic.uuid, e);
                e
            })
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct GattController {
    client: Arc<dyn GattClient>,
    signals: SignalSender,
    frames: FrameBuffer,
    write_target: WriteTarget,
}

impl GattController {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<GattEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                GattEvent::ConnectionStateChanged(GattLinkState::Connected) => {
                    if self.signals.connected() {
                        info!("GATT link up, discovering services");
                        if let Err(e) = self.client.discover_services() {
                            warn!("Service discovery failed to start: {}", e);
                            self.signals.warn(format!("service discovery failed: {}", e));
                        }
                    }
                }
                GattEvent::ConnectionStateChanged(GattLinkState::Connecting) => {
                    debug!("GATT link connecting");
                }
                GattEvent::ConnectionStateChanged(GattLinkState::Disconnected) => {
                    lock(&self.write_target).take();
                    self.frames.clear();
                    let reason = LinkError::IoFailure("GATT link disconnected".to_string());
                    if !self.signals.failed(reason) {
                        warn!("GATT link lost");
                        self.signals.warn("connection lost");
                        self.signals
                            .closed(Some(LinkError::LinkLost("GATT link disconnected".into())));
                    }
                    break;
                }
                GattEvent::ServicesDiscovered(Ok(services)) => self.subscribe(&services),
                GattEvent::ServicesDiscovered(Err(e)) => {
                    warn!("Service discovery failed: {}", e);
                    self.signals.warn(format!("service discovery failed: {}", e));
                }
                GattEvent::CharacteristicChanged { value, .. } => {
                    for frame in self.frames.push(&value) {
                        self.signals.data(frame);
                    }
                }
                GattEvent::CharacteristicWritten {
                    characteristic,
                    status,
                } => match status {
                    Ok(()) => debug!("Write to {} acknowledged", characteristic),
                    Err(e) => warn!("Write to {} rejected: {}", characteristic, e),
                },
            }
        }
    }

    /// Enable notifications everywhere; the last characteristic with a CCC
    /// descriptor becomes the write target.
    fn subscribe(&self, services: &[GattService]) {
        for characteristic in services.iter().flat_map(|s| s.characteristics.iter()) {
            if let Err(e) = self.client.set_notification(characteristic, true) {
                debug!("Notifications not enabled on {}: {}", characteristic.uuid, e);
            }
            if !characteristic.has_cccd() {
                continue;
            }
            if let Err(e) =
                self.client
                    .write_descriptor(characteristic, CCCD_UUID, &ENABLE_NOTIFICATION_VALUE)
            {
                warn!("CCCD write on {} failed: {}", characteristic.uuid, e);
                continue;
            }
            debug!("Subscribed to {}", characteristic.uuid);
            *lock(&self.write_target) = Some(characteristic.clone());
        }

        match lock(&self.write_target).as_ref() {
            Some(c) => info!("Write target is {} (service {})", c.uuid, c.service),
            None => warn!("No notifiable characteristic found; writes will fail"),
        }
    }
}
