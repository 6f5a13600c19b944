use super::{lock, wait_until};
use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::Advertisement;
use crate::infrastructure::platform::{
    BleCentral, CharacteristicProperties, GattCharacteristic, GattClient, GattEvent,
    GattLinkState, GattService, WriteType, CCCD_UUID,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// A characteristic that notifies, accepts unacknowledged writes and carries a CCCD.
pub fn notifiable_characteristic(service: Uuid, uuid: Uuid) -> GattCharacteristic {
    GattCharacteristic {
        service,
        uuid,
        properties: CharacteristicProperties {
            write: false,
            write_without_response: true,
            notify: true,
            indicate: false,
        },
        descriptors: vec![CCCD_UUID],
    }
}

/// One call made on a [`MockGattClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
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

struct BleState {
    /// Link state reported right after `connect_gatt`; `None` never answers.
    answer: Option<GattLinkState>,
    services: Vec<GattService>,
    scan_sink: Option<UnboundedSender<Advertisement>>,
    scan_error: Option<LinkError>,
    connect_error: Option<LinkError>,
    scan_starts: usize,
    scan_stops: usize,
    names: HashMap<String, String>,
    clients: Vec<Arc<MockGattClient>>,
}

/// BLE central that accepts (or refuses) every GATT connection.
pub struct MockBleCentral {
    state: Mutex<BleState>,
}

impl MockBleCentral {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BleState {
                answer: Some(GattLinkState::Connected),
                services: Vec::new(),
                scan_sink: None,
                scan_error: None,
                connect_error: None,
                scan_starts: 0,
                scan_stops: 0,
                names: HashMap::new(),
                clients: Vec::new(),
            }),
        })
    }

    /// Services reported by clients created after this call.
    pub fn set_services(&self, services: Vec<GattService>) {
        lock(&self.state).services = services;
    }

    /// Links go straight to disconnected instead of connected.
    pub fn refuse_connections(&self) {
        lock(&self.state).answer = Some(GattLinkState::Disconnected);
    }

    /// Links stay pending until the test emits a state change itself.
    pub fn stall_connections(&self) {
        lock(&self.state).answer = None;
    }

    pub fn fail_gatt_connect(&self, error: LinkError) {
        lock(&self.state).connect_error = Some(error);
    }

    pub fn fail_scan(&self, error: LinkError) {
        lock(&self.state).scan_error = Some(error);
    }

    pub fn set_remote_name(&self, address: &str, name: &str) {
        lock(&self.state)
            .names
            .insert(address.to_uppercase(), name.to_string());
    }

    /// Deliver an advertisement to the running scan. False when no scan is running.
    pub fn advertise(&self, address: &str, name: Option<&str>) -> bool {
        let state = lock(&self.state);
        let Some(sink) = &state.scan_sink else {
            return false;
        };
        sink.send(Advertisement {
            address: address.to_string(),
            name: name.map(str::to_string),
        })
        .is_ok()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scan_sink.is_some()
    }

    pub fn scan_starts(&self) -> usize {
        lock(&self.state).scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        lock(&self.state).scan_stops
    }

    pub fn gatt_connects(&self) -> usize {
        lock(&self.state).clients.len()
    }

    pub fn last_client(&self) -> Option<Arc<MockGattClient>> {
        lock(&self.state).clients.last().cloned()
    }
}

impl BleCentral for MockBleCentral {
    fn start_scan(&self, sink: UnboundedSender<Advertisement>) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(e) = &state.scan_error {
            return Err(e.clone());
        }
        state.scan_sink = Some(sink);
        state.scan_starts += 1;
        Ok(())
    }

    fn stop_scan(&self) {
        let mut state = lock(&self.state);
        state.scan_sink = None;
        state.scan_stops += 1;
    }

    fn connect_gatt(
        &self,
        address: &BluetoothAddress,
        _auto_connect: bool,
        events: UnboundedSender<GattEvent>,
    ) -> Result<Arc<dyn GattClient>> {
        let mut state = lock(&self.state);
        if let Some(e) = &state.connect_error {
            return Err(e.clone());
        }
        let client = Arc::new(MockGattClient {
            address: address.to_string(),
            events,
            services: state.services.clone(),
            ops: Mutex::new(Vec::new()),
            write_failure: Mutex::new(None),
        });
        if let Some(link) = state.answer {
            client.emit(GattEvent::ConnectionStateChanged(link));
        }
        state.clients.push(Arc::clone(&client));
        Ok(client)
    }

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String> {
        lock(&self.state).names.get(&address.to_string()).cloned()
    }
}

/// GATT client that records every operation and answers discovery immediately.
pub struct MockGattClient {
    address: String,
    events: UnboundedSender<GattEvent>,
    services: Vec<GattService>,
    ops: Mutex<Vec<GattOp>>,
    write_failure: Mutex<Option<LinkError>>,
}

impl MockGattClient {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Play a platform callback. False once the transport stopped listening.
    pub fn emit(&self, event: GattEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> bool {
        self.emit(GattEvent::CharacteristicChanged {
            characteristic,
            value: value.to_vec(),
        })
    }

    pub fn fail_writes(&self, error: LinkError) {
        *lock(&self.write_failure) = Some(error);
    }

    pub fn ops(&self) -> Vec<GattOp> {
        lock(&self.ops).clone()
    }

    /// Payloads of characteristic writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.ops)
            .iter()
            .filter_map(|op| match op {
                GattOp::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_ops(&self, count: usize) {
        wait_until(|| lock(&self.ops).len() >= count).await
    }

    fn record(&self, op: GattOp) {
        lock(&self.ops).push(op);
    }
}

impl GattClient for MockGattClient {
    fn discover_services(&self) -> Result<()> {
        self.record(GattOp::DiscoverServices);
        self.emit(GattEvent::ServicesDiscovered(Ok(self.services.clone())));
        Ok(())
    }

    fn set_notification(&self, characteristic: &GattCharacteristic, enable: bool) -> Result<()> {
        self.record(GattOp::SetNotification {
            characteristic: characteristic.uuid,
            enable,
        });
        Ok(())
    }

    fn write_descriptor(
        &self,
        characteristic: &GattCharacteristic,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(GattOp::WriteDescriptor {
            characteristic: characteristic.uuid,
            descriptor,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        characteristic: &GattCharacteristic,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        if let Some(e) = lock(&self.write_failure).clone() {
            return Err(e);
        }
        self.record(GattOp::Write {
            characteristic: characteristic.uuid,
            value: value.to_vec(),
            write_type,
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.record(GattOp::Disconnect);
    }
}
