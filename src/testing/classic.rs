use super::lock;
use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::infrastructure::platform::{BondedDevice, ClassicAdapter, RfcommChannel};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

fn normalize(address: &str) -> String {
    BluetoothAddress::parse(address)
        .map(|a| a.to_string())
        .unwrap_or_else(|_| address.to_string())
}

#[derive(Default)]
struct ClassicState {
    bonded: Vec<BondedDevice>,
    bonded_error: Option<LinkError>,
    names: HashMap<String, String>,
    connect_failures: VecDeque<LinkError>,
    persistent_failure: Option<LinkError>,
    channels: Vec<Arc<MockRfcomm>>,
    discovery_cancels: usize,
}

/// Classic adapter whose sockets connect (or fail) as scripted.
#[derive(Default)]
pub struct MockClassicAdapter {
    state: Mutex<ClassicState>,
}

impl MockClassicAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bonded(&self, address: &str, name: Option<&str>) {
        lock(&self.state).bonded.push(BondedDevice {
            address: address.to_string(),
            name: name.map(str::to_string),
        });
    }

    pub fn fail_bonded(&self, error: LinkError) {
        lock(&self.state).bonded_error = Some(error);
    }

    pub fn set_remote_name(&self, address: &str, name: &str) {
        lock(&self.state)
            .names
            .insert(normalize(address), name.to_string());
    }

    /// The next channel created will fail to connect with `error`.
    pub fn fail_next_connect(&self, error: LinkError) {
        lock(&self.state).connect_failures.push_back(error);
    }

    /// Every channel created from now on fails to connect, until cleared with `None`.
    pub fn fail_all_connects(&self, error: Option<LinkError>) {
        lock(&self.state).persistent_failure = error;
    }

    pub fn channels_created(&self) -> usize {
        lock(&self.state).channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<Arc<MockRfcomm>> {
        lock(&self.state).channels.get(index).cloned()
    }

    pub fn last_channel(&self) -> Option<Arc<MockRfcomm>> {
        lock(&self.state).channels.last().cloned()
    }

    pub fn discovery_cancels(&self) -> usize {
        lock(&self.state).discovery_cancels
    }
}

impl ClassicAdapter for MockClassicAdapter {
    fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
        let state = lock(&self.state);
        match &state.bonded_error {
            Some(e) => Err(e.clone()),
            None => Ok(state.bonded.clone()),
        }
    }

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String> {
        lock(&self.state).names.get(&address.to_string()).cloned()
    }

    fn cancel_discovery(&self) {
        lock(&self.state).discovery_cancels += 1;
    }

    fn create_channel(&self, address: &BluetoothAddress) -> Result<Arc<dyn RfcommChannel>> {
        let mut state = lock(&self.state);
        let failure = state
            .connect_failures
            .pop_front()
            .or_else(|| state.persistent_failure.clone());
        let channel = Arc::new(MockRfcomm::new(address.to_string(), failure));
        state.channels.push(Arc::clone(&channel));
        Ok(channel)
    }
}

enum Inbound {
    Data(Vec<u8>),
    Lost,
}

/// RFCOMM stream backed by an in-memory queue.
pub struct MockRfcomm {
    address: String,
    connect_failure: Option<LinkError>,
    inbound_tx: Mutex<Sender<Inbound>>,
    inbound_rx: Mutex<Receiver<Inbound>>,
    leftover: Mutex<Vec<u8>>,
    written: Mutex<Vec<u8>>,
    write_failure: Mutex<Option<LinkError>>,
    connected: AtomicBool,
    shut_down: AtomicBool,
}

impl MockRfcomm {
    fn new(address: String, connect_failure: Option<LinkError>) -> Self {
        let (tx, rx) = channel();
        Self {
            address,
            connect_failure,
            inbound_tx: Mutex::new(tx),
            inbound_rx: Mutex::new(rx),
            leftover: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            write_failure: Mutex::new(None),
            connected: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Bytes the remote sends; one call is one read on the other side.
    pub fn push_inbound(&self, bytes: &[u8]) {
        let _ = lock(&self.inbound_tx).send(Inbound::Data(bytes.to_vec()));
    }

    /// Make the pending or next read fail as if the remote went away.
    pub fn drop_link(&self) {
        let _ = lock(&self.inbound_tx).send(Inbound::Lost);
    }

    pub fn fail_writes(&self, error: LinkError) {
        *lock(&self.write_failure) = Some(error);
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.written).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn closed_error() -> LinkError {
        LinkError::IoFailure("socket closed".to_string())
    }
}

impl RfcommChannel for MockRfcomm {
    fn connect(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Self::closed_error());
        }
        if let Some(e) = &self.connect_failure {
            return Err(e.clone());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut leftover = lock(&self.leftover);
            if !leftover.is_empty() {
                let n = leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&leftover[..n]);
                leftover.drain(..n);
                return Ok(n);
            }
        }
        if self.is_shut_down() {
            return Err(Self::closed_error());
        }

        let inbound = lock(&self.inbound_rx).recv();
        match inbound {
            Ok(Inbound::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                lock(&self.leftover).extend_from_slice(&data[n..]);
                Ok(n)
            }
            Ok(Inbound::Lost) | Err(_) => {
                Err(LinkError::IoFailure("connection reset by peer".to_string()))
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        if self.is_shut_down() {
            return Err(Self::closed_error());
        }
        if let Some(e) = lock(&self.write_failure).clone() {
            return Err(e);
        }
        lock(&self.written).extend_from_slice(data);
        Ok(())
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            let _ = lock(&self.inbound_tx).send(Inbound::Lost);
        }
    }
}
