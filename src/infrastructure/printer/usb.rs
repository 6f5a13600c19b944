//! USB Transport
//!
//! Selecting a device asks the host for permission; the grant, a denial or a
//! later detach arrive asynchronously. The bulk OUT data path is opened lazily
//! on the first write and then owned by a writer thread, which performs the
//! transfers in call order. The service task never waits on a transfer.

use crate::domain::error::{LinkError, Result};
use crate::domain::models::{DeviceDescriptor, TransportKind, UsbDeviceInfo};
use crate::domain::settings::{FinalChunkPolicy, UsbSettings};
use crate::infrastructure::platform::{UsbConnection, UsbHost, UsbHostEvent};
use crate::infrastructure::printer::chunking::{BulkOut, ChunkedWriter};
use crate::infrastructure::printer::transport::{decode_base64, SignalSender, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct UsbSession {
    connection: Box<dyn UsbConnection>,
    interface: u8,
    endpoint: u8,
    max_packet_size: usize,
}

impl BulkOut for UsbSession {
    fn bulk_transfer(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.connection.bulk_transfer(self.endpoint, data, timeout)
    }
}

impl UsbSession {
    fn release(mut self) {
        self.connection.release_interface(self.interface);
        debug!("Released USB interface {}", self.interface);
    }
}

#[derive(Debug, Clone, Copy)]
enum Delivery {
    Chunked,
    Single,
}

struct WriteJob {
    payload: Vec<u8>,
    delivery: Delivery,
    signals: SignalSender,
}

/// Queue feeding the writer thread that owns an open [`UsbSession`].
struct DataPath {
    jobs: std_mpsc::Sender<WriteJob>,
    stopped: Arc<AtomicBool>,
}

impl DataPath {
    /// Returns at once. Queued jobs are dropped; a transfer already in flight
    /// completes before the writer releases the interface.
    fn stop(self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct UsbShared {
    /// Set once permission is granted.
    device: Option<UsbDeviceInfo>,
    data_path: Option<DataPath>,
}

impl UsbShared {
    fn reset(&mut self) {
        if let Some(path) = self.data_path.take() {
            path.stop();
        }
        self.device = None;
    }
}

type SharedState = Arc<Mutex<UsbShared>>;

fn lock(shared: &SharedState) -> MutexGuard<'_, UsbShared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct UsbTransport {
    host: Arc<dyn UsbHost>,
    settings: UsbSettings,
    shared: SharedState,
    watcher: Option<JoinHandle<()>>,
    signals: Option<SignalSender>,
}

impl UsbTransport {
    pub fn new(host: Arc<dyn UsbHost>, settings: UsbSettings) -> Self {
        Self {
            host,
            settings,
            shared: Arc::new(Mutex::new(UsbShared::default())),
            watcher: None,
            signals: None,
        }
    }

    /// Device currently held, once permission was granted.
    pub fn device(&self) -> Option<UsbDeviceInfo> {
        lock(&self.shared).device.clone()
    }

    fn dispatch(&mut self, payload: Vec<u8>, delivery: Delivery) -> Result<()> {
        let signals = self.signals.clone().ok_or(LinkError::NotConnected)?;
        let job = WriteJob {
            payload,
            delivery,
            signals,
        };

        let mut shared = lock(&self.shared);
        if shared.data_path.is_none() {
            let device = shared.device.clone().ok_or(LinkError::NotConnected)?;
            let session = open_data_path(self.host.as_ref(), &self.settings, &device)?;
            shared.data_path = Some(spawn_writer(
                session,
                self.settings.transfer_timeout(),
                self.settings.final_chunk,
            )?);
        }
        let queued = shared
            .data_path
            .as_ref()
            .is_some_and(|path| path.jobs.send(job).is_ok());
        if !queued {
            shared.data_path = None;
            return Err(LinkError::IoFailure("USB writer stopped".to_string()));
        }
        Ok(())
    }
}

/// Find the bulk OUT endpoint, open the device and claim its interface.
/// A connection opened here is dropped again if any later step fails.
fn open_data_path(
    host: &dyn UsbHost,
    settings: &UsbSettings,
    device: &UsbDeviceInfo,
) -> Result<UsbSession> {
    let interface = host
        .describe_interface(device, settings.interface_index)
        .ok_or(LinkError::NoEndpoint)?;
    let endpoint = *interface.first_bulk_out().ok_or(LinkError::NoEndpoint)?;

    let mut connection = host.open(device)?;
    if let Err(e) = connection.claim_interface(interface.number, true) {
        warn!("Claiming interface {} failed: {}", interface.number, e);
        drop(connection);
        return Err(e);
    }

    info!(
        "USB data path open: interface {} endpoint {:#04x} ({} byte packets)",
        interface.number, endpoint.address, endpoint.max_packet_size
    );
    Ok(UsbSession {
        connection,
        interface: interface.number,
        endpoint: endpoint.address,
        max_packet_size: endpoint.max_packet_size as usize,
    })
}

/// Move `session` onto its own thread. Transfers run there one at a time so
/// they reach the device in call order.
fn spawn_writer(
    mut session: UsbSession,
    timeout: Duration,
    policy: FinalChunkPolicy,
) -> Result<DataPath> {
    let (tx, rx) = std_mpsc::channel::<WriteJob>();
    let stopped = Arc::new(AtomicBool::new(false));
    let stop = Arc::clone(&stopped);
    thread::Builder::new()
        .name("usb-bulk-write".to_string())
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let result = match job.delivery {
                    Delivery::Chunked => ChunkedWriter::new(session.max_packet_size, policy, timeout)
                        .write(&mut session, &job.payload)
                        .map(|_| ()),
                    Delivery::Single => session.bulk_transfer(&job.payload, timeout).map(|_| ()),
                };
                match result {
                    Ok(()) => debug!(
                        "USB wrote {} bytes ({:?})",
                        job.payload.len(),
                        job.delivery
                    ),
                    Err(e) => {
                        warn!("USB transfer failed: {}", e);
                        job.signals.warn(format!("USB transfer failed: {}", e));
                    }
                }
            }
            session.release();
            debug!("USB writer stopped");
        })?;
    Ok(DataPath { jobs: tx, stopped })
}

async fn watch_permission(
    requested: UsbDeviceInfo,
    mut events: mpsc::UnboundedReceiver<UsbHostEvent>,
    shared: SharedState,
    signals: SignalSender,
) {
    while let Some(event) = events.recv().await {
        match event {
            UsbHostEvent::PermissionGranted(device) if device.device_id == requested.device_id => {
                info!("USB permission granted for {}", device.name);
                lock(&shared).device = Some(device);
                signals.connected();
            }
            UsbHostEvent::PermissionDenied(device) if device.device_id == requested.device_id => {
                warn!("USB permission denied for {}", device.name);
                signals.warn(format!("USB permission denied for {}", device.name));
                signals.closed(Some(LinkError::PermissionDenied(device.name)));
                break;
            }
            UsbHostEvent::Detached(device_id) if device_id == requested.device_id => {
                lock(&shared).reset();
                warn!("USB device {} detached", requested.name);
                signals.warn(format!("USB device {} detached", requested.name));
                signals.closed(Some(LinkError::DeviceNotFound(format!(
                    "{} detached",
                    requested.name
                ))));
                break;
            }
            other => debug!("Ignoring USB event for another device: {:?}", other),
        }
    }
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn open(&mut self, target: &DeviceDescriptor, signals: SignalSender) -> Result<()> {
        let (vendor_id, product_id) = target
            .usb_ids()
            .ok_or_else(|| LinkError::DeviceNotFound("no vendor/product id given".to_string()))?;
        self.close();

        let device = self
            .host
            .devices()?
            .into_iter()
            .find(|d| d.matches(vendor_id, product_id))
            .ok_or_else(|| {
                LinkError::DeviceNotFound(format!("{:04x}:{:04x}", vendor_id, product_id))
            })?;

        info!("Requesting USB permission for {}", device.name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.host.request_permission(&device, tx);
        self.watcher = Some(tokio::spawn(watch_permission(
            device,
            rx,
            Arc::clone(&self.shared),
            signals.clone(),
        )));
        self.signals = Some(signals);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.signals = None;
        let mut shared = lock(&self.shared);
        if shared.device.is_some() || shared.data_path.is_some() {
            debug!("Closing USB session");
        }
        shared.reset();
    }

    /// Chunked to the endpoint's packet size.
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.dispatch(data.to_vec(), Delivery::Chunked)
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.dispatch(text.as_bytes().to_vec(), Delivery::Single)
    }

    fn write_raw(&mut self, encoded: &str) -> Result<()> {
        let bytes = decode_base64(encoded)?;
        self.dispatch(bytes, Delivery::Single)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}
