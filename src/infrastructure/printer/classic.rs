//! Classic Bluetooth Transport
//!
//! One worker thread performs the blocking RFCOMM connect, a second one reads
//! the stream. Inbound bytes are passed through unframed, one data signal per
//! read.

use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::{DeviceDescriptor, TransportKind};
use crate::domain::settings::ClassicSettings;
use crate::infrastructure::platform::{ClassicAdapter, RfcommChannel};
use crate::infrastructure::printer::transport::{SignalSender, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

struct ClassicLink {
    channel: Arc<dyn RfcommChannel>,
    cancelled: Arc<AtomicBool>,
}

pub struct ClassicTransport {
    adapter: Arc<dyn ClassicAdapter>,
    settings: ClassicSettings,
    link: Option<ClassicLink>,
}

impl ClassicTransport {
    pub fn new(adapter: Arc<dyn ClassicAdapter>, settings: ClassicSettings) -> Self {
        Self {
            adapter,
            settings,
            link: None,
        }
    }
}

impl Transport for ClassicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ClassicBluetooth
    }

    fn open(&mut self, target: &DeviceDescriptor, signals: SignalSender) -> Result<()> {
        let address = BluetoothAddress::parse(&target.address)?;
        self.close();

        let channel = self.adapter.create_channel(&address)?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let fallback_name = if target.name.is_empty() {
            address.to_string()
        } else {
            target.name.clone()
        };

        let worker = ConnectWorker {
            adapter: Arc::clone(&self.adapter),
            channel: Arc::clone(&channel),
            cancelled: Arc::clone(&cancelled),
            signals,
            address,
            fallback_name,
            read_buffer_size: self.settings.read_buffer_size.max(1),
        };
        if let Err(e) = thread::Builder::new()
            .name("rfcomm-connect".to_string())
            .spawn(move || worker.run())
        {
            channel.shutdown();
            return Err(e.into());
        }

        info!("Connecting to {} over RFCOMM", address);
        self.link = Some(ClassicLink { channel, cancelled });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            debug!("Closing RFCOMM session");
            link.cancelled.store(true, Ordering::SeqCst);
            link.channel.shutdown();
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let link = self.link.as_ref().ok_or(LinkError::NotConnected)?;
        link.channel.write_all(data).map_err(|e| {
            warn!("Failed to write {} bytes: {}", data.len(), e);
            e
        })
    }
}

impl Drop for ClassicTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct ConnectWorker {
    adapter: Arc<dyn ClassicAdapter>,
    channel: Arc<dyn RfcommChannel>,
    cancelled: Arc<AtomicBool>,
    signals: SignalSender,
    address: BluetoothAddress,
    fallback_name: String,
    read_buffer_size: usize,
}

impl ConnectWorker {
    fn run(self) {
        self.adapter.cancel_discovery();

        if let Err(e) = self.channel.connect() {
            self.channel.shutdown();
            if self.cancelled.load(Ordering::SeqCst) {
                debug!("Connect to {} cancelled", self.address);
            } else {
                warn!("Connect to {} failed: {}", self.address, e);
                self.signals.failed(e);
            }
            return;
        }

        if self.cancelled.load(Ordering::SeqCst) {
            self.channel.shutdown();
            return;
        }

        let name = self
            .adapter
            .remote_name(&self.address)
            .unwrap_or(self.fallback_name);

        let reader = ReadWorker {
            channel: Arc::clone(&self.channel),
            cancelled: Arc::clone(&self.cancelled),
            signals: self.signals.clone(),
            buffer_size: self.read_buffer_size,
        };

        info!("Connected to {} ({})", name, self.address);
        self.signals.device_name(name);
        self.signals.connected();

        if let Err(e) = thread::Builder::new()
            .name("rfcomm-read".to_string())
            .spawn(move || reader.run())
        {
            warn!("Could not start RFCOMM reader: {}", e);
            self.channel.shutdown();
            self.signals.closed(Some(e.into()));
        }
    }
}

struct ReadWorker {
    channel: Arc<dyn RfcommChannel>,
    cancelled: Arc<AtomicBool>,
    signals: SignalSender,
    buffer_size: usize,
}

impl ReadWorker {
    fn run(self) {
        let mut buf = vec![0u8; self.buffer_size];
        let error = loop {
            match self.channel.read(&mut buf) {
                Ok(0) => break LinkError::LinkLost("stream closed by remote".to_string()),
                Ok(n) => self.signals.data(buf[..n].to_vec()),
                Err(e) => break e,
            }
        };

        if self.cancelled.load(Ordering::SeqCst) {
            debug!("RFCOMM reader stopped");
            return;
        }
        warn!("Connection lost: {}", error);
        self.signals.warn("connection lost");
        self.signals
            .closed(Some(LinkError::LinkLost(error.to_string())));
    }
}
