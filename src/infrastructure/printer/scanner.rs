//! Scanner Module
//!
//! Classic discovery reports bonded devices in one pass. BLE discovery runs
//! for a fixed period and reports each address at most once.

use crate::domain::error::Result;
use crate::domain::models::{Advertisement, DeviceDescriptor};
use crate::infrastructure::platform::{BleCentral, BondedDevice};
use crate::infrastructure::printer::service::Inbox;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Scan result for a bonded device; unnamed devices are listed by address.
pub fn bonded_result(device: &BondedDevice) -> DeviceDescriptor {
    let name = device
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| device.address.clone());
    DeviceDescriptor::bluetooth(name, device.address.clone())
}

/// Devices seen during one BLE scan, keyed by address. First sighting wins.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    seen: HashMap<String, Option<String>>,
    report_unnamed: bool,
}

impl ScanRegistry {
    pub fn new(report_unnamed: bool) -> Self {
        Self {
            seen: HashMap::new(),
            report_unnamed,
        }
    }

    /// Record `advertisement`; returns a result to report if this address is new
    /// and reportable.
    pub fn observe(&mut self, advertisement: Advertisement) -> Option<DeviceDescriptor> {
        if self.seen.contains_key(&advertisement.address) {
            return None;
        }
        let name = advertisement.name.filter(|n| !n.is_empty());
        self.seen.insert(advertisement.address.clone(), name.clone());

        match name {
            Some(name) => Some(DeviceDescriptor::bluetooth(name, advertisement.address)),
            None if self.report_unnamed => Some(DeviceDescriptor::bluetooth(
                advertisement.address.clone(),
                advertisement.address,
            )),
            None => {
                debug!("Recorded unnamed BLE device {}", advertisement.address);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn unnamed(&self) -> usize {
        self.seen.values().filter(|n| n.is_none()).count()
    }
}

/// A running BLE scan: the advertisement forwarder plus the period timer.
pub(crate) struct BleScan {
    id: u64,
    registry: ScanRegistry,
    forwarder: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl BleScan {
    pub fn start(
        id: u64,
        central: &dyn BleCentral,
        period: Duration,
        report_unnamed: bool,
        inbox: mpsc::UnboundedSender<Inbox>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        central.start_scan(tx)?;

        let sink = inbox.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(advertisement) = rx.recv().await {
                if sink
                    .send(Inbox::Advertisement {
                        scan: id,
                        advertisement,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
        let timer = tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = inbox.send(Inbox::ScanPeriodElapsed { scan: id });
        });

        info!("BLE scan #{} started for {:?}", id, period);
        Ok(Self {
            id,
            registry: ScanRegistry::new(report_unnamed),
            forwarder,
            timer,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn observe(&mut self, advertisement: Advertisement) -> Option<DeviceDescriptor> {
        self.registry.observe(advertisement)
    }

    pub fn stop(self, central: &dyn BleCentral) {
        self.timer.abort();
        self.forwarder.abort();
        central.stop_scan();
        info!(
            "BLE scan #{} stopped ({} devices, {} unnamed)",
            self.id,
            self.registry.len(),
            self.registry.unnamed()
        );
    }
}
