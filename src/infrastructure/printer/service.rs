//! Printer Service Module
//!
//! Single task that owns the active transport, drives the connection state
//! machine and relays transport activity to the host as [`PrinterEvent`]s.
//! Commands, transport signals and timer expiries all arrive on one inbox and
//! are handled strictly in order.

use crate::domain::address::BluetoothAddress;
use crate::domain::error::{LinkError, Result};
use crate::domain::models::{
    Advertisement, ConnectionState, DeviceDescriptor, LinkStatus, Payload, PrinterEvent,
    StateChannel, StatusMessage, TransportKind, UsbDeviceInfo,
};
use crate::domain::settings::Settings;
use crate::infrastructure::platform::PlatformContext;
use crate::infrastructure::printer::ble::BleTransport;
use crate::infrastructure::printer::classic::ClassicTransport;
use crate::infrastructure::printer::reconnect::ReconnectPolicy;
use crate::infrastructure::printer::scanner::{bonded_result, BleScan};
use crate::infrastructure::printer::transport::{
    LinkUpdate, SignalBody, SignalSender, Transport, TransportSignal,
};
use crate::infrastructure::printer::usb::UsbTransport;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub(crate) enum PrinterCommand {
    Connect {
        target: DeviceDescriptor,
        kind: TransportKind,
        auto_connect: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        payload: Payload,
        reply: oneshot::Sender<bool>,
    },
    ScanClassic {
        reply: oneshot::Sender<Result<()>>,
    },
    ScanBle {
        reply: oneshot::Sender<Result<()>>,
    },
    SelectUsb {
        vendor_id: u16,
        product_id: u16,
        reply: oneshot::Sender<bool>,
    },
    CloseUsb {
        reply: oneshot::Sender<()>,
    },
    ListUsb {
        reply: oneshot::Sender<Vec<UsbDeviceInfo>>,
    },
    Status {
        reply: oneshot::Sender<LinkStatus>,
    },
}

/// Everything the service task reacts to.
#[derive(Debug)]
pub(crate) enum Inbox {
    Command(PrinterCommand),
    Signal(TransportSignal),
    ReconnectDue { generation: u64 },
    Advertisement { scan: u64, advertisement: Advertisement },
    ScanPeriodElapsed { scan: u64 },
}

/// Cloneable entry point for commands. Every call fails with
/// [`LinkError::ServiceStopped`] (or returns `false`) once the service task is gone.
#[derive(Clone)]
pub struct PrinterHandle {
    inbox: mpsc::UnboundedSender<Inbox>,
}

impl PrinterHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PrinterCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(Inbox::Command(command(reply)))
            .map_err(|_| LinkError::ServiceStopped)?;
        response.await.map_err(|_| LinkError::ServiceStopped)
    }

    /// Resolves once the attempt connects or fails. USB targets resolve as soon
    /// as the permission request is issued.
    pub async fn connect(
        &self,
        target: DeviceDescriptor,
        kind: TransportKind,
        auto_connect: bool,
    ) -> Result<()> {
        self.request(|reply| PrinterCommand::Connect {
            target,
            kind,
            auto_connect,
            reply,
        })
        .await?
    }

    /// Close the active session and turn auto-reconnect off.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| PrinterCommand::Disconnect { reply }).await
    }

    /// Write bytes to the connected session. `false` when nothing is
    /// connected or the write is rejected.
    pub async fn send(&self, bytes: Vec<u8>) -> bool {
        self.send_payload(Payload::Bytes(bytes)).await
    }

    /// Send `text` as UTF-8.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_payload(Payload::Text(text.into())).await
    }

    /// `encoded` is Base64.
    pub async fn send_raw(&self, encoded: impl Into<String>) -> bool {
        self.send_payload(Payload::Base64(encoded.into())).await
    }

    /// Send any [`Payload`] variant.
    pub async fn send_payload(&self, payload: Payload) -> bool {
        self.request(|reply| PrinterCommand::Send { payload, reply })
            .await
            .unwrap_or(false)
    }

    /// Report bonded classic devices as scan results, followed by `ScanStopped`.
    pub async fn scan_classic(&self) -> Result<()> {
        self.request(|reply| PrinterCommand::ScanClassic { reply })
            .await?
    }

    /// Starts a timed BLE scan, or stops the one already running.
    pub async fn scan_ble(&self) -> Result<()> {
        self.request(|reply| PrinterCommand::ScanBle { reply }).await?
    }

    /// Ask for permission on the first device matching the ids.
    pub async fn select_usb_device(&self, vendor_id: u16, product_id: u16) -> bool {
        self.request(|reply| PrinterCommand::SelectUsb {
            vendor_id,
            product_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Release the USB device, if the active session is one.
    pub async fn close_usb(&self) -> Result<()> {
        self.request(|reply| PrinterCommand::CloseUsb { reply }).await
    }

    /// Attached USB devices; empty when no USB host is available.
    pub async fn list_usb_devices(&self) -> Vec<UsbDeviceInfo> {
        self.request(|reply| PrinterCommand::ListUsb { reply })
            .await
            .unwrap_or_default()
    }

    /// Active transport kind and its connection state.
    pub async fn status(&self) -> Result<LinkStatus> {
        self.request(|reply| PrinterCommand::Status { reply }).await
    }
}

pub struct PrinterService {
    platform: PlatformContext,
    settings: Settings,
    event_sender: mpsc::UnboundedSender<PrinterEvent>,
}

impl PrinterService {
    pub fn new(
        platform: PlatformContext,
        settings: Settings,
        event_sender: mpsc::UnboundedSender<PrinterEvent>,
    ) -> Self {
        Self {
            platform,
            settings,
            event_sender,
        }
    }

    /// Start the service task on the current tokio runtime.
    pub fn spawn(self) -> PrinterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(self, tx.downgrade());
        tokio::spawn(worker.run(rx));
        PrinterHandle { inbox: tx }
    }
}

struct ActiveSession {
    target: DeviceDescriptor,
    attempt: u64,
    state: ConnectionState,
    transport: Box<dyn Transport>,
    pending: Option<oneshot::Sender<Result<()>>>,
}

impl ActiveSession {
    fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    fn resolve(&mut self, result: Result<()>) {
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(result);
        }
    }
}

#[derive(Clone)]
struct ReconnectTarget {
    target: DeviceDescriptor,
    kind: TransportKind,
    auto_connect: bool,
}

struct Worker {
    platform: PlatformContext,
    settings: Settings,
    events: mpsc::UnboundedSender<PrinterEvent>,
    inbox: mpsc::WeakUnboundedSender<Inbox>,
    session: Option<ActiveSession>,
    next_attempt: u64,
    last_target: Option<ReconnectTarget>,
    reconnect: ReconnectPolicy,
    ble_scan: Option<BleScan>,
    next_scan: u64,
}

impl Worker {
    fn new(service: PrinterService, inbox: mpsc::WeakUnboundedSender<Inbox>) -> Self {
        let reconnect = ReconnectPolicy::new(service.settings.reconnect.clone());
        Self {
            platform: service.platform,
            settings: service.settings,
            events: service.event_sender,
            inbox,
            session: None,
            next_attempt: 0,
            last_target: None,
            reconnect,
            ble_scan: None,
            next_scan: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Inbox>) {
        info!("Printer service started");
        while let Some(message) = rx.recv().await {
            match message {
                Inbox::Command(command) => self.handle_command(command),
                Inbox::Signal(signal) => self.handle_signal(signal),
                Inbox::ReconnectDue { generation } => self.handle_reconnect_due(generation),
                Inbox::Advertisement {
                    scan,
                    advertisement,
                } => self.handle_advertisement(scan, advertisement),
                Inbox::ScanPeriodElapsed { scan } => self.handle_scan_elapsed(scan),
            }
        }
        self.shutdown();
        info!("Printer service stopped");
    }

    fn handle_command(&mut self, command: PrinterCommand) {
        match command {
            PrinterCommand::Connect {
                target,
                kind,
                auto_connect,
                reply,
            } => match kind {
                TransportKind::Usb => {
                    let result = match target.usb_ids() {
                        Some((vendor_id, product_id)) => self.select_usb(vendor_id, product_id),
                        None => Err(LinkError::DeviceNotFound(
                            "no vendor/product id given".to_string(),
                        )),
                    };
                    let _ = reply.send(result);
                }
                _ => self.connect_bluetooth(target, kind, auto_connect, Some(reply)),
            },
            PrinterCommand::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            PrinterCommand::Send { payload, reply } => {
                let _ = reply.send(self.send(payload));
            }
            PrinterCommand::ScanClassic { reply } => {
                let _ = reply.send(self.scan_classic());
            }
            PrinterCommand::ScanBle { reply } => {
                let _ = reply.send(self.scan_ble());
            }
            PrinterCommand::SelectUsb {
                vendor_id,
                product_id,
                reply,
            } => {
                let _ = reply.send(self.select_usb(vendor_id, product_id).is_ok());
            }
            PrinterCommand::CloseUsb { reply } => {
                self.close_usb();
                let _ = reply.send(());
            }
            PrinterCommand::ListUsb { reply } => {
                let _ = reply.send(self.list_usb());
            }
            PrinterCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn emit(&self, event: PrinterEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, channel: StateChannel, state: ConnectionState) {
        info!("{:?} state -> {}", channel, state);
        self.emit(PrinterEvent::StateChanged { channel, state });
    }

    fn notice(&self, message: StatusMessage) {
        self.emit(PrinterEvent::Notice(message));
    }

    fn status(&self) -> LinkStatus {
        match &self.session {
            Some(s) => LinkStatus {
                kind: Some(s.kind()),
                state: s.state,
            },
            None => LinkStatus {
                kind: None,
                state: ConnectionState::None,
            },
        }
    }

    fn signal_sender(&mut self, kind: TransportKind) -> Result<SignalSender> {
        let inbox = self.inbox.upgrade().ok_or(LinkError::ServiceStopped)?;
        self.next_attempt += 1;
        Ok(SignalSender::new(self.next_attempt, kind, inbox))
    }

    fn build_transport(&self, kind: TransportKind) -> Result<Box<dyn Transport>> {
        match kind {
            TransportKind::ClassicBluetooth => self
                .platform
                .classic
                .clone()
                .map(|a| {
                    Box::new(ClassicTransport::new(a, self.settings.classic.clone()))
                        as Box<dyn Transport>
                })
                .ok_or_else(|| LinkError::TransportUnavailable("no Bluetooth adapter".into())),
            TransportKind::Ble => self
                .platform
                .ble
                .clone()
                .map(|c| {
                    Box::new(BleTransport::new(c, self.settings.ble.clone())) as Box<dyn Transport>
                })
                .ok_or_else(|| LinkError::TransportUnavailable("no BLE central".into())),
            TransportKind::Usb => self
                .platform
                .usb
                .clone()
                .map(|h| {
                    Box::new(UsbTransport::new(h, self.settings.usb.clone())) as Box<dyn Transport>
                })
                .ok_or_else(|| LinkError::TransportUnavailable("no USB manager".into())),
        }
    }

    /// Close the active session, reporting `None` if it was live and
    /// cancelling its in-flight connect.
    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            debug!("Tearing down {} session #{}", session.kind(), session.attempt);
            session.transport.close();
            session.resolve(Err(LinkError::Cancelled));
            if session.state != ConnectionState::None {
                self.emit_state(session.kind().channel(), ConnectionState::None);
            }
        }
    }

    fn connect_bluetooth(
        &mut self,
        target: DeviceDescriptor,
        kind: TransportKind,
        auto_connect: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let respond = |reply: Option<oneshot::Sender<Result<()>>>, result: Result<()>| {
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        };

        if let Err(e) = BluetoothAddress::parse(&target.address) {
            warn!("Rejecting connect: {}", e);
            respond(reply, Err(e));
            return;
        }

        self.reconnect.cancel();

        if let Some(session) = &self.session {
            if session.kind() == kind && session.state == ConnectionState::Connected {
                debug!("Already connected over {}", kind);
                respond(reply, Ok(()));
                return;
            }
        }

        let mut transport = match self.build_transport(kind) {
            Ok(t) => t,
            Err(e) => {
                warn!("Cannot connect: {}", e);
                respond(reply, Err(e));
                return;
            }
        };
        self.teardown();

        let signals = match self.signal_sender(kind) {
            Ok(s) => s,
            Err(e) => {
                respond(reply, Err(e));
                return;
            }
        };
        let attempt = signals.attempt();

        self.last_target = Some(ReconnectTarget {
            target: target.clone(),
            kind,
            auto_connect,
        });
        self.reconnect
            .set_enabled(kind == TransportKind::ClassicBluetooth && auto_connect);

        info!("Connecting to {} over {} (attempt #{})", target.address, kind, attempt);
        self.emit_state(kind.channel(), ConnectionState::Connecting);

        match transport.open(&target, signals) {
            Ok(()) => {
                self.session = Some(ActiveSession {
                    target,
                    attempt,
                    state: ConnectionState::Connecting,
                    transport,
                    pending: reply,
                });
            }
            Err(e) => {
                warn!("Connect attempt #{} failed to start: {}", attempt, e);
                transport.close();
                self.emit_state(kind.channel(), ConnectionState::Failed);
                self.emit_state(kind.channel(), ConnectionState::None);
                self.notice(StatusMessage::warning(format!("connect failed: {}", e)));
                respond(reply, Err(e));
                self.schedule_reconnect();
            }
        }
    }

    fn select_usb(&mut self, vendor_id: u16, product_id: u16) -> Result<()> {
        if let Some(session) = &self.session {
            if session.kind() == TransportKind::Usb
                && session.target.usb_ids() == Some((vendor_id, product_id))
                && session.state != ConnectionState::None
            {
                debug!("USB device {:04x}:{:04x} already selected", vendor_id, product_id);
                return Ok(());
            }
        }

        self.reconnect.cancel();
        let mut transport = self.build_transport(TransportKind::Usb).map_err(|e| {
            self.notice(StatusMessage::warning("USB manager unavailable"));
            e
        })?;
        self.teardown();
        self.reconnect.set_enabled(false);

        let target = DeviceDescriptor::usb(vendor_id, product_id);
        let signals = self.signal_sender(TransportKind::Usb)?;
        let attempt = signals.attempt();

        if let Err(e) = transport.open(&target, signals) {
            info!("USB select {:04x}:{:04x} rejected: {}", vendor_id, product_id, e);
            return Err(e);
        }

        self.emit_state(StateChannel::Usb, ConnectionState::Connecting);
        self.session = Some(ActiveSession {
            target,
            attempt,
            state: ConnectionState::Connecting,
            transport,
            pending: None,
        });
        Ok(())
    }

    fn handle_signal(&mut self, signal: TransportSignal) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.attempt == signal.attempt);
        if !current {
            debug!(
                "Dropping signal from stale {} attempt #{}",
                signal.kind, signal.attempt
            );
            return;
        }

        match signal.body {
            SignalBody::Link(update) => self.handle_link_update(update),
            SignalBody::Data(bytes) => self.emit(PrinterEvent::DataReceived(bytes)),
            SignalBody::DeviceName(name) => self.emit(PrinterEvent::DeviceName(name)),
            SignalBody::Notice(message) => self.notice(message),
        }
    }

    fn handle_link_update(&mut self, update: LinkUpdate) {
        match update {
            LinkUpdate::Connected => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.state = ConnectionState::Connected;
                session.resolve(Ok(()));
                let channel = session.kind().channel();
                self.reconnect.cancel();
                self.emit_state(channel, ConnectionState::Connected);
            }
            LinkUpdate::Failed(error) => {
                let Some(mut session) = self.session.take() else {
                    return;
                };
                warn!("{} connect failed: {}", session.kind(), error);
                session.transport.close();
                let channel = session.kind().channel();
                self.emit_state(channel, ConnectionState::Failed);
                self.emit_state(channel, ConnectionState::None);
                self.notice(StatusMessage::warning(format!("connect failed: {}", error)));
                session.resolve(Err(error));
                self.schedule_reconnect();
            }
            LinkUpdate::Closed(reason) => {
                let Some(mut session) = self.session.take() else {
                    return;
                };
                let error = reason.unwrap_or_else(|| LinkError::LinkLost("session closed".into()));
                info!("{} session closed: {}", session.kind(), error);
                session.transport.close();
                self.emit_state(session.kind().channel(), ConnectionState::None);
                session.resolve(Err(error));
                self.schedule_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.reconnect.is_enabled() {
            return;
        }
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let delay = self.reconnect.schedule(inbox);
        info!("Reconnecting in {} ms", delay.as_millis());
    }

    fn handle_reconnect_due(&mut self, generation: u64) {
        if !self.reconnect.take_due(generation) {
            debug!("Ignoring stale reconnect #{}", generation);
            return;
        }
        let Some(last) = self.last_target.clone() else {
            return;
        };
        info!("Reconnecting to {}", last.target.address);
        self.teardown();
        self.connect_bluetooth(last.target, last.kind, last.auto_connect, None);
    }

    fn disconnect(&mut self) {
        self.reconnect.set_enabled(false);
        if self.session.is_some() {
            info!("Disconnecting");
        }
        self.teardown();
    }

    fn close_usb(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.kind() == TransportKind::Usb)
        {
            info!("Closing USB device");
            self.teardown();
        }
    }

    fn send(&mut self, payload: Payload) -> bool {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.state == ConnectionState::Connected)
        else {
            debug!("Send rejected: not connected");
            return false;
        };

        let result = match &payload {
            Payload::Bytes(bytes) => session.transport.write(bytes),
            Payload::Text(text) => session.transport.write_text(text),
            Payload::Base64(encoded) => session.transport.write_raw(encoded),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write data: {}", e);
                self.notice(StatusMessage::warning(format!("failed to write data: {}", e)));
                false
            }
        }
    }

    fn scan_classic(&mut self) -> Result<()> {
        let adapter = self
            .platform
            .classic
            .clone()
            .ok_or_else(|| LinkError::TransportUnavailable("no Bluetooth adapter".into()))?;

        self.emit(PrinterEvent::ScanStarted);
        let result = adapter.bonded_devices().map(|devices| {
            info!("Found {} bonded devices", devices.len());
            for device in &devices {
                self.emit(PrinterEvent::ScanResult(bonded_result(device)));
            }
        });
        if let Err(e) = &result {
            warn!("Classic scan failed: {}", e);
        }
        self.emit(PrinterEvent::ScanStopped);
        result
    }

    fn scan_ble(&mut self) -> Result<()> {
        let central = self
            .platform
            .ble
            .clone()
            .ok_or_else(|| LinkError::TransportUnavailable("no BLE scanner".into()))?;

        if let Some(scan) = self.ble_scan.take() {
            scan.stop(central.as_ref());
            self.emit(PrinterEvent::ScanStopped);
            return Ok(());
        }

        let inbox = self.inbox.upgrade().ok_or(LinkError::ServiceStopped)?;
        self.next_scan += 1;
        self.emit(PrinterEvent::ScanStarted);
        match BleScan::start(
            self.next_scan,
            central.as_ref(),
            self.settings.scan.ble_scan_period(),
            self.settings.scan.report_unnamed_ble_devices,
            inbox,
        ) {
            Ok(scan) => {
                self.ble_scan = Some(scan);
                Ok(())
            }
            Err(e) => {
                warn!("BLE scan failed to start: {}", e);
                self.emit(PrinterEvent::ScanStopped);
                Err(e)
            }
        }
    }

    fn handle_advertisement(&mut self, scan: u64, advertisement: Advertisement) {
        let Some(active) = self.ble_scan.as_mut().filter(|s| s.id() == scan) else {
            return;
        };
        if let Some(device) = active.observe(advertisement) {
            debug!("BLE scan result: {} ({})", device.name, device.address);
            self.emit(PrinterEvent::ScanResult(device));
        }
    }

    fn handle_scan_elapsed(&mut self, scan: u64) {
        if !self.ble_scan.as_ref().is_some_and(|s| s.id() == scan) {
            return;
        }
        if let (Some(active), Some(central)) = (self.ble_scan.take(), self.platform.ble.clone()) {
            active.stop(central.as_ref());
        }
        self.emit(PrinterEvent::ScanStopped);
    }

    fn list_usb(&self) -> Vec<UsbDeviceInfo> {
        let Some(host) = &self.platform.usb else {
            warn!("USB manager unavailable");
            self.notice(StatusMessage::warning("USB manager unavailable"));
            return Vec::new();
        };
        host.devices().unwrap_or_else(|e| {
            warn!("USB enumeration failed: {}", e);
            Vec::new()
        })
    }

    fn shutdown(&mut self) {
        self.reconnect.set_enabled(false);
        if let (Some(scan), Some(central)) = (self.ble_scan.take(), self.platform.ble.clone()) {
            scan.stop(central.as_ref());
        }
        if let Some(mut session) = self.session.take() {
            session.transport.close();
        }
    }
}
