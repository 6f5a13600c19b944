use printer_link::infrastructure::platform::{GattEvent, GattLinkState, GattService};
use printer_link::testing::{
    bulk_interface, notifiable_characteristic, usb_printer, wait_until, MockBleCentral,
    MockClassicAdapter, MockUsbHost,
};
use printer_link::{
    ConnectionState, DeviceDescriptor, LinkError, PlatformContext, PrinterEvent, PrinterHandle,
    PrinterService, Settings, StateChannel, TransportKind,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use uuid::Uuid;

const PRINTER: &str = "66:22:B5:0C:3F:01";

struct Harness {
    printer: PrinterHandle,
    events: UnboundedReceiver<PrinterEvent>,
}

impl Harness {
    fn start(platform: PlatformContext) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let printer = PrinterService::new(platform, Settings::default(), tx).spawn();
        Self { printer, events }
    }

    async fn next(&mut self) -> PrinterEvent {
        self.events.recv().await.expect("printer event")
    }

    /// Next state change, skipping names, data and notices.
    async fn next_state(&mut self) -> (StateChannel, ConnectionState) {
        loop {
            if let PrinterEvent::StateChanged { channel, state } = self.next().await {
                return (channel, state);
            }
        }
    }

    /// Everything emitted so far. Round-trips through the service first so
    /// earlier commands have been fully handled.
    async fn drain(&mut self) -> Vec<PrinterEvent> {
        self.printer.status().await.expect("status");
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn drain_states(&mut self) -> Vec<(StateChannel, ConnectionState)> {
        self.drain()
            .await
            .into_iter()
            .filter_map(|event| match event {
                PrinterEvent::StateChanged { channel, state } => Some((channel, state)),
                _ => None,
            })
            .collect()
    }
}

fn bt(state: ConnectionState) -> (StateChannel, ConnectionState) {
    (StateChannel::Bluetooth, state)
}

fn usb(state: ConnectionState) -> (StateChannel, ConnectionState) {
    (StateChannel::Usb, state)
}

fn printer() -> DeviceDescriptor {
    DeviceDescriptor::bluetooth("RPP02N", PRINTER)
}

fn classic_platform(adapter: &std::sync::Arc<MockClassicAdapter>) -> PlatformContext {
    PlatformContext::new().with_classic(adapter.clone())
}

#[tokio::test]
async fn test_invalid_address_has_no_side_effects() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));

    let result = h
        .printer
        .connect(
            DeviceDescriptor::bluetooth("p", "66:22:B5:0C:3F"),
            TransportKind::ClassicBluetooth,
            true,
        )
        .await;

    assert!(matches!(result, Err(LinkError::InvalidAddress(_))));
    assert_eq!(adapter.channels_created(), 0);
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn test_missing_backend_is_unavailable() {
    let mut h = Harness::start(PlatformContext::new());
    let result = h
        .printer
        .connect(printer(), TransportKind::Ble, false)
        .await;
    assert!(matches!(result, Err(LinkError::TransportUnavailable(_))));
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn test_failed_connect_collapses_to_none() {
    let adapter = MockClassicAdapter::new();
    adapter.fail_next_connect(LinkError::IoFailure("host is down".into()));
    let mut h = Harness::start(classic_platform(&adapter));

    let result = h
        .printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await;

    assert_eq!(result, Err(LinkError::IoFailure("host is down".into())));
    let events = h.drain().await;
    let states: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PrinterEvent::StateChanged { channel, state } => Some((*channel, *state)),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            bt(ConnectionState::Connecting),
            bt(ConnectionState::Failed),
            bt(ConnectionState::None),
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, PrinterEvent::Notice(n) if n.message.contains("connect failed"))));
    assert_eq!(
        h.printer.status().await.unwrap().state,
        ConnectionState::None
    );
}

#[tokio::test]
async fn test_classic_session_passes_data_through() {
    let adapter = MockClassicAdapter::new();
    adapter.set_remote_name(PRINTER, "MTP-II");
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await
        .unwrap();
    assert_eq!(h.next().await, PrinterEvent::StateChanged {
        channel: StateChannel::Bluetooth,
        state: ConnectionState::Connecting,
    });
    assert_eq!(h.next().await, PrinterEvent::DeviceName("MTP-II".into()));
    assert_eq!(h.next_state().await, bt(ConnectionState::Connected));

    let channel = adapter.last_channel().unwrap();
    channel.push_inbound(b"OK\r\n");
    assert_eq!(h.next().await, PrinterEvent::DataReceived(b"OK\r\n".to_vec()));

    assert!(h.printer.send(b"\x1b@".to_vec()).await);
    assert!(h.printer.send_text("Total: 4.20\n").await);
    assert!(h.printer.send_raw("HQoK").await);
    assert_eq!(channel.written(), b"\x1b@Total: 4.20\n\x1d\x0a\x0a".to_vec());

    assert!(!h.printer.send_raw("***").await);
    assert!(h
        .drain()
        .await
        .iter()
        .any(|e| matches!(e, PrinterEvent::Notice(n) if n.message.contains("failed to write data"))));
}

#[tokio::test]
async fn test_send_without_session_is_rejected() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));
    assert!(!h.printer.send_text("hello").await);
    assert!(h.drain().await.is_empty());
}

#[tokio::test]
async fn test_connect_while_connected_is_idempotent() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await
        .unwrap();
    h.drain().await;

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await
        .unwrap();
    assert_eq!(adapter.channels_created(), 1);
    assert!(h.drain_states().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_after_failure() {
    let adapter = MockClassicAdapter::new();
    adapter.fail_all_connects(Some(LinkError::IoFailure("page timeout".into())));
    let mut h = Harness::start(classic_platform(&adapter));

    let result = h
        .printer
        .connect(printer(), TransportKind::ClassicBluetooth, true)
        .await;
    assert!(result.is_err());
    assert_eq!(
        h.drain_states().await,
        vec![
            bt(ConnectionState::Connecting),
            bt(ConnectionState::Failed),
            bt(ConnectionState::None),
        ]
    );

    let failed_at = Instant::now();
    adapter.fail_all_connects(None);
    assert_eq!(h.next_state().await, bt(ConnectionState::Connecting));
    let waited = failed_at.elapsed();
    assert!(waited >= Duration::from_millis(1000), "{:?}", waited);
    assert!(waited < Duration::from_millis(5000), "{:?}", waited);

    assert_eq!(h.next_state().await, bt(ConnectionState::Connected));
    assert_eq!(adapter.channels_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auto_reconnect_after_link_loss() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, true)
        .await
        .unwrap();
    h.drain().await;

    adapter.last_channel().unwrap().drop_link();
    assert_eq!(h.next_state().await, bt(ConnectionState::None));
    assert_eq!(h.next_state().await, bt(ConnectionState::Connecting));
    assert_eq!(h.next_state().await, bt(ConnectionState::Connected));
    assert_eq!(adapter.channels_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, true)
        .await
        .unwrap();
    h.drain().await;

    adapter.last_channel().unwrap().drop_link();
    assert_eq!(h.next_state().await, bt(ConnectionState::None));
    h.printer.disconnect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.drain_states().await.is_empty());
    assert_eq!(adapter.channels_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_without_auto_connect_link_loss_is_final() {
    let adapter = MockClassicAdapter::new();
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await
        .unwrap();
    h.drain().await;

    adapter.last_channel().unwrap().drop_link();
    assert_eq!(h.next_state().await, bt(ConnectionState::None));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.drain_states().await.is_empty());
    assert_eq!(adapter.channels_created(), 1);
}

fn printer_service() -> (GattService, Uuid) {
    let service = Uuid::from_u128(0x49535343_fe7d_4ae5_8fa9_9fafd205e455);
    let characteristic = Uuid::from_u128(0x49535343_8841_43f4_a8d4_ecbe34729bb3);
    (
        GattService {
            uuid: service,
            characteristics: vec![notifiable_characteristic(service, characteristic)],
        },
        characteristic,
    )
}

#[tokio::test]
async fn test_ble_session_frames_notifications() {
    let central = MockBleCentral::new();
    let (service, characteristic) = printer_service();
    central.set_services(vec![service]);
    let mut h = Harness::start(PlatformContext::new().with_ble(central.clone()));

    h.printer
        .connect(printer(), TransportKind::Ble, false)
        .await
        .unwrap();
    assert_eq!(
        h.drain_states().await,
        vec![bt(ConnectionState::Connecting), bt(ConnectionState::Connected)]
    );

    let client = central.last_client().unwrap();
    client.wait_for_ops(3).await;
    client.notify(characteristic, b"ST");
    client.notify(characteristic, b"ATUS\rNEXT");
    assert_eq!(h.next().await, PrinterEvent::DataReceived(b"STATUS".to_vec()));

    assert!(h.printer.send_text("PRINT").await);
    assert_eq!(client.writes(), vec![b"PRINT".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_ble_link_loss_does_not_reconnect() {
    let central = MockBleCentral::new();
    let mut h = Harness::start(PlatformContext::new().with_ble(central.clone()));

    h.printer
        .connect(printer(), TransportKind::Ble, true)
        .await
        .unwrap();
    h.drain().await;

    central
        .last_client()
        .unwrap()
        .emit(GattEvent::ConnectionStateChanged(GattLinkState::Disconnected));
    assert_eq!(h.next_state().await, bt(ConnectionState::None));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.drain_states().await.is_empty());
    assert_eq!(central.gatt_connects(), 1);
}

#[tokio::test]
async fn test_ble_refused_link_fails() {
    let central = MockBleCentral::new();
    central.refuse_connections();
    let mut h = Harness::start(PlatformContext::new().with_ble(central.clone()));

    let result = h.printer.connect(printer(), TransportKind::Ble, false).await;
    assert!(result.is_err());
    assert_eq!(
        h.drain_states().await,
        vec![
            bt(ConnectionState::Connecting),
            bt(ConnectionState::Failed),
            bt(ConnectionState::None),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_ble_scan_reports_each_device_once() {
    let central = MockBleCentral::new();
    let mut h = Harness::start(PlatformContext::new().with_ble(central.clone()));

    let started = Instant::now();
    h.printer.scan_ble().await.unwrap();
    assert_eq!(h.next().await, PrinterEvent::ScanStarted);
    assert!(central.is_scanning());

    assert!(central.advertise("C0:00:00:00:00:01", Some("Label-1")));
    assert!(central.advertise("C0:00:00:00:00:01", Some("Label-1")));
    assert!(central.advertise("C0:00:00:00:00:02", None));
    assert!(central.advertise("C0:00:00:00:00:03", Some("Receipt")));

    assert_eq!(
        h.next().await,
        PrinterEvent::ScanResult(DeviceDescriptor::bluetooth("Label-1", "C0:00:00:00:00:01"))
    );
    assert_eq!(
        h.next().await,
        PrinterEvent::ScanResult(DeviceDescriptor::bluetooth("Receipt", "C0:00:00:00:00:03"))
    );
    assert_eq!(h.next().await, PrinterEvent::ScanStopped);
    assert!(started.elapsed() >= Duration::from_millis(4000));
    assert!(!central.is_scanning());
    assert_eq!(central.scan_stops(), 1);
}

#[tokio::test]
async fn test_ble_scan_toggles_off() {
    let central = MockBleCentral::new();
    let mut h = Harness::start(PlatformContext::new().with_ble(central.clone()));

    h.printer.scan_ble().await.unwrap();
    h.printer.scan_ble().await.unwrap();
    assert_eq!(
        h.drain().await,
        vec![PrinterEvent::ScanStarted, PrinterEvent::ScanStopped]
    );
    assert!(!central.is_scanning());

    // a fresh scan forgets what the previous one saw
    h.printer.scan_ble().await.unwrap();
    central.advertise("C0:00:00:00:00:01", Some("Label-1"));
    assert_eq!(h.next().await, PrinterEvent::ScanStarted);
    assert!(matches!(h.next().await, PrinterEvent::ScanResult(_)));
    assert_eq!(central.scan_starts(), 2);
}

#[tokio::test]
async fn test_classic_scan_lists_bonded_devices() {
    let adapter = MockClassicAdapter::new();
    adapter.add_bonded(PRINTER, Some("RPP02N"));
    adapter.add_bonded("66:22:B5:0C:3F:02", None);
    let mut h = Harness::start(classic_platform(&adapter));

    h.printer.scan_classic().await.unwrap();
    assert_eq!(
        h.drain().await,
        vec![
            PrinterEvent::ScanStarted,
            PrinterEvent::ScanResult(DeviceDescriptor::bluetooth("RPP02N", PRINTER)),
            PrinterEvent::ScanResult(DeviceDescriptor::bluetooth(
                "66:22:B5:0C:3F:02",
                "66:22:B5:0C:3F:02"
            )),
            PrinterEvent::ScanStopped,
        ]
    );
}

#[tokio::test]
async fn test_classic_scan_failure_still_brackets() {
    let adapter = MockClassicAdapter::new();
    adapter.fail_bonded(LinkError::PermissionDenied("bluetooth".into()));
    let mut h = Harness::start(classic_platform(&adapter));

    assert!(h.printer.scan_classic().await.is_err());
    assert_eq!(
        h.drain().await,
        vec![PrinterEvent::ScanStarted, PrinterEvent::ScanStopped]
    );
}

const VID: u16 = 0x0416;
const PID: u16 = 0x5011;
const DEVICE_ID: u32 = 1003;

fn usb_host(max_packet: u16) -> std::sync::Arc<MockUsbHost> {
    let host = MockUsbHost::new();
    host.attach(usb_printer(DEVICE_ID, VID, PID), bulk_interface(max_packet));
    host
}

#[tokio::test]
async fn test_usb_select_without_match() {
    let host = usb_host(64);
    let mut h = Harness::start(PlatformContext::new().with_usb(host.clone()));

    assert!(!h.printer.select_usb_device(0x1234, 0x5678).await);
    assert_eq!(h.printer.status().await.unwrap().state, ConnectionState::None);
    assert!(h.drain().await.is_empty());
    assert_eq!(host.permission_requests(), 0);
}

#[tokio::test]
async fn test_usb_grant_and_chunked_send() {
    let host = usb_host(4);
    let mut h = Harness::start(PlatformContext::new().with_usb(host.clone()));

    assert!(h.printer.select_usb_device(VID, PID).await);
    assert_eq!(h.next_state().await, usb(ConnectionState::Connecting));
    assert!(host.grant(DEVICE_ID));
    assert_eq!(h.next_state().await, usb(ConnectionState::Connected));

    // selecting the same device again changes nothing
    assert!(h.printer.select_usb_device(VID, PID).await);
    assert_eq!(host.permission_requests(), 1);

    assert!(h.printer.send(vec![1, 2, 3, 4, 5, 6]).await);
    wait_until(|| host.transfers().len() == 2).await;
    assert_eq!(host.transfers(), vec![vec![1, 2, 3, 4], vec![5, 6, 0, 0]]);

    h.printer.close_usb().await.unwrap();
    assert_eq!(h.drain_states().await, vec![usb(ConnectionState::None)]);
    wait_until(|| host.connections_closed() == 1).await;
}

#[tokio::test]
async fn test_slow_usb_transfer_keeps_service_responsive() {
    let host = usb_host(64);
    host.delay_transfers(Duration::from_millis(500));
    let mut h = Harness::start(PlatformContext::new().with_usb(host.clone()));

    assert!(h.printer.select_usb_device(VID, PID).await);
    assert!(host.grant(DEVICE_ID));
    assert_eq!(h.next_state().await, usb(ConnectionState::Connecting));
    assert_eq!(h.next_state().await, usb(ConnectionState::Connected));

    assert!(h.printer.send(vec![1, 2, 3]).await);
    wait_until(|| host.transfers_started() == 1).await;

    let started = std::time::Instant::now();
    assert!(h.printer.send(vec![4]).await);
    assert_eq!(
        h.printer.status().await.unwrap().state,
        ConnectionState::Connected
    );
    h.printer.disconnect().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(250));

    assert_eq!(h.drain_states().await, vec![usb(ConnectionState::None)]);
    wait_until(|| host.connections_closed() == 1).await;
    assert_eq!(host.transfers().len(), 1);
}

#[tokio::test]
async fn test_usb_permission_denied() {
    let host = usb_host(64);
    let mut h = Harness::start(PlatformContext::new().with_usb(host.clone()));

    assert!(h.printer.select_usb_device(VID, PID).await);
    assert_eq!(h.next_state().await, usb(ConnectionState::Connecting));
    host.deny(DEVICE_ID);
    assert!(matches!(h.next().await, PrinterEvent::Notice(_)));
    assert_eq!(h.next().await, PrinterEvent::StateChanged {
        channel: StateChannel::Usb,
        state: ConnectionState::None,
    });
    assert!(!h.printer.send_text("x").await);
}

#[tokio::test]
async fn test_usb_detach_ends_session() {
    let host = usb_host(64);
    let mut h = Harness::start(PlatformContext::new().with_usb(host.clone()));

    assert!(h.printer.select_usb_device(VID, PID).await);
    host.grant(DEVICE_ID);
    assert_eq!(h.next_state().await, usb(ConnectionState::Connecting));
    assert_eq!(h.next_state().await, usb(ConnectionState::Connected));

    host.detach(DEVICE_ID);
    assert!(matches!(h.next().await, PrinterEvent::Notice(_)));
    assert_eq!(h.next_state().await, usb(ConnectionState::None));
    assert!(h.printer.list_usb_devices().await.is_empty());
}

#[tokio::test]
async fn test_list_usb_without_host() {
    let mut h = Harness::start(PlatformContext::new());
    assert!(h.printer.list_usb_devices().await.is_empty());
    assert!(matches!(h.next().await, PrinterEvent::Notice(_)));
}

#[tokio::test]
async fn test_list_usb_devices() {
    let host = usb_host(64);
    let h = Harness::start(PlatformContext::new().with_usb(host));
    let devices = h.printer.list_usb_devices().await;
    assert_eq!(devices.len(), 1);
    assert!(devices[0].matches(VID, PID));
}

#[tokio::test]
async fn test_switching_transport_closes_previous_channel() {
    let adapter = MockClassicAdapter::new();
    let host = usb_host(64);
    let mut h = Harness::start(
        PlatformContext::new()
            .with_classic(adapter.clone())
            .with_usb(host.clone()),
    );

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, true)
        .await
        .unwrap();
    h.drain().await;

    assert!(h.printer.select_usb_device(VID, PID).await);
    assert_eq!(
        h.drain_states().await,
        vec![bt(ConnectionState::None), usb(ConnectionState::Connecting)]
    );
    assert!(adapter.last_channel().unwrap().is_shut_down());
    let status = h.printer.status().await.unwrap();
    assert_eq!(status.kind, Some(TransportKind::Usb));
}

#[tokio::test]
async fn test_new_connect_cancels_pending_one() {
    let adapter = MockClassicAdapter::new();
    let central = MockBleCentral::new();
    central.stall_connections();
    let mut h = Harness::start(
        PlatformContext::new()
            .with_classic(adapter.clone())
            .with_ble(central.clone()),
    );

    let pending = {
        let printer = h.printer.clone();
        tokio::spawn(async move {
            printer
                .connect(
                    DeviceDescriptor::bluetooth("label", "C0:00:00:00:00:09"),
                    TransportKind::Ble,
                    false,
                )
                .await
        })
    };
    wait_until(|| central.gatt_connects() == 1).await;

    h.printer
        .connect(printer(), TransportKind::ClassicBluetooth, false)
        .await
        .unwrap();
    assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));
    assert_eq!(
        h.drain_states().await,
        vec![
            bt(ConnectionState::Connecting),
            bt(ConnectionState::None),
            bt(ConnectionState::Connecting),
            bt(ConnectionState::Connected),
        ]
    );
    assert_eq!(
        central.last_client().unwrap().ops().last(),
        Some(&printer_link::testing::GattOp::Disconnect)
    );
}
