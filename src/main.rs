use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use printer_link::infrastructure::logging::init_logger;
use printer_link::{
    ConnectionState, DeviceDescriptor, PlatformContext, PrinterEvent, PrinterHandle,
    PrinterService, SettingsService, StateChannel, TransportKind,
};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "printer-link", version, about = "Talk to receipt and label printers")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List bonded classic Bluetooth devices
    ScanClassic,
    /// Run one timed BLE scan
    ScanBle,
    /// List attached USB devices
    ListUsb,
    /// Connect, send one payload and disconnect
    Send {
        #[command(flatten)]
        target: TargetArgs,
        #[command(flatten)]
        payload: PayloadArgs,
        /// Time to let queued transfers drain before disconnecting
        #[arg(long, default_value_t = 1000)]
        linger_ms: u64,
    },
    /// Connect and print received frames until interrupted
    Listen {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TransportArg {
    Classic,
    Ble,
    Usb,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Classic => TransportKind::ClassicBluetooth,
            TransportArg::Ble => TransportKind::Ble,
            TransportArg::Usb => TransportKind::Usb,
        }
    }
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long, value_enum, default_value = "classic")]
    transport: TransportArg,
    /// Bluetooth address, `XX:XX:XX:XX:XX:XX`
    #[arg(long, required_unless_present = "vendor")]
    address: Option<String>,
    /// USB vendor id (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_id, requires = "product")]
    vendor: Option<u16>,
    #[arg(long, value_parser = parse_id, requires = "vendor")]
    product: Option<u16>,
    /// Reconnect automatically after the link drops (classic only)
    #[arg(long)]
    auto_connect: bool,
}

impl TargetArgs {
    fn descriptor(&self) -> anyhow::Result<DeviceDescriptor> {
        match TransportKind::from(self.transport) {
            TransportKind::Usb => match (self.vendor, self.product) {
                (Some(vendor), Some(product)) => Ok(DeviceDescriptor::usb(vendor, product)),
                _ => bail!("--vendor and --product are required for USB"),
            },
            _ => {
                let address = self
                    .address
                    .clone()
                    .context("--address is required for Bluetooth")?;
                Ok(DeviceDescriptor::bluetooth("", address))
            }
        }
    }
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct PayloadArgs {
    /// Text sent as UTF-8
    #[arg(long)]
    text: Option<String>,
    /// Base64-encoded bytes
    #[arg(long)]
    raw: Option<String>,
    /// File sent as-is
    #[arg(long)]
    file: Option<PathBuf>,
}

fn parse_id(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_service = match &cli.settings {
        Some(path) => SettingsService::with_path(path.clone()),
        None => SettingsService::new()?,
    };
    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();
    info!("Settings loaded from {}", settings_service.path().display());

    let settings = settings_service.get().clone();
    let platform = PlatformContext::detect(&settings).await;
    let (event_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    let printer = PrinterService::new(platform, settings, event_tx).spawn();

    match cli.command {
        Command::ScanClassic => {
            printer.scan_classic().await?;
            print_scan(&mut events).await;
        }
        Command::ScanBle => {
            printer.scan_ble().await?;
            print_scan(&mut events).await;
        }
        Command::ListUsb => {
            for device in printer.list_usb_devices().await {
                println!(
                    "{:04x}:{:04x}  {}  {} {}",
                    device.vendor_id,
                    device.product_id,
                    device.name,
                    device.manufacturer.as_deref().unwrap_or("-"),
                    device.product.as_deref().unwrap_or("-"),
                );
            }
        }
        Command::Send {
            target,
            payload,
            linger_ms,
        } => {
            connect(&printer, &mut events, &target).await?;
            let sent = if let Some(text) = payload.text {
                printer.send_text(text).await
            } else if let Some(raw) = payload.raw {
                printer.send_raw(raw).await
            } else if let Some(path) = payload.file {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                printer.send(bytes).await
            } else {
                false
            };
            tokio::time::sleep(Duration::from_millis(linger_ms)).await;
            printer.disconnect().await?;
            if !sent {
                bail!("send failed");
            }
            info!("Payload sent");
        }
        Command::Listen { target } => {
            connect(&printer, &mut events, &target).await?;
            listen(&mut events).await?;
            printer.disconnect().await?;
        }
    }
    Ok(())
}

async fn print_scan(events: &mut UnboundedReceiver<PrinterEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PrinterEvent::ScanResult(device) => println!("{}  {}", device.address, device.name),
            PrinterEvent::ScanStopped => break,
            PrinterEvent::Notice(notice) => warn!("{}", notice.message),
            _ => {}
        }
    }
}

/// Connect and wait until the link is usable.
async fn connect(
    printer: &PrinterHandle,
    events: &mut UnboundedReceiver<PrinterEvent>,
    target: &TargetArgs,
) -> anyhow::Result<()> {
    let kind = TransportKind::from(target.transport);
    printer
        .connect(target.descriptor()?, kind, target.auto_connect)
        .await?;

    match kind {
        // connect() only issued the permission request
        TransportKind::Usb => wait_for_usb(events).await,
        // the write target is picked once service discovery completes
        TransportKind::Ble => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(())
        }
        TransportKind::ClassicBluetooth => Ok(()),
    }
}

async fn wait_for_usb(events: &mut UnboundedReceiver<PrinterEvent>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            PrinterEvent::StateChanged {
                channel: StateChannel::Usb,
                state: ConnectionState::Connected,
            } => return Ok(()),
            PrinterEvent::StateChanged {
                channel: StateChannel::Usb,
                state: ConnectionState::None,
            } => bail!("USB device was not granted"),
            PrinterEvent::Notice(notice) => warn!("{}", notice.message),
            _ => {}
        }
    }
    bail!("printer service stopped")
}

async fn listen(events: &mut UnboundedReceiver<PrinterEvent>) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(PrinterEvent::DataReceived(frame)) => {
                    stdout.write_all(&frame)?;
                    stdout.write_all(b"\n")?;
                    stdout.flush()?;
                }
                Some(PrinterEvent::StateChanged { channel, state }) => {
                    info!("{:?} link {}", channel, state);
                }
                Some(PrinterEvent::DeviceName(name)) => info!("Connected to {}", name),
                Some(PrinterEvent::Notice(notice)) => warn!("{}", notice.message),
                Some(_) => {}
                None => return Ok(()),
            }
        }
    }
}
