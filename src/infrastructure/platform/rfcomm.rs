//! Classic Bluetooth over raw RFCOMM sockets.
//!
//! Bonded devices are read from BlueZ's storage directory
//! (`/var/lib/bluetooth/<adapter>/<device>/info`); connections use
//! AF_BLUETOOTH + SOCK_STREAM + BTPROTO_RFCOMM through libc.

use crate::domain::address::{is_valid_address, BluetoothAddress};
use crate::domain::error::{LinkError, Result};
use crate::infrastructure::platform::{BondedDevice, ClassicAdapter, RfcommChannel};
use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::debug;

// <bluetooth/bluetooth.h>, <bluetooth/rfcomm.h>
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_RFCOMM: i32 = 3;

const BLUEZ_STORAGE: &str = "/var/lib/bluetooth";
const SYSFS_BLUETOOTH: &str = "/sys/class/bluetooth";

#[repr(C)]
struct SockaddrRc {
    rc_family: u16,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

pub struct LinuxClassicAdapter {
    channel: u8,
    storage: PathBuf,
}

impl LinuxClassicAdapter {
    /// Fails when the kernel reports no Bluetooth controller.
    pub fn open(channel: u8) -> Result<Self> {
        let has_controller = fs::read_dir(SYSFS_BLUETOOTH)
            .map(|entries| {
                entries
                    .flatten()
                    .any(|e| e.file_name().to_string_lossy().starts_with("hci"))
            })
            .unwrap_or(false);
        if !has_controller {
            return Err(LinkError::TransportUnavailable(
                "no Bluetooth controller".to_string(),
            ));
        }
        Ok(Self::with_storage(channel, BLUEZ_STORAGE))
    }

    pub fn with_storage(channel: u8, storage: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            storage: storage.into(),
        }
    }

    fn adapter_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.storage)? {
            let path = entry?.path();
            let is_adapter = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_valid_address);
            if is_adapter && path.is_dir() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }
}

/// `Name=` from the `[General]` section of a BlueZ device info file.
fn parse_info_name(info: &str) -> Option<String> {
    let mut in_general = false;
    for line in info.lines().map(str::trim) {
        if line.starts_with('[') {
            in_general = line == "[General]";
            continue;
        }
        if in_general {
            if let Some(name) = line.strip_prefix("Name=") {
                return Some(name.to_string()).filter(|n| !n.is_empty());
            }
        }
    }
    None
}

fn read_device_name(device_dir: &Path) -> Option<String> {
    fs::read_to_string(device_dir.join("info"))
        .ok()
        .as_deref()
        .and_then(parse_info_name)
}

impl ClassicAdapter for LinuxClassicAdapter {
    fn bonded_devices(&self) -> Result<Vec<BondedDevice>> {
        let mut devices = Vec::new();
        for adapter in self.adapter_dirs()? {
            for entry in fs::read_dir(&adapter)? {
                let path = entry?.path();
                let Some(address) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .filter(|n| is_valid_address(n))
                    .map(str::to_string)
                else {
                    continue;
                };
                if !path.join("info").exists() {
                    continue;
                }
                devices.push(BondedDevice {
                    name: read_device_name(&path),
                    address,
                });
            }
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    fn remote_name(&self, address: &BluetoothAddress) -> Option<String> {
        let key = address.to_string();
        self.adapter_dirs()
            .ok()?
            .into_iter()
            .find_map(|adapter| read_device_name(&adapter.join(&key)))
    }

    fn cancel_discovery(&self) {
        // Inquiry is only started by bluetoothd clients; nothing to cancel here.
        debug!("cancel_discovery: no inquiry owned by this process");
    }

    fn create_channel(&self, address: &BluetoothAddress) -> Result<Arc<dyn RfcommChannel>> {
        Ok(Arc::new(RfcommSocket::new(*address, self.channel)))
    }
}

/// RFCOMM stream socket. The descriptor is created by `connect` and closed on drop.
pub struct RfcommSocket {
    address: BluetoothAddress,
    channel: u8,
    fd: AtomicI32,
    shut_down: AtomicBool,
}

impl RfcommSocket {
    pub fn new(address: BluetoothAddress, channel: u8) -> Self {
        Self {
            address,
            channel,
            fd: AtomicI32::new(-1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Make `fd` visible to `shutdown()` before a blocking connect. A shutdown
    /// that raced ahead of the swap saw no descriptor, so it is applied here.
    fn publish(&self, fd: RawFd) -> Result<()> {
        let previous = self.fd.swap(fd, Ordering::SeqCst);
        if previous >= 0 {
            unsafe {
                libc::close(previous);
            }
        }
        if self.shut_down.load(Ordering::SeqCst) {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
            return Err(LinkError::IoFailure("socket closed".to_string()));
        }
        Ok(())
    }

    fn fd(&self) -> Result<RawFd> {
        match self.fd.load(Ordering::SeqCst) {
            fd if fd >= 0 && !self.shut_down.load(Ordering::SeqCst) => Ok(fd),
            _ => Err(LinkError::NotConnected),
        }
    }
}

impl RfcommChannel for RfcommSocket {
    fn connect(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(LinkError::IoFailure("socket closed".to_string()));
        }
        let fd = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        self.publish(fd)?;

        let sa = SockaddrRc {
            rc_family: AF_BLUETOOTH as u16,
            rc_bdaddr: self.address.to_bdaddr(),
            rc_channel: self.channel,
        };
        let ret = unsafe {
            libc::connect(
                fd,
                &sa as *const SockaddrRc as *const libc::sockaddr,
                std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(LinkError::IoFailure("socket closed".to_string()));
        }
        debug!("RFCOMM socket {} connected to {} ch {}", fd, self.address, self.channel);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd()?;
        loop {
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> Result<()> {
        let fd = self.fd()?;
        let mut sent = 0;
        while sent < data.len() {
            let n = unsafe {
                libc::send(
                    fd,
                    data[sent..].as_ptr() as *const libc::c_void,
                    data.len() - sent,
                    libc::MSG_NOSIGNAL,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            sent += n as usize;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let fd = self.fd.load(Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
    }
}

impl Drop for RfcommSocket {
    fn drop(&mut self) {
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_info_name() {
        let info = "[General]\nName=RPP02N\nClass=0x040680\n\n[LinkKey]\nKey=00\n";
        assert_eq!(parse_info_name(info), Some("RPP02N".to_string()));
        assert_eq!(parse_info_name("[LinkKey]\nName=nope\n"), None);
        assert_eq!(parse_info_name("[General]\nName=\n"), None);
    }

    #[test]
    fn test_bonded_devices_from_storage() {
        let root = std::env::temp_dir().join(format!("printer-link-bluez-{}", std::process::id()));
        let device = root.join("00:1A:7D:DA:71:13").join("66:22:B5:0C:3F:01");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("info"), "[General]\nName=MTP-II\n").unwrap();
        let unnamed = root.join("00:1A:7D:DA:71:13").join("66:22:B5:0C:3F:02");
        fs::create_dir_all(&unnamed).unwrap();
        fs::write(unnamed.join("info"), "[General]\nTrusted=true\n").unwrap();
        fs::create_dir_all(root.join("00:1A:7D:DA:71:13").join("cache")).unwrap();

        let adapter = LinuxClassicAdapter::with_storage(1, &root);
        let devices = adapter.bonded_devices().unwrap();
        assert_eq!(
            devices,
            vec![
                BondedDevice {
                    address: "66:22:B5:0C:3F:01".into(),
                    name: Some("MTP-II".into()),
                },
                BondedDevice {
                    address: "66:22:B5:0C:3F:02".into(),
                    name: None,
                },
            ]
        );
        let addr = BluetoothAddress::parse("66:22:B5:0C:3F:01").unwrap();
        assert_eq!(adapter.remote_name(&addr), Some("MTP-II".to_string()));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_unconnected_socket_rejects_io() {
        let socket = RfcommSocket::new(BluetoothAddress::parse("00:11:22:33:44:55").unwrap(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf), Err(LinkError::NotConnected));
        socket.shutdown();
        assert!(socket.connect().is_err());
    }

    #[test]
    fn test_shutdown_before_publish_is_applied() {
        let mut pair = [0; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr()) };
        assert_eq!(ret, 0);
        let socket = RfcommSocket::new(BluetoothAddress::parse("00:11:22:33:44:55").unwrap(), 1);

        // shutdown() ran while no descriptor was published yet
        socket.shutdown();
        assert!(socket.publish(pair[0]).is_err());

        // the local end was shut down, so the peer reads end-of-stream
        let mut buf = [0u8; 1];
        let n = unsafe { libc::recv(pair[1], buf.as_mut_ptr() as *mut libc::c_void, 1, 0) };
        assert_eq!(n, 0);
        unsafe {
            libc::close(pair[1]);
        }
    }
}
