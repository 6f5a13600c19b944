//! In-memory platform backends for tests and demos.
//!
//! Each double records what the transports asked of it and exposes hooks to
//! play the remote side: push inbound bytes, emit GATT callbacks, grant or
//! deny USB access, detach devices.

mod ble;
mod classic;
mod usb;

pub use ble::{notifiable_characteristic, GattOp, MockBleCentral, MockGattClient};
pub use classic::{MockClassicAdapter, MockRfcomm};
pub use usb::{bulk_interface, usb_printer, MockUsbHost};

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Poll `condition` on the real clock until it holds, panicking after ~5 s.
///
/// Not for tests running with a paused clock.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
