//! Scan session bookkeeping
//! At most one scan runs at a time. Each session gets an id so a session
//! that ends late can never clear the state of a newer one.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::types::DiscoveredDevice;
use crate::core::rt;

/// Why a scan session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    TimedOut,
    Cancelled,
    StreamEnded,
}

struct ActiveScan {
    id: u64,
    cancel: CancellationToken,
}

/// Tracks the single active scan session
#[derive(Default)]
pub struct BluetoothScanner {
    active: Mutex<Option<ActiveScan>>,
    next_id: AtomicU64,
}

impl BluetoothScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the scan slot. Returns `None` if a scan is already running.
    pub fn begin(&self) -> Option<(u64, CancellationToken)> {
        let mut active = self.active.lock().ok()?;
        if active.is_some() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        *active = Some(ActiveScan {
            id,
            cancel: cancel.clone(),
        });
        debug!("Scan session {} started", id);
        Some((id, cancel))
    }

    /// Cancels and releases the active session, if any.
    pub fn cancel(&self) -> bool {
        let taken = match self.active.lock() {
            Ok(mut active) => active.take(),
            Err(_) => None,
        };
        match taken {
            Some(scan) => {
                info!("Cancelling scan session {}", scan.id);
                scan.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Releases the slot if `id` still owns it.
    pub fn finish(&self, id: u64) -> bool {
        let Ok(mut active) = self.active.lock() else {
            return false;
        };
        if active.as_ref().is_some_and(|scan| scan.id == id) {
            *active = None;
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().map(|active| active.is_some()).unwrap_or(false)
    }
}

/// Drains discoveries until the timeout elapses, the session is cancelled or
/// the platform closes the stream.
pub async fn run_scan_session<F>(
    mut discoveries: mpsc::UnboundedReceiver<DiscoveredDevice>,
    cancel: CancellationToken,
    duration: Duration,
    mut on_device: F,
) -> ScanEnd
where
    F: FnMut(DiscoveredDevice),
{
    let timeout = rt::sleep(duration);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            result = discoveries.recv() => match result {
                Some(device) => on_device(device),
                None => {
                    info!("Bluetooth scan stream has ended.");
                    return ScanEnd::StreamEnded;
                }
            },
            _ = &mut timeout => {
                info!("Scan duration of {:?} elapsed", duration);
                return ScanEnd::TimedOut;
            }
            _ = cancel.cancelled() => return ScanEnd::Cancelled,
        }
    }
}
