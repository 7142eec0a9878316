//! Default output device watcher
//!
//! Polls the backend for the identity of the default output device. When it
//! changes, the default output target of the last scan is marked stale and
//! the registry is invalidated, so the next write lands on the new device.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::backend::SessionEnumerator;
use super::registry::SessionRegistry;

/// Change detection for the default output device.
#[derive(Debug, Default)]
pub struct DefaultDeviceMonitor {
    last: Option<String>,
}

impl DefaultDeviceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the current default device once. Returns whether a change was
    /// detected and propagated.
    ///
    /// The first successful poll only records the device. A failed poll
    /// keeps the last known one.
    pub fn poll(&mut self, enumerator: &dyn SessionEnumerator, registry: &SessionRegistry) -> bool {
        let Some(current) = enumerator.default_device_id() else {
            debug!("Default output device unknown, skipping poll");
            return false;
        };

        match self.last.replace(current.clone()) {
            Some(previous) if previous != current => {
                info!(from = %previous, to = %current, "Default output device changed");
                enumerator.default_device_changed();
                registry.invalidate();
                true
            }
            _ => false,
        }
    }
}

/// Background thread running a [`DefaultDeviceMonitor`] at a fixed interval.
pub struct DefaultDeviceWatcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl DefaultDeviceWatcher {
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("default-device-watcher".into())
            .spawn(move || {
                let enumerator = registry.enumerator().clone();
                let mut monitor = DefaultDeviceMonitor::new();
                debug!(interval_ms = interval.as_millis() as u64, "Watching default output device");

                loop {
                    monitor.poll(enumerator.as_ref(), &registry);
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Default output device watcher stopped");
            })?;

        Ok(Self { stop, handle })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Default output device watcher panicked");
        }
    }
}
