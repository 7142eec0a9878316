//! Platform audio backends
//!
//! A backend knows how to enumerate the live audio sessions of the platform
//! and hands them out as [`VolumeTarget`]s. It is picked once at startup; the
//! rest of the engine never branches on the platform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::target::{SessionError, VolumeTarget};

pub mod memory;
pub mod pipewire;
pub mod wpctl;

pub use memory::{MemoryBackend, MemoryMixer};
pub use pipewire::PipeWireBackend;
pub use wpctl::{NativeError, NativeMixer, StreamNode, WpctlMixer};

/// Enumerates the currently active volume targets.
pub trait SessionEnumerator: Send + Sync {
    /// Full native enumeration.
    ///
    /// Sessions whose process already exited are skipped. Any other failure
    /// aborts the scan with [`SessionError::ScanFailed`], after releasing the
    /// targets built so far. The result always contains the default output
    /// and the system sounds targets.
    fn scan(&self) -> Result<Vec<Box<dyn VolumeTarget>>, SessionError>;

    /// Suffix the platform appends to executable names, if any.
    fn executable_suffix(&self) -> Option<&'static str> {
        None
    }

    /// Identity of the current default output device, polled by the
    /// default device watcher.
    fn default_device_id(&self) -> Option<String>;

    /// The OS reported a default-device change: the default output target
    /// handed out by the last scan must refuse further writes.
    fn default_device_changed(&self);
}

/// Which backend to run, from the `backend` config key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Pipewire,
    /// In-process mixer, nothing reaches the OS. Useful for dry runs.
    Memory,
}

pub fn create(kind: BackendKind) -> Arc<dyn SessionEnumerator> {
    match kind {
        BackendKind::Pipewire => {
            info!("Using PipeWire audio backend");
            Arc::new(PipeWireBackend::new(Arc::new(WpctlMixer)))
        }
        BackendKind::Memory => {
            info!("Using in-memory audio backend, volume changes stay in process");
            Arc::new(MemoryBackend::new(MemoryMixer::default()))
        }
    }
}

/// Hands out the stale flag of the current default output target.
///
/// Every scan issues a fresh flag; a default-device change marks the latest
/// one. Flags of earlier generations are left alone, those targets were
/// already discarded.
#[derive(Debug, Clone, Default)]
pub struct DefaultOutputTracker {
    current: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl DefaultOutputTracker {
    pub fn issue(&self, stale: bool) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(stale));
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(flag.clone());
        flag
    }

    pub fn mark_stale(&self) {
        if let Some(flag) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_stale_only_touches_the_latest_flag() {
        let tracker = DefaultOutputTracker::default();
        tracker.mark_stale();

        let first = tracker.issue(false);
        let second = tracker.issue(false);
        tracker.mark_stale();

        assert!(!first.load(Ordering::SeqCst));
        assert!(second.load(Ordering::SeqCst));
    }

    #[test]
    fn backend_kind_reads_lowercase_names() {
        #[derive(Deserialize)]
        struct Holder {
            backend: BackendKind,
        }

        let holder: Holder = toml::from_str(r#"backend = "memory""#).unwrap();
        assert_eq!(holder.backend, BackendKind::Memory);
        assert_eq!(BackendKind::default(), BackendKind::Pipewire);
    }
}
