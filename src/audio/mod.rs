//! Audio session synchronization
//!
//! Keeps a consistent view of the controllable volume targets of the
//! platform while applications come and go:
//!
//! - [`target`]: the volume target abstraction and its errors
//! - [`backend`]: platform enumeration (PipeWire, in-memory)
//! - [`registry`]: cached, generation-counted set of targets
//! - [`resolver`]: "set volume by name" on top of the registry
//! - [`watcher`]: default output device change detection

pub mod backend;
pub mod registry;
pub mod resolver;
pub mod target;
pub mod watcher;

pub use backend::{BackendKind, SessionEnumerator};
pub use registry::{RegistryState, SessionRegistry};
pub use resolver::TargetResolver;
pub use target::{SessionError, TargetKind, VolumeTarget, MASTER_KEY, SYSTEM_KEY};
pub use watcher::{DefaultDeviceMonitor, DefaultDeviceWatcher};
