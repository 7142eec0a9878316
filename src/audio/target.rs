//! Volume targets
//!
//! A volume target is one addressable OS-level volume control point:
//! - a process (all audio streams belonging to one executable)
//! - the default output device (`master`)
//! - the system sounds group (`system`)
//!
//! Every target exclusively owns its native handle. Handles are released
//! explicitly through [`VolumeTarget::release`], which must be idempotent.

use std::fmt;

use thiserror::Error;

/// Reserved key of the default output device.
pub const MASTER_KEY: &str = "master";

/// Reserved key of the system sounds group.
pub const SYSTEM_KEY: &str = "system";

/// Native process id reserved for the system sounds session.
pub const SYSTEM_SOUNDS_PID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Process,
    DefaultOutput,
    SystemSounds,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Process => write!(f, "process"),
            TargetKind::DefaultOutput => write!(f, "default output"),
            TargetKind::SystemSounds => write!(f, "system sounds"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// The process behind a session exited while it was being enumerated.
    #[error("no such process (pid {0})")]
    NoSuchProcess(u32),
    /// The native layer refused the operation for this target.
    #[error("{key}: volume change not supported: {reason}")]
    Unsupported { key: String, reason: String },
    /// The whole cached session view is stale, not just this write.
    #[error("{0}: audio sessions are stale, refresh required")]
    NeedsRefresh(String),
    #[error("audio session scan failed: {0}")]
    ScanFailed(String),
}

impl SessionError {
    pub fn unsupported(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        SessionError::Unsupported {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// One unit of controllable volume.
///
/// Implementations never log-and-panic: read failures fall back to the last
/// known value, write failures come back as [`SessionError`].
pub trait VolumeTarget: Send + fmt::Display {
    /// Lowercase process name, [`MASTER_KEY`] or [`SYSTEM_KEY`].
    fn key(&self) -> &str;

    fn kind(&self) -> TargetKind;

    /// Current volume in `[0, 1]`, best effort.
    fn get_volume(&self) -> f32;

    /// Set the volume, `volume` in `[0, 1]`.
    ///
    /// Returns [`SessionError::NeedsRefresh`] when the registry this target
    /// came from has to be rebuilt. For process targets this can happen even
    /// though the write itself went through.
    fn set_volume(&mut self, volume: f32) -> Result<(), SessionError>;

    /// `false` once the target is known to be stale. Never flips back.
    fn is_controllable(&self) -> bool;

    /// Release the native handle. Calling it twice is a no-op.
    fn release(&mut self);
}

/// Release bookkeeping shared by the backends.
///
/// `take` returns `true` exactly once, the first time it is called.
#[derive(Debug, Default)]
pub(crate) struct ReleaseOnce {
    released: bool,
}

impl ReleaseOnce {
    pub(crate) fn take(&mut self) -> bool {
        !std::mem::replace(&mut self.released, true)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }
}

/// Shared `Display` format for targets: `chrome (volume: 0.40)`.
pub(crate) fn describe(
    f: &mut fmt::Formatter<'_>,
    description: &str,
    volume: f32,
) -> fmt::Result {
    write!(f, "{description} (volume: {volume:.2})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_once_only_fires_the_first_time() {
        let mut release = ReleaseOnce::default();
        assert!(!release.is_released());
        assert!(release.take());
        assert!(!release.take());
        assert!(release.is_released());
    }

    #[test]
    fn errors_name_the_target() {
        let err = SessionError::unsupported("chrome", "node refused write");
        assert_eq!(
            err.to_string(),
            "chrome: volume change not supported: node refused write"
        );
        assert_eq!(
            SessionError::NeedsRefresh("master".into()).to_string(),
            "master: audio sessions are stale, refresh required"
        );
    }
}
