//! In-process audio backend
//!
//! [`MemoryMixer`] models the native side: processes, their sessions, the
//! default output and the system sounds group. [`MemoryBackend`] enumerates
//! it like a real platform would. Every handed-out target holds a handle
//! counted by the mixer, which makes leaked or double releases observable.
//!
//! Used by the `memory` backend for dry runs, and by the tests.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::{DefaultOutputTracker, SessionEnumerator};
use crate::audio::target::{
    describe, ReleaseOnce, SessionError, TargetKind, VolumeTarget, MASTER_KEY, SYSTEM_KEY,
    SYSTEM_SOUNDS_PID,
};

#[derive(Debug, Clone)]
struct MemorySession {
    pid: u32,
    name: String,
    volume: f32,
    expired: bool,
}

#[derive(Debug)]
struct MixerState {
    master: f32,
    system: f32,
    sessions: Vec<MemorySession>,
    /// Pids still listed by the session manager whose process is gone.
    exited: HashSet<u32>,
    refused: HashSet<String>,
    default_device: u32,
    pin_default_stale: bool,
    failing_scans: usize,
    scans: usize,
    live_handles: usize,
    releases: usize,
    suffix: Option<&'static str>,
}

impl Default for MixerState {
    fn default() -> Self {
        Self {
            master: 1.0,
            system: 1.0,
            sessions: Vec::new(),
            exited: HashSet::new(),
            refused: HashSet::new(),
            default_device: 1,
            pin_default_stale: false,
            failing_scans: 0,
            scans: 0,
            live_handles: 0,
            releases: 0,
            suffix: None,
        }
    }
}

/// Shared handle to the simulated native audio state.
#[derive(Debug, Clone, Default)]
pub struct MemoryMixer {
    state: Arc<Mutex<MixerState>>,
}

impl MemoryMixer {
    fn lock(&self) -> MutexGuard<'_, MixerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name executables the way a platform with `suffix` does, e.g. `.exe`.
    pub fn with_executable_suffix(self, suffix: &'static str) -> Self {
        self.lock().suffix = Some(suffix);
        self
    }

    /// Start an audio session for process `pid`. The name is stored as
    /// given, plus the executable suffix if one is configured.
    pub fn add_process(&self, pid: u32, name: &str, volume: f32) {
        let mut state = self.lock();
        let name = match state.suffix {
            Some(suffix) if !name.to_lowercase().ends_with(suffix) => format!("{name}{suffix}"),
            _ => name.to_string(),
        };
        state.sessions.push(MemorySession {
            pid,
            name,
            volume,
            expired: false,
        });
    }

    /// Expire the session: writes through existing targets still land but
    /// report the expiry, and scans no longer list it.
    pub fn expire_session(&self, pid: u32) {
        if let Some(session) = self.lock().sessions.iter_mut().find(|s| s.pid == pid) {
            session.expired = true;
        }
    }

    /// The session stays listed but its process is gone, so enumeration
    /// cannot name it.
    pub fn exit_process(&self, pid: u32) {
        self.lock().exited.insert(pid);
    }

    /// Make writes to `key` fail as if the native layer refused them.
    pub fn refuse_writes(&self, key: &str) {
        self.lock().refused.insert(key.to_string());
    }

    /// The next `count` scans fail.
    pub fn fail_next_scans(&self, count: usize) {
        self.lock().failing_scans = count;
    }

    /// Default output targets built from now on are stale from the start.
    pub fn pin_default_stale(&self, pinned: bool) {
        self.lock().pin_default_stale = pinned;
    }

    /// Switch to another default output device.
    pub fn switch_default_device(&self) {
        self.lock().default_device += 1;
    }

    pub fn master_volume(&self) -> f32 {
        self.lock().master
    }

    pub fn system_volume(&self) -> f32 {
        self.lock().system
    }

    pub fn process_volume(&self, pid: u32) -> Option<f32> {
        self.lock()
            .sessions
            .iter()
            .find(|s| s.pid == pid)
            .map(|s| s.volume)
    }

    pub fn scan_count(&self) -> usize {
        self.lock().scans
    }

    /// Handles currently held by targets.
    pub fn live_handles(&self) -> usize {
        self.lock().live_handles
    }

    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    fn acquire(&self) {
        self.lock().live_handles += 1;
    }

    /// Name of the process owning session `pid`, `None` once it exited.
    fn process_name(&self, pid: u32) -> Option<String> {
        let state = self.lock();
        if state.exited.contains(&pid) {
            return None;
        }
        state
            .sessions
            .iter()
            .find(|s| s.pid == pid)
            .map(|s| s.name.clone())
    }
}

/// Native address of a memory target.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Handle {
    Master,
    System,
    /// Every process sharing one executable name.
    Processes(Vec<u32>),
}

pub struct MemoryTarget {
    key: String,
    description: String,
    handle: Handle,
    mixer: MemoryMixer,
    stale: Option<Arc<AtomicBool>>,
    controllable: bool,
    released: ReleaseOnce,
}

impl MemoryTarget {
    fn new(mixer: &MemoryMixer, key: String, description: String, handle: Handle) -> Self {
        mixer.acquire();
        Self {
            key,
            description,
            handle,
            mixer: mixer.clone(),
            stale: None,
            controllable: true,
            released: ReleaseOnce::default(),
        }
    }

    fn master(mixer: &MemoryMixer, stale: Arc<AtomicBool>) -> Self {
        let mut target = Self::new(mixer, MASTER_KEY.into(), MASTER_KEY.into(), Handle::Master);
        target.stale = Some(stale);
        target
    }

    fn system(mixer: &MemoryMixer) -> Self {
        Self::new(mixer, SYSTEM_KEY.into(), "system sounds".into(), Handle::System)
    }

    /// One target for all of `pids`, which share the executable `name`.
    fn processes(mixer: &MemoryMixer, name: &str, pids: Vec<u32>) -> Self {
        let description = match pids.as_slice() {
            [pid] => format!("{name} (pid {pid})"),
            pids => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                format!("{name} (pids {})", pids.join(", "))
            }
        };
        Self::new(mixer, name.to_lowercase(), description, Handle::Processes(pids))
    }

    fn is_stale(&self) -> bool {
        self.stale
            .as_ref()
            .is_some_and(|stale| stale.load(Ordering::SeqCst))
    }

    fn kind_of(handle: &Handle) -> TargetKind {
        match handle {
            Handle::Master => TargetKind::DefaultOutput,
            Handle::System => TargetKind::SystemSounds,
            Handle::Processes(_) => TargetKind::Process,
        }
    }
}

impl VolumeTarget for MemoryTarget {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TargetKind {
        Self::kind_of(&self.handle)
    }

    fn get_volume(&self) -> f32 {
        let state = self.mixer.lock();
        match &self.handle {
            Handle::Master => state.master,
            Handle::System => state.system,
            Handle::Processes(pids) => state
                .sessions
                .iter()
                .find(|s| pids.contains(&s.pid))
                .map(|s| s.volume)
                .unwrap_or_else(|| {
                    warn!(key = %self.key, "Failed to get session volume");
                    0.0
                }),
        }
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), SessionError> {
        if self.released.is_released() {
            return Err(SessionError::unsupported(&self.key, "session was released"));
        }
        if !self.controllable || self.is_stale() {
            return Err(SessionError::NeedsRefresh(self.key.clone()));
        }

        let mut state = self.mixer.lock();
        if state.refused.contains(&self.key) {
            return Err(SessionError::unsupported(&self.key, "write refused"));
        }

        match &self.handle {
            Handle::Master => state.master = volume,
            Handle::System => state.system = volume,
            Handle::Processes(pids) => {
                let mut written = 0;
                let mut expired = false;
                for session in state.sessions.iter_mut().filter(|s| pids.contains(&s.pid)) {
                    session.volume = volume;
                    written += 1;
                    expired |= session.expired;
                }
                if written == 0 {
                    return Err(SessionError::unsupported(&self.key, "session is gone"));
                }
                if expired {
                    self.controllable = false;
                    return Err(SessionError::NeedsRefresh(self.key.clone()));
                }
            }
        }
        drop(state);

        if self.is_stale() {
            return Err(SessionError::NeedsRefresh(self.key.clone()));
        }

        debug!(key = %self.key, to = %format!("{volume:.2}"), "Adjusting session volume");
        Ok(())
    }

    fn is_controllable(&self) -> bool {
        self.controllable && !self.is_stale() && !self.released.is_released()
    }

    fn release(&mut self) {
        if self.released.take() {
            let mut state = self.mixer.lock();
            state.live_handles = state.live_handles.saturating_sub(1);
            state.releases += 1;
        }
    }
}

impl fmt::Display for MemoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, &self.description, self.get_volume())
    }
}

impl Drop for MemoryTarget {
    fn drop(&mut self) {
        if !self.released.is_released() {
            warn!(key = %self.key, "Audio session dropped without release");
            self.release();
        }
    }
}

/// [`SessionEnumerator`] over a [`MemoryMixer`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    mixer: MemoryMixer,
    defaults: DefaultOutputTracker,
}

impl MemoryBackend {
    pub fn new(mixer: MemoryMixer) -> Self {
        Self {
            mixer,
            defaults: DefaultOutputTracker::default(),
        }
    }

    pub fn mixer(&self) -> &MemoryMixer {
        &self.mixer
    }
}

impl SessionEnumerator for MemoryBackend {
    fn scan(&self) -> Result<Vec<Box<dyn VolumeTarget>>, SessionError> {
        let (pids, stale) = {
            let mut state = self.mixer.lock();
            state.scans += 1;
            if state.failing_scans > 0 {
                state.failing_scans -= 1;
                return Err(SessionError::ScanFailed("simulated enumeration failure".into()));
            }
            let pids: Vec<u32> = state
                .sessions
                .iter()
                .filter(|s| !s.expired)
                .map(|s| s.pid)
                .collect();
            (pids, state.pin_default_stale)
        };

        let mut targets: Vec<Box<dyn VolumeTarget>> = vec![
            Box::new(MemoryTarget::master(&self.mixer, self.defaults.issue(stale))),
            Box::new(MemoryTarget::system(&self.mixer)),
        ];

        // processes sharing an executable name are one target
        let mut groups: Vec<(String, Vec<u32>)> = Vec::new();
        for pid in pids {
            // already covered by the system target
            if pid == SYSTEM_SOUNDS_PID {
                continue;
            }
            let Some(name) = self.mixer.process_name(pid) else {
                debug!(pid, "Process already exited, not creating audio session");
                continue;
            };
            match groups
                .iter_mut()
                .find(|(existing, _)| existing.to_lowercase() == name.to_lowercase())
            {
                Some((_, group)) => group.push(pid),
                None => groups.push((name, vec![pid])),
            }
        }

        targets.extend(groups.into_iter().map(|(name, pids)| {
            Box::new(MemoryTarget::processes(&self.mixer, &name, pids)) as Box<dyn VolumeTarget>
        }));
        Ok(targets)
    }

    fn executable_suffix(&self) -> Option<&'static str> {
        self.mixer.lock().suffix
    }

    fn default_device_id(&self) -> Option<String> {
        Some(self.mixer.lock().default_device.to_string())
    }

    fn default_device_changed(&self) {
        self.defaults.mark_stale();
    }
}
