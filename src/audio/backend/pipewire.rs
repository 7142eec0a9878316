//! PipeWire session backend
//!
//! Output streams are grouped by the executable that owns them, so one
//! process with several streams is still a single volume target. Event
//! sounds (and anything reported by pid 0) form the system sounds target,
//! the default sink is the `master` target.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::wpctl::NativeMixer;
use super::{DefaultOutputTracker, SessionEnumerator};
use crate::audio::target::{
    describe, ReleaseOnce, SessionError, TargetKind, VolumeTarget, MASTER_KEY, SYSTEM_KEY,
    SYSTEM_SOUNDS_PID,
};

/// Process introspection used to name sessions.
pub trait ProcessTable: Send + Sync {
    /// Executable name of `pid`, `Ok(None)` if the process is gone.
    fn executable_name(&self, pid: u32) -> io::Result<Option<String>>;
}

/// [`ProcessTable`] reading `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFs;

impl ProcessTable for ProcFs {
    fn executable_name(&self, pid: u32) -> io::Result<Option<String>> {
        let dir = PathBuf::from("/proc").join(pid.to_string());

        // exe is unreadable for other users' processes, comm is not
        if let Ok(exe) = fs::read_link(dir.join("exe")) {
            if let Some(name) = exe.file_name() {
                let name = name.to_string_lossy();
                return Ok(Some(name.trim_end_matches(" (deleted)").to_string()));
            }
        }

        match fs::read_to_string(dir.join("comm")) {
            Ok(comm) => Ok(Some(comm.trim().to_string()).filter(|name| !name.is_empty())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Last known volume, shared between `&self` reads and writes.
#[derive(Debug)]
struct VolumeCell(AtomicU32);

impl VolumeCell {
    fn new(volume: f32) -> Self {
        Self(AtomicU32::new(volume.to_bits()))
    }

    fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, volume: f32) {
        self.0.store(volume.to_bits(), Ordering::Relaxed);
    }
}

/// A process (or the system sounds group) and the stream nodes it owns.
pub struct StreamSession {
    key: String,
    kind: TargetKind,
    pids: Vec<u32>,
    nodes: Vec<u32>,
    native: Arc<dyn NativeMixer>,
    last_volume: VolumeCell,
    controllable: bool,
    released: ReleaseOnce,
}

impl StreamSession {
    /// Build the session for one stream of process `pid`.
    ///
    /// `binary` is the executable name PipeWire reported for the stream. It
    /// names the session when the process table cannot be read. Fails with
    /// [`SessionError::NoSuchProcess`] if the process exited in the meantime.
    pub fn for_process(
        native: Arc<dyn NativeMixer>,
        processes: &dyn ProcessTable,
        pid: u32,
        node: u32,
        binary: Option<&str>,
    ) -> Result<Self, SessionError> {
        if pid == SYSTEM_SOUNDS_PID {
            return Ok(Self::system_sounds(native, vec![node]));
        }

        let name = match (processes.executable_name(pid), binary) {
            (Ok(Some(name)), _) => name,
            (Ok(None), _) => return Err(SessionError::NoSuchProcess(pid)),
            (Err(e), Some(binary)) if !binary.trim().is_empty() => {
                debug!(pid, binary, error = %e, "Naming session after the stream's binary");
                binary.trim().to_string()
            }
            (Err(e), _) => {
                warn!(pid, error = %e, "Failed to find process name by ID");
                return Err(SessionError::ScanFailed(format!(
                    "find process name for pid {pid}: {e}"
                )));
            }
        };

        let session = Self {
            key: name.to_lowercase(),
            kind: TargetKind::Process,
            pids: vec![pid],
            nodes: vec![node],
            native,
            last_volume: VolumeCell::new(1.0),
            controllable: true,
            released: ReleaseOnce::default(),
        };
        debug!(session = %session.description(), node, "Created audio session");
        Ok(session)
    }

    pub fn system_sounds(native: Arc<dyn NativeMixer>, nodes: Vec<u32>) -> Self {
        Self {
            key: SYSTEM_KEY.to_string(),
            kind: TargetKind::SystemSounds,
            pids: Vec::new(),
            nodes,
            native,
            last_volume: VolumeCell::new(1.0),
            controllable: true,
            released: ReleaseOnce::default(),
        }
    }

    /// Take over the streams of another session with the same key.
    fn absorb(&mut self, mut other: StreamSession) {
        self.nodes.append(&mut other.nodes);
        for pid in other.pids.drain(..) {
            if !self.pids.contains(&pid) {
                self.pids.push(pid);
            }
        }
        // the handles moved over, nothing left to release
        other.released.take();
    }

    fn description(&self) -> String {
        match (self.kind, self.pids.as_slice()) {
            (TargetKind::SystemSounds, _) => "system sounds".to_string(),
            (_, [pid]) => format!("{} (pid {pid})", self.key),
            (_, pids) => {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                format!("{} (pids {})", self.key, pids.join(", "))
            }
        }
    }
}

impl VolumeTarget for StreamSession {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn get_volume(&self) -> f32 {
        let Some(&node) = self.nodes.first() else {
            return self.last_volume.get();
        };

        match self.native.get_volume(node) {
            Ok(volume) => {
                self.last_volume.set(volume);
                volume
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to get session volume");
                self.last_volume.get()
            }
        }
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), SessionError> {
        if self.released.is_released() {
            return Err(SessionError::unsupported(&self.key, "session was released"));
        }
        if !self.controllable {
            return Err(SessionError::NeedsRefresh(self.key.clone()));
        }
        if self.nodes.is_empty() {
            return Err(SessionError::unsupported(&self.key, "no active stream"));
        }

        for &node in &self.nodes {
            self.native.set_volume(node, volume).map_err(|e| {
                warn!(key = %self.key, node, error = %e, "Failed to set session volume");
                SessionError::unsupported(&self.key, e)
            })?;
        }

        // the write may have landed on a session that is about to vanish
        if let Some(&node) = self.nodes.iter().find(|&&n| !self.native.node_exists(n)) {
            warn!(key = %self.key, node, "Audio session expired, triggering session refresh");
            self.controllable = false;
            return Err(SessionError::NeedsRefresh(self.key.clone()));
        }

        self.last_volume.set(volume);
        debug!(key = %self.key, to = %format!("{volume:.2}"), "Adjusting session volume");
        Ok(())
    }

    fn is_controllable(&self) -> bool {
        self.controllable && !self.released.is_released()
    }

    fn release(&mut self) {
        if self.released.take() {
            debug!(key = %self.key, nodes = ?self.nodes, "Releasing audio session");
        }
    }
}

impl fmt::Display for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, &self.description(), self.last_volume.get())
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.released.is_released() {
            warn!(key = %self.key, "Audio session dropped without release");
            self.release();
        }
    }
}

/// The default output device.
pub struct DefaultSink {
    node: u32,
    native: Arc<dyn NativeMixer>,
    stale: Arc<AtomicBool>,
    last_volume: VolumeCell,
    released: ReleaseOnce,
}

impl DefaultSink {
    pub fn new(native: Arc<dyn NativeMixer>, node: u32, stale: Arc<AtomicBool>) -> Self {
        debug!(node, "Created default output session");
        Self {
            node,
            native,
            stale,
            last_volume: VolumeCell::new(1.0),
            released: ReleaseOnce::default(),
        }
    }

    fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn refresh_needed(&self) -> SessionError {
        warn!("Session expired because default device has changed, triggering session refresh");
        SessionError::NeedsRefresh(MASTER_KEY.to_string())
    }
}

impl VolumeTarget for DefaultSink {
    fn key(&self) -> &str {
        MASTER_KEY
    }

    fn kind(&self) -> TargetKind {
        TargetKind::DefaultOutput
    }

    fn get_volume(&self) -> f32 {
        match self.native.get_volume(self.node) {
            Ok(volume) => {
                self.last_volume.set(volume);
                volume
            }
            Err(e) => {
                warn!(node = self.node, error = %e, "Failed to get default output volume");
                self.last_volume.get()
            }
        }
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), SessionError> {
        if self.released.is_released() {
            return Err(SessionError::unsupported(MASTER_KEY, "session was released"));
        }
        if self.is_stale() {
            return Err(self.refresh_needed());
        }

        self.native.set_volume(self.node, volume).map_err(|e| {
            warn!(node = self.node, volume, error = %e, "Failed to set session volume");
            SessionError::unsupported(MASTER_KEY, e)
        })?;

        // the default device may have changed while we were writing
        if self.is_stale() {
            return Err(self.refresh_needed());
        }

        self.last_volume.set(volume);
        debug!(key = MASTER_KEY, to = %format!("{volume:.2}"), "Adjusting session volume");
        Ok(())
    }

    fn is_controllable(&self) -> bool {
        !self.is_stale() && !self.released.is_released()
    }

    fn release(&mut self) {
        if self.released.take() {
            debug!(node = self.node, "Releasing default output session");
        }
    }
}

impl fmt::Display for DefaultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        describe(f, MASTER_KEY, self.last_volume.get())
    }
}

impl Drop for DefaultSink {
    fn drop(&mut self) {
        if !self.released.is_released() {
            warn!("Default output session dropped without release");
            self.release();
        }
    }
}

/// [`SessionEnumerator`] for PipeWire.
pub struct PipeWireBackend {
    native: Arc<dyn NativeMixer>,
    processes: Arc<dyn ProcessTable>,
    defaults: DefaultOutputTracker,
}

impl PipeWireBackend {
    pub fn new(native: Arc<dyn NativeMixer>) -> Self {
        Self::with_process_table(native, Arc::new(ProcFs))
    }

    pub fn with_process_table(
        native: Arc<dyn NativeMixer>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            native,
            processes,
            defaults: DefaultOutputTracker::default(),
        }
    }
}

fn merge_session(sessions: &mut Vec<StreamSession>, session: StreamSession) {
    match sessions.iter_mut().find(|existing| existing.key == session.key) {
        Some(existing) => existing.absorb(session),
        None => sessions.push(session),
    }
}

impl SessionEnumerator for PipeWireBackend {
    fn scan(&self) -> Result<Vec<Box<dyn VolumeTarget>>, SessionError> {
        let streams = self
            .native
            .list_streams()
            .map_err(|e| SessionError::ScanFailed(format!("list audio streams: {e}")))?;
        let sink = self
            .native
            .default_sink()
            .map_err(|e| SessionError::ScanFailed(format!("find default sink: {e}")))?;

        let mut master = DefaultSink::new(self.native.clone(), sink, self.defaults.issue(false));
        let mut sessions = vec![StreamSession::system_sounds(self.native.clone(), Vec::new())];

        for stream in streams {
            if stream.is_event_sound() {
                let system = StreamSession::system_sounds(self.native.clone(), vec![stream.id]);
                merge_session(&mut sessions, system);
                continue;
            }

            let Some(pid) = stream.pid else {
                debug!(node = stream.id, name = ?stream.name, "Skipping stream without process id");
                continue;
            };

            match StreamSession::for_process(
                self.native.clone(),
                &*self.processes,
                pid,
                stream.id,
                stream.binary.as_deref(),
            ) {
                Ok(session) => merge_session(&mut sessions, session),
                Err(SessionError::NoSuchProcess(pid)) => {
                    debug!(pid, "Process already exited, not creating audio session");
                }
                Err(e) => {
                    master.release();
                    sessions.iter_mut().for_each(StreamSession::release);
                    return Err(match e {
                        SessionError::ScanFailed(_) => e,
                        other => SessionError::ScanFailed(other.to_string()),
                    });
                }
            }
        }

        let mut targets: Vec<Box<dyn VolumeTarget>> = Vec::with_capacity(sessions.len() + 1);
        targets.push(Box::new(master));
        targets.extend(
            sessions
                .into_iter()
                .map(|session| Box::new(session) as Box<dyn VolumeTarget>),
        );

        debug!(count = targets.len(), "Enumerated audio sessions");
        Ok(targets)
    }

    fn default_device_id(&self) -> Option<String> {
        self.native.default_sink().ok().map(|id| id.to_string())
    }

    fn default_device_changed(&self) {
        self.defaults.mark_stale();
    }
}
