//! Session registry
//!
//! Cached, keyed view over the last successful scan. The set of targets is
//! only ever replaced as a whole: a rebuild releases every previous target
//! before the new set is installed, and bumps the generation.
//!
//! ```text
//!            invalidate()              resolve()
//!   Fresh  --------------->  Empty  --------------->  RebuildInFlight
//!     ^                                                     |
//!     +---------------------- scan ok / scan failed --------+
//!                             (with a previous generation)
//! ```
//!
//! Rebuilds are single-flight: callers arriving while a scan runs wait for
//! it and are served by its result. Targets never leave the critical
//! section, `resolve` runs the caller's closure on them in place, so nobody
//! can keep a handle past the rebuild that releases it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::backend::SessionEnumerator;
use super::target::{SessionError, VolumeTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Empty,
    Fresh,
    RebuildInFlight,
}

struct Inner {
    state: RegistryState,
    targets: HashMap<String, Box<dyn VolumeTarget>>,
    generation: u64,
    /// An invalidate arrived while the scan was running.
    invalidated_in_flight: bool,
}

pub struct SessionRegistry {
    enumerator: Arc<dyn SessionEnumerator>,
    inner: Mutex<Inner>,
    rebuilt: Condvar,
}

impl SessionRegistry {
    pub fn new(enumerator: Arc<dyn SessionEnumerator>) -> Self {
        Self {
            enumerator,
            inner: Mutex::new(Inner {
                state: RegistryState::Empty,
                targets: HashMap::new(),
                generation: 0,
                invalidated_in_flight: false,
            }),
            rebuilt: Condvar::new(),
        }
    }

    pub fn enumerator(&self) -> &Arc<dyn SessionEnumerator> {
        &self.enumerator
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the target for `key` and run `f` on it.
    ///
    /// Rebuilds first if the registry is empty. Returns `Ok(None)` when no
    /// target has that key. Fails only with [`SessionError::ScanFailed`],
    /// and only when there is no previous generation to fall back on.
    pub fn resolve<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut dyn VolumeTarget) -> R,
    ) -> Result<Option<R>, SessionError> {
        let mut inner = self.lock();

        loop {
            match inner.state {
                RegistryState::Fresh => break,
                RegistryState::RebuildInFlight => {
                    inner = self
                        .rebuilt
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                RegistryState::Empty => {
                    inner = self.rebuild(inner)?;
                    break;
                }
            }
        }

        Ok(inner.targets.get_mut(key).map(|target| f(target.as_mut())))
    }

    /// Mark the cached view stale. Nothing is released here, that happens
    /// right before the next set is installed.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        match inner.state {
            RegistryState::RebuildInFlight => inner.invalidated_in_flight = true,
            _ => inner.state = RegistryState::Empty,
        }
        debug!(generation = inner.generation, "Invalidated audio session registry");
    }

    /// Runs the scan with the lock released, then installs the result.
    fn rebuild<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner>,
    ) -> Result<MutexGuard<'a, Inner>, SessionError> {
        inner.state = RegistryState::RebuildInFlight;
        inner.invalidated_in_flight = false;
        drop(inner);

        let unwinding = RebuildGuard { registry: self };
        let scanned = self.enumerator.scan();
        std::mem::forget(unwinding);

        let mut inner = self.lock();
        let outcome = match scanned {
            Ok(targets) => {
                let previous = std::mem::take(&mut inner.targets);
                release_all(previous.into_values());

                inner.targets = index_targets(targets);
                inner.generation += 1;
                inner.state = if inner.invalidated_in_flight {
                    RegistryState::Empty
                } else {
                    RegistryState::Fresh
                };

                info!(
                    generation = inner.generation,
                    sessions = inner.targets.len(),
                    "Refreshed audio sessions"
                );
                Ok(())
            }
            Err(e) if inner.generation > 0 => {
                warn!(
                    error = %e,
                    generation = inner.generation,
                    "Failed to refresh audio sessions, keeping previous sessions"
                );
                inner.state = RegistryState::Fresh;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to enumerate audio sessions");
                inner.state = RegistryState::Empty;
                Err(e)
            }
        };
        inner.invalidated_in_flight = false;
        self.rebuilt.notify_all();

        outcome.map(|()| inner)
    }

    pub fn state(&self) -> RegistryState {
        self.lock().state
    }

    /// Number of successful rebuilds so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Keys of the currently held targets, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().targets.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Release everything and go back to `Empty`.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        let targets = std::mem::take(&mut inner.targets);
        let count = targets.len();
        release_all(targets.into_values());
        inner.state = RegistryState::Empty;
        debug!(count, "Released audio sessions");
    }
}

/// Puts the registry back to `Empty` if a scan unwinds, so waiters are
/// woken and the next resolve scans again.
struct RebuildGuard<'a> {
    registry: &'a SessionRegistry,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.registry.lock();
        inner.state = RegistryState::Empty;
        inner.invalidated_in_flight = false;
        self.registry.rebuilt.notify_all();
        warn!("Audio session scan panicked");
    }
}

fn index_targets(targets: Vec<Box<dyn VolumeTarget>>) -> HashMap<String, Box<dyn VolumeTarget>> {
    let mut index: HashMap<String, Box<dyn VolumeTarget>> = HashMap::with_capacity(targets.len());
    for mut target in targets {
        if index.contains_key(target.key()) {
            warn!(key = %target.key(), "Duplicate audio session key, keeping the first one");
            target.release();
            continue;
        }
        index.insert(target.key().to_string(), target);
    }
    index
}

fn release_all(targets: impl IntoIterator<Item = Box<dyn VolumeTarget>>) {
    for mut target in targets {
        target.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::audio::backend::{MemoryBackend, MemoryMixer};

    /// Panics on the first scan, then behaves like the wrapped backend.
    struct PanicsOnce {
        backend: MemoryBackend,
        panicked: AtomicBool,
    }

    impl SessionEnumerator for PanicsOnce {
        fn scan(&self) -> Result<Vec<Box<dyn VolumeTarget>>, SessionError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("enumeration blew up");
            }
            self.backend.scan()
        }

        fn default_device_id(&self) -> Option<String> {
            self.backend.default_device_id()
        }

        fn default_device_changed(&self) {
            self.backend.default_device_changed();
        }
    }

    fn registry_with(processes: &[(u32, &str, f32)]) -> (SessionRegistry, MemoryMixer) {
        let mixer = MemoryMixer::default();
        for (pid, name, volume) in processes {
            mixer.add_process(*pid, name, *volume);
        }
        let backend = MemoryBackend::new(mixer.clone());
        (SessionRegistry::new(Arc::new(backend)), mixer)
    }

    #[test]
    fn first_resolve_builds_the_registry() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4)]);
        assert_eq!(registry.state(), RegistryState::Empty);

        let volume = registry.resolve("chrome", |t| t.get_volume()).unwrap();
        assert_eq!(volume, Some(0.4));
        assert_eq!(registry.state(), RegistryState::Fresh);
        assert_eq!(registry.generation(), 1);
        assert_eq!(mixer.scan_count(), 1);
        assert_eq!(registry.keys(), vec!["chrome", "master", "system"]);

        // served from cache
        registry.resolve("master", |_| ()).unwrap();
        assert_eq!(mixer.scan_count(), 1);
    }

    #[test]
    fn unknown_key_is_not_an_error() {
        let (registry, _) = registry_with(&[]);
        assert_eq!(registry.resolve("discord", |_| ()).unwrap(), None);
    }

    #[test]
    fn invalidate_releases_lazily() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4)]);
        registry.resolve("chrome", |_| ()).unwrap();
        assert_eq!(mixer.live_handles(), 3);

        registry.invalidate();
        assert_eq!(registry.state(), RegistryState::Empty);
        assert_eq!(mixer.release_count(), 0);

        registry.resolve("chrome", |_| ()).unwrap();
        assert_eq!(mixer.release_count(), 3);
        assert_eq!(mixer.live_handles(), 3);
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn rebuild_picks_up_new_processes() {
        let (registry, mixer) = registry_with(&[]);
        assert_eq!(registry.resolve("vlc", |_| ()).unwrap(), None);

        mixer.add_process(20, "vlc", 0.1);
        registry.invalidate();
        assert_eq!(registry.resolve("vlc", |t| t.get_volume()).unwrap(), Some(0.1));
    }

    #[test]
    fn concurrent_resolves_share_one_scan() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4)]);
        let registry = Arc::new(registry);
        registry.resolve("chrome", |_| ()).unwrap();
        registry.invalidate();

        let callers = 8;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve("chrome", |t| t.get_volume()).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(0.4));
        }
        assert_eq!(mixer.scan_count(), 2);
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn failed_rebuild_keeps_previous_sessions() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4)]);
        registry.resolve("chrome", |_| ()).unwrap();
        let keys = registry.keys();

        mixer.fail_next_scans(1);
        registry.invalidate();
        let volume = registry.resolve("chrome", |t| t.get_volume()).unwrap();

        assert_eq!(volume, Some(0.4));
        assert_eq!(registry.keys(), keys);
        assert_eq!(registry.generation(), 1);
        assert_eq!(registry.state(), RegistryState::Fresh);
        assert_eq!(mixer.release_count(), 0);
    }

    #[test]
    fn failed_first_scan_is_a_hard_failure() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4)]);
        mixer.fail_next_scans(1);

        assert!(matches!(
            registry.resolve("chrome", |_| ()),
            Err(SessionError::ScanFailed(_))
        ));
        assert_eq!(registry.state(), RegistryState::Empty);

        // next call tries again
        assert_eq!(registry.resolve("chrome", |_| ()).unwrap(), Some(()));
    }

    #[test]
    fn panicking_scan_does_not_wedge_the_registry() {
        let mixer = MemoryMixer::default();
        mixer.add_process(10, "chrome", 0.4);
        let registry = Arc::new(SessionRegistry::new(Arc::new(PanicsOnce {
            backend: MemoryBackend::new(mixer.clone()),
            panicked: AtomicBool::new(false),
        })));

        let first = {
            let registry = registry.clone();
            thread::spawn(move || registry.resolve("chrome", |_| ()))
        };
        assert!(first.join().is_err());
        assert_eq!(registry.state(), RegistryState::Empty);

        let volume = registry.resolve("chrome", |t| t.get_volume()).unwrap();
        assert_eq!(volume, Some(0.4));
        assert_eq!(registry.state(), RegistryState::Fresh);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (registry, mixer) = registry_with(&[(10, "chrome", 0.4), (11, "vlc", 0.2)]);
        registry.resolve("chrome", |_| ()).unwrap();

        registry.shutdown();
        assert_eq!(mixer.live_handles(), 0);
        assert_eq!(mixer.release_count(), 4);
        assert_eq!(registry.state(), RegistryState::Empty);
    }
}
