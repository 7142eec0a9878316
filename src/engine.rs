//! Control engine
//!
//! Glue between the controller and the audio side: telemetry lines are
//! decoded, slider moves go to the [`TargetResolver`], button presses to the
//! [`CommandDispatcher`]. Runs on a single task; only the default device
//! watcher and command launches live on other threads.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audio::{BackendKind, SessionEnumerator, SessionRegistry, TargetResolver};
use crate::commands::{CommandDispatcher, Launcher, ProcessLauncher};
use crate::config::Config;
use crate::telemetry::{ControlEvent, LineDecoder};

pub struct Engine {
    resolver: TargetResolver,
    dispatcher: CommandDispatcher,
    decoder: LineDecoder,
    backend: BackendKind,
}

impl Engine {
    pub fn new(enumerator: Arc<dyn SessionEnumerator>, config: &Config) -> Self {
        Self::with_launcher(enumerator, config, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(
        enumerator: Arc<dyn SessionEnumerator>,
        config: &Config,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(enumerator));
        Self {
            resolver: TargetResolver::new(registry, &config.slider_mapping),
            dispatcher: CommandDispatcher::new(config.commands.clone(), launcher),
            decoder: LineDecoder::new(config.invert_sliders, config.noise_reduction),
            backend: config.backend,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.resolver.registry()
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    /// Decode one telemetry line and act on it.
    pub fn handle_line(&mut self, line: &str) {
        match self.decoder.decode(line) {
            Ok(events) => events.into_iter().for_each(|event| self.handle_event(event)),
            Err(e) => warn!(error = %e, "Dropping malformed telemetry line"),
        }
    }

    pub fn handle_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::Slider { index, value } => {
                if let Err(e) = self.resolver.apply(index, value) {
                    warn!(control = index, error = %e, "Failed to apply slider value");
                }
            }
            ControlEvent::Press { index } => self.dispatcher.trigger(index),
        }
    }

    /// Take over a reloaded configuration.
    pub fn apply_config(&mut self, config: &Config) {
        self.resolver.reload(&config.slider_mapping);
        self.dispatcher.update(config.commands.clone());
        self.decoder
            .configure(config.invert_sliders, config.noise_reduction);

        if config.backend != self.backend {
            info!(
                current = ?self.backend,
                configured = ?config.backend,
                "Audio backend change takes effect after a restart"
            );
        }
        debug!(mapping = %config.slider_mapping, "Engine configuration updated");
    }

    /// Release every held audio session.
    pub fn shutdown(&self) {
        self.registry().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::audio::backend::{MemoryBackend, MemoryMixer};
    use crate::config::{CommandSpec, ControlMapping};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<usize>>);

    impl Launcher for Recorder {
        fn launch(&self, event: usize, _argv: Vec<String>) {
            self.0.lock().unwrap().push(event);
        }
    }

    fn engine(mixer: &MemoryMixer, config: &Config) -> (Engine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let engine = Engine::with_launcher(
            Arc::new(MemoryBackend::new(mixer.clone())),
            config,
            recorder.clone(),
        );
        (engine, recorder)
    }

    #[test]
    fn lines_drive_volumes_and_commands() {
        let mixer = MemoryMixer::default();
        mixer.add_process(10, "spotify", 1.0);

        let mut mapping = ControlMapping::new();
        mapping.set(0, ["master"]);
        mapping.set(1, ["spotify"]);
        let mut config = Config::default();
        config.slider_mapping = mapping;
        config.commands.insert(0, CommandSpec::argv(["true"]));

        let (mut engine, recorder) = engine(&mixer, &config);
        engine.handle_line("512|0");
        engine.handle_line("O:1");

        assert_eq!(mixer.master_volume(), 0.5);
        assert_eq!(mixer.process_volume(10), Some(0.0));
        assert_eq!(*recorder.0.lock().unwrap(), vec![0]);
    }

    #[test]
    fn malformed_lines_are_dropped() {
        let mixer = MemoryMixer::default();
        let (mut engine, _) = engine(&mixer, &Config::default());

        engine.handle_line("12||5");
        engine.handle_line("O:0");
        assert_eq!(mixer.scan_count(), 0);
    }

    #[test]
    fn first_scan_failure_is_logged_not_fatal() {
        let mixer = MemoryMixer::default();
        mixer.fail_next_scans(1);
        let (engine, _) = engine(&mixer, &Config::default());

        engine.handle_event(ControlEvent::Slider { index: 0, value: 0.2 });
        assert_eq!(mixer.master_volume(), 1.0);
        engine.handle_event(ControlEvent::Slider { index: 0, value: 0.2 });
        assert_eq!(mixer.master_volume(), 0.2);
    }

    #[test]
    fn apply_config_swaps_mapping_and_inversion() {
        let mixer = MemoryMixer::default();
        let (mut engine, _) = engine(&mixer, &Config::default());
        engine.handle_line("1023");
        assert_eq!(mixer.master_volume(), 1.0);

        let mut config = Config::default();
        config.invert_sliders = true;
        engine.apply_config(&config);
        engine.handle_line("1023");
        assert_eq!(mixer.master_volume(), 0.0);
    }

    #[test]
    fn shutdown_releases_sessions() {
        let mixer = MemoryMixer::default();
        let (engine, _) = engine(&mixer, &Config::default());
        engine.handle_event(ControlEvent::Slider { index: 0, value: 0.4 });
        assert!(mixer.live_handles() > 0);

        engine.shutdown();
        assert_eq!(mixer.live_handles(), 0);
    }
}
