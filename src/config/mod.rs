//! Configuration
//!
//! Loaded from TOML files layered in order of priority (lowest to highest):
//!
//! 1. `/etc/faderd/config.toml`
//! 2. `$XDG_CONFIG_HOME/faderd/config.toml` (or `~/.config/faderd/config.toml`)
//! 3. `./faderd.toml`
//! 4. the file named by `FADERD_CONFIG`
//!
//! Tables are merged recursively, so a later layer only needs the keys it
//! changes. Missing keys take their defaults. [`ConfigStore`] owns the
//! merged snapshot, re-reads the layers when one of them changes on disk and
//! hands every new snapshot to its subscribers.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toml::map::Entry;
use tracing::{debug, info, warn};

pub mod commands;
pub mod mapping;

pub use crate::telemetry::NoiseReduction;
pub use commands::{CommandSpec, CommandSpecs};
pub use mapping::{default_slider_mapping, ControlMapping};

use crate::audio::BackendKind;

pub const CONFIG_ENV: &str = "FADERD_CONFIG";
const LOCAL_CONFIG: &str = "faderd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Targets driven by each slider.
    pub slider_mapping: ControlMapping,
    /// Commands run on button presses.
    pub commands: CommandSpecs,
    pub invert_sliders: bool,
    pub noise_reduction: NoiseReduction,
    pub backend: BackendKind,
    /// How often the default output device is polled.
    pub watch_interval_ms: u64,
    /// How often the config files are checked for changes.
    pub reload_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slider_mapping: default_slider_mapping(),
            commands: CommandSpecs::new(),
            invert_sliders: false,
            noise_reduction: NoiseReduction::Default,
            backend: BackendKind::default(),
            watch_interval_ms: 2000,
            reload_interval_ms: 2000,
        }
    }
}

impl Config {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(50))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms.max(50))
    }

    /// Merge every existing layer in `sources` over the defaults.
    pub fn load(sources: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged = toml::Value::Table(toml::map::Map::new());

        for path in sources {
            if let Some(layer) = read_layer(path)? {
                merge_value(&mut merged, layer);
                info!(path = %path.display(), "Loaded config layer");
            }
        }

        let config: Config = merged.try_into()?;
        Ok(config)
    }
}

/// Parse one layer. A missing file is not an error.
fn read_layer(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    content
        .parse::<toml::Value>()
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn merge_value(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base_map), toml::Value::Table(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.entry(key) {
                    Entry::Occupied(mut entry) => merge_value(entry.get_mut(), override_value),
                    Entry::Vacant(entry) => {
                        entry.insert(override_value);
                    }
                }
            }
        }
        (base_value, override_value) => {
            *base_value = override_value;
        }
    }
}

fn get_system_config_path() -> PathBuf {
    PathBuf::from("/etc/faderd/config.toml")
}

fn get_user_config_path() -> Option<PathBuf> {
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".config"))
        })?;

    Some(config_dir.join("faderd").join("config.toml"))
}

/// Candidate layer paths, lowest priority first. Files need not exist yet.
pub fn default_sources() -> Vec<PathBuf> {
    let mut sources = vec![get_system_config_path()];
    sources.extend(get_user_config_path());
    sources.push(PathBuf::from(LOCAL_CONFIG));
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        sources.push(PathBuf::from(path));
    }
    sources
}

type Stamps = Vec<Option<SystemTime>>;

fn stamps(sources: &[PathBuf]) -> Stamps {
    sources
        .iter()
        .map(|path| std::fs::metadata(path).and_then(|m| m.modified()).ok())
        .collect()
}

/// Current configuration plus change tracking and reload fan-out.
pub struct ConfigStore {
    sources: Vec<PathBuf>,
    stamps: Stamps,
    current: Arc<Config>,
    subscribers: Vec<Sender<Arc<Config>>>,
}

impl ConfigStore {
    /// Load from the default layer paths. Falls back to the defaults when
    /// the layers cannot be loaded.
    pub fn open() -> Self {
        Self::from_sources(default_sources())
    }

    pub fn from_sources(sources: Vec<PathBuf>) -> Self {
        let stamps = stamps(&sources);
        let config = match Config::load(&sources) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "Falling back to default config");
                Config::default()
            }
        };

        if stamps.iter().all(Option::is_none) {
            warn!("No configuration file found, using default config");
        }
        debug!(mapping = %config.slider_mapping, "Config initialized");

        Self {
            sources,
            stamps,
            current: Arc::new(config),
            subscribers: Vec::new(),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current.clone()
    }

    /// Receive every snapshot installed by a later reload.
    pub fn subscribe(&mut self) -> Receiver<Arc<Config>> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.push(sender);
        receiver
    }

    /// Re-read every layer. On failure the current snapshot stays and
    /// nobody is notified.
    pub fn reload(&mut self) -> Result<Arc<Config>, ConfigError> {
        self.stamps = stamps(&self.sources);
        let config = Arc::new(Config::load(&self.sources)?);

        self.current = config.clone();
        self.subscribers
            .retain(|subscriber| subscriber.send(config.clone()).is_ok());
        info!(
            mapping = %config.slider_mapping,
            commands = config.commands.len(),
            "Config reloaded"
        );
        Ok(config)
    }

    /// Reload if any layer was created, removed or modified since the last
    /// load. Returns the new snapshot when one was installed.
    pub fn reload_if_changed(&mut self) -> Option<Arc<Config>> {
        if stamps(&self.sources) == self.stamps {
            return None;
        }

        match self.reload() {
            Ok(config) => Some(config),
            Err(err) => {
                warn!(error = %err, "Failed to reload config, keeping the current one");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;

    #[test]
    fn defaults_map_master_to_the_first_slider() {
        let config = Config::default();
        assert_eq!(config.slider_mapping.get(0), Some(&["master".to_string()][..]));
        assert_eq!(config.noise_reduction, NoiseReduction::Default);
        assert_eq!(config.backend, BackendKind::Pipewire);
        assert!(config.commands.is_empty());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").expect("Config should deserialize");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn full_file_overrides() {
        let config: Config = toml::from_str(
            r#"
            invert_sliders = true
            noise_reduction = "high"
            backend = "memory"
            watch_interval_ms = 500

            [slider_mapping]
            0 = "master"
            1 = ["chrome", "firefox"]

            [commands]
            0 = "playerctl play-pause"
            "#,
        )
        .expect("Config should deserialize");

        assert!(config.invert_sliders);
        assert_eq!(config.noise_reduction, NoiseReduction::High);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.watch_interval(), Duration::from_millis(500));
        assert_eq!(config.slider_mapping.len(), 2);
        assert_eq!(
            config.commands.get(0),
            Some(&CommandSpec::shell("playerctl play-pause"))
        );
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_with_xdg_config_home() {
        let temp_dir = tempfile::tempdir().unwrap();

        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let path = get_user_config_path();
        assert_eq!(
            path,
            Some(temp_dir.path().join("faderd").join("config.toml"))
        );

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        } else {
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    #[test]
    #[serial]
    fn test_get_user_config_path_falls_back_to_home() {
        let old_xdg = env::var("XDG_CONFIG_HOME").ok();
        let old_home = env::var("HOME").ok();
        env::remove_var("XDG_CONFIG_HOME");
        env::set_var("HOME", "/home/fader");

        assert_eq!(
            get_user_config_path(),
            Some(PathBuf::from("/home/fader/.config/faderd/config.toml"))
        );

        if let Some(old) = old_xdg {
            env::set_var("XDG_CONFIG_HOME", old);
        }
        if let Some(old) = old_home {
            env::set_var("HOME", old);
        } else {
            env::remove_var("HOME");
        }
    }

    #[test]
    #[serial]
    fn env_override_is_the_last_layer() {
        let old = env::var_os(CONFIG_ENV);
        env::set_var(CONFIG_ENV, "/tmp/faderd-override.toml");

        let sources = default_sources();
        assert_eq!(sources.first(), Some(&get_system_config_path()));
        assert_eq!(
            sources.last(),
            Some(&PathBuf::from("/tmp/faderd-override.toml"))
        );

        match old {
            Some(old) => env::set_var(CONFIG_ENV, old),
            None => env::remove_var(CONFIG_ENV),
        }
    }

    #[test]
    fn test_config_merge_priority() {
        let mut base = toml::Value::try_from(Config::default()).expect("default config is valid toml");

        let override_value: toml::Value = r#"
            invert_sliders = true
            noise_reduction = "low"
        "#
        .parse()
        .unwrap();

        merge_value(&mut base, override_value);

        let config: Config = base.try_into().unwrap();
        assert!(config.invert_sliders);
        assert_eq!(config.noise_reduction, NoiseReduction::Low);
        // untouched keys keep their values
        assert_eq!(config.slider_mapping, default_slider_mapping());
    }

    #[test]
    fn layers_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        let missing = dir.path().join("missing.toml");
        fs::write(
            &system,
            "noise_reduction = \"high\"\n[slider_mapping]\n0 = \"master\"\n",
        )
        .unwrap();
        fs::write(&user, "noise_reduction = \"low\"\n[slider_mapping]\n1 = \"vlc\"\n").unwrap();

        let config = Config::load(&[system, missing, user]).unwrap();
        assert_eq!(config.noise_reduction, NoiseReduction::Low);
        assert_eq!(config.slider_mapping.len(), 2);
        assert_eq!(config.slider_mapping.get(1), Some(&["vlc".to_string()][..]));
    }

    #[test]
    fn broken_layer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invert_sliders = ").unwrap();

        assert!(matches!(
            Config::load(&[path.clone()]),
            Err(ConfigError::Parse { .. })
        ));

        // startup falls back to the defaults
        let store = ConfigStore::from_sources(vec![path]);
        assert_eq!(*store.current(), Config::default());
    }

    #[test]
    fn reload_fans_out_to_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faderd.toml");
        fs::write(&path, "[slider_mapping]\n0 = \"master\"\n").unwrap();

        let mut store = ConfigStore::from_sources(vec![path.clone()]);
        let first = store.subscribe();
        let second = store.subscribe();
        assert!(store.reload_if_changed().is_none());

        fs::write(&path, "[slider_mapping]\n0 = \"spotify\"\n").unwrap();
        let reloaded = store.reload().unwrap();

        for receiver in [first, second] {
            let config = receiver.try_recv().unwrap();
            assert_eq!(config.slider_mapping.get(0), Some(&["spotify".to_string()][..]));
        }
        assert_eq!(store.current(), reloaded);
    }

    #[test]
    fn failed_reload_keeps_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faderd.toml");
        fs::write(&path, "invert_sliders = true\n").unwrap();

        let mut store = ConfigStore::from_sources(vec![path.clone()]);
        let updates = store.subscribe();

        fs::write(&path, "invert_sliders = [").unwrap();
        assert!(store.reload().is_err());
        assert!(store.current().invert_sliders);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn new_layer_file_triggers_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faderd.toml");

        let mut store = ConfigStore::from_sources(vec![path.clone()]);
        assert!(store.reload_if_changed().is_none());

        fs::write(&path, "invert_sliders = true\n").unwrap();
        let config = store.reload_if_changed().expect("new file is picked up");
        assert!(config.invert_sliders);
    }
}
