//! Target resolver
//!
//! Turns `(control, value)` readings into volume changes on every target the
//! control is mapped to. Names are matched leniently: case does not matter,
//! and on platforms that suffix executables (`.exe`) both spellings hit the
//! same target.
//!
//! A `NeedsRefresh` from any target invalidates the registry and the whole
//! control is applied once more. Targets of one control are applied
//! independently of each other, a stale one does not stop the rest.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::registry::SessionRegistry;
use super::target::SessionError;
use crate::config::ControlMapping;

/// Candidate registry keys for one configured name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NameLookup {
    name: String,
    keys: Vec<String>,
}

/// Registry keys a configured target name may be stored under.
pub fn lookup_keys(name: &str, suffix: Option<&str>) -> Vec<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return Vec::new();
    }

    let Some(suffix) = suffix.map(str::to_lowercase) else {
        return vec![name];
    };

    match name.strip_suffix(suffix.as_str()).map(str::to_string) {
        Some(bare) if !bare.is_empty() => vec![name, bare],
        Some(_) => vec![name],
        None => {
            let suffixed = format!("{name}{suffix}");
            vec![name, suffixed]
        }
    }
}

enum Applied {
    Done,
    NotFound,
    Stale,
    Failed(SessionError),
}

pub struct TargetResolver {
    registry: Arc<SessionRegistry>,
    suffix: Option<&'static str>,
    lookups: HashMap<usize, Vec<NameLookup>>,
}

impl TargetResolver {
    pub fn new(registry: Arc<SessionRegistry>, mapping: &ControlMapping) -> Self {
        let suffix = registry.enumerator().executable_suffix();
        let mut resolver = Self {
            registry,
            suffix,
            lookups: HashMap::new(),
        };
        resolver.reload(mapping);
        resolver
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Re-derive the name lookups after a config reload.
    pub fn reload(&mut self, mapping: &ControlMapping) {
        self.lookups = mapping
            .iter()
            .map(|(control, names)| {
                let lookups = names
                    .iter()
                    .map(|name| NameLookup {
                        name: name.clone(),
                        keys: lookup_keys(name, self.suffix),
                    })
                    .filter(|lookup| !lookup.keys.is_empty())
                    .collect();
                (control, lookups)
            })
            .collect();
        debug!(controls = self.lookups.len(), "Derived target lookups");
    }

    /// Drive every target mapped to `control` to `value`.
    ///
    /// Only a failed first scan (nothing cached to fall back on) is returned;
    /// everything else is logged and absorbed here.
    pub fn apply(&self, control: usize, value: f32) -> Result<(), SessionError> {
        let Some(lookups) = self.lookups.get(&control) else {
            trace!(control, "No targets mapped to control");
            return Ok(());
        };
        let value = value.clamp(0.0, 1.0);

        if !self.apply_once(control, lookups, value)? {
            return Ok(());
        }

        info!(control, "Audio sessions are stale, refreshing");
        self.registry.invalidate();

        if self.apply_once(control, lookups, value)? {
            warn!(
                control,
                value, "Audio sessions still stale after refresh, dropping update"
            );
        }
        Ok(())
    }

    /// Returns whether any target asked for a refresh.
    fn apply_once(
        &self,
        control: usize,
        lookups: &[NameLookup],
        value: f32,
    ) -> Result<bool, SessionError> {
        let mut stale = false;

        for lookup in lookups {
            match self.set_volume(lookup, value)? {
                Applied::Done => {}
                Applied::NotFound => {
                    debug!(control, target = %lookup.name, "Target not found, skipping");
                }
                Applied::Stale => stale = true,
                Applied::Failed(e) => {
                    warn!(control, target = %lookup.name, error = %e, "Failed to set target volume");
                }
            }
        }

        Ok(stale)
    }

    fn set_volume(&self, lookup: &NameLookup, value: f32) -> Result<Applied, SessionError> {
        for key in &lookup.keys {
            match self.registry.resolve(key, |target| target.set_volume(value))? {
                Some(Ok(())) => return Ok(Applied::Done),
                Some(Err(SessionError::NeedsRefresh(_))) => return Ok(Applied::Stale),
                Some(Err(e)) => return Ok(Applied::Failed(e)),
                None => continue,
            }
        }
        Ok(Applied::NotFound)
    }

    /// Current volume of the target `name` resolves to, if any.
    pub fn read_volume(&self, name: &str) -> Result<Option<f32>, SessionError> {
        for key in lookup_keys(name, self.suffix) {
            if let Some(volume) = self.registry.resolve(&key, |target| target.get_volume())? {
                return Ok(Some(volume));
            }
        }
        Ok(None)
    }
}
