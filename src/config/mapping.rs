//! Control mapping: which targets each physical control drives.
//!
//! In the config file the mapping is a table keyed by control index:
//!
//! ```toml
//! [slider_mapping]
//! 0 = "master"
//! 1 = ["chrome", "firefox"]
//! 2 = "discord"
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::audio::target::MASTER_KEY;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlMapping(BTreeMap<usize, Vec<String>>);

impl ControlMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `control` to `targets`, replacing what was there. Blank names
    /// are dropped, duplicates keep their first position.
    pub fn set<I, S>(&mut self, control: usize, targets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = Vec::new();
        for name in targets {
            let name = name.as_ref().trim();
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        self.0.insert(control, names);
    }

    pub fn get(&self, control: usize) -> Option<&[String]> {
        self.0.get(&control).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.0.iter().map(|(control, names)| (*control, names.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub fn default_slider_mapping() -> ControlMapping {
    let mut mapping = ControlMapping::new();
    mapping.set(0, [MASTER_KEY]);
    mapping
}

impl fmt::Display for ControlMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .iter()
            .map(|(control, names)| format!("{control}: [{}]", names.join(", ")))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for ControlMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;

        let mut mapping = ControlMapping::new();
        for (key, targets) in raw {
            let Ok(control) = key.trim().parse::<usize>() else {
                warn!(key = %key, "Ignoring slider mapping entry with non-numeric key");
                continue;
            };
            match targets {
                OneOrMany::One(name) => mapping.set(control, [name]),
                OneOrMany::Many(names) => mapping.set(control, names),
            }
        }
        Ok(mapping)
    }
}

impl Serialize for ControlMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(control, names)| (control.to_string(), names)))
    }
}
