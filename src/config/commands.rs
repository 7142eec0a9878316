//! Command specs: what runs when a button is pressed.
//!
//! Each entry of the `[commands]` table is keyed by event index and accepts
//! three spellings:
//!
//! ```toml
//! [commands]
//! 0 = "playerctl play-pause"                       # shell line
//! 1 = ["notify-send", "faderd", "button 2"]        # literal argv
//! 2 = { args = "amixer set Capture toggle", shell = false }
//! ```
//!
//! A string with `shell = false` is split with shell-word rules. Entries
//! that fit none of these are dropped with a warning.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub shell: bool,
}

impl CommandSpec {
    /// A line run through the platform shell.
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            args: vec![line.into()],
            shell: true,
        }
    }

    /// A literal argument vector, no shell involved.
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            shell: false,
        }
    }

    /// True when there is nothing to run.
    pub fn is_blank(&self) -> bool {
        self.args.iter().all(|arg| arg.trim().is_empty())
    }

    fn from_value(value: toml::Value) -> Result<Self, String> {
        match value {
            toml::Value::String(line) => Ok(Self::shell(line)),
            toml::Value::Array(items) => Ok(Self::argv(strings(items)?)),
            toml::Value::Table(mut table) => {
                let shell = match table.remove("shell") {
                    None => false,
                    Some(toml::Value::Boolean(shell)) => shell,
                    Some(other) => return Err(format!("`shell` must be a bool, got {other}")),
                };
                let args = match table.remove("args") {
                    Some(toml::Value::String(line)) if shell => vec![line],
                    Some(toml::Value::String(line)) => {
                        shell_words::split(&line).map_err(|e| e.to_string())?
                    }
                    Some(toml::Value::Array(items)) => strings(items)?,
                    Some(other) => return Err(format!("`args` must be a string or list, got {other}")),
                    None => return Err("missing `args`".into()),
                };
                Ok(Self { args, shell })
            }
            other => Err(format!("expected a string, list or table, got {other}")),
        }
    }
}

/// Argument list from a TOML array, trimmed, blank entries dropped.
fn strings(items: Vec<toml::Value>) -> Result<Vec<String>, String> {
    let mut args = Vec::with_capacity(items.len());
    for item in items {
        match item {
            toml::Value::String(s) if s.trim().is_empty() => {}
            toml::Value::String(s) => args.push(s.trim().to_string()),
            other => return Err(format!("expected a string argument, got {other}")),
        }
    }
    Ok(args)
}

/// Command specs by event index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpecs(BTreeMap<usize, CommandSpec>);

impl CommandSpecs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, event: usize, spec: CommandSpec) {
        self.0.insert(event, spec);
    }

    pub fn get(&self, event: usize) -> Option<&CommandSpec> {
        self.0.get(&event)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(usize, CommandSpec)> for CommandSpecs {
    fn from_iter<T: IntoIterator<Item = (usize, CommandSpec)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'de> Deserialize<'de> for CommandSpecs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, toml::Value>::deserialize(deserializer)?;

        let mut specs = CommandSpecs::new();
        for (key, value) in raw {
            let Ok(event) = key.trim().parse::<usize>() else {
                warn!(key = %key, "Ignoring command entry with non-numeric key");
                continue;
            };
            match CommandSpec::from_value(value) {
                Ok(spec) => specs.insert(event, spec),
                Err(reason) => warn!(event, %reason, "Ignoring invalid command entry"),
            }
        }
        Ok(specs)
    }
}

impl Serialize for CommandSpecs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(event, spec)| (event.to_string(), spec)))
    }
}
