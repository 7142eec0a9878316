//! Native PipeWire access through the WirePlumber command line tools
//!
//! - `pw-dump` lists the audio output streams
//! - `wpctl inspect` resolves the default sink and checks node lifetime
//! - `wpctl get-volume` / `wpctl set-volume` read and write node volumes
//!
//! The PipeWire targets only talk to the [`NativeMixer`] trait, so their
//! lifecycle handling can be exercised without a running PipeWire daemon.

use std::process::Command;

use serde_json::Value;
use thiserror::Error;
use tracing::trace;

const PW_DUMP: &str = "pw-dump";
const WPCTL: &str = "wpctl";
const DEFAULT_SINK: &str = "@DEFAULT_AUDIO_SINK@";
const OUTPUT_STREAM_CLASS: &str = "Stream/Output/Audio";
const NODE_TYPE: &str = "PipeWire:Interface:Node";

#[derive(Debug, Error)]
pub enum NativeError {
    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed: {stderr}")]
    Failed { tool: &'static str, stderr: String },
    #[error("unexpected {tool} output: {detail}")]
    Parse { tool: &'static str, detail: String },
}

/// An audio output stream as reported by PipeWire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNode {
    pub id: u32,
    pub pid: Option<u32>,
    pub binary: Option<String>,
    pub role: Option<String>,
    pub name: Option<String>,
}

impl StreamNode {
    /// Notification and event sounds, filed under the system sounds group.
    pub fn is_event_sound(&self) -> bool {
        self.role
            .as_deref()
            .is_some_and(|role| role.eq_ignore_ascii_case("event"))
    }
}

/// Native operations the PipeWire backend needs.
pub trait NativeMixer: Send + Sync {
    fn list_streams(&self) -> Result<Vec<StreamNode>, NativeError>;
    fn default_sink(&self) -> Result<u32, NativeError>;
    fn get_volume(&self, node: u32) -> Result<f32, NativeError>;
    fn set_volume(&self, node: u32, volume: f32) -> Result<(), NativeError>;
    /// Whether the node is still registered with the daemon.
    fn node_exists(&self, node: u32) -> bool;
}

/// [`NativeMixer`] driving `pw-dump` and `wpctl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WpctlMixer;

impl NativeMixer for WpctlMixer {
    fn list_streams(&self) -> Result<Vec<StreamNode>, NativeError> {
        let stdout = run(PW_DUMP, &[])?;
        parse_dump(&stdout)
    }

    fn default_sink(&self) -> Result<u32, NativeError> {
        let stdout = run(WPCTL, &["inspect", DEFAULT_SINK])?;
        parse_inspect_id(&stdout)
    }

    fn get_volume(&self, node: u32) -> Result<f32, NativeError> {
        let stdout = run(WPCTL, &["get-volume", &node.to_string()])?;
        parse_volume(&stdout)
    }

    fn set_volume(&self, node: u32, volume: f32) -> Result<(), NativeError> {
        let volume = format!("{:.4}", volume.clamp(0.0, 1.0));
        run(WPCTL, &["set-volume", &node.to_string(), &volume])?;
        trace!(node, %volume, "Volume set via wpctl");
        Ok(())
    }

    fn node_exists(&self, node: u32) -> bool {
        Command::new(WPCTL)
            .args(["inspect", &node.to_string()])
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }
}

fn run(tool: &'static str, args: &[&str]) -> Result<String, NativeError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|source| NativeError::Spawn { tool, source })?;

    if !output.status.success() {
        return Err(NativeError::Failed {
            tool,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract audio output streams from `pw-dump` JSON.
pub fn parse_dump(json: &str) -> Result<Vec<StreamNode>, NativeError> {
    let objects: Vec<Value> = serde_json::from_str(json).map_err(|e| NativeError::Parse {
        tool: PW_DUMP,
        detail: e.to_string(),
    })?;

    let streams = objects
        .iter()
        .filter(|object| object.get("type").and_then(Value::as_str) == Some(NODE_TYPE))
        .filter_map(|object| {
            let id = object.get("id").and_then(Value::as_u64)?;
            let props = object.get("info")?.get("props")?;
            if props.get("media.class").and_then(Value::as_str) != Some(OUTPUT_STREAM_CLASS) {
                return None;
            }

            Some(StreamNode {
                id: u32::try_from(id).ok()?,
                pid: props.get("application.process.id").and_then(as_u32),
                binary: string_prop(props, "application.process.binary"),
                role: string_prop(props, "media.role"),
                name: string_prop(props, "node.name"),
            })
        })
        .collect();

    Ok(streams)
}

// pw-dump reports process ids either as numbers or as strings
fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_prop(props: &Value, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Parse the node id from the first line of `wpctl inspect`,
/// e.g. `id 47, type PipeWire:Interface:Node`.
pub fn parse_inspect_id(output: &str) -> Result<u32, NativeError> {
    let parse_error = || NativeError::Parse {
        tool: WPCTL,
        detail: format!("no node id in {:?}", output.lines().next().unwrap_or("")),
    };

    output
        .lines()
        .next()
        .and_then(|line| line.trim().strip_prefix("id "))
        .and_then(|rest| rest.split(',').next())
        .and_then(|id| id.trim().parse().ok())
        .ok_or_else(parse_error)
}

/// Parse `wpctl get-volume` output, e.g. `Volume: 0.40 [MUTED]`.
pub fn parse_volume(output: &str) -> Result<f32, NativeError> {
    output
        .trim()
        .strip_prefix("Volume:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<f32>().ok())
        .map(|value| value.clamp(0.0, 1.0))
        .ok_or_else(|| NativeError::Parse {
            tool: WPCTL,
            detail: format!("no volume in {:?}", output.trim()),
        })
}
