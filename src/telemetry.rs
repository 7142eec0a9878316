//! Controller telemetry
//!
//! The controller writes one line per frame over serial:
//!
//! - `512|1023|0|77`: raw slider positions, `0..=1023` each
//! - `O:2`: button 2 was pressed (1-based)
//!
//! Anything else (boot banners, debug prints) is ignored. Slider positions
//! are normalized to `[0, 1]`, optionally inverted, and only reported when
//! they moved further than the configured noise threshold.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, trace};

const MAX_RAW: f32 = 1023.0;
const PRESS_PREFIX: &str = "O:";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlEvent {
    Slider { index: usize, value: f32 },
    Press { index: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TelemetryError {
    #[error("invalid slider value {raw:?} at position {index}")]
    InvalidValue { index: usize, raw: String },
    #[error("slider value {raw} at position {index} is above 1023")]
    OutOfRange { index: usize, raw: u16 },
    #[error("invalid button press {0:?}")]
    InvalidPress(String),
}

/// How far a slider has to move before a change is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseReduction {
    Low,
    #[default]
    Default,
    High,
}

impl NoiseReduction {
    pub fn threshold(self) -> f32 {
        match self {
            NoiseReduction::Low => 0.015,
            NoiseReduction::Default => 0.025,
            NoiseReduction::High => 0.035,
        }
    }
}

/// Stateful decoder for telemetry lines.
#[derive(Debug, Clone, Default)]
pub struct LineDecoder {
    invert: bool,
    noise: NoiseReduction,
    /// Last reported value per slider.
    last: Vec<Option<f32>>,
}

impl LineDecoder {
    pub fn new(invert: bool, noise: NoiseReduction) -> Self {
        Self {
            invert,
            noise,
            last: Vec::new(),
        }
    }

    /// Apply new settings. Every slider is reported again on the next frame.
    pub fn configure(&mut self, invert: bool, noise: NoiseReduction) {
        self.invert = invert;
        self.noise = noise;
        self.last.clear();
    }

    pub fn decode(&mut self, line: &str) -> Result<Vec<ControlEvent>, TelemetryError> {
        let line = line.trim();

        if let Some(press) = line.strip_prefix(PRESS_PREFIX) {
            return match press.trim().parse::<usize>() {
                Ok(number) if number > 0 => Ok(vec![ControlEvent::Press { index: number - 1 }]),
                _ => Err(TelemetryError::InvalidPress(line.to_string())),
            };
        }

        if line.is_empty() || !line.chars().all(|c| c.is_ascii_digit() || c == '|') {
            if !line.is_empty() {
                debug!(line, "Ignoring unrecognized telemetry line");
            }
            return Ok(Vec::new());
        }

        let values = parse_frame(line)?;
        if values.len() != self.last.len() {
            debug!(sliders = values.len(), "Slider count changed");
            self.last = vec![None; values.len()];
        }

        let threshold = self.noise.threshold();
        let mut events = Vec::new();
        for (index, raw) in values.into_iter().enumerate() {
            let mut value = normalize(raw);
            if self.invert {
                value = 1.0 - value;
            }

            let moved = match self.last[index] {
                None => true,
                Some(previous) => significantly_different(previous, value, threshold),
            };
            if moved {
                trace!(index, value, "Slider moved");
                self.last[index] = Some(value);
                events.push(ControlEvent::Slider { index, value });
            }
        }
        Ok(events)
    }
}

/// Splits a telemetry byte stream into lines.
///
/// Bytes that are not valid UTF-8 are replaced rather than failing the
/// read, so a garbled line reaches [`LineDecoder`] and is ignored there.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next line, `None` at end of input. Cancel safe: bytes read by a
    /// cancelled call stay buffered for the next one.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.inner.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Ok(Some(line))
    }
}

fn parse_frame(line: &str) -> Result<Vec<u16>, TelemetryError> {
    line.split('|')
        .enumerate()
        .map(|(index, raw)| {
            let value = raw.parse::<u16>().map_err(|_| TelemetryError::InvalidValue {
                index,
                raw: raw.to_string(),
            })?;
            if f32::from(value) > MAX_RAW {
                return Err(TelemetryError::OutOfRange { index, raw: value });
            }
            Ok(value)
        })
        .collect()
}

/// Raw reading to `[0, 1]`, rounded to two decimals.
fn normalize(raw: u16) -> f32 {
    (f32::from(raw) / MAX_RAW * 100.0).round() / 100.0
}

fn almost_equal(a: f32, b: f32) -> bool {
    (a - b).abs() < 0.000001
}

/// Moves past the threshold always count. Smaller moves count only when
/// they land on an edge, so a slider can always reach exactly 0 or 1.
fn significantly_different(previous: f32, current: f32, threshold: f32) -> bool {
    if (previous - current).abs() >= threshold {
        return true;
    }
    (almost_equal(current, 0.0) || almost_equal(current, 1.0)) && !almost_equal(previous, current)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliders(events: &[ControlEvent]) -> Vec<(usize, f32)> {
        events
            .iter()
            .filter_map(|event| match event {
                ControlEvent::Slider { index, value } => Some((*index, *value)),
                ControlEvent::Press { .. } => None,
            })
            .collect()
    }

    #[test]
    fn first_frame_reports_every_slider() {
        let mut decoder = LineDecoder::default();
        let events = decoder.decode("0|1023|512\r\n").unwrap();
        assert_eq!(sliders(&events), vec![(0, 0.0), (1, 1.0), (2, 0.5)]);
    }

    #[test]
    fn small_moves_are_filtered() {
        let mut decoder = LineDecoder::new(false, NoiseReduction::Default);
        decoder.decode("512").unwrap();

        // 0.50 -> 0.51
        assert!(decoder.decode("522").unwrap().is_empty());
        // 0.50 -> 0.55
        assert_eq!(sliders(&decoder.decode("563").unwrap()), vec![(0, 0.55)]);
    }

    #[test]
    fn edges_are_always_reached() {
        let mut decoder = LineDecoder::new(false, NoiseReduction::High);
        decoder.decode("10").unwrap();
        assert_eq!(sliders(&decoder.decode("0").unwrap()), vec![(0, 0.0)]);
        assert!(decoder.decode("0").unwrap().is_empty());

        decoder.decode("1010").unwrap();
        assert_eq!(sliders(&decoder.decode("1023").unwrap()), vec![(0, 1.0)]);
    }

    #[test]
    fn inverted_sliders() {
        let mut decoder = LineDecoder::new(true, NoiseReduction::Default);
        let events = decoder.decode("0|1023").unwrap();
        assert_eq!(sliders(&events), vec![(0, 1.0), (1, 0.0)]);
    }

    #[test]
    fn button_presses_are_zero_based() {
        let mut decoder = LineDecoder::default();
        assert_eq!(
            decoder.decode("O:2").unwrap(),
            vec![ControlEvent::Press { index: 1 }]
        );
        assert!(matches!(
            decoder.decode("O:0"),
            Err(TelemetryError::InvalidPress(_))
        ));
        assert!(matches!(
            decoder.decode("O:x"),
            Err(TelemetryError::InvalidPress(_))
        ));
    }

    #[test]
    fn malformed_frames_are_errors() {
        let mut decoder = LineDecoder::default();
        assert_eq!(
            decoder.decode("12||5"),
            Err(TelemetryError::InvalidValue {
                index: 1,
                raw: String::new()
            })
        );
        assert_eq!(
            decoder.decode("2048|5"),
            Err(TelemetryError::OutOfRange { index: 0, raw: 2048 })
        );
    }

    #[test]
    fn other_lines_are_ignored() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.decode("=== controller boot (Serial 9600) ===").unwrap().is_empty());
        assert!(decoder.decode("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn garbled_bytes_do_not_end_the_stream() {
        let mut reader = LineReader::new(&b"512\n\xff\xfe garbage\n1023"[..]);
        let mut decoder = LineDecoder::default();

        let mut lines = 0;
        let mut moved = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            lines += 1;
            moved.extend(sliders(&decoder.decode(&line).unwrap()));
        }
        assert_eq!(lines, 3);
        assert_eq!(moved, vec![(0, 0.5), (0, 1.0)]);
    }

    #[test]
    fn slider_count_change_resets_state() {
        let mut decoder = LineDecoder::default();
        decoder.decode("512|512").unwrap();
        let events = decoder.decode("512|512|512").unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn configure_reports_everything_again() {
        let mut decoder = LineDecoder::default();
        decoder.decode("512").unwrap();
        decoder.configure(false, NoiseReduction::Low);
        assert_eq!(decoder.decode("512").unwrap().len(), 1);
    }
}
