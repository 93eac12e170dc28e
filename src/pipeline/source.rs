// src/pipeline/source.rs
//
// Frame + detection sources feeding the ROI engine.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

use crate::types::{DetectedBox, Frame};

/// One processed video frame together with the detector's output for it.
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub frame: Frame,
    pub detections: Vec<DetectedBox>,
}

pub trait DetectionSource: Send {
    /// Next frame, or `None` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<FrameInput>>;
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    #[serde(default)]
    timestamp_ms: Option<f64>,
    #[serde(default)]
    detections: Vec<DetectedBox>,
}

/// Replays recorded detections, one JSON object per line, against blank
/// frames of a fixed size.
pub struct JsonlReplaySource<R: BufRead> {
    lines: std::io::Lines<R>,
    width: usize,
    height: usize,
    interval_ms: f64,
    line_no: usize,
    frame_count: u64,
}

impl JsonlReplaySource<BufReader<File>> {
    pub fn open(path: &Path, width: usize, height: usize, interval_ms: u64) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open detection replay {}", path.display()))?;
        info!("Replaying detections from {}", path.display());
        Ok(Self::from_reader(BufReader::new(file), width, height, interval_ms))
    }
}

impl<R: BufRead> JsonlReplaySource<R> {
    pub fn from_reader(reader: R, width: usize, height: usize, interval_ms: u64) -> Self {
        Self {
            lines: reader.lines(),
            width,
            height,
            interval_ms: interval_ms as f64,
            line_no: 0,
            frame_count: 0,
        }
    }

    #[cfg(test)]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl<R: BufRead + Send> DetectionSource for JsonlReplaySource<R> {
    fn next_frame(&mut self) -> Result<Option<FrameInput>> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line = line.with_context(|| format!("Failed to read replay line {}", self.line_no))?;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: ReplayLine = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Skipping malformed replay line {}: {}", self.line_no, e);
                    continue;
                }
            };

            let timestamp_ms = parsed
                .timestamp_ms
                .unwrap_or(self.frame_count as f64 * self.interval_ms);
            self.frame_count += 1;

            return Ok(Some(FrameInput {
                frame: Frame::blank(self.width, self.height, timestamp_ms),
                detections: parsed.detections,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_replays_lines_and_skips_garbage() {
        let data = r#"{"detections":[{"left":150,"top":150,"right":200,"bottom":200,"class_id":0,"confidence":0.9}]}

not json
{"timestamp_ms": 500.0, "detections": []}
"#;
        let mut source = JsonlReplaySource::from_reader(Cursor::new(data), 64, 48, 100);

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.detections.len(), 1);
        assert_eq!(first.detections[0].class_id, 0);
        assert_eq!(first.frame.width, 64);
        assert_eq!(first.frame.timestamp_ms, 0.0);

        let second = source.next_frame().unwrap().unwrap();
        assert!(second.detections.is_empty());
        assert_eq!(second.frame.timestamp_ms, 500.0);

        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.frame_count(), 2);
    }
}
