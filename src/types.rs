use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub alarm: AlarmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsConfig {
    /// Key-value parameter file holding the ROI / alarm settings
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    /// Overrides the `api:key` parameter when set
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    /// JSON-lines detection replay; the pipeline idles when unset
    pub replay_path: Option<String>,
    pub frame_interval_ms: u64,
    /// Drop unmatched tracks after 500 ms instead of 30 s
    pub fast_tracker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    pub max_attempts: u32,
    pub retry_interval_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            path: "params.yaml".to_string(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
            api_key: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_width: 720,
            frame_height: 480,
            replay_path: None,
            frame_interval_ms: 100,
            fast_tracker: false,
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval_ms: 2000,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            history_capacity: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "ipc_roi_alarm=info".to_string(),
        }
    }
}

/// Packed RGB8 frame as handed over by the video pipeline.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

impl Frame {
    pub fn blank(width: usize, height: usize, timestamp_ms: f64) -> Self {
        Self {
            data: vec![0; width * height * 3],
            width,
            height,
            timestamp_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.len() < self.width * self.height * 3
    }
}

/// Integer image rectangle. Containment is half-open: `[x, x+width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Edges saturate at `i32::MAX` for rectangles near the end of the range.
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> i64 {
        if self.is_degenerate() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        px >= self.x as f32 && px < self.right() as f32 && py >= self.y as f32 && py < self.bottom() as f32
    }

    /// Overlap of two rectangles; an empty `Rect` when they do not touch.
    pub fn intersection(&self, other: &Rect) -> Rect {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return Rect::default();
        }
        Rect::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
    }

    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = self.intersection(other).area();
        if inter <= 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union > 0 {
            inter as f32 / union as f32
        } else {
            0.0
        }
    }
}

/// One detector output box, edges in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub class_id: i32,
    pub confidence: f32,
}

impl DetectedBox {
    pub fn rect(&self) -> Rect {
        Rect::new(self.left, self.top, self.right - self.left, self.bottom - self.top)
    }
}

/// Display color in BGR order, matching the overlay renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    pub b: u8,
    pub g: u8,
    pub r: u8,
}

impl Color {
    /// Stable pseudo-random color for a seed; each channel lands in [100, 255).
    pub fn from_seed(seed: i32) -> Self {
        let mut state = (seed as i64 as u64).wrapping_mul(123_456).wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (100 + state % 155) as u8
        };
        let b = next();
        let g = next();
        let r = next();
        Self { b, g, r }
    }
}

/// Snapshot of one fired alarm. Shared read-only with every consumer.
#[derive(Debug, Clone)]
pub struct AlarmInfo {
    pub alarm_id: Uuid,
    pub roi_id: i32,
    pub roi_name: String,
    /// -1 when the area is standalone
    pub group_id: i32,
    pub group_name: String,
    pub track_id: u32,
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    pub rect: Rect,
    /// Evidence crop around the object; `None` when the frame was empty
    pub snapshot: Option<Arc<RgbImage>>,
    pub timestamp: DateTime<Utc>,
}
