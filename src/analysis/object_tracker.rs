// src/analysis/object_tracker.rs
//
// IoU-based multi-object tracker feeding the ROI engine.
//
// Design:
//   - Global greedy IoU assignment: every (track, detection) pair of the
//     same class is scored, pairs are taken best-IoU-first, and a track or
//     detection is consumed by its first accepted pair
//   - No motion model; a track keeps its last box until re-matched
//   - Unmatched tracks go Lost and stay matchable until the retention
//     window expires, then they are dropped
//   - Track ids come from a monotonic counter and are never reused

use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::Rect;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Minimum IoU between a held track and a detection to associate them
    pub min_iou: f32,
    /// Minimum confidence for an unmatched detection to open a new track
    pub min_create_confidence: f32,
    /// How long a track survives without a matching detection
    pub retention: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.3,
            min_create_confidence: 0.25,
            retention: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    /// Presence-filter profile: tracks vanish half a second after their
    /// last detection.
    pub fn fast() -> Self {
        Self {
            retention: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// Input detection, already converted to a rectangle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionInput {
    pub rect: Rect,
    pub class_id: i32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tracked,
    Lost,
}

/// Per-frame view of a track handed back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub track_id: u32,
    pub class_id: i32,
    pub rect: Rect,
    pub confidence: f32,
    pub state: TrackState,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    rect: Rect,
    class_id: i32,
    confidence: f32,
    state: TrackState,
    last_seen: Instant,
}

impl Track {
    fn new(id: u32, det: &DetectionInput, now: Instant) -> Self {
        Self {
            id,
            rect: det.rect,
            class_id: det.class_id,
            confidence: det.confidence,
            state: TrackState::Tracked,
            last_seen: now,
        }
    }

    fn update_with_detection(&mut self, det: &DetectionInput, now: Instant) {
        self.rect = det.rect;
        self.confidence = det.confidence;
        self.class_id = det.class_id;
        self.last_seen = now;
        self.state = TrackState::Tracked;
    }

    fn mark_missed(&mut self) {
        self.state = TrackState::Lost;
    }

    fn view(&self) -> TrackedObject {
        TrackedObject {
            track_id: self.id,
            class_id: self.class_id,
            rect: self.rect,
            confidence: self.confidence,
            state: self.state,
            last_seen: self.last_seen,
        }
    }
}

// ============================================================================
// MAIN TRACKER
// ============================================================================

pub struct ObjectTracker {
    pub config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    /// Process one frame of detections. Returns one tracked object per
    /// accepted detection, in input order.
    pub fn update(&mut self, detections: &[DetectionInput], now: Instant) -> Vec<TrackedObject> {
        // ════════════════════════════════════════════════════════════════════
        // PHASE 0: RETENTION
        // ════════════════════════════════════════════════════════════════════
        let retention = self.config.retention;
        self.tracks.retain(|t| {
            if now.saturating_duration_since(t.last_seen) > retention {
                debug!("🗑️  Track {} removed (unseen for {:?})", t.id, retention);
                return false;
            }
            true
        });

        // Degenerate boxes would divide by zero inside IoU.
        let valid: Vec<&DetectionInput> = detections
            .iter()
            .filter(|d| !d.rect.is_degenerate())
            .collect();

        // ════════════════════════════════════════════════════════════════════
        // PHASE 1: SAME-CLASS IoU PAIRS, BEST FIRST
        // ════════════════════════════════════════════════════════════════════
        let mut matched_track_indices: Vec<bool> = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<usize>> = vec![None; valid.len()];

        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in valid.iter().enumerate() {
                if track.class_id != det.class_id {
                    continue;
                }
                let score = track.rect.iou(&det.rect);
                if score >= self.config.min_iou {
                    iou_pairs.push((ti, di, score));
                }
            }
        }
        // Stable sort: equal scores keep track insertion order.
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        for (ti, di, _score) in &iou_pairs {
            if matched_track_indices[*ti] || assigned[*di].is_some() {
                continue;
            }
            matched_track_indices[*ti] = true;
            assigned[*di] = Some(*ti);
            self.tracks[*ti].update_with_detection(valid[*di], now);
        }

        // ════════════════════════════════════════════════════════════════════
        // UNMATCHED TRACKS → LOST
        // ════════════════════════════════════════════════════════════════════
        for (ti, matched) in matched_track_indices.iter().enumerate() {
            if !matched {
                self.tracks[ti].mark_missed();
            }
        }

        // ════════════════════════════════════════════════════════════════════
        // UNMATCHED DETECTIONS → NEW TRACKS
        // ════════════════════════════════════════════════════════════════════
        for (di, slot) in assigned.iter_mut().enumerate() {
            if slot.is_some() || valid[di].confidence < self.config.min_create_confidence {
                continue;
            }
            let track = Track::new(self.next_id, valid[di], now);
            debug!(
                "🆕 New track T{} created: class={}, rect=({},{},{},{})",
                self.next_id,
                track.class_id,
                track.rect.x,
                track.rect.y,
                track.rect.width,
                track.rect.height
            );
            self.next_id += 1;
            self.tracks.push(track);
            *slot = Some(self.tracks.len() - 1);
        }

        assigned
            .iter()
            .filter_map(|slot| slot.map(|ti| self.tracks[ti].view()))
            .collect()
    }

    #[cfg(test)]
    pub fn get_track(&self, track_id: u32) -> Option<TrackedObject> {
        self.tracks
            .iter()
            .find(|t| t.id == track_id)
            .map(|t| t.view())
    }

    pub fn active_count(&self) -> usize {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Tracked)
            .count()
    }

    pub fn held_count(&self) -> usize {
        self.tracks.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
