// src/analysis/roi_engine.rs
//
// ROI containment & gating engine.
//
// Per frame:
//   detections → threshold/class filter → ObjectTracker → RoiObject upsert
//   → containment (first matching area in declaration order) → dwell/cooldown
//   gate → AlarmInfo → callbacks (registration order)
//
// The configuration graph is an immutable `Arc<RoiGraph>`; reload builds a
// new one and swaps it, so a frame always sees one graph from start to end.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::coco::class_name;
use super::object_tracker::{DetectionInput, ObjectTracker, TrackerConfig};
use super::roi_config::{self, RoiArea, RoiConfigError, RoiGraph, RoiGroup, NO_GROUP};
use crate::param_store::ParamStore;
use crate::snapshot;
use crate::types::{AlarmInfo, DetectedBox, Frame, Rect};

/// Detector output is capped at this many boxes per frame; the rest is ignored.
pub const MAX_DETECTIONS: usize = 128;

/// RoiObjects not reported by the tracker for this long are dropped.
pub const OBJECT_ABSENCE_WINDOW: Duration = Duration::from_secs(5);

/// Overlap ratio (of the object's own area) above which a box counts as inside.
const MIN_OVERLAP_RATIO: f64 = 0.3;

pub type AlarmCallback = Box<dyn Fn(&AlarmInfo) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct RoiObject {
    pub track_id: u32,
    pub class_id: i32,
    pub rect: Rect,
    pub confidence: f32,
    pub in_roi: bool,
    pub roi_id: Option<i32>,
    pub group_id: Option<i32>,
    pub first_seen: Instant,
    pub last_alarm: Option<Instant>,
    pub alarm_triggered: bool,
    /// Last time the tracker reported this track.
    pub last_seen: Instant,
}

impl RoiObject {
    fn new(track_id: u32, class_id: i32, rect: Rect, confidence: f32, now: Instant) -> Self {
        Self {
            track_id,
            class_id,
            rect,
            confidence,
            in_roi: false,
            roi_id: None,
            group_id: None,
            first_seen: now,
            last_alarm: None,
            alarm_triggered: false,
            last_seen: now,
        }
    }
}

/// Center-in-rect, or overlap strictly above 30% of the object's area.
pub fn is_object_in_roi(object: &Rect, roi: &Rect) -> bool {
    let (cx, cy) = object.center();
    if roi.contains_point(cx, cy) {
        return true;
    }

    let object_area = object.area();
    if object_area <= 0 {
        return false;
    }
    let overlap = roi.intersection(object).area();
    overlap as f64 / object_area as f64 > MIN_OVERLAP_RATIO
}

struct EngineState {
    tracker: ObjectTracker,
    objects: HashMap<u32, RoiObject>,
}

pub struct RoiEngine {
    store: Arc<dyn ParamStore>,
    graph: RwLock<Arc<RoiGraph>>,
    state: Mutex<EngineState>,
    callbacks: RwLock<Vec<AlarmCallback>>,
}

impl RoiEngine {
    pub fn new(store: Arc<dyn ParamStore>) -> Self {
        Self::with_tracker_config(store, TrackerConfig::default())
    }

    pub fn with_tracker_config(store: Arc<dyn ParamStore>, tracker_config: TrackerConfig) -> Self {
        let threshold = roi_config::read_detection_threshold(store.as_ref());
        Self {
            store,
            graph: RwLock::new(Arc::new(RoiGraph::empty(threshold))),
            state: Mutex::new(EngineState {
                tracker: ObjectTracker::new(tracker_config),
                objects: HashMap::new(),
            }),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    // ========================================================================
    // CONFIGURATION
    // ========================================================================

    /// Initial load. On failure the engine is left with an empty graph.
    pub fn load_config(&self) -> Result<(), RoiConfigError> {
        match roi_config::load_graph(self.store.as_ref()) {
            Ok(graph) => {
                self.swap_graph(graph);
                Ok(())
            }
            Err(e) => {
                let threshold = roi_config::read_detection_threshold(self.store.as_ref());
                self.swap_graph(RoiGraph::empty(threshold));
                Err(e)
            }
        }
    }

    /// Rebuild from the store; on failure the previous graph stays live.
    pub fn reload_config(&self) -> Result<(), RoiConfigError> {
        match roi_config::load_graph(self.store.as_ref()) {
            Ok(graph) => {
                self.swap_graph(graph);
                info!("🔄 ROI configuration reloaded");
                Ok(())
            }
            Err(e) => {
                warn!("ROI reload failed ({}), keeping previous configuration", e);
                Err(e)
            }
        }
    }

    fn swap_graph(&self, graph: RoiGraph) {
        *self.graph.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(graph);
    }

    pub fn graph(&self) -> Arc<RoiGraph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn store(&self) -> &Arc<dyn ParamStore> {
        &self.store
    }

    pub fn register_alarm_callback(&self, callback: AlarmCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn roi_areas(&self) -> Vec<RoiArea> {
        self.graph().roi_areas.clone()
    }

    pub fn roi_groups(&self) -> Vec<RoiGroup> {
        self.graph().roi_groups.clone()
    }

    pub fn detection_classes(&self) -> Vec<i32> {
        self.graph().detection_classes()
    }

    pub fn group_of_roi(&self, roi_id: i32) -> Option<i32> {
        self.graph().group_of_roi(roi_id)
    }

    pub fn detection_threshold(&self) -> f32 {
        self.graph().detection_threshold
    }

    pub fn is_active(&self) -> bool {
        !self.graph().is_empty()
    }

    /// (actively tracked, held including lost) tracker counts.
    pub fn track_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (state.tracker.active_count(), state.tracker.held_count())
    }

    /// Snapshot of the engine's objects, ordered by track id.
    pub fn tracked_objects(&self) -> Vec<RoiObject> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut objects: Vec<RoiObject> = state.objects.values().cloned().collect();
        objects.sort_by_key(|o| o.track_id);
        objects
    }

    // ========================================================================
    // PER-FRAME PROCESSING
    // ========================================================================

    pub fn process_detection_result(&self, frame: &Frame, detections: &[DetectedBox]) {
        self.process_detection_result_at(frame, detections, Instant::now());
    }

    pub fn process_detection_result_at(&self, frame: &Frame, detections: &[DetectedBox], now: Instant) {
        let graph = self.graph();
        if graph.is_empty() {
            return;
        }

        let inputs: Vec<DetectionInput> = detections
            .iter()
            .take(MAX_DETECTIONS)
            .filter(|d| d.confidence >= graph.detection_threshold)
            .filter(|d| graph.is_class_monitored(d.class_id))
            .map(|d| DetectionInput {
                rect: d.rect(),
                class_id: d.class_id,
                confidence: d.confidence,
            })
            .collect();

        let mut pending = Vec::new();
        {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let state = &mut *guard;

            let tracked = state.tracker.update(&inputs, now);

            let mut present = Vec::with_capacity(tracked.len());
            let mut seen = HashSet::with_capacity(tracked.len());
            for t in &tracked {
                if !seen.insert(t.track_id) {
                    continue;
                }
                present.push(t.track_id);
                state
                    .objects
                    .entry(t.track_id)
                    .and_modify(|o| {
                        o.rect = t.rect;
                        o.confidence = t.confidence;
                        o.class_id = t.class_id;
                        o.last_seen = now;
                    })
                    .or_insert_with(|| RoiObject::new(t.track_id, t.class_id, t.rect, t.confidence, now));
            }

            for track_id in present {
                let Some(obj) = state.objects.get_mut(&track_id) else {
                    continue;
                };
                if let Some((roi_index, alarm)) = evaluate_object(&graph, obj, frame, now) {
                    pending.push((roi_index, alarm));
                }
            }

            state.objects.retain(|track_id, obj| {
                let keep = now.saturating_duration_since(obj.last_seen) <= OBJECT_ABSENCE_WINDOW;
                if !keep {
                    debug!("Dropping ROI object for track {}", track_id);
                }
                keep
            });
        }

        if pending.is_empty() {
            return;
        }

        // Fire in ROI declaration order; the sort is stable so objects in the
        // same area keep their detection order.
        pending.sort_by_key(|(roi_index, _)| *roi_index);

        let callbacks = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        for (_, alarm) in &pending {
            for callback in callbacks.iter() {
                callback(alarm);
            }
        }
    }
}

/// Containment + gating for one object present this frame. Returns the
/// index of the area that fired and the alarm, if any.
fn evaluate_object(
    graph: &RoiGraph,
    obj: &mut RoiObject,
    frame: &Frame,
    now: Instant,
) -> Option<(usize, AlarmInfo)> {
    let was_in_roi = obj.in_roi;
    let prev_roi = obj.roi_id;
    let prev_group = obj.group_id;

    obj.in_roi = false;
    obj.roi_id = None;
    obj.group_id = None;

    let hit = graph.roi_areas.iter().enumerate().find(|(_, area)| {
        area.enabled && graph.area_monitors(area, obj.class_id) && is_object_in_roi(&obj.rect, &area.rect)
    });

    let Some((roi_index, area)) = hit else {
        if was_in_roi {
            debug!("Track {} left all ROIs", obj.track_id);
            obj.alarm_triggered = false;
        }
        return None;
    };

    obj.in_roi = true;
    obj.roi_id = Some(area.id);
    obj.group_id = graph.group_of_roi(area.id);

    if !was_in_roi || prev_roi != obj.roi_id || prev_group != obj.group_id {
        debug!("Track {} entered ROI {} ({})", obj.track_id, area.id, area.name);
        obj.first_seen = now;
        obj.alarm_triggered = false;
    }

    let cooling_down = obj
        .last_alarm
        .is_some_and(|last| now.saturating_duration_since(last).as_secs() < area.cooldown_time);

    // A fired presence stays quiet until the cooldown lapses. With no
    // cooldown it stays quiet until the object leaves.
    if obj.alarm_triggered && (cooling_down || area.cooldown_time == 0) {
        return None;
    }
    if now.saturating_duration_since(obj.first_seen).as_secs() < area.stay_time {
        return None;
    }
    if cooling_down {
        return None;
    }

    obj.alarm_triggered = true;
    obj.last_alarm = Some(now);

    let group = obj.group_id.and_then(|id| graph.group(id));
    let alarm = AlarmInfo {
        alarm_id: Uuid::new_v4(),
        roi_id: area.id,
        roi_name: area.name.clone(),
        group_id: obj.group_id.unwrap_or(NO_GROUP),
        group_name: group.map(|g| g.name.clone()).unwrap_or_default(),
        track_id: obj.track_id,
        class_id: obj.class_id,
        class_name: class_name(obj.class_id).to_string(),
        confidence: obj.confidence,
        rect: obj.rect,
        snapshot: snapshot::crop_evidence(frame, &obj.rect).map(Arc::new),
        timestamp: Utc::now(),
    };

    match group {
        Some(g) => info!(
            "🚨 Alarm: group {} ({}), ROI {} ({}), class {}, track {}",
            g.id, g.name, area.id, area.name, alarm.class_name, obj.track_id
        ),
        None => info!(
            "🚨 Alarm: ROI {} ({}), class {}, track {}",
            area.id, area.name, alarm.class_name, obj.track_id
        ),
    }

    Some((roi_index, alarm))
}
