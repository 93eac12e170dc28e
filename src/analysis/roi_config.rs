// src/analysis/roi_config.rs
//
// ROI / group configuration graph and its mapping onto the parameter store.
//
// A `RoiGraph` is built in one pass from the store and never mutated
// afterwards; the engine swaps whole graphs on reload.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::param_store::ParamStore;
use crate::types::{Color, Rect};

pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.4;
pub const NO_GROUP: i32 = -1;

const KEY_ENABLE: &str = "ai.roi:enable";
const KEY_COUNT: &str = "ai.roi:count";
const KEY_GROUPS: &str = "ai.roi:groups";
const KEY_THRESHOLD: &str = "ai.roi:detection_threshold";

fn roi_key(index: usize, field: &str) -> String {
    format!("ai.roi.{}:{}", index, field)
}

fn group_key(index: usize, field: &str) -> String {
    format!("ai.roi.group.{}:{}", index, field)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RoiConfigError {
    #[error("ROI detection is disabled")]
    Disabled,
    #[error("no usable ROI areas configured")]
    NoUsableRois,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoiArea {
    pub id: i32,
    pub name: String,
    #[serde(flatten)]
    pub rect: Rect,
    /// Empty means "inherit from the owning group".
    pub classes: Vec<i32>,
    /// Seconds an object must dwell before an alarm may fire.
    pub stay_time: u64,
    /// Seconds between two alarms of the same track.
    pub cooldown_time: u64,
    pub enabled: bool,
    /// `NO_GROUP` for standalone areas.
    pub group_id: i32,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoiGroup {
    pub id: i32,
    pub name: String,
    pub classes: Vec<i32>,
    pub roi_ids: Vec<i32>,
    pub color: Color,
}

/// Immutable snapshot of the active ROI configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoiGraph {
    pub detection_threshold: f32,
    pub roi_areas: Vec<RoiArea>,
    pub roi_groups: Vec<RoiGroup>,
    pub roi_to_group: HashMap<i32, i32>,
    pub group_classes: HashMap<i32, HashSet<i32>>,
}

impl RoiGraph {
    pub fn empty(detection_threshold: f32) -> Self {
        Self {
            detection_threshold,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.roi_areas.is_empty()
    }

    /// Class set an area actually monitors: its group's set when grouped,
    /// otherwise its own list.
    pub fn area_monitors(&self, area: &RoiArea, class_id: i32) -> bool {
        match self.roi_to_group.get(&area.id) {
            Some(group_id) => self
                .group_classes
                .get(group_id)
                .is_some_and(|classes| classes.contains(&class_id)),
            None => area.classes.contains(&class_id),
        }
    }

    /// Early-exit filter: is the class watched by any group or any enabled
    /// standalone area.
    pub fn is_class_monitored(&self, class_id: i32) -> bool {
        self.group_classes
            .values()
            .any(|classes| classes.contains(&class_id))
            || self
                .roi_areas
                .iter()
                .filter(|a| a.enabled && !self.roi_to_group.contains_key(&a.id))
                .any(|a| a.classes.contains(&class_id))
    }

    /// Sorted union of every monitored class id.
    pub fn detection_classes(&self) -> Vec<i32> {
        let mut classes: BTreeSet<i32> = BTreeSet::new();
        for set in self.group_classes.values() {
            classes.extend(set.iter().copied());
        }
        for area in &self.roi_areas {
            if area.enabled && !self.roi_to_group.contains_key(&area.id) {
                classes.extend(area.classes.iter().copied());
            }
        }
        classes.into_iter().collect()
    }

    pub fn group_of_roi(&self, roi_id: i32) -> Option<i32> {
        self.roi_to_group.get(&roi_id).copied()
    }

    #[cfg(test)]
    pub fn area(&self, roi_id: i32) -> Option<&RoiArea> {
        self.roi_areas.iter().find(|a| a.id == roi_id)
    }

    pub fn group(&self, group_id: i32) -> Option<&RoiGroup> {
        self.roi_groups.iter().find(|g| g.id == group_id)
    }
}

pub fn read_detection_threshold(store: &dyn ParamStore) -> f32 {
    store.get_float(KEY_THRESHOLD, DEFAULT_DETECTION_THRESHOLD)
}

/// Build a fresh graph from the parameter store.
pub fn load_graph(store: &dyn ParamStore) -> Result<RoiGraph, RoiConfigError> {
    let detection_threshold = read_detection_threshold(store);

    if store.get_int(KEY_ENABLE, 0) == 0 {
        info!("ROI detection disabled ({}=0)", KEY_ENABLE);
        return Err(RoiConfigError::Disabled);
    }

    let roi_count = store.get_int(KEY_COUNT, 0).max(0) as usize;
    let group_count = store.get_int(KEY_GROUPS, 0).max(0) as usize;

    let mut roi_areas = Vec::with_capacity(roi_count);
    for i in 0..roi_count {
        if store.get_int(&roi_key(i, "enabled"), 1) == 0 {
            debug!("ROI {} disabled, skipped", i);
            continue;
        }

        let id = i as i32;
        let rect = Rect::new(
            store.get_int(&roi_key(i, "x"), 0),
            store.get_int(&roi_key(i, "y"), 0),
            store.get_int(&roi_key(i, "width"), 100),
            store.get_int(&roi_key(i, "height"), 100),
        );
        if !is_usable_rect(&rect) {
            error!("ROI {} has invalid geometry {:?}, skipped", i, rect);
            continue;
        }

        let classes = parse_id_list(&store.get_string(&roi_key(i, "classes"), ""), "class id");
        let color = Color::from_seed(classes.first().copied().unwrap_or(id));

        roi_areas.push(RoiArea {
            id,
            name: store.get_string(&roi_key(i, "name"), ""),
            rect,
            classes,
            stay_time: store.get_int(&roi_key(i, "stay_time"), 0).max(0) as u64,
            cooldown_time: store.get_int(&roi_key(i, "cooldown_time"), 10).max(0) as u64,
            enabled: true,
            group_id: NO_GROUP,
            color,
        });
    }

    let mut roi_groups = Vec::with_capacity(group_count);
    let mut roi_to_group = HashMap::new();
    let mut group_classes = HashMap::new();

    for j in 0..group_count {
        let id = j as i32;
        let classes = parse_id_list(&store.get_string(&group_key(j, "classes"), ""), "class id");
        let requested = parse_id_list(&store.get_string(&group_key(j, "rois"), ""), "ROI id");
        let color = Color::from_seed(classes.first().copied().unwrap_or(id));

        let mut roi_ids = Vec::with_capacity(requested.len());
        for roi_id in requested {
            let Some(area) = roi_areas.iter_mut().find(|a| a.id == roi_id) else {
                error!("Group {} references unknown ROI id {}, skipped", j, roi_id);
                continue;
            };
            area.group_id = id;
            area.color = color;
            if area.classes.is_empty() {
                area.classes = classes.clone();
            }
            roi_to_group.insert(roi_id, id);
            roi_ids.push(roi_id);
        }

        group_classes.insert(id, classes.iter().copied().collect::<HashSet<_>>());
        roi_groups.push(RoiGroup {
            id,
            name: store.get_string(&group_key(j, "name"), &format!("Group {}", j)),
            classes,
            roi_ids,
            color,
        });
    }

    if roi_areas.is_empty() {
        warn!("ROI detection enabled but no usable ROI areas configured");
        return Err(RoiConfigError::NoUsableRois);
    }

    info!(
        "✓ ROI config loaded: {} areas, {} groups, threshold {:.2}",
        roi_areas.len(),
        roi_groups.len(),
        detection_threshold
    );

    Ok(RoiGraph {
        detection_threshold,
        roi_areas,
        roi_groups,
        roi_to_group,
        group_classes,
    })
}

/// Positive size, with both far edges representable in `i32`.
fn is_usable_rect(rect: &Rect) -> bool {
    !rect.is_degenerate()
        && rect.x.checked_add(rect.width).is_some()
        && rect.y.checked_add(rect.height).is_some()
}

/// Comma-separated integer list; bad tokens are logged and dropped.
pub fn parse_id_list(raw: &str, what: &str) -> Vec<i32> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| match token.parse::<i32>() {
            Ok(v) => Some(v),
            Err(_) => {
                error!("Invalid {} {:?} in ROI config, skipped", what, token);
                None
            }
        })
        .collect()
}

fn join_ids(ids: &[i32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// WRITER
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoiAreaUpdate {
    pub name: Option<String>,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub stay_time: Option<i32>,
    pub cooldown_time: Option<i32>,
    pub enabled: Option<bool>,
    pub classes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoiGroupUpdate {
    pub name: Option<String>,
    pub classes: Option<Vec<i32>>,
    pub roi_ids: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoiConfigUpdate {
    pub roi_areas: Option<Vec<RoiAreaUpdate>>,
    pub roi_groups: Option<Vec<RoiGroupUpdate>>,
}

impl RoiConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.roi_areas.is_none() && self.roi_groups.is_none()
    }
}

/// Persist structured edits. Each submitted entry is written in full, with
/// loader defaults for omitted fields, so stale keys from a previous layout
/// at the same index never leak into the new one.
pub fn write_roi_config(store: &dyn ParamStore, update: &RoiConfigUpdate) -> Result<()> {
    if let Some(areas) = &update.roi_areas {
        store.set_int(KEY_COUNT, areas.len() as i32)?;
        if !areas.is_empty() {
            store.set_int(KEY_ENABLE, 1)?;
        }

        for (i, area) in areas.iter().enumerate() {
            store.set_int(&roi_key(i, "enabled"), i32::from(area.enabled.unwrap_or(true)))?;
            store.set_string(&roi_key(i, "name"), area.name.as_deref().unwrap_or(""))?;
            store.set_int(&roi_key(i, "x"), area.x.unwrap_or(0))?;
            store.set_int(&roi_key(i, "y"), area.y.unwrap_or(0))?;
            store.set_int(&roi_key(i, "width"), area.width.unwrap_or(100))?;
            store.set_int(&roi_key(i, "height"), area.height.unwrap_or(100))?;
            store.set_int(&roi_key(i, "stay_time"), area.stay_time.unwrap_or(0))?;
            store.set_int(&roi_key(i, "cooldown_time"), area.cooldown_time.unwrap_or(10))?;
            store.set_string(
                &roi_key(i, "classes"),
                &join_ids(area.classes.as_deref().unwrap_or(&[])),
            )?;
        }
    }

    if let Some(groups) = &update.roi_groups {
        store.set_int(KEY_GROUPS, groups.len() as i32)?;
        for (j, group) in groups.iter().enumerate() {
            let name = group.name.clone().unwrap_or_else(|| format!("Group {}", j));
            store.set_string(&group_key(j, "name"), &name)?;
            store.set_string(
                &group_key(j, "classes"),
                &join_ids(group.classes.as_deref().unwrap_or(&[])),
            )?;
            store.set_string(
                &group_key(j, "rois"),
                &join_ids(group.roi_ids.as_deref().unwrap_or(&[])),
            )?;
        }
    }

    store.save().context("Failed to save ROI configuration")?;
    info!("ROI configuration written to parameter store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_store::MemoryParamStore;

    fn two_rois_one_group() -> MemoryParamStore {
        MemoryParamStore::with(&[
            ("ai.roi:enable", "1"),
            ("ai.roi:count", "2"),
            ("ai.roi:groups", "1"),
            ("ai.roi.0:name", "door"),
            ("ai.roi.0:x", "100"),
            ("ai.roi.0:y", "100"),
            ("ai.roi.0:width", "200"),
            ("ai.roi.0:height", "200"),
            ("ai.roi.0:classes", "0"),
            ("ai.roi.1:name", "yard"),
            ("ai.roi.1:classes", ""),
            ("ai.roi.group.0:name", "vehicles"),
            ("ai.roi.group.0:classes", "1,3"),
            ("ai.roi.group.0:rois", "1"),
        ])
    }

    #[test]
    fn test_loads_areas_with_defaults() {
        let graph = load_graph(&two_rois_one_group()).unwrap();
        assert_eq!(graph.roi_areas.len(), 2);
        assert!((graph.detection_threshold - DEFAULT_DETECTION_THRESHOLD).abs() < 1e-6);

        let door = &graph.roi_areas[0];
        assert_eq!(door.id, 0);
        assert_eq!(door.name, "door");
        assert_eq!(door.rect, Rect::new(100, 100, 200, 200));
        assert_eq!(door.stay_time, 0);
        assert_eq!(door.cooldown_time, 10);
        assert_eq!(door.group_id, NO_GROUP);

        let yard = &graph.roi_areas[1];
        assert_eq!(yard.rect, Rect::new(0, 0, 100, 100));
    }

    #[test]
    fn test_invalid_geometry_is_skipped() {
        let store = two_rois_one_group();
        store.set_int("ai.roi.0:x", i32::MAX - 60).unwrap();
        store.set_int("ai.roi.1:width", 0).unwrap();
        assert_eq!(load_graph(&store), Err(RoiConfigError::NoUsableRois));

        store.set_int("ai.roi.1:width", 50).unwrap();
        let graph = load_graph(&store).unwrap();
        let ids: Vec<i32> = graph.roi_areas.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_group_inheritance() {
        let graph = load_graph(&two_rois_one_group()).unwrap();
        let yard = graph.area(1).unwrap();
        assert_eq!(yard.classes, vec![1, 3]);
        assert_eq!(yard.group_id, 0);
        assert_eq!(yard.color, graph.roi_groups[0].color);
        assert_eq!(graph.group_of_roi(1), Some(0));
        assert_eq!(graph.group_of_roi(0), None);

        let classes = graph.detection_classes();
        assert_eq!(classes, vec![0, 1, 3]);
        assert!(!classes.contains(&2));
    }

    #[test]
    fn test_grouped_area_uses_group_classes_even_with_own_list() {
        let store = two_rois_one_group();
        store.set_string("ai.roi.1:classes", "2").unwrap();
        let graph = load_graph(&store).unwrap();
        let yard = graph.area(1).unwrap();
        assert_eq!(yard.classes, vec![2]);
        assert!(graph.area_monitors(yard, 1));
        assert!(!graph.area_monitors(yard, 2));
        assert!(!graph.is_class_monitored(2));
    }

    #[test]
    fn test_disabled_feature_fails() {
        let store = two_rois_one_group();
        store.set_string("ai.roi:enable", "0").unwrap();
        assert_eq!(load_graph(&store), Err(RoiConfigError::Disabled));
    }

    #[test]
    fn test_zero_usable_rois_fails() {
        let store = MemoryParamStore::with(&[
            ("ai.roi:enable", "1"),
            ("ai.roi:count", "1"),
            ("ai.roi.0:enabled", "0"),
        ]);
        assert_eq!(load_graph(&store), Err(RoiConfigError::NoUsableRois));
    }

    #[test]
    fn test_disabled_roi_is_skipped_and_ids_follow_index() {
        let store = two_rois_one_group();
        store.set_string("ai.roi.0:enabled", "0").unwrap();
        let graph = load_graph(&store).unwrap();
        assert_eq!(graph.roi_areas.len(), 1);
        assert_eq!(graph.roi_areas[0].id, 1);
    }

    #[test]
    fn test_invalid_tokens_are_skipped() {
        let store = two_rois_one_group();
        store.set_string("ai.roi.0:classes", "0, x, 2").unwrap();
        store.set_string("ai.roi.group.0:rois", "1,7,abc").unwrap();
        let graph = load_graph(&store).unwrap();
        assert_eq!(graph.roi_areas[0].classes, vec![0, 2]);
        assert_eq!(graph.roi_groups[0].roi_ids, vec![1]);
        assert!(!graph.roi_to_group.contains_key(&7));
    }

    #[test]
    fn test_group_name_defaults() {
        let store = two_rois_one_group();
        store.remove("ai.roi.group.0:name");
        let graph = load_graph(&store).unwrap();
        assert_eq!(graph.roi_groups[0].name, "Group 0");
    }

    #[test]
    fn test_write_then_load() {
        let store = MemoryParamStore::default();
        let update = RoiConfigUpdate {
            roi_areas: Some(vec![
                RoiAreaUpdate {
                    name: Some("gate".into()),
                    x: Some(10),
                    y: Some(20),
                    width: Some(30),
                    height: Some(40),
                    stay_time: Some(2),
                    cooldown_time: Some(5),
                    classes: Some(vec![0, 2]),
                    ..Default::default()
                },
                RoiAreaUpdate::default(),
            ]),
            roi_groups: Some(vec![RoiGroupUpdate {
                name: None,
                classes: Some(vec![7]),
                roi_ids: Some(vec![1]),
            }]),
        };

        write_roi_config(&store, &update).unwrap();
        assert_eq!(store.saves.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.get_int("ai.roi:enable", 0), 1);

        let graph = load_graph(&store).unwrap();
        assert_eq!(graph.roi_areas.len(), 2);
        let gate = graph.area(0).unwrap();
        assert_eq!(gate.rect, Rect::new(10, 20, 30, 40));
        assert_eq!(gate.stay_time, 2);
        assert_eq!(gate.cooldown_time, 5);
        assert_eq!(gate.classes, vec![0, 2]);
        assert_eq!(graph.area(1).unwrap().classes, vec![7]);
        assert_eq!(graph.roi_groups[0].name, "Group 0");
    }

    #[test]
    fn test_write_reports_save_failure() {
        let store = MemoryParamStore::default();
        store
            .fail_save
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let update = RoiConfigUpdate {
            roi_areas: Some(vec![RoiAreaUpdate::default()]),
            roi_groups: None,
        };
        assert!(write_roi_config(&store, &update).is_err());
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(" 1, 2 ,3 ", "class id"), vec![1, 2, 3]);
        assert!(parse_id_list("", "class id").is_empty());
        assert_eq!(parse_id_list("4,,q", "class id"), vec![4]);
    }
}
