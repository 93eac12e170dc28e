// src/analysis/mod.rs
//
// Detection analysis: tracking and ROI gating.
//
// Signal flow:
//   Detector boxes → object_tracker (stable ids) → roi_engine (containment,
//   dwell, cooldown) → AlarmInfo → registered callbacks
//
// The active ROI layout comes from roi_config, built from the parameter store.

pub mod coco;
pub mod object_tracker;
pub mod roi_config;
pub mod roi_engine;

pub use object_tracker::TrackerConfig;
pub use roi_engine::RoiEngine;
