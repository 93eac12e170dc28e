// src/pipeline/metrics.rs
//
// Runtime counters for the detection → alarm path. Shared by the pipeline
// thread, the alarm dispatcher and the status endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub total_frames: Arc<AtomicU64>,
    pub frames_with_detections: Arc<AtomicU64>,
    pub detections_received: Arc<AtomicU64>,
    pub alarms_fired: Arc<AtomicU64>,
    pub push_successes: Arc<AtomicU64>,
    pub push_failures: Arc<AtomicU64>,
    pub config_reloads: Arc<AtomicU64>,
    pub frame_time_us: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            total_frames: Arc::new(AtomicU64::new(0)),
            frames_with_detections: Arc::new(AtomicU64::new(0)),
            detections_received: Arc::new(AtomicU64::new(0)),
            alarms_fired: Arc::new(AtomicU64::new(0)),
            push_successes: Arc::new(AtomicU64::new(0)),
            push_failures: Arc::new(AtomicU64::new(0)),
            config_reloads: Arc::new(AtomicU64::new(0)),
            frame_time_us: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_us: u64) {
        counter.store(duration_us, Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        let frames = self.total_frames.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            frames as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_frames: self.total_frames.load(Ordering::Relaxed),
            fps: self.fps(),
            frames_with_detections: self.frames_with_detections.load(Ordering::Relaxed),
            detections_received: self.detections_received.load(Ordering::Relaxed),
            alarms_fired: self.alarms_fired.load(Ordering::Relaxed),
            push_successes: self.push_successes.load(Ordering::Relaxed),
            push_failures: self.push_failures.load(Ordering::Relaxed),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
            last_frame_us: self.frame_time_us.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub total_frames: u64,
    pub fps: f64,
    pub frames_with_detections: u64,
    pub detections_received: u64,
    pub alarms_fired: u64,
    pub push_successes: u64,
    pub push_failures: u64,
    pub config_reloads: u64,
    pub last_frame_us: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_summary() {
        let metrics = PipelineMetrics::new();
        let shared = metrics.clone();
        shared.inc(&shared.total_frames);
        shared.add(&shared.detections_received, 3);
        shared.inc(&shared.alarms_fired);
        metrics.set_timing(&metrics.frame_time_us, 420);

        let summary = metrics.summary();
        assert_eq!(summary.total_frames, 1);
        assert_eq!(summary.detections_received, 3);
        assert_eq!(summary.alarms_fired, 1);
        assert_eq!(summary.last_frame_us, 420);
        assert_eq!(summary.push_failures, 0);
    }
}
