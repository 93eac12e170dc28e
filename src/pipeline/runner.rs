// src/pipeline/runner.rs
//
// Pipeline thread: pulls frames from a DetectionSource and drives the ROI
// engine. Shutdown is cooperative; the current frame always completes.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::metrics::PipelineMetrics;
use super::source::DetectionSource;
use crate::analysis::RoiEngine;

pub struct PipelineRunner {
    engine: Arc<RoiEngine>,
    metrics: PipelineMetrics,
    frame_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(
        engine: Arc<RoiEngine>,
        metrics: PipelineMetrics,
        frame_interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            engine,
            metrics,
            frame_interval,
            shutdown,
        }
    }

    /// Process frames until the source runs dry or shutdown is requested.
    /// Returns the number of frames processed.
    pub fn run(&self, source: &mut dyn DetectionSource) -> Result<u64> {
        let mut frames = 0u64;

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(input) = source.next_frame()? else {
                info!("Detection source exhausted after {} frames", frames);
                break;
            };

            let started = Instant::now();
            self.engine
                .process_detection_result(&input.frame, &input.detections);
            let elapsed = started.elapsed();

            frames += 1;
            self.metrics.inc(&self.metrics.total_frames);
            if !input.detections.is_empty() {
                self.metrics.inc(&self.metrics.frames_with_detections);
                self.metrics
                    .add(&self.metrics.detections_received, input.detections.len() as u64);
            }
            self.metrics
                .set_timing(&self.metrics.frame_time_us, elapsed.as_micros() as u64);

            if frames % 100 == 0 {
                debug!(
                    "Processed {} frames ({:.1} fps)",
                    frames,
                    self.metrics.fps()
                );
            }

            if let Some(rest) = self.frame_interval.checked_sub(elapsed) {
                std::thread::sleep(rest);
            }
        }

        Ok(frames)
    }

    pub fn spawn(self, mut source: Box<dyn DetectionSource>) -> Result<JoinHandle<u64>> {
        std::thread::Builder::new()
            .name("pipeline".to_string())
            .spawn(move || match self.run(source.as_mut()) {
                Ok(frames) => frames,
                Err(e) => {
                    error!("Pipeline stopped: {:#}", e);
                    0
                }
            })
            .context("Failed to spawn pipeline thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param_store::MemoryParamStore;
    use crate::pipeline::source::JsonlReplaySource;
    use crate::types::AlarmInfo;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> Arc<RoiEngine> {
        let store = Arc::new(MemoryParamStore::with(&[
            ("ai.roi:enable", "1"),
            ("ai.roi:count", "1"),
            ("ai.roi.0:x", "100"),
            ("ai.roi.0:y", "100"),
            ("ai.roi.0:width", "200"),
            ("ai.roi.0:height", "200"),
            ("ai.roi.0:classes", "0"),
        ]));
        let engine = Arc::new(RoiEngine::new(store));
        engine.load_config().unwrap();
        engine
    }

    const REPLAY: &str = r#"{"detections":[{"left":150,"top":150,"right":200,"bottom":200,"class_id":0,"confidence":0.9}]}
{"detections":[{"left":152,"top":150,"right":202,"bottom":200,"class_id":0,"confidence":0.9}]}
{"detections":[]}
"#;

    #[test]
    fn test_runs_replay_to_completion() {
        let engine = engine();
        let alarms = Arc::new(AtomicUsize::new(0));
        let counter = alarms.clone();
        engine.register_alarm_callback(Box::new(move |_: &AlarmInfo| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let metrics = PipelineMetrics::new();
        let runner = PipelineRunner::new(
            engine.clone(),
            metrics.clone(),
            Duration::ZERO,
            Arc::new(AtomicBool::new(false)),
        );
        let mut source = JsonlReplaySource::from_reader(Cursor::new(REPLAY), 320, 240, 100);

        assert_eq!(runner.run(&mut source).unwrap(), 3);
        assert_eq!(alarms.load(Ordering::SeqCst), 1);

        let summary = metrics.summary();
        assert_eq!(summary.total_frames, 3);
        assert_eq!(summary.frames_with_detections, 2);
        assert_eq!(summary.detections_received, 2);
    }

    #[test]
    fn test_shutdown_flag_stops_before_next_frame() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let runner = PipelineRunner::new(engine(), PipelineMetrics::new(), Duration::ZERO, shutdown);
        let mut source = JsonlReplaySource::from_reader(Cursor::new(REPLAY), 320, 240, 100);
        assert_eq!(runner.run(&mut source).unwrap(), 0);
    }

    #[test]
    fn test_spawned_thread_returns_frame_count() {
        let runner = PipelineRunner::new(
            engine(),
            PipelineMetrics::new(),
            Duration::ZERO,
            Arc::new(AtomicBool::new(false)),
        );
        let source = JsonlReplaySource::from_reader(Cursor::new(REPLAY.to_string()), 320, 240, 100);
        let handle = runner.spawn(Box::new(source)).unwrap();
        assert_eq!(handle.join().unwrap(), 3);
    }
}
