// src/pipeline/mod.rs

pub mod alarm_history;
pub mod metrics;
pub mod runner;
pub mod source;

pub use alarm_history::{AlarmHistory, AlarmHistoryView};
pub use metrics::PipelineMetrics;
pub use runner::PipelineRunner;
pub use source::JsonlReplaySource;
