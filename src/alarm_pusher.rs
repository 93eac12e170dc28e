// src/alarm_pusher.rs
//
// Asynchronous alarm delivery to the remote alarm server.
//
// `on_alarm` runs on the pipeline thread and only enqueues; a dedicated
// dispatch thread drains the queue and POSTs each alarm as JSON with the
// snapshot embedded as base64 JPEG. Failed deliveries are retried a fixed
// number of times, then logged and dropped.

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::param_store::ParamStore;
use crate::pipeline::PipelineMetrics;
use crate::snapshot;
use crate::types::{AlarmConfig, AlarmInfo, Rect};

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const DEFAULT_ALARM_PATH: &str = "/api/alarms";

// ============================================================================
// PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AlarmPayload {
    pub roi_id: i32,
    pub roi_name: String,
    pub group_id: i32,
    pub group_name: String,
    pub track_id: u32,
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub rect: Rect,
    /// ISO-8601 UTC, second precision
    pub timestamp: String,
    /// Base64 JPEG of the evidence crop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl AlarmPayload {
    pub fn from_alarm(alarm: &AlarmInfo) -> Self {
        let image = alarm
            .snapshot
            .as_deref()
            .and_then(snapshot::encode_jpeg)
            .map(|jpeg| base64::engine::general_purpose::STANDARD.encode(jpeg));

        Self {
            roi_id: alarm.roi_id,
            roi_name: alarm.roi_name.clone(),
            group_id: alarm.group_id,
            group_name: alarm.group_name.clone(),
            track_id: alarm.track_id,
            class_id: alarm.class_id,
            class_name: alarm.class_name.clone(),
            confidence: alarm.confidence,
            rect: alarm.rect,
            timestamp: alarm.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            image,
        }
    }
}

/// Append the default alarm path when the configured URL has none.
pub fn endpoint_url(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    let after_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    if after_scheme.contains('/') {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, DEFAULT_ALARM_PATH)
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// One delivery attempt. Implementations must not retry internally.
pub trait AlarmTransport: Send {
    fn send(&mut self, payload: &AlarmPayload) -> Result<()>;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    url: String,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(
        server_url: &str,
        auth_token: Option<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: endpoint_url(server_url),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// Endpoint and token from the `alarm:` parameters.
    pub fn from_params(store: &dyn ParamStore, config: &AlarmConfig) -> Result<Self> {
        let server_url = store.get_string("alarm:server_url", DEFAULT_SERVER_URL);
        let token = store.get_string("alarm:auth_token", "");
        Self::new(
            &server_url,
            Some(token),
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlarmTransport for HttpTransport {
    fn send(&mut self, payload: &AlarmPayload) -> Result<()> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().context("Alarm request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_else(|_| "<no body>".to_string());
            bail!("Alarm server returned {}: {}", status, body);
        }
        Ok(())
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_secs(2),
        }
    }
}

impl From<&AlarmConfig> for DispatchSettings {
    fn from(config: &AlarmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_interval: Duration::from_millis(config.retry_interval_ms),
        }
    }
}

pub type LocalObserver = Box<dyn Fn(&AlarmInfo) + Send + Sync>;

struct Shared {
    queue: Mutex<VecDeque<AlarmInfo>>,
    signal: Condvar,
    running: AtomicBool,
}

pub struct AlarmPusher {
    shared: Arc<Shared>,
    settings: DispatchSettings,
    metrics: Option<PipelineMetrics>,
    observer: RwLock<Option<LocalObserver>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AlarmPusher {
    pub fn new(settings: DispatchSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                signal: Condvar::new(),
                running: AtomicBool::new(false),
            }),
            settings,
            metrics: None,
            observer: RwLock::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Observer called synchronously from `on_alarm` (history recording).
    pub fn set_local_observer(&self, observer: LocalObserver) {
        *self.observer.write().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Spawn the dispatch thread. The transport is moved onto it.
    pub fn start(&self, transport: Box<dyn AlarmTransport>) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            bail!("Alarm dispatcher already started");
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let settings = self.settings.clone();
        let metrics = self.metrics.clone();

        let handle = std::thread::Builder::new()
            .name("alarm-dispatch".to_string())
            .spawn(move || dispatch_loop(shared, transport, settings, metrics))
            .context("Failed to spawn alarm dispatch thread")?;
        *worker = Some(handle);

        info!("✓ Alarm dispatcher started");
        Ok(())
    }

    /// Stop the dispatch thread. Alarms still queued are dropped.
    pub fn stop(&self) {
        {
            let _queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            self.shared.running.store(false, Ordering::SeqCst);
        }
        self.shared.signal.notify_all();

        let handle = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Alarm dispatch thread panicked");
            }
            let dropped = self.queue_len();
            if dropped > 0 {
                warn!("Alarm dispatcher stopped with {} undelivered alarms", dropped);
            }
            info!("Alarm dispatcher stopped");
        }
    }

    /// Alarm callback entry point. Never blocks on the network.
    pub fn on_alarm(&self, alarm: &AlarmInfo) {
        if !self.is_running() {
            warn!(
                "Alarm dispatcher not running, dropping alarm for track {}",
                alarm.track_id
            );
            return;
        }

        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(alarm.clone());
        }
        self.shared.signal.notify_one();

        if let Some(observer) = self
            .observer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            observer(alarm);
        }
    }
}

impl Drop for AlarmPusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn AlarmTransport>,
    settings: DispatchSettings,
    metrics: Option<PipelineMetrics>,
) {
    debug!("Alarm dispatch thread running");

    loop {
        let alarm = {
            let guard = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            let mut queue = shared
                .signal
                .wait_while(guard, |q| q.is_empty() && shared.running.load(Ordering::SeqCst))
                .unwrap_or_else(|e| e.into_inner());
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }
            match queue.pop_front() {
                Some(alarm) => alarm,
                None => continue,
            }
        };

        let payload = AlarmPayload::from_alarm(&alarm);
        let delivered = deliver_with_retry(&shared, transport.as_mut(), &payload, &settings);

        if let Some(metrics) = &metrics {
            if delivered {
                metrics.inc(&metrics.push_successes);
            } else {
                metrics.inc(&metrics.push_failures);
            }
        }
    }

    debug!("Alarm dispatch thread exiting");
}

fn deliver_with_retry(
    shared: &Shared,
    transport: &mut dyn AlarmTransport,
    payload: &AlarmPayload,
    settings: &DispatchSettings,
) -> bool {
    for attempt in 1..=settings.max_attempts {
        match transport.send(payload) {
            Ok(()) => {
                info!(
                    "📤 Alarm pushed: ROI {} track {} ({})",
                    payload.roi_id, payload.track_id, payload.class_name
                );
                return true;
            }
            Err(e) => {
                warn!(
                    "Alarm push attempt {}/{} failed: {:#}",
                    attempt, settings.max_attempts, e
                );
            }
        }

        if attempt < settings.max_attempts && !wait_for_retry(shared, settings.retry_interval) {
            debug!("Shutdown during retry wait, abandoning alarm");
            return false;
        }
    }

    error!(
        "❌ Failed to push alarm for ROI {} track {} after {} attempts",
        payload.roi_id, payload.track_id, settings.max_attempts
    );
    false
}

/// Sleep for the retry interval unless shutdown is signalled first.
/// Returns false when the dispatcher was stopped.
fn wait_for_retry(shared: &Shared, interval: Duration) -> bool {
    let guard = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
    let _ = shared
        .signal
        .wait_timeout_while(guard, interval, |_| shared.running.load(Ordering::SeqCst))
        .unwrap_or_else(|e| e.into_inner());
    shared.running.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use uuid::Uuid;

    fn alarm(track_id: u32) -> AlarmInfo {
        AlarmInfo {
            alarm_id: Uuid::new_v4(),
            roi_id: 0,
            roi_name: "door".into(),
            group_id: -1,
            group_name: String::new(),
            track_id,
            class_id: 0,
            class_name: "person".into(),
            confidence: 0.9,
            rect: Rect::new(150, 150, 50, 50),
            snapshot: None,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap(),
        }
    }

    /// Fails the first `failures` calls, then succeeds; records every call.
    struct ScriptedTransport {
        failures: usize,
        calls: Arc<Mutex<Vec<(u32, Instant)>>>,
    }

    impl AlarmTransport for ScriptedTransport {
        fn send(&mut self, payload: &AlarmPayload) -> Result<()> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((payload.track_id, Instant::now()));
            if calls.len() <= self.failures {
                bail!("connection refused");
            }
            Ok(())
        }
    }

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            max_attempts: 3,
            retry_interval: Duration::from_millis(20),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_payload_shape() {
        let json = serde_json::to_value(AlarmPayload::from_alarm(&alarm(4))).unwrap();
        assert_eq!(json["roi_id"], 0);
        assert_eq!(json["group_id"], -1);
        assert_eq!(json["track_id"], 4);
        assert_eq!(json["class_name"], "person");
        assert_eq!(json["box"]["x"], 150);
        assert_eq!(json["box"]["height"], 50);
        assert_eq!(json["timestamp"], "2024-05-06T07:08:09Z");
        assert!(json.get("image").is_none());
    }

    #[test]
    fn test_payload_embeds_snapshot() {
        let mut a = alarm(1);
        a.snapshot = Some(Arc::new(RgbImage::new(4, 4)));
        let payload = AlarmPayload::from_alarm(&a);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload.image.unwrap())
            .unwrap();
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(endpoint_url("http://localhost:8080"), "http://localhost:8080/api/alarms");
        assert_eq!(endpoint_url("http://host:9000/"), "http://host:9000/api/alarms");
        assert_eq!(endpoint_url("https://host/custom/hook"), "https://host/custom/hook");
    }

    #[test]
    fn test_not_running_drops_alarm() {
        let pusher = AlarmPusher::new(fast_settings());
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        pusher.set_local_observer(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        pusher.on_alarm(&alarm(1));
        assert_eq!(pusher.queue_len(), 0);
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delivers_and_calls_observer() {
        let metrics = PipelineMetrics::new();
        let pusher = AlarmPusher::new(fast_settings()).with_metrics(metrics.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));
        pusher
            .start(Box::new(ScriptedTransport {
                failures: 0,
                calls: calls.clone(),
            }))
            .unwrap();

        let observed = Arc::new(AtomicUsize::new(0));
        let counter = observed.clone();
        pusher.set_local_observer(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        pusher.on_alarm(&alarm(1));
        pusher.on_alarm(&alarm(2));
        assert_eq!(observed.load(Ordering::SeqCst), 2);

        wait_until(|| calls.lock().unwrap().len() == 2);
        let order: Vec<u32> = calls.lock().unwrap().iter().map(|c| c.0).collect();
        assert_eq!(order, vec![1, 2]);

        pusher.stop();
        assert_eq!(metrics.summary().push_successes, 2);
    }

    #[test]
    fn test_retries_then_succeeds() {
        let pusher = AlarmPusher::new(fast_settings());
        let calls = Arc::new(Mutex::new(Vec::new()));
        pusher
            .start(Box::new(ScriptedTransport {
                failures: 2,
                calls: calls.clone(),
            }))
            .unwrap();

        pusher.on_alarm(&alarm(9));
        wait_until(|| calls.lock().unwrap().len() == 3);
        pusher.stop();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].1.duration_since(calls[0].1) >= Duration::from_millis(20));
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let metrics = PipelineMetrics::new();
        let pusher = AlarmPusher::new(fast_settings()).with_metrics(metrics.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));
        pusher
            .start(Box::new(ScriptedTransport {
                failures: usize::MAX,
                calls: calls.clone(),
            }))
            .unwrap();

        pusher.on_alarm(&alarm(1));
        wait_until(|| metrics.summary().push_failures == 1);
        pusher.stop();
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let pusher = AlarmPusher::new(DispatchSettings {
            max_attempts: 3,
            retry_interval: Duration::from_secs(30),
        });
        let calls = Arc::new(Mutex::new(Vec::new()));
        pusher
            .start(Box::new(ScriptedTransport {
                failures: usize::MAX,
                calls: calls.clone(),
            }))
            .unwrap();
        pusher.on_alarm(&alarm(1));
        wait_until(|| !calls.lock().unwrap().is_empty());

        let started = Instant::now();
        pusher.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!pusher.is_running());
        pusher.stop();

        pusher.on_alarm(&alarm(2));
        assert_eq!(pusher.queue_len(), 0);
    }

    #[test]
    fn test_double_start_rejected() {
        let pusher = AlarmPusher::new(fast_settings());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let make = || {
            Box::new(ScriptedTransport {
                failures: 0,
                calls: calls.clone(),
            })
        };
        pusher.start(make()).unwrap();
        assert!(pusher.start(make()).is_err());
    }
}
