//! Simulated engine
//!
//! An in-process loopback [`Engine`] for hosts without a native core and
//! for tests. It never forwards traffic; it only plays the engine's side
//! of the contract with configurable delays and failures.

use crate::config::CoreConfig;
use crate::engine::{Engine, EngineError, RawStatus, StatusCallback};
use crate::status::format_duration;
use crate::supervisor::lock_unpoisoned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Behavior knobs for [`SimulatedEngine`]
#[derive(Debug, Clone, Default)]
pub struct SimSettings {
    pub start_delay: Duration,
    pub stop_delay: Duration,
    pub probe_latency: Duration,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_probe: bool,
    /// Emit synthetic status on this interval; `None` means manual only
    pub tick_interval: Option<Duration>,
    /// Synthetic upload/download speed in bytes per second
    pub speed_bps: (u64, u64),
}

#[derive(Default)]
struct Shared {
    live: AtomicUsize,
    callbacks: Mutex<HashMap<u64, StatusCallback>>,
}

/// Handle to one simulated instance
///
/// Dropping the handle releases the instance.
pub struct SimHandle {
    id: u64,
    started_at: Instant,
    stopped: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl SimHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn release(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            lock_unpoisoned(&self.shared.callbacks).remove(&self.id);
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Loopback engine
pub struct SimulatedEngine {
    settings: Mutex<SimSettings>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    start_calls: AtomicUsize,
    last_callback: Mutex<Option<StatusCallback>>,
}

impl SimulatedEngine {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            shared: Arc::new(Shared::default()),
            next_id: AtomicU64::new(1),
            start_calls: AtomicUsize::new(0),
            last_callback: Mutex::new(None),
        }
    }

    fn settings(&self) -> SimSettings {
        lock_unpoisoned(&self.settings).clone()
    }

    /// Number of instances currently alive
    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Number of times `start` reached the engine
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::Acquire)
    }

    pub fn set_fail_start(&self, fail: bool) {
        lock_unpoisoned(&self.settings).fail_start = fail;
    }

    /// Most recently registered status callback, even if its run ended
    pub fn last_callback(&self) -> Option<StatusCallback> {
        lock_unpoisoned(&self.last_callback).clone()
    }

    /// Deliver a raw report to every live instance's callback
    pub fn push_status(&self, raw: RawStatus) {
        let callbacks: Vec<StatusCallback> = lock_unpoisoned(&self.shared.callbacks)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(raw.clone());
        }
    }

    fn spawn_ticker(&self, handle: &SimHandle, callback: StatusCallback, interval: Duration) {
        let stopped = handle.stopped.clone();
        let started_at = handle.started_at;
        let (up_speed, down_speed) = self.settings().speed_bps;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if stopped.load(Ordering::Acquire) {
                    break;
                }

                // Report in the core's wire shape so it goes through the same parser
                let elapsed = started_at.elapsed();
                let secs = elapsed.as_secs_f64();
                let payload = json!({
                    "STATE": "V2RAY_CONNECTED",
                    "DURATION": format_duration(elapsed.as_secs()),
                    "UPLOAD_SPEED": up_speed,
                    "DOWNLOAD_SPEED": down_speed,
                    "UPLOAD_TRAFFIC": (up_speed as f64 * secs) as u64,
                    "DOWNLOAD_TRAFFIC": (down_speed as f64 * secs) as u64,
                });
                callback(RawStatus::from_json(&payload.to_string()));
            }
        });
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new(SimSettings::default())
    }
}

impl Engine for SimulatedEngine {
    type Handle = SimHandle;

    async fn start(&self, config: &CoreConfig) -> Result<SimHandle, EngineError> {
        self.start_calls.fetch_add(1, Ordering::AcqRel);
        let settings = self.settings();
        tokio::time::sleep(settings.start_delay).await;

        if settings.fail_start {
            return Err(EngineError::StartFailed("simulated start failure".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.live.fetch_add(1, Ordering::AcqRel);
        debug!("Simulated instance {} up ({})", id, config.label());

        Ok(SimHandle {
            id,
            started_at: Instant::now(),
            stopped: Arc::new(AtomicBool::new(false)),
            shared: self.shared.clone(),
        })
    }

    async fn stop(&self, handle: &SimHandle) -> Result<(), EngineError> {
        let settings = self.settings();
        tokio::time::sleep(settings.stop_delay).await;
        handle.release();
        debug!("Simulated instance {} down", handle.id);

        if settings.fail_stop {
            return Err(EngineError::StopFailed("simulated stop failure".into()));
        }
        Ok(())
    }

    async fn probe_latency(&self, handle: &SimHandle) -> Result<Duration, EngineError> {
        let settings = self.settings();
        tokio::time::sleep(settings.probe_latency).await;

        if handle.stopped.load(Ordering::Acquire) {
            return Err(EngineError::HandleLost);
        }
        if settings.fail_probe {
            return Err(EngineError::ProbeFailed("simulated probe failure".into()));
        }
        Ok(settings.probe_latency)
    }

    fn on_status(&self, handle: &SimHandle, callback: StatusCallback) {
        if handle.stopped.load(Ordering::Acquire) {
            return;
        }
        lock_unpoisoned(&self.shared.callbacks).insert(handle.id, callback.clone());
        *lock_unpoisoned(&self.last_callback) = Some(callback.clone());

        if let Some(interval) = self.settings().tick_interval {
            self.spawn_ticker(handle, callback, interval);
        }
    }

    fn version(&self) -> String {
        format!("simulated/{}", env!("CARGO_PKG_VERSION"))
    }
}
