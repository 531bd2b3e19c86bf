//! Core Supervisor
//!
//! Sole owner of the engine handle and the single source of truth for
//! whether a core instance is running.
//!
//! # State machine
//!
//! ```text
//!            start ok                     stop
//!   Idle ──▶ Starting ──▶ Running ──▶ Stopping ──▶ Idle
//!              │
//!              └── engine error / timeout ──▶ Idle
//! ```
//!
//! `start` and `stop` take the write half of the run lock, so they are
//! serialized against each other. Latency probes take the read half: any
//! number may run together, but never alongside a `stop`.

use crate::config::{ConfigError, CoreConfig, SupervisorSettings};
use crate::engine::{Engine, EngineError, RawStatus};
use crate::status::StatusSample;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Supervisor run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// No engine instance exists
    Idle,
    /// Engine start in progress
    Starting,
    /// Engine instance is up
    Running,
    /// Engine shutdown in progress
    Stopping,
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        matches!(self, RunState::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }

    /// Whether the engine is coming up or up, as opposed to idle or going down
    pub fn has_engine(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }
}

/// Identifier of one engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Run({})", self.0)
    }
}

/// Receiver of normalized status samples
pub trait StatusSink: Send + Sync {
    /// Must not block
    fn publish(&self, sample: &StatusSample);
}

/// Successful start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub run: RunId,
}

/// Successful stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// A run was shut down
    Halted { run: RunId, uptime: Duration },
    /// Nothing was running
    NotRunning,
}

/// Start errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Core already running")]
    AlreadyRunning,

    #[error("Engine failure: {0}")]
    EngineFailure(EngineError),

    #[error("Engine start timed out after {0:?}")]
    Timeout(Duration),
}

impl StartError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StartError::Timeout(_))
    }
}

/// Stop errors
///
/// The run is always torn down before one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopError {
    #[error("Engine failure: {0}")]
    EngineFailure(EngineError),

    #[error("Engine stop timed out after {0:?}")]
    Timeout(Duration),
}

impl StopError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StopError::Timeout(_))
    }
}

/// Latency probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasureError {
    #[error("Core not running")]
    NotRunning,

    #[error("Latency probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error("Engine failure: {0}")]
    EngineFailure(EngineError),
}

impl MeasureError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, MeasureError::ProbeTimeout(_))
    }
}

/// Lock a std mutex, recovering from poisoning.
///
/// Guarded values here are plain data that is never left half-written.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveRun<H> {
    id: RunId,
    handle: H,
    config: Arc<CoreConfig>,
    started_at: Instant,
}

struct RelayCell {
    /// Run whose samples are currently accepted
    run: Option<RunId>,
    latest: StatusSample,
}

/// Normalizes raw reports and forwards them to the sink.
///
/// The latest sample and the publish happen under one lock, so anything
/// reading through [`StatusRelay::observe`] sees each sample exactly once.
struct StatusRelay {
    cell: Mutex<RelayCell>,
    sink: Arc<dyn StatusSink>,
}

impl StatusRelay {
    fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            cell: Mutex::new(RelayCell {
                run: None,
                latest: StatusSample::disconnected(),
            }),
            sink,
        }
    }

    fn begin(&self, run: RunId) {
        let mut cell = lock_unpoisoned(&self.cell);
        cell.run = Some(run);
        cell.latest = StatusSample::disconnected();
    }

    fn accept(&self, run: RunId, raw: RawStatus) {
        let mut cell = lock_unpoisoned(&self.cell);
        if cell.run != Some(run) {
            debug!("Discarding status from stale {}", run);
            return;
        }

        let sample = StatusSample::from_raw(&raw).carry_totals(&cell.latest);
        cell.latest = sample;
        self.sink.publish(&sample);
    }

    fn end(&self) {
        let mut cell = lock_unpoisoned(&self.cell);
        cell.run = None;
        if !cell.latest.is_disconnected() {
            cell.latest = StatusSample::disconnected();
            self.sink.publish(&cell.latest);
        }
    }

    fn latest(&self) -> StatusSample {
        lock_unpoisoned(&self.cell).latest
    }

    fn observe<R>(&self, f: impl FnOnce(&StatusSample) -> R) -> R {
        let cell = lock_unpoisoned(&self.cell);
        f(&cell.latest)
    }
}

/// Resets the supervisor to `Idle` unless the transition was committed.
///
/// Covers engine errors, timeouts and a caller dropping the future
/// mid-transition alike.
struct TransitionGuard<'a> {
    state: &'a StdRwLock<RunState>,
    relay: &'a StatusRelay,
    committed: bool,
}

impl TransitionGuard<'_> {
    fn commit(mut self, to: RunState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = to;
        self.committed = true;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.relay.end();
            *self.state.write().unwrap_or_else(PoisonError::into_inner) = RunState::Idle;
        }
    }
}

/// Core Supervisor
///
/// Owns the one engine instance and every transition of [`RunState`].
pub struct CoreSupervisor<E: Engine> {
    engine: Arc<E>,
    settings: SupervisorSettings,
    /// Write half: start/stop. Read half: probes.
    run: RwLock<Option<ActiveRun<E::Handle>>>,
    /// Only written while `run` is write-locked
    state: StdRwLock<RunState>,
    relay: Arc<StatusRelay>,
    next_run: AtomicU64,
}

impl<E: Engine> CoreSupervisor<E> {
    /// Create a supervisor that publishes status into `sink`
    pub fn new(engine: Arc<E>, settings: SupervisorSettings, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            engine,
            settings,
            run: RwLock::new(None),
            state: StdRwLock::new(RunState::Idle),
            relay: Arc::new(StatusRelay::new(sink)),
            next_run: AtomicU64::new(1),
        }
    }

    /// Get current state
    pub fn state(&self) -> RunState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    fn set_state(&self, to: RunState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = to;
    }

    /// Start the engine
    ///
    /// 1. Rejects if a run exists or the config is invalid
    /// 2. Starts the engine, bounded by the start timeout
    /// 3. Hooks the engine's status reports into the relay
    pub async fn start(&self, config: CoreConfig) -> Result<Started, StartError> {
        let mut slot = self.run.write().await;
        if slot.is_some() {
            warn!("Start rejected: core already running");
            return Err(StartError::AlreadyRunning);
        }
        if let Err(e) = config.validate() {
            warn!("Start rejected: {}", e);
            return Err(StartError::InvalidConfig(e));
        }

        let run = RunId(self.next_run.fetch_add(1, Ordering::Relaxed));
        let config = Arc::new(config);
        info!("Starting core ({}, config {})", run, config.label());

        self.set_state(RunState::Starting);
        self.relay.begin(run);
        let guard = TransitionGuard {
            state: &self.state,
            relay: &self.relay,
            committed: false,
        };

        let timeout = self.settings.start_timeout();
        let handle = match tokio::time::timeout(timeout, self.engine.start(&config)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!("Core start failed ({}): {}", run, e);
                return Err(StartError::EngineFailure(e));
            }
            Err(_) => {
                error!("Core start timed out after {:?} ({})", timeout, run);
                return Err(StartError::Timeout(timeout));
            }
        };

        let relay = self.relay.clone();
        self.engine.on_status(
            &handle,
            Arc::new(move |raw: RawStatus| relay.accept(run, raw)),
        );

        *slot = Some(ActiveRun {
            id: run,
            handle,
            config,
            started_at: Instant::now(),
        });
        guard.commit(RunState::Running);

        info!("Core running ({})", run);
        Ok(Started { run })
    }

    /// Stop the engine
    ///
    /// Always safe: from `Idle` this is a no-op returning
    /// [`Stopped::NotRunning`]. Otherwise the handle is released and the
    /// supervisor is back in `Idle` whether or not the engine stopped
    /// cleanly.
    pub async fn stop(&self) -> Result<Stopped, StopError> {
        let mut slot = self.run.write().await;
        let Some(active) = slot.take() else {
            debug!("Stop ignored: core not running");
            return Ok(Stopped::NotRunning);
        };

        info!("Stopping core ({})", active.id);
        self.set_state(RunState::Stopping);
        let _guard = TransitionGuard {
            state: &self.state,
            relay: &self.relay,
            committed: false,
        };

        let timeout = self.settings.stop_timeout();
        let result = tokio::time::timeout(timeout, self.engine.stop(&active.handle)).await;
        let uptime = active.started_at.elapsed();
        let run = active.id;
        drop(active);

        match result {
            Ok(Ok(())) => {
                info!("Core stopped ({}, up {:?})", run, uptime);
                Ok(Stopped::Halted { run, uptime })
            }
            Ok(Err(e)) => {
                warn!("Core stop failed ({}): {}", run, e);
                Err(StopError::EngineFailure(e))
            }
            Err(_) => {
                error!("Core stop timed out after {:?} ({})", timeout, run);
                Err(StopError::Timeout(timeout))
            }
        }
    }

    /// Measure latency through the running engine
    pub async fn measure_latency(&self) -> Result<Duration, MeasureError> {
        let slot = self.run.read().await;
        let Some(active) = slot.as_ref() else {
            return Err(MeasureError::NotRunning);
        };

        let timeout = self.settings.probe_timeout();
        match tokio::time::timeout(timeout, self.engine.probe_latency(&active.handle)).await {
            Ok(Ok(latency)) => {
                debug!("Latency probe ({}): {:?}", active.id, latency);
                Ok(latency)
            }
            Ok(Err(e)) => {
                warn!("Latency probe failed ({}): {}", active.id, e);
                Err(MeasureError::EngineFailure(e))
            }
            Err(_) => {
                warn!("Latency probe timed out after {:?} ({})", timeout, active.id);
                Err(MeasureError::ProbeTimeout(timeout))
            }
        }
    }

    /// Current status snapshot
    ///
    /// Disconnected unless a run is starting or up.
    pub fn current_status(&self) -> StatusSample {
        if !self.state().has_engine() {
            StatusSample::disconnected()
        } else {
            self.relay.latest()
        }
    }

    /// Run `f` on the current sample while no new sample can be published
    pub fn observe_status<R>(&self, f: impl FnOnce(&StatusSample) -> R) -> R {
        self.relay.observe(f)
    }

    /// Id of the active run
    pub async fn active_run(&self) -> Option<RunId> {
        self.run.read().await.as_ref().map(|active| active.id)
    }

    /// Configuration of the active run
    pub async fn active_config(&self) -> Option<Arc<CoreConfig>> {
        self.run
            .read()
            .await
            .as_ref()
            .map(|active| active.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimSettings, SimulatedEngine};
    use crate::status::ConnectionState;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        samples: Mutex<Vec<StatusSample>>,
    }

    impl StatusSink for Recorder {
        fn publish(&self, sample: &StatusSample) {
            lock_unpoisoned(&self.samples).push(*sample);
        }
    }

    impl Recorder {
        fn taken(&self) -> Vec<StatusSample> {
            std::mem::take(&mut *lock_unpoisoned(&self.samples))
        }
    }

    fn config(name: &str) -> CoreConfig {
        CoreConfig::new(json!({ "outbounds": [{ "tag": name }] })).with_remark(name)
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            start_timeout_ms: 200,
            stop_timeout_ms: 200,
            probe_timeout_ms: 200,
            ..SupervisorSettings::default()
        }
    }

    fn supervisor(
        sim: SimSettings,
    ) -> (Arc<CoreSupervisor<SimulatedEngine>>, Arc<SimulatedEngine>, Arc<Recorder>) {
        let engine = Arc::new(SimulatedEngine::new(sim));
        let recorder = Arc::new(Recorder::default());
        let supervisor = Arc::new(CoreSupervisor::new(
            engine.clone(),
            settings(),
            recorder.clone(),
        ));
        (supervisor, engine, recorder)
    }

    fn connected(total: i64) -> RawStatus {
        RawStatus {
            state: Some("V2RAY_CONNECTED".into()),
            duration: Some("00:00:05".into()),
            upload_speed: Some(1),
            download_speed: Some(2),
            upload_total: Some(total),
            download_total: Some(total),
        }
    }

    #[test]
    fn test_run_state() {
        assert!(RunState::Idle.is_idle());
        assert!(RunState::Running.is_running());
        assert!(RunState::Starting.has_engine());
        assert!(!RunState::Stopping.has_engine());
    }

    #[tokio::test]
    async fn test_start_stop_scenario() {
        let (sup, engine, _) = supervisor(SimSettings::default());

        let started = sup.start(config("a")).await.unwrap();
        assert_eq!(sup.state(), RunState::Running);
        assert_eq!(sup.active_run().await, Some(started.run));
        assert_eq!(engine.live_handles(), 1);

        assert_eq!(sup.start(config("b")).await, Err(StartError::AlreadyRunning));
        assert_eq!(engine.live_handles(), 1);
        assert_eq!(sup.active_config().await.unwrap().label(), "a");

        assert!(matches!(sup.stop().await, Ok(Stopped::Halted { .. })));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(engine.live_handles(), 0);
        assert!(sup.active_config().await.is_none());

        assert_eq!(sup.stop().await, Ok(Stopped::NotRunning));
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_creates_nothing() {
        let (sup, engine, _) = supervisor(SimSettings::default());

        let result = sup.start(CoreConfig::new(serde_json::Value::Null)).await;
        assert_eq!(result, Err(StartError::InvalidConfig(ConfigError::NotAnObject)));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(engine.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_engine_start_failure_returns_to_idle() {
        let (sup, engine, _) = supervisor(SimSettings {
            fail_start: true,
            ..SimSettings::default()
        });

        let result = sup.start(config("a")).await;
        assert!(matches!(result, Err(StartError::EngineFailure(_))));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(engine.live_handles(), 0);

        // Retrying is allowed once the engine recovers
        engine.set_fail_start(false);
        assert!(sup.start(config("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_timeout_returns_to_idle() {
        let (sup, _, _) = supervisor(SimSettings {
            start_delay: Duration::from_secs(5),
            ..SimSettings::default()
        });

        let result = sup.start(config("a")).await;
        assert_eq!(result, Err(StartError::Timeout(Duration::from_millis(200))));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_start_returns_to_idle() {
        let (sup, _, _) = supervisor(SimSettings {
            start_delay: Duration::from_millis(150),
            ..SimSettings::default()
        });

        let pending = sup.start(config("a"));
        let outcome = tokio::time::timeout(Duration::from_millis(20), pending).await;
        assert!(outcome.is_err());
        assert_eq!(sup.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_stop_failure_still_releases() {
        let (sup, engine, _) = supervisor(SimSettings {
            fail_stop: true,
            ..SimSettings::default()
        });

        sup.start(config("a")).await.unwrap();
        assert!(matches!(sup.stop().await, Err(StopError::EngineFailure(_))));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_exclusive() {
        let (sup, engine, _) = supervisor(SimSettings {
            start_delay: Duration::from_millis(30),
            ..SimSettings::default()
        });

        let a = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(config("a")).await }
        });
        let b = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(config("b")).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.contains(&Err(StartError::AlreadyRunning)));
        assert_eq!(engine.live_handles(), 1);
        assert_eq!(sup.state(), RunState::Running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_waits_for_starting() {
        let (sup, engine, _) = supervisor(SimSettings {
            start_delay: Duration::from_millis(50),
            ..SimSettings::default()
        });

        let start = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(config("a")).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sup.state(), RunState::Starting);

        let stopped = sup.stop().await.unwrap();
        assert!(start.await.unwrap().is_ok());
        assert!(matches!(stopped, Stopped::Halted { .. }));
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_measure_latency() {
        let (sup, _, _) = supervisor(SimSettings {
            probe_latency: Duration::from_millis(5),
            ..SimSettings::default()
        });

        assert_eq!(sup.measure_latency().await, Err(MeasureError::NotRunning));

        sup.start(config("a")).await.unwrap();
        assert_eq!(sup.measure_latency().await, Ok(Duration::from_millis(5)));
    }

    #[tokio::test]
    async fn test_measure_latency_timeout() {
        let (sup, _, _) = supervisor(SimSettings {
            probe_latency: Duration::from_secs(5),
            ..SimSettings::default()
        });

        sup.start(config("a")).await.unwrap();
        let result = sup.measure_latency().await;
        assert_eq!(result, Err(MeasureError::ProbeTimeout(Duration::from_millis(200))));

        // A slow probe is not a supervisor fault
        assert_eq!(sup.state(), RunState::Running);
    }

    #[tokio::test]
    async fn test_status_relay() {
        let (sup, engine, recorder) = supervisor(SimSettings::default());

        assert!(sup.current_status().is_disconnected());
        engine.push_status(connected(100));
        assert!(recorder.taken().is_empty());

        sup.start(config("a")).await.unwrap();
        assert!(sup.current_status().is_disconnected());

        engine.push_status(connected(100));
        engine.push_status(connected(40));
        let samples = recorder.taken();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].connection_state, ConnectionState::Connected);
        assert_eq!(samples[0].duration_seconds, 5);
        // Totals never go backwards within a run
        assert_eq!(samples[1].upload_total_bytes, 100);
        assert_eq!(sup.current_status(), samples[1]);

        sup.stop().await.unwrap();
        assert_eq!(recorder.taken(), vec![StatusSample::disconnected()]);
        assert!(sup.current_status().is_disconnected());
    }

    #[tokio::test]
    async fn test_stale_run_samples_discarded() {
        let (sup, engine, recorder) = supervisor(SimSettings::default());

        sup.start(config("a")).await.unwrap();
        let stale = engine.last_callback().unwrap();
        sup.stop().await.unwrap();
        sup.start(config("b")).await.unwrap();
        recorder.taken();

        stale(connected(999));
        assert!(recorder.taken().is_empty());
        assert!(sup.current_status().is_disconnected());
    }

    #[tokio::test]
    async fn test_stop_timeout_returns_to_idle() {
        let (sup, engine, recorder) = supervisor(SimSettings {
            stop_delay: Duration::from_secs(5),
            ..SimSettings::default()
        });
        sup.start(config("a")).await.unwrap();
        engine.push_status(connected(10));
        recorder.taken();

        let result = sup.stop().await;
        assert_eq!(result, Err(StopError::Timeout(Duration::from_millis(200))));
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(sup.state(), RunState::Idle);
        assert_eq!(sup.active_run().await, None);
        assert_eq!(engine.live_handles(), 0);
        assert_eq!(recorder.taken(), vec![StatusSample::disconnected()]);

        // The supervisor is usable again
        sup.start(config("b")).await.unwrap();
        assert_eq!(engine.live_handles(), 1);
    }

    #[tokio::test]
    async fn test_latency_checks_run_concurrently() {
        let (sup, _, _) = supervisor(SimSettings {
            probe_latency: Duration::from_millis(100),
            ..SimSettings::default()
        });
        sup.start(config("a")).await.unwrap();

        let began = Instant::now();
        let (a, b, c) = tokio::join!(
            sup.measure_latency(),
            sup.measure_latency(),
            sup.measure_latency()
        );
        let elapsed = began.elapsed();

        for result in [a, b, c] {
            assert_eq!(result, Ok(Duration::from_millis(100)));
        }
        assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_latency_check() {
        let (sup, engine, _) = supervisor(SimSettings {
            probe_latency: Duration::from_millis(100),
            ..SimSettings::default()
        });
        sup.start(config("a")).await.unwrap();

        let measuring = tokio::spawn({
            let sup = sup.clone();
            async move { sup.measure_latency().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let began = Instant::now();
        let stopped = sup.stop().await.unwrap();
        let waited = began.elapsed();

        // The measurement kept its handle until it finished
        assert_eq!(measuring.await.unwrap(), Ok(Duration::from_millis(100)));
        assert!(matches!(stopped, Stopped::Halted { .. }));
        assert!(waited >= Duration::from_millis(70), "waited {:?}", waited);
        assert_eq!(engine.live_handles(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_disconnected_while_stopping() {
        let (sup, engine, _) = supervisor(SimSettings {
            stop_delay: Duration::from_millis(100),
            ..SimSettings::default()
        });
        sup.start(config("a")).await.unwrap();
        engine.push_status(connected(10));
        assert!(!sup.current_status().is_disconnected());

        let stopping = tokio::spawn({
            let sup = sup.clone();
            async move { sup.stop().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sup.state(), RunState::Stopping);
        assert!(sup.current_status().is_disconnected());
        assert!(stopping.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_command_sequences_match_model() {
        let (sup, engine, _) = supervisor(SimSettings::default());
        let mut running = false;
        // Small LCG so every run replays the same sequence
        let mut seed: u32 = 0x2545_f491;

        for step in 0..300 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let fail_start = (seed >> 8) % 5 == 0;
            engine.set_fail_start(fail_start);

            match (seed >> 16) % 3 {
                0 => {
                    let result = sup.start(config(&format!("s{}", step))).await;
                    match (running, fail_start) {
                        (true, _) => assert_eq!(result, Err(StartError::AlreadyRunning)),
                        (false, true) => {
                            assert!(matches!(result, Err(StartError::EngineFailure(_))))
                        }
                        (false, false) => {
                            assert!(result.is_ok());
                            running = true;
                        }
                    }
                }
                1 => {
                    let result = sup.stop().await.unwrap();
                    assert_eq!(matches!(result, Stopped::Halted { .. }), running);
                    running = false;
                }
                _ => {
                    let result = sup.measure_latency().await;
                    assert_eq!(result.is_ok(), running);
                }
            }

            let state = sup.state();
            assert_eq!(state.is_running(), running, "step {}", step);
            assert_eq!(state.is_idle(), !running, "step {}", step);
            assert_eq!(state.has_engine(), running, "step {}", step);
            assert_eq!(engine.live_handles(), usize::from(running), "step {}", step);
            assert_eq!(sup.active_config().await.is_some(), running, "step {}", step);
            if !running {
                assert!(sup.current_status().is_disconnected());
            }
        }
    }
}
