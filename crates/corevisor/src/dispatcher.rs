//! Command Dispatcher
//!
//! The only externally reachable entry point. Maps commands onto the
//! supervisor and owns the subscriber registry that status samples and
//! latency results fan out through.
//!
//! # Usage
//!
//! ```rust,ignore
//! let dispatcher = CommandDispatcher::new(Arc::new(engine), SupervisorSettings::default())?;
//! let subscription = dispatcher.subscribe();
//!
//! dispatcher.handle(Command::Start { config }).await?;
//! let probe = dispatcher.handle(Command::MeasureLatency).await?;
//! // ... latency arrives later on subscription.recv_latency_timeout(..)
//! dispatcher.handle(Command::Stop).await?;
//! ```

use crate::config::{ConfigError, CoreConfig, SupervisorSettings};
use crate::engine::Engine;
use crate::status::StatusSample;
use crate::subscriber::{LatencyResult, ProbeId, SubscriberId, SubscriberRegistry, Subscription};
use crate::supervisor::{CoreSupervisor, RunState, StartError, Started, StopError, Stopped};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Commands accepted by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start the core with a configuration
    Start { config: CoreConfig },
    /// Stop the core (no-op when idle)
    Stop,
    /// Probe latency through the running core, result delivered out-of-band
    MeasureLatency,
}

/// Loosely-typed command as it arrives from a host bridge
///
/// ```json
/// { "command": "START", "config": { ... }, "remark": "frankfurt" }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub remark: Option<String>,
}

impl CommandRequest {
    /// Parse a request from JSON text
    pub fn from_json(text: &str) -> Result<Self, DispatchError> {
        serde_json::from_str(text).map_err(|e| DispatchError::Malformed(e.to_string()))
    }
}

impl TryFrom<CommandRequest> for Command {
    type Error = DispatchError;

    fn try_from(request: CommandRequest) -> Result<Self, Self::Error> {
        match request.command.trim().to_ascii_uppercase().as_str() {
            "START" | "START_SERVICE" => {
                let document = match request.config {
                    None | Some(Value::Null) => {
                        return Err(DispatchError::InvalidConfig(ConfigError::Missing));
                    }
                    Some(document) => document,
                };
                let config = CoreConfig {
                    remark: request.remark,
                    document,
                };
                config.validate().map_err(DispatchError::InvalidConfig)?;
                Ok(Command::Start { config })
            }
            "STOP" | "STOP_SERVICE" => Ok(Command::Stop),
            "MEASURE_DELAY" | "MEASURE_LATENCY" => Ok(Command::MeasureLatency),
            _ => Err(DispatchError::UnknownCommand(request.command)),
        }
    }
}

/// What a successfully handled command did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Started(Started),
    Stopped(Stopped),
    /// The probe runs in the background; its result carries this id
    ProbeScheduled(ProbeId),
}

/// Dispatcher errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(ConfigError),

    #[error("Start failed: {0}")]
    Start(#[from] StartError),

    #[error("Stop failed: {0}")]
    Stop(#[from] StopError),

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("No tokio runtime to run background work on")]
    NoRuntime,
}

impl DispatchError {
    /// Whether the config was rejected, at the boundary or by the supervisor
    pub fn is_invalid_config(&self) -> bool {
        matches!(
            self,
            DispatchError::InvalidConfig(_) | DispatchError::Start(StartError::InvalidConfig(_))
        )
    }

    /// Whether the engine call was cut off by its time box
    pub fn is_timeout(&self) -> bool {
        match self {
            DispatchError::Start(e) => e.is_timeout(),
            DispatchError::Stop(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Command Dispatcher
pub struct CommandDispatcher<E: Engine> {
    supervisor: Arc<CoreSupervisor<E>>,
    registry: Arc<SubscriberRegistry>,
    /// Runtime that latency measurements are spawned on
    runtime: Handle,
    next_probe: AtomicU64,
}

impl<E: Engine> CommandDispatcher<E> {
    /// Create a dispatcher bound to the tokio runtime it is created in
    ///
    /// Fails with [`DispatchError::NoRuntime`] outside a runtime context.
    pub fn new(engine: Arc<E>, settings: SupervisorSettings) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        Ok(Self::with_runtime(engine, settings, runtime))
    }

    /// Create a dispatcher that spawns background work on `runtime`
    pub fn with_runtime(engine: Arc<E>, settings: SupervisorSettings, runtime: Handle) -> Self {
        let registry = Arc::new(SubscriberRegistry::new(settings.status_queue_capacity));
        let supervisor = Arc::new(CoreSupervisor::new(engine, settings, registry.clone()));

        Self {
            supervisor,
            registry,
            runtime,
            next_probe: AtomicU64::new(1),
        }
    }

    pub fn supervisor(&self) -> &Arc<CoreSupervisor<E>> {
        &self.supervisor
    }

    pub fn state(&self) -> RunState {
        self.supervisor.state()
    }

    pub fn current_status(&self) -> StatusSample {
        self.supervisor.current_status()
    }

    /// Version reported by the engine
    pub fn core_version(&self) -> String {
        self.supervisor.engine().version()
    }

    /// Configuration of the current run, if any
    ///
    /// Read from the supervisor's run slot, so it is `None` exactly when
    /// no run exists.
    pub async fn active_config(&self) -> Option<Arc<CoreConfig>> {
        self.supervisor.active_config().await
    }

    /// Handle one command
    ///
    /// `MeasureLatency` returns as soon as the measurement is scheduled on
    /// the dispatcher's runtime; the result arrives on every subscription.
    pub async fn handle(&self, command: Command) -> Result<Dispatched, DispatchError> {
        match command {
            Command::Start { config } => {
                debug!("Dispatching Start ({})", config.label());
                match self.supervisor.start(config).await {
                    Ok(started) => Ok(Dispatched::Started(started)),
                    Err(e) => {
                        warn!("Start command failed: {}", e);
                        Err(e.into())
                    }
                }
            }
            Command::Stop => {
                debug!("Dispatching Stop");
                match self.supervisor.stop().await {
                    Ok(stopped) => Ok(Dispatched::Stopped(stopped)),
                    Err(e) => {
                        warn!("Stop command failed: {}", e);
                        Err(e.into())
                    }
                }
            }
            Command::MeasureLatency => {
                let probe = ProbeId(self.next_probe.fetch_add(1, Ordering::Relaxed));
                debug!("Dispatching MeasureLatency ({})", probe);
                self.spawn_measurement(probe);
                Ok(Dispatched::ProbeScheduled(probe))
            }
        }
    }

    /// Parse and handle a loosely-typed request
    pub async fn handle_request(&self, request: CommandRequest) -> Result<Dispatched, DispatchError> {
        let command = Command::try_from(request).inspect_err(|e| {
            warn!("Rejected command request: {}", e);
        })?;
        self.handle(command).await
    }

    fn spawn_measurement(&self, probe: ProbeId) {
        let supervisor = self.supervisor.clone();
        let registry = self.registry.clone();

        self.runtime.spawn(async move {
            let outcome = supervisor.measure_latency().await;
            let result = LatencyResult { probe, outcome };
            info!("{} finished: {} ms", probe, result.delay_millis());
            registry.publish_latency(&result);
        });
    }

    /// Register a subscriber
    ///
    /// The current sample is queued immediately, so a late subscriber
    /// starts with the present state rather than nothing.
    pub fn subscribe(&self) -> Subscription {
        let registry = &self.registry;
        self.supervisor
            .observe_status(|current| registry.register(current))
    }

    /// Remove a subscriber; unknown or repeated ids are ignored
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.registry.unregister(id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }
}
