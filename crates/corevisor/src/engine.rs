//! Engine boundary
//!
//! The proxy core itself is opaque. The supervisor only needs four
//! primitives from it: start, stop, probe latency, and a periodic raw
//! status report.
//!
//! # Contract
//!
//! - `start` returns a handle that stays valid until `stop` is called on it
//! - `stop` is best-effort and idempotent
//! - `probe_latency` may take arbitrarily long; the supervisor bounds it
//! - callbacks registered with `on_status` may fire from any thread

use crate::config::CoreConfig;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by the engine with each raw status report
pub type StatusCallback = Arc<dyn Fn(RawStatus) + Send + Sync>;

/// Proxy/VPN core engine
pub trait Engine: Send + Sync + 'static {
    /// Handle to one running engine instance
    type Handle: Send + Sync + 'static;

    /// Start an instance with the given configuration
    fn start(
        &self,
        config: &CoreConfig,
    ) -> impl Future<Output = Result<Self::Handle, EngineError>> + Send;

    /// Shut an instance down
    fn stop(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Measure round-trip latency through the running instance
    fn probe_latency(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<Duration, EngineError>> + Send;

    /// Register the periodic status callback for an instance
    fn on_status(&self, handle: &Self::Handle, callback: StatusCallback);

    /// Engine version string
    fn version(&self) -> String {
        "unknown".to_string()
    }
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine failed to start: {0}")]
    StartFailed(String),

    #[error("Engine failed to stop: {0}")]
    StopFailed(String),

    #[error("Latency probe failed: {0}")]
    ProbeFailed(String),

    #[error("Engine instance is gone")]
    HandleLost,
}

/// Raw status fields as reported by the engine
///
/// Every field is optional; normalization happens in
/// [`StatusSample::from_raw`](crate::StatusSample::from_raw).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawStatus {
    /// Connection state tag, e.g. `V2RAY_CONNECTED`
    pub state: Option<String>,
    /// Connection duration as `HH:MM:SS`
    pub duration: Option<String>,
    pub upload_speed: Option<i64>,
    pub download_speed: Option<i64>,
    pub upload_total: Option<i64>,
    pub download_total: Option<i64>,
}

impl RawStatus {
    /// Parse a JSON status payload leniently.
    ///
    /// Keys are matched case-insensitively (`STATE`, `DURATION`,
    /// `UPLOAD_SPEED`, `DOWNLOAD_SPEED`, `UPLOAD_TRAFFIC`,
    /// `DOWNLOAD_TRAFFIC`). Counters may be numbers or numeric strings.
    /// A payload that is not a JSON object yields an empty report.
    pub fn from_json(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => {
                let field = |name: &str| {
                    map.iter()
                        .find(|(key, _)| key.eq_ignore_ascii_case(name))
                        .map(|(_, value)| value)
                };

                Self {
                    state: field("state").and_then(text_field),
                    duration: field("duration").and_then(text_field),
                    upload_speed: field("upload_speed").and_then(int_field),
                    download_speed: field("download_speed").and_then(int_field),
                    upload_total: field("upload_traffic").and_then(int_field),
                    download_total: field("download_traffic").and_then(int_field),
                }
            }
            _ => Self::default(),
        }
    }
}

fn text_field(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn int_field(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|v| i64::try_from(v).unwrap_or(i64::MAX))),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
