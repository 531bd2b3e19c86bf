//! Corevisor - Proxy Core Supervisor
//!
//! Manages the lifecycle of a single proxy/VPN core instance and relays
//! its running state to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Host process                        │
//! │                                                           │
//! │  Command ──▶ ┌───────────────────┐     ┌───────────────┐  │
//! │              │ CommandDispatcher │────▶│CoreSupervisor │  │
//! │  Subscription│  (registry)       │     │ (run lock)    │  │
//! │   ◀───────── └───────────────────┘     └──────┬────────┘  │
//! │                    ▲  StatusSample            │           │
//! │                    └──── normalize ◀── raw ───┤           │
//! │                                               ▼           │
//! │                                     ┌──────────────────┐  │
//! │                                     │  Engine (opaque) │  │
//! │                                     └──────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **Exclusive runs**: at most one engine instance exists at a time
//! - **Idempotent stop**: stopping an idle supervisor always succeeds
//! - **Bounded waits**: every engine call is time-boxed and leaves the
//!   supervisor in a well-defined state
//! - **Non-blocking fan-out**: a stalled subscriber loses stale samples,
//!   never the newest one, and never slows the others down

mod config;
mod dispatcher;
mod engine;
mod status;
mod subscriber;
mod supervisor;
pub mod sim;

pub use config::{ConfigError, CoreConfig, SupervisorSettings};
pub use dispatcher::{Command, CommandDispatcher, CommandRequest, DispatchError, Dispatched};
pub use engine::{Engine, EngineError, RawStatus, StatusCallback};
pub use status::{ConnectionState, StatusSample, format_duration, parse_duration};
pub use subscriber::{LatencyResult, ProbeId, SubscriberId, SubscriberRegistry, Subscription};
pub use supervisor::{
    CoreSupervisor, MeasureError, RunId, RunState, StartError, Started, StatusSink, StopError,
    Stopped,
};
