//! Corevisor host
//!
//! Headless wiring harness: loads settings, drives a simulated core
//! through one start / probe / stop session and logs every status sample
//! and latency result it receives.
//!
//! ```text
//! corevisor-host [settings.toml] [core-config.json]
//! ```

use anyhow::{Context, Result};
use corevisor::sim::{SimSettings, SimulatedEngine};
use corevisor::{Command, CommandDispatcher, CoreConfig, Subscription, SupervisorSettings};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long the core stays up before the session stops it
const SESSION_LENGTH: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let settings = load_settings(args.next())?;
    let config = load_core_config(args.next())?;

    // Initialize logging
    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let engine = Arc::new(SimulatedEngine::new(SimSettings {
        start_delay: Duration::from_millis(150),
        stop_delay: Duration::from_millis(50),
        probe_latency: Duration::from_millis(80),
        tick_interval: Some(Duration::from_millis(500)),
        speed_bps: (48_000, 320_000),
        ..SimSettings::default()
    }));
    let dispatcher = CommandDispatcher::new(engine, settings)?;
    info!("corevisor-host starting (core {})", dispatcher.core_version());

    let running = Arc::new(AtomicBool::new(true));
    let watcher = {
        let subscription = dispatcher.subscribe();
        let running = running.clone();
        tokio::task::spawn_blocking(move || watch(subscription, &running))
    };

    dispatcher
        .handle(Command::Start { config })
        .await
        .context("starting core")?;

    tokio::time::sleep(SESSION_LENGTH / 2).await;
    dispatcher.handle(Command::MeasureLatency).await?;
    tokio::time::sleep(SESSION_LENGTH / 2).await;

    match dispatcher.handle(Command::Stop).await {
        Ok(_) => {}
        Err(e) if e.is_timeout() => warn!("Core did not stop in time, handle released: {}", e),
        Err(e) => error!("Stop reported an error: {}", e),
    }

    // Let the final disconnected sample drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.store(false, Ordering::Release);
    watcher.await?;

    info!("corevisor-host shutting down");
    Ok(())
}

fn load_settings(path: Option<String>) -> Result<SupervisorSettings> {
    let Some(path) = path else {
        return Ok(SupervisorSettings::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    SupervisorSettings::from_toml_str(&text).with_context(|| format!("parsing {}", path))
}

fn load_core_config(path: Option<String>) -> Result<CoreConfig> {
    let Some(path) = path else {
        return Ok(CoreConfig::new(json!({
            "inbounds": [{ "protocol": "socks", "port": 10808, "listen": "127.0.0.1" }],
            "outbounds": [{ "protocol": "freedom", "tag": "direct" }],
        }))
        .with_remark("loopback"));
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
    let config = CoreConfig::from_json(&text).with_context(|| format!("parsing {}", path))?;
    Ok(config.with_remark(path))
}

fn watch(subscription: Subscription, running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        if let Some(sample) = subscription.recv_status_timeout(Duration::from_millis(100)) {
            info!("status: {}", sample.format());
        }
        while let Some(result) = subscription.try_recv_latency() {
            info!("latency {}: {} ms", result.probe, result.delay_millis());
        }
    }
}
