//! Status samples
//!
//! Engines report status as loosely-typed raw fields. Everything here
//! turns that into an immutable [`StatusSample`]; malformed or missing
//! fields fall back to zero / `Disconnected` instead of failing.

use crate::engine::RawStatus;
use serde::Serialize;
use std::fmt;

/// Duration reported by engines when none is known
pub const DEFAULT_DURATION: &str = "00:00:00";

/// Vendor prefix some engines put in front of state tags
const STATE_TAG_PREFIX: &str = "V2RAY_";

/// Connection state as seen by subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Parse an engine state tag, e.g. `CONNECTED` or `V2RAY_CONNECTED`.
    ///
    /// Unknown tags map to `Disconnected`.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim();
        let bare = match tag.get(..STATE_TAG_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(STATE_TAG_PREFIX) => {
                &tag[STATE_TAG_PREFIX.len()..]
            }
            _ => tag,
        };

        if bare.eq_ignore_ascii_case("CONNECTED") {
            Self::Connected
        } else if bare.eq_ignore_ascii_case("CONNECTING") {
            Self::Connecting
        } else {
            Self::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// One immutable snapshot of connection and traffic state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusSample {
    pub connection_state: ConnectionState,
    /// Seconds since the connection came up; zero unless connected
    pub duration_seconds: u64,
    pub upload_speed_bps: u64,
    pub download_speed_bps: u64,
    pub upload_total_bytes: u64,
    pub download_total_bytes: u64,
}

impl StatusSample {
    /// The canonical sample reported when no run is active
    pub const fn disconnected() -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            duration_seconds: 0,
            upload_speed_bps: 0,
            download_speed_bps: 0,
            upload_total_bytes: 0,
            download_total_bytes: 0,
        }
    }

    /// Normalize a raw engine report
    pub fn from_raw(raw: &RawStatus) -> Self {
        let connection_state = raw
            .state
            .as_deref()
            .map(ConnectionState::from_tag)
            .unwrap_or_default();

        let duration_seconds = if connection_state.is_connected() {
            parse_duration(raw.duration.as_deref().unwrap_or(DEFAULT_DURATION))
        } else {
            0
        };

        Self {
            connection_state,
            duration_seconds,
            upload_speed_bps: non_negative(raw.upload_speed),
            download_speed_bps: non_negative(raw.download_speed),
            upload_total_bytes: non_negative(raw.upload_total),
            download_total_bytes: non_negative(raw.download_total),
        }
    }

    /// Keep cumulative counters from going backwards within a run
    pub fn carry_totals(mut self, previous: &StatusSample) -> Self {
        self.upload_total_bytes = self.upload_total_bytes.max(previous.upload_total_bytes);
        self.download_total_bytes = self.download_total_bytes.max(previous.download_total_bytes);
        self
    }

    pub fn is_disconnected(&self) -> bool {
        *self == Self::disconnected()
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "{} {} | up {} B/s ({:.2}MB) | down {} B/s ({:.2}MB)",
            self.connection_state,
            format_duration(self.duration_seconds),
            self.upload_speed_bps,
            self.upload_total_bytes as f64 / (1024.0 * 1024.0),
            self.download_speed_bps,
            self.download_total_bytes as f64 / (1024.0 * 1024.0),
        )
    }
}

/// Parse `HH:MM:SS` into seconds; anything else is zero
pub fn parse_duration(text: &str) -> u64 {
    let mut parts = text.trim().split(':');
    let (Some(h), Some(m), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return 0;
    };

    match (h.parse::<u64>(), m.parse::<u64>(), s.parse::<u64>()) {
        (Ok(h), Ok(m), Ok(s)) if m < 60 && s < 60 => h
            .saturating_mul(3600)
            .saturating_add(m * 60)
            .saturating_add(s),
        _ => 0,
    }
}

/// Render seconds as `HH:MM:SS`
pub fn format_duration(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

fn non_negative(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}
