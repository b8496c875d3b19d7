use chrono::{FixedOffset, NaiveTime};

use crate::error::{AppError, Result};
use crate::types::ProbabilityScale;

/// Per-call timeout for the upstream feed (seconds).
pub const FEED_TIMEOUT_SECS: u64 = 12;

/// Feed poll cadence (seconds).
pub const POLL_INTERVAL_SECS: u64 = 60;

/// Two prices closer than this are the same price regardless of the configured noise floor.
pub const PRICE_EPSILON: f64 = 1e-9;

/// Slack on percentage thresholds so a move of exactly the threshold size qualifies.
pub const MOVE_PCT_EPSILON: f64 = 1e-9;

/// Maximum bound parameters per bulk `IN (...)` read.
pub const BULK_READ_CHUNK_SIZE: usize = 500;

/// Tolerance used when comparing normalized probabilities for top-pick ties.
pub const TOP_PICK_EPSILON: f64 = 1e-12;

/// Signal defaults.
pub mod signal_defaults {
    pub const MIN_MOVE_PCT: f64 = 10.0;
    pub const VALUE_EDGE_THRESHOLD: f64 = 1.1;
    pub const ENSEMBLE_ESTIMATOR: &str = "ensemble";
}

/// Daily window in which the feed poller does any work. An end earlier than the start
/// wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl Default for ActiveWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(21, 30, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed_url: String,
    pub feed_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub active_window: ActiveWindow,
    /// Fixed offset used for the active-hours gate and for deciding which day is "today".
    pub tz: FixedOffset,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub signals: SignalConfig,
}

/// Thresholds shared by the price store, the value calculator and the fusion engine.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Absolute decimal-price deltas below this are feed jitter (PRICE_NOISE_FLOOR).
    pub noise_floor: f64,
    /// Minimum shortening magnitude, in percent, for a smart signal (SIGNAL_MIN_MOVE_PCT).
    pub min_move_pct: f64,
    /// Edge above which a competitor is a value candidate (VALUE_EDGE_THRESHOLD).
    pub value_edge_threshold: f64,
    /// Estimator used for the ensemble probability and edge (ENSEMBLE_ESTIMATOR).
    pub ensemble_estimator: String,
    /// Reporting range for normalized probabilities (PROBABILITY_SCALE).
    pub scale: ProbabilityScale,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            noise_floor: 0.0,
            min_move_pct: signal_defaults::MIN_MOVE_PCT,
            value_edge_threshold: signal_defaults::VALUE_EDGE_THRESHOLD,
            ensemble_estimator: signal_defaults::ENSEMBLE_ESTIMATOR.to_string(),
            scale: ProbabilityScale::Unit,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let feed_url = std::env::var("FEED_URL")
            .map_err(|_| AppError::Config("FEED_URL must be set".to_string()))?;

        let active_window = ActiveWindow {
            start: parse_time_var("ACTIVE_WINDOW_START", "07:00")?,
            end: parse_time_var("ACTIVE_WINDOW_END", "21:30")?,
        };

        let offset_hours: i32 = parse_var("UTC_OFFSET_HOURS", "0")?;
        let tz = FixedOffset::east_opt(offset_hours * 3600).ok_or_else(|| {
            AppError::Config(format!("UTC_OFFSET_HOURS out of range: {offset_hours}"))
        })?;

        let scale = match std::env::var("PROBABILITY_SCALE")
            .unwrap_or_else(|_| "unit".to_string())
            .to_lowercase()
            .as_str()
        {
            "unit" => ProbabilityScale::Unit,
            "percent" => ProbabilityScale::Percent,
            other => {
                return Err(AppError::Config(format!(
                    "PROBABILITY_SCALE must be 'unit' or 'percent', got '{other}'"
                )))
            }
        };

        Ok(Self {
            feed_url,
            feed_timeout_secs: parse_var("FEED_TIMEOUT_SECS", &FEED_TIMEOUT_SECS.to_string())?,
            poll_interval_secs: parse_var("POLL_INTERVAL_SECS", &POLL_INTERVAL_SECS.to_string())?,
            active_window,
            tz,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "signals.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            signals: SignalConfig {
                noise_floor: parse_var("PRICE_NOISE_FLOOR", "0.0")?,
                min_move_pct: parse_var("SIGNAL_MIN_MOVE_PCT", &signal_defaults::MIN_MOVE_PCT.to_string())?,
                value_edge_threshold: parse_var(
                    "VALUE_EDGE_THRESHOLD",
                    &signal_defaults::VALUE_EDGE_THRESHOLD.to_string(),
                )?,
                ensemble_estimator: std::env::var("ENSEMBLE_ESTIMATOR")
                    .unwrap_or_else(|_| signal_defaults::ENSEMBLE_ESTIMATOR.to_string()),
                scale,
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::Config(format!("{name} has an invalid value: '{raw}'")))
}

fn parse_time_var(name: &str, default: &str) -> Result<NaiveTime> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| AppError::Config(format!("{name} must be HH:MM, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn daytime_window_is_half_open() {
        let w = ActiveWindow { start: t(7, 0), end: t(21, 30) };
        assert!(w.contains(t(7, 0)));
        assert!(w.contains(t(12, 0)));
        assert!(!w.contains(t(21, 30)));
        assert!(!w.contains(t(6, 59)));
    }

    #[test]
    fn window_wraps_midnight() {
        let w = ActiveWindow { start: t(22, 0), end: t(2, 0) };
        assert!(w.contains(t(23, 15)));
        assert!(w.contains(t(1, 0)));
        assert!(!w.contains(t(12, 0)));
    }
}
