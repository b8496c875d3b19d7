use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Price keys and quotes
// ---------------------------------------------------------------------------

/// Identity of one price series: (event, competitor, source).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PriceKey {
    pub event_id: String,
    pub competitor_id: String,
    pub source_id: String,
}

impl PriceKey {
    pub fn new(event_id: &str, competitor_id: &str, source_id: &str) -> Self {
        Self {
            event_id: event_id.to_string(),
            competitor_id: competitor_id.to_string(),
            source_id: source_id.to_string(),
        }
    }
}

impl std::fmt::Display for PriceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.event_id, self.competitor_id, self.source_id)
    }
}

/// One observed price from the feed. Transient: consumed by the price store.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub key: PriceKey,
    /// Decimal odds.
    pub price: f64,
    /// Fractional label as quoted upstream, e.g. "5/2".
    pub fractional: Option<String>,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Movement classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Movement {
    /// Price came in since the previous observation.
    Shortening,
    /// Price drifted out since the previous observation.
    Lengthening,
    /// No change observed yet.
    Stable,
}

impl Movement {
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "shortening" => Some(Movement::Shortening),
            "lengthening" => Some(Movement::Lengthening),
            "stable" => Some(Movement::Stable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Movement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Movement::Shortening => "shortening",
            Movement::Lengthening => "lengthening",
            Movement::Stable => "stable",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Persisted price state
// ---------------------------------------------------------------------------

/// Latest known price for one (event, competitor, source).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceState {
    #[serde(flatten)]
    pub key: PriceKey,
    /// Set on first observation, never changed afterwards.
    pub initial_price: f64,
    pub previous_price: Option<f64>,
    pub current_price: f64,
    /// Incremented only on an actual price change.
    pub change_count: u32,
    pub last_change_at: Option<DateTime<Utc>>,
    pub movement: Movement,
    /// Signed percentage relative to `previous_price`. None until the first change.
    pub movement_pct: Option<f64>,
    pub first_seen_at: DateTime<Utc>,
}

/// Append-only record of one actual price change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChangeEvent {
    /// Autoincrement id; None until persisted.
    pub id: Option<i64>,
    #[serde(flatten)]
    pub key: PriceKey,
    pub from_price: f64,
    pub to_price: f64,
    pub delta: f64,
    pub delta_pct: f64,
    pub direction: Movement,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events, competitors and estimator outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: String,
    pub venue: String,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
}

/// Competitor metadata plus its raw estimator outputs (the probability vector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorRecord {
    pub event_id: String,
    pub competitor_id: String,
    pub name: String,
    pub entry_number: Option<u32>,
    /// Trainer / sponsor responsible for the entry.
    pub handler: Option<String>,
    /// Silk / colours identifier used by presentation layers.
    pub visual_id: Option<String>,
    /// estimator name → raw value. Not required to sum to anything across a field.
    pub estimates: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventWithCompetitors {
    pub event: EventMeta,
    pub competitors: Vec<CompetitorRecord>,
}

/// One runner's entry as seen by the sole-entry detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub venue_id: String,
    pub handler_id: String,
    pub event_id: String,
    pub competitor_id: String,
}

// ---------------------------------------------------------------------------
// Derived scores
// ---------------------------------------------------------------------------

/// Reporting range for normalized probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbabilityScale {
    /// 0–1
    Unit,
    /// 0–100
    Percent,
}

impl ProbabilityScale {
    pub fn factor(self) -> f64 {
        match self {
            ProbabilityScale::Unit => 1.0,
            ProbabilityScale::Percent => 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueEdge {
    pub competitor_id: String,
    pub price: f64,
    /// None when the price cannot imply a probability (price <= 0).
    pub implied_probability: Option<f64>,
    /// 0–1, regardless of the reporting scale.
    pub normalized_probability: f64,
    /// normalized / implied. None excludes the competitor from value ranking.
    pub edge: Option<f64>,
    pub is_value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strength {
    Strong,
    Medium,
}

impl Strength {
    /// Presentation order: strong first.
    pub fn rank(self) -> u8 {
        match self {
            Strength::Strong => 0,
            Strength::Medium => 1,
        }
    }
}

impl std::fmt::Display for Strength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strength::Strong => write!(f, "strong"),
            Strength::Medium => write!(f, "medium"),
        }
    }
}

/// Fused alert. Recomputed on every request, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmartSignal {
    /// 1-based position in the ordered output.
    pub rank: usize,
    pub competitor_id: String,
    pub competitor_name: String,
    pub event_id: String,
    pub event_name: Option<String>,
    pub venue: String,
    pub start_time: DateTime<Utc>,
    pub source_id: String,
    pub current_price: f64,
    pub initial_price: f64,
    pub movement_pct: f64,
    pub is_top_pick: bool,
    /// Estimators whose highest normalized value in the event is this competitor. Sorted.
    pub agreeing_estimators: Vec<String>,
    /// Ensemble estimator's normalized value, in the configured reporting scale.
    pub ensemble_probability: Option<f64>,
    pub edge: Option<f64>,
    pub is_value: bool,
    pub is_sole_entry: bool,
    pub handler: Option<String>,
    pub strength: Strength,
    pub visual_id: Option<String>,
    pub entry_number: Option<u32>,
    pub change_count: u32,
    pub last_updated: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Feed cycle summary
// ---------------------------------------------------------------------------

/// Structured result of one feed poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    /// True when the cycle fell outside the active window and did nothing.
    pub gated: bool,
    /// Events in the feed payload, including ones later rejected.
    pub feed_events: usize,
    pub events: usize,
    pub competitors: usize,
    pub quotes_seen: usize,
    pub created: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Records rejected by parsing or validation.
    pub skipped_invalid: usize,
    /// Records that failed to persist.
    pub failed_persist: usize,
}

impl PollSummary {
    pub fn gated() -> Self {
        Self { gated: true, ..Self::default() }
    }
}
