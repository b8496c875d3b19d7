use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::error::{AppError, Result};
use crate::state::price_state::validate_price;
use crate::types::{CompetitorRecord, EventMeta, EventWithCompetitors, PriceKey, PriceQuote};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Accepts either `{"events": [...]}` or a bare array of events.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Wrapped { events: Vec<FeedEvent> },
    Bare(Vec<FeedEvent>),
}

#[derive(Debug, Deserialize)]
struct FeedEvent {
    id: Option<String>,
    venue: Option<String>,
    name: Option<String>,
    start_time: Option<String>,
    #[serde(default)]
    competitors: Vec<FeedCompetitor>,
}

#[derive(Debug, Deserialize)]
struct FeedCompetitor {
    id: Option<String>,
    name: Option<String>,
    entry_number: Option<u32>,
    handler: Option<String>,
    visual_id: Option<String>,
    /// estimator name → raw value; nulls are dropped.
    #[serde(default)]
    estimates: BTreeMap<String, Option<f64>>,
    #[serde(default)]
    quotes: Vec<FeedQuote>,
}

#[derive(Debug, Deserialize)]
struct FeedQuote {
    source: Option<String>,
    fractional: Option<String>,
    /// Number or numeric string.
    decimal: Option<serde_json::Value>,
    observed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsed snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FeedStats {
    pub events_total: usize,
    pub rejected_events: usize,
    pub rejected_competitors: usize,
    pub rejected_quotes: usize,
}

impl FeedStats {
    pub fn rejected(&self) -> usize {
        self.rejected_events + self.rejected_competitors + self.rejected_quotes
    }
}

/// One feed poll, split into catalog metadata and price observations.
#[derive(Debug, Default)]
pub struct FeedSnapshot {
    pub fields: Vec<EventWithCompetitors>,
    pub quotes: Vec<PriceQuote>,
    pub stats: FeedStats,
}

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Fetch and parse the upstream feed. Transport, status and payload-shape failures
/// are errors; bad individual records are counted and dropped.
pub async fn fetch_feed(client: &reqwest::Client, url: &str) -> Result<FeedSnapshot> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(AppError::Feed(format!("feed returned HTTP {status}")));
    }
    let body = resp.text().await?;
    parse_feed(&body, Utc::now())
}

/// Parse a feed body. `fetched_at` stands in for quotes without their own timestamp.
pub fn parse_feed(body: &str, fetched_at: DateTime<Utc>) -> Result<FeedSnapshot> {
    let payload: FeedPayload = serde_json::from_str(body)
        .map_err(|e| AppError::Feed(format!("malformed feed payload: {e}")))?;
    let events = match payload {
        FeedPayload::Wrapped { events } => events,
        FeedPayload::Bare(events) => events,
    };

    let mut snapshot = FeedSnapshot::default();
    snapshot.stats.events_total = events.len();

    for ev in events {
        let (Some(event_id), Some(venue)) = (non_empty(ev.id), non_empty(ev.venue)) else {
            warn!("[FEED] event without id or venue skipped");
            snapshot.stats.rejected_events += 1;
            continue;
        };
        let Some(start_time) = ev.start_time.as_deref().and_then(parse_timestamp) else {
            warn!(event_id = %event_id, "[FEED] event without a valid start_time skipped");
            snapshot.stats.rejected_events += 1;
            continue;
        };

        let mut competitors = Vec::with_capacity(ev.competitors.len());
        for c in ev.competitors {
            let Some(competitor_id) = non_empty(c.id) else {
                warn!(event_id = %event_id, "[FEED] competitor without id skipped");
                snapshot.stats.rejected_competitors += 1;
                continue;
            };

            for q in c.quotes {
                match parse_quote(&event_id, &competitor_id, q, fetched_at) {
                    Ok(quote) => snapshot.quotes.push(quote),
                    Err(e) => {
                        warn!(
                            event_id = %event_id,
                            competitor_id = %competitor_id,
                            "[FEED] quote skipped: {e}"
                        );
                        snapshot.stats.rejected_quotes += 1;
                    }
                }
            }

            competitors.push(CompetitorRecord {
                event_id: event_id.clone(),
                name: non_empty(c.name).unwrap_or_else(|| competitor_id.clone()),
                competitor_id,
                entry_number: c.entry_number,
                handler: non_empty(c.handler),
                visual_id: non_empty(c.visual_id),
                estimates: c
                    .estimates
                    .into_iter()
                    .filter_map(|(k, v)| v.filter(|x| x.is_finite()).map(|x| (k, x)))
                    .collect(),
            });
        }

        snapshot.fields.push(EventWithCompetitors {
            event: EventMeta {
                id: event_id,
                venue,
                name: non_empty(ev.name),
                start_time,
            },
            competitors,
        });
    }

    Ok(snapshot)
}

fn parse_quote(
    event_id: &str,
    competitor_id: &str,
    q: FeedQuote,
    fetched_at: DateTime<Utc>,
) -> Result<PriceQuote> {
    let source_id = non_empty(q.source)
        .ok_or_else(|| AppError::InvalidPrice("quote without source".to_string()))?;

    // The decimal field wins only when it holds a usable price.
    let from_decimal = q
        .decimal
        .as_ref()
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        })
        .and_then(|p| validate_price(p).ok());
    let from_fractional = || {
        q.fractional
            .as_deref()
            .and_then(fractional_to_decimal)
            .and_then(|p| validate_price(p).ok())
    };
    let price = from_decimal.or_else(from_fractional).ok_or_else(|| {
        AppError::InvalidPrice(format!(
            "no valid price (decimal={:?}, fractional={:?})",
            q.decimal, q.fractional
        ))
    })?;

    let observed_at = q
        .observed_at
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(fetched_at);

    Ok(PriceQuote {
        key: PriceKey::new(event_id, competitor_id, &source_id),
        price,
        fractional: non_empty(q.fractional),
        observed_at,
    })
}

/// Convert a fractional "to-1" label into decimal odds: `5/2` → 3.5, `EVS` → 2.0.
pub fn fractional_to_decimal(label: &str) -> Option<f64> {
    let label = label.trim();
    if label.eq_ignore_ascii_case("evs") || label.eq_ignore_ascii_case("evens") {
        return Some(2.0);
    }
    let (num, den) = label.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den <= 0.0 || num < 0.0 {
        return None;
    }
    Some(num / den + 1.0)
}

/// RFC 3339 timestamp to UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
