//! Database row types matching `migrations/0001_init.sql`.
//! Timestamps are stored as UTC epoch milliseconds.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::types::{EventMeta, Movement, PriceChangeEvent, PriceKey, PriceState};

pub const PRICE_STATE_COLUMNS: &str = "event_id, competitor_id, source_id, initial_price, \
     previous_price, current_price, change_count, last_change_at_ms, movement, movement_pct, \
     first_seen_at_ms";

pub const PRICE_CHANGE_COLUMNS: &str = "id, event_id, competitor_id, source_id, from_price, \
     to_price, delta, delta_pct, direction, observed_at_ms";

pub const EVENT_COLUMNS: &str = "id, venue, name, start_time_ms";

#[derive(Debug, sqlx::FromRow)]
pub struct PriceStateRow {
    pub event_id: String,
    pub competitor_id: String,
    pub source_id: String,
    pub initial_price: f64,
    pub previous_price: Option<f64>,
    pub current_price: f64,
    pub change_count: i64,
    pub last_change_at_ms: Option<i64>,
    pub movement: String,
    pub movement_pct: Option<f64>,
    pub first_seen_at_ms: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct PriceChangeRow {
    pub id: i64,
    pub event_id: String,
    pub competitor_id: String,
    pub source_id: String,
    pub from_price: f64,
    pub to_price: f64,
    pub delta: f64,
    pub delta_pct: f64,
    pub direction: String,
    pub observed_at_ms: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub venue: String,
    pub name: Option<String>,
    pub start_time_ms: i64,
}

#[derive(Debug, sqlx::FromRow)]
pub struct CompetitorRow {
    pub event_id: String,
    pub competitor_id: String,
    pub name: String,
    pub entry_number: Option<i64>,
    pub handler: Option<String>,
    pub visual_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct EstimateRow {
    pub event_id: String,
    pub competitor_id: String,
    pub estimator: String,
    pub raw_value: f64,
}

pub fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn decode_error(msg: String) -> AppError {
    AppError::Database(sqlx::Error::Decode(msg.into()))
}

pub fn from_ms(ms: i64) -> Result<DateTime<Utc>, AppError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| decode_error(format!("timestamp out of range: {ms} ms")))
}

fn parse_movement(s: &str) -> Result<Movement, AppError> {
    Movement::from_db_str(s).ok_or_else(|| decode_error(format!("unknown movement '{s}'")))
}

fn parse_change_count(n: i64) -> Result<u32, AppError> {
    u32::try_from(n).map_err(|_| decode_error(format!("change_count out of range: {n}")))
}

impl TryFrom<PriceStateRow> for PriceState {
    type Error = AppError;

    fn try_from(r: PriceStateRow) -> Result<Self, Self::Error> {
        Ok(PriceState {
            movement: parse_movement(&r.movement)?,
            key: PriceKey {
                event_id: r.event_id,
                competitor_id: r.competitor_id,
                source_id: r.source_id,
            },
            initial_price: r.initial_price,
            previous_price: r.previous_price,
            current_price: r.current_price,
            change_count: parse_change_count(r.change_count)?,
            last_change_at: r.last_change_at_ms.map(from_ms).transpose()?,
            movement_pct: r.movement_pct,
            first_seen_at: from_ms(r.first_seen_at_ms)?,
        })
    }
}

impl TryFrom<PriceChangeRow> for PriceChangeEvent {
    type Error = AppError;

    fn try_from(r: PriceChangeRow) -> Result<Self, Self::Error> {
        Ok(PriceChangeEvent {
            id: Some(r.id),
            direction: parse_movement(&r.direction)?,
            key: PriceKey {
                event_id: r.event_id,
                competitor_id: r.competitor_id,
                source_id: r.source_id,
            },
            from_price: r.from_price,
            to_price: r.to_price,
            delta: r.delta,
            delta_pct: r.delta_pct,
            observed_at: from_ms(r.observed_at_ms)?,
        })
    }
}

impl TryFrom<EventRow> for EventMeta {
    type Error = AppError;

    fn try_from(r: EventRow) -> Result<Self, Self::Error> {
        Ok(EventMeta {
            start_time: from_ms(r.start_time_ms)?,
            id: r.id,
            venue: r.venue,
            name: r.name,
        })
    }
}
