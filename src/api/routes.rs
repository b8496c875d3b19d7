use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::health::{HealthSnapshot, HealthState};
use crate::api::latency::{Latencies, Percentiles};
use crate::db::PriceStore;
use crate::detector::FusionEngine;
use crate::error::AppError;
use crate::fetcher::parse_timestamp;
use crate::types::{PriceChangeEvent, PriceKey, PriceState, SmartSignal, ValueEdge};

#[derive(Clone)]
pub struct ApiState {
    pub engine: FusionEngine,
    pub prices: PriceStore,
    pub health: Arc<HealthState>,
    pub latency: Arc<Latencies>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/signals", get(get_signals))
        .route("/events/:event_id/value", get(get_value_edges))
        .route("/events/:event_id/prices", get(get_event_prices))
        .route(
            "/prices/:event_id/:competitor_id/:source_id/changes",
            get(get_price_changes),
        )
        .route("/stats/latency", get(get_stats_latency))
        .route("/health", get(get_health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SignalsQuery {
    /// RFC 3339; defaults to now.
    pub as_of: Option<String>,
}

#[derive(Deserialize)]
pub struct ValueQuery {
    pub estimator: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct SignalsResponse {
    pub as_of: DateTime<Utc>,
    pub signals: Vec<SmartSignal>,
}

#[derive(Serialize)]
pub struct ValueResponse {
    pub event_id: String,
    pub estimator: Option<String>,
    pub edges: Vec<ValueEdge>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub fusion: Percentiles,
    pub poll: Percentiles,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_signals(
    State(state): State<ApiState>,
    Query(params): Query<SignalsQuery>,
) -> Result<Json<SignalsResponse>, AppError> {
    let as_of = match params.as_of.as_deref() {
        Some(raw) => parse_timestamp(raw)
            .ok_or_else(|| AppError::BadRequest(format!("as_of is not RFC 3339: {raw}")))?,
        None => Utc::now(),
    };

    let started = Instant::now();
    let signals = state.engine.fuse(as_of).await?;
    state.latency.fusion.record(started.elapsed());

    Ok(Json(SignalsResponse { as_of, signals }))
}

async fn get_value_edges(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
    Query(params): Query<ValueQuery>,
) -> Result<Json<ValueResponse>, AppError> {
    let edges = state
        .engine
        .value_edges(&event_id, params.estimator.as_deref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("event {event_id}")))?;
    Ok(Json(ValueResponse { event_id, estimator: params.estimator, edges }))
}

async fn get_event_prices(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
) -> Result<Json<Vec<PriceState>>, AppError> {
    Ok(Json(state.prices.states_for_event(&event_id).await?))
}

async fn get_price_changes(
    State(state): State<ApiState>,
    Path((event_id, competitor_id, source_id)): Path<(String, String, String)>,
) -> Result<Json<Vec<PriceChangeEvent>>, AppError> {
    let key = PriceKey { event_id, competitor_id, source_id };
    if state.prices.get(&key).await?.is_none() {
        return Err(AppError::NotFound(format!("price {key}")));
    }
    Ok(Json(state.prices.changes_for(&key).await?))
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    Json(LatencyResponse {
        fusion: state.latency.fusion.percentiles(),
        poll: state.latency.poll.percentiles(),
    })
}

async fn get_health(State(state): State<ApiState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalConfig;
    use crate::db::{test_pool, Catalog};
    use crate::types::{CompetitorRecord, EventMeta, EventWithCompetitors, PriceQuote};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{FixedOffset, TimeZone};
    use std::collections::BTreeMap;
    use tower::ServiceExt;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, h, m, 0).unwrap()
    }

    async fn app() -> Router {
        let pool = test_pool().await;
        let prices = PriceStore::new(pool.clone(), 0.0);
        let catalog = Catalog::new(pool);

        let competitors = [("a", "H1", 0.3), ("b", "H2", 0.1)]
            .iter()
            .map(|(id, handler, raw)| CompetitorRecord {
                event_id: "r1".to_string(),
                competitor_id: id.to_string(),
                name: id.to_uppercase(),
                entry_number: None,
                handler: Some(handler.to_string()),
                visual_id: None,
                estimates: BTreeMap::from([("ensemble".to_string(), *raw)]),
            })
            .collect();
        catalog
            .upsert_fields(
                &[EventWithCompetitors {
                    event: EventMeta {
                        id: "r1".to_string(),
                        venue: "Ascot".to_string(),
                        name: None,
                        start_time: at(15, 0),
                    },
                    competitors,
                }],
                at(8, 0),
            )
            .await
            .unwrap();
        for price in [5.0, 4.0] {
            prices
                .upsert(&PriceQuote {
                    key: PriceKey::new("r1", "b", "bookA"),
                    price,
                    fractional: None,
                    observed_at: at(9, 0),
                })
                .await
                .unwrap();
        }

        let engine = FusionEngine::new(
            prices.clone(),
            catalog,
            SignalConfig::default(),
            FixedOffset::east_opt(0).unwrap(),
        );
        router(ApiState {
            engine,
            prices,
            health: Arc::new(HealthState::new()),
            latency: Arc::new(Latencies::new().unwrap()),
        })
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn signals_endpoint_returns_ranked_signals() {
        let (status, body) = get_json(app().await, "/signals?as_of=2026-10-18T12:00:00Z").await;
        assert_eq!(status, StatusCode::OK);
        let signals = body["signals"].as_array().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["competitor_id"], "b");
        assert_eq!(signals[0]["rank"], 1);
        assert_eq!(signals[0]["strength"], "strong");
        assert_eq!(signals[0]["is_sole_entry"], true);
    }

    #[tokio::test]
    async fn empty_signal_list_is_not_an_error() {
        let (status, body) = get_json(app().await, "/signals?as_of=2026-10-18T16:00:00Z").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["signals"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_as_of_is_rejected() {
        let (status, body) = get_json(app().await, "/signals?as_of=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("as_of"));
    }

    #[tokio::test]
    async fn value_endpoint_404s_for_unknown_event() {
        let (status, body) = get_json(app().await, "/events/r1/value").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["edges"][0]["competitor_id"], "b");

        let (status, body) = get_json(app().await, "/events/nope/value").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn price_history_endpoints() {
        let (status, body) = get_json(app().await, "/events/r1/prices").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["current_price"], 4.0);
        assert_eq!(body[0]["movement"], "shortening");

        let (status, body) = get_json(app().await, "/prices/r1/b/bookA/changes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["delta_pct"], -20.0);

        let (status, _) = get_json(app().await, "/prices/r1/a/bookA/changes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_and_latency_respond() {
        let (status, body) = get_json(app().await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["polls_ok"], 0);

        let (status, body) = get_json(app().await, "/stats/latency").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fusion"]["samples"], 0);
    }
}
