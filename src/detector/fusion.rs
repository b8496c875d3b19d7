use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use tracing::debug;

use crate::config::{SignalConfig, MOVE_PCT_EPSILON};
use crate::db::{Catalog, PriceStore};
use crate::detector::classifier::{classify_strength, signal_order};
use crate::detector::intent::{detect_sole_entries, entries_for_fields};
use crate::error::Result;
use crate::scorer::value_edge::{best_prices, value_edges_for_event};
use crate::scorer::{compute_edge, normalize, top_picks};
use crate::types::{
    CompetitorRecord, EventWithCompetitors, Movement, PriceState, ProbabilityScale, SmartSignal,
    ValueEdge,
};

/// Read-only signal engine. Each call issues its bulk reads and computes in memory;
/// nothing is cached or mutated, so it can be called concurrently.
#[derive(Clone)]
pub struct FusionEngine {
    prices: PriceStore,
    catalog: Catalog,
    cfg: SignalConfig,
    tz: FixedOffset,
}

impl FusionEngine {
    pub fn new(prices: PriceStore, catalog: Catalog, cfg: SignalConfig, tz: FixedOffset) -> Self {
        Self { prices, catalog, cfg, tz }
    }

    /// Ordered smart signals as of `as_of`. Any failed read fails the whole call.
    pub async fn fuse(&self, as_of: DateTime<Utc>) -> Result<Vec<SmartSignal>> {
        let (from, to) = local_day_bounds(as_of, self.tz);
        let fields = self.catalog.fields_between(from, to).await?;
        let event_ids: Vec<String> = fields.iter().map(|f| f.event.id.clone()).collect();
        let states = self
            .prices
            .shortening_states(&event_ids, self.cfg.min_move_pct)
            .await?;

        let signals = fuse_signals(as_of, &self.cfg, states, &fields);
        debug!(
            as_of = %as_of,
            events = fields.len(),
            signals = signals.len(),
            "Fusion complete"
        );
        Ok(signals)
    }

    /// Ranked value edges for one event, using the longest current price across sources.
    /// None when the event is unknown.
    pub async fn value_edges(
        &self,
        event_id: &str,
        estimator: Option<&str>,
    ) -> Result<Option<Vec<ValueEdge>>> {
        let Some(field) = self.catalog.field(event_id).await? else {
            return Ok(None);
        };
        let states = self.prices.states_for_event(event_id).await?;
        let prices = best_prices(
            states
                .iter()
                .map(|s| (s.key.competitor_id.as_str(), s.current_price)),
        );
        let estimator = estimator.unwrap_or(self.cfg.ensemble_estimator.as_str());
        Ok(Some(value_edges_for_event(
            &field,
            &prices,
            estimator,
            self.cfg.value_edge_threshold,
        )))
    }
}

/// UTC bounds `[start, end)` of the local calendar day containing `as_of`.
pub fn local_day_bounds(as_of: DateTime<Utc>, tz: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = as_of.with_timezone(&tz).date_naive();
    let start = local_date.and_time(NaiveTime::MIN).and_utc()
        - Duration::seconds(i64::from(tz.local_minus_utc()));
    (start, start + Duration::days(1))
}

// ---------------------------------------------------------------------------
// Pure fusion
// ---------------------------------------------------------------------------

/// Per-event scores computed once and shared by every signal in the event.
struct EventScores {
    picks: BTreeMap<String, Vec<String>>,
    ensemble_unit: BTreeMap<String, f64>,
    ensemble_scaled: BTreeMap<String, f64>,
}

impl EventScores {
    fn compute(field: &EventWithCompetitors, cfg: &SignalConfig) -> Self {
        let ensemble_unit = normalize(field, &cfg.ensemble_estimator, ProbabilityScale::Unit);
        let ensemble_scaled = match cfg.scale {
            ProbabilityScale::Unit => ensemble_unit.clone(),
            scale => normalize(field, &cfg.ensemble_estimator, scale),
        };
        Self { picks: top_picks(field), ensemble_unit, ensemble_scaled }
    }
}

/// Combines qualifying price moves with catalog data into ordered, ranked signals.
///
/// `fields` must hold every event of the target day, including ones already started:
/// sole entries are counted across the whole day even though only future events are
/// reported. States whose event or competitor is not in `fields` are dropped.
pub fn fuse_signals(
    as_of: DateTime<Utc>,
    cfg: &SignalConfig,
    states: Vec<PriceState>,
    fields: &[EventWithCompetitors],
) -> Vec<SmartSignal> {
    let events: HashMap<&str, &EventWithCompetitors> =
        fields.iter().map(|f| (f.event.id.as_str(), f)).collect();
    let sole_entries = detect_sole_entries(&entries_for_fields(fields));
    let min_move = cfg.min_move_pct.abs();

    // One state per (event, competitor): the biggest shortening across sources.
    let mut best: BTreeMap<(String, String), PriceState> = BTreeMap::new();
    for state in states {
        let Some(pct) = state.movement_pct else { continue };
        if state.movement != Movement::Shortening || pct.abs() + MOVE_PCT_EPSILON < min_move {
            continue;
        }
        let Some(&field) = events.get(state.key.event_id.as_str()) else { continue };
        if field.event.start_time <= as_of {
            continue;
        }
        let key = (state.key.event_id.clone(), state.key.competitor_id.clone());
        let replace = best
            .get(&key)
            .map_or(true, |current| supersedes(&state, current));
        if replace {
            best.insert(key, state);
        }
    }

    let mut scores: HashMap<&str, EventScores> = HashMap::new();
    let mut signals = Vec::with_capacity(best.len());

    for ((event_id, competitor_id), state) in best {
        let Some(&field) = events.get(event_id.as_str()) else { continue };
        let Some(competitor) = find_competitor(field, &competitor_id) else { continue };
        let event_scores = scores
            .entry(field.event.id.as_str())
            .or_insert_with(|| EventScores::compute(field, cfg));

        let agreeing_estimators = event_scores.picks.get(&competitor_id).cloned().unwrap_or_default();
        let is_top_pick = !agreeing_estimators.is_empty();
        let is_sole_entry = sole_entries.contains(&(event_id.clone(), competitor_id.clone()));
        let edge = event_scores.ensemble_unit.get(&competitor_id).map(|p| {
            compute_edge(&competitor_id, state.current_price, *p, cfg.value_edge_threshold)
        });

        signals.push(SmartSignal {
            rank: 0,
            competitor_name: competitor.name.clone(),
            event_name: field.event.name.clone(),
            venue: field.event.venue.clone(),
            start_time: field.event.start_time,
            source_id: state.key.source_id.clone(),
            current_price: state.current_price,
            initial_price: state.initial_price,
            movement_pct: state.movement_pct.unwrap_or_default(),
            is_top_pick,
            agreeing_estimators,
            ensemble_probability: event_scores.ensemble_scaled.get(&competitor_id).copied(),
            edge: edge.as_ref().and_then(|e| e.edge),
            is_value: edge.is_some_and(|e| e.is_value),
            is_sole_entry,
            handler: competitor.handler.clone(),
            strength: classify_strength(is_top_pick, is_sole_entry),
            visual_id: competitor.visual_id.clone(),
            entry_number: competitor.entry_number,
            change_count: state.change_count,
            last_updated: state.last_change_at,
            event_id,
            competitor_id,
        });
    }

    signals.sort_by(signal_order);
    for (i, s) in signals.iter_mut().enumerate() {
        s.rank = i + 1;
    }
    signals
}

/// Bigger shortening wins, then the more recent change, then the lower source id.
fn supersedes(candidate: &PriceState, current: &PriceState) -> bool {
    let a = candidate.movement_pct.unwrap_or_default();
    let b = current.movement_pct.unwrap_or_default();
    a.total_cmp(&b)
        .then_with(|| current.last_change_at.cmp(&candidate.last_change_at))
        .then_with(|| candidate.key.source_id.cmp(&current.key.source_id))
        .is_lt()
}

fn find_competitor<'a>(
    field: &'a EventWithCompetitors,
    competitor_id: &str,
) -> Option<&'a CompetitorRecord> {
    field.competitors.iter().find(|c| c.competitor_id == competitor_id)
}
