use std::collections::{BTreeMap, BTreeSet};

use crate::config::TOP_PICK_EPSILON;
use crate::types::{EventWithCompetitors, ProbabilityScale};

/// Rescale one estimator's raw outputs across a single event's field.
///
/// Each competitor gets `raw / sum(raw)` times the scale factor. Missing, zero, negative
/// and non-finite raw values are left out of the sum and map to 0. If nothing in the
/// field has a positive value the result is empty. Estimators are never mixed.
pub fn normalize(
    field: &EventWithCompetitors,
    estimator: &str,
    scale: ProbabilityScale,
) -> BTreeMap<String, f64> {
    let raws: Vec<(&str, f64)> = field
        .competitors
        .iter()
        .map(|c| {
            let raw = c
                .estimates
                .get(estimator)
                .copied()
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(0.0);
            (c.competitor_id.as_str(), raw)
        })
        .collect();

    let sum: f64 = raws.iter().map(|(_, v)| v).sum();
    if sum <= 0.0 {
        return BTreeMap::new();
    }

    let factor = scale.factor();
    raws.into_iter()
        .map(|(id, raw)| (id.to_string(), raw / sum * factor))
        .collect()
}

/// Every estimator name that appears anywhere in the field.
pub fn estimator_names(field: &EventWithCompetitors) -> BTreeSet<String> {
    field
        .competitors
        .iter()
        .flat_map(|c| c.estimates.keys().cloned())
        .collect()
}

/// competitor_id → estimators for which that competitor holds the highest normalized value.
///
/// Competitors tied on the maximum all count as top picks. Estimators with no positive
/// value in the field pick nobody.
pub fn top_picks(field: &EventWithCompetitors) -> BTreeMap<String, Vec<String>> {
    let mut picks: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for estimator in estimator_names(field) {
        let normalized = normalize(field, &estimator, ProbabilityScale::Unit);
        let Some(max) = normalized.values().copied().reduce(f64::max) else {
            continue;
        };
        if max <= 0.0 {
            continue;
        }
        for (competitor_id, value) in &normalized {
            if (max - value).abs() <= TOP_PICK_EPSILON {
                picks.entry(competitor_id.clone()).or_default().push(estimator.clone());
            }
        }
    }

    picks
}
