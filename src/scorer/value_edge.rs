use std::collections::BTreeMap;

use crate::scorer::normalizer::normalize;
use crate::types::{EventWithCompetitors, ProbabilityScale, ValueEdge};

/// Market-implied win probability of a decimal price: `1 / price`.
///
/// A fractional "to-1" quote `f` is decimal `f + 1`, so `1 / (f + 1)` is the same number;
/// prices are always converted to decimal before they get here.
pub fn implied_probability(price: f64) -> Option<f64> {
    if price.is_finite() && price > 0.0 {
        Some(1.0 / price)
    } else {
        None
    }
}

/// `edge = normalized_probability / implied_probability`.
///
/// `normalized_probability` is on the 0–1 scale. Edge is None (and the competitor is
/// not a value candidate) when the price implies no probability.
pub fn compute_edge(
    competitor_id: &str,
    price: f64,
    normalized_probability: f64,
    threshold: f64,
) -> ValueEdge {
    let implied = implied_probability(price).filter(|p| *p > 0.0);
    let edge = implied.map(|p| normalized_probability / p);
    ValueEdge {
        competitor_id: competitor_id.to_string(),
        price,
        implied_probability: implied,
        normalized_probability,
        edge,
        is_value: edge.is_some_and(|e| e > threshold),
    }
}

/// Drops undefined edges and orders the rest: highest edge first, then the shorter price,
/// then competitor id.
pub fn rank_value_edges(edges: Vec<ValueEdge>) -> Vec<ValueEdge> {
    let mut ranked: Vec<ValueEdge> = edges.into_iter().filter(|e| e.edge.is_some()).collect();
    ranked.sort_by(|a, b| {
        let ea = a.edge.unwrap_or(f64::NEG_INFINITY);
        let eb = b.edge.unwrap_or(f64::NEG_INFINITY);
        eb.total_cmp(&ea)
            .then_with(|| a.price.total_cmp(&b.price))
            .then_with(|| a.competitor_id.cmp(&b.competitor_id))
    });
    ranked
}

/// Ranked value edges for one event.
///
/// `prices` maps competitor_id to the price to assess; competitors without a price or
/// without a normalized value for `estimator` are skipped.
pub fn value_edges_for_event(
    field: &EventWithCompetitors,
    prices: &BTreeMap<String, f64>,
    estimator: &str,
    threshold: f64,
) -> Vec<ValueEdge> {
    let normalized = normalize(field, estimator, ProbabilityScale::Unit);
    let edges = field
        .competitors
        .iter()
        .filter_map(|c| {
            let price = *prices.get(&c.competitor_id)?;
            let prob = *normalized.get(&c.competitor_id)?;
            Some(compute_edge(&c.competitor_id, price, prob, threshold))
        })
        .collect();
    rank_value_edges(edges)
}

/// Keeps the longest (best for the backer) price per competitor.
pub fn best_prices<'a, I>(prices: I) -> BTreeMap<String, f64>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut best: BTreeMap<String, f64> = BTreeMap::new();
    for (competitor_id, price) in prices {
        best.entry(competitor_id.to_string())
            .and_modify(|p| {
                if price > *p {
                    *p = price;
                }
            })
            .or_insert(price);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_probability_is_reciprocal_of_decimal() {
        assert_eq!(implied_probability(4.0), Some(0.25));
        assert_eq!(implied_probability(2.0), Some(0.5));
        assert_eq!(implied_probability(0.0), None);
        assert_eq!(implied_probability(-3.0), None);
        assert_eq!(implied_probability(f64::NAN), None);
    }

    #[test]
    fn edge_is_ratio_of_estimate_to_implied() {
        let e = compute_edge("a", 5.0, 0.3, 1.1);
        assert!((e.edge.unwrap() - 1.5).abs() < 1e-9);
        assert!(e.is_value);

        let e = compute_edge("b", 2.0, 0.5, 1.1);
        assert!((e.edge.unwrap() - 1.0).abs() < 1e-9);
        assert!(!e.is_value);
    }

    #[test]
    fn edge_undefined_for_non_positive_price() {
        for price in [0.0, -1.5] {
            let e = compute_edge("a", price, 0.4, 1.0);
            assert!(e.edge.is_none());
            assert!(e.implied_probability.is_none());
            assert!(!e.is_value);
        }
        let ranked = rank_value_edges(vec![compute_edge("a", 0.0, 0.4, 1.0), compute_edge("b", 3.0, 0.4, 1.0)]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].competitor_id, "b");
    }

    #[test]
    fn ties_go_to_the_shorter_price() {
        // Both edges are exactly 1.2.
        let ranked = rank_value_edges(vec![
            compute_edge("long", 4.0, 0.3, 1.0),
            compute_edge("short", 2.0, 0.6, 1.0),
            compute_edge("best", 8.0, 0.5, 1.0),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|e| e.competitor_id.as_str()).collect();
        assert_eq!(ids, vec!["best", "short", "long"]);
    }

    #[test]
    fn best_price_keeps_the_longest() {
        let best = best_prices(vec![("a", 4.0), ("a", 4.5), ("b", 3.0), ("a", 4.2)]);
        assert_eq!(best["a"], 4.5);
        assert_eq!(best["b"], 3.0);
    }
}
