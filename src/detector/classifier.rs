use std::cmp::Ordering;

use crate::types::{SmartSignal, Strength};

/// Strong when the competitor is any estimator's top pick or its handler's sole entry.
pub fn classify_strength(is_top_pick: bool, is_sole_entry: bool) -> Strength {
    if is_top_pick || is_sole_entry {
        Strength::Strong
    } else {
        Strength::Medium
    }
}

/// Output order: strong before medium, then the biggest shortening first.
/// Remaining ties fall back to start time and ids so the order is stable.
pub fn signal_order(a: &SmartSignal, b: &SmartSignal) -> Ordering {
    a.strength
        .rank()
        .cmp(&b.strength.rank())
        .then_with(|| a.movement_pct.total_cmp(&b.movement_pct))
        .then_with(|| a.start_time.cmp(&b.start_time))
        .then_with(|| a.event_id.cmp(&b.event_id))
        .then_with(|| a.competitor_id.cmp(&b.competitor_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn signal(id: &str, strength: Strength, movement_pct: f64) -> SmartSignal {
        SmartSignal {
            rank: 0,
            competitor_id: id.to_string(),
            competitor_name: id.to_string(),
            event_id: "r1".to_string(),
            event_name: None,
            venue: "York".to_string(),
            start_time: Utc.with_ymd_and_hms(2026, 10, 18, 15, 0, 0).unwrap(),
            source_id: "bookA".to_string(),
            current_price: 4.0,
            initial_price: 5.0,
            movement_pct,
            is_top_pick: strength == Strength::Strong,
            agreeing_estimators: Vec::new(),
            ensemble_probability: None,
            edge: None,
            is_value: false,
            is_sole_entry: false,
            handler: None,
            strength,
            visual_id: None,
            entry_number: None,
            change_count: 1,
            last_updated: None,
        }
    }

    #[test]
    fn strength_truth_table() {
        assert_eq!(classify_strength(true, false), Strength::Strong);
        assert_eq!(classify_strength(false, true), Strength::Strong);
        assert_eq!(classify_strength(true, true), Strength::Strong);
        assert_eq!(classify_strength(false, false), Strength::Medium);
    }

    #[test]
    fn strong_small_move_beats_medium_big_move() {
        let strong = signal("a", Strength::Strong, -12.0);
        let medium = signal("b", Strength::Medium, -30.0);
        assert_eq!(signal_order(&strong, &medium), Ordering::Less);
    }

    #[test]
    fn equal_strength_sorts_biggest_shortening_first() {
        let mut v = vec![
            signal("a", Strength::Strong, -12.0),
            signal("b", Strength::Strong, -30.0),
        ];
        v.sort_by(signal_order);
        assert_eq!(v[0].competitor_id, "b");
        assert_eq!(v[1].competitor_id, "a");
    }
}
