use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::types::{Entry, EventWithCompetitors};

/// Sole-entry flag for one (venue, handler) pair on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentFlag {
    pub venue_id: String,
    pub handler_id: String,
    /// Distinct (event, competitor) entries the handler has at the venue.
    pub entries: usize,
    pub is_sole_entry: bool,
    /// The single entry, when `is_sole_entry`.
    pub entry: Option<(String, String)>,
}

/// Handler and venue names are compared trimmed and case-insensitively.
fn group_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Groups a day's entries by (venue, handler). Entries with a blank handler are ignored.
pub fn intent_flags(entries: &[Entry]) -> Vec<IntentFlag> {
    let mut groups: BTreeMap<(String, String), (String, String, BTreeSet<(String, String)>)> =
        BTreeMap::new();

    for e in entries {
        if e.handler_id.trim().is_empty() {
            continue;
        }
        let (_, _, members) = groups
            .entry((group_key(&e.venue_id), group_key(&e.handler_id)))
            .or_insert_with(|| (e.venue_id.clone(), e.handler_id.clone(), BTreeSet::new()));
        members.insert((e.event_id.clone(), e.competitor_id.clone()));
    }

    groups
        .into_values()
        .map(|(venue_id, handler_id, members)| {
            let is_sole_entry = members.len() == 1;
            IntentFlag {
                venue_id,
                handler_id,
                entries: members.len(),
                is_sole_entry,
                entry: if is_sole_entry { members.into_iter().next() } else { None },
            }
        })
        .collect()
}

/// (event_id, competitor_id) of every competitor that is its handler's only entry at
/// the venue across the given entries.
pub fn detect_sole_entries(entries: &[Entry]) -> BTreeSet<(String, String)> {
    intent_flags(entries)
        .into_iter()
        .filter_map(|f| f.entry)
        .collect()
}

/// One entry per competitor that has a handler.
pub fn entries_for_fields(fields: &[EventWithCompetitors]) -> Vec<Entry> {
    fields
        .iter()
        .flat_map(|f| {
            f.competitors.iter().filter_map(move |c| {
                Some(Entry {
                    venue_id: f.event.venue.clone(),
                    handler_id: c.handler.clone()?,
                    event_id: f.event.id.clone(),
                    competitor_id: c.competitor_id.clone(),
                })
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(venue: &str, handler: &str, event: &str, competitor: &str) -> Entry {
        Entry {
            venue_id: venue.to_string(),
            handler_id: handler.to_string(),
            event_id: event.to_string(),
            competitor_id: competitor.to_string(),
        }
    }

    fn key(event: &str, competitor: &str) -> (String, String) {
        (event.to_string(), competitor.to_string())
    }

    #[test]
    fn single_entry_is_flagged() {
        let sole = detect_sole_entries(&[entry("venueA", "handlerX", "r1", "c1")]);
        assert_eq!(sole, BTreeSet::from([key("r1", "c1")]));
    }

    #[test]
    fn two_entries_flag_neither() {
        let sole = detect_sole_entries(&[
            entry("venueA", "handlerX", "r1", "c1"),
            entry("venueA", "handlerX", "r2", "c2"),
        ]);
        assert!(sole.is_empty());
    }

    #[test]
    fn groups_are_per_venue() {
        let sole = detect_sole_entries(&[
            entry("venueA", "handlerX", "r1", "c1"),
            entry("venueB", "handlerX", "r5", "c2"),
            entry("venueB", "handlerY", "r5", "c3"),
            entry("venueB", "handlerY", "r6", "c4"),
        ]);
        assert_eq!(sole, BTreeSet::from([key("r1", "c1"), key("r5", "c2")]));
    }

    #[test]
    fn handler_names_match_loosely_and_blanks_are_ignored() {
        let flags = intent_flags(&[
            entry("Ascot", "J Smith", "r1", "c1"),
            entry("ascot ", " j smith", "r3", "c2"),
            entry("Ascot", "  ", "r1", "c9"),
        ]);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].entries, 2);
        assert!(!flags[0].is_sole_entry);
    }

    #[test]
    fn duplicate_entry_rows_count_once() {
        let sole = detect_sole_entries(&[
            entry("venueA", "handlerX", "r1", "c1"),
            entry("venueA", "handlerX", "r1", "c1"),
        ]);
        assert_eq!(sole.len(), 1);
    }
}
