use std::collections::{BTreeSet, HashMap};

use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::config::{BULK_READ_CHUNK_SIZE, MOVE_PCT_EPSILON};
use crate::db::{release_savepoint, rollback_savepoint, savepoint};
use crate::db::models::{
    to_ms, PriceChangeRow, PriceStateRow, PRICE_CHANGE_COLUMNS, PRICE_STATE_COLUMNS,
};
use crate::error::{AppError, Result};
use crate::state::{apply_observation, Transition};
use crate::types::{Movement, PriceChangeEvent, PriceKey, PriceQuote, PriceState};

/// Per-batch counters. Rejected and failed records never abort the batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub created: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Observations with a non-positive or non-finite price.
    pub rejected: usize,
    /// Observations whose write failed; logged with their keys.
    pub failed: usize,
}

/// Durable (event, competitor, source) → PriceState store plus the append-only change log.
///
/// Every batch runs in one `BEGIN IMMEDIATE` transaction: the write lock is taken before
/// the existing states are read, so the compare against the previously stored price and
/// the write of the new one cannot interleave with another writer.
#[derive(Clone)]
pub struct PriceStore {
    pool: SqlitePool,
    noise_floor: f64,
}

impl PriceStore {
    pub fn new(pool: SqlitePool, noise_floor: f64) -> Self {
        Self { pool, noise_floor }
    }

    /// Applies a single observation and returns the resulting stored state.
    pub async fn upsert(&self, quote: &PriceQuote) -> Result<PriceState> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = self.upsert_in_tx(&mut conn, quote).await;
        finish(&mut conn, result).await
    }

    async fn upsert_in_tx(&self, conn: &mut SqliteConnection, quote: &PriceQuote) -> Result<PriceState> {
        let prior = fetch_state(conn, &quote.key).await?;
        let transition = apply_observation(prior.as_ref(), quote, self.noise_floor)?;
        write_transition(conn, &transition).await?;
        Ok(transition.into_state())
    }

    /// Applies a batch of observations with one bulk read of the existing states.
    ///
    /// Observations for the same key are applied in slice order.
    pub async fn apply_batch(&self, quotes: &[PriceQuote]) -> Result<BatchOutcome> {
        if quotes.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;
        let result = self.apply_batch_in_tx(&mut conn, quotes).await;
        finish(&mut conn, result).await
    }

    async fn apply_batch_in_tx(
        &self,
        conn: &mut SqliteConnection,
        quotes: &[PriceQuote],
    ) -> Result<BatchOutcome> {
        let event_ids: BTreeSet<&str> = quotes.iter().map(|q| q.key.event_id.as_str()).collect();
        let mut known: HashMap<PriceKey, PriceState> = fetch_states_for_events(conn, &event_ids)
            .await?
            .into_iter()
            .map(|s| (s.key.clone(), s))
            .collect();

        let mut outcome = BatchOutcome::default();

        for quote in quotes {
            let transition = match apply_observation(known.get(&quote.key), quote, self.noise_floor) {
                Ok(t) => t,
                Err(e) => {
                    warn!(
                        event_id = %quote.key.event_id,
                        competitor_id = %quote.key.competitor_id,
                        source_id = %quote.key.source_id,
                        "Rejected price observation: {e}"
                    );
                    outcome.rejected += 1;
                    continue;
                }
            };

            if let Transition::Unchanged(_) = transition {
                outcome.unchanged += 1;
                continue;
            }

            // Savepoint per record: a failed write leaves the rest of the batch intact.
            match write_in_savepoint(conn, &transition).await {
                Ok(()) => {
                    match &transition {
                        Transition::Created(_) => outcome.created += 1,
                        Transition::Changed { change, .. } => {
                            debug!(
                                key = %change.key,
                                from = change.from_price,
                                to = change.to_price,
                                pct = change.delta_pct,
                                "Price {}",
                                change.direction,
                            );
                            outcome.changed += 1;
                        }
                        Transition::Unchanged(_) => {}
                    }
                    let state = transition.into_state();
                    known.insert(state.key.clone(), state);
                }
                Err(e) => {
                    rollback_savepoint(conn, RECORD_SAVEPOINT).await;
                    warn!(
                        event_id = %quote.key.event_id,
                        competitor_id = %quote.key.competitor_id,
                        source_id = %quote.key.source_id,
                        price = quote.price,
                        "Price write failed, record skipped: {e}"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    pub async fn get(&self, key: &PriceKey) -> Result<Option<PriceState>> {
        let mut conn = self.pool.acquire().await?;
        fetch_state(&mut conn, key).await
    }

    /// All states for one event, ordered by competitor then source.
    pub async fn states_for_event(&self, event_id: &str) -> Result<Vec<PriceState>> {
        let rows: Vec<PriceStateRow> = sqlx::query_as(&format!(
            "SELECT {PRICE_STATE_COLUMNS} FROM price_states WHERE event_id = ? \
             ORDER BY competitor_id, source_id"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PriceState::try_from).collect()
    }

    /// Shortening states of the given events whose move is at least `min_move_pct` percent.
    pub async fn shortening_states(
        &self,
        event_ids: &[String],
        min_move_pct: f64,
    ) -> Result<Vec<PriceState>> {
        // A move of exactly the threshold qualifies despite rounding in movement_pct.
        let ceiling = -(min_move_pct.abs() - MOVE_PCT_EPSILON);
        let mut states = Vec::new();
        for chunk in event_ids.chunks(BULK_READ_CHUNK_SIZE) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
                "SELECT {PRICE_STATE_COLUMNS} FROM price_states WHERE movement = "
            ));
            qb.push_bind(Movement::Shortening.to_string());
            qb.push(" AND movement_pct IS NOT NULL AND movement_pct <= ");
            qb.push_bind(ceiling);
            qb.push(" AND event_id IN (");
            let mut separated = qb.separated(", ");
            for id in chunk {
                separated.push_bind(id.as_str());
            }
            separated.push_unseparated(")");

            let rows: Vec<PriceStateRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            for row in rows {
                states.push(PriceState::try_from(row)?);
            }
        }
        Ok(states)
    }

    /// Change log for one key, oldest first.
    pub async fn changes_for(&self, key: &PriceKey) -> Result<Vec<PriceChangeEvent>> {
        let rows: Vec<PriceChangeRow> = sqlx::query_as(&format!(
            "SELECT {PRICE_CHANGE_COLUMNS} FROM price_changes \
             WHERE event_id = ? AND competitor_id = ? AND source_id = ? ORDER BY id"
        ))
        .bind(&key.event_id)
        .bind(&key.competitor_id)
        .bind(&key.source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PriceChangeEvent::try_from).collect()
    }
}

async fn begin_immediate(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

/// Commits on success, rolls back on error.
async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!("Rollback failed after error ({e}): {rb}");
            }
            Err(e)
        }
    }
}

async fn fetch_state(conn: &mut SqliteConnection, key: &PriceKey) -> Result<Option<PriceState>> {
    let row: Option<PriceStateRow> = sqlx::query_as(&format!(
        "SELECT {PRICE_STATE_COLUMNS} FROM price_states \
         WHERE event_id = ? AND competitor_id = ? AND source_id = ?"
    ))
    .bind(&key.event_id)
    .bind(&key.competitor_id)
    .bind(&key.source_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(PriceState::try_from).transpose()
}

async fn fetch_states_for_events(
    conn: &mut SqliteConnection,
    event_ids: &BTreeSet<&str>,
) -> Result<Vec<PriceState>> {
    let ids: Vec<&str> = event_ids.iter().copied().collect();
    let mut states = Vec::new();
    for chunk in ids.chunks(BULK_READ_CHUNK_SIZE) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {PRICE_STATE_COLUMNS} FROM price_states WHERE event_id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows: Vec<PriceStateRow> = qb.build_query_as().fetch_all(&mut *conn).await?;
        for row in rows {
            states.push(PriceState::try_from(row)?);
        }
    }
    Ok(states)
}

const RECORD_SAVEPOINT: &str = "price_record";

async fn write_in_savepoint(conn: &mut SqliteConnection, transition: &Transition) -> Result<()> {
    savepoint(conn, RECORD_SAVEPOINT).await?;
    write_transition(conn, transition).await?;
    release_savepoint(conn, RECORD_SAVEPOINT).await
}

async fn write_transition(conn: &mut SqliteConnection, transition: &Transition) -> Result<()> {
    match transition {
        Transition::Unchanged(_) => Ok(()),
        Transition::Created(s) => {
            sqlx::query(
                r#"
                INSERT INTO price_states (
                    event_id, competitor_id, source_id, initial_price, previous_price,
                    current_price, change_count, last_change_at_ms, movement, movement_pct,
                    first_seen_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&s.key.event_id)
            .bind(&s.key.competitor_id)
            .bind(&s.key.source_id)
            .bind(s.initial_price)
            .bind(s.previous_price)
            .bind(s.current_price)
            .bind(i64::from(s.change_count))
            .bind(s.last_change_at.map(to_ms))
            .bind(s.movement.to_string())
            .bind(s.movement_pct)
            .bind(to_ms(s.first_seen_at))
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
        Transition::Changed { state: s, change: c } => {
            let updated = sqlx::query(
                r#"
                UPDATE price_states SET
                    previous_price = ?,
                    current_price = ?,
                    change_count = ?,
                    last_change_at_ms = ?,
                    movement = ?,
                    movement_pct = ?
                WHERE event_id = ? AND competitor_id = ? AND source_id = ?
                "#,
            )
            .bind(s.previous_price)
            .bind(s.current_price)
            .bind(i64::from(s.change_count))
            .bind(s.last_change_at.map(to_ms))
            .bind(s.movement.to_string())
            .bind(s.movement_pct)
            .bind(&s.key.event_id)
            .bind(&s.key.competitor_id)
            .bind(&s.key.source_id)
            .execute(&mut *conn)
            .await?;
            if updated.rows_affected() != 1 {
                return Err(AppError::Database(sqlx::Error::RowNotFound));
            }

            sqlx::query(
                r#"
                INSERT INTO price_changes (
                    event_id, competitor_id, source_id, from_price, to_price,
                    delta, delta_pct, direction, observed_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&c.key.event_id)
            .bind(&c.key.competitor_id)
            .bind(&c.key.source_id)
            .bind(c.from_price)
            .bind(c.to_price)
            .bind(c.delta)
            .bind(c.delta_pct)
            .bind(c.direction.to_string())
            .bind(to_ms(c.observed_at))
            .execute(&mut *conn)
            .await?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 10, 0, 0).unwrap()
    }

    fn quote(competitor: &str, price: f64, minute: i64) -> PriceQuote {
        PriceQuote {
            key: PriceKey::new("race1", competitor, "book1"),
            price,
            fractional: None,
            observed_at: t0() + Duration::minutes(minute),
        }
    }

    #[tokio::test]
    async fn first_upsert_creates_stable_state() {
        let store = PriceStore::new(test_pool().await, 0.0);
        let s = store.upsert(&quote("h1", 5.0, 0)).await.unwrap();
        assert_eq!(s.initial_price, 5.0);
        assert_eq!(s.current_price, 5.0);
        assert_eq!(s.movement, Movement::Stable);
        assert_eq!(s.change_count, 0);
        assert_eq!(store.get(&s.key).await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn change_is_persisted_with_log_row() {
        let store = PriceStore::new(test_pool().await, 0.0);
        store.upsert(&quote("h1", 5.0, 0)).await.unwrap();
        let s = store.upsert(&quote("h1", 4.0, 1)).await.unwrap();
        assert_eq!(s.movement, Movement::Shortening);
        assert_eq!(s.change_count, 1);
        assert!((s.movement_pct.unwrap() + 20.0).abs() < 1e-9);
        assert_eq!(s.last_change_at, Some(t0() + Duration::minutes(1)));

        let log = store.changes_for(&s.key).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from_price, 5.0);
        assert_eq!(log[0].to_price, 4.0);
        assert_eq!(log[0].direction, Movement::Shortening);
        assert!(log[0].id.is_some());
    }

    #[tokio::test]
    async fn replaying_current_price_changes_nothing() {
        let store = PriceStore::new(test_pool().await, 0.0);
        store.upsert(&quote("h1", 5.0, 0)).await.unwrap();
        let before = store.upsert(&quote("h1", 4.0, 1)).await.unwrap();
        let after = store.upsert(&quote("h1", 4.0, 30)).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(store.changes_for(&before.key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_price_does_not_corrupt_state() {
        let store = PriceStore::new(test_pool().await, 0.0);
        let stored = store.upsert(&quote("h1", 5.0, 0)).await.unwrap();
        let err = store.upsert(&quote("h1", 0.0, 1)).await;
        assert!(matches!(err, Err(AppError::InvalidPrice(_))));
        assert_eq!(store.get(&stored.key).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn batch_counts_and_skips_bad_records() {
        let store = PriceStore::new(test_pool().await, 0.0);
        let outcome = store
            .apply_batch(&[quote("h1", 5.0, 0), quote("h2", 8.0, 0), quote("h3", -1.0, 0)])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { created: 2, rejected: 1, ..Default::default() });

        let outcome = store
            .apply_batch(&[
                quote("h1", 4.5, 1),
                quote("h1", 4.0, 2),
                quote("h2", 8.0, 1),
                quote("h3", 3.0, 1),
            ])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { created: 1, changed: 2, unchanged: 1, ..Default::default() });

        let h1 = store.get(&PriceKey::new("race1", "h1", "book1")).await.unwrap().unwrap();
        assert_eq!(h1.change_count, 2);
        assert_eq!(h1.previous_price, Some(4.5));
        assert_eq!(h1.initial_price, 5.0);
    }

    #[tokio::test]
    async fn strictly_decreasing_prices_all_shorten() {
        let store = PriceStore::new(test_pool().await, 0.0);
        let prices = [12.0, 10.0, 10.0, 9.0, 7.0, 7.0, 6.5];
        for (i, p) in prices.iter().enumerate() {
            let s = store.upsert(&quote("h1", *p, i as i64)).await.unwrap();
            if s.change_count > 0 {
                assert_eq!(s.movement, Movement::Shortening);
            }
        }
        let key = PriceKey::new("race1", "h1", "book1");
        let s = store.get(&key).await.unwrap().unwrap();
        assert_eq!(s.change_count, 4);
        assert_eq!(store.changes_for(&key).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn shortening_states_respect_threshold() {
        let store = PriceStore::new(test_pool().await, 0.0);
        store
            .apply_batch(&[quote("h1", 5.0, 0), quote("h2", 10.0, 0), quote("h3", 4.0, 0)])
            .await
            .unwrap();
        store
            .apply_batch(&[quote("h1", 4.0, 1), quote("h2", 9.5, 1), quote("h3", 5.0, 1)])
            .await
            .unwrap();

        let states = store.shortening_states(&["race1".to_string()], 10.0).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].key.competitor_id, "h1");
    }

    #[tokio::test]
    async fn move_of_exactly_the_threshold_qualifies() {
        let store = PriceStore::new(test_pool().await, 0.0);
        store.upsert(&quote("h1", 3.0, 0)).await.unwrap();
        let s = store.upsert(&quote("h1", 2.7, 1)).await.unwrap();
        // Stored as -9.999999999999995, not -10.
        assert!((s.movement_pct.unwrap() + 10.0).abs() < 1e-9);

        let states = store.shortening_states(&["race1".to_string()], 10.0).await.unwrap();
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn shortening_read_is_limited_to_the_given_events() {
        let store = PriceStore::new(test_pool().await, 0.0);
        for event in ["yesterday", "today"] {
            let key = PriceKey::new(event, "h1", "book1");
            for (price, minute) in [(5.0, 0), (4.0, 1)] {
                store
                    .upsert(&PriceQuote {
                        key: key.clone(),
                        price,
                        fractional: None,
                        observed_at: t0() + Duration::minutes(minute),
                    })
                    .await
                    .unwrap();
            }
        }

        let states = store.shortening_states(&["today".to_string()], 10.0).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].key.event_id, "today");
        assert!(store.shortening_states(&[], 10.0).await.unwrap().is_empty());
    }
}
