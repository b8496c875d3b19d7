use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::warn;

use crate::config::BULK_READ_CHUNK_SIZE;
use crate::db::{release_savepoint, rollback_savepoint, savepoint};
use crate::db::models::{to_ms, CompetitorRow, EstimateRow, EventRow, EVENT_COLUMNS};
use crate::error::Result;
use crate::types::{CompetitorRecord, EventMeta, EventWithCompetitors};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CatalogOutcome {
    pub events: usize,
    pub competitors: usize,
    /// Events whose metadata write failed; the rest of the snapshot is kept.
    pub failed: usize,
}

/// Event, competitor and estimator metadata refreshed from the feed each cycle.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upserts event and competitor metadata and replaces each event's estimator values.
    pub async fn upsert_fields(
        &self,
        fields: &[EventWithCompetitors],
        now: DateTime<Utc>,
    ) -> Result<CatalogOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = CatalogOutcome::default();
        let now_ms = to_ms(now);

        for field in fields {
            match write_field_in_savepoint(&mut *tx, field, now_ms).await {
                Ok(()) => {
                    outcome.events += 1;
                    outcome.competitors += field.competitors.len();
                }
                Err(e) => {
                    rollback_savepoint(&mut *tx, EVENT_SAVEPOINT).await;
                    warn!(event_id = %field.event.id, "Event metadata write failed: {e}");
                    outcome.failed += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn event(&self, event_id: &str) -> Result<Option<EventMeta>> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?"))
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(EventMeta::try_from).transpose()
    }

    /// Events starting in `[from, to)`, ordered by start time.
    pub async fn events_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<EventMeta>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE start_time_ms >= ? AND start_time_ms < ? \
             ORDER BY start_time_ms, id"
        ))
        .bind(to_ms(from))
        .bind(to_ms(to))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventMeta::try_from).collect()
    }

    /// Competitors (with their estimator values) for the given events, in one read per table.
    pub async fn competitors_for(&self, event_ids: &[String]) -> Result<Vec<CompetitorRecord>> {
        let mut competitors = Vec::new();
        for chunk in event_ids.chunks(BULK_READ_CHUNK_SIZE) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT event_id, competitor_id, name, entry_number, handler, visual_id \
                 FROM competitors WHERE event_id IN (",
            );
            push_id_list(&mut qb, chunk);
            qb.push(" ORDER BY event_id, entry_number, competitor_id");
            let rows: Vec<CompetitorRow> = qb.build_query_as().fetch_all(&self.pool).await?;

            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT event_id, competitor_id, estimator, raw_value FROM estimates WHERE event_id IN (",
            );
            push_id_list(&mut qb, chunk);
            let estimates: Vec<EstimateRow> = qb.build_query_as().fetch_all(&self.pool).await?;

            let mut by_competitor: HashMap<(String, String), Vec<EstimateRow>> = HashMap::new();
            for e in estimates {
                by_competitor
                    .entry((e.event_id.clone(), e.competitor_id.clone()))
                    .or_default()
                    .push(e);
            }

            for row in rows {
                let estimates = by_competitor
                    .remove(&(row.event_id.clone(), row.competitor_id.clone()))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| (e.estimator, e.raw_value))
                    .collect();
                competitors.push(CompetitorRecord {
                    event_id: row.event_id,
                    competitor_id: row.competitor_id,
                    name: row.name,
                    entry_number: row.entry_number.and_then(|n| u32::try_from(n).ok()),
                    handler: row.handler,
                    visual_id: row.visual_id,
                    estimates,
                });
            }
        }
        Ok(competitors)
    }

    /// Events in `[from, to)` with their competitors attached.
    pub async fn fields_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventWithCompetitors>> {
        let events = self.events_between(from, to).await?;
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let competitors = self.competitors_for(&ids).await?;
        Ok(group_fields(events, competitors))
    }

    pub async fn field(&self, event_id: &str) -> Result<Option<EventWithCompetitors>> {
        let Some(event) = self.event(event_id).await? else {
            return Ok(None);
        };
        let competitors = self.competitors_for(&[event.id.clone()]).await?;
        Ok(Some(EventWithCompetitors { event, competitors }))
    }
}

/// Attaches competitors to their events, preserving event order. Orphans are dropped.
pub fn group_fields(
    events: Vec<EventMeta>,
    competitors: Vec<CompetitorRecord>,
) -> Vec<EventWithCompetitors> {
    let mut by_event: HashMap<String, Vec<CompetitorRecord>> = HashMap::new();
    for c in competitors {
        by_event.entry(c.event_id.clone()).or_default().push(c);
    }
    events
        .into_iter()
        .map(|event| {
            let competitors = by_event.remove(&event.id).unwrap_or_default();
            EventWithCompetitors { event, competitors }
        })
        .collect()
}

fn push_id_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, ids: &'a [String]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.as_str());
    }
    separated.push_unseparated(")");
}

const EVENT_SAVEPOINT: &str = "catalog_event";

async fn write_field_in_savepoint(
    conn: &mut SqliteConnection,
    field: &EventWithCompetitors,
    now_ms: i64,
) -> Result<()> {
    savepoint(conn, EVENT_SAVEPOINT).await?;
    write_field(conn, field, now_ms).await?;
    release_savepoint(conn, EVENT_SAVEPOINT).await
}

async fn write_field(
    conn: &mut SqliteConnection,
    field: &EventWithCompetitors,
    now_ms: i64,
) -> Result<()> {
    let e = &field.event;
    sqlx::query(
        r#"
        INSERT INTO events (id, venue, name, start_time_ms, updated_at_ms)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            venue = excluded.venue,
            name = excluded.name,
            start_time_ms = excluded.start_time_ms,
            updated_at_ms = excluded.updated_at_ms
        "#,
    )
    .bind(&e.id)
    .bind(&e.venue)
    .bind(&e.name)
    .bind(to_ms(e.start_time))
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM estimates WHERE event_id = ?")
        .bind(&e.id)
        .execute(&mut *conn)
        .await?;

    // Competitors withdrawn upstream drop out of the catalog.
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("DELETE FROM competitors WHERE event_id = ");
    qb.push_bind(e.id.as_str());
    if !field.competitors.is_empty() {
        qb.push(" AND competitor_id NOT IN (");
        let mut separated = qb.separated(", ");
        for c in &field.competitors {
            separated.push_bind(c.competitor_id.as_str());
        }
        separated.push_unseparated(")");
    }
    qb.build().execute(&mut *conn).await?;

    for c in &field.competitors {
        sqlx::query(
            r#"
            INSERT INTO competitors (
                event_id, competitor_id, name, entry_number, handler, visual_id, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(event_id, competitor_id) DO UPDATE SET
                name = excluded.name,
                entry_number = excluded.entry_number,
                handler = excluded.handler,
                visual_id = excluded.visual_id,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&e.id)
        .bind(&c.competitor_id)
        .bind(&c.name)
        .bind(c.entry_number.map(i64::from))
        .bind(&c.handler)
        .bind(&c.visual_id)
        .bind(now_ms)
        .execute(&mut *conn)
        .await?;

        for (estimator, raw) in &c.estimates {
            sqlx::query(
                r#"
                INSERT INTO estimates (event_id, competitor_id, estimator, raw_value, updated_at_ms)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&e.id)
            .bind(&c.competitor_id)
            .bind(estimator)
            .bind(*raw)
            .bind(now_ms)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}
