use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::api::health::HealthState;
use crate::api::latency::Latencies;
use crate::config::Config;
use crate::db::{Catalog, PriceStore};
use crate::error::Result;
use crate::fetcher::{build_client, fetch_feed, FeedSnapshot};
use crate::types::PollSummary;

/// Scheduled feed cycle: gate on active hours, fetch, refresh the catalog, apply prices.
pub struct FeedPoller {
    cfg: Config,
    client: reqwest::Client,
    prices: PriceStore,
    catalog: Catalog,
    health: Arc<HealthState>,
    latency: Arc<Latencies>,
}

impl FeedPoller {
    pub fn new(
        cfg: Config,
        prices: PriceStore,
        catalog: Catalog,
        health: Arc<HealthState>,
        latency: Arc<Latencies>,
    ) -> Result<Self> {
        let client = build_client(cfg.feed_timeout_secs)?;
        Ok(Self { cfg, client, prices, catalog, health, latency })
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(self.cfg.poll_interval_secs));
        // A slow cycle delays the next one instead of queueing a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let started = Instant::now();
            let now = Utc::now();
            match self.poll_once(now).await {
                Ok(summary) => {
                    self.health.record_poll(&summary, now);
                    if !summary.gated {
                        self.latency.poll.record(started.elapsed());
                    }
                }
                Err(e) => {
                    // Skipped; the next tick retries from scratch.
                    error!("Feed poll failed: {e}");
                    self.health.record_failure(&e.to_string());
                }
            }
        }
    }

    /// One cycle. Outside the active window this is a no-op returning a gated summary.
    /// Feed and database failures are errors; bad records are counted in the summary.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<PollSummary> {
        let local = now.with_timezone(&self.cfg.tz).time();
        if !self.cfg.active_window.contains(local) {
            debug!(local_time = %local, "Outside active window, poll skipped");
            return Ok(PollSummary::gated());
        }

        let snapshot = fetch_feed(&self.client, &self.cfg.feed_url).await?;
        self.process_snapshot(snapshot, now).await
    }

    /// Writes a parsed snapshot: catalog first so fusion sees metadata for every price.
    pub async fn process_snapshot(
        &self,
        snapshot: FeedSnapshot,
        now: DateTime<Utc>,
    ) -> Result<PollSummary> {
        let catalog = self.catalog.upsert_fields(&snapshot.fields, now).await?;
        let batch = self.prices.apply_batch(&snapshot.quotes).await?;

        let summary = PollSummary {
            gated: false,
            feed_events: snapshot.stats.events_total,
            events: catalog.events,
            competitors: catalog.competitors,
            quotes_seen: snapshot.quotes.len() + snapshot.stats.rejected_quotes,
            created: batch.created,
            changed: batch.changed,
            unchanged: batch.unchanged,
            skipped_invalid: snapshot.stats.rejected() + batch.rejected,
            failed_persist: catalog.failed + batch.failed,
        };

        info!(
            feed_events = summary.feed_events,
            events = summary.events,
            competitors = summary.competitors,
            quotes = summary.quotes_seen,
            created = summary.created,
            changed = summary.changed,
            unchanged = summary.unchanged,
            skipped = summary.skipped_invalid,
            failed = summary.failed_persist,
            "[POLL] cycle complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActiveWindow, SignalConfig};
    use crate::db::test_pool;
    use crate::fetcher::parse_feed;
    use crate::types::{Movement, PriceKey};
    use chrono::{FixedOffset, NaiveTime, TimeZone};

    fn config(tz_hours: i32) -> Config {
        Config {
            // Nothing listens here; gated cycles never reach it.
            feed_url: "http://127.0.0.1:9/feed".to_string(),
            feed_timeout_secs: 1,
            poll_interval_secs: 60,
            active_window: ActiveWindow {
                start: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(21, 30, 0).unwrap(),
            },
            tz: FixedOffset::east_opt(tz_hours * 3600).unwrap(),
            log_level: "info".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            signals: SignalConfig::default(),
        }
    }

    async fn poller(tz_hours: i32) -> FeedPoller {
        let pool = test_pool().await;
        FeedPoller::new(
            config(tz_hours),
            PriceStore::new(pool.clone(), 0.0),
            Catalog::new(pool),
            Arc::new(HealthState::new()),
            Arc::new(Latencies::new().unwrap()),
        )
        .unwrap()
    }

    fn feed(price: &str) -> String {
        format!(
            r#"{{"events":[{{"id":"r1","venue":"Ascot","start_time":"2026-10-18T14:30:00Z",
                "competitors":[
                    {{"id":"h1","handler":"J Smith","estimates":{{"ensemble":0.3}},
                      "quotes":[{{"source":"bookA","decimal":{price}}},{{"source":"bookB","fractional":"SP"}}]}},
                    {{"name":"anonymous"}}]}},
                {{"venue":"Ascot","start_time":"2026-10-18T15:00:00Z"}}]}}"#
        )
    }

    #[tokio::test]
    async fn outside_active_window_is_a_no_op() {
        let p = poller(0).await;
        let late = Utc.with_ymd_and_hms(2026, 10, 18, 22, 0, 0).unwrap();
        let summary = p.poll_once(late).await.unwrap();
        assert_eq!(summary, PollSummary::gated());
    }

    #[tokio::test]
    async fn gate_uses_the_configured_offset() {
        // 05:30 UTC is 07:30 at UTC+2, inside the window, so the cycle tries the feed.
        let p = poller(2).await;
        let early = Utc.with_ymd_and_hms(2026, 10, 18, 5, 30, 0).unwrap();
        assert!(p.poll_once(early).await.is_err());

        let p = poller(0).await;
        assert!(p.poll_once(early).await.unwrap().gated);
    }

    #[tokio::test]
    async fn snapshot_summary_counts_every_outcome() {
        let p = poller(0).await;
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap();

        let first = p.process_snapshot(parse_feed(&feed("5.0"), now).unwrap(), now).await.unwrap();
        assert_eq!(first.feed_events, 2);
        assert_eq!(first.events, 1);
        assert_eq!(first.competitors, 1);
        assert_eq!(first.quotes_seen, 2);
        assert_eq!(first.created, 1);
        assert_eq!(first.skipped_invalid, 3);
        assert_eq!(first.failed_persist, 0);

        let second = p.process_snapshot(parse_feed(&feed("4.0"), now).unwrap(), now).await.unwrap();
        assert_eq!((second.created, second.changed, second.unchanged), (0, 1, 0));

        let third = p.process_snapshot(parse_feed(&feed("4.0"), now).unwrap(), now).await.unwrap();
        assert_eq!((third.created, third.changed, third.unchanged), (0, 0, 1));

        let state = p.prices.get(&PriceKey::new("r1", "h1", "bookA")).await.unwrap().unwrap();
        assert_eq!(state.movement, Movement::Shortening);
        assert_eq!(state.change_count, 1);
        assert!((state.movement_pct.unwrap() + 20.0).abs() < 1e-9);
    }
}
