//! Backlog crawler
//!
//! Rows whose enrichment failed or was never queued stay un-enriched. Every
//! tick the crawler picks the newest such row older than the start of
//! yesterday and runs it through the same enrichment path as the worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::db::LocationStore;
use crate::services::enrichment::{EnrichError, Enricher};
use crate::types::LocationId;

/// Start of the previous UTC day
pub fn backlog_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    today
        .pred_opt()
        .unwrap_or(today)
        .and_time(NaiveTime::MIN)
        .and_utc()
}

pub struct BacklogCrawler {
    store: Arc<dyn LocationStore>,
    enricher: Enricher,
    period: Duration,
}

impl BacklogCrawler {
    pub fn new(store: Arc<dyn LocationStore>, enricher: Enricher, period: Duration) -> Self {
        Self {
            store,
            enricher,
            period,
        }
    }

    /// Enrich at most one backlog row. Returns its id if one was found.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Option<LocationId>, EnrichError> {
        let cutoff = backlog_cutoff(now);
        let Some(row) = self.store.latest_unenriched_before(cutoff).await? else {
            return Ok(None);
        };

        debug!("Crawler enriching location {} (before {})", row.id, cutoff);
        self.enricher.enrich_point(row.id, row.point).await?;
        Ok(Some(row.id))
    }

    /// Tick every period until shutdown; the first tick fires after one period
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Geocoding crawler started (every {:?})", self.period);

        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.tick(Utc::now()) => {
                    if let Err(e) = result {
                        error!("Geocoding crawler tick failed: {}", e);
                    }
                }
            }
        }

        info!("Geocoding crawler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{sample_location, MemoryLocationStore};
    use crate::services::geocode_cache::GeocodeCache;
    use crate::services::geocoding::testing::CountingGeocoder;
    use crate::services::geocoding::{CachedReverseGeocoder, ReverseGeocoder};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn crawler(store: &Arc<MemoryLocationStore>, provider: &Arc<CountingGeocoder>) -> BacklogCrawler {
        let provider: Arc<dyn ReverseGeocoder> = provider.clone();
        let geocoder = CachedReverseGeocoder::new(provider, Arc::new(GeocodeCache::new(None)));
        let store: Arc<dyn LocationStore> = store.clone();
        let enricher = Enricher::new(store.clone(), Arc::new(geocoder));
        BacklogCrawler::new(store, enricher, Duration::from_millis(20))
    }

    #[test]
    fn cutoff_is_start_of_yesterday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 13, 45, 0).unwrap();
        assert_eq!(
            backlog_cutoff(now),
            Utc.with_ymd_and_hms(2024, 3, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn cutoff_crosses_month_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 1).unwrap();
        assert_eq!(
            backlog_cutoff(now),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn tick_enriches_only_old_rows() {
        let now = Utc::now();
        let store = Arc::new(MemoryLocationStore::new());
        let provider = Arc::new(CountingGeocoder::new());
        let old = store.seed(sample_location("alice", "phone", now - ChronoDuration::days(2)));
        let recent = store.seed(sample_location("alice", "phone", now - ChronoDuration::hours(12)));
        let crawler = crawler(&store, &provider);

        assert_eq!(crawler.tick(now).await.unwrap(), Some(old));
        assert!(store.geocoding(old).is_some());
        assert!(store.geocoding(recent).is_none());

        assert_eq!(crawler.tick(now).await.unwrap(), None);
        assert!(store.geocoding(recent).is_none());
    }

    #[tokio::test]
    async fn tick_prefers_most_recent_backlog_row() {
        let now = Utc::now();
        let store = Arc::new(MemoryLocationStore::new());
        let provider = Arc::new(CountingGeocoder::new());
        let older = store.seed(sample_location("alice", "phone", now - ChronoDuration::days(5)));
        let newer = store.seed(sample_location("alice", "phone", now - ChronoDuration::days(3)));
        let crawler = crawler(&store, &provider);

        assert_eq!(crawler.tick(now).await.unwrap(), Some(newer));
        assert_eq!(crawler.tick(now).await.unwrap(), Some(older));
    }

    #[tokio::test]
    async fn failed_lookup_is_reported_and_row_stays_pending() {
        let now = Utc::now();
        let store = Arc::new(MemoryLocationStore::new());
        let provider = Arc::new(CountingGeocoder::new());
        provider.set_failing(true);
        let old = store.seed(sample_location("alice", "phone", now - ChronoDuration::days(2)));

        tokio_test::assert_err!(crawler(&store, &provider).tick(now).await);
        assert!(store.geocoding(old).is_none());
    }

    #[tokio::test]
    async fn run_ticks_until_cancelled() {
        let now = Utc::now();
        let store = Arc::new(MemoryLocationStore::new());
        let provider = Arc::new(CountingGeocoder::new());
        let old = store.seed(sample_location("alice", "phone", now - ChronoDuration::days(2)));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(crawler(&store, &provider).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(store.geocoding(old).is_some());
    }
}
