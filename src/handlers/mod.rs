//! Pipeline wiring
//!
//! `PipelineContext` is built once at startup and owns the store, the
//! geocode cache, the enrichment queue and the shutdown token. Every task
//! gets what it needs from it; there is no global state.

pub mod location;

use std::sync::Arc;

use anyhow::Result;
use async_nats::jetstream;
use async_nats::Client;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::db::{LocationStore, PgLocationStore};
use crate::defaults;
use crate::services::crawler::BacklogCrawler;
use crate::services::decoder::DecoderOptions;
use crate::services::enrichment::{geocode_queue, Enricher, GeocodeQueue, GeocodeWorker};
use crate::services::geocode_cache::GeocodeCache;
use crate::services::geocoding::{create_geocoder, CachedReverseGeocoder, ReverseGeocoder};
use crate::services::user_filter::UserFilter;
use crate::services::writer::LocationWriter;
use crate::types::LocationId;

use self::location::{consume_locations, ensure_location_consumer, run_ingestion, LocationIngestor};

pub struct PipelineContext {
    pub store: Arc<dyn LocationStore>,
    cache: Arc<GeocodeCache>,
    /// `None` when no reverse geocoder is configured
    pub enricher: Option<Enricher>,
    /// `None` when enrichment on insert is off
    pub geocode_queue: Option<GeocodeQueue>,
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    /// Returns the context and, if on-insert enrichment is enabled, the
    /// receiving end of the enrichment queue for the worker.
    pub fn new(
        store: Arc<dyn LocationStore>,
        geocoder: Option<Arc<dyn ReverseGeocoder>>,
        config: &Config,
        shutdown: CancellationToken,
    ) -> (Self, Option<mpsc::Receiver<LocationId>>) {
        let cache = Arc::new(GeocodeCache::new(config.geocode_cache_max_entries));

        let enricher = geocoder.map(|geocoder| {
            let cached = CachedReverseGeocoder::new(geocoder, cache.clone());
            Enricher::new(store.clone(), Arc::new(cached))
        });

        let (geocode_queue, rx) = match &enricher {
            Some(_) if config.geocode_on_insert => {
                let (queue, rx) = geocode_queue(config.geocode_queue_capacity);
                (Some(queue), Some(rx))
            }
            _ => (None, None),
        };

        let ctx = Self {
            store,
            cache,
            enricher,
            geocode_queue,
            shutdown,
        };
        (ctx, rx)
    }

    pub fn ingestor(&self, config: &Config) -> LocationIngestor {
        LocationIngestor::new(
            DecoderOptions {
                reject_empty_user: config.reject_empty_user,
            },
            UserFilter::from_list(&config.filter_users),
            LocationWriter::new(self.store.clone(), config.retry_policy()),
            self.geocode_queue.clone(),
        )
    }

    /// Spawn the enrichment worker and, if enabled, the backlog crawler
    pub fn spawn_enrichment(
        &self,
        config: &Config,
        rx: Option<mpsc::Receiver<LocationId>>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let Some(enricher) = self.enricher.clone() else {
            return handles;
        };

        if let Some(rx) = rx {
            let worker = GeocodeWorker::new(enricher.clone(), rx);
            handles.push(tokio::spawn(worker.run(self.shutdown.clone())));
        }

        if config.enable_geocoding_crawler {
            let crawler = BacklogCrawler::new(
                self.store.clone(),
                enricher,
                config.geocoding_crawler_interval,
            );
            handles.push(tokio::spawn(crawler.run(self.shutdown.clone())));
        }

        handles
    }
}

/// Run the pipeline until `shutdown` is cancelled
pub async fn start_pipeline(
    client: Client,
    pool: PgPool,
    config: &Config,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting location pipeline...");

    let store: Arc<dyn LocationStore> = Arc::new(PgLocationStore::new(pool));
    info!("Location store: {}", store.backend_name());

    let geocoder = create_geocoder(config)?;
    let (ctx, geocode_rx) = PipelineContext::new(store, geocoder, config, shutdown.clone());
    if !config.filter_users.is_empty() {
        info!("Accepting locations only from: {}", config.filter_users);
    }

    let js = jetstream::new(client);
    let consumer = ensure_location_consumer(&js, config).await?;

    let background = ctx.spawn_enrichment(config, geocode_rx);

    let (tx, rx) = mpsc::channel(defaults::DELIVERY_CHANNEL_CAPACITY);
    let ingestion = tokio::spawn(run_ingestion(ctx.ingestor(config), rx, shutdown.clone()));
    let consumer_handle = tokio::spawn(consume_locations(consumer, tx, shutdown.clone()));

    let consumer_result = consumer_handle.await;
    let unexpected_stop = !shutdown.is_cancelled();
    shutdown.cancel();

    if let Err(e) = ingestion.await {
        error!("Ingestion task failed: {}", e);
    }
    for handle in background {
        if let Err(e) = handle.await {
            error!("Enrichment task failed: {}", e);
        }
    }

    match consumer_result {
        Ok(Ok(())) if unexpected_stop => anyhow::bail!("Location consumer stopped unexpectedly"),
        Ok(Ok(())) => {
            info!("Location pipeline stopped ({} addresses cached)", ctx.cache.len());
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::location::testing::{report, FakeDelivery};
    use super::location::IngestOutcome;
    use super::*;
    use crate::db::memory::MemoryLocationStore;
    use crate::services::geocoding::testing::CountingGeocoder;
    use crate::services::writer::WriteOutcome;
    use crate::types::AddressEnvelope;

    fn config(vars: &[(&str, &str)]) -> Config {
        let mut map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.insert("DATABASE_URL".into(), "postgres://test".into());
        Config::from_lookup(|key| map.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn inserted_location_is_enriched_by_worker() {
        let store = Arc::new(MemoryLocationStore::new());
        let provider = Arc::new(CountingGeocoder::new());
        let config = config(&[]);
        let shutdown = CancellationToken::new();

        let dyn_store: Arc<dyn LocationStore> = store.clone();
        let dyn_provider: Arc<dyn ReverseGeocoder> = provider.clone();
        let (ctx, rx) = PipelineContext::new(dyn_store, Some(dyn_provider), &config, shutdown.clone());
        assert!(ctx.geocode_queue.is_some());

        let handles = ctx.spawn_enrichment(&config, rx);
        assert_eq!(handles.len(), 1);

        let ingestor = ctx.ingestor(&config);
        let delivery = FakeDelivery::new("owntracks/alice/phone", &report(1_700_000_000));
        let outcome = ingestor.handle(&delivery).await;
        let id = match outcome {
            IngestOutcome::Written(WriteOutcome::Inserted(id)) => id,
            other => panic!("expected insert, got {:?}", other),
        };
        assert!(delivery.acked());

        let mut enriched = None;
        for _ in 0..50 {
            enriched = store.geocoding(id);
            if enriched.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let envelope: AddressEnvelope = serde_json::from_str(&enriched.unwrap()).unwrap();
        assert_eq!(envelope.place_name(), Some("Münster"));
        assert_eq!(provider.calls(), 1);
        assert_eq!(ctx.cache.len(), 1);
    }

    #[tokio::test]
    async fn no_geocoder_means_no_queue_and_no_tasks() {
        let store: Arc<dyn LocationStore> = Arc::new(MemoryLocationStore::new());
        let config = config(&[("ENABLE_GEOCODING_CRAWLER", "true")]);

        let (ctx, rx) = PipelineContext::new(store, None, &config, CancellationToken::new());

        assert!(ctx.enricher.is_none());
        assert!(ctx.geocode_queue.is_none());
        assert!(ctx.spawn_enrichment(&config, rx).is_empty());
    }

    #[tokio::test]
    async fn crawler_only_when_insert_enrichment_is_off() {
        let store: Arc<dyn LocationStore> = Arc::new(MemoryLocationStore::new());
        let provider: Arc<dyn ReverseGeocoder> = Arc::new(CountingGeocoder::new());
        let config = config(&[
            ("GEOCODE_ON_INSERT", "false"),
            ("ENABLE_GEOCODING_CRAWLER", "true"),
        ]);
        let shutdown = CancellationToken::new();

        let (ctx, rx) = PipelineContext::new(store, Some(provider), &config, shutdown.clone());
        assert!(ctx.geocode_queue.is_none());

        let handles = ctx.spawn_enrichment(&config, rx);
        assert_eq!(handles.len(), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
