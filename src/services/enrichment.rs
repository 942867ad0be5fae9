//! Location enrichment
//!
//! Newly stored location ids are pushed onto a bounded queue. A single
//! worker pops them, looks up an address and writes it back. Errors are
//! logged and the id is dropped; the backlog crawler revisits it later.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{LocationStore, StoreError};
use crate::services::geocoding::{CachedReverseGeocoder, GeocodeError};
use crate::types::{Coordinates, LocationId};

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("location {0} not found")]
    NotFound(LocationId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Geocode(#[from] GeocodeError),
}

/// Looks up and stores the address of one location
#[derive(Clone)]
pub struct Enricher {
    store: Arc<dyn LocationStore>,
    geocoder: Arc<CachedReverseGeocoder>,
}

impl Enricher {
    pub fn new(store: Arc<dyn LocationStore>, geocoder: Arc<CachedReverseGeocoder>) -> Self {
        Self { store, geocoder }
    }

    /// Enrich a location by id, reading its point from the store
    pub async fn enrich(&self, id: LocationId) -> Result<(), EnrichError> {
        let point = self
            .store
            .location_point(id)
            .await?
            .ok_or(EnrichError::NotFound(id))?;
        self.enrich_point(id, point).await
    }

    pub async fn enrich_point(&self, id: LocationId, point: Coordinates) -> Result<(), EnrichError> {
        let envelope = self.geocoder.lookup(point).await?;
        if self.store.update_geocoding(id, &envelope).await? {
            debug!("Location {} enriched", id);
        } else {
            debug!("Location {} already enriched or gone", id);
        }
        Ok(())
    }
}

/// Producer side of the enrichment queue
#[derive(Clone)]
pub struct GeocodeQueue {
    tx: mpsc::Sender<LocationId>,
}

/// Create the enrichment queue with room for `capacity` ids
pub fn geocode_queue(capacity: usize) -> (GeocodeQueue, mpsc::Receiver<LocationId>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (GeocodeQueue { tx }, rx)
}

impl GeocodeQueue {
    /// Push an id, waiting while the queue is full
    pub async fn enqueue(&self, id: LocationId) {
        if self.tx.send(id).await.is_err() {
            warn!("Enrichment queue closed, location {} left for the crawler", id);
        }
    }
}

pub struct GeocodeWorker {
    enricher: Enricher,
    rx: mpsc::Receiver<LocationId>,
}

impl GeocodeWorker {
    pub fn new(enricher: Enricher, rx: mpsc::Receiver<LocationId>) -> Self {
        Self { enricher, rx }
    }

    /// Process ids until shutdown or until every producer is gone.
    /// Ids still queued at shutdown are dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Enrichment worker started");

        loop {
            let id = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            if let Err(e) = self.enricher.enrich(id).await {
                error!("Failed to enrich location {}: {}", id, e);
            }
        }

        self.rx.close();
        info!("Enrichment worker stopped");
    }
}
