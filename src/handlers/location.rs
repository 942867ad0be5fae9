//! Location report ingestion
//!
//! The JetStream consumer task forwards deliveries into a channel; a single
//! ingestion task takes them one at a time through decode, user filter and
//! the retrying writer, then acks according to the outcome. Successful
//! inserts are queued for enrichment after the ack.
//!
//! The ack deadline of a delivery runs from the moment JetStream hands it
//! out. The consumer therefore keeps at most `LOCATION_MAX_ACK_PENDING`
//! deliveries outstanding, and every writer retry marks the delivery as in
//! progress, which restarts its deadline.

use std::sync::Arc;

use anyhow::Result;
use async_nats::jetstream::{self, consumer::PullConsumer, Context as JsContext};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::defaults;
use crate::services::ack::Disposition;
use crate::services::decoder::{decode_location, subject_to_topic, DecodeError, DecoderOptions};
use crate::services::enrichment::GeocodeQueue;
use crate::services::user_filter::UserFilter;
use crate::services::writer::{LocationWriter, RetryObserver, WriteOutcome};

// ==========================================================================
// Deliveries
// ==========================================================================

/// One inbound message awaiting acknowledgement
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Slash-delimited topic
    fn topic(&self) -> &str;

    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<()>;

    /// Restart the redelivery deadline without acknowledging
    async fn in_progress(&self) -> Result<()>;
}

pub struct JetStreamDelivery {
    topic: String,
    message: jetstream::Message,
}

impl JetStreamDelivery {
    pub fn new(message: jetstream::Message) -> Self {
        Self {
            topic: subject_to_topic(message.subject.as_str()),
            message,
        }
    }
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("failed to ack {}: {}", self.topic, e))
    }

    async fn in_progress(&self) -> Result<()> {
        self.message
            .ack_with(jetstream::AckKind::Progress)
            .await
            .map_err(|e| anyhow::anyhow!("failed to extend ack deadline of {}: {}", self.topic, e))
    }
}

/// Marks a delivery as in progress whenever the writer backs off
struct DeliveryProgress<'a, D>(&'a D);

#[async_trait]
impl<'a, D: Delivery> RetryObserver for DeliveryProgress<'a, D> {
    async fn before_retry(&self, attempt: u32) {
        if let Err(e) = self.0.in_progress().await {
            warn!("Retry {}: {}", attempt, e);
        }
    }
}

// ==========================================================================
// Ingestion
// ==========================================================================

#[derive(Debug)]
pub enum IngestOutcome {
    Rejected(DecodeError),
    /// User not on the allow-list
    Filtered(String),
    Written(WriteOutcome),
}

impl IngestOutcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            IngestOutcome::Rejected(_) | IngestOutcome::Filtered(_) => Disposition::Ack,
            IngestOutcome::Written(outcome) => Disposition::for_write(outcome),
        }
    }
}

pub struct LocationIngestor {
    options: DecoderOptions,
    filter: UserFilter,
    writer: LocationWriter,
    queue: Option<GeocodeQueue>,
}

impl LocationIngestor {
    pub fn new(
        options: DecoderOptions,
        filter: UserFilter,
        writer: LocationWriter,
        queue: Option<GeocodeQueue>,
    ) -> Self {
        Self {
            options,
            filter,
            writer,
            queue,
        }
    }

    /// Decode, filter and persist one report
    pub async fn ingest(
        &self,
        topic: &str,
        payload: &[u8],
        observer: &dyn RetryObserver,
    ) -> IngestOutcome {
        let location = match decode_location(payload, topic, &self.options, Utc::now()) {
            Ok(location) => location,
            Err(e @ DecodeError::UnsupportedKind(_)) => {
                info!("Ignoring message on {}: {}", topic, e);
                return IngestOutcome::Rejected(e);
            }
            Err(e) => {
                warn!("Dropping undecodable message on {}: {}", topic, e);
                return IngestOutcome::Rejected(e);
            }
        };

        if !self.filter.allows(&location.identity.user) {
            info!("Dropping location of filtered user '{}'", location.identity.user);
            return IngestOutcome::Filtered(location.identity.user);
        }

        let outcome = self.writer.write(&location, observer).await;
        if let WriteOutcome::Inserted(id) = outcome {
            debug!(
                "Stored location {} for {}/{} (message {})",
                id,
                location.identity.user,
                location.identity.device,
                location.message_id.as_deref().unwrap_or("-")
            );
        }
        IngestOutcome::Written(outcome)
    }

    /// Ingest a delivery, ack it when appropriate, then queue enrichment
    pub async fn handle<D: Delivery>(&self, delivery: &D) -> IngestOutcome {
        let progress = DeliveryProgress(delivery);
        let outcome = self
            .ingest(delivery.topic(), delivery.payload(), &progress)
            .await;

        match outcome.disposition() {
            Disposition::Ack => {
                if let Err(e) = delivery.ack().await {
                    error!("{}", e);
                }
            }
            Disposition::Withhold => {
                warn!("Leaving message on {} unacknowledged for redelivery", delivery.topic());
            }
        }

        if let (IngestOutcome::Written(WriteOutcome::Inserted(id)), Some(queue)) =
            (&outcome, &self.queue)
        {
            queue.enqueue(*id).await;
        }

        outcome
    }
}

/// Process deliveries one at a time until shutdown or until the sender is gone.
/// Deliveries still buffered at shutdown stay unacked and are redelivered.
pub async fn run_ingestion<D: Delivery>(
    ingestor: LocationIngestor,
    mut rx: mpsc::Receiver<D>,
    shutdown: CancellationToken,
) {
    info!("Location ingestion started");

    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => delivery,
                None => break,
            },
        };

        ingestor.handle(&delivery).await;
    }

    info!("Location ingestion stopped");
}

// ==========================================================================
// JetStream
// ==========================================================================

/// Create the location stream and durable pull consumer if missing
pub async fn ensure_location_consumer(js: &JsContext, config: &Config) -> Result<PullConsumer> {
    let stream_config = jetstream::stream::Config {
        name: config.location_stream.clone(),
        subjects: vec![config.location_subject.clone()],
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        ..Default::default()
    };
    let stream = js.get_or_create_stream(stream_config).await?;
    info!("JetStream location stream '{}' ready", config.location_stream);

    let consumer_config = jetstream::consumer::pull::Config {
        durable_name: Some(config.location_consumer.clone()),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait: config.ack_wait(),
        max_deliver: config.nats_max_deliver,
        max_ack_pending: defaults::LOCATION_MAX_ACK_PENDING,
        ..Default::default()
    };
    let consumer = stream
        .get_or_create_consumer(&config.location_consumer, consumer_config)
        .await?;
    info!(
        "JetStream location consumer '{}' ready (ack wait {:?})",
        config.location_consumer,
        config.ack_wait()
    );

    Ok(consumer)
}

/// Pull messages and forward them to the ingestion task until shutdown
pub async fn consume_locations(
    consumer: PullConsumer,
    tx: mpsc::Sender<JetStreamDelivery>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut messages = consumer.messages().await?;

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = messages.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                error!("Error receiving location message: {}", e);
                continue;
            }
            None => {
                warn!("Location message stream ended");
                break;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = tx.send(JetStreamDelivery::new(msg)) => {
                if sent.is_err() {
                    warn!("Ingestion task gone, stopping location consumer");
                    break;
                }
            }
        }
    }

    info!("Location consumer stopped");
    Ok(())
}
