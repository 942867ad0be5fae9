//! Default configuration values

pub const NATS_URL: &str = "nats://localhost:4222";
pub const DATABASE_MAX_CONNECTIONS: u32 = 10;

pub const LOCATION_STREAM: &str = "OWNTRACKS_LOCATIONS";
pub const LOCATION_SUBJECT: &str = "owntracks.>";
pub const LOCATION_CONSUMER: &str = "location_recorder";
/// -1 lets JetStream redeliver without limit
pub const NATS_MAX_DELIVER: i64 = -1;

pub const INSERT_TIMEOUT_SECS: u64 = 5;
pub const INSERT_RETRY_BUDGET_SECS: u64 = 60;

pub const GEOCODE_QUEUE_CAPACITY: usize = 100;
/// Nominatim's public instance allows one request per second
pub const GEOCODE_RATE_LIMIT_MS: u64 = 1000;
pub const GEOCODING_CRAWLER_INTERVAL_SECS: u64 = 10;

/// Extra time on top of the retry budget before JetStream redelivers
pub const ACK_WAIT_MARGIN_SECS: u64 = 30;

/// Deliveries buffered between the consumer and the ingestion task
pub const DELIVERY_CHANNEL_CAPACITY: usize = 1;

/// Unacked deliveries JetStream hands out at once. Deliveries are written
/// one at a time, so anything beyond the one in flight would sit in a
/// buffer while its ack deadline runs.
pub const LOCATION_MAX_ACK_PENDING: i64 = 1;

pub const LOGS_DIR: &str = "./logs";
pub const LOG_FILE: &str = "recorder.log";
pub const LOG_FILTER: &str = "info,owntracks_recorder=debug";
