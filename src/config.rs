//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults;
use crate::services::writer::RetryPolicy;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    pub database_max_connections: u32,

    /// NATS server URL
    pub nats_url: String,
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// JetStream stream, subject filter and durable consumer for location reports
    pub location_stream: String,
    pub location_subject: String,
    pub location_consumer: String,
    pub nats_max_deliver: i64,

    /// Comma-separated user allow-list; empty means everyone
    pub filter_users: String,
    pub reject_empty_user: bool,

    pub insert_timeout: Duration,
    pub insert_retry_budget: Duration,

    /// Nominatim base URL; `None` disables enrichment
    pub reverse_geocode_url: Option<String>,
    pub geocode_on_insert: bool,
    pub geocode_queue_capacity: usize,
    pub geocode_rate_limit: Duration,
    pub geocode_cache_max_entries: Option<usize>,

    pub enable_geocoding_crawler: bool,
    pub geocoding_crawler_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").context("DATABASE_URL must be set")?;

        let insert_timeout = Duration::from_secs(parse_or(
            &get,
            "INSERT_TIMEOUT_SECS",
            defaults::INSERT_TIMEOUT_SECS,
        )?);
        if insert_timeout.is_zero() {
            anyhow::bail!("INSERT_TIMEOUT_SECS must be greater than zero");
        }

        let geocode_queue_capacity =
            parse_or(&get, "GEOCODE_QUEUE_CAPACITY", defaults::GEOCODE_QUEUE_CAPACITY)?;
        if geocode_queue_capacity == 0 {
            anyhow::bail!("GEOCODE_QUEUE_CAPACITY must be greater than zero");
        }

        let geocoding_crawler_interval = Duration::from_secs(parse_or(
            &get,
            "GEOCODING_CRAWLER_INTERVAL_SECS",
            defaults::GEOCODING_CRAWLER_INTERVAL_SECS,
        )?);
        if geocoding_crawler_interval.is_zero() {
            anyhow::bail!("GEOCODING_CRAWLER_INTERVAL_SECS must be greater than zero");
        }

        Ok(Self {
            database_url,
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults::DATABASE_MAX_CONNECTIONS,
            )?,
            nats_url: get("NATS_URL").unwrap_or_else(|| defaults::NATS_URL.to_string()),
            nats_user: get("NATS_USER"),
            nats_password: get("NATS_PASSWORD"),
            location_stream: get("LOCATION_STREAM")
                .unwrap_or_else(|| defaults::LOCATION_STREAM.to_string()),
            location_subject: get("LOCATION_SUBJECT")
                .unwrap_or_else(|| defaults::LOCATION_SUBJECT.to_string()),
            location_consumer: get("LOCATION_CONSUMER")
                .unwrap_or_else(|| defaults::LOCATION_CONSUMER.to_string()),
            nats_max_deliver: parse_or(&get, "NATS_MAX_DELIVER", defaults::NATS_MAX_DELIVER)?,
            filter_users: get("FILTER_USERS").unwrap_or_default(),
            reject_empty_user: flag_or(&get, "REJECT_EMPTY_USER", false)?,
            insert_timeout,
            insert_retry_budget: Duration::from_secs(parse_or(
                &get,
                "INSERT_RETRY_BUDGET_SECS",
                defaults::INSERT_RETRY_BUDGET_SECS,
            )?),
            reverse_geocode_url: get("REVERSE_GEOCODE_URL"),
            geocode_on_insert: flag_or(&get, "GEOCODE_ON_INSERT", true)?,
            geocode_queue_capacity,
            geocode_rate_limit: Duration::from_millis(parse_or(
                &get,
                "GEOCODE_RATE_LIMIT_MS",
                defaults::GEOCODE_RATE_LIMIT_MS,
            )?),
            geocode_cache_max_entries: get("GEOCODE_CACHE_MAX_ENTRIES")
                .map(|v| parse_value("GEOCODE_CACHE_MAX_ENTRIES", &v))
                .transpose()?,
            enable_geocoding_crawler: flag_or(&get, "ENABLE_GEOCODING_CRAWLER", false)?,
            geocoding_crawler_interval,
        })
    }

    /// Backoff settings for the location writer
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: self.insert_timeout,
            max_elapsed: self.insert_retry_budget,
            ..RetryPolicy::default()
        }
    }

    /// How long JetStream waits for an ack or progress signal before
    /// redelivering.
    ///
    /// Covers the full retry budget plus one more attempt. The deadline
    /// starts when JetStream hands the message out; the writer restarts it
    /// before every backoff sleep.
    pub fn ack_wait(&self) -> Duration {
        self.insert_retry_budget
            + self.insert_timeout
            + Duration::from_secs(defaults::ACK_WAIT_MARGIN_SECS)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn flag_or<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{} must be a boolean (true/false/1/0), got '{}'", key, raw),
    }
}
