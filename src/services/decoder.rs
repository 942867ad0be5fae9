//! OwnTracks message decoding
//!
//! Turns a raw payload and its topic into a `NewLocation`. Anything that is
//! not a well-formed `_type: "location"` report is rejected with a
//! `DecodeError`; rejected messages are acknowledged and dropped upstream.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Coordinates, Identity, LocationMessage, NewLocation};

const LOCATION_KIND: &str = "location";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported message type '{0}'")]
    UnsupportedKind(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("device timestamp {0} is out of range")]
    InvalidTimestamp(i64),

    #[error("topic '{0}' carries no user")]
    EmptyUser(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions {
    /// Reject reports whose topic yields an empty user
    pub reject_empty_user: bool,
}

/// Derive user and device from a slash-delimited topic.
///
/// `owntracks/alice/phone` gives (alice, phone), `owntracks/alice` gives
/// (alice, ""), and a single segment gives ("", ""). With more than three
/// segments the last two are used.
pub fn parse_topic(topic: &str) -> Identity {
    let segments: Vec<&str> = topic.split('/').collect();
    match segments.len() {
        2 => Identity {
            user: segments[1].to_string(),
            device: String::new(),
        },
        n if n > 2 => Identity {
            user: segments[n - 2].to_string(),
            device: segments[n - 1].to_string(),
        },
        _ => Identity::default(),
    }
}

/// Map a NATS subject (`owntracks.alice.phone`) back to its MQTT topic.
///
/// The MQTT gateway publishes a `.` inside a topic level as `//`, so
/// `owntracks.john//doe.phone` is `owntracks/john.doe/phone`.
pub fn subject_to_topic(subject: &str) -> String {
    subject
        .split("//")
        .map(|part| part.replace('.', "/"))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn decode_location(
    payload: &[u8],
    topic: &str,
    options: &DecoderOptions,
    received_at: DateTime<Utc>,
) -> Result<NewLocation, DecodeError> {
    let message: LocationMessage = serde_json::from_slice(payload)?;

    if message.kind != LOCATION_KIND {
        return Err(DecodeError::UnsupportedKind(message.kind));
    }

    let tst = message.device_timestamp.ok_or(DecodeError::MissingField("tst"))?;
    let accuracy = message.accuracy.ok_or(DecodeError::MissingField("acc"))?;
    let lat = message.lat.ok_or(DecodeError::MissingField("lat"))?;
    let lon = message.lon.ok_or(DecodeError::MissingField("lon"))?;

    let device_timestamp =
        DateTime::<Utc>::from_timestamp(tst, 0).ok_or(DecodeError::InvalidTimestamp(tst))?;

    let identity = parse_topic(topic);
    if options.reject_empty_user && identity.user.is_empty() {
        return Err(DecodeError::EmptyUser(topic.to_string()));
    }

    Ok(NewLocation {
        received_at,
        device_timestamp,
        accuracy,
        vertical_accuracy: message.vertical_accuracy,
        altitude: message.altitude,
        speed: message.speed,
        course: message.course,
        doze: message.doze.is_some_and(|d| d.0),
        battery: message.battery,
        connection: message.connection,
        point: Coordinates::new(lat, lon),
        identity,
        message_id: message.message_id.or(message.tracker_id),
    })
}
