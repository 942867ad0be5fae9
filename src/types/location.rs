//! Location report types
//!
//! `LocationMessage` is the wire shape published by OwnTracks clients.
//! `NewLocation` is the validated, identity-tagged record handed to the store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Unexpected, Visitor};
use serde::{Deserialize, Serialize};

/// Store-assigned row identifier
pub type LocationId = i64;

/// A WGS84 coordinate pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// User and device derived from the message topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub device: String,
}

/// OwnTracks `doze` flag.
///
/// Clients send it as a JSON boolean, as the numbers `0`/`1`, or as one of
/// the strings `"1"`, `"0"`, `"true"`, `"false"`. Anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Doze(pub bool);

impl<'de> Deserialize<'de> for Doze {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DozeVisitor;

        impl<'de> Visitor<'de> for DozeVisitor {
            type Value = Doze;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a boolean, 0, 1, "0", "1", "true" or "false""#)
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Doze, E> {
                Ok(Doze(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Doze, E> {
                match value {
                    0 => Ok(Doze(false)),
                    1 => Ok(Doze(true)),
                    other => Err(E::invalid_value(Unexpected::Unsigned(other), &self)),
                }
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Doze, E> {
                match value {
                    0 => Ok(Doze(false)),
                    1 => Ok(Doze(true)),
                    other => Err(E::invalid_value(Unexpected::Signed(other), &self)),
                }
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Doze, E> {
                match value {
                    "1" | "true" => Ok(Doze(true)),
                    "0" | "false" => Ok(Doze(false)),
                    other => Err(E::invalid_value(Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(DozeVisitor)
    }
}

/// Location report as published by an OwnTracks client.
///
/// `tst` and `acc` are only required for `_type == "location"`, so they are
/// optional here and checked by the decoder after the type is known.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationMessage {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(rename = "_id")]
    pub message_id: Option<String>,
    #[serde(rename = "tid")]
    pub tracker_id: Option<String>,
    #[serde(rename = "tst")]
    pub device_timestamp: Option<i64>,
    #[serde(rename = "acc")]
    pub accuracy: Option<f64>,
    #[serde(rename = "vac")]
    pub vertical_accuracy: Option<f64>,
    #[serde(rename = "batt")]
    pub battery: Option<i32>,
    #[serde(rename = "conn")]
    pub connection: Option<String>,
    pub doze: Option<Doze>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(rename = "vel")]
    pub speed: Option<f64>,
    #[serde(rename = "alt")]
    pub altitude: Option<f64>,
    #[serde(rename = "cog")]
    pub course: Option<f64>,
}

/// Validated location ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewLocation {
    pub received_at: DateTime<Utc>,
    pub device_timestamp: DateTime<Utc>,
    pub accuracy: f64,
    pub vertical_accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    /// Absent in the report means not dozing
    pub doze: bool,
    pub battery: Option<i32>,
    pub connection: Option<String>,
    pub point: Coordinates,
    pub identity: Identity,
    /// Client message id, for log correlation only
    pub message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct DozeOnly {
        doze: Option<Doze>,
    }

    fn doze(json: &str) -> Result<Option<Doze>, serde_json::Error> {
        serde_json::from_str::<DozeOnly>(json).map(|d| d.doze)
    }

    #[test]
    fn doze_accepts_string_forms() {
        assert_eq!(doze(r#"{"doze":"1"}"#).unwrap(), Some(Doze(true)));
        assert_eq!(doze(r#"{"doze":"0"}"#).unwrap(), Some(Doze(false)));
        assert_eq!(doze(r#"{"doze":"true"}"#).unwrap(), Some(Doze(true)));
        assert_eq!(doze(r#"{"doze":"false"}"#).unwrap(), Some(Doze(false)));
    }

    #[test]
    fn doze_accepts_bool_and_numeric_forms() {
        assert_eq!(doze(r#"{"doze":true}"#).unwrap(), Some(Doze(true)));
        assert_eq!(doze(r#"{"doze":0}"#).unwrap(), Some(Doze(false)));
        assert_eq!(doze(r#"{"doze":1}"#).unwrap(), Some(Doze(true)));
    }

    #[test]
    fn doze_missing_or_null_is_none() {
        assert_eq!(doze(r#"{}"#).unwrap(), None);
        assert_eq!(doze(r#"{"doze":null}"#).unwrap(), None);
    }

    #[test]
    fn doze_rejects_other_literals() {
        assert!(doze(r#"{"doze":"maybe"}"#).is_err());
        assert!(doze(r#"{"doze":2}"#).is_err());
        assert!(doze(r#"{"doze":"yes"}"#).is_err());
    }
}
