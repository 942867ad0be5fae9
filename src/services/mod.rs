//! Pipeline services

pub mod ack;
pub mod crawler;
pub mod decoder;
pub mod enrichment;
pub mod geocode_cache;
pub mod geocoding;
pub mod nominatim;
pub mod user_filter;
pub mod writer;
