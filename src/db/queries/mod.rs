//! Database queries

pub mod location;
