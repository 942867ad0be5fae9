//! Type definitions

pub mod geocode;
pub mod location;

pub use geocode::*;
pub use location::*;
