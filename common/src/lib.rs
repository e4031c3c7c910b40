//! Common code shared between `classify_server` and `camera`.
pub mod protocol;

/// Error type.
pub type Error = Box<dyn std::error::Error>;
