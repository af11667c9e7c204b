//! In-memory primary record store and index helpers.

/// Helper index aliases.
pub mod indices;
/// Primary record store emitting mutation events.
pub mod store;
