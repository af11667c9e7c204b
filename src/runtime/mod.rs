//! Pipeline workers, handle and event stream.

/// Retry delays.
pub mod backoff;
/// Event stream types emitted by the workers.
pub mod events;
/// Pipeline spawning and handle.
pub mod handle;
