//! Keeps denormalized search documents in step with a primary store of chat
//! records (rooms, messages, contacts, users) by consuming per-type change
//! feeds.
//!
//! # Examples
//!
//! Recording a mutation and projecting it:
//! ```
//! use docsync::{
//!     core::store::RecordStore,
//!     projector::{related::RelatedEntitySnapshot, Projection, Projector},
//!     record::{ContactRecord, EntityRecord},
//! };
//!
//! let mut store = RecordStore::new();
//! let event = store
//!     .upsert(EntityRecord::Contact(ContactRecord {
//!         id: "c1".to_string(),
//!         name: "Ana".to_string(),
//!         ..ContactRecord::default()
//!     }))
//!     .expect("upsert");
//! assert_eq!(event.offset, 1);
//!
//! let projection = Projector::new()
//!     .project(&event, &RelatedEntitySnapshot::empty())
//!     .expect("project");
//! assert!(matches!(projection, Projection::Upsert(_)));
//! ```
//!
//! Running the pipeline over an in-process feed:
//! ```no_run
//! use docsync::{
//!     config::SyncConfig,
//!     core::store::RecordStore,
//!     feed::memory::MemoryFeed,
//!     index::memory::MemoryIndex,
//!     persist::MemoryCheckpointStore,
//!     record::{ContactRecord, EntityRecord},
//!     runtime::handle::{spawn_pipeline, PipelineDeps},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = RecordStore::new().into_shared();
//! let feed = MemoryFeed::shared();
//! let index = MemoryIndex::new();
//! let deps = PipelineDeps::new(
//!     feed.clone(),
//!     store.clone(),
//!     Box::new(index.clone()),
//!     Box::new(MemoryCheckpointStore::new()),
//! );
//! let handle = spawn_pipeline(SyncConfig::default(), deps).await.expect("spawn");
//!
//! let events = {
//!     let mut store = store.write();
//!     store
//!         .upsert(EntityRecord::Contact(ContactRecord {
//!             id: "c1".to_string(),
//!             name: "Ana".to_string(),
//!             ..ContactRecord::default()
//!         }))
//!         .expect("upsert");
//!     store.drain_pending_events()
//! };
//! feed.publish(events).expect("publish");
//! feed.close();
//! handle.join().await.expect("join");
//! assert_eq!(index.len(), 1);
//! # }
//! ```
#![warn(missing_docs)]

/// Pipeline configuration.
pub mod config;
/// Primary record store and index helpers.
pub mod core;
/// Search document model.
pub mod document;
/// Mutation events and their persisted envelope.
pub mod event;
/// Change feed sources and readers.
pub mod feed;
/// Search index abstraction, in-memory index and batching writer.
pub mod index;
/// Checkpoint stores and the SQLite journal.
pub mod persist;
/// Event to document projection.
pub mod projector;
/// Canonical chat records.
pub mod record;
/// Per-entity-type workers and pipeline handle.
pub mod runtime;
/// Durable checkpoint tracking.
pub mod tracker;
/// Shared primitive types and enums.
pub mod types;
