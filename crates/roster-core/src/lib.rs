//! roster-core library.
//!
//! Optimistic mutation coordination for grid-style editing: many cell and
//! field edits are applied locally at once, written with at most one
//! in-flight request per entity, and rolled back field-by-field when a write
//! fails.
//!
//! # Conventions
//!
//! - **Errors**: `thiserror` enums for library errors, `anyhow::Result` at the
//!   configuration edge.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod applier;
pub mod cache;
pub mod config;
pub mod consolidate;
pub mod coordinator;
pub mod error;
pub mod local;
pub mod model;
pub mod queue;
pub mod token;
pub mod transport;

pub use applier::{AppliedPatch, OptimisticApplier};
pub use cache::{CacheInvalidator, QueryCache};
pub use config::CoordinatorConfig;
pub use consolidate::{EditConsolidator, WritePlan, consolidate};
pub use coordinator::{BatchResult, FailedEntity, MutationCoordinator};
pub use error::{ErrorCode, FailureReason, WriteFailure};
pub use local::{LocalState, MemoryState};
pub use model::{Edit, EntityId, Fields, Patch, PatchState, ResourceKey, Snapshot, VersionToken};
pub use queue::EntityWriteQueue;
pub use token::VersionTokenStore;
pub use transport::{BulkItemResult, WriteAck, WriteRequest, WriteTransport};
