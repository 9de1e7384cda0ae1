//! Persistence for the saga orchestration engine.
//!
//! Stores three kinds of JSON documents:
//! - the current record of each saga, guarded by an [`ETag`]
//! - an append-only, sequence-numbered snapshot history per saga
//! - saga configurations used as step templates for new sagas

pub mod document;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::{ConfigurationId, ETag, SagaId, SnapshotId};
pub use document::{ConfigurationDocument, SagaDocument, Sequence, SnapshotEnvelope};
pub use error::{Result, StoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{ConfigurationStore, SagaStore, SagaStoreExt, SnapshotStream};
