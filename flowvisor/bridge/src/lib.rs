//! # FlowSpace Bridge Library
//!
//! Runtime around the FlowSpace engine: a single-writer mutation controller,
//! the consistency mirror with its persistence store and change
//! notifications, and the API handle collaborators use to query and mutate
//! the FlowSpace.

// Core modules
pub mod api;
pub mod api_types;
pub mod config;
pub mod controller;
pub mod error;
pub mod mirror;
pub mod store;

// Re-export commonly used types
pub use api::{FlowSpaceApi, FlowSpaceRuntime};
pub use api_types::FlowSpaceListing;
pub use config::{ControllerConfig, FlowVisorConfig, StorageBackend, StorageConfig};
pub use controller::{BatchId, BatchState, MutationHandle, MutationOutcome, SkippedChange};
pub use error::{BridgeError, BridgeResult};
pub use mirror::{ExportScope, FlowSpaceEvent, FlowSpaceListener, SubscriptionId};
pub use store::{open_store, FlowSpaceStore, MemoryStore, SqliteStore, StoreError};
