//! Storage for detector state.
//!
//! The traits define the contract for the ephemeral counter store and the
//! durable state store. An in-memory backend is always available; the
//! `persistent` feature adds a write-ahead-logged durable store.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::{InMemoryCounterStore, InMemoryDetectorStateStore, InMemoryStores};
pub use traits::{CounterStore, CounterWrite, DetectorStateRow, DetectorStateStore, StorageError};
