//! Offline-first synchronization layer for catalog clients.
//!
//! - [`store`]: durable key-value storage (SQLite or in-memory)
//! - [`connectivity`]: reachability tracking with edge-triggered callbacks
//! - [`cache`]: TTL cache with self-healing reads and a read-through layer
//! - [`queue`]: persisted FIFO queue of writes made while offline
//! - [`sync`]: single-flight replay of that queue when connectivity returns
//! - [`offline`]: [`OfflineClient`], the surface the rest of the app uses

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod offline;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;

pub use error::{Result, SyncError};
pub use offline::{OfflineClient, OfflineClientBuilder, SyncStatus, WriteOutcome};
