//! Orchestration API access and the model sync loop.

pub mod client;
pub mod sync;

pub use client::{ApiClient, ListPage, ListQuery, ResourceLister};
pub use sync::{fetch_all, SnapshotReceiver, SyncEngine, SyncOutcome};
