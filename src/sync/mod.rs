//! Durable write queue.
//!
//! Writes are queued locally and delivered to the remote store in order,
//! with bounded retries and abandonment notifications.

mod executor;
mod http;
mod item;
mod queue;
mod worker;

pub use executor::{actions, ActionRegistry, RemoteOperation};
pub use http::{HttpMethod, HttpRemoteStore, Route};
pub use item::{DrainReport, ItemOutcome, ItemState, QueueItem, QueueStatus, SyncEvent};
pub use queue::{SyncOptions, SyncQueue, SyncQueueBuilder};
pub use worker::BackgroundSync;
