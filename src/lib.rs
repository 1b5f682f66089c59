//! Offline-first data layer for the coaching client.
//!
//! - [`connectivity`]: online/offline signal with change notifications
//! - [`store`]: durable key-value storage for snapshots
//! - [`cache`]: TTL cache with request deduplication
//! - [`sync`]: persisted write queue drained against the remote store
//! - [`optimistic`]: local-first mutations with rollback

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod optimistic;
pub mod store;
pub mod sync;

pub use cache::{fingerprint, CoachQuery, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use error::{AbandonReason, FetchError, PersistError, RemoteError};
pub use optimistic::{Mutation, MutationOutcome, Optimistic, OptimisticCoordinator};
pub use store::{MemoryStore, PersistentStore, SqliteStore};
pub use sync::{ActionRegistry, SyncEvent, SyncQueue};
