//! Connection management for the session store: configuration, the
//! supervisor owning the live handle, and the queue of deletions waiting for
//! the store to come back.

pub mod config;
pub mod orphans;
pub mod supervisor;

pub use config::{DEFAULT_MAP_NAME, DEFAULT_PROBE_INTERVAL, DEFAULT_RETRY_INTERVAL, StoreConfig};
pub use orphans::{OrphanQueue, OrphanedDeletion};
pub use supervisor::{ConnectionSupervisor, SupervisorStats};
