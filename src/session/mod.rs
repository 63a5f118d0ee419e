//! Process-local session handling: the per-session attribute cache in its
//! write-through and deferred-write modes, and the manager that ties handles
//! to requests.

pub mod clustered;
pub mod config;
pub mod entry;
pub mod manager;

pub use clustered::ClusteredSession;
pub use config::{SessionConfig, parse_transient_attributes};
pub use entry::{EntrySnapshot, LocalCacheEntry};
pub use manager::SessionManager;
