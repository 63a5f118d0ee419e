//! Distributed map capability consumed by the replication core.
//!
//! The store itself (replication, partitioning, failover) is an external
//! collaborator. This module defines the boundary traits, the
//! [`StoreHandle`] that turns every call into a tagged `Result`, and an
//! in-process implementation used by tests and the simulator binary.

use crate::connection::config::StoreConfig;
use crate::core::{Result, SessionError};
use crate::operations::{
    OperationResult, SessionOperation, SessionState, WireRecord, decode_record, decode_state,
    encode_operation, encode_state,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Level, event};

// Store support is split by responsibility for easier navigation.
include!("store/capability.rs");
include!("store/handle.rs");
include!("store/in_memory.rs");
