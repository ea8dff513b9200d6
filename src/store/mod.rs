//! Store abstraction consumed by the watcher.
//!
//! The watcher only needs one operation: a blocking recursive list of a key
//! prefix that returns once the prefix changes past a known index or the
//! store's own long-poll timeout elapses.
//!
//! Implementations:
//! - [`MemoryStore`]: in-process store with blocking-query semantics
//! - [`ConsulStore`]: Consul KV over HTTP (feature `consul`)

mod memory;
pub use memory::*;

#[cfg(feature = "consul")]
mod consul;
#[cfg(feature = "consul")]
pub use consul::*;



use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::StoreError;

/// One leaf or directory marker returned by a recursive list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Full hierarchical key, `/`-delimited
    pub key: String,
    /// Raw value; empty for directory markers
    pub value: Vec<u8>,
    pub is_dir: bool,
}

impl KvEntry {
    pub fn leaf(
        key: impl Into<String>,
        value: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.as_ref().to_vec(),
            is_dir: false,
        }
    }

    pub fn dir(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            is_dir: true,
        }
    }
}

/// Result of a blocking list call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResponse {
    /// Entries under the prefix, ordered by key
    pub entries: Vec<KvEntry>,
    /// Change index of the listed subtree
    pub index: u64,
}

/// Read side of a hierarchical key-value store supporting blocking queries
///
/// # Cancellation
/// Callers cancel an in-flight `list` by dropping its future. Implementations
/// must not leave shared state half-updated across an `.await`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Lists every entry under `prefix`.
    ///
    /// With `wait_index == 0` the call returns immediately. Otherwise it blocks
    /// until the subtree's index moves past `wait_index` or the store's wait
    /// time elapses, whichever comes first. A timed-out call returns the
    /// current (unchanged) index.
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError>;
}

#[async_trait]
impl<S> KvStore for std::sync::Arc<S>
where
    S: KvStore + ?Sized,
{
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError> {
        (**self).list(prefix, wait_index).await
    }
}
