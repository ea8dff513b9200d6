use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use super::KvEntry;
use super::KvStore;
use super::ListResponse;
use crate::StoreError;

const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(300);
const DEFAULT_TOMBSTONE_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    modify_index: u64,
}

#[derive(Debug)]
struct MemoryState {
    entries: BTreeMap<String, StoredValue>,
    /// Index at which each deleted key was removed, so that a delete moves
    /// the index of every prefix containing the key.
    tombstones: BTreeMap<String, u64>,
    tombstone_limit: usize,
    /// Highest index of any reaped tombstone. Every prefix index is at least
    /// this, so reaping may move an index forward but never backwards.
    reaped_index: u64,
    last_index: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            tombstone_limit: DEFAULT_TOMBSTONE_LIMIT,
            reaped_index: 0,
            last_index: 0,
        }
    }
}

impl MemoryState {
    /// Drops the oldest tombstones above the limit.
    fn reap_tombstones(&mut self) {
        let excess = self.tombstones.len().saturating_sub(self.tombstone_limit);
        if excess == 0 {
            return;
        }

        let mut oldest: Vec<(u64, String)> = self.tombstones.iter().map(|(k, idx)| (*idx, k.clone())).collect();
        oldest.sort_unstable();
        for (index, key) in oldest.into_iter().take(excess) {
            self.tombstones.remove(&key);
            self.reaped_index = self.reaped_index.max(index);
        }
        debug!(reaped = excess, reaped_index = self.reaped_index, "reaped memory store tombstones");
    }

    fn prefix_index(
        &self,
        prefix: &str,
    ) -> u64 {
        let live = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.modify_index)
            .max()
            .unwrap_or(0);
        let deleted = self
            .tombstones
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, idx)| *idx)
            .max()
            .unwrap_or(0);

        // Consul never reports index 0; a 0 would defeat blocking.
        live.max(deleted).max(self.reaped_index).max(1)
    }

    fn snapshot(
        &self,
        prefix: &str,
    ) -> ListResponse {
        let entries = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| {
                if k.ends_with('/') && v.value.is_empty() {
                    KvEntry::dir(k.clone())
                } else {
                    KvEntry::leaf(k.clone(), &v.value)
                }
            })
            .collect();

        ListResponse {
            entries,
            index: self.prefix_index(prefix),
        }
    }
}

/// In-process key-value store with blocking-query semantics
///
/// Every write bumps a global change counter; a prefix's index is the highest
/// counter value of any write or delete under it. `list` with a non-zero
/// `wait_index` parks until that index moves or the wait time elapses.
///
/// Deletes leave a marker so the prefix index still moves; markers beyond
/// [`with_tombstone_limit`](Self::with_tombstone_limit) are reaped oldest
/// first.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    index_tx: watch::Sender<u64>,
    wait_time: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_wait_time(DEFAULT_WAIT_TIME)
    }

    /// Store whose blocking lists give up after `wait_time`
    pub fn with_wait_time(wait_time: Duration) -> Self {
        let (index_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(MemoryState::default()),
            index_tx,
            wait_time,
        }
    }

    /// Keeps at most `limit` delete markers. Older ones are reaped; watchers
    /// of any prefix may then see one index bump without a data change.
    pub fn with_tombstone_limit(
        mut self,
        limit: usize,
    ) -> Self {
        let state = self.state.get_mut();
        state.tombstone_limit = limit;
        state.reap_tombstones();
        self
    }

    /// Number of delete markers currently retained
    pub fn tombstone_count(&self) -> usize {
        self.state.read().tombstones.len()
    }

    /// Writes `value` under `key`, returning the new change index.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: impl AsRef<[u8]>,
    ) -> u64 {
        let key = key.into();
        let index = {
            let mut state = self.state.write();
            state.last_index += 1;
            let index = state.last_index;
            state.tombstones.remove(&key);
            state.entries.insert(
                key.clone(),
                StoredValue {
                    value: value.as_ref().to_vec(),
                    modify_index: index,
                },
            );
            index
        };
        trace!(%key, index, "memory store put");
        self.index_tx.send_replace(index);
        index
    }

    /// Removes `key`. Returns `false` (and leaves the index alone) if the key
    /// did not exist.
    pub fn delete(
        &self,
        key: &str,
    ) -> bool {
        let index = {
            let mut state = self.state.write();
            if state.entries.remove(key).is_none() {
                return false;
            }
            state.last_index += 1;
            let index = state.last_index;
            state.tombstones.insert(key.to_string(), index);
            state.reap_tombstones();
            index
        };
        trace!(key, index, "memory store delete");
        self.index_tx.send_replace(index);
        true
    }

    /// Removes every key under `prefix`, returning how many were removed.
    pub fn delete_prefix(
        &self,
        prefix: &str,
    ) -> usize {
        let (removed, index) = {
            let mut state = self.state.write();
            let keys: Vec<String> = state
                .entries
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, _)| k.clone())
                .collect();
            if keys.is_empty() {
                return 0;
            }
            state.last_index += 1;
            let index = state.last_index;
            for key in &keys {
                state.entries.remove(key);
                state.tombstones.insert(key.clone(), index);
            }
            state.reap_tombstones();
            (keys.len(), index)
        };
        trace!(prefix, removed, index, "memory store delete_prefix");
        self.index_tx.send_replace(index);
        removed
    }

    /// Current change index of `prefix`
    pub fn index(
        &self,
        prefix: &str,
    ) -> u64 {
        self.state.read().prefix_index(prefix)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError> {
        if wait_index == 0 {
            return Ok(self.state.read().snapshot(prefix));
        }

        let mut index_rx = self.index_tx.subscribe();
        let wait = async {
            loop {
                let current = self.state.read().prefix_index(prefix);
                if current > wait_index {
                    return;
                }
                // Sender lives as long as `self`, so this only fails on
                // teardown; treat it like a timeout.
                if index_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        if timeout(self.wait_time, wait).await.is_err() {
            debug!(prefix, wait_index, "blocking list timed out without change");
        }

        Ok(self.state.read().snapshot(prefix))
    }
}
