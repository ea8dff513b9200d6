//! Long-poll change detection for a key prefix.
//!
//! ## Key Responsibilities
//! - Issues blocking `list` calls against a [`KvStore`], always passing the
//!   latest observed change index
//! - Emits one [`Snapshot`] per observed index change, never for a long-poll
//!   that timed out without change
//! - Surfaces store failures as errors and backs off before the next attempt
//! - Abandons an in-flight call as soon as its cancellation token fires
//!
//! ```text
//!            ┌───────────── unchanged index ─────────────┐
//!            ▼                                           │
//!   list(prefix, last_index) ──ok──► index changed? ──no─┘
//!            │                            │yes
//!           err                           ▼
//!            │                     emit Snapshot
//!            ▼
//!   emit error, sleep backoff(n)
//! ```

#[cfg(test)]
mod watcher_test;

use std::time::Duration;

use futures::Stream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::BackoffPolicy;
use crate::KvEntry;
use crate::KvStore;
use crate::Result;

/// Raw state of the watched subtree at one change index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    /// Entries ordered by key, exactly as returned by the store
    pub entries: Vec<KvEntry>,
}

/// Drives the blocking list loop for a single prefix
///
/// The watcher owns its store handle and change index; nothing is shared
/// with other watchers.
pub struct Watcher<S> {
    store: S,
    prefix: String,
    backoff: BackoffPolicy,
    cancel: CancellationToken,

    /// Index passed to the next blocking call; 0 until the first response
    last_index: u64,
    observed: bool,
    /// Consecutive failed calls, drives the backoff delay
    failures: u32,
    /// Sleep before the next call; set when a call fails
    retry_delay: Duration,
}

impl<S> std::fmt::Debug for Watcher<S> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("prefix", &self.prefix)
            .field("last_index", &self.last_index)
            .field("failures", &self.failures)
            .finish()
    }
}

impl<S> Watcher<S>
where
    S: KvStore,
{
    pub fn new(
        store: S,
        prefix: impl Into<String>,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            backoff,
            cancel,
            last_index: 0,
            observed: false,
            failures: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Index of the last emitted snapshot (0 before the first one)
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Waits for the next change under the prefix.
    ///
    /// Returns `Some(Ok(snapshot))` on a change, `Some(Err(_))` once per
    /// failed store call, and `None` once the watcher has been cancelled.
    /// After an error the following call first sleeps for the backoff delay;
    /// a response without a change is followed by the base delay before the
    /// next call.
    pub async fn next(&mut self) -> Option<Result<Snapshot>> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }

            if self.failures > 0 {
                debug!(prefix = %self.prefix, failures = self.failures, delay = ?self.retry_delay, "backing off before retry");
                if !self.pause(self.retry_delay).await {
                    return None;
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(prefix = %self.prefix, "watch cancelled, abandoning in-flight list");
                    return None;
                }
                r = self.store.list(&self.prefix, self.last_index) => r,
            };

            match result {
                Ok(response) => {
                    self.failures = 0;

                    // Index 0 would turn the next blocking call into an
                    // immediate one; treat it as 1 like Consul clients do.
                    let index = response.index.max(1);

                    if self.observed && index <= self.last_index {
                        if index < self.last_index {
                            warn!(
                                prefix = %self.prefix,
                                index,
                                last_index = self.last_index,
                                "store index went backwards; ignoring response"
                            );
                        } else {
                            trace!(prefix = %self.prefix, index, "long-poll returned without change");
                        }
                        // Rate-limits stores that answer without blocking.
                        if !self.pause(self.backoff.delay(1)).await {
                            return None;
                        }
                        continue;
                    }

                    self.observed = true;
                    self.last_index = index;
                    debug!(prefix = %self.prefix, index, entries = response.entries.len(), "change detected");

                    return Some(Ok(Snapshot {
                        index,
                        entries: response.entries,
                    }));
                }
                Err(e) => {
                    self.failures = self.failures.saturating_add(1);
                    self.retry_delay = self.backoff.delay(self.failures);
                    warn!(
                        prefix = %self.prefix,
                        attempt = self.failures,
                        next_delay = ?self.retry_delay,
                        "store list failed: {}",
                        e
                    );
                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Sleeps for `delay`; `false` if cancelled first.
    async fn pause(
        &self,
        delay: Duration,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// Lazy, unbounded stream of snapshots and errors; ends on cancellation.
    pub fn into_stream(self) -> impl Stream<Item = Result<Snapshot>> {
        futures::stream::unfold(self, |mut watcher| async move {
            watcher.next().await.map(|item| (item, watcher))
        })
    }
}
