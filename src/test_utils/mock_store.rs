use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::KvStore;
use crate::ListResponse;
use crate::StoreError;

/// Store that replays a fixed script of responses, then blocks forever
/// (like a long-poll on a subtree that never changes again).
#[derive(Default)]
pub(crate) struct ScriptedStore {
    script: Mutex<VecDeque<std::result::Result<ListResponse, StoreError>>>,
    calls: Mutex<Vec<(String, u64)>>,
}

impl ScriptedStore {
    pub(crate) fn new(script: Vec<std::result::Result<ListResponse, StoreError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(prefix, wait_index)` of every call made so far
    pub(crate) fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl KvStore for ScriptedStore {
    async fn list(
        &self,
        prefix: &str,
        wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError> {
        self.calls.lock().push((prefix.to_string(), wait_index));
        let next = self.script.lock().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Store whose `list` never completes; counts started and abandoned calls.
#[derive(Default, Clone)]
pub(crate) struct StallingStore {
    pub(crate) started: Arc<AtomicUsize>,
    pub(crate) abandoned: Arc<AtomicUsize>,
}

struct AbandonGuard(Arc<AtomicUsize>);

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for StallingStore {
    async fn list(
        &self,
        _prefix: &str,
        _wait_index: u64,
    ) -> std::result::Result<ListResponse, StoreError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _guard = AbandonGuard(self.abandoned.clone());
        std::future::pending().await
    }
}
