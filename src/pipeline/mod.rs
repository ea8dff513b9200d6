//! Lifecycle glue between [`Watcher`], [`TreeDecoder`] and the consumer.
//!
//! ## State machine
//! ```text
//!   Created ──start()──► Running ──stop()──► Stopped
//!      │                  │   ▲
//!      │                  └───┘ every detected change
//!      └──start() with invalid config / stop()──► Stopped
//! ```
//!
//! One background task per running pipeline watches the store, decodes each
//! snapshot and delivers exactly one of {value, error} per detected change,
//! in observation order. Delivery awaits channel capacity, so a slow consumer
//! back-pressures the watch loop; `stop()` interrupts a pending delivery as
//! well as a pending store call.
//!
//! ## Example Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use kv_structure::{MemoryStore, Pipeline};
//! use serde::Deserialize;
//! use tokio::sync::mpsc;
//!
//! #[derive(Debug, Deserialize)]
//! struct AppConfig {
//!     addr: String,
//! }
//!
//! # async fn run() -> kv_structure::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let (update_tx, mut update_rx) = mpsc::channel::<AppConfig>(1);
//! let (error_tx, mut error_rx) = mpsc::channel(1);
//!
//! let mut pipeline = Pipeline::builder(store, update_tx)
//!     .prefix("app/")
//!     .errors(error_tx)
//!     .build();
//! pipeline.start()?;
//!
//! tokio::select! {
//!     Some(config) = update_rx.recv() => println!("new config: {:?}", config),
//!     Some(err) = error_rx.recv() => eprintln!("watch error: {}", err),
//! }
//!
//! pipeline.stop().await;
//! # Ok(())
//! # }
//! ```


use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::Error;
use crate::KvStore;
use crate::Result;
use crate::TreeDecoder;
use crate::WatchConfig;
use crate::Watcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Configured, no store calls made yet
    Created,
    /// Background worker is watching the store
    Running,
    /// Terminal; nothing is delivered anymore
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "Created",
            PipelineState::Running => "Running",
            PipelineState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configurable construction of a [`Pipeline`]
///
/// Created through [`Pipeline::builder`].
pub struct PipelineBuilder<T, S> {
    store: S,
    config: WatchConfig,
    value_tx: mpsc::Sender<T>,
    error_tx: Option<mpsc::Sender<Error>>,
}

impl<T, S> PipelineBuilder<T, S>
where
    T: DeserializeOwned + Send + 'static,
    S: KvStore,
{
    /// Watched prefix; overrides the prefix of any config set earlier.
    pub fn prefix(
        mut self,
        prefix: impl Into<String>,
    ) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    /// Replaces the whole watch configuration (prefix, wait time, backoff).
    pub fn config(
        mut self,
        config: WatchConfig,
    ) -> Self {
        self.config = config;
        self
    }

    /// Channel receiving store and decode errors. Without one, errors are
    /// logged and dropped.
    pub fn errors(
        mut self,
        error_tx: mpsc::Sender<Error>,
    ) -> Self {
        self.error_tx = Some(error_tx);
        self
    }

    pub fn build(self) -> Pipeline<T, S> {
        Pipeline {
            store: Some(self.store),
            config: self.config,
            value_tx: Some(self.value_tx),
            error_tx: self.error_tx,
            state: PipelineState::Created,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }
}

/// Watches one prefix and delivers a freshly decoded `T` on every change
///
/// Each pipeline owns its store handle, change index and worker task;
/// nothing is shared between pipelines.
pub struct Pipeline<T, S> {
    store: Option<S>,
    config: WatchConfig,
    value_tx: Option<mpsc::Sender<T>>,
    error_tx: Option<mpsc::Sender<Error>>,
    state: PipelineState,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl<T, S> fmt::Debug for Pipeline<T, S> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("prefix", &self.config.prefix)
            .field("state", &self.state)
            .field("has_error_channel", &self.error_tx.is_some())
            .finish()
    }
}

impl<T, S> Pipeline<T, S>
where
    T: DeserializeOwned + Send + 'static,
    S: KvStore,
{
    /// Starts configuring a pipeline over `store` delivering into `value_tx`.
    ///
    /// A channel capacity of 1 gives the closest thing to a synchronous
    /// handoff: the next change is only decoded once the previous value has
    /// been received.
    pub fn builder(
        store: S,
        value_tx: mpsc::Sender<T>,
    ) -> PipelineBuilder<T, S> {
        PipelineBuilder {
            store,
            config: WatchConfig::default(),
            value_tx,
            error_tx: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Validates the configuration and spawns the watch worker.
    ///
    /// An invalid configuration (empty prefix first of all) is reported once
    /// on the error channel, returned, and leaves the pipeline `Stopped`
    /// without any store call having been made.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Created {
            return Err(Error::InvalidState {
                current: self.state.as_str(),
                expected: PipelineState::Created.as_str(),
            });
        }

        let decoder = match TreeDecoder::new(self.config.prefix.clone()).and_then(|decoder| {
            self.config.validate()?;
            Ok(decoder)
        }) {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!("pipeline configuration rejected: {}", e);
                self.state = PipelineState::Stopped;
                self.report_startup_error(Error::Configuration(e.clone()));
                self.release();
                return Err(e.into());
            }
        };

        let (Some(store), Some(value_tx)) = (self.store.take(), self.value_tx.take()) else {
            return Err(Error::InvalidState {
                current: self.state.as_str(),
                expected: PipelineState::Created.as_str(),
            });
        };

        let watcher = Watcher::new(
            store,
            self.config.prefix.clone(),
            self.config.backoff,
            self.cancel.child_token(),
        );
        let worker = Worker {
            watcher,
            decoder,
            value_tx,
            error_tx: self.error_tx.take(),
            cancel: self.cancel.clone(),
            _marker: PhantomData,
        };

        info!(prefix = %self.config.prefix, "starting watch pipeline");
        self.worker = Some(tokio::spawn(worker.run()));
        self.state = PipelineState::Running;
        Ok(())
    }

    /// Cancels the worker and waits for it to exit.
    ///
    /// Interrupts an in-flight store call, backoff sleep or blocked delivery.
    /// No value or error is delivered once this returns. Idempotent.
    pub async fn stop(&mut self) {
        if self.state == PipelineState::Stopped {
            return;
        }
        debug!(prefix = %self.config.prefix, state = %self.state, "stopping watch pipeline");

        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!(prefix = %self.config.prefix, "watch worker panicked: {:?}", e);
                }
            }
        }
        self.release();
        self.state = PipelineState::Stopped;
    }

    /// Best-effort, non-blocking report of a startup failure. The error is
    /// also returned to the caller of `start`, so a full channel only costs
    /// the duplicate.
    fn report_startup_error(
        &self,
        err: Error,
    ) {
        match &self.error_tx {
            Some(tx) => {
                if let Err(e) = tx.try_send(err) {
                    error!("could not report startup error: {}", e);
                }
            }
            None => error!("pipeline failed to start: {}", err),
        }
    }

    /// Drops channel ends still held, so consumers observe closed channels.
    fn release(&mut self) {
        self.store = None;
        self.value_tx = None;
        self.error_tx = None;
    }
}

impl<T, S> Drop for Pipeline<T, S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Background half of a running pipeline
struct Worker<T, S> {
    watcher: Watcher<S>,
    decoder: TreeDecoder,
    value_tx: mpsc::Sender<T>,
    error_tx: Option<mpsc::Sender<Error>>,
    cancel: CancellationToken,
    _marker: PhantomData<fn() -> T>,
}

impl<T, S> Worker<T, S>
where
    T: DeserializeOwned + Send + 'static,
    S: KvStore,
{
    async fn run(mut self) {
        while let Some(next) = self.watcher.next().await {
            let keep_running = match next {
                Ok(snapshot) => match self.decoder.decode::<T>(&snapshot) {
                    Ok(value) => {
                        debug!(prefix = %self.decoder.prefix(), index = snapshot.index, "delivering decoded value");
                        self.deliver_value(value).await
                    }
                    Err(e) => {
                        warn!(prefix = %self.decoder.prefix(), index = snapshot.index, "decode failed: {}", e);
                        self.deliver_error(e.into()).await
                    }
                },
                Err(e) => self.deliver_error(e).await,
            };

            if !keep_running {
                break;
            }
        }
        debug!(prefix = %self.decoder.prefix(), "watch worker exited");
    }

    async fn deliver_value(
        &self,
        value: T,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.value_tx.send(value) => {
                if sent.is_err() {
                    info!(prefix = %self.decoder.prefix(), "value receiver dropped, stopping watch");
                    return false;
                }
                true
            }
        }
    }

    async fn deliver_error(
        &self,
        err: Error,
    ) -> bool {
        let Some(error_tx) = &self.error_tx else {
            error!(prefix = %self.decoder.prefix(), "dropping error without consumer: {}", err);
            return !self.cancel.is_cancelled();
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = error_tx.send(err) => {
                if let Err(mpsc::error::SendError(err)) = sent {
                    error!(prefix = %self.decoder.prefix(), "error receiver dropped: {}", err);
                }
                true
            }
        }
    }
}
