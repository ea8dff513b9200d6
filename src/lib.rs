//! Watches a key prefix of a hierarchical key-value store and decodes the
//! subtree into a typed record every time it changes.
//!
//! ```text
//!   KvStore ──list(prefix, index)──► Watcher ──Snapshot──► TreeDecoder ──T──► consumer
//!                                       │                       │
//!                                       └────── Error ──────────┴────────────► consumer
//! ```
//!
//! [`Pipeline`] ties the pieces together and owns the background task.

mod config;
mod decoder;
mod errors;
mod pipeline;
mod store;
mod watcher;

pub use config::*;
pub use decoder::*;
pub use errors::*;
pub use pipeline::*;
pub use store::*;
pub use watcher::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
