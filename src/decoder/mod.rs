//! Structural decoding of a key/value subtree into a typed record.
//!
//! Destination types implement [`serde::Deserialize`]. Each struct field maps
//! to the store key formed by joining the parent path and the field name with
//! `/`; `#[serde(rename = "...")]` overrides the key segment and takes the
//! place of a per-field store tag, so there is no separate tag name to
//! configure. `#[serde(alias = "...")]` adds fallback key segments. Nested
//! structs recurse into their own sub-namespace.
//!
//! ```text
//! prefix "test/"
//!   test/addr        = "foo"      ─► Config { addr: "foo",
//!   test/child/data  = "bar"      ─►          child: Child { data: "bar" } }
//! ```
//!
//! Decoding rules:
//! - keys are matched exactly first, then ignoring ASCII case
//! - a field without a matching key keeps its zero value (`""`, `0`, `false`,
//!   `None`, nested zero struct)
//! - scalars are parsed from the trimmed UTF-8 text of the value
//! - sequences, maps and tuples are rejected with [`DecodeError::Unsupported`]
//! - the first error aborts the decode

mod de;
mod tree;

pub use tree::KeyTree;


use serde::de::DeserializeOwned;
use tracing::trace;

use crate::ConfigurationError;
use crate::DecodeError;
use crate::KvEntry;
use crate::Snapshot;

/// Decodes snapshots of one prefix into destination records
#[derive(Debug, Clone)]
pub struct TreeDecoder {
    prefix: String,
}

impl TreeDecoder {
    /// Fails fast on an empty prefix, before anything touches the store.
    pub fn new(prefix: impl Into<String>) -> std::result::Result<Self, ConfigurationError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Builds a fresh `T` from `snapshot`. The snapshot is left untouched.
    pub fn decode<T>(
        &self,
        snapshot: &Snapshot,
    ) -> std::result::Result<T, DecodeError>
    where
        T: DeserializeOwned,
    {
        trace!(prefix = %self.prefix, index = snapshot.index, "decoding snapshot");
        self.decode_entries(&snapshot.entries)
    }

    pub fn decode_entries<T>(
        &self,
        entries: &[KvEntry],
    ) -> std::result::Result<T, DecodeError>
    where
        T: DeserializeOwned,
    {
        let tree = KeyTree::from_entries(&self.prefix, entries);
        from_tree(&tree)
    }
}

/// Decodes `T` from a tree of relative keys.
pub fn from_tree<T>(tree: &KeyTree) -> std::result::Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    de::deserialize(tree)
}
