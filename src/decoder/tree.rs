use std::collections::BTreeMap;
use std::ops::Bound;

use crate::KvEntry;

pub(crate) const SEPARATOR: char = '/';

/// Flat view of a subtree keyed by path relative to the watched prefix
///
/// `test/child/data` under prefix `test/` is stored as `child/data`. The
/// input entries are never mutated, so the same snapshot can be decoded
/// into several shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyTree {
    values: BTreeMap<String, Vec<u8>>,
}

impl KeyTree {
    /// Builds the relative-key mapping for `prefix`.
    ///
    /// Directory markers, keys outside the prefix and the prefix key itself
    /// are skipped. A prefix without a trailing `/` only matches whole path
    /// segments: `app` covers `app/port` but not `apple`.
    pub fn from_entries<'a>(
        prefix: &str,
        entries: impl IntoIterator<Item = &'a KvEntry>,
    ) -> Self {
        let mut values = BTreeMap::new();
        for entry in entries {
            if entry.is_dir {
                continue;
            }
            let Some(rest) = entry.key.strip_prefix(prefix) else {
                continue;
            };
            if !prefix.is_empty() && !prefix.ends_with(SEPARATOR) && !rest.starts_with(SEPARATOR) {
                continue;
            }
            let relative = rest.trim_start_matches(SEPARATOR);
            if relative.is_empty() {
                continue;
            }
            values.insert(relative.to_string(), entry.value.clone());
        }
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value stored exactly at `path`
    pub fn value(
        &self,
        path: &str,
    ) -> Option<&[u8]> {
        self.values.get(path).map(Vec::as_slice)
    }

    /// Whether any key lives strictly below `path`
    pub fn has_children(
        &self,
        path: &str,
    ) -> bool {
        if path.is_empty() {
            return !self.values.is_empty();
        }
        self.keys_under(format!("{path}{SEPARATOR}")).next().is_some()
    }

    /// Whether `path` holds a value or has descendants
    pub fn contains(
        &self,
        path: &str,
    ) -> bool {
        self.values.contains_key(path) || self.has_children(path)
    }

    /// Resolves the child `segment` of `parent` to a relative path.
    ///
    /// An exact match wins; otherwise the first sibling segment equal to
    /// `segment` ignoring ASCII case is used. Falls back to the exact path
    /// when nothing matches.
    pub fn resolve_child(
        &self,
        parent: &str,
        segment: &str,
    ) -> String {
        let exact = join(parent, segment);
        if self.contains(&exact) {
            return exact;
        }

        let dir = if parent.is_empty() {
            String::new()
        } else {
            format!("{parent}{SEPARATOR}")
        };
        let skip = dir.len();
        let resolved = self
            .keys_under(dir)
            .filter_map(|key| key[skip..].split(SEPARATOR).next())
            .find(|candidate| candidate.eq_ignore_ascii_case(segment))
            .map(|candidate| join(parent, candidate));
        resolved.unwrap_or(exact)
    }

    fn keys_under(
        &self,
        dir: String,
    ) -> impl Iterator<Item = &String> + '_ {
        self.values
            .range::<String, _>((Bound::Included(dir.clone()), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(dir.as_str()))
    }
}

pub(crate) fn join(
    parent: &str,
    segment: &str,
) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{parent}{SEPARATOR}{segment}")
    }
}
