//! serde `Deserializer` over a [`KeyTree`] node.
//!
//! Structs map to `/`-separated sub-namespaces; scalars are parsed from the
//! raw value at the node's path. Nodes without a value decode to the zero
//! value of the requested type.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::de::DeserializeSeed;
use serde::de::IntoDeserializer;
use serde::de::MapAccess;
use serde::de::Visitor;
use serde::forward_to_deserialize_any;
use serde::Deserializer;

use super::tree::join;
use super::tree::KeyTree;
use crate::DecodeError;

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Decodes `T` from the whole tree.
///
/// serde lists aliases next to primary names in a struct's field list
/// without saying which names belong together. When a field is reached a
/// second time, the name that reached it is remembered as redundant and the
/// decode restarts without it. Each restart drops one name, so this ends.
pub(crate) fn deserialize<T>(tree: &KeyTree) -> DecodeResult<T>
where
    T: DeserializeOwned,
{
    let skipped = RefCell::new(BTreeSet::new());
    loop {
        let known = skipped.borrow().len();
        match T::deserialize(NodeDeserializer::root(tree, &skipped)) {
            Err(DecodeError::DuplicateField { .. }) if skipped.borrow().len() > known => continue,
            result => return result,
        }
    }
}

struct NodeDeserializer<'a> {
    tree: &'a KeyTree,
    /// `parent/name` paths of field names known to be redundant aliases
    skipped: &'a RefCell<BTreeSet<String>>,
    path: String,
}

impl<'a> NodeDeserializer<'a> {
    fn root(
        tree: &'a KeyTree,
        skipped: &'a RefCell<BTreeSet<String>>,
    ) -> Self {
        Self {
            tree,
            skipped,
            path: String::new(),
        }
    }

    fn raw(&self) -> Option<&'a [u8]> {
        self.tree.value(&self.path)
    }

    fn text(&self) -> DecodeResult<Option<&'a str>> {
        match self.raw() {
            Some(raw) => std::str::from_utf8(raw)
                .map(Some)
                .map_err(|_| DecodeError::InvalidUtf8 { key: self.path.clone() }),
            None => Ok(None),
        }
    }

    /// Parses the trimmed value; a missing or blank value yields `None`.
    fn parse<T: FromStr>(
        &self,
        expected: &'static str,
    ) -> DecodeResult<Option<T>> {
        let Some(text) = self.text()? else {
            return Ok(None);
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse::<T>().map(Some).map_err(|_| DecodeError::InvalidValue {
            key: self.path.clone(),
            value: text.to_string(),
            expected,
        })
    }

    fn parse_bool(&self) -> DecodeResult<bool> {
        let Some(text) = self.text()? else {
            return Ok(false);
        };
        match text.trim() {
            "" | "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
            "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
            _ => Err(DecodeError::InvalidValue {
                key: self.path.clone(),
                value: text.to_string(),
                expected: "bool",
            }),
        }
    }

    fn unsupported(
        &self,
        kind: &'static str,
    ) -> DecodeError {
        DecodeError::Unsupported {
            key: self.path.clone(),
            kind,
        }
    }
}

macro_rules! deserialize_number {
    ($($method:ident => $visit:ident : $ty:ty,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> DecodeResult<V::Value>
            where
                V: Visitor<'de>,
            {
                let value = self.parse::<$ty>(stringify!($ty))?.unwrap_or_default();
                visitor.$visit(value)
            }
        )*
    };
}

impl<'de, 'a> Deserializer<'de> for NodeDeserializer<'a> {
    type Error = DecodeError;

    fn deserialize_any<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        if let Some(text) = self.text()? {
            return visitor.visit_string(text.to_string());
        }
        if self.tree.has_children(&self.path) {
            return Err(self.unsupported("map"));
        }
        visitor.visit_unit()
    }

    fn deserialize_bool<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_bool(self.parse_bool()?)
    }

    deserialize_number! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_i128 => visit_i128: i128,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_u128 => visit_u128: u128,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
    }

    fn deserialize_char<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let value = self.parse::<char>("char")?.unwrap_or('\0');
        visitor.visit_char(value)
    }

    fn deserialize_str<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let value = self.text()?.unwrap_or_default();
        visitor.visit_string(value.to_string())
    }

    fn deserialize_bytes<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let value = self.raw().map(<[u8]>::to_vec).unwrap_or_default();
        visitor.visit_byte_buf(value)
    }

    fn deserialize_option<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        if self.tree.contains(&self.path) {
            visitor.visit_some(self)
        } else {
            visitor.visit_none()
        }
    }

    fn deserialize_unit<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(
        self,
        _visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.unsupported("sequence"))
    }

    fn deserialize_tuple<V>(
        self,
        _len: usize,
        _visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.unsupported("tuple"))
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        _visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.unsupported("tuple struct"))
    }

    fn deserialize_map<V>(
        self,
        _visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        Err(self.unsupported("map"))
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        let skipped = self.skipped.borrow();
        let mut names: Vec<&'static str> = fields
            .iter()
            .copied()
            .filter(|name| !skipped.contains(&join(&self.path, name)))
            .collect();
        drop(skipped);
        // Names backed by data come first so that an alias holding the value
        // wins over an absent primary name.
        names.sort_by_key(|name| !self.tree.contains(&self.tree.resolve_child(&self.path, name)));

        let mut access = StructAccess {
            tree: self.tree,
            skipped: self.skipped,
            parent: self.path,
            fields: names.into_iter(),
            current: None,
            pending: None,
        };
        match visitor.visit_map(&mut access) {
            // Raised right after a key was handed out, before its value was
            // requested: that name is another spelling of a decoded field.
            Err(err @ DecodeError::DuplicateField { .. }) if access.pending.is_some() => {
                if let Some(name) = access.current {
                    self.skipped.borrow_mut().insert(join(&access.parent, name));
                }
                Err(err)
            }
            result => result,
        }
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.text()? {
            Some(text) if !text.trim().is_empty() => {
                let variant: serde::de::value::StringDeserializer<DecodeError> =
                    text.trim().to_string().into_deserializer();
                visitor.visit_enum(variant).map_err(|e| e.at_key(&self.path))
            }
            _ => Err(DecodeError::InvalidValue {
                key: self.path.clone(),
                value: String::new(),
                expected: "enum variant",
            }),
        }
    }

    fn deserialize_identifier<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

/// Feeds every declared field of a struct to its visitor, each backed by the
/// node at `parent/<resolved field key>`.
struct StructAccess<'a> {
    tree: &'a KeyTree,
    skipped: &'a RefCell<BTreeSet<String>>,
    parent: String,
    fields: std::vec::IntoIter<&'static str>,
    /// Name handed out by the last `next_key_seed`
    current: Option<&'static str>,
    /// Resolved path whose value has not been requested yet
    pending: Option<String>,
}

impl<'de, 'a> MapAccess<'de> for StructAccess<'a> {
    type Error = DecodeError;

    fn next_key_seed<K>(
        &mut self,
        seed: K,
    ) -> DecodeResult<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        let Some(field) = self.fields.next() else {
            return Ok(None);
        };
        self.current = Some(field);
        self.pending = Some(self.tree.resolve_child(&self.parent, field));
        seed.deserialize(FieldName(field)).map(Some)
    }

    fn next_value_seed<V>(
        &mut self,
        seed: V,
    ) -> DecodeResult<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        let path = self
            .pending
            .take()
            .ok_or_else(|| DecodeError::Custom("value requested before key".into()))?;
        seed.deserialize(NodeDeserializer {
            tree: self.tree,
            skipped: self.skipped,
            path: path.clone(),
        })
        .map_err(|e| e.at_key(&path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.fields.len())
    }
}

/// Struct field identifier handed to serde's generated field visitor
struct FieldName(&'static str);

impl<'de> Deserializer<'de> for FieldName {
    type Error = DecodeError;

    fn deserialize_any<V>(
        self,
        visitor: V,
    ) -> DecodeResult<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_str(self.0)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}
