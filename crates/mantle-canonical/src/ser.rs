// SPDX-License-Identifier: MIT OR Apache-2.0
//! Path-tracking canonical serializer.
//!
//! Builds an intermediate tree with sorted object keys, rejecting values the
//! canonical form cannot represent. Paths use `$`-rooted dot/bracket form.

use crate::CanonicalJsonError;
use serde::ser::{self, Serialize};
use std::collections::BTreeMap;

impl ser::Error for CanonicalJsonError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        CanonicalJsonError::UnsupportedType {
            path: "$".into(),
            kind: msg.to_string(),
        }
    }
}

/// Canonical intermediate tree. Object keys sort lexicographically via
/// `BTreeMap`, which matches byte-wise UTF-8 ordering.
pub(crate) enum Node {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Array(Vec<Node>),
    Object(BTreeMap<String, Node>),
}

impl Node {
    pub(crate) fn write(&self, out: &mut String) {
        match self {
            Node::Null => out.push_str("null"),
            Node::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Node::Int(i) => out.push_str(&i.to_string()),
            Node::UInt(u) => out.push_str(&u.to_string()),
            Node::Float(f) => {
                // serde_json's ryu formatting keeps the float marker ("1.0").
                let n = serde_json::Number::from_f64(*f)
                    .unwrap_or_else(|| serde_json::Number::from(0));
                out.push_str(&n.to_string());
            }
            Node::Str(s) => {
                // serde_json escapes control characters and quotes but leaves
                // non-ASCII text raw, which is exactly the canonical rule.
                out.push_str(&serde_json::to_string(s).unwrap_or_default());
            }
            Node::Array(items) => {
                out.push('[');
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    item.write(out);
                }
                out.push(']');
            }
            Node::Object(entries) => {
                out.push('{');
                for (idx, (key, value)) in entries.iter().enumerate() {
                    if idx > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    value.write(out);
                }
                out.push('}');
            }
        }
    }
}

pub(crate) struct CanonicalSerializer {
    path: String,
}

impl CanonicalSerializer {
    pub(crate) fn root() -> Self {
        Self { path: "$".into() }
    }

    fn at(path: String) -> Self {
        Self { path }
    }

    fn unsupported(&self, kind: &str) -> CanonicalJsonError {
        CanonicalJsonError::UnsupportedType {
            path: self.path.clone(),
            kind: kind.into(),
        }
    }

    fn float(&self, value: f64) -> Result<Node, CanonicalJsonError> {
        if value.is_finite() {
            Ok(Node::Float(value))
        } else {
            Err(CanonicalJsonError::NonFiniteNumber {
                path: self.path.clone(),
            })
        }
    }
}

impl ser::Serializer for CanonicalSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;
    type SerializeSeq = SeqSerializer;
    type SerializeTuple = SeqSerializer;
    type SerializeTupleStruct = SeqSerializer;
    type SerializeTupleVariant = VariantSeqSerializer;
    type SerializeMap = MapSerializer;
    type SerializeStruct = MapSerializer;
    type SerializeStructVariant = VariantMapSerializer;

    fn serialize_bool(self, v: bool) -> Result<Node, Self::Error> {
        Ok(Node::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Node, Self::Error> {
        Ok(Node::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<Node, Self::Error> {
        Ok(Node::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<Node, Self::Error> {
        Ok(Node::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<Node, Self::Error> {
        Ok(Node::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Node, Self::Error> {
        i64::try_from(v)
            .map(Node::Int)
            .map_err(|_| self.unsupported("i128"))
    }

    fn serialize_u8(self, v: u8) -> Result<Node, Self::Error> {
        Ok(Node::UInt(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<Node, Self::Error> {
        Ok(Node::UInt(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<Node, Self::Error> {
        Ok(Node::UInt(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<Node, Self::Error> {
        Ok(Node::UInt(v))
    }

    fn serialize_u128(self, v: u128) -> Result<Node, Self::Error> {
        u64::try_from(v)
            .map(Node::UInt)
            .map_err(|_| self.unsupported("u128"))
    }

    fn serialize_f32(self, v: f32) -> Result<Node, Self::Error> {
        self.float(v.into())
    }

    fn serialize_f64(self, v: f64) -> Result<Node, Self::Error> {
        self.float(v)
    }

    fn serialize_char(self, v: char) -> Result<Node, Self::Error> {
        Ok(Node::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Node, Self::Error> {
        Ok(Node::Str(v.to_string()))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<Node, Self::Error> {
        Err(self.unsupported("bytes"))
    }

    fn serialize_none(self) -> Result<Node, Self::Error> {
        Ok(Node::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Node, Self::Error> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Node, Self::Error> {
        Ok(Node::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Node, Self::Error> {
        Ok(Node::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Node, Self::Error> {
        Ok(Node::Str(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Node, Self::Error> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Node, Self::Error> {
        let child = format!("{}.{variant}", self.path);
        let inner = value.serialize(CanonicalSerializer::at(child))?;
        let mut entries = BTreeMap::new();
        entries.insert(variant.to_string(), inner);
        Ok(Node::Object(entries))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq, Self::Error> {
        Ok(SeqSerializer {
            path: self.path,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct, Self::Error> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant, Self::Error> {
        Ok(VariantSeqSerializer {
            variant,
            inner: SeqSerializer {
                path: format!("{}.{variant}", self.path),
                items: Vec::with_capacity(len),
            },
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Self::Error> {
        Ok(MapSerializer {
            path: self.path,
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Self::Error> {
        self.serialize_map(None)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Self::Error> {
        Ok(VariantMapSerializer {
            variant,
            inner: MapSerializer {
                path: format!("{}.{variant}", self.path),
                entries: BTreeMap::new(),
                pending_key: None,
            },
        })
    }
}

pub(crate) struct SeqSerializer {
    path: String,
    items: Vec<Node>,
}

impl ser::SerializeSeq for SeqSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        let child = format!("{}[{}]", self.path, self.items.len());
        self.items.push(value.serialize(CanonicalSerializer::at(child))?);
        Ok(())
    }

    fn end(self) -> Result<Node, Self::Error> {
        Ok(Node::Array(self.items))
    }
}

impl ser::SerializeTuple for SeqSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Node, Self::Error> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Node, Self::Error> {
        ser::SerializeSeq::end(self)
    }
}

pub(crate) struct VariantSeqSerializer {
    variant: &'static str,
    inner: SeqSerializer,
}

impl ser::SerializeTupleVariant for VariantSeqSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        ser::SerializeSeq::serialize_element(&mut self.inner, value)
    }

    fn end(self) -> Result<Node, Self::Error> {
        let mut entries = BTreeMap::new();
        entries.insert(self.variant.to_string(), Node::Array(self.inner.items));
        Ok(Node::Object(entries))
    }
}

pub(crate) struct MapSerializer {
    path: String,
    entries: BTreeMap<String, Node>,
    pending_key: Option<String>,
}

impl ser::SerializeMap for MapSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), Self::Error> {
        self.pending_key = Some(key.serialize(KeySerializer {
            path: self.path.clone(),
        })?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), Self::Error> {
        let key = self.pending_key.take().unwrap_or_default();
        let child = format!("{}.{key}", self.path);
        let node = value.serialize(CanonicalSerializer::at(child))?;
        self.entries.insert(key, node);
        Ok(())
    }

    fn end(self) -> Result<Node, Self::Error> {
        Ok(Node::Object(self.entries))
    }
}

impl ser::SerializeStruct for MapSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        let child = format!("{}.{key}", self.path);
        let node = value.serialize(CanonicalSerializer::at(child))?;
        self.entries.insert(key.to_string(), node);
        Ok(())
    }

    fn end(self) -> Result<Node, Self::Error> {
        Ok(Node::Object(self.entries))
    }
}

pub(crate) struct VariantMapSerializer {
    variant: &'static str,
    inner: MapSerializer,
}

impl ser::SerializeStructVariant for VariantMapSerializer {
    type Ok = Node;
    type Error = CanonicalJsonError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), Self::Error> {
        ser::SerializeStruct::serialize_field(&mut self.inner, key, value)
    }

    fn end(self) -> Result<Node, Self::Error> {
        let mut entries = BTreeMap::new();
        entries.insert(self.variant.to_string(), Node::Object(self.inner.entries));
        Ok(Node::Object(entries))
    }
}

/// Key serializer: only strings (and chars) are acceptable object keys.
struct KeySerializer {
    path: String,
}

impl KeySerializer {
    fn reject(&self) -> CanonicalJsonError {
        CanonicalJsonError::NonStringKey {
            path: self.path.clone(),
        }
    }
}

macro_rules! reject_key {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<String, CanonicalJsonError> {
                Err(self.reject())
            }
        )*
    };
}

impl ser::Serializer for KeySerializer {
    type Ok = String;
    type Error = CanonicalJsonError;
    type SerializeSeq = ser::Impossible<String, CanonicalJsonError>;
    type SerializeTuple = ser::Impossible<String, CanonicalJsonError>;
    type SerializeTupleStruct = ser::Impossible<String, CanonicalJsonError>;
    type SerializeTupleVariant = ser::Impossible<String, CanonicalJsonError>;
    type SerializeMap = ser::Impossible<String, CanonicalJsonError>;
    type SerializeStruct = ser::Impossible<String, CanonicalJsonError>;
    type SerializeStructVariant = ser::Impossible<String, CanonicalJsonError>;

    fn serialize_str(self, v: &str) -> Result<String, CanonicalJsonError> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<String, CanonicalJsonError> {
        Ok(v.to_string())
    }

    reject_key! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
        serialize_f32: f32,
        serialize_f64: f64,
        serialize_bytes: &[u8],
    }

    fn serialize_none(self) -> Result<String, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_unit(self) -> Result<String, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String, CanonicalJsonError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, CanonicalJsonError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CanonicalJsonError> {
        Err(self.reject())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CanonicalJsonError> {
        Err(self.reject())
    }
}
