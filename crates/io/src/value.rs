//! The self-describing map format.
//!
//! Wire traffic is built from [`WireValue`]s: scalars, lists, and maps
//! keyed by small numeric field ids. The encoding is kind-tagged so a
//! reader can walk a value without any schema.

use std::collections::BTreeMap;

use crate::error::{IoError, IoResult};
use crate::reader::MemoryReader;
use crate::writer::BinaryWriter;

const KIND_U64: u8 = 0;
const KIND_F64: u8 = 1;
const KIND_BOOL: u8 = 2;
const KIND_STR: u8 = 3;
const KIND_BYTES: u8 = 4;
const KIND_MAP: u8 = 5;
const KIND_LIST: u8 = 6;

/// A single self-describing value.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    U64(u64),
    F64(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Map(WireMap),
    List(Vec<WireValue>),
}

impl WireValue {
    /// A short name for the value's kind, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireValue::U64(_) => "u64",
            WireValue::F64(_) => "f64",
            WireValue::Bool(_) => "bool",
            WireValue::Str(_) => "string",
            WireValue::Bytes(_) => "bytes",
            WireValue::Map(_) => "map",
            WireValue::List(_) => "list",
        }
    }

    /// Encode this value onto a writer.
    pub fn encode(&self, writer: &mut BinaryWriter) {
        match self {
            WireValue::U64(v) => {
                writer.write_u8(KIND_U64);
                writer.write_var_u64(*v);
            }
            WireValue::F64(v) => {
                writer.write_u8(KIND_F64);
                writer.write_f64(*v);
            }
            WireValue::Bool(v) => {
                writer.write_u8(KIND_BOOL);
                writer.write_bool(*v);
            }
            WireValue::Str(v) => {
                writer.write_u8(KIND_STR);
                writer.write_str(v);
            }
            WireValue::Bytes(v) => {
                writer.write_u8(KIND_BYTES);
                writer.write_bytes(v);
            }
            WireValue::Map(map) => {
                writer.write_u8(KIND_MAP);
                map.encode_body(writer);
            }
            WireValue::List(items) => {
                writer.write_u8(KIND_LIST);
                writer.write_var_u64(items.len() as u64);
                for item in items {
                    item.encode(writer);
                }
            }
        }
    }

    /// Decode one value from a reader.
    pub fn decode(reader: &mut MemoryReader<'_>) -> IoResult<WireValue> {
        let offset = reader.position();
        let kind = reader.read_u8()?;
        match kind {
            KIND_U64 => Ok(WireValue::U64(reader.read_var_u64()?)),
            KIND_F64 => Ok(WireValue::F64(reader.read_f64()?)),
            KIND_BOOL => Ok(WireValue::Bool(reader.read_bool()?)),
            KIND_STR => Ok(WireValue::Str(reader.read_str()?)),
            KIND_BYTES => Ok(WireValue::Bytes(reader.read_bytes()?)),
            KIND_MAP => Ok(WireValue::Map(WireMap::decode_body(reader)?)),
            KIND_LIST => {
                let count = reader.read_var_u64()? as usize;
                if count > reader.remaining() {
                    return Err(IoError::LengthOverrun {
                        declared: count,
                        remaining: reader.remaining(),
                    });
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(WireValue::decode(reader)?);
                }
                Ok(WireValue::List(items))
            }
            other => Err(IoError::InvalidKind {
                kind: other,
                offset,
            }),
        }
    }
}

/// A map of numeric field ids to values; the building block of every
/// reduced object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMap {
    entries: BTreeMap<u8, WireValue>,
}

impl WireMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, field: u8) -> bool {
        self.entries.contains_key(&field)
    }

    // --- setters ---

    pub fn set(&mut self, field: u8, value: WireValue) -> &mut Self {
        self.entries.insert(field, value);
        self
    }

    pub fn set_u64(&mut self, field: u8, value: u64) -> &mut Self {
        self.set(field, WireValue::U64(value))
    }

    pub fn set_f64(&mut self, field: u8, value: f64) -> &mut Self {
        self.set(field, WireValue::F64(value))
    }

    pub fn set_bool(&mut self, field: u8, value: bool) -> &mut Self {
        self.set(field, WireValue::Bool(value))
    }

    pub fn set_str(&mut self, field: u8, value: impl Into<String>) -> &mut Self {
        self.set(field, WireValue::Str(value.into()))
    }

    pub fn set_map(&mut self, field: u8, value: WireMap) -> &mut Self {
        self.set(field, WireValue::Map(value))
    }

    pub fn set_list(&mut self, field: u8, value: Vec<WireValue>) -> &mut Self {
        self.set(field, WireValue::List(value))
    }

    // --- getters ---

    pub fn get(&self, field: u8) -> Option<&WireValue> {
        self.entries.get(&field)
    }

    fn require(&self, field: u8) -> IoResult<&WireValue> {
        self.get(field).ok_or(IoError::MissingField { field })
    }

    pub fn get_u64(&self, field: u8) -> IoResult<u64> {
        match self.require(field)? {
            WireValue::U64(v) => Ok(*v),
            other => Err(wrong_kind(field, "u64", other)),
        }
    }

    pub fn get_f64(&self, field: u8) -> IoResult<f64> {
        match self.require(field)? {
            WireValue::F64(v) => Ok(*v),
            other => Err(wrong_kind(field, "f64", other)),
        }
    }

    pub fn get_bool(&self, field: u8) -> IoResult<bool> {
        match self.require(field)? {
            WireValue::Bool(v) => Ok(*v),
            other => Err(wrong_kind(field, "bool", other)),
        }
    }

    pub fn get_str(&self, field: u8) -> IoResult<&str> {
        match self.require(field)? {
            WireValue::Str(v) => Ok(v),
            other => Err(wrong_kind(field, "string", other)),
        }
    }

    pub fn get_map(&self, field: u8) -> IoResult<&WireMap> {
        match self.require(field)? {
            WireValue::Map(v) => Ok(v),
            other => Err(wrong_kind(field, "map", other)),
        }
    }

    pub fn get_list(&self, field: u8) -> IoResult<&[WireValue]> {
        match self.require(field)? {
            WireValue::List(v) => Ok(v),
            other => Err(wrong_kind(field, "list", other)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &WireValue)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    // --- encoding ---

    fn encode_body(&self, writer: &mut BinaryWriter) {
        writer.write_var_u64(self.entries.len() as u64);
        for (field, value) in &self.entries {
            writer.write_u8(*field);
            value.encode(writer);
        }
    }

    fn decode_body(reader: &mut MemoryReader<'_>) -> IoResult<WireMap> {
        let count = reader.read_var_u64()? as usize;
        if count > reader.remaining() {
            return Err(IoError::LengthOverrun {
                declared: count,
                remaining: reader.remaining(),
            });
        }
        let mut map = WireMap::new();
        for _ in 0..count {
            let field = reader.read_u8()?;
            map.set(field, WireValue::decode(reader)?);
        }
        Ok(map)
    }

    /// Encode this map to a standalone byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BinaryWriter::new();
        WireValue::Map(self.clone()).encode(&mut writer);
        writer.into_bytes()
    }

    /// Decode a standalone map produced by [`WireMap::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> IoResult<WireMap> {
        let mut reader = MemoryReader::new(bytes);
        match WireValue::decode(&mut reader)? {
            WireValue::Map(map) => Ok(map),
            other => Err(wrong_kind(0, "map", &other)),
        }
    }
}

fn wrong_kind(field: u8, expected: &'static str, actual: &WireValue) -> IoError {
    IoError::WrongFieldKind {
        field,
        expected,
        actual: actual.kind_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn map_round_trip() {
        let mut inner = WireMap::new();
        inner.set_str(1, "nested");

        let mut map = WireMap::new();
        map.set_u64(0, 42)
            .set_f64(1, 2.5)
            .set_bool(2, true)
            .set_str(3, "hello")
            .set_map(4, inner)
            .set_list(5, vec![WireValue::U64(1), WireValue::Str("x".into())]);

        let bytes = map.to_bytes();
        let decoded = WireMap::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn typed_getters_check_kinds() {
        let mut map = WireMap::new();
        map.set_u64(7, 9);
        assert_eq!(map.get_u64(7).unwrap(), 9);
        assert!(matches!(
            map.get_str(7),
            Err(IoError::WrongFieldKind { field: 7, .. })
        ));
        assert!(matches!(map.get_u64(8), Err(IoError::MissingField { field: 8 })));
    }

    #[test]
    fn truncated_input_fails_cleanly() {
        let mut map = WireMap::new();
        map.set_str(0, "some content here");
        let bytes = map.to_bytes();
        for cut in 1..bytes.len() {
            assert!(WireMap::from_bytes(&bytes[..cut]).is_err());
        }
    }

    proptest! {
        #[test]
        fn scalar_maps_round_trip(
            ints in proptest::collection::btree_map(0u8..40, any::<u64>(), 0..8),
            flag in any::<bool>(),
            text in ".*",
        ) {
            let mut map = WireMap::new();
            for (k, v) in &ints {
                map.set_u64(*k, *v);
            }
            map.set_bool(40, flag);
            map.set_str(41, text.clone());

            let decoded = WireMap::from_bytes(&map.to_bytes()).unwrap();
            prop_assert_eq!(decoded, map);
        }
    }
}
