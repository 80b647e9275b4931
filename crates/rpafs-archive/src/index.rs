//! The archive index: member name to offset/length/prefix.

use std::collections::BTreeMap;

use serde_pickle::{DeOptions, HashableValue, Value};

use crate::decompress;
use crate::{Error, Result};

/// Apply the archive key to a stored index value.
///
/// XOR is an involution, so the same function obfuscates and deobfuscates.
#[inline]
pub const fn deobfuscate(value: i64, key: i64) -> i64 {
    value ^ key
}

/// Location of one member inside the archive.
///
/// Offset and length are stored with the key already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    offset: u64,
    length: u64,
    prefix: Option<Vec<u8>>,
}

impl IndexEntry {
    /// Create an entry from deobfuscated values.
    pub fn new(offset: u64, length: u64, prefix: Option<Vec<u8>>) -> Self {
        Self {
            offset,
            length,
            prefix,
        }
    }

    /// Absolute file offset of the member bytes that follow the prefix.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Member length, prefix included.
    ///
    /// This is the number of bytes [`Archive::read`](crate::Archive::read) returns.
    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Literal bytes stored in the index record, if the record had a third element.
    #[inline]
    pub fn prefix(&self) -> Option<&[u8]> {
        self.prefix.as_deref()
    }

    /// Length of the prefix; 0 without one.
    #[inline]
    pub fn prefix_len(&self) -> u64 {
        self.prefix.as_ref().map_or(0, |p| p.len() as u64)
    }

    /// Number of bytes stored at [`offset`](Self::offset).
    ///
    /// The first [`prefix_len`](Self::prefix_len) bytes of the member live in
    /// the index, so only the rest is stored in the archive body.
    #[inline]
    pub fn stored_length(&self) -> u64 {
        self.length.saturating_sub(self.prefix_len())
    }
}

/// Decoded archive index.
///
/// Read-only once built; names iterate in sorted order.
#[derive(Debug, Clone, Default)]
pub struct IndexTable {
    entries: BTreeMap<String, IndexEntry>,
}

impl IndexTable {
    /// Decompress and decode a raw index payload.
    pub fn decode(payload: &[u8], key: i64) -> Result<Self> {
        let pickled = decompress::inflate_zlib(payload)?;
        Self::from_pickle(&pickled, key)
    }

    /// Decode an uncompressed pickled index.
    ///
    /// The pickle must be a dict mapping member name to a list of records,
    /// where the first record is `(offset, length)` or `(offset, length, prefix)`.
    pub fn from_pickle(data: &[u8], key: i64) -> Result<Self> {
        let value = serde_pickle::value_from_slice(data, DeOptions::new())
            .map_err(|e| Error::corrupt(format!("unpickling failed: {e}")))?;

        let Value::Dict(dict) = value else {
            return Err(Error::corrupt(format!(
                "index is a {}, expected a dict",
                value_kind(&value)
            )));
        };

        let mut entries = BTreeMap::new();
        for (raw_key, record) in dict {
            let name = member_name(raw_key)?;
            let entry = decode_record(&name, record, key)?;
            entries.insert(name, entry);
        }

        Ok(Self { entries })
    }

    /// Build a table from already decoded entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, IndexEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Look up a member by its archive path.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.entries.get(name)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Member names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.keys().map(String::as_str)
    }

    /// Members with their entries, in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexEntry)> + '_ {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn member_name(key: HashableValue) -> Result<String> {
    match key {
        HashableValue::String(name) => Ok(name),
        // Python 2 archives store names as byte strings.
        HashableValue::Bytes(bytes) => String::from_utf8(bytes).map_err(|e| {
            Error::corrupt(format!("member name is not valid UTF-8: {e}"))
        }),
        other => Err(Error::corrupt(format!(
            "member name {other:?} is not a string"
        ))),
    }
}

fn decode_record(name: &str, record: Value, key: i64) -> Result<IndexEntry> {
    let records = match record {
        Value::List(items) => items,
        other => {
            return Err(Error::corrupt_key(
                name,
                format!("value is a {}, expected a list", value_kind(&other)),
            ))
        }
    };

    let first = records
        .into_iter()
        .next()
        .ok_or_else(|| Error::corrupt_key(name, "record list is empty"))?;

    let fields = match first {
        Value::Tuple(fields) => fields,
        other => {
            return Err(Error::corrupt_key(
                name,
                format!("record is a {}, expected a tuple", value_kind(&other)),
            ))
        }
    };

    if fields.len() < 2 {
        return Err(Error::corrupt_key(
            name,
            format!("record has {} elements, expected at least 2", fields.len()),
        ));
    }

    let mut fields = fields.into_iter();
    let offset = decode_int(name, "offset", fields.next(), key)?;
    let length = decode_int(name, "length", fields.next(), key)?;

    let prefix = match fields.next() {
        None => None,
        Some(Value::Bytes(bytes)) => Some(bytes),
        Some(Value::String(text)) => Some(text.into_bytes()),
        Some(other) => {
            return Err(Error::corrupt_key(
                name,
                format!("prefix is a {}, expected bytes or str", value_kind(&other)),
            ))
        }
    };

    if let Some(prefix) = &prefix {
        if prefix.len() as u64 > length {
            return Err(Error::corrupt_key(
                name,
                format!(
                    "prefix is {} bytes, longer than the member ({length} bytes)",
                    prefix.len()
                ),
            ));
        }
    }

    Ok(IndexEntry::new(offset, length, prefix))
}

fn decode_int(name: &str, field: &str, value: Option<Value>, key: i64) -> Result<u64> {
    let stored = match value {
        Some(Value::I64(v)) => v,
        Some(other) => {
            return Err(Error::corrupt_key(
                name,
                format!("{field} is a {}, expected an int", value_kind(&other)),
            ))
        }
        None => return Err(Error::corrupt_key(name, format!("{field} is missing"))),
    };

    u64::try_from(deobfuscate(stored, key))
        .map_err(|_| Error::corrupt_key(name, format!("{field} is negative after deobfuscation")))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::None => "None",
        Value::Bool(_) => "bool",
        Value::I64(_) => "int",
        Value::Int(_) => "big int",
        Value::F64(_) => "float",
        Value::Bytes(_) => "bytes",
        Value::String(_) => "str",
        Value::List(_) => "list",
        Value::Tuple(_) => "tuple",
        Value::Set(_) => "set",
        Value::FrozenSet(_) => "frozenset",
        Value::Dict(_) => "dict",
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_pickle::SerOptions;

    use super::*;

    fn pickle(value: Value) -> Vec<u8> {
        serde_pickle::value_to_vec(&value, SerOptions::new()).unwrap()
    }

    fn index_of(records: Vec<(&str, Value)>) -> Vec<u8> {
        let dict: BTreeMap<HashableValue, Value> = records
            .into_iter()
            .map(|(k, v)| (HashableValue::String(k.to_string()), v))
            .collect();
        pickle(Value::Dict(dict))
    }

    fn record(fields: Vec<Value>) -> Value {
        Value::List(vec![Value::Tuple(fields)])
    }

    #[test]
    fn test_deobfuscate_is_involution() {
        for key in [0i64, 0xa, 0xdead_beef, -1, i64::MAX] {
            for stored in [0i64, 1, 30, 0x1234_5678, i64::MIN] {
                let real = deobfuscate(stored, key);
                assert_eq!(deobfuscate(real, key), stored);
            }
        }
    }

    #[test]
    fn test_decode_applies_key() {
        let data = index_of(vec![(
            "script.rpy",
            record(vec![Value::I64(10 ^ 0xa), Value::I64(30 ^ 0xa)]),
        )]);

        let table = IndexTable::from_pickle(&data, 0xa).unwrap();
        let entry = table.get("script.rpy").unwrap();
        assert_eq!(entry.offset(), 10);
        assert_eq!(entry.length(), 30);
        assert_eq!(entry.prefix(), None);
    }

    #[test]
    fn test_decode_keeps_prefix_verbatim() {
        let data = index_of(vec![
            (
                "a.png",
                record(vec![
                    Value::I64(100),
                    Value::I64(5),
                    Value::Bytes(b"\x89PNG".to_vec()),
                ]),
            ),
            (
                "b.txt",
                record(vec![
                    Value::I64(105),
                    Value::I64(2),
                    Value::String("hi".into()),
                ]),
            ),
        ]);

        let table = IndexTable::from_pickle(&data, 0).unwrap();
        assert_eq!(table.get("a.png").unwrap().prefix(), Some(&b"\x89PNG"[..]));
        let png = table.get("a.png").unwrap();
        assert_eq!(png.length(), 5);
        assert_eq!(png.prefix_len(), 4);
        assert_eq!(png.stored_length(), 1);
        assert_eq!(table.get("b.txt").unwrap().prefix(), Some(&b"hi"[..]));
    }

    #[test]
    fn test_names_are_sorted() {
        let data = index_of(vec![
            ("z.txt", record(vec![Value::I64(0), Value::I64(1)])),
            ("a/b.txt", record(vec![Value::I64(1), Value::I64(1)])),
            ("m.txt", record(vec![Value::I64(2), Value::I64(1)])),
        ]);

        let table = IndexTable::from_pickle(&data, 0).unwrap();
        let names: Vec<_> = table.names().collect();
        assert_eq!(names, ["a/b.txt", "m.txt", "z.txt"]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_byte_string_names_are_accepted() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::Bytes(b"old/style.rpy".to_vec()),
            record(vec![Value::I64(0), Value::I64(4)]),
        );

        let table = IndexTable::from_pickle(&pickle(Value::Dict(dict)), 0).unwrap();
        assert!(table.contains("old/style.rpy"));
    }

    #[test]
    fn test_not_a_dict() {
        let data = pickle(Value::List(vec![]));
        let err = IndexTable::from_pickle(&data, 0).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { key: None, .. }));
    }

    #[test]
    fn test_non_string_key() {
        let mut dict = BTreeMap::new();
        dict.insert(
            HashableValue::I64(7),
            record(vec![Value::I64(0), Value::I64(4)]),
        );

        let err = IndexTable::from_pickle(&pickle(Value::Dict(dict)), 0).unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { .. }));
    }

    #[test]
    fn test_bad_shapes_name_the_key() {
        let cases = vec![
            Value::I64(3),
            Value::List(vec![]),
            Value::List(vec![Value::I64(1)]),
            record(vec![Value::I64(1)]),
            record(vec![Value::String("1".into()), Value::I64(1)]),
            record(vec![Value::I64(1), Value::I64(1), Value::I64(1)]),
            // Records are a list of tuples, nothing else.
            Value::Tuple(vec![Value::Tuple(vec![Value::I64(0), Value::I64(1)])]),
            Value::List(vec![Value::List(vec![Value::I64(0), Value::I64(1)])]),
            // Prefix longer than the whole member.
            record(vec![
                Value::I64(0),
                Value::I64(2),
                Value::Bytes(b"abc".to_vec()),
            ]),
        ];

        for value in cases {
            let data = index_of(vec![("bad.rpy", value)]);
            match IndexTable::from_pickle(&data, 0) {
                Err(Error::CorruptIndex { key, reason }) => {
                    assert_eq!(key.as_deref(), Some("bad.rpy"));
                    assert!(reason.contains("bad.rpy"), "{reason}");
                }
                other => panic!("expected corrupt index, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_negative_after_key_is_corrupt() {
        let data = index_of(vec![("neg", record(vec![Value::I64(-5), Value::I64(1)]))]);
        assert!(matches!(
            IndexTable::from_pickle(&data, 0),
            Err(Error::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_garbage_pickle() {
        assert!(matches!(
            IndexTable::from_pickle(b"\x80\x02garbage", 0),
            Err(Error::CorruptIndex { key: None, .. })
        ));
    }
}
