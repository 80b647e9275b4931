//! Fixture archive builders for tests.
//!
//! Archives produced here follow the layout the Ren'Py archiver writes: a
//! fixed-width header line, member payloads, then the zlib-compressed
//! pickled index.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde_pickle::{HashableValue, SerOptions, Value};

use crate::index::deobfuscate;
use crate::RpaVersion;

/// One index record as stored in the file (key already applied).
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub name: String,
    pub offset: i64,
    pub length: i64,
    pub prefix: Option<Vec<u8>>,
}

impl StoredRecord {
    pub fn new(name: &str, offset: i64, length: i64) -> Self {
        Self {
            name: name.to_owned(),
            offset,
            length,
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: &[u8]) -> Self {
        self.prefix = Some(prefix.to_vec());
        self
    }
}

/// Pickle an index as `{name: [(offset, length[, prefix])]}`.
pub fn pickle_index(records: &[StoredRecord]) -> Vec<u8> {
    let dict: BTreeMap<HashableValue, Value> = records
        .iter()
        .map(|r| {
            let mut fields = vec![Value::I64(r.offset), Value::I64(r.length)];
            if let Some(prefix) = &r.prefix {
                fields.push(Value::Bytes(prefix.clone()));
            }
            (
                HashableValue::String(r.name.clone()),
                Value::List(vec![Value::Tuple(fields)]),
            )
        })
        .collect();

    serde_pickle::value_to_vec(&Value::Dict(dict), SerOptions::new())
        .unwrap_or_else(|e| panic!("pickling fixture index: {e}"))
}

/// zlib-compress a pickled index.
pub fn compress_index(pickled: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(pickled)
        .and_then(|()| encoder.finish())
        .unwrap_or_else(|e| panic!("compressing fixture index: {e}"))
}

/// Builds complete archive files in memory.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    version: RpaVersion,
    key: i64,
    members: Vec<(String, Vec<u8>, Option<Vec<u8>>)>,
}

impl ArchiveBuilder {
    pub fn new(version: RpaVersion) -> Self {
        Self {
            version,
            key: 0,
            members: Vec::new(),
        }
    }

    /// Obfuscation key; ignored for version 2.0. Must be non-negative.
    pub fn key(mut self, key: i64) -> Self {
        self.key = key;
        self
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.members.push((name.to_owned(), data.to_vec(), None));
        self
    }

    /// Add a member whose first bytes live in the index.
    ///
    /// The member reads as `prefix` followed by `data`; only `data` is
    /// written to the archive body, and the recorded length covers both.
    pub fn file_with_prefix(mut self, name: &str, data: &[u8], prefix: &[u8]) -> Self {
        self.members
            .push((name.to_owned(), data.to_vec(), Some(prefix.to_vec())));
        self
    }

    fn effective_key(&self) -> i64 {
        match self.version {
            RpaVersion::V2 => 0,
            RpaVersion::V3 | RpaVersion::V32 => self.key,
        }
    }

    fn header_line(&self, index_offset: u64) -> String {
        let magic = self.version.magic();
        match self.version {
            RpaVersion::V2 => format!("{magic}{index_offset:016x}\n"),
            RpaVersion::V3 => format!("{magic}{index_offset:016x} {:08x}\n", self.key),
            // The reserved field is written as a decoy key.
            RpaVersion::V32 => {
                format!("{magic}{index_offset:016x} {:08x} {:08x}\n", 0x5eed, self.key)
            }
        }
    }

    /// Serialize the archive.
    pub fn build(&self) -> Vec<u8> {
        let key = self.effective_key();
        let mut out = self.header_line(0).into_bytes();
        let mut records = Vec::with_capacity(self.members.len());

        for (name, data, prefix) in &self.members {
            let offset = out.len() as i64;
            out.extend_from_slice(data);
            let length = prefix.as_ref().map_or(0, Vec::len) + data.len();
            let mut record = StoredRecord::new(
                name,
                deobfuscate(offset, key),
                deobfuscate(length as i64, key),
            );
            if let Some(prefix) = prefix {
                record = record.with_prefix(prefix);
            }
            records.push(record);
        }

        // The header has a fixed width, so patching in the real offset
        // keeps every member offset valid.
        let index_offset = out.len() as u64;
        let header = self.header_line(index_offset);
        out[..header.len()].copy_from_slice(header.as_bytes());

        out.extend(compress_index(&pickle_index(&records)));
        out
    }

    /// Serialize the archive to a file.
    pub fn write_to(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.build())
    }
}
