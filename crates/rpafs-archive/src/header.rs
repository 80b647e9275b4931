//! RPA header line parsing and key derivation.

use std::fmt;

use crate::{Error, Result};

/// Upper bound on the header line length.
///
/// Real headers are well under 64 bytes; anything past this is not an RPA
/// header line.
pub const MAX_HEADER_LEN: u64 = 4096;

/// RPA format versions, identified by the header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpaVersion {
    /// `RPA-2.0`, no obfuscation.
    V2,
    /// `RPA-3.0`, subkeys start at field 2.
    V3,
    /// `RPA-3.2`, one reserved field, subkeys start at field 3.
    V32,
}

impl RpaVersion {
    /// Versions in detection order, most specific magic first.
    pub const DETECTION_ORDER: [RpaVersion; 3] = [Self::V32, Self::V3, Self::V2];

    /// Magic prefix of the header line, including the trailing space.
    pub const fn magic(self) -> &'static str {
        match self {
            Self::V2 => "RPA-2.0 ",
            Self::V3 => "RPA-3.0 ",
            Self::V32 => "RPA-3.2 ",
        }
    }

    /// Detect the version from a header line.
    pub fn detect(line: &str) -> Option<Self> {
        Self::DETECTION_ORDER
            .into_iter()
            .find(|v| line.starts_with(v.magic()))
    }

    /// Index of the first subkey field, or `None` if the version has no key.
    const fn first_subkey_field(self) -> Option<usize> {
        match self {
            Self::V2 => None,
            Self::V3 => Some(2),
            Self::V32 => Some(3),
        }
    }
}

impl fmt::Display for RpaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.magic().trim_end())
    }
}

/// Parsed RPA header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    version: RpaVersion,
    index_offset: u64,
    key: i64,
    raw: String,
}

impl Header {
    /// Parse a header line (without its trailing newline).
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let version =
            RpaVersion::detect(line).ok_or_else(|| Error::UnsupportedFormat(line.to_owned()))?;

        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        let required = version.first_subkey_field().map_or(2, |first| first + 1);
        if fields.len() < required {
            return Err(Error::InvalidHeader(format!(
                "{version} header needs at least {required} fields, found {}",
                fields.len()
            )));
        }

        let index_offset = u64::from_str_radix(fields[1], 16).map_err(|e| {
            Error::InvalidHeader(format!("bad index offset {:?}: {e}", fields[1]))
        })?;

        let key = match version.first_subkey_field() {
            Some(first) => derive_key(&fields[first..])?,
            None => 0,
        };

        Ok(Self {
            version,
            index_offset,
            key,
            raw: line.to_owned(),
        })
    }

    /// Detected format version.
    #[inline]
    pub fn version(&self) -> RpaVersion {
        self.version
    }

    /// Absolute file offset of the compressed index.
    #[inline]
    pub fn index_offset(&self) -> u64 {
        self.index_offset
    }

    /// Deobfuscation key (0 for version 2.0).
    #[inline]
    pub fn key(&self) -> i64 {
        self.key
    }

    /// The header line as read from the file.
    #[inline]
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// XOR all subkey fields together, each parsed as a signed 64-bit hex value.
fn derive_key(subkeys: &[&str]) -> Result<i64> {
    subkeys.iter().enumerate().try_fold(0i64, |key, (i, field)| {
        i64::from_str_radix(field, 16)
            .map(|subkey| key ^ subkey)
            .map_err(|e| Error::InvalidHeader(format!("bad subkey {i} {field:?}: {e}")))
    })
}
