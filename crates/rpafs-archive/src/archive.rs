//! RPA archive reader.
//!
//! The index is decoded once on open. Member reads go through a single file
//! handle; the seek and the read happen under one lock so concurrent readers
//! never observe each other's cursor.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::header::{Header, RpaVersion, MAX_HEADER_LEN};
use crate::index::{IndexEntry, IndexTable};
use crate::{Error, Result};

/// An opened RPA archive.
pub struct Archive {
    /// Path the archive was opened from
    path: PathBuf,
    /// Archive file name
    name: String,
    /// Decoded state; `None` after a failed reload
    loaded: Option<Loaded>,
}

struct Loaded {
    file: Mutex<File>,
    file_len: u64,
    header: Header,
    index: IndexTable,
}

impl Archive {
    /// Open an archive and decode its index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let loaded = Loaded::decode(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            name,
            loaded: Some(loaded),
        })
    }

    /// Close the file handle and decode the archive again.
    ///
    /// If decoding fails the archive stays closed and every read fails with
    /// [`Error::NotLoaded`].
    pub fn reload(&mut self) -> Result<()> {
        self.loaded = None;
        self.loaded = Some(Loaded::decode(&self.path)?);
        Ok(())
    }

    /// Path the archive was opened from.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive file name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the archive has a decoded index.
    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Parsed header.
    pub fn header(&self) -> Result<&Header> {
        Ok(&self.loaded()?.header)
    }

    /// Detected format version.
    pub fn version(&self) -> Result<RpaVersion> {
        Ok(self.loaded()?.header.version())
    }

    /// Deobfuscation key derived from the header.
    pub fn key(&self) -> Result<i64> {
        Ok(self.loaded()?.header.key())
    }

    /// The decoded index.
    pub fn index(&self) -> Result<&IndexTable> {
        Ok(&self.loaded()?.index)
    }

    /// Number of members; 0 when not loaded.
    pub fn len(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member names in sorted order.
    pub fn names(&self) -> Result<Vec<&str>> {
        Ok(self.loaded()?.index.names().collect())
    }

    /// Members with their index entries, in name order.
    pub fn entries(&self) -> Result<impl Iterator<Item = (&str, &IndexEntry)> + '_> {
        Ok(self.loaded()?.index.iter())
    }

    /// Look up a member's index entry.
    pub fn get(&self, name: &str) -> Option<&IndexEntry> {
        self.loaded.as_ref()?.index.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Read a member.
    ///
    /// Returns exactly [`IndexEntry::length`] bytes: the index prefix, if
    /// any, followed by the bytes stored at the member's offset. This is the
    /// content Ren'Py itself serves for the member.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let (loaded, entry) = self.entry(name)?;
        let prefix = entry.prefix().unwrap_or_default();
        if entry.prefix_len() > entry.length() {
            return Err(Error::corrupt_key(name, "prefix is longer than the member"));
        }

        let stored = loaded.read_exact_at(name, entry.offset(), entry.stored_length())?;
        if prefix.is_empty() {
            return Ok(stored);
        }

        let mut out = Vec::with_capacity(prefix.len() + stored.len());
        out.extend_from_slice(prefix);
        out.extend_from_slice(&stored);
        Ok(out)
    }

    /// Read only the bytes stored at the member's offset.
    ///
    /// Returns exactly [`IndexEntry::stored_length`] bytes; the index prefix
    /// is left out.
    pub fn read_stored(&self, name: &str) -> Result<Vec<u8>> {
        let (loaded, entry) = self.entry(name)?;
        loaded.read_exact_at(name, entry.offset(), entry.stored_length())
    }

    fn entry(&self, name: &str) -> Result<(&Loaded, &IndexEntry)> {
        let loaded = self.loaded()?;
        let entry = loaded
            .index
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))?;
        Ok((loaded, entry))
    }

    fn loaded(&self) -> Result<&Loaded> {
        self.loaded.as_ref().ok_or(Error::NotLoaded)
    }
}

impl Loaded {
    fn decode(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let line = read_header_line(&file)?;
        let header = Header::parse(&line)?;

        debug!(
            path = %path.display(),
            version = %header.version(),
            key = header.key(),
            index_offset = header.index_offset(),
            "parsed archive header"
        );

        if header.index_offset() > file_len {
            return Err(Error::InvalidHeader(format!(
                "index offset {:#x} is past the end of the file ({file_len} bytes)",
                header.index_offset()
            )));
        }

        file.seek(SeekFrom::Start(header.index_offset()))?;
        let mut payload = Vec::with_capacity((file_len - header.index_offset()) as usize);
        file.read_to_end(&mut payload)?;

        let index = IndexTable::decode(&payload, header.key())?;

        debug!(path = %path.display(), entries = index.len(), "decoded archive index");

        Ok(Self {
            file: Mutex::new(file),
            file_len,
            header,
            index,
        })
    }

    /// Positioned read of exactly `length` bytes.
    fn read_exact_at(&self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let truncated = |actual: u64| Error::TruncatedRead {
            path: name.to_owned(),
            expected: length,
            actual,
        };

        // Reject before allocating for lengths the file cannot satisfy.
        let available = self.file_len.saturating_sub(offset);
        if available < length {
            return Err(truncated(available));
        }

        let mut buf = Vec::with_capacity(length as usize);
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            (&mut *file).take(length).read_to_end(&mut buf)?;
        }

        if buf.len() as u64 != length {
            return Err(truncated(buf.len() as u64));
        }

        Ok(buf)
    }
}

/// Read the first line of the file, bounded by [`MAX_HEADER_LEN`].
fn read_header_line(file: &File) -> Result<String> {
    let mut reader = BufReader::new(file.take(MAX_HEADER_LEN));
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;

    Ok(String::from_utf8_lossy(&line).into_owned())
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Archive");
        s.field("name", &self.name);
        if let Some(loaded) = &self.loaded {
            s.field("version", &loaded.header.version())
                .field("entries", &loaded.index.len());
        }
        s.finish()
    }
}
