//! Decompression of the archive index.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::{Error, Result};

/// Decompress zlib-framed data.
pub fn inflate_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = Vec::with_capacity(data.len().saturating_mul(4));

    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::corrupt(format!("zlib decompression failed: {e}")))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zlib_roundtrip() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let original = b"(dp0\nVscript.rpy\np1\n(lp2\n(I10\nI30\ntp3\nas.";

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate_zlib(&compressed).unwrap(), original);
    }

    #[test]
    fn test_garbage_is_corrupt_index() {
        let err = inflate_zlib(b"definitely not zlib").unwrap_err();
        assert!(matches!(err, Error::CorruptIndex { key: None, .. }));
    }
}
