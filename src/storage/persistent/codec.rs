//! Framing codec for warehouse frames and audit journal records.
//!
//! A file starts with a header and holds one or more frames:
//! ```text
//! header: [magic: 4 bytes][version: 1 byte]
//! frame:  [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current frame version.
pub const CODEC_VERSION: u8 = 1;

/// Identifies starmerge files.
pub const MAGIC: [u8; 4] = *b"STAR";

/// Largest frame accepted on read.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Serializes `value` into one frame.
///
/// # Errors
///
/// Fails if serialization fails or the payload exceeds `u32::MAX` bytes.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| invalid(format!("frame of {} bytes is too large", data.len())))?;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&checksum(&data).to_le_bytes());
    Ok(out)
}

/// Reads one frame, verifying version, size and checksum.
///
/// # Errors
///
/// Returns `ErrorKind::UnexpectedEof` on a truncated frame and
/// `ErrorKind::InvalidData` on corruption.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = usize::try_from(u32::from_le_bytes(len_bytes)).unwrap_or(usize::MAX);
    if len > MAX_FRAME_SIZE {
        return Err(invalid(format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}")));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = checksum(&data);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x} (data corrupted)"
        )));
    }

    serde_json::from_slice(&data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
///
/// # Errors
///
/// Propagates write failures.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header, returning its version.
///
/// # Errors
///
/// Returns `ErrorKind::InvalidData` on a foreign file.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {magic:?}"
        )));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEntry;
    use crate::fact::FactManifest;
    use chrono::Utc;
    use std::io::Cursor;

    #[test]
    fn audit_entry_frame_roundtrip() {
        let entry = AuditEntry::succeeded("merge ce_countries", 3, 1, Utc::now());
        let mut cursor = Cursor::new(encode(&entry).unwrap());
        let decoded: AuditEntry = decode(&mut cursor).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn manifest_frame_roundtrip() {
        let manifest = FactManifest::new(3);
        let mut cursor = Cursor::new(encode(&manifest).unwrap());
        let decoded: FactManifest = decode(&mut cursor).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(decoded.partitions().width_months(), 3);
    }

    #[test]
    fn detects_corruption() {
        let mut encoded = encode(&"payload bytes".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_is_eof() {
        let encoded = encode(&"payload".to_string()).unwrap();
        let truncated = encoded[..encoded.len() - 2].to_vec();
        let err = decode::<String>(&mut Cursor::new(truncated)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn foreign_header_is_rejected() {
        let err = read_header(&mut Cursor::new(b"KYRO\x01".to_vec())).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);
    }
}
