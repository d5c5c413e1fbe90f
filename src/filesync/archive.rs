use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use crate::error::{FleetwireError, Result};

/// One file carried by a transfer payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub data: Vec<u8>,
}

/// Packs entries into the transfer payload: per entry a u32-BE path length,
/// the UTF-8 path, a u64-BE data length, and the raw bytes. Zero entries pack
/// to zero bytes.
pub fn pack(entries: &[Entry]) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.path.as_bytes();
        out.extend_from_slice(&(path.len() as u32).to_be_bytes());
        out.extend_from_slice(path);
        out.extend_from_slice(&(entry.data.len() as u64).to_be_bytes());
        out.extend_from_slice(&entry.data);
    }
    out
}

pub fn unpack(bytes: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut at = 0usize;
    while at < bytes.len() {
        let path_len = read_u32(bytes, &mut at)? as usize;
        let path_bytes = take(bytes, &mut at, path_len)?;
        let path = String::from_utf8(path_bytes.to_vec())
            .map_err(|_| malformed("entry path is not valid utf-8"))?;
        let data_len = read_u64(bytes, &mut at)? as usize;
        let data = take(bytes, &mut at, data_len)?.to_vec();
        entries.push(Entry { path, data });
    }
    Ok(entries)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn read_u32(bytes: &[u8], at: &mut usize) -> Result<u32> {
    let slice = take(bytes, at, 4)?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], at: &mut usize) -> Result<u64> {
    let slice = take(bytes, at, 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(slice);
    Ok(u64::from_be_bytes(buf))
}

fn take<'a>(bytes: &'a [u8], at: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = at
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| malformed("truncated archive"))?;
    let slice = &bytes[*at..end];
    *at = end;
    Ok(slice)
}

fn malformed(message: &str) -> FleetwireError {
    FleetwireError::Serialization(format!("malformed archive: {message}"))
}
