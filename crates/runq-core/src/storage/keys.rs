//! Key encoding for RocksDB column families.
//!
//! All numeric values use big-endian encoding for correct lexicographic ordering.
//! Composite keys use `:` (0x3A) as separator.
//! Set names are length-prefixed with a big-endian u16 so that one set's entries
//! can never collide with another set whose name shares a prefix.

use crate::error::StorageError;

const SEPARATOR: u8 = b':';

/// Encode a u64 as 8 big-endian bytes.
fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Encode a variable-length string with a 2-byte big-endian length prefix.
fn encode_string(s: &str) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(s.len())
        .map_err(|_| StorageError::CorruptData(format!("key segment exceeds 64 KiB: {} bytes", s.len())))?;
    let mut buf = Vec::with_capacity(2 + s.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(buf)
}

/// Prefix shared by every entry of one set (sorted or plain): `{set}:`
pub fn set_prefix(set: &str) -> Result<Vec<u8>, StorageError> {
    let mut prefix = encode_string(set)?;
    prefix.push(SEPARATOR);
    Ok(prefix)
}

/// Build a sorted-set ordering key: `{set}:{score}:{member}`
///
/// Key layout (binary):
/// - length-prefixed set name
/// - separator
/// - 8-byte big-endian score
/// - separator
/// - raw member bytes (remainder of the key)
pub fn zset_entry_key(set: &str, score: u64, member: &str) -> Result<Vec<u8>, StorageError> {
    let mut key = set_prefix(set)?;
    key.extend_from_slice(&encode_u64(score));
    key.push(SEPARATOR);
    key.extend_from_slice(member.as_bytes());
    Ok(key)
}

/// Upper bound (inclusive) for every ordering key of `set` with score `<= max_score`.
pub fn zset_score_bound(set: &str, max_score: u64) -> Result<Vec<u8>, StorageError> {
    let mut key = set_prefix(set)?;
    key.extend_from_slice(&encode_u64(max_score));
    key.push(SEPARATOR);
    // Members are UTF-8, so 0xFF never appears and sorts after any member.
    key.push(0xFF);
    Ok(key)
}

/// Parse `(score, member)` out of an ordering key, given the set's prefix length.
pub fn parse_zset_entry_key(key: &[u8], prefix_len: usize) -> Option<(u64, String)> {
    let rest = key.get(prefix_len..)?;
    if rest.len() < 9 || rest[8] != SEPARATOR {
        return None;
    }
    let score = u64::from_be_bytes(rest[..8].try_into().ok()?);
    let member = std::str::from_utf8(&rest[9..]).ok()?.to_string();
    Some((score, member))
}

/// Build a member key, used by the reverse score index and by plain sets:
/// `{set}:{member}`
pub fn member_key(set: &str, member: &str) -> Result<Vec<u8>, StorageError> {
    let mut key = set_prefix(set)?;
    key.extend_from_slice(member.as_bytes());
    Ok(key)
}

pub fn encode_score(score: u64) -> [u8; 8] {
    encode_u64(score)
}

pub fn decode_score(value: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = value.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
