//! Stored value layout for a device token.
//!
//! A value is the insertion time (unix seconds, zig-zag varint) followed by
//! the owner's UTF-8 bytes with no length prefix.

use super::db::DatabaseError;

/// Longest varint an `i64` can occupy.
const MAX_VARINT_LEN: usize = 10;

/// Decoded value of a `device_tokens` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// When the token was (last) saved, unix seconds.
    pub added: i64,
    /// Who the token belongs to.
    pub owner: String,
}

impl TokenRecord {
    pub fn new(owner: impl Into<String>, added: i64) -> Self {
        Self {
            added,
            owner: owner.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_VARINT_LEN + self.owner.len());
        put_varint(&mut out, self.added);
        out.extend_from_slice(self.owner.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DatabaseError> {
        let (added, n) = read_varint(data)
            .ok_or_else(|| DatabaseError::Corrupt("truncated timestamp varint".to_string()))?;
        let owner = std::str::from_utf8(&data[n..])
            .map_err(|e| DatabaseError::Corrupt(format!("owner is not UTF-8: {e}")))?;
        Ok(Self::new(owner, added))
    }
}

/// Bucket holding the tokens of `topic` in the given environment.
pub fn bucket_name(topic: &str, sandbox: bool) -> String {
    if sandbox {
        format!("~{topic}")
    } else {
        topic.to_string()
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn put_varint(out: &mut Vec<u8>, value: i64) {
    let mut ux = ((value << 1) ^ (value >> 63)) as u64;
    while ux >= 0x80 {
        out.push((ux as u8) | 0x80);
        ux >>= 7;
    }
    out.push(ux as u8);
}

#[allow(clippy::cast_possible_wrap)]
fn read_varint(data: &[u8]) -> Option<(i64, usize)> {
    let mut ux: u64 = 0;
    for (i, &b) in data.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == MAX_VARINT_LEN - 1 && b > 1 {
            return None;
        }
        ux |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            let value = ((ux >> 1) as i64) ^ -((ux & 1) as i64);
            return Some((value, i + 1));
        }
    }
    None
}
