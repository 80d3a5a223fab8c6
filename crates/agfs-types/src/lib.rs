#![forbid(unsafe_code)]
//! Core newtypes and on-disk field primitives for AgateFS.
//!
//! Every unit that crosses a crate boundary gets its own wrapper type so that
//! allocation-group-relative block numbers, filesystem-wide block numbers, and
//! raw device block numbers cannot be mixed up silently.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Raw device block number (index into the underlying block device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Allocation group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Block number relative to the start of one allocation group.
///
/// This is the payload of the "short" B+tree pointer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgBlock(pub u32);

/// Filesystem-wide block number: `(ag << ag_shift) | agbno`.
///
/// This is the payload of the "long" B+tree pointer format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsBlock(pub u64);

impl FsBlock {
    /// Compose a filesystem-wide block number from an AG and a relative block.
    #[must_use]
    pub fn from_parts(ag: AgNumber, bno: AgBlock, ag_shift: u32) -> Self {
        Self((u64::from(ag.0) << ag_shift) | u64::from(bno.0))
    }

    /// Split back into (allocation group, relative block).
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn split(self, ag_shift: u32) -> (AgNumber, AgBlock) {
        let mask = (1_u64 << ag_shift) - 1;
        (
            AgNumber((self.0 >> ag_shift) as u32),
            AgBlock((self.0 & mask) as u32),
        )
    }
}

/// Directory name hash value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirHash(pub u32);

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── Directory name hash ─────────────────────────────────────────────────────

/// Hash a directory entry name.
///
/// Rolling 7-bit hash processing four bytes per round; the same function the
/// directory leaf/node index orders its entries by. Stable across platforms.
#[must_use]
pub fn name_hash(name: &[u8]) -> DirHash {
    let mut hash: u32 = 0;
    let mut chunks = name.chunks_exact(4);
    for chunk in &mut chunks {
        hash = (u32::from(chunk[0]) << 21)
            ^ (u32::from(chunk[1]) << 14)
            ^ (u32::from(chunk[2]) << 7)
            ^ u32::from(chunk[3])
            ^ hash.rotate_left(7 * 4);
    }
    let rest = chunks.remainder();
    match rest.len() {
        3 => {
            hash = (u32::from(rest[0]) << 14)
                ^ (u32::from(rest[1]) << 7)
                ^ u32::from(rest[2])
                ^ hash.rotate_left(7 * 3);
        }
        2 => {
            hash = (u32::from(rest[0]) << 7) ^ u32::from(rest[1]) ^ hash.rotate_left(7 * 2);
        }
        1 => {
            hash = u32::from(rest[0]) ^ hash.rotate_left(7);
        }
        _ => {}
    }
    DirHash(hash)
}

/// Hash a name after ASCII-lowercasing it.
///
/// Used by case-insensitive directory instances so that case variants of one
/// name land in the same hash run.
#[must_use]
pub fn name_hash_ci(name: &[u8]) -> DirHash {
    let lowered: Vec<u8> = name.iter().map(u8::to_ascii_lowercase).collect();
    name_hash(&lowered)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AgBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FsBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DirHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_accepts_powers_of_two_in_range() {
        for bs in [512, 1024, 4096, 65536] {
            assert_eq!(BlockSize::new(bs).unwrap().get(), bs);
        }
    }

    #[test]
    fn block_size_rejects_out_of_range_and_non_powers() {
        for bs in [0, 256, 3000, 131_072] {
            assert!(BlockSize::new(bs).is_err());
        }
    }

    #[test]
    fn fsblock_round_trips_through_parts() {
        let fsb = FsBlock::from_parts(AgNumber(7), AgBlock(0x1234), 24);
        let (ag, bno) = fsb.split(24);
        assert_eq!(ag, AgNumber(7));
        assert_eq!(bno, AgBlock(0x1234));
    }

    #[test]
    fn le_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0xBEEF).unwrap();
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).unwrap();
        write_le_u64(&mut buf, 6, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 6).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn le_helpers_report_truncation() {
        let buf = [0_u8; 3];
        let err = read_le_u32(&buf, 1).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn name_hash_is_deterministic_and_spreads() {
        let h1 = name_hash(b"hello");
        let h2 = name_hash(b"hello");
        let h3 = name_hash(b"world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn name_hash_handles_all_tail_lengths() {
        // 4k, 4k+1, 4k+2, 4k+3 byte names all take distinct tail paths.
        let names: [&[u8]; 4] = [b"abcd", b"abcde", b"abcdef", b"abcdefg"];
        let hashes: Vec<u32> = names.iter().map(|n| name_hash(n).0).collect();
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn ci_hash_folds_ascii_case() {
        assert_eq!(name_hash_ci(b"README"), name_hash_ci(b"readme"));
        assert_ne!(name_hash(b"README"), name_hash(b"readme"));
    }
}
