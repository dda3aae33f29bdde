// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level tags and the chunk bit-packing (spec.md §3, §6).

use std::fmt;

/// `compression_type` tag (spec.md §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u16)]
pub enum CompressionType {
    None = 0,
    Lzma = 1,
    Zstd = 2,
    Lz4 = 3,
    Lz4Hc = 4,
    Brotli = 5,
    Flac = 6,
    Ricepp = 7,
}

impl CompressionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Lzma,
            2 => Self::Zstd,
            3 => Self::Lz4,
            4 => Self::Lz4Hc,
            5 => Self::Brotli,
            6 => Self::Flac,
            7 => Self::Ricepp,
            _ => return None,
        })
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Lzma => "LZMA",
            Self::Zstd => "ZSTD",
            Self::Lz4 => "LZ4",
            Self::Lz4Hc => "LZ4HC",
            Self::Brotli => "BROTLI",
            Self::Flac => "FLAC",
            Self::Ricepp => "RICEPP",
        };
        f.write_str(s)
    }
}

/// `section_type` tag (spec.md §6). Legacy values not required by the core
/// read path are omitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u16)]
pub enum SectionType {
    Block = 0,
    MetadataV2Schema = 7,
    MetadataV2 = 8,
    SectionIndex = 9,
    History = 10,
}

impl SectionType {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Block,
            7 => Self::MetadataV2Schema,
            8 => Self::MetadataV2,
            9 => Self::SectionIndex,
            10 => Self::History,
            _ => return None,
        })
    }

    /// Non-BLOCK section types may appear at most once (spec.md §3 invariant i).
    pub fn is_unique(self) -> bool {
        !matches!(self, Self::Block)
    }
}

impl fmt::Display for SectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Block => "BLOCK",
            Self::MetadataV2Schema => "METADATA_V2_SCHEMA",
            Self::MetadataV2 => "METADATA_V2",
            Self::SectionIndex => "SECTION_INDEX",
            Self::History => "HISTORY",
        };
        f.write_str(s)
    }
}

/// A single section-index entry: `(type << 48) | offset` (spec.md §6).
pub fn pack_section_index_entry(ty: SectionType, offset: u64) -> u64 {
    debug_assert!(offset < (1u64 << 48));
    ((ty as u64) << 48) | (offset & ((1u64 << 48) - 1))
}

pub fn unpack_section_index_entry(entry: u64) -> (u16, u64) {
    ((entry >> 48) as u16, entry & ((1u64 << 48) - 1))
}

/// A decoded chunk: a contiguous `(block, offset, size)` slice of an inode's
/// content (spec.md §3 "Chunk encoding").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Chunk {
    pub block: u64,
    pub offset: u64,
    pub size: u64,
}

/// Bit layout parameters derived from `block_size_bits` (`B`).
///
/// Given `B = block_size_bits`:
/// - `block  = chunk >> (64 - block_bits)` where `block_bits = 64 - 2*B`
/// - `offset = (chunk >> B) & (2^B - 1)`
/// - `size   = (chunk & (2^B - 1)) + 1`
#[derive(Clone, Copy, Debug)]
pub struct ChunkCodec {
    block_size_bits: u32,
}

impl ChunkCodec {
    pub fn new(block_size_bits: u32) -> Self {
        assert!(block_size_bits < 32, "invalid block_size_bits");
        ChunkCodec { block_size_bits }
    }

    fn block_bits(&self) -> u32 {
        64 - 2 * self.block_size_bits
    }

    fn block_shift(&self) -> u32 {
        64 - self.block_bits()
    }

    fn block_mask(&self) -> u64 {
        (1u64 << self.block_bits()) - 1
    }

    fn offset_mask(&self) -> u64 {
        (1u64 << self.block_size_bits) - 1
    }

    /// Maximum representable size for this `block_size_bits`.
    pub fn max_size(&self) -> u64 {
        self.offset_mask() + 1
    }

    pub fn max_block(&self) -> u64 {
        self.block_mask()
    }

    pub fn encode(&self, block: u64, offset: u64, size: u64) -> crate::error::Result<u64> {
        if block > self.block_mask() {
            return Err(crate::error::Error::InvalidArgument("chunk block out of range"));
        }
        if offset > self.offset_mask() {
            return Err(crate::error::Error::InvalidArgument("chunk offset out of range"));
        }
        if size == 0 || size > self.max_size() {
            return Err(crate::error::Error::InvalidArgument("chunk size out of range"));
        }
        Ok((block << self.block_shift())
            | (offset << self.block_size_bits)
            | (size - 1))
    }

    pub fn decode(&self, chunk: u64) -> Chunk {
        let block = (chunk >> self.block_shift()) & self.block_mask();
        let offset = (chunk >> self.block_size_bits) & self.offset_mask();
        let size = (chunk & self.offset_mask()) + 1;
        Chunk { block, offset, size }
    }
}

pub const MIN_BLOCK_SIZE_BITS: u32 = 12;
pub const MAX_BLOCK_SIZE_BITS: u32 = 28;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trip() {
        let codec = ChunkCodec::new(18);
        let packed = codec.encode(7, 1000, 4096).unwrap();
        let c = codec.decode(packed);
        assert_eq!(c, Chunk { block: 7, offset: 1000, size: 4096 });
    }

    #[test]
    fn chunk_size_never_zero() {
        let codec = ChunkCodec::new(12);
        let packed = codec.encode(0, 0, 1).unwrap();
        assert_eq!(codec.decode(packed).size, 1);
    }

    #[test]
    fn section_index_entry_round_trip() {
        let e = pack_section_index_entry(SectionType::Block, 0x1234);
        assert_eq!(unpack_section_index_entry(e), (0, 0x1234));
    }
}
