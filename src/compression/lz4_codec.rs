// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LZ4 / LZ4HC: a 32-bit little-endian uncompressed-size prefix, then a raw
//! LZ4 block (spec.md §4.2).

use std::collections::BTreeMap;

use super::{CategoryMetadata, CodecFactory, Compressor, Constraints, Decompressor, MetadataRequirement};
use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

const PREFIX_LEN: usize = 4;

pub struct Lz4Factory {
    ty: CompressionType,
    high_compression: bool,
}

impl Lz4Factory {
    pub fn fast() -> Self {
        Lz4Factory { ty: CompressionType::Lz4, high_compression: false }
    }

    pub fn hc() -> Self {
        Lz4Factory { ty: CompressionType::Lz4Hc, high_compression: true }
    }
}

impl CodecFactory for Lz4Factory {
    fn name(&self) -> &'static str {
        if self.high_compression { "lz4hc" } else { "lz4" }
    }

    fn compression_type(&self) -> CompressionType {
        self.ty
    }

    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }

    fn constraints(&self) -> Constraints {
        Constraints::none()
    }

    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>> {
        let level = options.get_parsed::<i32>("level").unwrap_or(9);
        Ok(Box::new(Lz4Compressor { ty: self.ty, high_compression: self.high_compression, level }))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        if data.len() < PREFIX_LEN {
            return Err(Error::Decompress("truncated LZ4 size prefix".into()));
        }
        let uncompressed_size =
            u32::from_le_bytes(data[0..PREFIX_LEN].try_into().unwrap()) as usize;
        Ok(Box::new(Lz4Decompressor {
            compressed: data[PREFIX_LEN..].to_vec(),
            uncompressed_size,
            done: false,
        }))
    }
}

struct Lz4Compressor {
    ty: CompressionType,
    high_compression: bool,
    level: i32,
}

impl Compressor for Lz4Compressor {
    fn compression_type(&self) -> CompressionType {
        self.ty
    }

    fn compress(&self, input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        let body = if self.high_compression {
            lz4_flex::block::compress_hc(input, self.level)
        } else {
            lz4_flex::block::compress(input)
        };
        if body.len() >= input.len() {
            return Err(Error::BadCompressionRatio);
        }
        let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
        out.extend_from_slice(&(input.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Decompresses in a single frame: `lz4_flex` has no incremental decoder, so
/// the whole block is materialized on the first `decompress_frame` call, the
/// way a `decompress_ratio` of `1.0` does at the cache layer (spec.md §4.4).
struct Lz4Decompressor {
    compressed: Vec<u8>,
    uncompressed_size: usize,
    done: bool,
}

impl Decompressor for Lz4Decompressor {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(&mut self, _frame_size: usize, out: &mut Vec<u8>) -> Result<bool> {
        if !self.done {
            let mut buf = vec![0u8; self.uncompressed_size];
            let n = lz4_flex::block::decompress_into(&self.compressed, &mut buf)
                .map_err(|e| Error::Decompress(e.to_string()))?;
            buf.truncate(n);
            out.extend_from_slice(&buf);
            self.done = true;
        }
        Ok(true)
    }
}
