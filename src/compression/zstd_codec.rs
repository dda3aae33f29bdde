// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ZSTD: uncompressed size read from the ZSTD frame header, no extra prefix
//! (spec.md §4.2).

use std::collections::BTreeMap;
use std::io::Read;

use super::{CategoryMetadata, CodecFactory, Compressor, Constraints, Decompressor, MetadataRequirement};
use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

pub struct ZstdFactory;

impl CodecFactory for ZstdFactory {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }

    fn constraints(&self) -> Constraints {
        Constraints::none()
    }

    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>> {
        let level = options.get_parsed::<i32>("level").unwrap_or(19);
        Ok(Box::new(ZstdCompressor { level }))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        let uncompressed_size = zstd::zstd_safe::get_frame_content_size(data)
            .map_err(|_| Error::Decompress("malformed zstd frame header".into()))?
            .ok_or_else(|| Error::Decompress("zstd frame has unknown content size".into()))?
            as usize;
        let reader = zstd::stream::read::Decoder::new(data)
            .map_err(|e| Error::Decompress(e.to_string()))?;
        Ok(Box::new(ZstdDecompressor { reader: Box::new(reader), uncompressed_size, emitted: 0 }))
    }
}

struct ZstdCompressor {
    level: i32,
}

impl Compressor for ZstdCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        let body = zstd::stream::encode_all(input, self.level)
            .map_err(|e| Error::Decompress(e.to_string()))?;
        if body.len() >= input.len() {
            return Err(Error::BadCompressionRatio);
        }
        Ok(body)
    }
}

/// Wraps `zstd::stream::read::Decoder` (a plain [`Read`]) so each
/// `decompress_frame` call pulls at most `frame_size` bytes, matching the
/// cache layer's frame-wise materialization protocol (spec.md §4.3).
struct ZstdDecompressor<'a> {
    reader: Box<dyn Read + 'a>,
    uncompressed_size: usize,
    emitted: usize,
}

impl Decompressor for ZstdDecompressor<'_> {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> Result<bool> {
        let want = frame_size.min(self.uncompressed_size - self.emitted);
        let start = out.len();
        out.resize(start + want, 0);
        let mut filled = 0;
        while filled < want {
            let n = self.reader.read(&mut out[start + filled..start + want])?;
            if n == 0 {
                return Err(Error::Decompress("zstd stream ended early".into()));
            }
            filled += n;
        }
        self.emitted += want;
        Ok(self.emitted == self.uncompressed_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_zstd() {
        let f = ZstdFactory;
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(128);
        let c = f.make_compressor(&OptionMap::default()).unwrap();
        let compressed = c.compress(&data, None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(4096, &mut out).unwrap() {}
        assert_eq!(out, data);
    }

    #[test]
    fn frame_wise_decompression_respects_frame_size() {
        let f = ZstdFactory;
        let data = vec![7u8; 10_000];
        let c = f.make_compressor(&OptionMap::default()).unwrap();
        let compressed = c.compress(&data, None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        let done = d.decompress_frame(1000, &mut out).unwrap();
        assert!(!done);
        assert_eq!(out.len(), 1000);
    }
}
