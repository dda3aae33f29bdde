// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The identity codec: `uncompressed_size == input_size`.

use std::collections::BTreeMap;

use super::{CategoryMetadata, CodecFactory, Compressor, Constraints, Decompressor, MetadataRequirement};
use crate::error::Result;
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

pub struct NoneFactory;

impl CodecFactory for NoneFactory {
    fn name(&self) -> &'static str {
        "none"
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }

    fn constraints(&self) -> Constraints {
        Constraints::none()
    }

    fn make_compressor(&self, _options: &OptionMap) -> Result<Box<dyn Compressor>> {
        Ok(Box::new(NoneCompressor))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        Ok(Box::new(NoneDecompressor { data: data.to_vec(), emitted: 0 }))
    }
}

struct NoneCompressor;

impl Compressor for NoneCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

struct NoneDecompressor {
    data: Vec<u8>,
    emitted: usize,
}

impl Decompressor for NoneDecompressor {
    fn uncompressed_size(&self) -> usize {
        self.data.len()
    }

    fn decompress_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> Result<bool> {
        let end = (self.emitted + frame_size).min(self.data.len());
        out.extend_from_slice(&self.data[self.emitted..end]);
        self.emitted = end;
        Ok(self.emitted == self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let f = NoneFactory;
        let c = f.make_compressor(&OptionMap::default()).unwrap();
        let compressed = c.compress(b"hello world", None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(4, &mut out).unwrap() {}
        assert_eq!(out, b"hello world");
    }
}
