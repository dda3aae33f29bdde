// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! BROTLI: a 64-bit varint uncompressed-size prefix, then the raw Brotli
//! stream (spec.md §4.2).

use std::collections::BTreeMap;
use std::io::Read;

use super::{
    read_varint, write_varint, CategoryMetadata, CodecFactory, Compressor, Constraints,
    Decompressor, MetadataRequirement,
};
use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

pub struct BrotliFactory;

impl CodecFactory for BrotliFactory {
    fn name(&self) -> &'static str {
        "brotli"
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::Brotli
    }

    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }

    fn constraints(&self) -> Constraints {
        Constraints::none()
    }

    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>> {
        let quality = options.get_parsed::<u32>("level").unwrap_or(11).min(11);
        Ok(Box::new(BrotliCompressor { quality }))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        let (uncompressed_size, prefix_len) = read_varint(data)?;
        let body = data[prefix_len..].to_vec();
        Ok(Box::new(BrotliDecompressor {
            body,
            uncompressed_size: uncompressed_size as usize,
            emitted: 0,
            inner: None,
        }))
    }
}

struct BrotliCompressor {
    quality: u32,
}

impl Compressor for BrotliCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Brotli
    }

    fn compress(&self, input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.quality as i32,
            lgwin: 24,
            ..Default::default()
        };
        let mut body = Vec::new();
        {
            let mut reader = std::io::Cursor::new(input);
            brotli::BrotliCompress(&mut reader, &mut body, &params)
                .map_err(|e| Error::Decompress(e.to_string()))?;
        }
        let mut out = Vec::with_capacity(10 + body.len());
        write_varint(input.len() as u64, &mut out);
        out.extend_from_slice(&body);
        if out.len() >= input.len() {
            return Err(Error::BadCompressionRatio);
        }
        Ok(out)
    }
}

/// `brotli::Decompressor` is a lazily-constructed [`Read`]; it is built on
/// first use so `make_decompressor` stays infallible past varint parsing.
struct BrotliDecompressor {
    body: Vec<u8>,
    uncompressed_size: usize,
    emitted: usize,
    inner: Option<brotli::Decompressor<std::io::Cursor<Vec<u8>>>>,
}

impl Decompressor for BrotliDecompressor {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> Result<bool> {
        if self.inner.is_none() {
            let cursor = std::io::Cursor::new(std::mem::take(&mut self.body));
            self.inner = Some(brotli::Decompressor::new(cursor, 4096));
        }
        let reader = self.inner.as_mut().unwrap();
        let want = frame_size.min(self.uncompressed_size - self.emitted);
        let start = out.len();
        out.resize(start + want, 0);
        let mut filled = 0;
        while filled < want {
            let n = reader.read(&mut out[start + filled..start + want])?;
            if n == 0 {
                return Err(Error::Decompress("brotli stream ended early".into()));
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
    fn round_trips_brotli() {
        let f = BrotliFactory;
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let c = f.make_compressor(&OptionMap::default()).unwrap();
        let compressed = c.compress(&data, None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(4096, &mut out).unwrap() {}
        assert_eq!(out, data);
    }
}
