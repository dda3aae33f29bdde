// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! LZMA (XZ container): uncompressed size is recovered from the XZ stream
//! footer and index, not a prefix we control; optional BCJ pre-filter for
//! known ISAs, tried both ways by the encoder, keeping the smaller (spec.md
//! §4.2).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use xz2::stream::{Check, Filters, LzmaOptions, Stream};
use xz2::write::XzEncoder;

use super::{
    read_varint, CategoryMetadata, CodecFactory, Compressor, Constraints, Decompressor,
    MetadataRequirement,
};
use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

/// BCJ (branch/call/jump) pre-filters for known instruction set
/// architectures (spec.md §4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BcjFilter {
    X86,
    Arm,
    ArmThumb,
    Sparc,
    PowerPc,
    Ia64,
}

const ALL_BCJ: &[BcjFilter] = &[
    BcjFilter::X86,
    BcjFilter::Arm,
    BcjFilter::ArmThumb,
    BcjFilter::Sparc,
    BcjFilter::PowerPc,
    BcjFilter::Ia64,
];

fn apply_bcj(filters: &mut Filters, bcj: BcjFilter) {
    match bcj {
        BcjFilter::X86 => filters.x86(),
        BcjFilter::Arm => filters.arm(),
        BcjFilter::ArmThumb => filters.arm_thumb(),
        BcjFilter::Sparc => filters.sparc(),
        BcjFilter::PowerPc => filters.powerpc(),
        BcjFilter::Ia64 => filters.ia64(),
    };
}

pub struct LzmaFactory;

impl CodecFactory for LzmaFactory {
    fn name(&self) -> &'static str {
        "lzma"
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::Lzma
    }

    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }

    fn constraints(&self) -> Constraints {
        Constraints::none()
    }

    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>> {
        let level = options.get_parsed::<u32>("level").unwrap_or(9).min(9);
        // `bcj=auto` (the default) tries every known BCJ filter plus plain
        // LZMA2 and keeps the smallest; a caller may pin one explicitly
        // (`bcj=x86`) or disable the trial (`bcj=none`).
        let candidates: Vec<Option<BcjFilter>> = match options.get("bcj") {
            Some("none") => vec![None],
            Some("x86") => vec![Some(BcjFilter::X86)],
            Some("arm") => vec![Some(BcjFilter::Arm)],
            Some("armthumb") => vec![Some(BcjFilter::ArmThumb)],
            Some("sparc") => vec![Some(BcjFilter::Sparc)],
            Some("powerpc") => vec![Some(BcjFilter::PowerPc)],
            Some("ia64") => vec![Some(BcjFilter::Ia64)],
            _ => {
                let mut v: Vec<Option<BcjFilter>> = vec![None];
                v.extend(ALL_BCJ.iter().map(|b| Some(*b)));
                v
            }
        };
        Ok(Box::new(LzmaCompressor { level, candidates }))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        let uncompressed_size = parse_xz_uncompressed_size(data)?;
        let reader = xz2::read::XzDecoder::new(data);
        Ok(Box::new(LzmaDecompressor {
            reader,
            uncompressed_size: uncompressed_size as usize,
            emitted: 0,
        }))
    }
}

struct LzmaCompressor {
    level: u32,
    candidates: Vec<Option<BcjFilter>>,
}

impl Compressor for LzmaCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lzma
    }

    fn compress(&self, input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        let mut best: Option<Vec<u8>> = None;
        for candidate in &self.candidates {
            let encoded = encode_with_bcj(input, self.level, *candidate)?;
            if best.as_ref().map(|b| encoded.len() < b.len()).unwrap_or(true) {
                best = Some(encoded);
            }
        }
        let best = best.ok_or(Error::BadCompressionRatio)?;
        if best.len() >= input.len() {
            return Err(Error::BadCompressionRatio);
        }
        Ok(best)
    }
}

fn encode_with_bcj(input: &[u8], level: u32, bcj: Option<BcjFilter>) -> Result<Vec<u8>> {
    let mut filters = Filters::new();
    if let Some(bcj) = bcj {
        apply_bcj(&mut filters, bcj);
    }
    let opts = LzmaOptions::new_preset(level).map_err(|e| Error::Decompress(e.to_string()))?;
    filters.lzma2(&opts);
    let stream =
        Stream::new_stream(filters, Check::Crc32).map_err(|e| Error::Decompress(e.to_string()))?;
    let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(input)?;
    encoder.try_finish().map_err(|e| Error::Decompress(e.to_string()))?;
    Ok(encoder.finish()?)
}

/// Frame-wise decompression of an XZ stream; `xz2::read::XzDecoder` is a
/// plain [`Read`] so a bounded `read` call per `decompress_frame` gives us
/// the block cache's partial-materialization protocol for free.
struct LzmaDecompressor<'a> {
    reader: xz2::read::XzDecoder<&'a [u8]>,
    uncompressed_size: usize,
    emitted: usize,
}

impl Decompressor for LzmaDecompressor<'_> {
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
                return Err(Error::Decompress("xz stream ended early".into()));
            }
            filled += n;
        }
        self.emitted += want;
        Ok(self.emitted == self.uncompressed_size)
    }
}

/// Recovers the total uncompressed size by reading the XZ stream footer
/// (last 12 bytes) to locate the index, then summing the `uncompressed_size`
/// field of each index record (spec.md §4.2).
fn parse_xz_uncompressed_size(data: &[u8]) -> Result<u64> {
    const FOOTER_LEN: usize = 12;
    if data.len() < 32 {
        return Err(Error::Decompress("xz stream too short".into()));
    }
    let footer_start = data.len() - FOOTER_LEN;
    let footer = &data[footer_start..];
    if &footer[10..12] != b"YZ" {
        return Err(Error::Decompress("bad xz footer magic".into()));
    }
    let backward_size = u32::from_le_bytes(footer[4..8].try_into().unwrap());
    let index_size = (backward_size as usize + 1) * 4;
    if index_size > footer_start {
        return Err(Error::Decompress("xz index size overruns stream".into()));
    }
    let index_start = footer_start - index_size;
    let index = &data[index_start..footer_start];
    if index.first() != Some(&0x00) {
        return Err(Error::Decompress("bad xz index indicator".into()));
    }
    let mut pos = 1;
    let (num_records, n) = read_varint(&index[pos..])?;
    pos += n;
    let mut total: u64 = 0;
    for _ in 0..num_records {
        let (_unpadded_size, n1) = read_varint(&index[pos..])?;
        pos += n1;
        let (uncompressed_size, n2) = read_varint(&index[pos..])?;
        pos += n2;
        total += uncompressed_size;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_lzma() {
        let f = LzmaFactory;
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let c = f.make_compressor(&OptionMap::parse("lzma:bcj=none:level=6")).unwrap();
        let compressed = c.compress(&data, None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(4096, &mut out).unwrap() {}
        assert_eq!(out, data);
    }

    #[test]
    fn round_trips_with_bcj_trial() {
        let f = LzmaFactory;
        let data = b"\x90\x90\x90\xe8\x01\x02\x03\x04".repeat(256);
        let c = f.make_compressor(&OptionMap::parse("lzma:level=1")).unwrap();
        let compressed = c.compress(&data, None).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(data.len(), &mut out).unwrap() {}
        assert_eq!(out, data);
    }
}
