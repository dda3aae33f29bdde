// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FLAC: a 64-bit varint uncompressed size, then a compact PCM-format header
//! record, then the FLAC stream (spec.md §4.2). `flac-bound` only binds
//! libFLAC's encoder, so decoding goes through `claxon` (DESIGN.md).
//!
//! Per spec.md §9 ("Open questions"), FLAC deliberately does **not** raise
//! [`Error::BadCompressionRatio`] when its output exceeds the input: the
//! format header carries information (channel layout, bit depth) that would
//! be lost if the writer fell back to storing the fragment uncompressed.

use std::collections::BTreeMap;
use std::io::Cursor;

use flac_bound::{FlacEncoder, WriteWrapper};

use super::{
    read_varint, write_varint, CategoryMetadata, CodecFactory, Compressor, Constraints,
    Decompressor, MetaValue, MetadataRequirement,
};
use crate::compression::pcm::PcmFormat;
use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

const HEADER_LEN: usize = 6;

fn write_format(fmt: &PcmFormat, out: &mut Vec<u8>) {
    out.push(fmt.big_endian as u8);
    out.push(fmt.signed as u8);
    out.push(fmt.pad_high as u8);
    out.push(fmt.bytes_per_sample);
    out.push(fmt.bits_per_sample);
    out.push(fmt.channels);
}

fn read_format(data: &[u8]) -> Result<PcmFormat> {
    if data.len() < HEADER_LEN {
        return Err(Error::Decompress("truncated FLAC format header".into()));
    }
    Ok(PcmFormat {
        big_endian: data[0] != 0,
        signed: data[1] != 0,
        pad_high: data[2] != 0,
        bytes_per_sample: data[3],
        bits_per_sample: data[4],
        channels: data[5],
    })
}

pub struct FlacFactory;

impl CodecFactory for FlacFactory {
    fn name(&self) -> &'static str {
        "flac"
    }

    fn compression_type(&self) -> CompressionType {
        CompressionType::Flac
    }

    /// FLAC needs to know it's looking at raw PCM at all: the category must
    /// declare itself as PCM audio (spec.md §4.2 "Declarative metadata
    /// requirements").
    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        let mut reqs = BTreeMap::new();
        reqs.insert(
            "category".to_string(),
            MetadataRequirement::Set(vec![MetaValue::Str("pcmaudio/waveform".to_string())]),
        );
        reqs
    }

    fn constraints(&self) -> Constraints {
        // The segmenter must never cut mid-sample-frame.
        Constraints { granularity: 1 }
    }

    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>> {
        let sample_rate = options.get_parsed::<u32>("sample_rate").unwrap_or(44_100);
        let channels = options.get_parsed::<u8>("channels").unwrap_or(2);
        let bits_per_sample = options.get_parsed::<u8>("bits_per_sample").unwrap_or(16);
        let compression_level = options.get_parsed::<u32>("level").unwrap_or(5).min(8);
        let big_endian = matches!(options.get("endian"), Some("big"));
        let format = PcmFormat {
            big_endian,
            signed: true,
            pad_high: false,
            bytes_per_sample: bits_per_sample.div_ceil(8),
            bits_per_sample,
            channels,
        };
        Ok(Box::new(FlacCompressor { format, sample_rate, compression_level }))
    }

    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        let (uncompressed_size, prefix_len) = read_varint(data)?;
        let format = read_format(&data[prefix_len..])?;
        let stream = data[prefix_len + HEADER_LEN..].to_vec();
        Ok(Box::new(FlacDecompressor {
            format,
            stream,
            uncompressed_size: uncompressed_size as usize,
            decoded: None,
            emitted: 0,
        }))
    }
}

struct FlacCompressor {
    format: PcmFormat,
    sample_rate: u32,
    compression_level: u32,
}

impl Compressor for FlacCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Flac
    }

    fn compress(&self, input: &[u8], metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
        super::check_metadata_requirements(&FlacFactory, metadata)?;
        let samples = self.format.unpack(input)?;
        let frame_count = (samples.len() / self.format.channels as usize) as u32;

        let mut body = Vec::new();
        {
            let mut wrapper = WriteWrapper(&mut body);
            let mut enc = FlacEncoder::new()
                .ok_or_else(|| Error::Decompress("failed to allocate FLAC encoder".into()))?
                .channels(self.format.channels as u32)
                .bits_per_sample(self.format.bits_per_sample as u32)
                .sample_rate(self.sample_rate)
                .compression_level(self.compression_level)
                .init_write(&mut wrapper)
                .map_err(|_| Error::Decompress("FLAC encoder init failed".into()))?;
            enc.process_interleaved(&samples, frame_count)
                .map_err(|e| Error::Decompress(format!("FLAC encode failed: {e:?}")))?;
            enc.finish().map_err(|(_, e)| Error::Decompress(format!("FLAC finish failed: {e:?}")))?;
        }

        let mut out = Vec::with_capacity(10 + HEADER_LEN + body.len());
        write_varint(input.len() as u64, &mut out);
        write_format(&self.format, &mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }
}

struct FlacDecompressor {
    format: PcmFormat,
    stream: Vec<u8>,
    uncompressed_size: usize,
    decoded: Option<Vec<u8>>,
    emitted: usize,
}

impl Decompressor for FlacDecompressor {
    fn uncompressed_size(&self) -> usize {
        self.uncompressed_size
    }

    fn decompress_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> Result<bool> {
        if self.decoded.is_none() {
            let mut reader = claxon::FlacReader::new(Cursor::new(&self.stream))
                .map_err(|e| Error::Decompress(format!("FLAC stream open failed: {e}")))?;
            let mut samples = Vec::new();
            for sample in reader.samples() {
                samples.push(sample.map_err(|e| Error::Decompress(format!("FLAC decode failed: {e}")))?);
            }
            self.decoded = Some(self.format.repack(&samples)?);
        }
        let decoded = self.decoded.as_ref().unwrap();
        let want = frame_size.min(decoded.len() - self.emitted);
        out.extend_from_slice(&decoded[self.emitted..self.emitted + want]);
        self.emitted += want;
        Ok(self.emitted == decoded.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CategoryMetadata;

    fn metadata() -> CategoryMetadata {
        let mut m = CategoryMetadata::new();
        m.insert("category".to_string(), MetaValue::Str("pcmaudio/waveform".to_string()));
        m
    }

    #[test]
    fn round_trips_stereo_16bit() {
        let f = FlacFactory;
        let mut raw = Vec::new();
        for i in 0..1000i16 {
            let l = (i % 200) - 100;
            let r = -(i % 150) + 75;
            raw.extend_from_slice(&l.to_le_bytes());
            raw.extend_from_slice(&r.to_le_bytes());
        }
        let c = f.make_compressor(&OptionMap::parse("flac:channels=2:bits_per_sample=16")).unwrap();
        let compressed = c.compress(&raw, Some(&metadata())).unwrap();
        let mut d = f.make_decompressor(&compressed).unwrap();
        let mut out = Vec::new();
        while !d.decompress_frame(raw.len(), &mut out).unwrap() {}
        assert_eq!(out, raw);
    }
}
