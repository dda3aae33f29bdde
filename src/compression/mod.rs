// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The codec registry (spec.md §4.2): a plug-in directory of
//! compressors/decompressors keyed by `compression_type`, with declarative
//! metadata requirements and compression constraints.
//!
//! Modeled, per spec.md §9 ("Ad-hoc polymorphism"), as a closed capability
//! set: a `Compressor`/`Decompressor` trait pair, dispatched at runtime
//! through the registry but with a fixed, enum-indexed set of
//! implementations rather than dynamic plugin loading.

mod brotli_codec;
mod flac_codec;
mod lz4_codec;
mod lzma_codec;
mod none_codec;
mod pcm;
mod ricepp_codec;
mod zstd_codec;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fstypes::CompressionType;
use crate::option_map::OptionMap;

/// A single typed value in a fragment category's attached metadata (spec.md
/// §4.2 "Declarative metadata requirements").
#[derive(Clone, Debug, PartialEq)]
pub enum MetaValue {
    Int(i64),
    Str(String),
}

pub type CategoryMetadata = BTreeMap<String, MetaValue>;

/// One field's requirement: either membership in a set of allowed values, or
/// an inclusive numeric range.
#[derive(Clone, Debug)]
pub enum MetadataRequirement {
    Set(Vec<MetaValue>),
    Range(i64, i64),
}

impl MetadataRequirement {
    fn is_satisfied_by(&self, value: &MetaValue) -> bool {
        match self {
            MetadataRequirement::Set(values) => values.contains(value),
            MetadataRequirement::Range(lo, hi) => match value {
                MetaValue::Int(v) => *v >= *lo && *v <= *hi,
                MetaValue::Str(_) => false,
            },
        }
    }
}

/// Alignment/granularity constraints a codec imposes on the byte ranges
/// handed to it (spec.md §4.2 "Compression constraints").
#[derive(Clone, Copy, Debug, Default)]
pub struct Constraints {
    pub granularity: usize,
}

impl Constraints {
    pub fn none() -> Self {
        Constraints { granularity: 1 }
    }
}

/// `compress(bytes, metadata?) -> bytes`, stateless across calls. May raise
/// [`Error::BadCompressionRatio`] if the output would be no smaller than the
/// input; callers downgrade to `NONE` storage in that case.
pub trait Compressor: Send + Sync {
    fn compression_type(&self) -> CompressionType;
    fn compress(&self, input: &[u8], metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>>;
}

/// Constructed from a compressed byte span; advertises `uncompressed_size`
/// and extends an external buffer frame-wise via `decompress_frame`.
pub trait Decompressor: Send {
    fn uncompressed_size(&self) -> usize;

    /// Extends `out` by at most `frame_size` bytes. Returns `true` exactly
    /// once, when the last byte has been emitted.
    fn decompress_frame(&mut self, frame_size: usize, out: &mut Vec<u8>) -> Result<bool>;
}

/// A codec's factory: advertises metadata requirements and constraints, and
/// builds compressor/decompressor instances.
pub trait CodecFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn compression_type(&self) -> CompressionType;
    fn metadata_requirements(&self) -> BTreeMap<String, MetadataRequirement> {
        BTreeMap::new()
    }
    fn constraints(&self) -> Constraints {
        Constraints::none()
    }
    fn make_compressor(&self, options: &OptionMap) -> Result<Box<dyn Compressor>>;
    fn make_decompressor(&self, data: &[u8]) -> Result<Box<dyn Decompressor>>;
}

/// Verifies a fragment category's metadata against a codec's declared
/// requirements. A mismatch is a configuration error, not a runtime
/// corruption (spec.md §4.2, §7).
pub fn check_metadata_requirements(
    factory: &dyn CodecFactory,
    metadata: Option<&CategoryMetadata>,
) -> Result<()> {
    let reqs = factory.metadata_requirements();
    if reqs.is_empty() {
        return Ok(());
    }
    let metadata = metadata.ok_or(Error::UnmetMetadataRequirement {
        codec: factory.name(),
        field: "<all>",
    })?;
    for (field, req) in &reqs {
        let Some(value) = metadata.get(field) else {
            return Err(Error::UnmetMetadataRequirement { codec: factory.name(), field: "missing" });
        };
        if !req.is_satisfied_by(value) {
            return Err(Error::UnmetMetadataRequirement { codec: factory.name(), field: "missing" });
        }
    }
    Ok(())
}

/// Initialized once, read-only thereafter (spec.md §5).
pub struct CodecRegistry {
    factories: BTreeMap<CompressionType, Arc<dyn CodecFactory>>,
}

impl CodecRegistry {
    /// Builds the registry with every codec compiled into this build (the
    /// `lz4`/`zstd`/`lzma`/`brotli`/`flac`/`ricepp` cargo features).
    pub fn with_defaults() -> Self {
        let mut factories: BTreeMap<CompressionType, Arc<dyn CodecFactory>> = BTreeMap::new();
        factories.insert(CompressionType::None, Arc::new(none_codec::NoneFactory));

        #[cfg(feature = "lz4")]
        {
            factories.insert(CompressionType::Lz4, Arc::new(lz4_codec::Lz4Factory::fast()));
            factories.insert(CompressionType::Lz4Hc, Arc::new(lz4_codec::Lz4Factory::hc()));
        }
        #[cfg(feature = "zstd")]
        factories.insert(CompressionType::Zstd, Arc::new(zstd_codec::ZstdFactory));
        #[cfg(feature = "lzma")]
        factories.insert(CompressionType::Lzma, Arc::new(lzma_codec::LzmaFactory));
        #[cfg(feature = "brotli")]
        factories.insert(CompressionType::Brotli, Arc::new(brotli_codec::BrotliFactory));
        #[cfg(feature = "flac")]
        factories.insert(CompressionType::Flac, Arc::new(flac_codec::FlacFactory));
        #[cfg(feature = "ricepp")]
        factories.insert(CompressionType::Ricepp, Arc::new(ricepp_codec::RicepPFactory));

        CodecRegistry { factories }
    }

    pub fn factory(&self, ty: CompressionType) -> Result<&Arc<dyn CodecFactory>> {
        self.factories
            .get(&ty)
            .ok_or_else(|| Error::UnknownCompression(ty.to_string()))
    }

    /// Resolves a compressor spec string (`"name:k=v"`) to the factory that
    /// declared that `name`, without building a compressor/decompressor.
    pub fn factory_for_spec(&self, spec: &str) -> Result<&Arc<dyn CodecFactory>> {
        let om = OptionMap::parse(spec);
        self.factories
            .values()
            .find(|f| f.name() == om.choice())
            .ok_or_else(|| Error::UnknownCompression(om.choice().to_string()))
    }

    pub fn make_compressor(&self, spec: &str) -> Result<Box<dyn Compressor>> {
        let om = OptionMap::parse(spec);
        let factory = self.factory_for_spec(spec)?;
        factory.make_compressor(&om)
    }

    pub fn make_decompressor(&self, ty: CompressionType, data: &[u8]) -> Result<Box<dyn Decompressor>> {
        self.factory(ty)?.make_decompressor(data)
    }

    /// Runs a decompressor to completion, for callers that don't need
    /// frame-wise progress (e.g. non-BLOCK section decode).
    pub fn decompress(&self, ty: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
        let mut dec = self.make_decompressor(ty, data)?;
        let total = dec.uncompressed_size();
        let mut out = Vec::with_capacity(total);
        while out.len() < total {
            dec.decompress_frame(total - out.len(), &mut out)?;
        }
        Ok(out)
    }

    /// Names of the crates backing each compiled-in codec, for embedding in
    /// a future CLI's `--version` output (spec.md §2.1 addition, grounded on
    /// `library_dependencies.cpp`).
    pub fn dependency_report(&self) -> Vec<(&'static str, &'static str)> {
        let mut report = vec![("NONE", "std")];
        #[cfg(feature = "lz4")]
        report.push(("LZ4/LZ4HC", "lz4_flex"));
        #[cfg(feature = "zstd")]
        report.push(("ZSTD", "zstd"));
        #[cfg(feature = "lzma")]
        report.push(("LZMA", "xz2"));
        #[cfg(feature = "brotli")]
        report.push(("BROTLI", "brotli"));
        #[cfg(feature = "flac")]
        report.push(("FLAC", "flac-bound"));
        #[cfg(feature = "ricepp")]
        report.push(("RICEPP", "dwarfs_core (hand-rolled)"));
        report
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Reads a LEB128 varint (used by the BROTLI/FLAC/RICEPP uncompressed-size
/// prefixes).
pub(crate) fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::Decompress("varint too long".into()));
        }
    }
    Err(Error::Decompress("truncated varint".into()))
}

pub(crate) fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(v, &mut buf);
            let (decoded, len) = read_varint(&buf).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn registry_has_none_codec() {
        let reg = CodecRegistry::with_defaults();
        assert!(reg.factory(CompressionType::None).is_ok());
    }
}
