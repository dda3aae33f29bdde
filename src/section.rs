// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The section layer (spec.md §4.1): framing, per-section header, integrity
//! checks, and a lazy iterator of sections over a file view.

use std::sync::Arc;

use crate::byte_buffer::FileView;
use crate::checksum::{sha512_256, xxh3_64};
use crate::compression::CodecRegistry;
use crate::error::{Error, Result};
use crate::fstypes::{CompressionType, SectionType};

pub const MAGIC: &[u8; 6] = b"DWARFS";
pub const MAJOR_VERSION_V1: u8 = 1;
pub const MAJOR_VERSION_V2: u8 = 2;

const V1_PREAMBLE_LEN: usize = 8;
const V1_HEADER_LEN: usize = 10; // u16 type, u16 compression, u8 pad, u32 length
const V2_HEADER_LEN: usize = 6 + 1 + 1 + 8 + 8 + 32 + 2 + 2 + 4 + 8;

/// Which framing version a container uses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FramingVersion {
    V1,
    V2,
}

struct RawHeaderV1 {
    ty: u16,
    compression: u16,
    length: u32,
}

fn parse_v1_header(bytes: &[u8]) -> Result<RawHeaderV1> {
    if bytes.len() < V1_HEADER_LEN {
        return Err(Error::TruncatedHeader);
    }
    let ty = u16::from_le_bytes([bytes[0], bytes[1]]);
    let compression = u16::from_le_bytes([bytes[2], bytes[3]]);
    // bytes[4] is the padding byte.
    let length = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    Ok(RawHeaderV1 { ty, compression, length })
}

struct RawHeaderV2 {
    major: u8,
    minor: u8,
    number: u64,
    xxh3: u64,
    sha: [u8; 32],
    ty: u16,
    compression: u16,
    length: u64,
}

fn parse_v2_header(bytes: &[u8]) -> Result<RawHeaderV2> {
    if bytes.len() < V2_HEADER_LEN {
        return Err(Error::TruncatedHeader);
    }
    if &bytes[0..6] != MAGIC {
        return Err(Error::BadMagic);
    }
    let major = bytes[6];
    let minor = bytes[7];
    let number = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let xxh3 = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let mut sha = [0u8; 32];
    sha.copy_from_slice(&bytes[24..56]);
    let ty = u16::from_le_bytes([bytes[56], bytes[57]]);
    let compression = u16::from_le_bytes([bytes[58], bytes[59]]);
    // bytes[60..64] is the unused field.
    let length = u64::from_le_bytes(bytes[64..72].try_into().unwrap());
    Ok(RawHeaderV2 { major, minor, number, xxh3, sha, ty, compression, length })
}

/// A parsed, validated section: `(image, start, length, type, compression)`.
pub struct FsSection {
    pub version: FramingVersion,
    pub header_start: usize,
    pub start: usize,
    pub length: usize,
    pub section_type: SectionType,
    pub compression: CompressionType,
    pub number: u64,
    v2_xxh3: u64,
    v2_sha: [u8; 32],
    v2_checksum_start: usize,
}

impl FsSection {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn raw_payload<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.start..self.end()]
    }

    /// Fast checksum: for v2, the SHA-512/256 covering the header from the
    /// `number` field through end-of-payload. v1 has no checksum and is
    /// always considered fast-valid.
    pub fn check_fast(&self, image: &[u8]) -> bool {
        match self.version {
            FramingVersion::V1 => true,
            FramingVersion::V2 => {
                let span = &image[self.v2_checksum_start..self.end()];
                sha512_256(span) == self.v2_sha
            }
        }
    }

    /// Full checksum: for v2, the xxh3-64 covering the header starting at
    /// the `sha2_512_256` field through end-of-payload.
    pub fn verify(&self, image: &[u8]) -> bool {
        match self.version {
            FramingVersion::V1 => true,
            FramingVersion::V2 => {
                let sha_field_start = self.v2_checksum_start + 8 + 8; // past number, xxh3
                let span = &image[sha_field_start..self.end()];
                xxh3_64(span) == self.v2_xxh3
            }
        }
    }

    /// Decodes this section's payload. If uncompressed, returns a view over
    /// the mapping with no copy; otherwise runs the codec and returns an
    /// owned buffer.
    pub fn decode(&self, image: &[u8], registry: &CodecRegistry) -> Result<Vec<u8>> {
        let raw = self.raw_payload(image);
        if self.compression == CompressionType::None {
            return Ok(raw.to_vec());
        }
        registry.decompress(self.compression, raw)
    }
}

/// A non-restartable iterator of sections over a file view, starting at a
/// given byte offset into the image.
pub struct SectionIterator<'a> {
    image: &'a [u8],
    cursor: usize,
    version: FramingVersion,
    next_number: u64,
}

impl<'a> SectionIterator<'a> {
    /// Opens an iterator at `image_offset`, probing for the framing version.
    /// A v1 container begins with an 8-byte preamble; a v2 container has no
    /// preamble and every section header itself carries the magic.
    pub fn open(image: &'a [u8], image_offset: usize) -> Result<Self> {
        if image_offset + V1_PREAMBLE_LEN <= image.len()
            && &image[image_offset..image_offset + 6] == MAGIC
        {
            let major = image[image_offset + 6];
            if major == MAJOR_VERSION_V1 {
                return Ok(SectionIterator {
                    image,
                    cursor: image_offset + V1_PREAMBLE_LEN,
                    version: FramingVersion::V1,
                    next_number: 0,
                });
            }
        }
        // v2: no global preamble, but the first section header must itself
        // start with the magic.
        if image_offset + 8 <= image.len() && &image[image_offset..image_offset + 6] == MAGIC {
            let major = image[image_offset + 6];
            if major == MAJOR_VERSION_V2 {
                return Ok(SectionIterator {
                    image,
                    cursor: image_offset,
                    version: FramingVersion::V2,
                    next_number: 0,
                });
            }
            return Err(Error::UnsupportedMajorVersion { found: major, expected: MAJOR_VERSION_V2 });
        }
        Err(Error::BadMagic)
    }

    /// Scans the image for the first offset at which a valid framing header
    /// is found, bounded by the image size, preferring the first candidate
    /// whose declared length fits in the image (spec.md §4.1).
    pub fn detect_offset(image: &'a [u8]) -> Result<usize> {
        for offset in 0..image.len().saturating_sub(6) {
            if &image[offset..offset + 6] != MAGIC {
                continue;
            }
            if let Ok(mut it) = SectionIterator::open(image, offset) {
                if matches!(it.next(), Some(Ok(_))) {
                    return Ok(offset);
                }
            }
        }
        Err(Error::NoFramingFound)
    }

    pub fn version(&self) -> FramingVersion {
        self.version
    }
}

impl<'a> Iterator for SectionIterator<'a> {
    type Item = Result<FsSection>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.image.len() {
            return None;
        }
        match self.version {
            FramingVersion::V1 => {
                let header_start = self.cursor;
                let hdr = match parse_v1_header(&self.image[header_start..]) {
                    Ok(h) => h,
                    Err(e) => return Some(Err(e)),
                };
                let start = header_start + V1_HEADER_LEN;
                let length = hdr.length as usize;
                if start + length > self.image.len() {
                    return Some(Err(Error::TruncatedSection));
                }
                let Some(section_type) = SectionType::from_u16(hdr.ty) else {
                    return Some(Err(Error::StructuralInvariant("unknown section type")));
                };
                let Some(compression) = CompressionType::from_u16(hdr.compression) else {
                    return Some(Err(Error::StructuralInvariant("unknown compression type")));
                };
                self.cursor = start + length;
                let number = self.next_number;
                self.next_number += 1;
                Some(Ok(FsSection {
                    version: FramingVersion::V1,
                    header_start,
                    start,
                    length,
                    section_type,
                    compression,
                    number,
                    v2_xxh3: 0,
                    v2_sha: [0; 32],
                    v2_checksum_start: 0,
                }))
            }
            FramingVersion::V2 => {
                let header_start = self.cursor;
                let hdr = match parse_v2_header(&self.image[header_start..]) {
                    Ok(h) => h,
                    Err(e) => return Some(Err(e)),
                };
                if hdr.major != MAJOR_VERSION_V2 {
                    return Some(Err(Error::UnsupportedMajorVersion {
                        found: hdr.major,
                        expected: MAJOR_VERSION_V2,
                    }));
                }
                if hdr.minor > 0 {
                    return Some(Err(Error::NewerMinorVersion { found: hdr.minor, expected: 0 }));
                }
                let start = header_start + V2_HEADER_LEN;
                let length = hdr.length as usize;
                if start + length > self.image.len() {
                    return Some(Err(Error::TruncatedSection));
                }
                let Some(section_type) = SectionType::from_u16(hdr.ty) else {
                    return Some(Err(Error::StructuralInvariant("unknown section type")));
                };
                let Some(compression) = CompressionType::from_u16(hdr.compression) else {
                    return Some(Err(Error::StructuralInvariant("unknown compression type")));
                };
                self.cursor = start + length;
                Some(Ok(FsSection {
                    version: FramingVersion::V2,
                    header_start,
                    start,
                    length,
                    section_type,
                    compression,
                    number: hdr.number,
                    v2_xxh3: hdr.xxh3,
                    v2_sha: hdr.sha,
                    v2_checksum_start: header_start + 6 + 1 + 1, // at `number`
                }))
            }
        }
    }
}

/// Encodes a single v2 section (header + payload), computing both
/// checksums (spec.md §6). Used by the filesystem writer; the inverse of
/// `parse_v2_header`/[`FsSection`].
pub fn encode_v2_section(
    number: u64,
    section_type: SectionType,
    compression: CompressionType,
    payload: &[u8],
) -> Vec<u8> {
    let mut header = Vec::with_capacity(V2_HEADER_LEN);
    header.extend_from_slice(MAGIC);
    header.push(MAJOR_VERSION_V2);
    header.push(0);
    header.extend_from_slice(&number.to_le_bytes());
    header.extend_from_slice(&0u64.to_le_bytes()); // xxh3 placeholder
    header.extend_from_slice(&[0u8; 32]); // sha placeholder
    header.extend_from_slice(&(section_type as u16).to_le_bytes());
    header.extend_from_slice(&(compression as u16).to_le_bytes());
    header.extend_from_slice(&0u32.to_le_bytes()); // unused
    header.extend_from_slice(&(payload.len() as u64).to_le_bytes());

    let mut buf = header.clone();
    buf.extend_from_slice(payload);

    // sha2_512_256 over header[number..] + payload
    let sha_span_start = 6 + 1 + 1; // at `number`
    let sha = sha512_256(&[&header[sha_span_start..], payload].concat());
    buf[sha_span_start + 16..sha_span_start + 16 + 32].copy_from_slice(&sha);

    // xxh3 over header[sha2_512_256..] + payload
    let xxh3_span_start = sha_span_start + 8;
    let xxh3 = xxh3_64(&[&buf[xxh3_span_start..header.len()], payload].concat());
    buf[sha_span_start + 8..sha_span_start + 16].copy_from_slice(&xxh3.to_le_bytes());

    buf
}

/// Reads the section index, if present: an array of 64-bit entries, each
/// `(type << 48) | offset`, read back-to-front from the tail of the image.
pub fn read_section_index(sections: &[FsSection], image: &[u8]) -> Option<Vec<(u16, u64)>> {
    let idx = sections.iter().find(|s| s.section_type == SectionType::SectionIndex)?;
    let payload = idx.raw_payload(image);
    Some(
        payload
            .chunks_exact(8)
            .map(|c| crate::fstypes::unpack_section_index_entry(u64::from_le_bytes(c.try_into().unwrap())))
            .collect(),
    )
}

/// Convenience: a shared, owned image plus its discovered section offset,
/// used by [`crate::filesystem::Filesystem`].
pub struct Image {
    pub view: Arc<dyn FileView>,
    pub offset: usize,
}

impl Image {
    pub fn open(view: Arc<dyn FileView>, offset: Option<usize>) -> Result<Self> {
        let offset = match offset {
            Some(o) => o,
            None => SectionIterator::detect_offset(view.as_slice())?,
        };
        Ok(Image { view, offset })
    }

    pub fn header(&self) -> &[u8] {
        &self.view.as_slice()[..self.offset]
    }

    pub fn iter(&self) -> Result<SectionIterator<'_>> {
        SectionIterator::open(self.view.as_slice(), self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_v1(sections: &[(SectionType, CompressionType, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.push(MAJOR_VERSION_V1);
        buf.push(0);
        for (ty, comp, payload) in sections {
            buf.extend_from_slice(&(*ty as u16).to_le_bytes());
            buf.extend_from_slice(&(*comp as u16).to_le_bytes());
            buf.push(0);
            buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            buf.extend_from_slice(payload);
        }
        buf
    }

    #[test]
    fn iterates_v1_sections() {
        let image = build_v1(&[
            (SectionType::Block, CompressionType::None, b"hello"),
            (SectionType::MetadataV2, CompressionType::None, b"meta"),
        ]);
        let it = SectionIterator::open(&image, 0).unwrap();
        let sections: Vec<_> = it.map(|s| s.unwrap()).collect();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].raw_payload(&image), b"hello");
        assert_eq!(sections[1].raw_payload(&image), b"meta");
    }

    #[test]
    fn rejects_truncated_v1_section() {
        let mut image = build_v1(&[(SectionType::Block, CompressionType::None, b"hello")]);
        image.truncate(image.len() - 2);
        let mut it = SectionIterator::open(&image, 0).unwrap();
        assert!(matches!(it.next(), Some(Err(Error::TruncatedSection))));
    }

    fn build_v2_section(
        number: u64,
        ty: SectionType,
        comp: CompressionType,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(MAGIC);
        header.push(MAJOR_VERSION_V2);
        header.push(0);
        header.extend_from_slice(&number.to_le_bytes());
        // Placeholder checksum fields, patched below.
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&[0u8; 32]);
        header.extend_from_slice(&(ty as u16).to_le_bytes());
        header.extend_from_slice(&(comp as u16).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u64).to_le_bytes());

        let mut buf = header.clone();
        buf.extend_from_slice(payload);

        // sha2_512_256 over header[number..] + payload
        let sha_span_start = 6 + 1 + 1;
        let sha = sha512_256(&[&header[sha_span_start..], payload].concat());
        buf[sha_span_start + 16..sha_span_start + 16 + 32].copy_from_slice(&sha);

        // xxh3 over header[sha2_512_256_field..] + payload (header bytes unaffected by sha patch
        // position since sha field starts right after xxh3 field)
        let xxh3_span_start = sha_span_start + 8;
        let xxh3 = xxh3_64(&[&buf[xxh3_span_start..header.len()], payload].concat());
        buf[sha_span_start + 8..sha_span_start + 16].copy_from_slice(&xxh3.to_le_bytes());

        buf
    }

    #[test]
    fn iterates_and_verifies_v2_sections() {
        let image = build_v2_section(0, SectionType::MetadataV2Schema, CompressionType::None, b"schema");
        let mut it = SectionIterator::open(&image, 0).unwrap();
        let s = it.next().unwrap().unwrap();
        assert!(s.check_fast(&image));
        assert!(s.verify(&image));
        assert_eq!(s.raw_payload(&image), b"schema");
    }

    #[test]
    fn detects_corrupted_v2_payload() {
        let mut image =
            build_v2_section(0, SectionType::Block, CompressionType::None, b"payload-data");
        let last = image.len() - 1;
        image[last] ^= 0xff;
        let mut it = SectionIterator::open(&image, 0).unwrap();
        let s = it.next().unwrap().unwrap();
        assert!(!s.check_fast(&image));
    }
}
