// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-block decompression state machine (spec.md §4.3): partial
//! (frame-wise) decompression, reference counting, access timestamping, and
//! page-residency probing.
//!
//! A cached block never holds a lock internally; all concurrency control is
//! external (the block cache's worker threads the decompression work,
//! readers observe `range_end` atomically — spec.md §5).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::byte_buffer::FileView;
use crate::compression::{CodecRegistry, Decompressor};
use crate::error::{Error, Result};
use crate::section::FsSection;

/// A monotonically increasing "clock" used for last-access timestamps.
/// `Instant` isn't `Copy`-friendly for an atomic, so we track elapsed
/// nanoseconds since the cache's epoch instead.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Clock { epoch: Instant::now() }
    }

    pub fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory state tracking partial decompression of one block (spec.md §3
/// "Cache state").
pub struct CachedBlock {
    block_no: u64,
    total_size: usize,
    buffer: Mutex<Vec<u8>>,
    range_end: AtomicUsize,
    last_access_nanos: AtomicU64,
    decompressor: Mutex<Option<Box<dyn Decompressor>>>,
    compressed_range: (usize, usize),
}

impl CachedBlock {
    /// Builds a cached block from a `BLOCK` section, eagerly constructing
    /// the decompressor. The fast (SHA-512/256) checksum is always verified
    /// first (spec.md §3 invariant iv: "must verify before any data is
    /// decompressed"); the xxh3 checksum is verified too only when
    /// `check_integrity` is set ("check integrity" mount mode). Either
    /// failure is the I/O-corruption error path (spec.md §7), not a
    /// structural one — the block is simply never materialized.
    pub fn new(
        block_no: u64,
        section: &FsSection,
        image: &[u8],
        registry: &CodecRegistry,
        check_integrity: bool,
    ) -> Result<Self> {
        if !section.check_fast(image) {
            return Err(Error::BlockChecksumMismatch(block_no));
        }
        if check_integrity && !section.verify(image) {
            return Err(Error::BlockChecksumMismatch(block_no));
        }
        let compressed = section.raw_payload(image);
        let decompressor = registry.make_decompressor(section.compression, compressed)?;
        let total_size = decompressor.uncompressed_size();
        Ok(CachedBlock {
            block_no,
            total_size,
            buffer: Mutex::new(Vec::with_capacity(total_size)),
            range_end: AtomicUsize::new(0),
            last_access_nanos: AtomicU64::new(0),
            decompressor: Mutex::new(Some(Box::new(decompressor))),
            compressed_range: (section.start, section.length),
        })
    }

    pub fn block_no(&self) -> u64 {
        self.block_no
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes materialized so far; readers fence their view on this.
    pub fn range_end(&self) -> usize {
        self.range_end.load(Ordering::Acquire)
    }

    pub fn is_fully_materialized(&self) -> bool {
        self.range_end() >= self.total_size
    }

    pub fn touch(&self, clock: &Clock) {
        self.last_access_nanos.store(clock.now_nanos(), Ordering::Relaxed);
    }

    pub fn last_access_nanos(&self) -> u64 {
        self.last_access_nanos.load(Ordering::Relaxed)
    }

    /// Copies out `[offset, offset+len)` of the materialized buffer. Callers
    /// must ensure `offset+len <= range_end()` first.
    pub fn copy_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let buf = self.buffer.lock().unwrap();
        buf[offset..offset + len].to_vec()
    }

    /// Repeatedly calls the decompressor's `decompress_frame` with
    /// `frame_size` until the uncompressed buffer reaches `target_end`
    /// bytes or the block is fully materialized (spec.md §4.3). When the
    /// codec signals completion the decompressor is dropped and the
    /// compressed mapping range is released.
    pub fn decompress_until(
        &self,
        target_end: usize,
        frame_size: usize,
        source: &dyn FileView,
    ) -> Result<()> {
        let target_end = target_end.min(self.total_size);
        loop {
            if self.range_end() >= target_end {
                return Ok(());
            }
            let mut dec_guard = self.decompressor.lock().unwrap();
            let Some(dec) = dec_guard.as_mut() else {
                // Already fully materialized by a concurrent call.
                return Ok(());
            };
            let mut buf = self.buffer.lock().unwrap();
            let done = dec.decompress_frame(frame_size.max(1), &mut buf)?;
            self.range_end.store(buf.len(), Ordering::Release);
            if done {
                *dec_guard = None;
                drop(dec_guard);
                drop(buf);
                let (start, len) = self.compressed_range;
                let _ = source.release(start, len);
                tracing::debug!(block = self.block_no, "block fully materialized");
                return Ok(());
            }
        }
    }

    /// Best-effort probe for swapped-out pages backing the uncompressed
    /// buffer, used by the `BLOCK_SWAPPED_OUT` tidy strategy (spec.md §4.3,
    /// §4.4). There is no portable, dependency-free page-residency query;
    /// in the absence of one this conservatively reports full residency
    /// (never swapped out), so the swap-based tidy strategy degenerates to
    /// a no-op rather than evicting live data.
    pub fn any_pages_swapped_out(&self, _scratch: &mut [u8]) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_buffer::HeapFileView;
    use crate::compression::CodecRegistry;
    use crate::fstypes::{CompressionType, SectionType};
    use crate::section::SectionIterator;

    fn build_v2_block(payload: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(crate::section::MAGIC);
        header.push(crate::section::MAJOR_VERSION_V2);
        header.push(0);
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&[0u8; 32]);
        header.extend_from_slice(&(SectionType::Block as u16).to_le_bytes());
        header.extend_from_slice(&(CompressionType::None as u16).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u64).to_le_bytes());

        let mut buf = header.clone();
        buf.extend_from_slice(payload);

        let sha_span_start = 6 + 1 + 1;
        let sha =
            crate::checksum::sha512_256(&[&header[sha_span_start..], payload].concat());
        buf[sha_span_start + 16..sha_span_start + 16 + 32].copy_from_slice(&sha);

        let xxh3_span_start = sha_span_start + 8;
        let xxh3 = crate::checksum::xxh3_64(&[&buf[xxh3_span_start..header.len()], payload].concat());
        buf[sha_span_start + 8..sha_span_start + 16].copy_from_slice(&xxh3.to_le_bytes());
        buf
    }

    #[test]
    fn materializes_incrementally() {
        let registry = CodecRegistry::with_defaults();
        let data = b"0123456789".repeat(10);
        let image = build_v2_block(&data);
        let mut it = SectionIterator::open(&image, 0).unwrap();
        let section = it.next().unwrap().unwrap();
        let block = CachedBlock::new(0, &section, &image, &registry, true).unwrap();
        let view = HeapFileView::new(image.clone());
        block.decompress_until(50, 16, &view).unwrap();
        assert!(block.range_end() >= 50);
        assert!(!block.is_fully_materialized());
        block.decompress_until(data.len(), 16, &view).unwrap();
        assert!(block.is_fully_materialized());
        assert_eq!(block.copy_range(0, data.len()), data);
    }

    #[test]
    fn rejects_corrupt_block_with_checksum() {
        let registry = CodecRegistry::with_defaults();
        let data = b"hello world".to_vec();
        let mut image = build_v2_block(&data);
        let last = image.len() - 1;
        image[last] ^= 0xff;
        let mut it = SectionIterator::open(&image, 0).unwrap();
        let section = it.next().unwrap().unwrap();
        let result = CachedBlock::new(0, &section, &image, &registry, true);
        assert!(matches!(result, Err(Error::BlockChecksumMismatch(0))));
    }
}
