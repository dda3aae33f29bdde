// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The chunked inode reader (spec.md §4.5): maps `(inode, offset, size)`
//! into an ordered sequence of block-range futures, assembles them, and
//! implements readahead.
//!
//! Grounded on the walk-the-block-list loop `Inode::read`/`bmap` takes
//! through direct and indirect block pointers: here the "block list" is an
//! inode's chunk run, and each step is a `BlockCache::get` instead of a
//! fragment copy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::cache::block_cache::{BlockCache, BlockRangeFuture};
use crate::error::{Error, Result};
use crate::fstypes::Chunk;

/// `resolve_chunks(inode) -> span of chunk` (spec.md §4.5): anything that
/// can hand back an inode's chunk run. Implemented by the metadata layer;
/// kept as a trait here so the reader doesn't depend on metadata's storage
/// representation. Returns an `Arc` slice rather than a borrow so sources
/// backed by a lock (or computed packings) don't need unsafe lifetime
/// extension to implement it.
pub trait ChunkSource: Send + Sync {
    fn chunks(&self, inode: u32) -> Result<Arc<[Chunk]>>;
}

#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Byte window of readahead issued (non-waited) past every read.
    pub readahead: usize,
    /// Inodes whose chunk count exceeds this get their total size memoized.
    pub size_cache_threshold: usize,
    /// Caps the number of iovecs `readv` will produce before returning a
    /// short scatter/gather list.
    pub max_iov: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions { readahead: 256 * 1024, size_cache_threshold: 16, max_iov: 1024 }
    }
}

/// One planned `(block, sub_off, sub_size)` step of a chunk-run walk.
struct PlannedGet {
    block: u64,
    sub_off: usize,
    sub_size: usize,
}

/// Walks an inode's chunk run and slices out `[off, off+size)`, following
/// the "subtract leading whole chunks, then sub_off/sub_size per remaining
/// chunk" algorithm in spec.md §4.5.
fn plan_reads(chunks: &[Chunk], mut off: usize, mut remaining: usize) -> Vec<PlannedGet> {
    let mut plan = Vec::new();
    let mut idx = 0;
    while idx < chunks.len() && off >= chunks[idx].size as usize {
        off -= chunks[idx].size as usize;
        idx += 1;
    }
    while idx < chunks.len() && remaining > 0 {
        let chunk = &chunks[idx];
        let within = off;
        off = 0;
        let sub_off = chunk.offset as usize + within;
        let avail = chunk.size as usize - within;
        let sub_size = remaining.min(avail);
        plan.push(PlannedGet { block: chunk.block, sub_off, sub_size });
        remaining -= sub_size;
        idx += 1;
    }
    plan
}

/// Per-inode memoized total size, populated lazily once an inode's chunk
/// count crosses `size_cache_threshold` (spec.md §4.5 "Inode size cache").
struct SizeCache {
    threshold: usize,
    cache: RwLock<HashMap<u32, u64>>,
}

impl SizeCache {
    fn new(threshold: usize) -> Self {
        SizeCache { threshold, cache: RwLock::new(HashMap::new()) }
    }

    fn size(&self, inode: u32, chunks: &Arc<[Chunk]>) -> u64 {
        if chunks.len() <= self.threshold {
            return chunks.iter().map(|c| c.size as u64).sum();
        }
        if let Some(&cached) = self.cache.read().get(&inode) {
            return cached;
        }
        let total: u64 = chunks.iter().map(|c| c.size as u64).sum();
        self.cache.write().insert(inode, total);
        total
    }
}

/// One scatter/gather segment of a `readv` result.
pub struct IoVec {
    pub future: BlockRangeFuture,
}

/// Converts `(inode, offset, size)` into block-range futures and assembles
/// reads (spec.md §4.5). Cheap to clone; shares the underlying block cache
/// and chunk source.
pub struct InodeReader<S: ChunkSource> {
    cache: BlockCache,
    chunks: S,
    options: ReaderOptions,
    sizes: SizeCache,
    readahead_epoch: AtomicU64,
}

impl<S: ChunkSource> InodeReader<S> {
    pub fn new(cache: BlockCache, chunks: S, options: ReaderOptions) -> Self {
        InodeReader {
            cache,
            chunks,
            sizes: SizeCache::new(options.size_cache_threshold),
            options,
            readahead_epoch: AtomicU64::new(0),
        }
    }

    /// `getattr`'s `size` field, O(1) once memoized (spec.md §4.5).
    pub fn inode_size(&self, inode: u32) -> Result<u64> {
        let chunks = self.chunks.chunks(inode)?;
        Ok(self.sizes.size(inode, &chunks))
    }

    /// Buffered copy into `buf`, awaiting each future in submission order.
    pub fn read(&self, inode: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let futures = self.readv_future(inode, offset, buf.len())?;
        let mut written = 0;
        for f in futures {
            let range = f.future.wait()?;
            let data = range.data();
            buf[written..written + data.len()].copy_from_slice(&data);
            written += data.len();
        }
        self.issue_readahead(inode, offset, buf.len());
        Ok(written)
    }

    /// Scatter/gather variant: returns futures the caller resolves itself.
    /// Truncates to `max_iov` segments, which manifests as a short read if
    /// the caller sums up fewer bytes than requested.
    pub fn readv(&self, inode: u32, offset: u64, size: usize) -> Result<Vec<IoVec>> {
        let futures = self.readv_future(inode, offset, size)?;
        Ok(futures
            .into_iter()
            .take(self.options.max_iov)
            .map(|f| IoVec { future: f.future })
            .collect())
    }

    /// Plans and dispatches the chunk-run walk described in spec.md §4.5,
    /// returning one future per planned block-range `get`.
    pub fn readv_future(&self, inode: u32, offset: u64, size: usize) -> Result<Vec<PendingRange>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let chunks = self.chunks.chunks(inode)?;
        let plan = plan_reads(&chunks, offset as usize, size);
        let mut out = Vec::with_capacity(plan.len());
        for step in plan {
            let future = self.cache.get(step.block, step.sub_off, step.sub_size)?;
            out.push(PendingRange { future });
        }
        Ok(out)
    }

    /// Issues a non-waited `get` covering the next `readahead` bytes past
    /// this read's end (spec.md §4.5 "Readahead"). Errors are swallowed:
    /// readahead is an optimization, never load-bearing for correctness.
    fn issue_readahead(&self, inode: u32, offset: u64, size: usize) {
        if self.options.readahead == 0 {
            return;
        }
        self.readahead_epoch.fetch_add(1, Ordering::Relaxed);
        let Ok(chunks) = self.chunks.chunks(inode) else { return };
        let ahead_off = offset as usize + size;
        let plan = plan_reads(&chunks, ahead_off, self.options.readahead);
        for step in plan {
            let _ = self.cache.get(step.block, step.sub_off, step.sub_size);
        }
    }
}

pub struct PendingRange {
    pub future: BlockRangeFuture,
}

impl PendingRange {
    pub fn wait_into(self, out: &mut Vec<u8>) -> Result<()> {
        let range = self.future.wait()?;
        out.extend_from_slice(&range.data());
        Ok(())
    }
}

/// A trivial in-memory [`ChunkSource`] for tests and small embedded images.
pub struct StaticChunkSource {
    table: RwLock<HashMap<u32, Arc<[Chunk]>>>,
}

impl StaticChunkSource {
    pub fn new() -> Self {
        StaticChunkSource { table: RwLock::new(HashMap::new()) }
    }

    pub fn insert(&self, inode: u32, chunks: Vec<Chunk>) {
        self.table.write().insert(inode, chunks.into());
    }
}

impl Default for StaticChunkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkSource for StaticChunkSource {
    fn chunks(&self, inode: u32) -> Result<Arc<[Chunk]>> {
        self.table.read().get(&inode).cloned().ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_buffer::HeapFileView;
    use crate::cache::block_cache::BlockCacheOptions;
    use crate::compression::CodecRegistry;
    use crate::fstypes::{CompressionType, SectionType};
    use crate::section::SectionIterator;
    use std::collections::HashMap as StdHashMap;

    fn build_v2_block(number: u64, payload: &[u8]) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(crate::section::MAGIC);
        header.push(crate::section::MAJOR_VERSION_V2);
        header.push(0);
        header.extend_from_slice(&number.to_le_bytes());
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&[0u8; 32]);
        header.extend_from_slice(&(SectionType::Block as u16).to_le_bytes());
        header.extend_from_slice(&(CompressionType::None as u16).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u64).to_le_bytes());

        let mut buf = header.clone();
        buf.extend_from_slice(payload);
        let sha_span_start = 6 + 1 + 1;
        let sha = crate::checksum::sha512_256(&[&header[sha_span_start..], payload].concat());
        buf[sha_span_start + 16..sha_span_start + 16 + 32].copy_from_slice(&sha);
        let xxh3_span_start = sha_span_start + 8;
        let xxh3 = crate::checksum::xxh3_64(&[&buf[xxh3_span_start..header.len()], payload].concat());
        buf[sha_span_start + 8..sha_span_start + 16].copy_from_slice(&xxh3.to_le_bytes());
        buf
    }

    /// Two blocks back-to-back, each independently v2-framed, concatenated
    /// into one image.
    fn two_block_image(a: &[u8], b: &[u8]) -> (Vec<u8>, StdHashMap<u64, Arc<crate::section::FsSection>>) {
        let mut image = build_v2_block(0, a);
        image.extend_from_slice(&build_v2_block(1, b));

        let mut sections = StdHashMap::new();
        let it = SectionIterator::open(&image, 0).unwrap();
        for section in it {
            let section = section.unwrap();
            sections.insert(section.number, Arc::new(section));
        }
        (image, sections)
    }

    #[test]
    fn read_spans_two_chunks_across_blocks() {
        let a = b"0123456789".repeat(4); // 40 bytes, block 0
        let b = b"abcdefghij".repeat(4); // 40 bytes, block 1
        let (image, sections) = two_block_image(&a, &b);
        let cache = BlockCache::new(
            Arc::new(CodecRegistry::with_defaults()),
            Arc::new(HeapFileView::new(image)),
            sections,
            BlockCacheOptions::default(),
        );
        let chunks = StaticChunkSource::new();
        chunks.insert(
            7,
            vec![
                Chunk { block: 0, offset: 10, size: 20 }, // a[10..30]
                Chunk { block: 1, offset: 0, size: 15 },  // b[0..15]
            ],
        );
        let reader = InodeReader::new(cache, chunks, ReaderOptions::default());
        assert_eq!(reader.inode_size(7).unwrap(), 35);

        let mut buf = vec![0u8; 35];
        let n = reader.read(7, 0, &mut buf).unwrap();
        assert_eq!(n, 35);
        let mut expected = a[10..30].to_vec();
        expected.extend_from_slice(&b[0..15]);
        assert_eq!(buf, expected);
    }

    #[test]
    fn plan_reads_skips_leading_whole_chunks() {
        let chunks = vec![
            Chunk { block: 0, offset: 0, size: 10 },
            Chunk { block: 1, offset: 0, size: 10 },
            Chunk { block: 2, offset: 0, size: 10 },
        ];
        let plan = plan_reads(&chunks, 12, 5);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].block, 1);
        assert_eq!(plan[0].sub_off, 2);
        assert_eq!(plan[0].sub_size, 5);
    }
}
