// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content-defined segmentation (spec.md §4.8): turns a stream of file
//! fragments into a sequence of chunks, deduplicating byte ranges against a
//! bounded ring of recently-written "active" blocks instead of only against
//! whole files.
//!
//! Grounded on the cyclic-polynomial rolling hash described in spec.md §9
//! ("content-defined chunking") and on `fragment_chunkable.cpp`'s
//! fragment-as-unit-of-work shape (a fragment is scanned start to end,
//! emitting chunks as it goes, releasing the source mmap range behind it as
//! it's consumed).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fstypes::Chunk;

fn round_up(x: usize, granularity: usize) -> usize {
    if granularity <= 1 {
        return x;
    }
    x.div_ceil(granularity) * granularity
}

fn round_down(x: usize, granularity: usize) -> usize {
    if granularity <= 1 {
        return x;
    }
    (x / granularity) * granularity
}

/// A 256-entry random permutation table, generated once from a fixed seed so
/// every segmenter instance in a process chunks identically.
fn hash_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut state = 0x9E3779B97F4A7C15u64;
    for slot in table.iter_mut() {
        // splitmix64
        state = state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        *slot = z ^ (z >> 31);
    }
    table
}

/// Cyclic-polynomial (buzhash) rolling hash over a fixed-size window.
struct RollingHash {
    table: [u64; 256],
    window: VecDeque<u8>,
    window_size: usize,
    h: u64,
}

impl RollingHash {
    fn new(window_size: usize) -> Self {
        RollingHash { table: hash_table(), window: VecDeque::with_capacity(window_size), window_size, h: 0 }
    }

    fn rotl(v: u64, n: u32) -> u64 {
        v.rotate_left(n % 64)
    }

    /// Feeds one byte; returns `true` once the window is full (the hash is
    /// meaningful from that point on).
    fn push(&mut self, byte: u8) -> bool {
        if self.window.len() == self.window_size {
            let x = self.window.pop_front().unwrap();
            self.h = Self::rotl(self.h, 1) ^ Self::rotl(self.table[x as usize], self.window_size as u32) ^ self.table[byte as usize];
        } else {
            self.h = Self::rotl(self.h, 1) ^ self.table[byte as usize];
        }
        self.window.push_back(byte);
        self.window.len() == self.window_size
    }

    fn value(&self) -> u64 {
        self.h
    }
}

/// A small bit-array membership filter guarding the (comparatively
/// expensive) exact fingerprint lookup.
struct BloomFilter {
    bits: Vec<u64>,
    mask: u64,
}

impl BloomFilter {
    fn new(num_bits: u32) -> Self {
        let words = (1usize << num_bits.max(6)) / 64;
        BloomFilter { bits: vec![0u64; words.max(1)], mask: (words.max(1) * 64) as u64 - 1 }
    }

    fn slot(&self, h: u64, seed: u64) -> (usize, u64) {
        let mixed = h.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(seed) & self.mask;
        ((mixed / 64) as usize, 1u64 << (mixed % 64))
    }

    fn insert(&mut self, h: u64) {
        for seed in [0u64, 0x1234_5678] {
            let (word, bit) = self.slot(h, seed);
            self.bits[word] |= bit;
        }
    }

    fn maybe_contains(&self, h: u64) -> bool {
        [0u64, 0x1234_5678].iter().all(|&seed| {
            let (word, bit) = self.slot(h, seed);
            self.bits[word] & bit != 0
        })
    }
}

/// Receives finalized blocks as the segmenter fills them (spec.md §4.8,
/// §4.9 — the filesystem writer implements this to queue blocks for
/// compression and section emission).
pub trait BlockSink: Send + Sync {
    fn submit_block(&self, block_no: u64, category: Option<u32>, data: Vec<u8>);
}

#[derive(Clone, Copy, Debug)]
pub struct SegmenterOptions {
    /// Rolling-hash window size in bytes.
    pub window_size: usize,
    /// Target size of a finalized block, before compression.
    pub target_block_size: usize,
    /// How many recently-finalized blocks per category remain eligible as
    /// dedup match targets.
    pub max_active_blocks: usize,
    /// A match shorter than this is not worth the chunk-table entry it would
    /// cost; emitted as a literal instead.
    pub min_match_size: usize,
    /// log2 of the bloom filter's bit-array size.
    pub bloom_bits: u32,
}

impl Default for SegmenterOptions {
    fn default() -> Self {
        SegmenterOptions {
            window_size: 64,
            target_block_size: 1 << 22, // 4 MiB
            max_active_blocks: 4,
            min_match_size: 64,
            bloom_bits: 20,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SegmenterStats {
    pub bytes_scanned: u64,
    /// Bytes covered by a chunk that references an already-written block
    /// rather than appending to a new one.
    pub bytes_deduped: u64,
    pub blocks_emitted: u64,
}

/// A match still open at the end of a fragment because the fragment ran out
/// of bytes before a mismatch did (spec.md §4.8 "tail-match extension"): the
/// next fragment submitted for this category gets a chance to extend it
/// before anything else is scanned.
#[derive(Clone, Copy, Debug)]
struct PendingTail {
    block_no: u64,
    next_offset: usize,
}

/// Per-category state: one growing "current" block plus a ring of finalized
/// blocks still eligible as match targets. Categories never share a block
/// (spec.md §4.8 "category isolation"), but block numbers are drawn from one
/// counter shared across all categories so chunk references stay globally
/// unambiguous.
struct CategoryState {
    current_block_no: u64,
    current_data: Vec<u8>,
    ring: VecDeque<u64>,
    blocks: HashMap<u64, Arc<Vec<u8>>>,
    fp_index: HashMap<u64, Vec<(u64, usize)>>,
    bloom: BloomFilter,
    pending_tail: Option<PendingTail>,
}

impl CategoryState {
    fn new(first_block_no: u64, options: &SegmenterOptions) -> Self {
        CategoryState {
            current_block_no: first_block_no,
            current_data: Vec::with_capacity(options.target_block_size),
            ring: VecDeque::new(),
            blocks: HashMap::new(),
            fp_index: HashMap::new(),
            bloom: BloomFilter::new(options.bloom_bits),
            pending_tail: None,
        }
    }
}

pub struct Segmenter<B: BlockSink> {
    options: SegmenterOptions,
    sink: Arc<B>,
    next_block_no: Arc<AtomicU64>,
    categories: Mutex<HashMap<Option<u32>, CategoryState>>,
    stats: Mutex<SegmenterStats>,
}

impl<B: BlockSink> Segmenter<B> {
    pub fn new(sink: Arc<B>, options: SegmenterOptions) -> Self {
        Segmenter {
            options,
            sink,
            next_block_no: Arc::new(AtomicU64::new(0)),
            categories: Mutex::new(HashMap::new()),
            stats: Mutex::new(SegmenterStats::default()),
        }
    }

    pub fn stats(&self) -> SegmenterStats {
        *self.stats.lock()
    }

    /// Finalizes whatever partial block is still open in every category,
    /// flushing it to the sink. Call once after the last fragment.
    pub fn finish(&self) {
        let mut categories = self.categories.lock();
        for (category, state) in categories.iter_mut() {
            if !state.current_data.is_empty() {
                Self::finalize_current(&self.sink, &self.next_block_no, &self.options, &mut self.stats.lock(), *category, state);
            }
        }
    }

    /// Scans one fragment's bytes, emitting the chunk list that reconstructs
    /// it, deduplicating against the category's active blocks.
    ///
    /// `granularity` is the codec's alignment requirement for this category
    /// (spec.md §4.2 "Compression constraints", §4.8 item 4): every chunk
    /// boundary this call produces is snapped to a multiple of it, measured
    /// from the start of the fragment. A fragment at least as long as
    /// `granularity` must itself be a whole multiple of it, or no boundary
    /// placement could satisfy both the snap and cover every byte; a
    /// fragment shorter than `granularity` has no boundary to snap and comes
    /// out as a single chunk regardless of its length.
    pub fn add_fragment(&self, category: Option<u32>, data: &[u8], granularity: usize) -> Result<Vec<Chunk>> {
        if granularity > 1 && data.len() >= granularity && data.len() % granularity != 0 {
            return Err(Error::UnsatisfiableGranularity { granularity, fragment_size: data.len() });
        }

        let mut categories = self.categories.lock();
        let state = categories.entry(category).or_insert_with(|| {
            let no = self.next_block_no.fetch_add(1, Ordering::SeqCst);
            CategoryState::new(no, &self.options)
        });
        let mut stats = self.stats.lock();
        stats.bytes_scanned += data.len() as u64;

        let mut chunks = Vec::new();
        let mut pos = 0usize;

        // Try to extend a match left open by the previous fragment in this
        // category before scanning anything new (spec.md §4.8 item 1).
        if let Some(tail) = state.pending_tail.take() {
            if let Some(block) = state.blocks.get(&tail.block_no) {
                let mut raw_len = 0usize;
                while tail.next_offset + raw_len < block.len()
                    && raw_len < data.len()
                    && data[raw_len] == block[tail.next_offset + raw_len]
                {
                    raw_len += 1;
                }
                let aligned_len = round_down(raw_len, granularity);
                if aligned_len > 0 {
                    chunks.push(Chunk { block: tail.block_no, offset: tail.next_offset as u64, size: aligned_len as u64 });
                    stats.bytes_deduped += aligned_len as u64;
                    pos = aligned_len;
                    if aligned_len == raw_len && raw_len == data.len() && tail.next_offset + raw_len < block.len() {
                        state.pending_tail = Some(PendingTail { block_no: tail.block_no, next_offset: tail.next_offset + raw_len });
                    }
                }
            }
        }

        let mut literal_start = pos;
        let mut hasher = RollingHash::new(self.options.window_size.min((data.len() - pos).max(1)));
        let boundary_mask = (1u64 << 6) - 1; // average ~64-byte granule between lookups

        while pos < data.len() {
            let full = hasher.push(data[pos]);
            pos += 1;
            if !full || hasher.value() & boundary_mask != 0 {
                continue;
            }
            let window_start = pos - self.options.window_size.min(pos);
            let Some((src_block, src_off, raw_match_len, hit_fragment_end)) =
                Self::find_and_extend_match(state, data, window_start, self.options.min_match_size)
            else {
                continue;
            };

            let aligned_start = round_up(window_start, granularity);
            let aligned_end = round_down(window_start + raw_match_len, granularity);
            if aligned_end <= aligned_start {
                continue; // doesn't survive granularity snapping
            }

            // Flush the literal bytes preceding the match into the current block.
            if aligned_start > literal_start {
                Self::append_literal(&self.sink, &self.next_block_no, &self.options, &mut stats, category, state, &mut chunks, &data[literal_start..aligned_start], granularity);
            }
            let shift = aligned_start - window_start;
            let size = aligned_end - aligned_start;
            chunks.push(Chunk { block: src_block, offset: (src_off + shift) as u64, size: size as u64 });
            stats.bytes_deduped += size as u64;
            pos = aligned_end;
            literal_start = pos;
            if hit_fragment_end && aligned_end == window_start + raw_match_len {
                state.pending_tail = Some(PendingTail { block_no: src_block, next_offset: src_off + raw_match_len });
            }
            hasher = RollingHash::new(self.options.window_size.min((data.len() - pos).max(1)));
        }

        if literal_start < data.len() {
            Self::append_literal(&self.sink, &self.next_block_no, &self.options, &mut stats, category, state, &mut chunks, &data[literal_start..], granularity);
        }
        Ok(chunks)
    }

    /// Looks for `data[window_start..]`'s current rolling-hash window inside
    /// any active block of this category, then greedily extends the match
    /// forward byte-by-byte ("tail-match extension", spec.md §4.8) as long
    /// as source and target agree. The returned flag is `true` when the
    /// extension stopped because the fragment ran out of bytes rather than
    /// because of a mismatch or the end of the source block, so the caller
    /// knows whether a later fragment might continue it.
    fn find_and_extend_match(
        state: &CategoryState,
        data: &[u8],
        window_start: usize,
        min_match_size: usize,
    ) -> Option<(u64, usize, usize, bool)> {
        let window_end = data.len().min(window_start + 64).max(window_start);
        let window = &data[window_start..window_end];
        if window.is_empty() {
            return None;
        }
        let key = fingerprint(window);
        if !state.bloom.maybe_contains(key) {
            return None;
        }
        let candidates = state.fp_index.get(&key)?;
        for &(block_no, offset) in candidates {
            let block = state.blocks.get(&block_no)?;
            if offset + window.len() > block.len() || &block[offset..offset + window.len()] != window {
                continue;
            }
            let mut len = window.len();
            let mut hit_fragment_end = false;
            loop {
                if offset + len >= block.len() {
                    break;
                }
                if window_start + len >= data.len() {
                    hit_fragment_end = true;
                    break;
                }
                if data[window_start + len] != block[offset + len] {
                    break;
                }
                len += 1;
            }
            if len >= min_match_size {
                return Some((block_no, offset, len, hit_fragment_end));
            }
        }
        None
    }

    /// Appends bytes to the category's growing block, recording fingerprints
    /// for future dedup and rolling the block over once it reaches the
    /// target size. `bytes`'s length is always a whole multiple of
    /// `granularity` on entry; block-size rollover splits are snapped the
    /// same way so a granule never straddles a block boundary.
    #[allow(clippy::too_many_arguments)]
    fn append_literal(
        sink: &Arc<B>,
        next_block_no: &Arc<AtomicU64>,
        options: &SegmenterOptions,
        stats: &mut SegmenterStats,
        category: Option<u32>,
        state: &mut CategoryState,
        chunks: &mut Vec<Chunk>,
        bytes: &[u8],
        granularity: usize,
    ) {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let room = options.target_block_size - state.current_data.len();
            let mut take = remaining.len().min(room.max(1));
            if granularity > 1 && take < remaining.len() {
                let snapped = round_down(take, granularity);
                if snapped == 0 {
                    // No room left for even one granule: close this block out
                    // early so the next one starts with a full target size.
                    Self::finalize_current(sink, next_block_no, options, stats, category, state);
                    continue;
                }
                take = snapped;
            }
            let start_off = state.current_data.len();
            state.current_data.extend_from_slice(&remaining[..take]);
            chunks.push(Chunk { block: state.current_block_no, offset: start_off as u64, size: take as u64 });
            remaining = &remaining[take..];

            if state.current_data.len() >= options.target_block_size {
                Self::finalize_current(sink, next_block_no, options, stats, category, state);
            }
        }
    }

    fn finalize_current(
        sink: &Arc<B>,
        next_block_no: &Arc<AtomicU64>,
        options: &SegmenterOptions,
        stats: &mut SegmenterStats,
        category: Option<u32>,
        state: &mut CategoryState,
    ) {
        let block_no = state.current_block_no;
        let data = std::mem::take(&mut state.current_data);

        // Index fingerprints of this block before handing it to the sink so
        // later fragments in the same category can match against it.
        let mut offset = 0;
        while offset + 64 <= data.len() {
            let key = fingerprint(&data[offset..offset + 64]);
            state.fp_index.entry(key).or_default().push((block_no, offset));
            state.bloom.insert(key);
            offset += 64;
        }
        state.blocks.insert(block_no, Arc::new(data.clone()));
        state.ring.push_back(block_no);
        while state.ring.len() > options.max_active_blocks {
            if let Some(evicted) = state.ring.pop_front() {
                state.blocks.remove(&evicted);
            }
        }

        stats.blocks_emitted += 1;
        sink.submit_block(block_no, category, data);

        state.current_block_no = next_block_no.fetch_add(1, Ordering::SeqCst);
    }
}

fn fingerprint(bytes: &[u8]) -> u64 {
    crate::checksum::xxh3_64(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        blocks: StdMutex<Vec<(u64, Option<u32>, Vec<u8>)>>,
    }

    impl CollectingSink {
        fn new() -> Self {
            CollectingSink { blocks: StdMutex::new(Vec::new()) }
        }
    }

    impl BlockSink for CollectingSink {
        fn submit_block(&self, block_no: u64, category: Option<u32>, data: Vec<u8>) {
            self.blocks.lock().unwrap().push((block_no, category, data));
        }
    }

    fn reconstruct(sealed: &[(u64, Option<u32>, Vec<u8>)], current: Option<&[u8]>, current_no: u64, chunks: &[Chunk]) -> Vec<u8> {
        let mut out = Vec::new();
        for c in chunks {
            let src: &[u8] = if c.block == current_no {
                current.expect("current block referenced but not supplied")
            } else {
                &sealed.iter().find(|(no, _, _)| *no == c.block).expect("unknown block").2
            };
            out.extend_from_slice(&src[c.offset as usize..c.offset as usize + c.size as usize]);
        }
        out
    }

    #[test]
    fn literal_fragment_reconstructs_byte_for_byte() {
        let sink = Arc::new(CollectingSink::new());
        let seg = Segmenter::new(sink.clone(), SegmenterOptions::default());
        let data = b"hello world, this is a short fragment with no repeats here".to_vec();
        let chunks = seg.add_fragment(None, &data, 1).unwrap();
        seg.finish();
        let sealed = sink.blocks.lock().unwrap();
        let rebuilt = reconstruct(&sealed, None, u64::MAX, &chunks);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn identical_second_fragment_dedups_against_the_first() {
        let sink = Arc::new(CollectingSink::new());
        let options = SegmenterOptions { min_match_size: 32, ..SegmenterOptions::default() };
        let seg = Segmenter::new(sink.clone(), options);
        let data = b"the quick brown fox jumps over the lazy dog, repeated content block here for matching purposes and more".to_vec();

        let chunks_a = seg.add_fragment(None, &data, 1).unwrap();
        let chunks_b = seg.add_fragment(None, &data, 1).unwrap();
        seg.finish();

        let stats = seg.stats();
        assert!(stats.bytes_deduped > 0, "second identical fragment should have matched the first");
        assert!(!chunks_a.is_empty());
        assert!(chunks_b.iter().any(|c| c.block != chunks_a.last().unwrap().block || c.offset != 0));
    }

    #[test]
    fn large_fragment_spans_multiple_blocks() {
        let sink = Arc::new(CollectingSink::new());
        let options = SegmenterOptions { target_block_size: 256, ..SegmenterOptions::default() };
        let seg = Segmenter::new(sink.clone(), options);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let chunks = seg.add_fragment(None, &data, 1).unwrap();
        seg.finish();

        let sealed = sink.blocks.lock().unwrap();
        assert!(sealed.len() >= 7, "2000 bytes at a 256-byte target should span several blocks");
        let rebuilt = reconstruct(&sealed, None, u64::MAX, &chunks);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn fragment_size_not_a_multiple_of_granularity_is_rejected() {
        let sink = Arc::new(CollectingSink::new());
        let seg = Segmenter::new(sink, SegmenterOptions::default());
        let data = vec![0u8; 9];
        let err = seg.add_fragment(None, &data, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsatisfiableGranularity { granularity: 2, fragment_size: 9 }
        ));
    }

    #[test]
    fn fragment_shorter_than_granularity_is_exempt() {
        let sink = Arc::new(CollectingSink::new());
        let seg = Segmenter::new(sink.clone(), SegmenterOptions::default());
        let data = vec![7u8; 3];
        let chunks = seg.add_fragment(None, &data, 8).unwrap();
        seg.finish();
        let sealed = sink.blocks.lock().unwrap();
        let rebuilt = reconstruct(&sealed, None, u64::MAX, &chunks);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn matched_span_is_snapped_to_granularity() {
        let sink = Arc::new(CollectingSink::new());
        let options = SegmenterOptions { min_match_size: 16, ..SegmenterOptions::default() };
        let seg = Segmenter::new(sink.clone(), options);
        let data: Vec<u8> = (0..64u32).map(|i| (i % 17) as u8).collect();

        seg.add_fragment(None, &data, 4).unwrap();
        let chunks = seg.add_fragment(None, &data, 4).unwrap();
        seg.finish();

        for c in &chunks {
            assert_eq!(c.offset % 4, 0, "match offset must be granularity-aligned");
            assert_eq!(c.size % 4, 0, "match size must be granularity-aligned");
        }
        let sealed = sink.blocks.lock().unwrap();
        let rebuilt = reconstruct(&sealed, None, u64::MAX, &chunks);
        assert_eq!(rebuilt, data);
    }
}
