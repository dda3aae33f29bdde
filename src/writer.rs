// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem writer (spec.md §4.9): takes finalized blocks from the
//! segmenter, compresses them on a bounded worker pool, and emits v2
//! sections in submission order even though compression completes out of
//! order. Finishes with the schema/metadata/history/section-index sections.
//!
//! Grounded on the shared `worker_pool` idiom (spec.md §2.1 "Worker-group
//! test shape") for the compression pipeline, and on `cached_block.rs`'s
//! "verify once, store once" discipline for emitting a section exactly the
//! way the reader expects to parse it back.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, info, warn};

use crate::compression::{CategoryMetadata, Compressor, CodecRegistry, Constraints};
use crate::error::{Error, Result};
use crate::fstypes::{CompressionType, SectionType};
use crate::metadata::wire::{self, Schema};
use crate::metadata::{MetadataGraph, PackingOptions};
use crate::section::encode_v2_section;
use crate::segmenter::BlockSink;
use crate::worker_pool::WorkerPool;

/// Bounds the total size of uncompressed block data queued for compression
/// but not yet written out (spec.md §5 "bounded in-flight compression
/// queue").
struct Backpressure {
    bytes_in_flight: Mutex<usize>,
    max_bytes: usize,
    cv: Condvar,
}

impl Backpressure {
    fn new(max_bytes: usize) -> Self {
        Backpressure { bytes_in_flight: Mutex::new(0), max_bytes, cv: Condvar::new() }
    }

    fn acquire(&self, n: usize) {
        let mut guard = self.bytes_in_flight.lock().unwrap();
        while *guard > 0 && *guard + n > self.max_bytes {
            guard = self.cv.wait(guard).unwrap();
        }
        *guard += n;
    }

    fn release(&self, n: usize) {
        let mut guard = self.bytes_in_flight.lock().unwrap();
        *guard = guard.saturating_sub(n);
        self.cv.notify_all();
    }
}

#[derive(Clone, Debug)]
pub struct WriterOptions {
    pub num_workers: usize,
    pub queue_depth: usize,
    /// Caps total uncompressed bytes queued for compression at once.
    pub max_bytes_in_flight: usize,
    /// Compressor spec string (`"name:k=v"`, see `OptionMap`) used for
    /// blocks with no per-category override.
    pub default_compressor_spec: String,
    /// Per-category overrides, keyed by the scanner's category id.
    pub category_compressor_specs: HashMap<u32, String>,
    pub packing: PackingOptions,
    pub enable_nlink: bool,
    pub block_size_bits: u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            num_workers: 4,
            queue_depth: 32,
            max_bytes_in_flight: 256 * 1024 * 1024,
            default_compressor_spec: "none".to_string(),
            category_compressor_specs: HashMap::new(),
            packing: PackingOptions::default(),
            enable_nlink: false,
            block_size_bits: 22,
        }
    }
}

/// Compresses a block, falling back to uncompressed storage if the codec
/// reports [`Error::BadCompressionRatio`] (spec.md §4.9 "downgrade to
/// NONE").
fn compress_block(
    compressor: &dyn Compressor,
    data: &[u8],
    metadata: Option<&CategoryMetadata>,
) -> (CompressionType, Vec<u8>) {
    match compressor.compress(data, metadata) {
        Ok(out) => (compressor.compression_type(), out),
        Err(Error::BadCompressionRatio) => {
            warn!(bytes = data.len(), "compression ratio rejected, storing uncompressed");
            (CompressionType::None, data.to_vec())
        }
        Err(e) => {
            warn!(error = %e, "compressor failed, storing uncompressed");
            (CompressionType::None, data.to_vec())
        }
    }
}

struct PendingOutput {
    output: Vec<u8>,
    next_section_number: u64,
    next_block_to_write: u64,
    pending_blocks: BTreeMap<u64, (SectionType, CompressionType, Vec<u8>)>,
    section_index: Vec<(SectionType, u64)>,
}

impl PendingOutput {
    fn new() -> Self {
        PendingOutput {
            output: Vec::new(),
            next_section_number: 0,
            next_block_to_write: 0,
            pending_blocks: BTreeMap::new(),
            section_index: Vec::new(),
        }
    }

    fn write_section(&mut self, ty: SectionType, compression: CompressionType, payload: &[u8]) {
        let number = self.next_section_number;
        self.next_section_number += 1;
        let offset = self.output.len() as u64;
        self.output.extend_from_slice(&encode_v2_section(number, ty, compression, payload));
        self.section_index.push((ty, offset));
    }

    /// Drains any contiguously-ready blocks starting at `next_block_to_write`
    /// into the output, preserving submission order.
    fn drain_ready(&mut self) {
        while let Some((ty, compression, data)) = self.pending_blocks.remove(&self.next_block_to_write) {
            self.write_section(ty, compression, &data);
            self.next_block_to_write += 1;
        }
    }
}

/// Streams a DwarFS v2 image: accepts finalized blocks (as a [`BlockSink`]),
/// compressing each on a worker pool, then closes out with metadata and a
/// section index once the caller calls [`FilesystemWriter::finish`].
pub struct FilesystemWriter {
    options: WriterOptions,
    pool: WorkerPool,
    backpressure: Arc<Backpressure>,
    state: Arc<Mutex<PendingOutput>>,
    category_compressors: HashMap<u32, Arc<dyn Compressor>>,
    default_compressor: Arc<dyn Compressor>,
    category_constraints: HashMap<u32, Constraints>,
    default_constraints: Constraints,
    /// Count of blocks submitted but not yet drained into the output,
    /// so [`FilesystemWriter::flush`] can wait for in-flight compression
    /// jobs without reaching into the worker pool's internals.
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl FilesystemWriter {
    pub fn new(registry: Arc<CodecRegistry>, options: WriterOptions) -> Result<Self> {
        let default_compressor: Arc<dyn Compressor> =
            Arc::from(registry.make_compressor(&options.default_compressor_spec)?);
        let default_constraints = registry.factory_for_spec(&options.default_compressor_spec)?.constraints();
        let mut category_compressors = HashMap::new();
        let mut category_constraints = HashMap::new();
        for (category, spec) in &options.category_compressor_specs {
            category_compressors.insert(*category, Arc::from(registry.make_compressor(spec)?) as Arc<dyn Compressor>);
            category_constraints.insert(*category, registry.factory_for_spec(spec)?.constraints());
        }
        let pool = WorkerPool::new(options.num_workers, options.queue_depth, "dwarfs-writer");
        let backpressure = Arc::new(Backpressure::new(options.max_bytes_in_flight));
        Ok(FilesystemWriter {
            options,
            pool,
            backpressure,
            state: Arc::new(Mutex::new(PendingOutput::new())),
            category_compressors,
            default_compressor,
            category_constraints,
            default_constraints,
            in_flight: Arc::new((Mutex::new(0), Condvar::new())),
        })
    }

    /// Blocks until every block submitted so far has been compressed and
    /// drained into the output. Not required for correctness (`finish`
    /// drains whatever is ready), only for callers and tests that want a
    /// synchronization point.
    pub fn flush(&self) {
        let (lock, cv) = &*self.in_flight;
        let mut count = lock.lock().unwrap();
        while *count > 0 {
            count = cv.wait(count).unwrap();
        }
    }

    fn compressor_for(&self, category: Option<u32>) -> Arc<dyn Compressor> {
        category
            .and_then(|c| self.category_compressors.get(&c))
            .cloned()
            .unwrap_or_else(|| self.default_compressor.clone())
    }

    /// The byte-alignment granularity the category's chosen codec requires
    /// (spec.md §4.2 "Compression constraints"), for the caller to pass into
    /// [`crate::segmenter::Segmenter::add_fragment`].
    pub fn granularity_for(&self, category: Option<u32>) -> usize {
        category
            .and_then(|c| self.category_constraints.get(&c))
            .copied()
            .unwrap_or(self.default_constraints)
            .granularity
    }

    /// Serializes the built metadata graph, appending its schema and data
    /// sections (spec.md §4.9 "schema/metadata sections emitted after the
    /// final block").
    pub fn write_metadata(&self, graph: &MetadataGraph) -> Result<()> {
        let schema = Schema {
            packing: self.options.packing,
            enable_nlink: self.options.enable_nlink,
            block_size_bits: self.options.block_size_bits,
            boundaries: graph.boundaries(),
        };
        let schema_bytes = wire::encode_schema(&schema);
        let data_bytes = wire::encode_metadata(graph, &schema)?;

        let mut state = self.state.lock().unwrap();
        state.write_section(SectionType::MetadataV2Schema, CompressionType::None, &schema_bytes);
        state.write_section(SectionType::MetadataV2, CompressionType::None, &data_bytes);
        Ok(())
    }

    /// Appends a `HISTORY` section recording one build event, formatted as a
    /// sequence of newline-terminated `key=value` records (no JSON dependency
    /// in this build's stack; see DESIGN.md).
    pub fn write_history(&self, entries: &[(&str, &str)]) {
        let mut record = String::new();
        for (k, v) in entries {
            record.push_str(k);
            record.push('=');
            record.push_str(v);
            record.push('\n');
        }
        let mut state = self.state.lock().unwrap();
        state.write_section(SectionType::History, CompressionType::None, record.as_bytes());
    }

    /// Appends the section index and returns the finished image bytes.
    /// Consumes `self` since nothing more can be written afterward.
    pub fn finish(self) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        state.drain_ready();
        if !state.pending_blocks.is_empty() {
            warn!(count = state.pending_blocks.len(), "finishing with blocks never drained (gap in block numbering)");
        }
        let index_payload: Vec<u8> = state
            .section_index
            .iter()
            .flat_map(|(ty, offset)| crate::fstypes::pack_section_index_entry(*ty, *offset).to_le_bytes())
            .collect();
        state.write_section(SectionType::SectionIndex, CompressionType::None, &index_payload);
        info!(bytes = state.output.len(), "filesystem image finalized");
        std::mem::take(&mut state.output)
    }
}

impl BlockSink for FilesystemWriter {
    /// Queues a block for compression, blocking (backpressure) if too many
    /// uncompressed bytes are already in flight. Compression runs on the
    /// worker pool; results are stitched into submission order in
    /// [`PendingOutput::drain_ready`] as each job completes.
    fn submit_block(&self, block_no: u64, category: Option<u32>, data: Vec<u8>) {
        let len = data.len();
        self.backpressure.acquire(len);
        debug!(block_no, category = ?category, bytes = len, "queued block for compression");
        *self.in_flight.0.lock().unwrap() += 1;

        let compressor = self.compressor_for(category);
        let state = self.state.clone();
        let backpressure = self.backpressure.clone();
        let in_flight = self.in_flight.clone();
        self.pool.submit(move || {
            let (compression, compressed) = compress_block(compressor.as_ref(), &data, None);
            backpressure.release(len);
            {
                let mut guard = state.lock().unwrap();
                guard.pending_blocks.insert(block_no, (SectionType::Block, compression, compressed));
                guard.drain_ready();
            }
            let (lock, cv) = &*in_flight;
            *lock.lock().unwrap() -= 1;
            cv.notify_all();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstypes::CompressionType as Ct;
    use crate::section::SectionIterator;

    #[test]
    fn writes_blocks_in_order_despite_async_completion() {
        let registry = Arc::new(CodecRegistry::with_defaults());
        let writer = FilesystemWriter::new(registry, WriterOptions::default()).unwrap();

        // Submit out of the eventual worker-completion order is simulated by
        // having more blocks than workers so some necessarily finish later;
        // regardless, drain_ready must only release them in block_no order.
        for i in 0..8u64 {
            let payload = vec![i as u8; 100];
            writer.submit_block(i, None, payload);
        }
        writer.flush();

        let image = writer.finish();
        let mut it = SectionIterator::open(&image, 0).unwrap();
        let mut numbers = Vec::new();
        while let Some(section) = it.next() {
            let section = section.unwrap();
            numbers.push(section.number);
        }
        let sorted = {
            let mut s = numbers.clone();
            s.sort();
            s
        };
        assert_eq!(numbers, sorted, "section numbers must be monotonically increasing in the output");
    }

    #[test]
    fn falls_back_to_none_on_bad_ratio() {
        struct AlwaysRejects;
        impl Compressor for AlwaysRejects {
            fn compression_type(&self) -> CompressionType {
                Ct::Lzma
            }
            fn compress(&self, _input: &[u8], _metadata: Option<&CategoryMetadata>) -> Result<Vec<u8>> {
                Err(Error::BadCompressionRatio)
            }
        }
        let (ty, data) = compress_block(&AlwaysRejects, b"abcdef", None);
        assert_eq!(ty, Ct::None);
        assert_eq!(data, b"abcdef");
    }
}
