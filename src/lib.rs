// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `dwarfs-core`: a read-optimized, deduplicating, compressed archive
//! filesystem (spec.md §0 overview).
//!
//! A filesystem image is a sequence of self-describing sections (see
//! [`section`]) holding compressed data blocks (see [`compression`] and
//! [`cache`]) plus one packed metadata graph (see [`metadata`]) describing
//! the directory tree and how each file's content maps onto chunks of
//! those blocks (see [`fstypes::Chunk`]).
//!
//! Building an image runs the pipeline in the other direction: the
//! [`scanner`] walks a source tree and dedupes whole-file content, the
//! [`segmenter`] further dedupes byte ranges across files into blocks, and
//! the [`writer`] compresses and frames those blocks plus the metadata
//! graph into sections. Reading an image mmaps it (see [`mmap`]), iterates
//! its sections (see [`section::SectionIterator`]), and answers mount-facing
//! operations (see [`filesystem`]) by walking the metadata graph and
//! fetching chunks through the block cache.

pub mod byte_buffer;
pub mod cache;
pub mod checksum;
pub mod compression;
pub mod error;
pub mod filesystem;
pub mod fstypes;
pub mod metadata;
pub mod mmap;
pub mod option_map;
pub mod reader;
pub mod scanner;
pub mod section;
pub mod segmenter;
pub mod worker_pool;
pub mod writer;

pub use error::{Error, Result};
