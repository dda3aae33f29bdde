// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zero-copy byte buffer and file-view abstractions (spec.md §2).
//!
//! Four flavors are distinguished, the way the teacher's `io::Sd` distinguishes
//! a raw pointer-plus-length view from the growable `alloc::vec::Vec` buffers
//! used elsewhere in its tree:
//!
//! - [`SharedBuffer`]: an immutable, cheaply-cloneable owned buffer (`Arc<[u8]>`).
//! - [`MutableBuffer`]: a growable, exclusively-owned heap buffer (`Vec<u8>`),
//!   used while a cached block is still being decompressed.
//! - [`FrozenBuffer`]: like [`SharedBuffer`], but its address is guaranteed
//!   stable for the buffer's lifetime (it never reallocates), so it can be
//!   shared in place with code that has taken a raw pointer into it.
//! - [`FileView`]: a trait over a read-only, byte-addressable region backed
//!   either by an mmap or by a plain in-memory vector, with hole/extent
//!   iteration for sparse-file-aware callers.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::Result;

/// An immutable, cheaply-cloneable owned buffer.
#[derive(Clone)]
pub struct SharedBuffer {
    data: Arc<[u8]>,
}

impl SharedBuffer {
    pub fn from_vec(v: Vec<u8>) -> Self {
        SharedBuffer { data: Arc::from(v.into_boxed_slice()) }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len()).finish()
    }
}

/// A growable, exclusively-owned heap buffer.
///
/// Used for the uncompressed payload of a cached block while it is still
/// being materialized: bytes are only ever appended, never rewritten, so
/// concurrent readers may safely observe any prefix via an atomic watermark
/// (see `cache::cached_block`).
#[derive(Clone, Default)]
pub struct MutableBuffer {
    data: Vec<u8>,
}

impl MutableBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        MutableBuffer { data: Vec::with_capacity(cap) }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn freeze(self) -> FrozenBuffer {
        FrozenBuffer { data: Arc::new(self.data.into_boxed_slice()) }
    }
}

/// Like [`SharedBuffer`], but guaranteed not to move once constructed: the
/// backing `Box<[u8]>` is allocated once and only ever read through the
/// `Arc`, never reallocated. Callers that hand out raw pointers into the
/// buffer (e.g. decompressor frame targets) rely on this.
#[derive(Clone)]
pub struct FrozenBuffer {
    data: Arc<Box<[u8]>>,
}

impl FrozenBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for FrozenBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenBuffer").field("len", &self.len()).finish()
    }
}

/// A contiguous data or hole region within a [`FileView`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Extent {
    Data(Range<usize>),
    Hole(Range<usize>),
}

/// A read-only, byte-addressable region: either a memory-mapped file or a
/// plain in-memory buffer. Both backends support the same advisory
/// lock/release operations so callers don't need to know which one they
/// have (the way the original's `mmif` abstracts over a real mmap and a
/// test-only in-memory mock).
pub trait FileView: Send + Sync {
    fn as_slice(&self) -> &[u8];

    fn size(&self) -> usize {
        self.as_slice().len()
    }

    /// Advises the OS that `[offset, offset+len)` should be kept resident.
    /// Best-effort; failures are logged by the caller, never propagated.
    fn lock_range(&self, offset: usize, len: usize) -> Result<()>;

    /// Advises the OS that `[offset, offset+len)` may be evicted. Best-effort.
    fn release(&self, offset: usize, len: usize) -> Result<()>;

    /// Iterates data/hole extents across the whole view. A non-sparse
    /// backend (e.g. a plain `Vec<u8>`) reports one `Data` extent covering
    /// the whole range.
    fn extents(&self) -> Vec<Extent> {
        vec![Extent::Data(0..self.size())]
    }
}

/// An in-memory [`FileView`], for tests and for images small enough (or
/// ephemeral enough) not to warrant an mmap.
pub struct HeapFileView {
    data: Vec<u8>,
}

impl HeapFileView {
    pub fn new(data: Vec<u8>) -> Self {
        HeapFileView { data }
    }
}

impl FileView for HeapFileView {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn lock_range(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn release(&self, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_buffer_clones_cheaply() {
        let b = SharedBuffer::from_vec(vec![1, 2, 3]);
        let c = b.clone();
        assert_eq!(b.as_slice(), c.as_slice());
    }

    #[test]
    fn mutable_buffer_freezes() {
        let mut m = MutableBuffer::with_capacity(4);
        m.extend_from_slice(&[1, 2, 3, 4]);
        let f = m.freeze();
        assert_eq!(f.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn heap_file_view_single_extent() {
        let v = HeapFileView::new(vec![0u8; 16]);
        assert_eq!(v.extents(), vec![Extent::Data(0..16)]);
    }
}
