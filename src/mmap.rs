// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A memory-mapped file, implementing [`FileView`].
//!
//! `lock`/`release` are advisory: failures are logged but never propagated,
//! matching spec.md §5's shared-resource policy for mmap ranges.

use std::fs::File;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::byte_buffer::FileView;
use crate::error::Result;

pub struct MmapFile {
    mmap: Mmap,
}

impl MmapFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(MmapFile { mmap })
    }

    pub fn from_file(file: &File) -> Result<Self> {
        let mmap = unsafe { Mmap::map(file)? };
        Ok(MmapFile { mmap })
    }

    /// Builds a view restricted to `[offset, offset+len)` of the file, the
    /// way a self-extracting archive's payload is offset past a shell
    /// header (spec.md §4.1 "Image-offset discovery").
    pub fn with_offset(file: &File, offset: u64, len: u64) -> Result<Self> {
        let mmap = unsafe {
            MmapOptions::new().offset(offset).len(len as usize).map(file)?
        };
        Ok(MmapFile { mmap })
    }
}

impl FileView for MmapFile {
    fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    fn lock_range(&self, offset: usize, len: usize) -> Result<()> {
        #[cfg(unix)]
        {
            if offset + len > self.mmap.len() {
                return Ok(());
            }
            if let Err(e) = self.mmap.advise_range(memmap2::Advice::WillNeed, offset, len) {
                tracing::info!(error = %e, "madvise(WILLNEED) failed");
            }
        }
        Ok(())
    }

    fn release(&self, offset: usize, len: usize) -> Result<()> {
        #[cfg(unix)]
        {
            if offset + len > self.mmap.len() {
                return Ok(());
            }
            if let Err(e) = self.mmap.advise_range(memmap2::Advice::DontNeed, offset, len) {
                tracing::info!(error = %e, "madvise(DONTNEED) failed");
            }
        }
        Ok(())
    }
}
