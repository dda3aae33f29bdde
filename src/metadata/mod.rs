// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The metadata layer (spec.md §3, §4.6): the frozen, optionally packed data
//! graph (directories, dir-entries, inodes, modes, uid/gid/symlink/name
//! tables, chunk table, shared-files table, devices) and its read
//! operations (`find`, `getattr`, `access`, `readdir`, `readlink`,
//! `statvfs`) plus the structural consistency check.
//!
//! Grounded on the teacher's `ufs::{FileSystem, Directory}`: `namex`'s
//! path-splitting walk becomes `find_path`, `Directory::iter` becomes
//! `readdir`, and `Mode`'s bitstruct becomes [`mode::Mode`].

pub mod mode;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fstypes::Chunk;
use crate::reader::ChunkSource;
use mode::{AccessMode, FileKind, Mode};

/// `readlink`'s separator-normalization modes (spec.md §4.6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadlinkMode {
    Raw,
    Posix,
    Preferred,
}

#[derive(Clone, Copy, Debug)]
pub struct DirEntry {
    pub name_index: u32,
    pub inode_num: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Directory {
    pub first_entry: u32,
    pub parent_entry: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct InodeEntry {
    pub mode_index: u32,
    pub owner_index: u32,
    pub group_index: u32,
}

/// Inode-number boundaries of the type partition (spec.md §3): every inode
/// index below `dirs_end` is a directory, below `symlinks_end` a symlink,
/// and so on through the fixed ordering directories < symlinks < files <
/// shared-files < char-dev < block-dev < fifo/socket.
#[derive(Clone, Copy, Debug)]
pub struct InodeBoundaries {
    pub dirs_end: u32,
    pub symlinks_end: u32,
    pub unique_files_end: u32,
    pub shared_files_end: u32,
    pub chardev_end: u32,
    pub blockdev_end: u32,
    pub total: u32,
}

impl InodeBoundaries {
    pub fn classify(&self, inode: u32) -> FileKind {
        if inode < self.dirs_end {
            FileKind::Dir
        } else if inode < self.symlinks_end {
            FileKind::SymLink
        } else if inode < self.shared_files_end {
            FileKind::Regular
        } else if inode < self.chardev_end {
            FileKind::Char
        } else if inode < self.blockdev_end {
            FileKind::Block
        } else {
            FileKind::Fifo // FIFO/socket share the trailing partition
        }
    }
}

/// `vfs_stat` (spec.md §4.6 addition; original_source/ `vfs_stat.h`): the
/// field set behind `statvfs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct VfsStat {
    /// Pre-compression (original) byte total across all regular files.
    pub bytes: u64,
    pub original_bytes: u64,
    /// Total inode count across all partitions.
    pub inodes: u64,
    pub read_only: bool,
    pub block_size: u64,
}

/// Attributes returned by `getattr` (spec.md §4.6).
#[derive(Clone, Copy, Debug)]
pub struct Attr {
    pub inode: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u32,
}

/// Packing flags recorded on load (spec.md §3 "packing options"). Mutually
/// exclusive packings are enforced by [`MetadataGraph::from_unpacked`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PackingOptions {
    pub packed_directories: bool,
    pub packed_chunk_table: bool,
}

/// The in-memory, unpacked representation the reader operates on.
/// Construction from a packed on-disk form (prefix-summing, BFS parent
/// recovery) happens once at mount in [`MetadataGraph::from_unpacked`] /
/// [`unpack_directories`] / [`unpack_chunk_table`].
pub struct MetadataGraph {
    names: Vec<String>,
    uids: Vec<u32>,
    gids: Vec<u32>,
    modes: Vec<u16>,
    symlinks: Vec<String>,
    dir_entries: Vec<DirEntry>,
    directories: Vec<Directory>,
    inodes: Vec<InodeEntry>,
    chunk_table: Vec<u32>,
    chunks: Vec<Chunk>,
    shared_files_table: Vec<u32>,
    devices: Vec<u32>,
    boundaries: InodeBoundaries,
    enable_nlink: bool,
    stat: VfsStat,
}

fn root_entry_index(graph: &MetadataGraph) -> Option<usize> {
    // The root directory's dir-entry is a synthetic index one past the end
    // of the real dir-entry table; readdir's `.`/`..` rows for the root
    // both resolve to inode 0, so callers address it as directory 0
    // directly rather than through a dir-entry lookup.
    if graph.directories.is_empty() {
        None
    } else {
        Some(usize::MAX)
    }
}

impl MetadataGraph {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        names: Vec<String>,
        uids: Vec<u32>,
        gids: Vec<u32>,
        modes: Vec<u16>,
        symlinks: Vec<String>,
        dir_entries: Vec<DirEntry>,
        directories: Vec<Directory>,
        inodes: Vec<InodeEntry>,
        chunk_table: Vec<u32>,
        chunks: Vec<Chunk>,
        shared_files_table: Vec<u32>,
        devices: Vec<u32>,
        boundaries: InodeBoundaries,
        enable_nlink: bool,
        stat: VfsStat,
    ) -> Result<Self> {
        let graph = MetadataGraph {
            names,
            uids,
            gids,
            modes,
            symlinks,
            dir_entries,
            directories,
            inodes,
            chunk_table,
            chunks,
            shared_files_table,
            devices,
            boundaries,
            enable_nlink,
            stat,
        };
        graph.check_consistency()?;
        Ok(graph)
    }

    /// Structural invariants (spec.md §3 "Structural invariants",
    /// verified when consistency check is enabled).
    pub fn check_consistency(&self) -> Result<()> {
        let n_names = self.names.len() as u32;
        let n_dirents = self.dir_entries.len() as u32;
        for e in &self.dir_entries {
            if e.name_index >= n_names {
                return Err(Error::StructuralInvariant("dir_entry.name_index out of range"));
            }
            if e.inode_num >= self.boundaries.total {
                return Err(Error::StructuralInvariant("dir_entry.inode_num out of range"));
            }
        }
        let mut prev = 0u32;
        for d in &self.directories {
            if d.first_entry < prev {
                return Err(Error::StructuralInvariant("directories[].first_entry not non-decreasing"));
            }
            prev = d.first_entry;
        }
        if let Some(last) = self.directories.last() {
            if last.first_entry != n_dirents {
                return Err(Error::StructuralInvariant("directory sentinel mismatch"));
            }
        }
        let mut prev_ct = 0u32;
        for &ct in &self.chunk_table {
            if ct < prev_ct {
                return Err(Error::StructuralInvariant("chunk_table not non-decreasing"));
            }
            prev_ct = ct;
        }
        if let Some(&last) = self.chunk_table.last() {
            if last != self.chunks.len() as u32 {
                return Err(Error::StructuralInvariant("chunk_table sentinel mismatch"));
            }
        }
        for inode in &self.inodes {
            if inode.mode_index as usize >= self.modes.len() {
                return Err(Error::StructuralInvariant("inode.mode_index out of range"));
            }
            if inode.owner_index as usize >= self.uids.len() {
                return Err(Error::StructuralInvariant("inode.owner_index out of range"));
            }
            if inode.group_index as usize >= self.gids.len() {
                return Err(Error::StructuralInvariant("inode.group_index out of range"));
            }
        }
        let b = &self.boundaries;
        if !(b.dirs_end <= b.symlinks_end
            && b.symlinks_end <= b.unique_files_end
            && b.unique_files_end <= b.shared_files_end
            && b.shared_files_end <= b.chardev_end
            && b.chardev_end <= b.blockdev_end
            && b.blockdev_end <= b.total)
        {
            return Err(Error::StructuralInvariant("inode partition boundaries not monotone"));
        }
        Ok(())
    }

    /// `find(path) -> dir_entry?` (spec.md §4.6): walks from the root
    /// splitting on `/`, grounded on the teacher's `namex`. A non-final
    /// component that isn't a directory is `ENOTDIR`, not a silent
    /// fall-back to the root.
    pub fn find_path(&self, path: &str) -> Result<u32> {
        let mut current_dir_idx = 0u32;
        let mut inode = 0u32; // root inode
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let current_dir_first = self.directories[current_dir_idx as usize].first_entry;
            let next_first = self.directories[current_dir_idx as usize + 1].first_entry;
            let range = current_dir_first as usize..next_first as usize;
            let found = self.dir_entries[range]
                .iter()
                .find(|e| self.name(e.name_index) == component)
                .ok_or(Error::NotFound)?;
            inode = found.inode_num;
            if components.peek().is_some() {
                if self.boundaries.classify(inode) != FileKind::Dir {
                    return Err(Error::NotADirectory);
                }
                current_dir_idx = inode;
            }
        }
        Ok(inode)
    }

    /// `find(inode, name)`: direct child lookup (spec.md §4.6).
    pub fn find_child(&self, dir_inode: u32, name: &str) -> Result<u32> {
        if self.boundaries.classify(dir_inode) != FileKind::Dir {
            return Err(Error::NotADirectory);
        }
        let (start, end) = self.dir_range(dir_inode)?;
        self.dir_entries[start..end]
            .iter()
            .find(|e| self.name(e.name_index) == name)
            .map(|e| e.inode_num)
            .ok_or(Error::NotFound)
    }

    fn dir_range(&self, dir_inode: u32) -> Result<(usize, usize)> {
        let idx = dir_inode as usize;
        let dir = self.directories.get(idx).ok_or(Error::NotFound)?;
        let next = self.directories.get(idx + 1).ok_or(Error::StructuralInvariant("missing directory sentinel"))?;
        Ok((dir.first_entry as usize, next.first_entry as usize))
    }

    fn name(&self, index: u32) -> &str {
        self.names.get(index as usize).map(|s| s.as_str()).unwrap_or("")
    }

    /// `readdir(directory, offset)` (spec.md §4.6): `.`/`..` synthesized at
    /// offsets 0/1, stored children from offset 2.
    pub fn readdir(&self, dir_inode: u32, offset: usize) -> Result<(u32, String)> {
        if self.boundaries.classify(dir_inode) != FileKind::Dir {
            return Err(Error::NotADirectory);
        }
        if offset == 0 {
            return Ok((dir_inode, ".".to_string()));
        }
        if offset == 1 {
            let parent = self.directories[dir_inode as usize].parent_entry;
            let parent_inode = self.dir_entries.get(parent as usize).map(|e| e.inode_num).unwrap_or(0);
            return Ok((parent_inode, "..".to_string()));
        }
        let (start, end) = self.dir_range(dir_inode)?;
        let child_idx = start + (offset - 2);
        if child_idx >= end {
            return Err(Error::OutOfRange);
        }
        let e = self.dir_entries[child_idx];
        Ok((e.inode_num, self.name(e.name_index).to_string()))
    }

    pub fn dir_size(&self, dir_inode: u32) -> Result<usize> {
        let (start, end) = self.dir_range(dir_inode)?;
        Ok(end - start + 2)
    }

    fn mode_of(&self, inode: u32) -> Result<Mode> {
        let entry = self.inodes.get(inode as usize).ok_or(Error::NotFound)?;
        Ok(Mode(self.modes[entry.mode_index as usize]))
    }

    /// `getattr(inode)` (spec.md §4.6): composes mode/uid/gid/rdev/size from
    /// shared tables; `nlink` counts shared-files references when
    /// `enable_nlink` is set, else reports 1 (spec.md §9 design note).
    pub fn getattr(&self, inode: u32, size: u64, times: (u64, u64, u64)) -> Result<Attr> {
        let entry = self.inodes.get(inode as usize).ok_or(Error::NotFound)?;
        let mode = Mode(self.modes[entry.mode_index as usize]);
        let kind = self.boundaries.classify(inode);
        let rdev = match kind {
            FileKind::Char | FileKind::Block => {
                let dev_idx = (inode - self.boundaries.shared_files_end) as usize;
                self.devices.get(dev_idx).copied().unwrap_or(0)
            }
            _ => 0,
        };
        let nlink = if kind == FileKind::Regular && inode >= self.boundaries.unique_files_end && self.enable_nlink {
            let shared_idx = (inode - self.boundaries.unique_files_end) as usize;
            self.shared_files_table
                .get(shared_idx)
                .map(|&group| self.shared_files_table.iter().filter(|&&g| g == group).count() as u32)
                .unwrap_or(1)
        } else {
            1
        };
        Ok(Attr {
            inode,
            mode: mode.0,
            uid: self.uids[entry.owner_index as usize],
            gid: self.gids[entry.group_index as usize],
            rdev,
            size,
            atime: times.0,
            mtime: times.1,
            ctime: times.2,
            nlink,
        })
    }

    /// `access(inode, mode, uid, gid)` (spec.md §4.6).
    pub fn access(&self, inode: u32, want: AccessMode, uid: u32, gid: u32) -> Result<bool> {
        let entry = self.inodes.get(inode as usize).ok_or(Error::NotFound)?;
        let mode = Mode(self.modes[entry.mode_index as usize]);
        let file_uid = self.uids[entry.owner_index as usize];
        let file_gid = self.gids[entry.group_index as usize];
        Ok(mode.check_access(want, file_uid, file_gid, uid, gid))
    }

    /// `readlink(inode, mode)` (spec.md §4.6).
    pub fn readlink(&self, inode: u32, mode: ReadlinkMode) -> Result<String> {
        if self.boundaries.classify(inode) != FileKind::SymLink {
            return Err(Error::InvalidArgument("readlink on a non-symlink inode"));
        }
        let idx = (inode - self.boundaries.dirs_end) as usize;
        let target = self.symlinks.get(idx).ok_or(Error::NotFound)?;
        Ok(match mode {
            ReadlinkMode::Raw => target.clone(),
            ReadlinkMode::Posix => target.replace('\\', "/"),
            ReadlinkMode::Preferred => {
                if cfg!(windows) {
                    target.replace('/', "\\")
                } else {
                    target.replace('\\', "/")
                }
            }
        })
    }

    pub fn statvfs(&self) -> VfsStat {
        self.stat
    }

    pub fn boundaries(&self) -> InodeBoundaries {
        self.boundaries
    }

    /// Depth-first, directory children in stored order (spec.md §4.6
    /// "Walks", tree order).
    pub fn walk_tree(&self, visitor: &mut impl FnMut(u32, &str)) {
        self.walk_tree_from(0, "", visitor);
    }

    fn walk_tree_from(&self, dir_inode: u32, _prefix: &str, visitor: &mut impl FnMut(u32, &str)) {
        let Ok((start, end)) = self.dir_range(dir_inode) else { return };
        for e in &self.dir_entries[start..end] {
            let name = self.name(e.name_index);
            visitor(e.inode_num, name);
            if self.boundaries.classify(e.inode_num) == FileKind::Dir {
                self.walk_tree_from(e.inode_num, name, visitor);
            }
        }
    }

    /// Data order: inodes sorted ascending, skipping non-regular-file
    /// inodes (spec.md §4.6 "Walks").
    pub fn walk_data_order(&self, visitor: &mut impl FnMut(u32)) {
        for inode in self.boundaries.symlinks_end..self.boundaries.unique_files_end {
            visitor(inode);
        }
        for inode in self.boundaries.unique_files_end..self.boundaries.shared_files_end {
            visitor(inode);
        }
    }
}

impl ChunkSource for MetadataGraph {
    fn chunks(&self, inode: u32) -> Result<Arc<[Chunk]>> {
        let start = *self.chunk_table.get(inode as usize).ok_or(Error::NotFound)? as usize;
        let end = *self.chunk_table.get(inode as usize + 1).ok_or(Error::StructuralInvariant("missing chunk_table sentinel"))? as usize;
        Ok(self.chunks[start..end].to_vec().into())
    }
}

/// Recovers `parent_entry` from packed `first_entry` deltas via a BFS from
/// the root (spec.md §3 "Packed directory recovery", §4.6).
pub fn unpack_directories(
    first_entry_deltas: &[u32],
    dir_entries: &[DirEntry],
) -> Vec<Directory> {
    let mut first_entry = Vec::with_capacity(first_entry_deltas.len());
    let mut acc = 0u32;
    for &delta in first_entry_deltas {
        acc += delta;
        first_entry.push(acc);
    }
    let mut directories: Vec<Directory> =
        first_entry.iter().map(|&f| Directory { first_entry: f, parent_entry: 0 }).collect();

    let mut queue = std::collections::VecDeque::new();
    queue.push_back((0u32, u32::MAX)); // (dir inode, its containing dir-entry index)
    let mut visited = vec![false; directories.len().saturating_sub(1)];
    while let Some((dir_inode, containing_entry)) = queue.pop_front() {
        let idx = dir_inode as usize;
        if idx >= visited.len() || visited[idx] {
            continue;
        }
        visited[idx] = true;
        if containing_entry != u32::MAX {
            directories[idx].parent_entry = containing_entry;
        }
        let start = directories[idx].first_entry as usize;
        let end = directories.get(idx + 1).map(|d| d.first_entry as usize).unwrap_or(dir_entries.len());
        for (offset, e) in dir_entries[start..end].iter().enumerate() {
            queue.push_back((e.inode_num, (start + offset) as u32));
        }
    }
    directories
}

/// Prefix-sums per-inode chunk counts into the chunk table (spec.md §3
/// "Packed chunk table").
pub fn unpack_chunk_table(counts: &[u32]) -> Vec<u32> {
    let mut table = Vec::with_capacity(counts.len() + 1);
    let mut acc = 0u32;
    table.push(0);
    for &c in counts {
        acc += c;
        table.push(acc);
    }
    table
}
