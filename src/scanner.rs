// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scanner (spec.md §4.10): walks a source tree through an `OsAccess`
//! abstraction, applies include/exclude filters, deduplicates file content
//! by whole-file hash, runs a categorizer over the surviving unique
//! content, orders the resulting fragments, and assembles everything but
//! the chunk tables into a [`MetadataGraph`] — the segmenter fills those in
//! once it has chunked each fragment.
//!
//! Grounded on `fragment_chunkable.cpp`'s fragment-as-unit-of-work shape for
//! [`Fragment`], and on `fragment_order_parser.cpp`'s `file_order_mode`
//! choices (none/path/revpath/similarity/nilsimsa) for [`FragmentOrder`].

use std::collections::{HashMap, VecDeque};

use crate::checksum::xxh3_128;
use crate::compression::CategoryMetadata;
use crate::error::{Error, Result};
use crate::fstypes::Chunk;
use crate::metadata::{DirEntry, Directory, InodeBoundaries, InodeEntry, MetadataGraph, VfsStat};
use crate::option_map::OptionMap;

/// What kind of directory entry an `OsAccess` implementation reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    Dir,
    Regular,
    Symlink,
    Char,
    Block,
    Fifo,
    Sock,
}

#[derive(Clone, Debug)]
pub struct EntryMetadata {
    pub kind: EntryKind,
    /// Permission and special bits only (no `S_IFMT` type nibble).
    pub perm_bits: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub rdev: u32,
    pub mtime: u64,
}

/// Everything the scanner needs from the underlying storage, kept as a
/// trait so tests can walk a synthetic tree instead of the real
/// filesystem. Paths are POSIX-style, rooted at whatever was passed to
/// [`Scanner::scan`].
pub trait OsAccess: Send + Sync {
    /// Child names of a directory, in implementation-defined order (the
    /// scanner sorts them before assigning inode numbers).
    fn read_dir(&self, path: &str) -> Result<Vec<String>>;
    fn metadata(&self, path: &str) -> Result<EntryMetadata>;
    fn read_link(&self, path: &str) -> Result<String>;
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;
}

/// Assigns a compression category to sampled file content (spec.md §1: the
/// categorizer *trait* is in scope, ELF/FITS/libmagic *plugins* are not).
pub trait Categorizer: Send + Sync {
    /// `None` means "no opinion, use the default compressor".
    fn categorize(&self, path: &str, sample: &[u8]) -> Option<u32>;
    fn metadata_for(&self, category: u32) -> Option<CategoryMetadata>;
}

/// Assigns no category to anything; every fragment uses the writer's
/// default compressor.
pub struct DefaultCategorizer;

impl Categorizer for DefaultCategorizer {
    fn categorize(&self, _path: &str, _sample: &[u8]) -> Option<u32> {
        None
    }
    fn metadata_for(&self, _category: u32) -> Option<CategoryMetadata> {
        None
    }
}

/// Category reserved for content that looks already compressed.
pub const INCOMPRESSIBLE_CATEGORY: u32 = 0;

const MAGIC_PREFIXES: &[&[u8]] = &[
    b"\x1f\x8b",     // gzip
    b"PK\x03\x04",   // zip
    b"\x89PNG",      // png
    b"\xff\xd8\xff", // jpeg
    b"BZh",          // bzip2
    b"\x28\xb5\x2f\xfd", // zstd
    b"7z\xbc\xaf\x27\x1c",
];

/// Flags content that looks already compressed (common archive/image magic
/// numbers) so the writer can skip recompressing it.
pub struct IncompressibleCategorizer;

impl Categorizer for IncompressibleCategorizer {
    fn categorize(&self, _path: &str, sample: &[u8]) -> Option<u32> {
        MAGIC_PREFIXES.iter().any(|m| sample.starts_with(m)).then_some(INCOMPRESSIBLE_CATEGORY)
    }

    fn metadata_for(&self, _category: u32) -> Option<CategoryMetadata> {
        None
    }
}

/// Sub-options for `FragmentOrder::Nilsimsa` (spec.md §4.10 "similarity
/// ordering"), grounded on `fragment_order_parser.cpp`'s
/// `max-children`/`max-cluster-size` sub-options.
#[derive(Clone, Copy, Debug)]
pub struct NilsimsaOptions {
    pub max_children: usize,
    pub max_cluster_size: usize,
}

impl Default for NilsimsaOptions {
    fn default() -> Self {
        NilsimsaOptions { max_children: 16, max_cluster_size: 256 }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum FragmentOrder {
    None,
    Path,
    RevPath,
    Similarity,
    Nilsimsa(NilsimsaOptions),
}

impl FragmentOrder {
    /// Parses the original's `"mode[:k=v...]"` spec string (spec.md §2.1
    /// addition, [`OptionMap`]).
    pub fn parse(spec: &str) -> Result<Self> {
        let om = OptionMap::parse(spec);
        Ok(match om.choice() {
            "none" => FragmentOrder::None,
            "path" => FragmentOrder::Path,
            "revpath" => FragmentOrder::RevPath,
            "similarity" => FragmentOrder::Similarity,
            "nilsimsa" => FragmentOrder::Nilsimsa(NilsimsaOptions {
                max_children: om.get_parsed("max-children").unwrap_or(16),
                max_cluster_size: om.get_parsed("max-cluster-size").unwrap_or(256),
            }),
            _ => return Err(Error::InvalidArgument("unknown fragment order")),
        })
    }
}

/// One unique content blob to be handed to the segmenter, plus the inode it
/// was already assigned (the scanner fixes inode numbers before ordering;
/// ordering only changes *segmentation* locality, never the inode identity
/// `find`/`getattr` rely on).
#[derive(Clone, Debug)]
pub struct Fragment {
    pub inode: u32,
    pub category: Option<u32>,
    pub data: Vec<u8>,
    /// One representative path, used only for path-based orderings and
    /// diagnostics.
    pub path: String,
}

fn order_fragments(fragments: &mut [Fragment], order: FragmentOrder) {
    match order {
        FragmentOrder::None => {}
        FragmentOrder::Path => fragments.sort_by(|a, b| a.path.cmp(&b.path)),
        FragmentOrder::RevPath => {
            fragments.sort_by_key(|f| f.path.chars().rev().collect::<String>())
        }
        FragmentOrder::Similarity => fragments.sort_by_key(|f| gray_code(similarity_key(&f.data))),
        FragmentOrder::Nilsimsa(opts) => order_by_nilsimsa(fragments, opts),
    }
}

/// First 8 bytes of content as a big-endian integer, used as a cheap
/// locality key (spec.md §4.10 "similarity ordering": grouping
/// bit-for-bit-similar small files without a full LSH pass).
fn similarity_key(data: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = data.len().min(8);
    buf[..n].copy_from_slice(&data[..n]);
    u64::from_be_bytes(buf)
}

fn gray_code(x: u64) -> u64 {
    x ^ (x >> 1)
}

/// A deliberately simplified locality-sensitive digest: not the original's
/// `tran53` trigram table, just a cheap rolling mix folded into a 256-bit
/// histogram bitmap. Good enough to cluster near-duplicate content; not a
/// faithful nilsimsa implementation.
fn nilsimsa_digest(data: &[u8]) -> [u8; 32] {
    let mut histogram = [0u32; 256];
    if data.len() >= 3 {
        for w in data.windows(3) {
            let mut h: u32 = 0;
            for &b in w {
                h = h.wrapping_mul(131).wrapping_add(b as u32);
            }
            let bucket = (h ^ (h >> 8) ^ (h >> 16)) & 0xff;
            histogram[bucket as usize] += 1;
        }
    }
    let mut digest = [0u8; 32];
    for (i, &count) in histogram.iter().enumerate() {
        if count > 0 {
            digest[i / 8] |= 1 << (i % 8);
        }
    }
    digest
}

fn hamming_distance(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Bounded greedy nearest-neighbor chaining (spec.md §4.10 "similarity
/// ordering"): repeatedly extends the current cluster with whichever of
/// the next `max_children` unplaced fragments is nearest by Hamming
/// distance, restarting a new cluster after `max_cluster_size` fragments.
fn order_by_nilsimsa(fragments: &mut [Fragment], opts: NilsimsaOptions) {
    let n = fragments.len();
    if n <= 1 {
        return;
    }
    let digests: Vec<[u8; 32]> = fragments.iter().map(|f| nilsimsa_digest(&f.data)).collect();
    let mut used = vec![false; n];
    let mut order = Vec::with_capacity(n);

    for start in 0..n {
        if used[start] {
            continue;
        }
        used[start] = true;
        order.push(start);
        let mut current = start;
        let mut cluster_size = 1;
        while cluster_size < opts.max_cluster_size {
            let mut best: Option<(usize, u32)> = None;
            let mut scanned = 0;
            for cand in 0..n {
                if used[cand] {
                    continue;
                }
                let d = hamming_distance(&digests[current], &digests[cand]);
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((cand, d));
                }
                scanned += 1;
                if scanned >= opts.max_children {
                    break;
                }
            }
            match best {
                Some((idx, _)) => {
                    used[idx] = true;
                    order.push(idx);
                    current = idx;
                    cluster_size += 1;
                }
                None => break,
            }
        }
    }

    let reordered: Vec<Fragment> = order.into_iter().map(|i| fragments[i].clone()).collect();
    fragments.clone_from_slice(&reordered);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScannerOptions {
    pub enable_nlink: bool,
}

struct Filters {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Filters {
    fn allows(&self, path: &str) -> bool {
        if self.exclude.iter().any(|p| glob_match(p, path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| glob_match(p, path))
    }
}

/// A minimal `*`-only glob matcher (no `?`/character classes): sufficient
/// for the include/exclude patterns spec.md §4.10 describes.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            Some(&c) => !t.is_empty() && c == t[0] && inner(&p[1..], &t[1..]),
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

/// Tree-walk result before chunk assignment: the graph's non-chunk tables,
/// ready for [`GraphBuilder::finish`] once the segmenter has produced
/// chunks for every fragment.
pub struct GraphBuilder {
    names: Vec<String>,
    name_index: HashMap<String, u32>,
    uids: Vec<u32>,
    uid_index: HashMap<u32, u32>,
    gids: Vec<u32>,
    gid_index: HashMap<u32, u32>,
    modes: Vec<u16>,
    mode_index: HashMap<u16, u32>,
    symlinks: Vec<String>,
    dir_entries: Vec<DirEntry>,
    directories: Vec<Directory>,
    inodes: Vec<InodeEntry>,
    devices: Vec<u32>,
    shared_files_table: Vec<u32>,
    boundaries: InodeBoundaries,
    enable_nlink: bool,
    original_bytes: u64,
}

impl GraphBuilder {
    fn intern_name(&mut self, name: &str) -> u32 {
        if let Some(&i) = self.name_index.get(name) {
            return i;
        }
        let i = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), i);
        i
    }

    fn intern_uid(&mut self, uid: u32) -> u32 {
        *self.uid_index.entry(uid).or_insert_with(|| {
            self.uids.push(uid);
            (self.uids.len() - 1) as u32
        })
    }

    fn intern_gid(&mut self, gid: u32) -> u32 {
        *self.gid_index.entry(gid).or_insert_with(|| {
            self.gids.push(gid);
            (self.gids.len() - 1) as u32
        })
    }

    fn intern_mode(&mut self, mode_word: u16) -> u32 {
        *self.mode_index.entry(mode_word).or_insert_with(|| {
            self.modes.push(mode_word);
            (self.modes.len() - 1) as u32
        })
    }

    fn set_inode(&mut self, inode: u32, mode_word: u16, uid: u32, gid: u32) {
        let mi = self.intern_mode(mode_word);
        let ui = self.intern_uid(uid);
        let gi = self.intern_gid(gid);
        self.inodes[inode as usize] = InodeEntry { mode_index: mi, owner_index: ui, group_index: gi };
    }

    /// Assembles the final [`MetadataGraph`] once every fragment's chunks
    /// are known (spec.md §3 "chunk_table").
    pub fn finish(self, chunks_by_inode: &HashMap<u32, Vec<Chunk>>) -> Result<MetadataGraph> {
        let mut chunk_table = Vec::with_capacity(self.boundaries.total as usize + 1);
        let mut chunks = Vec::new();
        let mut total_bytes = 0u64;
        for inode in 0..self.boundaries.total {
            chunk_table.push(chunks.len() as u32);
            if let Some(cs) = chunks_by_inode.get(&inode) {
                total_bytes += cs.iter().map(|c| c.size as u64).sum::<u64>();
                chunks.extend_from_slice(cs);
            }
        }
        chunk_table.push(chunks.len() as u32);

        let stat = VfsStat {
            bytes: total_bytes,
            original_bytes: self.original_bytes,
            inodes: self.boundaries.total as u64,
            read_only: true,
            block_size: 1 << 22,
        };

        MetadataGraph::new(
            self.names,
            self.uids,
            self.gids,
            self.modes,
            self.symlinks,
            self.dir_entries,
            self.directories,
            self.inodes,
            chunk_table,
            chunks,
            self.shared_files_table,
            self.devices,
            self.boundaries,
            self.enable_nlink,
            stat,
        )
    }
}

enum WalkEntry {
    Dir(Vec<(String, WalkEntry)>),
    Symlink { target: String, meta: EntryMetadata },
    File { path: String },
    Device { meta: EntryMetadata },
    Other { meta: EntryMetadata },
}

pub struct Scanner<O: OsAccess, C: Categorizer> {
    os: O,
    categorizer: C,
    options: ScannerOptions,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl<O: OsAccess, C: Categorizer> Scanner<O, C> {
    pub fn new(
        os: O,
        categorizer: C,
        options: ScannerOptions,
        include: Vec<String>,
        exclude: Vec<String>,
    ) -> Self {
        Scanner { os, categorizer, options, include, exclude }
    }

    fn walk(&self, path: &str, filters: &Filters) -> Result<WalkEntry> {
        let meta = self.os.metadata(path)?;
        match meta.kind {
            EntryKind::Dir => {
                let mut names = self.os.read_dir(path)?;
                names.sort();
                let mut children = Vec::with_capacity(names.len());
                for name in names {
                    let child_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
                    if !filters.allows(&child_path) {
                        continue;
                    }
                    let entry = self.walk(&child_path, filters)?;
                    children.push((name, entry));
                }
                Ok(WalkEntry::Dir(children))
            }
            EntryKind::Symlink => Ok(WalkEntry::Symlink { target: self.os.read_link(path)?, meta }),
            EntryKind::Regular => Ok(WalkEntry::File { path: path.to_string() }),
            EntryKind::Char | EntryKind::Block => Ok(WalkEntry::Device { meta }),
            EntryKind::Fifo | EntryKind::Sock => Ok(WalkEntry::Other { meta }),
        }
    }

    /// Walks `root`, dedupes file content, categorizes and orders
    /// fragments, and returns the graph skeleton plus the ordered fragment
    /// list ready to feed a segmenter.
    pub fn scan(&self, root: &str, order: FragmentOrder) -> Result<(GraphBuilder, Vec<Fragment>)> {
        let filters = Filters { include: self.include.clone(), exclude: self.exclude.clone() };
        let tree = self.walk(root, &filters)?;
        let WalkEntry::Dir(root_children) = tree else {
            return Err(Error::InvalidArgument("scan root must be a directory"));
        };

        // Pass 1: flatten the tree into a list of directories (each a list
        // of (name, slot)) plus flat symlink/device/other tables, grouping
        // regular-file content by whole-file hash as we go (spec.md §4.10
        // "content-hash dedup"). `dirs[i]` mirrors a `Directory`/`DirEntry`
        // pair once inode numbers are assigned in pass 2.
        enum Slot {
            Dir(usize),
            Symlink(usize),
            Content(u128),
            Device(usize),
            Other(usize),
        }

        let mut dirs: Vec<Vec<(String, Slot)>> = Vec::new();
        let mut symlinks: Vec<(String, EntryMetadata)> = Vec::new();
        let mut devices: Vec<EntryMetadata> = Vec::new();
        let mut fifos_socks: Vec<EntryMetadata> = Vec::new();
        let mut content_groups: HashMap<u128, (Vec<u8>, Vec<String>)> = HashMap::new();

        fn flatten(
            children: Vec<(String, WalkEntry)>,
            dirs: &mut Vec<Vec<(String, Slot)>>,
            symlinks: &mut Vec<(String, EntryMetadata)>,
            devices: &mut Vec<EntryMetadata>,
            fifos_socks: &mut Vec<EntryMetadata>,
            content_groups: &mut HashMap<u128, (Vec<u8>, Vec<String>)>,
            os: &impl OsAccess,
        ) -> Result<usize> {
            let my_idx = dirs.len();
            dirs.push(Vec::new());
            let mut entries = Vec::with_capacity(children.len());
            for (name, child) in children {
                let slot = match child {
                    WalkEntry::Dir(grandchildren) => {
                        let idx = flatten(grandchildren, dirs, symlinks, devices, fifos_socks, content_groups, os)?;
                        Slot::Dir(idx)
                    }
                    WalkEntry::Symlink { target, meta } => {
                        let idx = symlinks.len();
                        symlinks.push((target, meta));
                        Slot::Symlink(idx)
                    }
                    WalkEntry::File { path } => {
                        let data = os.read_file(&path)?;
                        let key = xxh3_128(&data);
                        content_groups.entry(key).or_insert_with(|| (data, Vec::new())).1.push(path);
                        Slot::Content(key)
                    }
                    WalkEntry::Device { meta } => {
                        let idx = devices.len();
                        devices.push(meta);
                        Slot::Device(idx)
                    }
                    WalkEntry::Other { meta } => {
                        let idx = fifos_socks.len();
                        fifos_socks.push(meta);
                        Slot::Other(idx)
                    }
                };
                entries.push((name, slot));
            }
            dirs[my_idx] = entries;
            Ok(my_idx)
        }

        let root_dir_idx = flatten(
            root_children,
            &mut dirs,
            &mut symlinks,
            &mut devices,
            &mut fifos_socks,
            &mut content_groups,
            &self.os,
        )?;

        // Partition content groups into unique (one referencing path) vs
        // shared (more than one), preserving discovery order within each.
        let mut unique_files: Vec<(u128, Vec<u8>, String)> = Vec::new();
        let mut shared_groups: Vec<(u128, Vec<u8>, Vec<String>)> = Vec::new();
        for (key, (data, paths)) in content_groups {
            if paths.len() == 1 {
                unique_files.push((key, data, paths.into_iter().next().unwrap()));
            } else {
                shared_groups.push((key, data, paths));
            }
        }

        let n_dirs = dirs.len() as u32;
        let n_symlinks = symlinks.len() as u32;
        let n_unique = unique_files.len() as u32;
        let n_shared = shared_groups.len() as u32;
        let n_char = devices.iter().filter(|m| m.kind == EntryKind::Char).count() as u32;
        let n_block = devices.iter().filter(|m| m.kind == EntryKind::Block).count() as u32;
        let n_other = fifos_socks.len() as u32;

        // Inode numbering: dirs, symlinks, unique files, shared files,
        // chardev, blockdev, fifo/sock (spec.md §3 partition order).
        let boundaries = InodeBoundaries {
            dirs_end: n_dirs,
            symlinks_end: n_dirs + n_symlinks,
            unique_files_end: n_dirs + n_symlinks + n_unique,
            shared_files_end: n_dirs + n_symlinks + n_unique + n_shared,
            chardev_end: n_dirs + n_symlinks + n_unique + n_shared + n_char,
            blockdev_end: n_dirs + n_symlinks + n_unique + n_shared + n_char + n_block,
            total: n_dirs + n_symlinks + n_unique + n_shared + n_char + n_block + n_other,
        };

        let mut content_to_inode: HashMap<u128, u32> = HashMap::new();
        for (i, (key, _, _)) in unique_files.iter().enumerate() {
            content_to_inode.insert(*key, boundaries.symlinks_end + i as u32);
        }
        for (i, (key, _, _)) in shared_groups.iter().enumerate() {
            content_to_inode.insert(*key, boundaries.unique_files_end + i as u32);
        }

        let mut builder = GraphBuilder {
            names: Vec::new(),
            name_index: HashMap::new(),
            uids: Vec::new(),
            uid_index: HashMap::new(),
            gids: Vec::new(),
            gid_index: HashMap::new(),
            modes: Vec::new(),
            mode_index: HashMap::new(),
            symlinks: Vec::with_capacity(symlinks.len()),
            dir_entries: Vec::new(),
            directories: vec![Directory { first_entry: 0, parent_entry: 0 }; dirs.len() + 1],
            inodes: vec![InodeEntry { mode_index: 0, owner_index: 0, group_index: 0 }; boundaries.total as usize],
            // Indexed by `inode - shared_files_end` (chardevs then blockdevs,
            // matching the inode partition order), not push order: devices
            // are discovered in tree-walk order, which interleaves the two
            // kinds.
            devices: vec![0u32; (n_char + n_block) as usize],
            shared_files_table: Vec::new(),
            boundaries,
            enable_nlink: self.options.enable_nlink,
            original_bytes: 0,
        };

        // Assign every directory a stable inode via preorder, so that
        // children (visited breadth-first below) can always resolve their
        // parent's inode number regardless of visitation order.
        let mut dir_inode_of = vec![0u32; dirs.len()];
        let mut next_dir_inode = 1u32;
        fn assign_dir_inodes(idx: usize, dirs: &[Vec<(String, Slot)>], dir_inode_of: &mut [u32], next: &mut u32) {
            for (_, slot) in &dirs[idx] {
                if let Slot::Dir(child_idx) = slot {
                    dir_inode_of[*child_idx] = *next;
                    *next += 1;
                    assign_dir_inodes(*child_idx, dirs, dir_inode_of, next);
                }
            }
        }
        assign_dir_inodes(root_dir_idx, &dirs, &mut dir_inode_of, &mut next_dir_inode);
        builder.set_inode(0, 0o040755, 0, 0);

        // BFS over the flattened tree, assigning each directory's
        // `first_entry` in visitation order and recording dir_entries.
        let mut next_symlink_inode = boundaries.dirs_end;
        let mut next_char_inode = boundaries.shared_files_end;
        let mut next_block_inode = boundaries.shared_files_end + n_char;
        let mut next_other_inode = boundaries.blockdev_end;

        let mut queue = VecDeque::new();
        queue.push_back(root_dir_idx);
        let mut visited = vec![false; dirs.len()];
        while let Some(idx) = queue.pop_front() {
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            let inode = dir_inode_of[idx];
            builder.directories[inode as usize].first_entry = builder.dir_entries.len() as u32;
            if inode != 0 {
                builder.set_inode(inode, 0o040755, 0, 0);
            }

            for (name, slot) in &dirs[idx] {
                let name_idx = builder.intern_name(name);
                let child_inode = match slot {
                    Slot::Dir(child_idx) => {
                        let child_inode = dir_inode_of[*child_idx];
                        builder.directories[child_inode as usize].parent_entry = builder.dir_entries.len() as u32;
                        queue.push_back(*child_idx);
                        child_inode
                    }
                    Slot::Symlink(sidx) => {
                        let (target, meta) = &symlinks[*sidx];
                        let inode = next_symlink_inode;
                        next_symlink_inode += 1;
                        builder.symlinks.push(target.clone());
                        builder.set_inode(inode, meta.perm_bits, meta.uid, meta.gid);
                        inode
                    }
                    Slot::Content(key) => *content_to_inode.get(key).expect("every content key has an inode"),
                    Slot::Device(didx) => {
                        let meta = &devices[*didx];
                        let inode = if meta.kind == EntryKind::Char {
                            let i = next_char_inode;
                            next_char_inode += 1;
                            i
                        } else {
                            let i = next_block_inode;
                            next_block_inode += 1;
                            i
                        };
                        builder.devices[(inode - boundaries.shared_files_end) as usize] = meta.rdev;
                        builder.set_inode(inode, meta.perm_bits, meta.uid, meta.gid);
                        inode
                    }
                    Slot::Other(oidx) => {
                        let meta = &fifos_socks[*oidx];
                        let inode = next_other_inode;
                        next_other_inode += 1;
                        builder.set_inode(inode, meta.perm_bits, meta.uid, meta.gid);
                        inode
                    }
                };
                builder.dir_entries.push(DirEntry { name_index: name_idx, inode_num: child_inode });
            }
        }
        builder.directories[dirs.len()] =
            Directory { first_entry: builder.dir_entries.len() as u32, parent_entry: 0 };

        // File inode metadata, original-size accounting, and the
        // shared-files table (spec.md §4.6 "nlink": one row per shared
        // content group, grouped so every referencing inode agrees on
        // group size).
        let mut fragments = Vec::with_capacity(unique_files.len() + shared_groups.len());
        for (key, data, path) in unique_files {
            let meta = self.os.metadata(&path)?;
            let inode = *content_to_inode.get(&key).unwrap();
            builder.set_inode(inode, meta.perm_bits, meta.uid, meta.gid);
            builder.original_bytes += meta.size;
            let category = self.categorizer.categorize(&path, &data[..data.len().min(512)]);
            fragments.push(Fragment { inode, category, data, path });
        }
        for (group_idx, (key, data, paths)) in shared_groups.into_iter().enumerate() {
            let representative = paths[0].clone();
            let meta = self.os.metadata(&representative)?;
            let inode = *content_to_inode.get(&key).unwrap();
            builder.set_inode(inode, meta.perm_bits, meta.uid, meta.gid);
            builder.original_bytes += meta.size;
            builder.shared_files_table.push(group_idx as u32);
            let category = self.categorizer.categorize(&representative, &data[..data.len().min(512)]);
            fragments.push(Fragment { inode, category, data, path: representative });
        }

        order_fragments(&mut fragments, order);
        Ok((builder, fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn glob_matcher_handles_prefix_and_wildcard() {
        assert!(glob_match("*.txt", "a/b/c.txt"));
        assert!(!glob_match("*.txt", "a/b/c.bin"));
        assert!(glob_match("etc/*", "etc/passwd"));
    }

    #[test]
    fn incompressible_categorizer_flags_known_magic() {
        let c = IncompressibleCategorizer;
        assert_eq!(c.categorize("a.png", b"\x89PNGabc"), Some(INCOMPRESSIBLE_CATEGORY));
        assert_eq!(c.categorize("a.txt", b"hello world"), None);
    }

    #[test]
    fn fragment_order_parses_nilsimsa_suboptions() {
        let order = FragmentOrder::parse("nilsimsa:max-children=8:max-cluster-size=64").unwrap();
        match order {
            FragmentOrder::Nilsimsa(opts) => {
                assert_eq!(opts.max_children, 8);
                assert_eq!(opts.max_cluster_size, 64);
            }
            _ => panic!("expected nilsimsa"),
        }
    }

    /// A synthetic tree kept entirely in memory, for exercising the
    /// scanner without touching the real filesystem.
    enum Node {
        Dir(Vec<(String, Node)>),
        File(Vec<u8>),
        Symlink(String),
    }

    struct InMemoryOsAccess {
        root: Mutex<Node>,
    }

    impl InMemoryOsAccess {
        fn new(root: Node) -> Self {
            InMemoryOsAccess { root: Mutex::new(root) }
        }

        fn resolve<'a>(node: &'a Node, path: &str) -> Option<&'a Node> {
            let mut current = node;
            for component in path.split('/').filter(|c| !c.is_empty()) {
                match current {
                    Node::Dir(children) => {
                        current = &children.iter().find(|(n, _)| n == component)?.1;
                    }
                    _ => return None,
                }
            }
            Some(current)
        }
    }

    impl OsAccess for InMemoryOsAccess {
        fn read_dir(&self, path: &str) -> Result<Vec<String>> {
            let root = self.root.lock().unwrap();
            match Self::resolve(&root, path) {
                Some(Node::Dir(children)) => Ok(children.iter().map(|(n, _)| n.clone()).collect()),
                _ => Err(Error::NotADirectory),
            }
        }

        fn metadata(&self, path: &str) -> Result<EntryMetadata> {
            let root = self.root.lock().unwrap();
            let node = Self::resolve(&root, path).ok_or(Error::NotFound)?;
            let kind = match node {
                Node::Dir(_) => EntryKind::Dir,
                Node::File(_) => EntryKind::Regular,
                Node::Symlink(_) => EntryKind::Symlink,
            };
            let size = match node {
                Node::File(data) => data.len() as u64,
                _ => 0,
            };
            Ok(EntryMetadata { kind, perm_bits: 0o100644, uid: 1000, gid: 1000, size, rdev: 0, mtime: 0 })
        }

        fn read_link(&self, path: &str) -> Result<String> {
            let root = self.root.lock().unwrap();
            match Self::resolve(&root, path) {
                Some(Node::Symlink(target)) => Ok(target.clone()),
                _ => Err(Error::InvalidArgument("not a symlink")),
            }
        }

        fn read_file(&self, path: &str) -> Result<Vec<u8>> {
            let root = self.root.lock().unwrap();
            match Self::resolve(&root, path) {
                Some(Node::File(data)) => Ok(data.clone()),
                _ => Err(Error::IsADirectory),
            }
        }
    }

    fn sample_tree() -> Node {
        Node::Dir(vec![
            ("a.txt".to_string(), Node::File(b"hello world".to_vec())),
            ("b.txt".to_string(), Node::File(b"hello world".to_vec())), // identical content -> shared
            ("sub".to_string(), Node::Dir(vec![
                ("c.txt".to_string(), Node::File(b"unique content here".to_vec())),
                ("link".to_string(), Node::Symlink("../a.txt".to_string())),
            ])),
        ])
    }

    #[test]
    fn dedups_identical_content_into_one_shared_fragment() {
        let os = InMemoryOsAccess::new(sample_tree());
        let scanner = Scanner::new(os, DefaultCategorizer, ScannerOptions::default(), Vec::new(), Vec::new());
        let (builder, fragments) = scanner.scan("", FragmentOrder::None).unwrap();

        // a.txt and b.txt share content, c.txt is unique: 2 fragments total.
        assert_eq!(fragments.len(), 2);
        assert_eq!(builder.shared_files_table.len(), 1);

        let total_fragment_bytes: usize = fragments.iter().map(|f| f.data.len()).sum();
        assert_eq!(total_fragment_bytes, "hello world".len() + "unique content here".len());
    }

    #[test]
    fn graph_builder_produces_structurally_valid_metadata() {
        let os = InMemoryOsAccess::new(sample_tree());
        let scanner = Scanner::new(os, DefaultCategorizer, ScannerOptions::default(), Vec::new(), Vec::new());
        let (builder, fragments) = scanner.scan("", FragmentOrder::Path).unwrap();

        let mut chunks_by_inode = HashMap::new();
        for f in &fragments {
            chunks_by_inode.insert(f.inode, vec![Chunk { block: 0, offset: 0, size: f.data.len() as u64 }]);
        }
        let graph = builder.finish(&chunks_by_inode).unwrap();
        assert_eq!(graph.find_path("a.txt").unwrap(), graph.find_path("b.txt").unwrap());
        assert_ne!(graph.find_path("a.txt").unwrap(), graph.find_path("sub/c.txt").unwrap());
        assert_eq!(
            graph.readlink(graph.find_path("sub/link").unwrap(), crate::metadata::ReadlinkMode::Raw).unwrap(),
            "../a.txt"
        );
    }

    #[test]
    fn exclude_filter_drops_matching_paths() {
        let os = InMemoryOsAccess::new(sample_tree());
        let scanner = Scanner::new(
            os,
            DefaultCategorizer,
            ScannerOptions::default(),
            Vec::new(),
            vec!["sub/*".to_string()],
        );
        let (_builder, fragments) = scanner.scan("", FragmentOrder::None).unwrap();
        assert!(fragments.iter().all(|f| !f.path.starts_with("sub/")));
    }

    #[test]
    fn nilsimsa_ordering_keeps_every_fragment() {
        let mut fragments = vec![
            Fragment { inode: 0, category: None, data: b"aaaaaaaaaa".to_vec(), path: "a".into() },
            Fragment { inode: 1, category: None, data: b"bbbbbbbbbb".to_vec(), path: "b".into() },
            Fragment { inode: 2, category: None, data: b"aaaaaaaaab".to_vec(), path: "c".into() },
        ];
        order_fragments(&mut fragments, FragmentOrder::Nilsimsa(NilsimsaOptions::default()));
        let mut inodes: Vec<u32> = fragments.iter().map(|f| f.inode).collect();
        inodes.sort();
        assert_eq!(inodes, vec![0, 1, 2]);
    }
}
