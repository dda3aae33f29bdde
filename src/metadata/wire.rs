// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hand-rolled binary packing of the metadata graph (spec.md §3 "packing
//! options", §1 "we specify the logical metadata graph ... not a specific
//! serialization framework"). No Thrift/Frozen: the schema section carries
//! just enough to interpret the data section (packing flags, inode
//! boundaries, `block_size_bits`), and the data section is the graph itself.
//!
//! Strings are length-prefixed and concatenated rather than FSST-compressed
//! (DESIGN.md: FSST's symbol-table compression itself is not implemented,
//! only the packing *framing* spec.md describes for names/symlinks).

use crate::error::{Error, Result};
use crate::fstypes::ChunkCodec;

use super::{
    unpack_chunk_table, unpack_directories, DirEntry, Directory, InodeBoundaries, InodeEntry,
    MetadataGraph, PackingOptions, VfsStat,
};

const SCHEMA_MAGIC: u32 = 0x4457_4653; // "DWFS"
const SCHEMA_VERSION: u16 = 1;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}
fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::StructuralInvariant("truncated metadata section"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| Error::StructuralInvariant("non-utf8 string in metadata"))
    }
}

/// The `METADATA_V2_SCHEMA` payload: everything needed to interpret the
/// `METADATA_V2` payload before walking it.
pub struct Schema {
    pub packing: PackingOptions,
    pub enable_nlink: bool,
    pub block_size_bits: u32,
    pub boundaries: InodeBoundaries,
}

pub fn encode_schema(schema: &Schema) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, SCHEMA_MAGIC);
    put_u16(&mut out, SCHEMA_VERSION);
    let mut flags = 0u16;
    if schema.packing.packed_directories {
        flags |= 1;
    }
    if schema.packing.packed_chunk_table {
        flags |= 2;
    }
    if schema.enable_nlink {
        flags |= 4;
    }
    put_u16(&mut out, flags);
    put_u32(&mut out, schema.block_size_bits);
    let b = &schema.boundaries;
    for v in [b.dirs_end, b.symlinks_end, b.unique_files_end, b.shared_files_end, b.chardev_end, b.blockdev_end, b.total] {
        put_u32(&mut out, v);
    }
    out
}

pub fn decode_schema(bytes: &[u8]) -> Result<Schema> {
    let mut c = Cursor::new(bytes);
    if c.u32()? != SCHEMA_MAGIC {
        return Err(Error::StructuralInvariant("bad metadata schema magic"));
    }
    let version = c.u16()?;
    if version > SCHEMA_VERSION {
        return Err(Error::NewerMinorVersion { found: version as u8, expected: SCHEMA_VERSION as u8 });
    }
    let flags = c.u16()?;
    let block_size_bits = c.u32()?;
    let boundaries = InodeBoundaries {
        dirs_end: c.u32()?,
        symlinks_end: c.u32()?,
        unique_files_end: c.u32()?,
        shared_files_end: c.u32()?,
        chardev_end: c.u32()?,
        blockdev_end: c.u32()?,
        total: c.u32()?,
    };
    Ok(Schema {
        packing: PackingOptions { packed_directories: flags & 1 != 0, packed_chunk_table: flags & 2 != 0 },
        enable_nlink: flags & 4 != 0,
        block_size_bits,
        boundaries,
    })
}

/// Serializes the graph body (spec.md §3 entity table) per the packing
/// flags carried in `schema`.
pub fn encode_metadata(graph: &MetadataGraph, schema: &Schema) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    put_u32(&mut out, graph.names.len() as u32);
    for n in &graph.names {
        put_str(&mut out, n);
    }
    put_u32(&mut out, graph.uids.len() as u32);
    for &u in &graph.uids {
        put_u32(&mut out, u);
    }
    put_u32(&mut out, graph.gids.len() as u32);
    for &g in &graph.gids {
        put_u32(&mut out, g);
    }
    put_u32(&mut out, graph.modes.len() as u32);
    for &m in &graph.modes {
        put_u16(&mut out, m);
    }
    put_u32(&mut out, graph.symlinks.len() as u32);
    for s in &graph.symlinks {
        put_str(&mut out, s);
    }

    put_u32(&mut out, graph.dir_entries.len() as u32);
    for e in &graph.dir_entries {
        put_u32(&mut out, e.name_index);
        put_u32(&mut out, e.inode_num);
    }

    if schema.packing.packed_directories {
        // Store `first_entry` deltas only; `parent_entry` is recovered by
        // BFS on load (spec.md §3 "Packed directory recovery").
        put_u32(&mut out, graph.directories.len() as u32);
        let mut prev = 0u32;
        for d in &graph.directories {
            put_u32(&mut out, d.first_entry - prev);
            prev = d.first_entry;
        }
    } else {
        put_u32(&mut out, graph.directories.len() as u32);
        for d in &graph.directories {
            put_u32(&mut out, d.first_entry);
            put_u32(&mut out, d.parent_entry);
        }
    }

    put_u32(&mut out, graph.inodes.len() as u32);
    for i in &graph.inodes {
        put_u32(&mut out, i.mode_index);
        put_u32(&mut out, i.owner_index);
        put_u32(&mut out, i.group_index);
    }

    let codec = ChunkCodec::new(schema.block_size_bits);
    if schema.packing.packed_chunk_table {
        // Per-inode chunk counts; prefix-summed on load (spec.md §3
        // "Packed chunk table").
        put_u32(&mut out, (graph.chunk_table.len() - 1) as u32);
        for w in graph.chunk_table.windows(2) {
            put_u32(&mut out, w[1] - w[0]);
        }
    } else {
        put_u32(&mut out, graph.chunk_table.len() as u32);
        for &ct in &graph.chunk_table {
            put_u32(&mut out, ct);
        }
    }
    put_u32(&mut out, graph.chunks.len() as u32);
    for c in &graph.chunks {
        let packed = codec.encode(c.block, c.offset, c.size)?;
        put_u64(&mut out, packed);
    }

    put_u32(&mut out, graph.shared_files_table.len() as u32);
    for &s in &graph.shared_files_table {
        put_u32(&mut out, s);
    }
    put_u32(&mut out, graph.devices.len() as u32);
    for &d in &graph.devices {
        put_u32(&mut out, d);
    }

    let s = &graph.stat;
    put_u64(&mut out, s.bytes);
    put_u64(&mut out, s.original_bytes);
    put_u64(&mut out, s.inodes);
    put_u16(&mut out, s.read_only as u16);
    put_u64(&mut out, s.block_size);

    out
}

pub fn decode_metadata(bytes: &[u8], schema: &Schema) -> Result<MetadataGraph> {
    let mut c = Cursor::new(bytes);

    let n_names = c.u32()? as usize;
    let mut names = Vec::with_capacity(n_names);
    for _ in 0..n_names {
        names.push(c.string()?);
    }
    let n_uids = c.u32()? as usize;
    let mut uids = Vec::with_capacity(n_uids);
    for _ in 0..n_uids {
        uids.push(c.u32()?);
    }
    let n_gids = c.u32()? as usize;
    let mut gids = Vec::with_capacity(n_gids);
    for _ in 0..n_gids {
        gids.push(c.u32()?);
    }
    let n_modes = c.u32()? as usize;
    let mut modes = Vec::with_capacity(n_modes);
    for _ in 0..n_modes {
        modes.push(c.u16()?);
    }
    let n_symlinks = c.u32()? as usize;
    let mut symlinks = Vec::with_capacity(n_symlinks);
    for _ in 0..n_symlinks {
        symlinks.push(c.string()?);
    }

    let n_dirents = c.u32()? as usize;
    let mut dir_entries = Vec::with_capacity(n_dirents);
    for _ in 0..n_dirents {
        dir_entries.push(DirEntry { name_index: c.u32()?, inode_num: c.u32()? });
    }

    let n_dirs = c.u32()? as usize;
    let directories: Vec<Directory> = if schema.packing.packed_directories {
        let mut deltas = Vec::with_capacity(n_dirs);
        for _ in 0..n_dirs {
            deltas.push(c.u32()?);
        }
        unpack_directories(&deltas, &dir_entries)
    } else {
        let mut dirs = Vec::with_capacity(n_dirs);
        for _ in 0..n_dirs {
            dirs.push(Directory { first_entry: c.u32()?, parent_entry: c.u32()? });
        }
        dirs
    };

    let n_inodes = c.u32()? as usize;
    let mut inodes = Vec::with_capacity(n_inodes);
    for _ in 0..n_inodes {
        inodes.push(InodeEntry { mode_index: c.u32()?, owner_index: c.u32()?, group_index: c.u32()? });
    }

    let codec = ChunkCodec::new(schema.block_size_bits);
    let n_ct = c.u32()? as usize;
    let chunk_table = if schema.packing.packed_chunk_table {
        let mut counts = Vec::with_capacity(n_ct);
        for _ in 0..n_ct {
            counts.push(c.u32()?);
        }
        unpack_chunk_table(&counts)
    } else {
        let mut ct = Vec::with_capacity(n_ct);
        for _ in 0..n_ct {
            ct.push(c.u32()?);
        }
        ct
    };
    let n_chunks = c.u32()? as usize;
    let mut chunks = Vec::with_capacity(n_chunks);
    for _ in 0..n_chunks {
        chunks.push(codec.decode(c.u64()?));
    }

    let n_shared = c.u32()? as usize;
    let mut shared_files_table = Vec::with_capacity(n_shared);
    for _ in 0..n_shared {
        shared_files_table.push(c.u32()?);
    }
    let n_devices = c.u32()? as usize;
    let mut devices = Vec::with_capacity(n_devices);
    for _ in 0..n_devices {
        devices.push(c.u32()?);
    }

    let stat = VfsStat {
        bytes: c.u64()?,
        original_bytes: c.u64()?,
        inodes: c.u64()?,
        read_only: c.u16()? != 0,
        block_size: c.u64()?,
    };
    MetadataGraph::new(
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
        schema.boundaries,
        schema.enable_nlink,
        stat,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fstypes::Chunk;
    use crate::reader::ChunkSource;

    fn small_graph() -> MetadataGraph {
        let names = vec!["a.txt".to_string()];
        let dir_entries = vec![DirEntry { name_index: 0, inode_num: 1 }];
        let directories = vec![Directory { first_entry: 0, parent_entry: 0 }, Directory { first_entry: 1, parent_entry: 0 }];
        let modes = vec![0o040755, 0o100644];
        let inodes = vec![
            InodeEntry { mode_index: 0, owner_index: 0, group_index: 0 },
            InodeEntry { mode_index: 1, owner_index: 0, group_index: 0 },
        ];
        let boundaries = InodeBoundaries {
            dirs_end: 1,
            symlinks_end: 1,
            unique_files_end: 2,
            shared_files_end: 2,
            chardev_end: 2,
            blockdev_end: 2,
            total: 2,
        };
        MetadataGraph::new(
            names,
            vec![0],
            vec![0],
            modes,
            vec![],
            dir_entries,
            directories,
            inodes,
            vec![0, 0, 1],
            vec![Chunk { block: 0, offset: 0, size: 5 }],
            vec![],
            vec![],
            boundaries,
            false,
            VfsStat { bytes: 5, original_bytes: 5, inodes: 2, read_only: true, block_size: 4096 },
        )
        .unwrap()
    }

    #[test]
    fn round_trips_plain() {
        let g = small_graph();
        let schema = Schema {
            packing: PackingOptions::default(),
            enable_nlink: false,
            block_size_bits: 12,
            boundaries: g.boundaries(),
        };
        let schema_bytes = encode_schema(&schema);
        let data_bytes = encode_metadata(&g, &schema).unwrap();
        let decoded_schema = decode_schema(&schema_bytes).unwrap();
        let decoded = decode_metadata(&data_bytes, &decoded_schema).unwrap();
        assert_eq!(decoded.find_path("a.txt").unwrap(), 1);
    }

    #[test]
    fn round_trips_packed() {
        let g = small_graph();
        let schema = Schema {
            packing: PackingOptions { packed_directories: true, packed_chunk_table: true },
            enable_nlink: false,
            block_size_bits: 12,
            boundaries: g.boundaries(),
        };
        let schema_bytes = encode_schema(&schema);
        let data_bytes = encode_metadata(&g, &schema).unwrap();
        let decoded_schema = decode_schema(&schema_bytes).unwrap();
        let decoded = decode_metadata(&data_bytes, &decoded_schema).unwrap();
        assert_eq!(decoded.find_path("a.txt").unwrap(), 1);
        assert_eq!(decoded.chunks(1).unwrap().len(), 1);
    }
}
