// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A corrupted BLOCK section must not prevent mounting (its fast checksum
//! is only verified lazily, on first access) but must surface as an I/O
//! error once a `read` actually touches it.

use std::sync::Arc;

use dwarfs_core::byte_buffer::{FileView, HeapFileView};
use dwarfs_core::compression::CodecRegistry;
use dwarfs_core::error::Errno;
use dwarfs_core::filesystem::{Filesystem, FilesystemOptions};
use dwarfs_core::fstypes::{Chunk, CompressionType, SectionType};
use dwarfs_core::metadata::{
    DirEntry, Directory, InodeBoundaries, InodeEntry, MetadataGraph, PackingOptions, VfsStat,
};
use dwarfs_core::metadata::wire::{self, Schema};
use dwarfs_core::section::encode_v2_section;

/// One file, one block, framed as v2 sections. Returns the image and the
/// byte offset of the block payload's last byte, for callers to corrupt.
fn small_image() -> (Vec<u8>, u32, usize) {
    let payload = b"hello dwarfs, this is the block payload".to_vec();
    let names = vec!["a.txt".to_string()];
    let dir_entries = vec![DirEntry { name_index: 0, inode_num: 1 }];
    let directories =
        vec![Directory { first_entry: 0, parent_entry: 0 }, Directory { first_entry: 1, parent_entry: 0 }];
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
    let chunks = vec![Chunk { block: 0, offset: 0, size: payload.len() as u64 }];
    let graph = MetadataGraph::new(
        names,
        vec![0],
        vec![0],
        modes,
        vec![],
        dir_entries,
        directories,
        inodes,
        vec![0, 0, 1],
        chunks,
        vec![],
        vec![],
        boundaries,
        false,
        VfsStat { bytes: payload.len() as u64, original_bytes: payload.len() as u64, inodes: 2, read_only: true, block_size: 4096 },
    )
    .unwrap();

    let schema = Schema { packing: PackingOptions::default(), enable_nlink: false, block_size_bits: 12, boundaries: graph.boundaries() };
    let schema_bytes = wire::encode_schema(&schema);
    let data_bytes = wire::encode_metadata(&graph, &schema).unwrap();

    let block_section = encode_v2_section(0, SectionType::Block, CompressionType::None, &payload);
    let block_len = block_section.len();
    let mut image = block_section;
    image.extend_from_slice(&encode_v2_section(1, SectionType::MetadataV2Schema, CompressionType::None, &schema_bytes));
    image.extend_from_slice(&encode_v2_section(2, SectionType::MetadataV2, CompressionType::None, &data_bytes));

    (image, 1, block_len - 1)
}

#[test]
fn mount_succeeds_with_a_corrupted_block_and_read_reports_eio() {
    let (mut image, file_inode, last_block_byte) = small_image();
    image[last_block_byte] ^= 0xff;

    let view: Arc<dyn FileView> = Arc::new(HeapFileView::new(image));
    let registry = Arc::new(CodecRegistry::with_defaults());
    let fs = Filesystem::open(view, registry, FilesystemOptions::default())
        .expect("mounting must not eagerly verify BLOCK checksums");

    let handle = fs.open_inode(file_inode).unwrap();
    let mut buf = vec![0u8; 40];
    let err = fs.read(handle, 0, &mut buf).unwrap_err();
    assert_eq!(err.errno(), Errno::Eio);
}

#[test]
fn mount_rejects_a_corrupted_metadata_section() {
    let (mut image, _file_inode, _) = small_image();
    // Flip a byte inside the METADATA_V2 payload (the last section, so the
    // final byte of the image is always part of its payload).
    let last = image.len() - 1;
    image[last] ^= 0xff;

    let view: Arc<dyn FileView> = Arc::new(HeapFileView::new(image));
    let registry = Arc::new(CodecRegistry::with_defaults());
    let err = Filesystem::open(view, registry, FilesystemOptions::default()).unwrap_err();
    assert_eq!(err.errno(), Errno::Einval, "structural corruption in a non-BLOCK section is fatal at mount");
}
