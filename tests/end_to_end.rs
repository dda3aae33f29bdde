// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the full scan -> segment -> write -> mount pipeline over an
//! in-memory tree and checks the mounted result against the source data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dwarfs_core::byte_buffer::{FileView, HeapFileView};
use dwarfs_core::compression::CodecRegistry;
use dwarfs_core::error::{Error, Result};
use dwarfs_core::filesystem::{Filesystem, FilesystemOptions};
use dwarfs_core::fstypes::Chunk;
use dwarfs_core::metadata::ReadlinkMode;
use dwarfs_core::scanner::{
    DefaultCategorizer, EntryKind, EntryMetadata, FragmentOrder, OsAccess, Scanner, ScannerOptions,
};
use dwarfs_core::segmenter::{Segmenter, SegmenterOptions};
use dwarfs_core::writer::{FilesystemWriter, WriterOptions};

enum Node {
    Dir(Vec<(String, Node)>),
    File(Vec<u8>),
    Symlink(String),
}

struct InMemoryTree {
    root: Mutex<Node>,
}

impl InMemoryTree {
    fn new(root: Node) -> Self {
        InMemoryTree { root: Mutex::new(root) }
    }

    fn resolve<'a>(node: &'a Node, path: &str) -> Option<&'a Node> {
        let mut current = node;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            match current {
                Node::Dir(children) => current = &children.iter().find(|(n, _)| n == component)?.1,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl OsAccess for InMemoryTree {
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
    let shared = b"hello dwarfs, this content is shared between two files".to_vec();
    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    Node::Dir(vec![
        ("a.txt".to_string(), Node::File(shared.clone())),
        ("b.txt".to_string(), Node::File(shared)),
        (
            "sub".to_string(),
            Node::Dir(vec![
                ("big.bin".to_string(), Node::File(big)),
                ("link".to_string(), Node::Symlink("../a.txt".to_string())),
            ]),
        ),
    ])
}

/// Runs scan -> segment -> write and returns the finished image bytes.
fn build_image() -> Vec<u8> {
    let os = InMemoryTree::new(sample_tree());
    let scanner = Scanner::new(os, DefaultCategorizer, ScannerOptions::default(), Vec::new(), Vec::new());
    let (builder, fragments) = scanner.scan("", FragmentOrder::None).unwrap();

    let registry = Arc::new(CodecRegistry::with_defaults());
    let writer = Arc::new(FilesystemWriter::new(registry, WriterOptions::default()).unwrap());
    let segmenter_options = SegmenterOptions { target_block_size: 1024, ..SegmenterOptions::default() };
    let segmenter = Segmenter::new(writer.clone(), segmenter_options);

    let mut chunks_by_inode: HashMap<u32, Vec<Chunk>> = HashMap::new();
    for f in &fragments {
        let granularity = writer.granularity_for(f.category);
        let chunks = segmenter.add_fragment(f.category, &f.data, granularity).unwrap();
        chunks_by_inode.insert(f.inode, chunks);
    }
    segmenter.finish();
    writer.flush();
    drop(segmenter);

    let graph = builder.finish(&chunks_by_inode).unwrap();
    writer.write_metadata(&graph).unwrap();
    writer.write_history(&[("event", "end-to-end test build")]);

    let writer = Arc::try_unwrap(writer).unwrap_or_else(|_| panic!("writer still shared"));
    writer.finish()
}

fn open(image: Vec<u8>) -> Filesystem {
    let view: Arc<dyn FileView> = Arc::new(HeapFileView::new(image));
    let registry = Arc::new(CodecRegistry::with_defaults());
    Filesystem::open(view, registry, FilesystemOptions::default()).unwrap()
}

fn read_all(fs: &Filesystem, inode: u32) -> Vec<u8> {
    let size = fs.getattr(inode, (0, 0, 0)).unwrap().size as usize;
    let handle = fs.open_inode(inode).unwrap();
    let mut buf = vec![0u8; size];
    let n = fs.read(handle, 0, &mut buf).unwrap();
    assert_eq!(n, size);
    buf
}

#[test]
fn mounts_a_built_image_and_reads_every_file_back() {
    let fs = open(build_image());

    let a = fs.find("a.txt").unwrap();
    let b = fs.find("b.txt").unwrap();
    assert_eq!(a, b, "identical content must dedup onto the same inode");
    assert_eq!(
        read_all(&fs, a),
        b"hello dwarfs, this content is shared between two files".to_vec()
    );

    let big_inode = fs.find("sub/big.bin").unwrap();
    let big_data = read_all(&fs, big_inode);
    let expected: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(big_data, expected, "content spanning multiple segmenter blocks must reassemble exactly");

    let link_inode = fs.find("sub/link").unwrap();
    assert_eq!(fs.readlink(link_inode, ReadlinkMode::Raw).unwrap(), "../a.txt");

    let sub_inode = fs.find("sub").unwrap();
    assert_eq!(fs.readdir(sub_inode, 2).unwrap().1, "big.bin");
    assert_eq!(fs.readdir(sub_inode, 3).unwrap().1, "link");

    let stat = fs.statvfs();
    assert!(stat.bytes > 0);
    // 2 dirs (root, sub) + 1 symlink + 1 unique file (big.bin) + 1 shared group (a.txt/b.txt).
    assert_eq!(stat.inodes, 5);
}

#[test]
fn opening_a_directory_fails_with_eisdir() {
    let fs = open(build_image());
    let sub = fs.find("sub").unwrap();
    let err = fs.open_inode(sub).unwrap_err();
    assert!(matches!(err, Error::IsADirectory));
}
