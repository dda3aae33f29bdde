// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The POSIX mode word (spec.md §3 `mode` table entry): file type plus
//! permission bits, packed the way `st_mode` is. Grounded on the teacher's
//! `bitstruct!`-based `ufs::Mode`, generalized from UFS's non-standard type
//! nibble to the real POSIX `S_IF*` constants this spec's `getattr`/`access`
//! need to interoperate with a real mount driver.

use bitstruct::bitstruct;

const S_IFMT: u16 = 0o170000;
const S_IFSOCK: u16 = 0o140000;
const S_IFLNK: u16 = 0o120000;
const S_IFREG: u16 = 0o100000;
const S_IFBLK: u16 = 0o060000;
const S_IFDIR: u16 = 0o040000;
const S_IFCHR: u16 = 0o020000;
const S_IFIFO: u16 = 0o010000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Fifo,
    Char,
    Dir,
    Block,
    Regular,
    SymLink,
    Sock,
    Unknown,
}

impl bitstruct::FromRaw<u16, FileKind> for Mode {
    fn from_raw(raw: u16) -> FileKind {
        match raw & S_IFMT {
            S_IFSOCK => FileKind::Sock,
            S_IFLNK => FileKind::SymLink,
            S_IFREG => FileKind::Regular,
            S_IFBLK => FileKind::Block,
            S_IFDIR => FileKind::Dir,
            S_IFCHR => FileKind::Char,
            S_IFIFO => FileKind::Fifo,
            _ => FileKind::Unknown,
        }
    }
}

impl bitstruct::IntoRaw<u16, FileKind> for Mode {
    fn into_raw(bits: FileKind) -> u16 {
        match bits {
            FileKind::Sock => S_IFSOCK,
            FileKind::SymLink => S_IFLNK,
            FileKind::Regular => S_IFREG,
            FileKind::Block => S_IFBLK,
            FileKind::Dir => S_IFDIR,
            FileKind::Char => S_IFCHR,
            FileKind::Fifo => S_IFIFO,
            FileKind::Unknown => 0,
        }
    }
}

bitstruct! {
    /// A parsed `st_mode`-shaped value: 9 permission bits, 3 special bits,
    /// and a 4-bit type field occupying the traditional `S_IFMT` position.
    #[derive(Clone, Copy)]
    pub struct Mode(u16) {
        ox: bool = 0;
        ow: bool = 1;
        or: bool = 2;
        gx: bool = 3;
        gw: bool = 4;
        gr: bool = 5;
        ux: bool = 6;
        uw: bool = 7;
        ur: bool = 8;
        sticky: bool = 9;
        sgid: bool = 10;
        suid: bool = 11;
        kind: FileKind = 12..=15;
    }
}

/// `access(inode, mode, uid, gid)` permission classes (spec.md §4.6):
/// classic POSIX owner/group/other selection, uid 0 bypasses read/write but
/// not "execute without any execute bit set".
#[derive(Clone, Copy, Debug)]
pub struct AccessMode {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Mode {
    pub fn file_kind(&self) -> FileKind {
        self.kind()
    }

    pub fn permission_bits(&self) -> u16 {
        self.0 & 0o7777
    }

    /// Evaluates `access()` for a given caller (spec.md §4.6).
    pub fn check_access(&self, want: AccessMode, file_uid: u32, file_gid: u32, uid: u32, gid: u32) -> bool {
        let any_exec_bit = self.ux() || self.gx() || self.ox();
        if want.execute && !any_exec_bit {
            return false;
        }
        if uid == 0 {
            return true;
        }
        let (r, w, x) = if uid == file_uid {
            (self.ur(), self.uw(), self.ux())
        } else if gid == file_gid {
            (self.gr(), self.gw(), self.gx())
        } else {
            (self.or(), self.ow(), self.ox())
        };
        (!want.read || r) && (!want.write || w) && (!want.execute || x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_file_kind() {
        let m = Mode(S_IFDIR | 0o755);
        assert_eq!(m.file_kind(), FileKind::Dir);
        assert_eq!(m.permission_bits(), 0o755);
    }

    #[test]
    fn root_bypasses_rw_but_not_missing_exec() {
        let m = Mode(S_IFREG | 0o600);
        let want = AccessMode { read: false, write: false, execute: true };
        assert!(!m.check_access(want, 1, 1, 0, 0));
        let want_rw = AccessMode { read: true, write: true, execute: false };
        assert!(m.check_access(want_rw, 1, 1, 0, 0));
    }

    #[test]
    fn owner_group_other_classes() {
        let m = Mode(S_IFREG | 0o640);
        let read = AccessMode { read: true, write: false, execute: false };
        assert!(m.check_access(read, 10, 20, 10, 20));
        assert!(m.check_access(read, 10, 20, 99, 20));
        assert!(!m.check_access(read, 10, 20, 99, 99));
    }
}
