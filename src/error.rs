// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crate-wide error type.
//!
//! Mirrors the taxonomy in the specification: structural errors are fatal at
//! mount time, I/O corruption is fatal at access time but does not unmount,
//! configuration errors are fatal at build time, and everything else maps
//! onto a small set of POSIX-shaped codes for the mount-facing surface.

use std::fmt;
use std::io;

/// Errno-shaped codes exposed at the mount-facing surface (spec.md §6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Errno {
    Ebadf,
    Einval,
    Enoent,
    Eio,
    Eacces,
    Eisdir,
    Enotdir,
    Erange,
    Enodata,
}

impl Errno {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ebadf => "EBADF",
            Self::Einval => "EINVAL",
            Self::Enoent => "ENOENT",
            Self::Eio => "EIO",
            Self::Eacces => "EACCES",
            Self::Eisdir => "EISDIR",
            Self::Enotdir => "ENOTDIR",
            Self::Erange => "ERANGE",
            Self::Enodata => "ENODATA",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a core operation can fail.
#[derive(Debug)]
pub enum Error {
    // --- structural (fatal at mount) ---
    BadMagic,
    UnsupportedMajorVersion { found: u8, expected: u8 },
    NewerMinorVersion { found: u8, expected: u8 },
    TruncatedHeader,
    TruncatedSection,
    DuplicateSection(&'static str),
    MissingSection(&'static str),
    ChecksumMismatch { section: &'static str, which: &'static str },
    StructuralInvariant(&'static str),
    NoFramingFound,

    // --- I/O corruption (fatal at access, not at mount) ---
    BlockChecksumMismatch(u64),
    Decompress(String),

    // --- configuration (fatal at build) ---
    BadCompressionRatio,
    UnmetMetadataRequirement { codec: &'static str, field: &'static str },
    UnsatisfiableGranularity { granularity: usize, fragment_size: usize },
    UnknownCompression(String),

    // --- expected, local semantics ---
    BadHandle,
    NotFound,
    NotADirectory,
    IsADirectory,
    AccessDenied,
    OutOfRange,
    NoData,
    InvalidArgument(&'static str),

    // --- pass-through ---
    Io(io::Error),
}

impl Error {
    /// Maps this error onto the POSIX-shaped code the mount-facing API
    /// returns. Structural/configuration errors have no single good errno
    /// and are not expected to reach this far (they're fatal earlier).
    pub fn errno(&self) -> Errno {
        match self {
            Error::BadHandle => Errno::Ebadf,
            Error::NotFound => Errno::Enoent,
            Error::NotADirectory => Errno::Enotdir,
            Error::IsADirectory => Errno::Eisdir,
            Error::AccessDenied => Errno::Eacces,
            Error::OutOfRange => Errno::Erange,
            Error::NoData => Errno::Enodata,
            Error::InvalidArgument(_) => Errno::Einval,
            Error::BlockChecksumMismatch(_) | Error::Decompress(_) | Error::Io(_) => {
                Errno::Eio
            }
            _ => Errno::Einval,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadMagic => write!(f, "bad magic number in container header"),
            Error::UnsupportedMajorVersion { found, expected } => {
                write!(f, "unsupported major version {found} (expected {expected})")
            }
            Error::NewerMinorVersion { found, expected } => {
                write!(f, "minor version {found} is newer than supported {expected}")
            }
            Error::TruncatedHeader => write!(f, "truncated section header"),
            Error::TruncatedSection => write!(f, "truncated section data"),
            Error::DuplicateSection(t) => write!(f, "duplicate non-BLOCK section: {t}"),
            Error::MissingSection(t) => write!(f, "missing required section: {t}"),
            Error::ChecksumMismatch { section, which } => {
                write!(f, "{which} checksum mismatch in {section} section")
            }
            Error::StructuralInvariant(s) => write!(f, "structural invariant violated: {s}"),
            Error::NoFramingFound => write!(f, "no valid section framing found in image"),
            Error::BlockChecksumMismatch(no) => write!(f, "block {no} failed integrity check"),
            Error::Decompress(s) => write!(f, "decompression failed: {s}"),
            Error::BadCompressionRatio => write!(f, "bad compression ratio"),
            Error::UnmetMetadataRequirement { codec, field } => {
                write!(f, "codec {codec} requires metadata field {field}")
            }
            Error::UnsatisfiableGranularity { granularity, fragment_size } => write!(
                f,
                "granularity {granularity} unsatisfiable for fragment of size {fragment_size}"
            ),
            Error::UnknownCompression(s) => write!(f, "unknown compression: {s}"),
            Error::BadHandle => write!(f, "bad file handle"),
            Error::NotFound => write!(f, "no such file or directory"),
            Error::NotADirectory => write!(f, "not a directory"),
            Error::IsADirectory => write!(f, "is a directory"),
            Error::AccessDenied => write!(f, "permission denied"),
            Error::OutOfRange => write!(f, "value out of range"),
            Error::NoData => write!(f, "no data available"),
            Error::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
