// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two section checksums (spec.md §3, §6): a fast xxh3-64 covering the
//! header tail plus payload, and a SHA-512/256 covering the header from the
//! section number onward plus payload.

use sha2::{Digest, Sha512_256};

pub fn xxh3_64(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// Whole-file content key for the scanner's dedup pass (spec.md §4.10):
/// cheap enough to hash every candidate file, wide enough that a collision
/// between two different files is not a practical concern.
pub fn xxh3_128(data: &[u8]) -> u128 {
    xxhash_rust::xxh3::xxh3_128(data)
}

pub fn sha512_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha512_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xxh3_is_deterministic() {
        assert_eq!(xxh3_64(b"dwarfs"), xxh3_64(b"dwarfs"));
        assert_ne!(xxh3_64(b"dwarfs"), xxh3_64(b"dwarfz"));
    }

    #[test]
    fn sha512_256_length() {
        assert_eq!(sha512_256(b"dwarfs").len(), 32);
    }

    #[test]
    fn xxh3_128_is_deterministic() {
        assert_eq!(xxh3_128(b"dwarfs"), xxh3_128(b"dwarfs"));
        assert_ne!(xxh3_128(b"dwarfs"), xxh3_128(b"dwarfz"));
    }
}
