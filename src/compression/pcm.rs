// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCM sample (un)packing between raw byte-addressable audio and the
//! normalized signed 32-bit samples the FLAC codec needs (spec.md §4.2 FLAC
//! notes; `original_source/pcm_sample_transformer.{h,cpp}`).
//!
//! The FLAC encoder only understands signed 32-bit samples; callers on both
//! ends are unsigned/signed, big/little-endian, 1-4 bytes per sample. This
//! module is the bridge, promoted to a first-class module because without it
//! the FLAC codec cannot round-trip (SPEC_FULL.md §2.1).

use crate::error::{Error, Result};

/// How PCM samples are laid out on disk, carried in the compact header
/// record that precedes the FLAC stream (spec.md §4.2).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PcmFormat {
    pub big_endian: bool,
    pub signed: bool,
    /// When `bytes_per_sample * 8 > bits_per_sample`, whether the unused
    /// high bits (`true`) or low bits (`false`) are padding.
    pub pad_high: bool,
    pub bytes_per_sample: u8,
    pub bits_per_sample: u8,
    pub channels: u8,
}

impl PcmFormat {
    pub fn validate(&self) -> Result<()> {
        if !(1..=4).contains(&self.bytes_per_sample) {
            return Err(Error::InvalidArgument("pcm bytes_per_sample must be 1..=4"));
        }
        if !(8..=32).contains(&self.bits_per_sample) {
            return Err(Error::InvalidArgument("pcm bits_per_sample must be 8..=32"));
        }
        if (self.bits_per_sample as u32) > self.bytes_per_sample as u32 * 8 {
            return Err(Error::InvalidArgument("bits_per_sample exceeds bytes_per_sample"));
        }
        if self.channels == 0 {
            return Err(Error::InvalidArgument("pcm channels must be nonzero"));
        }
        Ok(())
    }

    pub fn frame_size(&self) -> usize {
        self.bytes_per_sample as usize * self.channels as usize
    }

    /// Unpacks raw interleaved PCM bytes into normalized signed 32-bit
    /// samples, one `Vec<i32>` per channel's worth interleaved as
    /// `[ch0, ch1, ..., ch0, ch1, ...]`.
    pub fn unpack(&self, raw: &[u8]) -> Result<Vec<i32>> {
        self.validate()?;
        let bps = self.bytes_per_sample as usize;
        if raw.len() % bps != 0 {
            return Err(Error::InvalidArgument("pcm buffer not a multiple of sample width"));
        }
        let shift = self.bytes_per_sample as u32 * 8 - self.bits_per_sample as u32;
        let mut out = Vec::with_capacity(raw.len() / bps);
        for sample_bytes in raw.chunks_exact(bps) {
            let mut buf = [0u8; 4];
            if self.big_endian {
                buf[4 - bps..].copy_from_slice(sample_bytes);
            } else {
                buf[..bps].copy_from_slice(sample_bytes);
                buf[bps..].fill(0);
            }
            let raw_u32 = if self.big_endian {
                u32::from_be_bytes(buf)
            } else {
                u32::from_le_bytes(buf)
            };
            let unpadded = if self.pad_high {
                raw_u32 >> shift.min(if self.big_endian { (4 - bps as u32) * 8 } else { 0 })
            } else {
                raw_u32
            };
            let value = if self.signed {
                sign_extend(unpadded, self.bits_per_sample)
            } else {
                unpadded as i64 - (1i64 << (self.bits_per_sample - 1))
            };
            out.push(value as i32);
        }
        Ok(out)
    }

    /// Repacks normalized signed 32-bit samples back into raw interleaved
    /// PCM bytes in this format.
    pub fn repack(&self, samples: &[i32]) -> Result<Vec<u8>> {
        self.validate()?;
        let bps = self.bytes_per_sample as usize;
        let mut out = Vec::with_capacity(samples.len() * bps);
        for &s in samples {
            let unsigned = if self.signed {
                (s as i64 & ((1i64 << self.bits_per_sample) - 1)) as u32
            } else {
                (s as i64 + (1i64 << (self.bits_per_sample - 1))) as u32
            };
            let bytes = if self.big_endian {
                unsigned.to_be_bytes()
            } else {
                unsigned.to_le_bytes()
            };
            if self.big_endian {
                out.extend_from_slice(&bytes[4 - bps..]);
            } else {
                out.extend_from_slice(&bytes[..bps]);
            }
        }
        Ok(out)
    }
}

fn sign_extend(value: u32, bits: u8) -> i64 {
    let shift = 32 - bits as u32;
    ((value << shift) as i32 >> shift) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_16bit_signed_le() {
        let fmt = PcmFormat {
            big_endian: false,
            signed: true,
            pad_high: false,
            bytes_per_sample: 2,
            bits_per_sample: 16,
            channels: 2,
        };
        let samples: Vec<i16> = vec![0, -1, 32767, -32768, 1234, -4321];
        let mut raw = Vec::new();
        for s in &samples {
            raw.extend_from_slice(&s.to_le_bytes());
        }
        let unpacked = fmt.unpack(&raw).unwrap();
        assert_eq!(unpacked, samples.iter().map(|&s| s as i32).collect::<Vec<_>>());
        let repacked = fmt.repack(&unpacked).unwrap();
        assert_eq!(repacked, raw);
    }

    #[test]
    fn round_trips_8bit_unsigned() {
        let fmt = PcmFormat {
            big_endian: false,
            signed: false,
            pad_high: false,
            bytes_per_sample: 1,
            bits_per_sample: 8,
            channels: 1,
        };
        let raw = vec![0u8, 128, 255];
        let unpacked = fmt.unpack(&raw).unwrap();
        assert_eq!(unpacked, vec![-128, 0, 127]);
        assert_eq!(fmt.repack(&unpacked).unwrap(), raw);
    }
}
