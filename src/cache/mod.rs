// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-block decompression state (spec.md §4.3) and the concurrent block
//! cache built on top of it (spec.md §4.4).

pub mod block_cache;
pub mod cached_block;
