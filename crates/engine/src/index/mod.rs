// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub(crate) use hash::{HashIndex, key_hash};
pub(crate) use key_encoding::KeyWriter;
pub(crate) use key_lock::HashKeyReadLocker;
pub(crate) use sorted::SortedIndex;

mod hash;
mod key_encoding;
mod key_lock;
mod range_lock;
mod sorted;

/// Runtime state of one secondary index.
pub(crate) enum IndexRuntime {
	Hash { index: HashIndex, locker: HashKeyReadLocker },
	Sorted { index: SortedIndex },
}
