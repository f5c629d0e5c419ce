// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Transaction id generation.
//!
//! The id space `(MAX_COMMITTED_VERSION, 2^63)` is partitioned evenly
//! across cores so concurrent begins never contend on one counter. Ids
//! are never reused within a process lifetime; the partitions are large
//! enough that exhaustion is not a practical concern.

use std::sync::atomic::{AtomicU64, Ordering};

use velox_core::{
	FIRST_TRAN_ID, TRAN_ID_END,
	cpu::{self, CacheAligned},
};

pub(crate) struct TranIdGenerator {
	chunks: Box<[CacheAligned<AtomicU64>]>,
	chunk_size: u64,
}

impl TranIdGenerator {
	pub(crate) fn new() -> Self {
		let cores = cpu::core_count() as u64;
		let chunk_size = (TRAN_ID_END - FIRST_TRAN_ID) / cores;
		Self {
			chunks: (0..cores)
				.map(|i| CacheAligned::new(AtomicU64::new(FIRST_TRAN_ID + i * chunk_size)))
				.collect(),
			chunk_size,
		}
	}

	pub(crate) fn next(&self) -> u64 {
		let core = cpu::current_core_of(self.chunks.len());
		let id = self.chunks[core].fetch_add(1, Ordering::Relaxed);
		debug_assert!(id < FIRST_TRAN_ID + (core as u64 + 1) * self.chunk_size);
		id
	}
}
