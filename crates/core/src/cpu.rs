// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Per-CPU sharding helpers.
//!
//! The engine shards hot state (free lists, staging queues, id generators)
//! by core to avoid contention. Threads are mapped to cores with a hash of
//! the thread id; this is a placement heuristic with no correctness
//! impact.

use std::{
	cell::Cell,
	ops::{Deref, DerefMut},
	sync::atomic::{AtomicU64, Ordering},
};

use once_cell::sync::Lazy;

static CORE_COUNT: Lazy<usize> = Lazy::new(num_cpus::get);

static NEXT_THREAD_SEQ: AtomicU64 = AtomicU64::new(0);

thread_local! {
	static THREAD_SEQ: Cell<u64> = Cell::new(u64::MAX);
}

/// Number of shards used for per-CPU state.
pub fn core_count() -> usize {
	*CORE_COUNT
}

/// Shard index of the current thread, in `[0, core_count())`.
pub fn current_core() -> usize {
	current_core_of(core_count())
}

/// Shard index of the current thread for an arbitrary shard count.
pub fn current_core_of(count: usize) -> usize {
	(thread_token() % count as u64) as usize
}

/// Stable identifier of the current thread. Transactions bind to it for
/// mutation operations.
pub fn thread_token() -> u64 {
	THREAD_SEQ.with(|c| {
		if c.get() == u64::MAX {
			c.set(NEXT_THREAD_SEQ.fetch_add(1, Ordering::Relaxed));
		}
		c.get()
	})
}

/// Pads the wrapped value to a cache line to keep per-CPU entries from
/// false sharing.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
	pub const fn new(value: T) -> Self {
		Self(value)
	}
}

impl<T> Deref for CacheAligned<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.0
	}
}

impl<T> DerefMut for CacheAligned<T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut self.0
	}
}
