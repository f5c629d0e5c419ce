// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Multi-reader / single-writer coordination for bulk grows.
//!
//! Readers enter through sharded per-CPU counters; a writer blocks new
//! entries and waits for every shard to drain before it proceeds. Used by
//! the hash structures to rehash while point operations keep their cheap
//! uncontended path.

use std::{
	hint,
	sync::atomic::{AtomicBool, AtomicUsize, Ordering},
	thread,
};

use parking_lot::{Mutex, MutexGuard};

use crate::cpu::{self, CacheAligned};

pub struct ParallelResizeCounter {
	shards: Box<[CacheAligned<AtomicUsize>]>,
	exclusive: AtomicBool,
	writer: Mutex<()>,
}

impl ParallelResizeCounter {
	pub fn new() -> Self {
		Self {
			shards: (0..cpu::core_count()).map(|_| CacheAligned::new(AtomicUsize::new(0))).collect(),
			exclusive: AtomicBool::new(false),
			writer: Mutex::new(()),
		}
	}

	pub fn enter(&self) -> CounterGuard<'_> {
		let shard = &self.shards[cpu::current_core_of(self.shards.len())].0;
		loop {
			while self.exclusive.load(Ordering::SeqCst) {
				thread::yield_now();
			}
			shard.fetch_add(1, Ordering::SeqCst);
			if !self.exclusive.load(Ordering::SeqCst) {
				return CounterGuard {
					shard,
				};
			}
			// A writer slipped in between the check and the
			// increment; back out and wait.
			shard.fetch_sub(1, Ordering::SeqCst);
		}
	}

	/// Blocks new readers and waits until every shard has drained.
	pub fn exclusive(&self) -> ExclusiveGuard<'_> {
		let writer = self.writer.lock();
		self.exclusive.store(true, Ordering::SeqCst);
		for shard in self.shards.iter() {
			let mut spins = 0u32;
			while shard.load(Ordering::SeqCst) != 0 {
				spins += 1;
				if spins < 64 {
					hint::spin_loop();
				} else {
					thread::yield_now();
				}
			}
		}
		ExclusiveGuard {
			counter: self,
			_writer: writer,
		}
	}
}

impl Default for ParallelResizeCounter {
	fn default() -> Self {
		Self::new()
	}
}

pub struct CounterGuard<'a> {
	shard: &'a AtomicUsize,
}

impl Drop for CounterGuard<'_> {
	fn drop(&mut self) {
		self.shard.fetch_sub(1, Ordering::SeqCst);
	}
}

pub struct ExclusiveGuard<'a> {
	counter: &'a ParallelResizeCounter,
	_writer: MutexGuard<'a, ()>,
}

impl Drop for ExclusiveGuard<'_> {
	fn drop(&mut self) {
		self.counter.exclusive.store(false, Ordering::SeqCst);
	}
}
