// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Garbage collection scheduling.
//!
//! Active transactions are tracked ordered by read version; completion
//! advances the oldest-read-version watermark with a CAS max. Committed
//! transactions enter an uncollected queue ordered by commit version, and
//! every prefix at or below the watermark is drained into work items that
//! the GC workers execute against the stores. Alignments reset the queue
//! instead of entering it.

use std::{
	collections::{BTreeMap, VecDeque},
	sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use tracing::trace;
use velox_core::{Version, sync::ManualResetEvent};

pub(crate) enum GcWork {
	Object { class_index: usize, id: i64 },
	InvRef { target_id: i64, prop_id: i32 },
	KeyLock { index_pos: usize, key_hash: u64 },
	RangeSweep { index_pos: usize },
	/// Drain sentinel; the worker parks until the collector releases it.
	Pause,
}

/// Work buffered from a committed transaction until the watermark passes
/// its commit version.
pub(crate) struct GcItem {
	pub commit_version: Version,
	pub objects: Vec<(usize, i64)>,
	pub inv_refs: Vec<(i64, i32)>,
	pub key_locks: Vec<(usize, u64)>,
	pub range_indexes: Vec<usize>,
}

pub(crate) struct GarbageCollector {
	active: Mutex<BTreeMap<(Version, u64), ()>>,
	oldest: AtomicU64,
	uncollected: Mutex<VecDeque<GcItem>>,
	sender: Sender<GcWork>,
	receiver: Receiver<GcWork>,
	workers: usize,
	paused: Mutex<usize>,
	drained: Condvar,
	unpause: ManualResetEvent,
	shutdown: AtomicBool,
}

impl GarbageCollector {
	pub(crate) fn new(workers: usize) -> Self {
		let (sender, receiver) = unbounded();
		Self {
			active: Mutex::new(BTreeMap::new()),
			oldest: AtomicU64::new(0),
			uncollected: Mutex::new(VecDeque::new()),
			sender,
			receiver,
			workers,
			paused: Mutex::new(0),
			drained: Condvar::new(),
			unpause: ManualResetEvent::new(true),
			shutdown: AtomicBool::new(false),
		}
	}

	pub(crate) fn receiver(&self) -> Receiver<GcWork> {
		self.receiver.clone()
	}

	pub(crate) fn oldest_read_version(&self) -> Version {
		self.oldest.load(Ordering::Acquire)
	}

	/// Registers a beginning transaction. `current_read_version` is
	/// evaluated under the active-list lock so the watermark can never
	/// pass a snapshot that is about to register.
	pub(crate) fn register(&self, tx_id: u64, current_read_version: impl FnOnce() -> Version) -> Version {
		let mut active = self.active.lock();
		let read_version = current_read_version();
		active.insert((read_version, tx_id), ());
		read_version
	}

	/// Removes the transaction, advances the watermark and drains every
	/// uncollected prefix at or below it. `collect_horizon` caps the
	/// watermark below the rewind retention window.
	pub(crate) fn transaction_completed(
		&self,
		tx_id: u64,
		read_version: Version,
		item: Option<GcItem>,
		alignment: bool,
		collect_horizon: impl FnOnce() -> Version,
	) {
		let new_oldest = {
			let mut active = self.active.lock();
			active.remove(&(read_version, tx_id));
			let horizon = collect_horizon();
			match active.keys().next() {
				Some(&(oldest_active, _)) => oldest_active.min(horizon),
				None => horizon,
			}
		};
		// CAS max: concurrent completions may race to advance.
		let mut current = self.oldest.load(Ordering::Relaxed);
		while current < new_oldest {
			match self.oldest.compare_exchange_weak(
				current,
				new_oldest,
				Ordering::AcqRel,
				Ordering::Relaxed,
			) {
				Ok(_) => break,
				Err(observed) => current = observed,
			}
		}

		if let Some(item) = item {
			let mut uncollected = self.uncollected.lock();
			if alignment {
				// A full state transfer supersedes everything staged.
				uncollected.clear();
			} else {
				debug_assert!(
					uncollected.back().map(|b| b.commit_version < item.commit_version).unwrap_or(true)
				);
				uncollected.push_back(item);
			}
		}
		self.drain_collectible();
	}

	fn drain_collectible(&self) {
		let oldest = self.oldest.load(Ordering::Acquire);
		let mut drained = Vec::new();
		{
			let mut uncollected = self.uncollected.lock();
			while uncollected.front().map(|item| item.commit_version <= oldest).unwrap_or(false) {
				if let Some(item) = uncollected.pop_front() {
					drained.push(item);
				}
			}
		}
		for item in drained {
			trace!(commit_version = item.commit_version, "collecting transaction garbage");
			for (class_index, id) in item.objects {
				let _ = self.sender.send(GcWork::Object {
					class_index,
					id,
				});
			}
			for (target_id, prop_id) in item.inv_refs {
				let _ = self.sender.send(GcWork::InvRef {
					target_id,
					prop_id,
				});
			}
			for (index_pos, key_hash) in item.key_locks {
				let _ = self.sender.send(GcWork::KeyLock {
					index_pos,
					key_hash,
				});
			}
			for index_pos in item.range_indexes {
				let _ = self.sender.send(GcWork::RangeSweep {
					index_pos,
				});
			}
		}
	}

	/// Quiesces the workers: one pause sentinel per worker, wait until
	/// all park, then release them.
	pub(crate) fn drain(&self) {
		self.unpause.reset();
		for _ in 0..self.workers {
			let _ = self.sender.send(GcWork::Pause);
		}
		let mut paused = self.paused.lock();
		while *paused < self.workers {
			self.drained.wait(&mut paused);
		}
		drop(paused);
		self.unpause.set();
	}

	/// Called by a worker that received [`GcWork::Pause`].
	pub(crate) fn worker_paused(&self) {
		{
			let mut paused = self.paused.lock();
			*paused += 1;
			self.drained.notify_all();
		}
		self.unpause.wait();
		let mut paused = self.paused.lock();
		*paused -= 1;
	}

	pub(crate) fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::Acquire)
	}

	/// Workers observe the flag on their next pause sentinel and exit.
	pub(crate) fn shutdown(&self) {
		self.shutdown.store(true, Ordering::Release);
		self.unpause.set();
		for _ in 0..self.workers {
			let _ = self.sender.send(GcWork::Pause);
		}
	}
}
