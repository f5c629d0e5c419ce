// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Range locks for sorted-index scans.
//!
//! Every range scan of a read-write transaction registers the key range
//! it traversed, linked into the transaction so commit-time validation
//! revisits each one and re-checks the range contents against the final
//! state (the scanning transaction fails on a phantom). After the
//! scanner commits, the range keeps a committed watermark: writers with
//! an older snapshot inserting into it conflict immediately.

use std::{
	collections::HashMap,
	sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use velox_core::Version;

use crate::{
	lock::ReaderInfo,
	txn::context::{RangeReadLock, TxView},
};

struct RangeEntry {
	/// `None` bounds are unbounded (the maximum-key sentinel).
	low: Option<Vec<u8>>,
	low_inclusive: bool,
	high: Option<Vec<u8>>,
	high_inclusive: bool,
	info: ReaderInfo,
}

impl RangeEntry {
	fn contains(&self, key: &[u8]) -> bool {
		if let Some(low) = &self.low {
			match key.cmp(low.as_slice()) {
				std::cmp::Ordering::Less => return false,
				std::cmp::Ordering::Equal if !self.low_inclusive => return false,
				_ => {}
			}
		}
		if let Some(high) = &self.high {
			match key.cmp(high.as_slice()) {
				std::cmp::Ordering::Greater => return false,
				std::cmp::Ordering::Equal if !self.high_inclusive => return false,
				_ => {}
			}
		}
		true
	}
}

pub(crate) struct RangeReadLocker {
	pub(crate) index_pos: usize,
	ranges: Mutex<HashMap<u64, RangeEntry>>,
	next_id: AtomicU64,
}

impl RangeReadLocker {
	pub(crate) fn new(index_pos: usize) -> Self {
		Self {
			index_pos,
			ranges: Mutex::new(HashMap::new()),
			next_id: AtomicU64::new(1),
		}
	}

	/// Registers the traversed range under the scanning transaction.
	pub(crate) fn register(
		&self,
		tx: &mut TxView<'_>,
		low: Option<Vec<u8>>,
		low_inclusive: bool,
		high: Option<Vec<u8>>,
		high_inclusive: bool,
	) -> u64 {
		let entry = RangeEntry {
			low,
			low_inclusive,
			high,
			high_inclusive,
			info: ReaderInfo::new(),
		};
		entry.info.take_lock(tx.slot, false);
		let range_id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.ranges.lock().insert(range_id, entry);
		tx.ctx.range_read_locks.push(RangeReadLock {
			index_pos: self.index_pos,
			range_id,
		});
		range_id
	}

	/// Writer-side check before inserting `key`: conflicts with ranges a
	/// committed scan finalized above the writer's snapshot. Active
	/// scanners are not checked here; they revalidate their ranges at
	/// commit instead.
	pub(crate) fn is_key_in_conflict(&self, _slot: u16, read_version: Version, key: &[u8]) -> bool {
		let ranges = self.ranges.lock();
		ranges.values().any(|entry| entry.contains(key) && entry.info.committed_version() > read_version)
	}

	/// Bounds of a registered range, for commit-time revalidation.
	#[allow(clippy::type_complexity)]
	pub(crate) fn bounds(&self, range_id: u64) -> Option<(Option<Vec<u8>>, bool, Option<Vec<u8>>, bool)> {
		let ranges = self.ranges.lock();
		ranges.get(&range_id).map(|entry| {
			(entry.low.clone(), entry.low_inclusive, entry.high.clone(), entry.high_inclusive)
		})
	}

	pub(crate) fn finalize(&self, range_id: u64, slot: u16, commit_version: Option<Version>) {
		let mut ranges = self.ranges.lock();
		let Some(entry) = ranges.get_mut(&range_id) else {
			return;
		};
		entry.info.finalize(slot, false, commit_version);
		// Without a watermark there is nothing left to conflict on.
		if entry.info.lock_count() == 0 && entry.info.committed_version() == 0 {
			ranges.remove(&range_id);
		}
	}

	/// Moves the scanner's slot to the merge head's slot.
	pub(crate) fn remap(&self, range_id: u64, prev_slot: u16, new_slot: u16) {
		let ranges = self.ranges.lock();
		if let Some(entry) = ranges.get(&range_id) {
			entry.info.remap_slot(prev_slot, new_slot);
		}
	}

	/// Drops quiesced ranges whose watermark no active snapshot can
	/// conflict with anymore.
	pub(crate) fn garbage_collect(&self, oldest: Version) {
		self.ranges
			.lock()
			.retain(|_, entry| entry.info.lock_count() > 0 || entry.info.committed_version() > oldest);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::txn::context::TransactionContext;

	fn with_tx(f: impl FnOnce(&mut TxView<'_>, &RangeReadLocker)) {
		let mut ctx = TransactionContext::new(7, 1);
		let mut tx = TxView {
			slot: 7,
			tx_id: velox_core::FIRST_TRAN_ID,
			read_version: 10,
			ctx: &mut ctx,
		};
		let locker = RangeReadLocker::new(0);
		f(&mut tx, &locker);
	}

	#[test]
	fn active_scans_do_not_block_writers() {
		with_tx(|tx, locker| {
			let range_id = locker.register(tx, Some(vec![10]), true, Some(vec![25]), true);
			// An in-flight scan revalidates at commit; writers proceed.
			assert!(!locker.is_key_in_conflict(9, 10, &[15]));
			assert_eq!(
				locker.bounds(range_id),
				Some((Some(vec![10]), true, Some(vec![25]), true))
			);
		});
	}

	#[test]
	fn watermark_outlives_the_scan() {
		with_tx(|tx, locker| {
			let range_id = locker.register(tx, None, true, Some(vec![50]), false);
			locker.finalize(range_id, 7, Some(42));
			// Still conflicts for older snapshots.
			assert!(locker.is_key_in_conflict(9, 41, &[3]));
			assert!(!locker.is_key_in_conflict(9, 42, &[3]));
			// Open high bound excludes the boundary key.
			assert!(!locker.is_key_in_conflict(9, 41, &[50]));
			locker.garbage_collect(42);
			assert!(!locker.is_key_in_conflict(9, 41, &[3]));
		});
	}
}
