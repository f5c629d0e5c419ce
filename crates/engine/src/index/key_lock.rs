// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Key read locker for hash indexes.
//!
//! An equality lookup leaves a short-lived lock on the hashed key so no
//! other transaction can commit a matching insertion before the reader
//! finishes. The lock is opportunistic: there is no overflow set, and a
//! cell already held by three foreign readers reports
//! `LockContentionLimitExceeded`.

use std::sync::{Arc, atomic::Ordering};

use velox_core::{Handle, MemoryManager, NULL_HANDLE, Result, Version,
	sync::{Bucket, BucketGuard, ResizeGuarded, atomic_u64},
};

use crate::{
	lock::ReaderInfo,
	txn::context::{KeyReadLock, TxView},
};

const INITIAL_BUCKETS: usize = 64;

const CELL_HASH: usize = 0;
const CELL_NEXT: usize = 8;
const CELL_READER: usize = 16;
const CELL_SIZE: usize = 32;

#[derive(Clone, Copy)]
struct Cell {
	ptr: *mut u8,
}

impl Cell {
	fn hash(&self) -> u64 {
		unsafe { (self.ptr.add(CELL_HASH) as *const u64).read() }
	}

	fn next(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(CELL_NEXT)) }.load(Ordering::Acquire)
	}

	fn set_next(&self, next: Handle) {
		unsafe { atomic_u64(self.ptr.add(CELL_NEXT)) }.store(next, Ordering::Release);
	}

	fn reader_info(&self) -> &ReaderInfo {
		unsafe { ReaderInfo::from_ptr(self.ptr.add(CELL_READER)) }
	}
}

pub(crate) struct HashKeyReadLocker {
	pub(crate) index_pos: usize,
	memory: Arc<MemoryManager>,
	table: ResizeGuarded<Box<[Bucket]>>,
}

impl HashKeyReadLocker {
	pub(crate) fn new(memory: Arc<MemoryManager>, index_pos: usize) -> Self {
		Self {
			index_pos,
			memory,
			table: ResizeGuarded::new((0..INITIAL_BUCKETS).map(|_| Bucket::new()).collect()),
		}
	}

	/// Locks the key for the reading transaction.
	pub(crate) fn try_take_key_lock(&self, tx: &mut TxView<'_>, hash: u64) -> Result<()> {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		let cell = match self.find(&guard, hash) {
			Some(cell) => cell,
			None => self.create(&guard, hash)?,
		};
		if cell.reader_info().try_take_key_lock(tx.slot)? {
			tx.ctx.key_read_locks.push(KeyReadLock {
				index_pos: self.index_pos,
				key_hash: hash,
			});
		}
		Ok(())
	}

	/// Writer-side phantom check before inserting a matching key.
	pub(crate) fn is_key_in_conflict(&self, slot: u16, read_version: Version, hash: u64) -> bool {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		match self.find(&guard, hash) {
			Some(cell) => cell.reader_info().is_in_conflict(slot, read_version, false),
			None => false,
		}
	}

	pub(crate) fn finalize(&self, hash: u64, slot: u16, commit_version: Option<Version>) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		if let Some(cell) = self.find(&guard, hash) {
			cell.reader_info().finalize(slot, false, commit_version);
		}
	}

	/// Moves an inline lock slot to the merge head's slot.
	pub(crate) fn remap(&self, hash: u64, prev_slot: u16, new_slot: u16) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		if let Some(cell) = self.find(&guard, hash) {
			cell.reader_info().remap_slot(prev_slot, new_slot);
		}
	}

	/// Frees the cell once no reader holds it and no active snapshot can
	/// still conflict on its watermark.
	pub(crate) fn garbage_collect(&self, hash: u64, oldest: Version) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		let mut prev: Option<Cell> = None;
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let cell = self.cell(cursor);
			if cell.hash() == hash {
				if cell.reader_info().lock_count() == 0
					&& cell.reader_info().committed_version() <= oldest
				{
					match prev {
						Some(p) => p.set_next(cell.next()),
						None => guard.set_handle(cell.next()),
					}
					self.memory.free(cursor);
				}
				return;
			}
			prev = Some(cell);
			cursor = cell.next();
		}
	}

	fn cell(&self, handle: Handle) -> Cell {
		Cell {
			ptr: self.memory.buffer(handle),
		}
	}

	fn find(&self, guard: &BucketGuard<'_>, hash: u64) -> Option<Cell> {
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let cell = self.cell(cursor);
			if cell.hash() == hash {
				return Some(cell);
			}
			cursor = cell.next();
		}
		None
	}

	fn create(&self, guard: &BucketGuard<'_>, hash: u64) -> Result<Cell> {
		let handle = self.memory.allocate(CELL_SIZE)?;
		let cell = self.cell(handle);
		unsafe {
			(cell.ptr.add(CELL_HASH) as *mut u64).write(hash);
		}
		cell.reader_info().clear();
		cell.set_next(guard.handle());
		guard.set_handle(handle);
		Ok(cell)
	}

	fn lock_bucket<'t>(&self, table: &'t [Bucket], hash: u64) -> BucketGuard<'t> {
		table[(hash as usize) & (table.len() - 1)].lock()
	}
}
