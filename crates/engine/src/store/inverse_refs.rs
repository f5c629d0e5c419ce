// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Inverse-reference map.
//!
//! For every tracked reference property `A.p -> B` the map answers "which
//! A ids point at this B" keyed by `(B.id, p)`. An entry holds a *base
//! item* (the folded committed id set with its version) plus a chain of
//! *delta items*, one per individual insert or delete. Readers overlay
//! the deltas visible at their snapshot onto the base; the garbage
//! collector folds deltas nobody can observe anymore into a new base.
//!
//! Concurrent writers appending deltas for different referencing objects
//! do not conflict: the per-object locks already serialize writes from
//! the same source, and distinct inserts/deletes commute. Conflicts exist
//! only against read-locked entries, through the embedded reader cell.

use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};

use velox_core::{
	Error, Handle, MemoryManager, NULL_HANDLE, Result, Version, is_committed, is_tran_id,
	sync::{Bucket, BucketGuard, ResizeGuarded, atomic_u64},
};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
	lock::{ReaderInfo, TakeResult},
	txn::context::{InvRefReadLock, TxView},
};

const INITIAL_BUCKETS: usize = 64;

const ENTRY_SIZE: usize = 56;
const ENTRY_ID: usize = 0;
const ENTRY_PROP: usize = 8;
const ENTRY_NEXT: usize = 16;
const ENTRY_BASE: usize = 24;
const ENTRY_DELTAS: usize = 32;
const ENTRY_READER: usize = 40;

const DELTA_SIZE: usize = 32;
const DELTA_REFERENCING: usize = 0;
const DELTA_VERSION: usize = 8;
const DELTA_NEXT: usize = 16;
const DELTA_FLAGS: usize = 24;
const DELTA_DELETE_FLAG: u64 = 1;

const BASE_VERSION: usize = 0;
const BASE_COUNT: usize = 8;
const BASE_IDS: usize = 16;

#[derive(Clone, Copy)]
struct Entry {
	ptr: *mut u8,
}

impl Entry {
	fn key_id(&self) -> i64 {
		unsafe { (self.ptr.add(ENTRY_ID) as *const i64).read() }
	}

	fn prop_id(&self) -> i32 {
		unsafe { (self.ptr.add(ENTRY_PROP) as *const i32).read() }
	}

	fn next(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(ENTRY_NEXT)) }.load(Ordering::Acquire)
	}

	fn set_next(&self, next: Handle) {
		unsafe { atomic_u64(self.ptr.add(ENTRY_NEXT)) }.store(next, Ordering::Release);
	}

	fn base(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(ENTRY_BASE)) }.load(Ordering::Acquire)
	}

	fn set_base(&self, base: Handle) {
		unsafe { atomic_u64(self.ptr.add(ENTRY_BASE)) }.store(base, Ordering::Release);
	}

	fn delta_head(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(ENTRY_DELTAS)) }.load(Ordering::Acquire)
	}

	fn set_delta_head(&self, head: Handle) {
		unsafe { atomic_u64(self.ptr.add(ENTRY_DELTAS)) }.store(head, Ordering::Release);
	}

	fn reader_info(&self) -> &ReaderInfo {
		unsafe { ReaderInfo::from_ptr(self.ptr.add(ENTRY_READER)) }
	}
}

#[derive(Clone, Copy)]
struct Delta {
	ptr: *mut u8,
}

impl Delta {
	fn referencing(&self) -> i64 {
		unsafe { (self.ptr.add(DELTA_REFERENCING) as *const i64).read() }
	}

	fn version(&self) -> Version {
		unsafe { atomic_u64(self.ptr.add(DELTA_VERSION)) }.load(Ordering::Acquire)
	}

	fn set_version(&self, version: Version) {
		unsafe { atomic_u64(self.ptr.add(DELTA_VERSION)) }.store(version, Ordering::Release);
	}

	fn next(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(DELTA_NEXT)) }.load(Ordering::Acquire)
	}

	fn set_next(&self, next: Handle) {
		unsafe { atomic_u64(self.ptr.add(DELTA_NEXT)) }.store(next, Ordering::Release);
	}

	fn is_delete(&self) -> bool {
		unsafe { (self.ptr.add(DELTA_FLAGS) as *const u64).read() & DELTA_DELETE_FLAG != 0 }
	}
}

pub(crate) struct InverseReferenceMap {
	memory: Arc<MemoryManager>,
	table: ResizeGuarded<Box<[Bucket]>>,
	count: AtomicUsize,
}

fn key_hash(id: i64, prop_id: i32) -> u64 {
	let mut bytes = [0u8; 12];
	bytes[..8].copy_from_slice(&id.to_le_bytes());
	bytes[8..].copy_from_slice(&prop_id.to_le_bytes());
	xxh3_64(&bytes)
}

impl InverseReferenceMap {
	pub(crate) fn new(memory: Arc<MemoryManager>) -> Self {
		Self {
			memory,
			table: ResizeGuarded::new((0..INITIAL_BUCKETS).map(|_| Bucket::new()).collect()),
			count: AtomicUsize::new(0),
		}
	}

	/// Appends an insert or delete delta for `referencing_id` at the
	/// writing transaction's id.
	pub(crate) fn modify(
		&self,
		tx: &mut TxView<'_>,
		target_id: i64,
		prop_id: i32,
		referencing_id: i64,
		is_delete: bool,
	) -> Result<Handle> {
		self.maybe_grow();
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		let entry = self.find_or_create(&guard, target_id, prop_id)?;

		let in_overflow = tx.ctx.overflow_invref.contains(&(target_id, prop_id));
		if entry.reader_info().is_in_conflict(tx.slot, tx.read_version, in_overflow) {
			return Err(Error::Conflict);
		}

		let delta_handle = self.memory.allocate(DELTA_SIZE)?;
		let delta = self.delta(delta_handle);
		unsafe {
			(delta.ptr.add(DELTA_REFERENCING) as *mut i64).write(referencing_id);
			(delta.ptr.add(DELTA_FLAGS) as *mut u64).write(if is_delete { DELTA_DELETE_FLAG } else { 0 });
		}
		delta.set_version(tx.tx_id);
		delta.set_next(entry.delta_head());
		entry.set_delta_head(delta_handle);
		Ok(delta_handle)
	}

	/// Ids referencing `target_id` through `prop_id`, as visible at the
	/// transaction's snapshot. Read-write transactions leave a read lock
	/// on the entry so later writers conflict.
	pub(crate) fn get_references(
		&self,
		tx: &mut TxView<'_>,
		take_lock: bool,
		target_id: i64,
		prop_id: i32,
	) -> Result<Vec<i64>> {
		self.maybe_grow();
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		let entry = if take_lock {
			let entry = self.find_or_create(&guard, target_id, prop_id)?;
			self.take_read_lock(tx, target_id, prop_id, entry);
			Some(entry)
		} else {
			self.find(&guard, target_id, prop_id)
		};
		let Some(entry) = entry else {
			return Ok(Vec::new());
		};
		Ok(self.collect_visible(entry, tx.read_version, tx.tx_id))
	}

	/// Strict read for delete propagation: takes the read lock and
	/// conflicts when another in-flight transaction has pending deltas on
	/// the entry, since the propagation could neither include nor safely
	/// ignore them.
	pub(crate) fn get_references_validated(
		&self,
		tx: &mut TxView<'_>,
		target_id: i64,
		prop_id: i32,
	) -> Result<Vec<i64>> {
		self.maybe_grow();
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		let entry = self.find_or_create(&guard, target_id, prop_id)?;
		self.take_read_lock(tx, target_id, prop_id, entry);

		let mut cursor = entry.delta_head();
		while cursor != NULL_HANDLE {
			let delta = self.delta(cursor);
			let version = delta.version();
			if is_tran_id(version) && version != tx.tx_id {
				return Err(Error::Conflict);
			}
			cursor = delta.next();
		}
		Ok(self.collect_visible(entry, tx.read_version, tx.tx_id))
	}

	/// Snapshot read without lock bookkeeping, for read-only
	/// transactions.
	pub(crate) fn get_references_snapshot(
		&self,
		target_id: i64,
		prop_id: i32,
		read_version: Version,
		tx_id: u64,
	) -> Vec<i64> {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		match self.find(&guard, target_id, prop_id) {
			Some(entry) => self.collect_visible(entry, read_version, tx_id),
			None => Vec::new(),
		}
	}

	fn collect_visible(&self, entry: Entry, read_version: Version, tx_id: u64) -> Vec<i64> {
		let mut ids = Vec::new();
		if entry.base() != NULL_HANDLE {
			let base = self.memory.buffer(entry.base());
			let count = unsafe { (base.add(BASE_COUNT) as *const u32).read() } as usize;
			ids.reserve(count);
			for i in 0..count {
				ids.push(unsafe { (base.add(BASE_IDS + i * 8) as *const i64).read() });
			}
		}

		// Chain is newest first; overlay oldest first.
		let mut applicable = Vec::new();
		let mut cursor = entry.delta_head();
		while cursor != NULL_HANDLE {
			let delta = self.delta(cursor);
			let version = delta.version();
			let visible = if is_tran_id(version) {
				version == tx_id
			} else {
				is_committed(version) && version <= read_version
			};
			if visible {
				applicable.push(cursor);
			}
			cursor = delta.next();
		}
		for &handle in applicable.iter().rev() {
			let delta = self.delta(handle);
			if delta.is_delete() {
				if let Some(pos) = ids.iter().position(|&id| id == delta.referencing()) {
					ids.swap_remove(pos);
				}
			} else {
				ids.push(delta.referencing());
			}
		}
		ids
	}

	/// Publishes a delta under its commit version.
	pub(crate) fn finalize_delta(&self, delta: Handle, commit_version: Version) {
		self.delta(delta).set_version(commit_version);
	}

	pub(crate) fn rollback_delta(&self, target_id: i64, prop_id: i32, delta: Handle) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		let Some(entry) = self.find(&guard, target_id, prop_id) else {
			return;
		};
		let mut prev: Option<Delta> = None;
		let mut cursor = entry.delta_head();
		while cursor != NULL_HANDLE {
			let current = self.delta(cursor);
			if cursor == delta {
				match prev {
					Some(p) => p.set_next(current.next()),
					None => entry.set_delta_head(current.next()),
				}
				self.memory.free(delta);
				return;
			}
			prev = Some(current);
			cursor = current.next();
		}
	}

	pub(crate) fn finalize_read_lock(&self, lock: &InvRefReadLock, slot: u16, commit_version: Option<Version>) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, lock.target_id, lock.prop_id);
		if let Some(entry) = self.find(&guard, lock.target_id, lock.prop_id) {
			entry.reader_info().finalize(slot, lock.from_overflow, commit_version);
		}
	}

	/// Moves an inline read-lock slot to the merge head's slot.
	pub(crate) fn remap_read_lock(&self, target_id: i64, prop_id: i32, prev_slot: u16, new_slot: u16) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		if let Some(entry) = self.find(&guard, target_id, prop_id) {
			entry.reader_info().remap_slot(prev_slot, new_slot);
		}
	}

	/// Folds deltas nobody can observe into a new base item; removes the
	/// entry entirely once it is empty and unobserved.
	pub(crate) fn garbage_collect(&self, target_id: i64, prop_id: i32, oldest: Version) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, target_id, prop_id);
		let (prev_entry, entry) = self.find_with_prev(&guard, target_id, prop_id);
		let Some(entry) = entry else {
			return;
		};

		// Partition the chain: foldable deltas are committed at or below
		// the oldest active snapshot.
		let mut kept = Vec::new();
		let mut folded = Vec::new();
		let mut cursor = entry.delta_head();
		while cursor != NULL_HANDLE {
			let delta = self.delta(cursor);
			let version = delta.version();
			if is_committed(version) && version <= oldest {
				folded.push(cursor);
			} else {
				kept.push(cursor);
			}
			cursor = delta.next();
		}

		if !folded.is_empty() {
			let mut ids = Vec::new();
			let mut base_version = 0u64;
			if entry.base() != NULL_HANDLE {
				let base = self.memory.buffer(entry.base());
				base_version = unsafe { (base.add(BASE_VERSION) as *const u64).read() };
				let count = unsafe { (base.add(BASE_COUNT) as *const u32).read() } as usize;
				for i in 0..count {
					ids.push(unsafe { (base.add(BASE_IDS + i * 8) as *const i64).read() });
				}
			}
			for &handle in folded.iter().rev() {
				let delta = self.delta(handle);
				base_version = base_version.max(delta.version());
				if delta.is_delete() {
					if let Some(pos) = ids.iter().position(|&id| id == delta.referencing()) {
						ids.swap_remove(pos);
					}
				} else {
					ids.push(delta.referencing());
				}
			}

			let old_base = entry.base();
			if ids.is_empty() {
				entry.set_base(NULL_HANDLE);
			} else {
				match self.memory.allocate(BASE_IDS + ids.len() * 8) {
					Ok(new_base) => {
						let base = self.memory.buffer(new_base);
						unsafe {
							(base.add(BASE_VERSION) as *mut u64).write(base_version);
							(base.add(BASE_COUNT) as *mut u32).write(ids.len() as u32);
							for (i, id) in ids.iter().enumerate() {
								(base.add(BASE_IDS + i * 8) as *mut i64).write(*id);
							}
						}
						entry.set_base(new_base);
					}
					// Leave the chain unfolded rather than lose it.
					Err(_) => return,
				}
			}
			if old_base != NULL_HANDLE {
				self.memory.free(old_base);
			}

			// Relink the kept deltas, newest first, and free the rest.
			let mut head = NULL_HANDLE;
			for &handle in kept.iter().rev() {
				self.delta(handle).set_next(head);
				head = handle;
			}
			entry.set_delta_head(head);
			for &handle in &folded {
				self.memory.free(handle);
			}
		}

		if entry.base() == NULL_HANDLE
			&& entry.delta_head() == NULL_HANDLE
			&& entry.reader_info().lock_count() == 0
			&& entry.reader_info().committed_version() <= oldest
		{
			let entry_handle = self.find_handle(&guard, target_id, prop_id);
			match prev_entry {
				Some(p) => p.set_next(entry.next()),
				None => guard.set_handle(entry.next()),
			}
			self.memory.free(entry_handle);
			self.count.fetch_sub(1, Ordering::Relaxed);
		}
	}

	/// Discards every delta above `target`. Runs quiesced; used by
	/// rewind.
	pub(crate) fn rewind(&self, target: Version) {
		let table = self.table.read();
		for bucket in table.iter() {
			let guard = bucket.lock();
			let mut prev: Option<Entry> = None;
			let mut cursor = guard.handle();
			while cursor != NULL_HANDLE {
				let entry = self.entry(cursor);
				let next_entry = entry.next();

				let mut kept_head = NULL_HANDLE;
				let mut kept_tail: Option<Delta> = None;
				let mut delta_cursor = entry.delta_head();
				while delta_cursor != NULL_HANDLE {
					let delta = self.delta(delta_cursor);
					let next = delta.next();
					if is_committed(delta.version()) && delta.version() <= target {
						delta.set_next(NULL_HANDLE);
						match kept_tail.take() {
							Some(tail) => {
								tail.set_next(delta_cursor);
								kept_tail = Some(delta);
							}
							None => {
								kept_head = delta_cursor;
								kept_tail = Some(delta);
							}
						}
					} else {
						self.memory.free(delta_cursor);
					}
					delta_cursor = next;
				}
				entry.set_delta_head(kept_head);

				if entry.base() == NULL_HANDLE && entry.delta_head() == NULL_HANDLE {
					match &prev {
						Some(p) => p.set_next(next_entry),
						None => guard.set_handle(next_entry),
					}
					self.memory.free(cursor);
					self.count.fetch_sub(1, Ordering::Relaxed);
				} else {
					prev = Some(entry);
				}
				cursor = next_entry;
			}
		}
	}

	fn take_read_lock(&self, tx: &mut TxView<'_>, target_id: i64, prop_id: i32, entry: Entry) {
		let key = (target_id, prop_id);
		let in_overflow = tx.ctx.overflow_invref.contains(&key);
		match entry.reader_info().take_lock(tx.slot, in_overflow) {
			TakeResult::AlreadyHeld => {}
			TakeResult::Inline => tx.ctx.invref_read_locks.push(InvRefReadLock {
				target_id,
				prop_id,
				from_overflow: false,
			}),
			TakeResult::Overflow => {
				tx.ctx.overflow_invref.insert(key);
				tx.ctx.invref_read_locks.push(InvRefReadLock {
					target_id,
					prop_id,
					from_overflow: true,
				});
			}
		}
	}

	fn entry(&self, handle: Handle) -> Entry {
		Entry {
			ptr: self.memory.buffer(handle),
		}
	}

	fn delta(&self, handle: Handle) -> Delta {
		Delta {
			ptr: self.memory.buffer(handle),
		}
	}

	fn find(&self, guard: &BucketGuard<'_>, target_id: i64, prop_id: i32) -> Option<Entry> {
		self.find_with_prev(guard, target_id, prop_id).1
	}

	fn find_with_prev(
		&self,
		guard: &BucketGuard<'_>,
		target_id: i64,
		prop_id: i32,
	) -> (Option<Entry>, Option<Entry>) {
		let mut prev = None;
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let entry = self.entry(cursor);
			if entry.key_id() == target_id && entry.prop_id() == prop_id {
				return (prev, Some(entry));
			}
			prev = Some(entry);
			cursor = entry.next();
		}
		(prev, None)
	}

	fn find_handle(&self, guard: &BucketGuard<'_>, target_id: i64, prop_id: i32) -> Handle {
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let entry = self.entry(cursor);
			if entry.key_id() == target_id && entry.prop_id() == prop_id {
				return cursor;
			}
			cursor = entry.next();
		}
		NULL_HANDLE
	}

	fn find_or_create(&self, guard: &BucketGuard<'_>, target_id: i64, prop_id: i32) -> Result<Entry> {
		if let Some(entry) = self.find(guard, target_id, prop_id) {
			return Ok(entry);
		}
		let handle = self.memory.allocate(ENTRY_SIZE)?;
		let entry = self.entry(handle);
		unsafe {
			(entry.ptr.add(ENTRY_ID) as *mut i64).write(target_id);
			(entry.ptr.add(ENTRY_PROP) as *mut i32).write(prop_id);
		}
		entry.set_base(NULL_HANDLE);
		entry.set_delta_head(NULL_HANDLE);
		entry.reader_info().clear();
		entry.set_next(guard.handle());
		guard.set_handle(handle);
		self.count.fetch_add(1, Ordering::Relaxed);
		Ok(entry)
	}

	fn lock_bucket<'t>(&self, table: &'t [Bucket], target_id: i64, prop_id: i32) -> BucketGuard<'t> {
		table[(key_hash(target_id, prop_id) as usize) & (table.len() - 1)].lock()
	}

	fn maybe_grow(&self) {
		let needed = self.count.load(Ordering::Relaxed);
		{
			let table = self.table.read();
			if needed < table.len() / 4 * 3 {
				return;
			}
		}
		let mut table = self.table.write();
		if needed < table.len() / 4 * 3 {
			return;
		}
		let new_len = (table.len() * 2).max(INITIAL_BUCKETS);
		let new_table: Box<[Bucket]> = (0..new_len).map(|_| Bucket::new()).collect();
		for bucket in table.iter() {
			let mut cursor = bucket.read_handle();
			while cursor != NULL_HANDLE {
				let entry = self.entry(cursor);
				let next = entry.next();
				let target = new_table
					[(key_hash(entry.key_id(), entry.prop_id()) as usize) & (new_len - 1)]
				.lock();
				entry.set_next(target.handle());
				target.set_handle(cursor);
				cursor = next;
			}
		}
		*table = new_table;
	}
}
