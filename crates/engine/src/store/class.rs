// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Per-class object index and version chains.
//!
//! The id table is a bucket hash from object id to the handle of the
//! current version-chain head. Writers prepend a new head carrying the
//! writing transaction's id; publication turns that id into the commit
//! version. Readers walk the chain downward and take the first version
//! visible at their snapshot.

use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};

use velox_core::{
	Error, Handle, MemoryManager, NULL_HANDLE, Result, Version, is_committed, is_tran_id,
	sync::{Bucket, BucketGuard, ResizeGuarded},
};
use xxhash_rust::xxh3::xxh3_64;

use crate::{
	lock::TakeResult,
	store::{ObjectRecord, ObjectStorage, record_size},
	txn::context::{ObjectReadLock, TxView},
};

const INITIAL_BUCKETS: usize = 64;

/// Result of locating an object at a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Visible {
	/// No version of the object is visible.
	Missing,
	/// The visible version is a tombstone.
	Deleted,
	Record(Handle),
}

/// Outcome of a successful write, carried into the transaction context by
/// the apply layer.
pub(crate) struct WriteOutcome {
	pub handle: Handle,
	/// Latest committed version of the object before this write; 0 for a
	/// new object.
	pub prev_version: Version,
	/// Chain head this write replaced, for rollback.
	pub prev_head: Handle,
}

pub(crate) struct Class {
	pub(crate) class_index: usize,
	pub(crate) property_count: usize,
	memory: Arc<MemoryManager>,
	pub(crate) storage: ObjectStorage,
	table: ResizeGuarded<Box<[Bucket]>>,
	count: AtomicUsize,
}

/// Inheritance is a tagged variant: leaves store objects, inherited
/// holders dispatch to their concrete descendants.
pub(crate) enum ClassEntry {
	Leaf(Class),
	Inherited { children: Vec<usize> },
}

impl ClassEntry {
	pub(crate) fn as_leaf(&self) -> Option<&Class> {
		match self {
			ClassEntry::Leaf(class) => Some(class),
			ClassEntry::Inherited { .. } => None,
		}
	}

}

fn id_hash(id: i64) -> u64 {
	xxh3_64(&id.to_le_bytes())
}

impl Class {
	pub(crate) fn new(
		memory: Arc<MemoryManager>,
		class_index: usize,
		property_count: usize,
	) -> Self {
		Self {
			class_index,
			property_count,
			storage: ObjectStorage::new(memory.clone(), record_size(property_count)),
			memory,
			table: ResizeGuarded::new((0..INITIAL_BUCKETS).map(|_| Bucket::new()).collect()),
			count: AtomicUsize::new(0),
		}
	}

	pub(crate) fn record(&self, handle: Handle) -> ObjectRecord {
		unsafe { ObjectRecord::new(self.memory.buffer(handle)) }
	}

	pub(crate) fn object_count(&self) -> usize {
		self.count.load(Ordering::Relaxed)
	}

	/// Reads the object at the transaction's snapshot, taking a shared
	/// object lock when asked to (read-write transactions).
	pub(crate) fn get_object(&self, tx: &mut TxView<'_>, id: i64, take_lock: bool) -> Result<Visible> {
		self.maybe_grow();
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (_, head) = find_in_chain(self, &guard, id);
		if head == NULL_HANDLE {
			return Ok(Visible::Missing);
		}
		if take_lock {
			self.take_read_lock(tx, id, self.record(head));
		}
		Ok(self.visible_in_chain(head, tx.read_version, tx.tx_id))
	}

	/// Visibility without locking, for scans and the validator.
	pub(crate) fn get_visible(&self, id: i64, read_version: Version, tx_id: u64) -> Visible {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (_, head) = find_in_chain(self, &guard, id);
		if head == NULL_HANDLE {
			return Visible::Missing;
		}
		self.visible_in_chain(head, read_version, tx_id)
	}

	/// Whether `handle` is the version of `id` visible at the snapshot;
	/// scan ranges use this to drop stale or recycled buffers.
	pub(crate) fn is_current_visible(&self, id: i64, handle: Handle, read_version: Version, tx_id: u64) -> bool {
		self.get_visible(id, read_version, tx_id) == Visible::Record(handle)
	}

	/// Runs `f` over the version chain of `id` under the bucket lock,
	/// newest first. Used for current-state checks like uniqueness.
	pub(crate) fn with_chain<R>(&self, id: i64, f: impl FnOnce(ChainCursor<'_>) -> R) -> R {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (_, head) = find_in_chain(self, &guard, id);
		f(ChainCursor {
			class: self,
			head,
		})
	}

	pub(crate) fn insert(
		&self,
		tx: &mut TxView<'_>,
		id: i64,
		init: impl FnOnce(&ObjectRecord) -> Result<()>,
	) -> Result<WriteOutcome> {
		self.maybe_grow();
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (prev, head) = find_in_chain(self, &guard, id);
		if head != NULL_HANDLE {
			self.check_write_conflict(tx, id, self.record(head))?;
			// Post-conflict the head is ours or committed-visible.
			if !self.record(head).is_tombstone() {
				return Err(Error::UniqueViolation(0));
			}
		}

		let handle = self.storage.allocate()?;
		let record = self.record(handle);
		record.set_id(id);
		record.set_version(tx.tx_id);
		record.init_chain(head, false);
		if head != NULL_HANDLE {
			record.reader_info().copy_from(self.record(head).reader_info());
			record.set_next_collision(self.record(head).next_collision());
		} else {
			record.reader_info().clear();
			record.set_next_collision(guard.handle());
		}
		record.zero_props(self.property_count);
		if let Err(e) = init(&record) {
			self.storage.free_unmarked(handle);
			return Err(e);
		}
		self.storage.mark_used(handle);
		if head != NULL_HANDLE {
			// Replaces the old head in place within the collision chain.
			self.link_head(&guard, prev, handle);
		} else {
			// New entry; it already links the previous bucket head.
			guard.set_handle(handle);
			self.count.fetch_add(1, Ordering::Relaxed);
		}
		Ok(WriteOutcome {
			handle,
			prev_version: self.prev_committed(head),
			prev_head: head,
		})
	}

	/// `conflict_checked` is false only for default-value maintenance
	/// blocks, which originate from schema upkeep rather than user
	/// transactions.
	pub(crate) fn update(
		&self,
		tx: &mut TxView<'_>,
		id: i64,
		conflict_checked: bool,
		apply: impl FnOnce(&ObjectRecord, &ObjectRecord) -> Result<()>,
	) -> Result<WriteOutcome> {
		self.write_over(tx, id, false, conflict_checked, apply)
	}

	pub(crate) fn delete(&self, tx: &mut TxView<'_>, id: i64) -> Result<WriteOutcome> {
		self.write_over(tx, id, true, true, |_, _| Ok(()))
	}

	fn write_over(
		&self,
		tx: &mut TxView<'_>,
		id: i64,
		tombstone: bool,
		conflict_checked: bool,
		apply: impl FnOnce(&ObjectRecord, &ObjectRecord) -> Result<()>,
	) -> Result<WriteOutcome> {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (prev, head) = find_in_chain(self, &guard, id);
		if head == NULL_HANDLE {
			return Err(Error::NotFound);
		}
		if conflict_checked {
			self.check_write_conflict(tx, id, self.record(head))?;
		}
		let current = self.record(head);
		if current.is_tombstone() {
			return Err(Error::NotFound);
		}

		let handle = self.storage.allocate()?;
		let record = self.record(handle);
		record.set_id(id);
		record.set_version(tx.tx_id);
		record.init_chain(head, tombstone);
		record.reader_info().copy_from(current.reader_info());
		record.set_next_collision(current.next_collision());
		if tombstone {
			record.zero_props(self.property_count);
		} else {
			record.copy_props_from(&current, self.property_count);
		}
		if let Err(e) = apply(&current, &record) {
			self.storage.free_unmarked(handle);
			return Err(e);
		}
		self.storage.mark_used(handle);
		self.link_head(&guard, prev, handle);
		Ok(WriteOutcome {
			handle,
			prev_version: self.prev_committed(head),
			prev_head: head,
		})
	}

	/// Undoes one write; `on_free` sees the record before its buffer is
	/// recycled.
	pub(crate) fn rollback_write(
		&self,
		id: i64,
		handle: Handle,
		prev_head: Handle,
		on_free: &mut dyn FnMut(&ObjectRecord),
	) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (prev, head) = find_in_chain(self, &guard, id);
		debug_assert_eq!(head, handle);
		if head != handle {
			return;
		}
		let record = self.record(handle);
		if prev_head != NULL_HANDLE {
			let restored = self.record(prev_head);
			// Readers may have locked the object while our head was
			// current; the cell travels back with the head.
			restored.reader_info().copy_from(record.reader_info());
			restored.set_next_collision(record.next_collision());
			self.link_head(&guard, prev, prev_head);
		} else {
			match prev {
				Some(p) => self.record(p).set_next_collision(record.next_collision()),
				None => guard.set_handle(record.next_collision()),
			}
			self.count.fetch_sub(1, Ordering::Relaxed);
		}
		on_free(&record);
		self.storage.free(handle);
	}

	/// Publishes a write by stamping the commit version over the
	/// transaction id.
	pub(crate) fn finalize_object(&self, handle: Handle, commit_version: Version) {
		self.record(handle).set_version(commit_version);
	}

	pub(crate) fn finalize_read_lock(
		&self,
		lock: &ObjectReadLock,
		slot: u16,
		commit_version: Option<Version>,
	) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, lock.id);
		let (_, head) = find_in_chain(self, &guard, lock.id);
		// The entry can be gone when the writer that created it rolled
		// back; the lock is moot then.
		if head != NULL_HANDLE {
			self.record(head).reader_info().finalize(slot, lock.from_overflow, commit_version);
		}
	}

	/// Moves an inline read-lock slot to the merge head's slot.
	pub(crate) fn remap_read_lock(&self, id: i64, prev_slot: u16, new_slot: u16) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (_, head) = find_in_chain(self, &guard, id);
		if head != NULL_HANDLE {
			self.record(head).reader_info().remap_slot(prev_slot, new_slot);
		}
	}

	/// Frees every version no active reader can observe. `on_free` runs
	/// under the bucket lock for each freed record while it is still
	/// intact, receiving the head of the surviving chain (null when the
	/// whole entry went away) so the caller can decide which index
	/// entries and string references to drop.
	pub(crate) fn garbage_collect(
		&self,
		id: i64,
		oldest: Version,
		on_free: &mut dyn FnMut(&ObjectRecord, Handle),
	) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (prev, head) = find_in_chain(self, &guard, id);
		if head == NULL_HANDLE {
			return;
		}

		let mut keep = NULL_HANDLE;
		let mut cursor = head;
		while cursor != NULL_HANDLE {
			let record = self.record(cursor);
			let version = record.version();
			if is_committed(version) && version <= oldest {
				keep = cursor;
				break;
			}
			cursor = record.next_version();
		}
		if keep == NULL_HANDLE {
			return;
		}

		let keep_record = self.record(keep);
		let mut tail = keep_record.next_version();
		keep_record.set_next_version(NULL_HANDLE);
		while tail != NULL_HANDLE {
			let record = self.record(tail);
			let next = record.next_version();
			on_free(&record, head);
			self.storage.free(tail);
			tail = next;
		}

		// A tombstoned head nobody can observe removes the whole entry.
		if keep == head
			&& keep_record.is_tombstone()
			&& keep_record.reader_info().lock_count() == 0
			&& keep_record.reader_info().committed_version() <= oldest
		{
			match prev {
				Some(p) => self.record(p).set_next_collision(keep_record.next_collision()),
				None => guard.set_handle(keep_record.next_collision()),
			}
			on_free(&keep_record, NULL_HANDLE);
			self.storage.free(keep);
			self.count.fetch_sub(1, Ordering::Relaxed);
		}
	}

	/// Discards every version above `target`, restoring the newest
	/// surviving record as the head. Runs quiesced (no concurrent
	/// transactions); used by rewind.
	pub(crate) fn rewind_discard(
		&self,
		id: i64,
		target: Version,
		on_free: &mut dyn FnMut(&ObjectRecord, Handle),
	) {
		let table = self.table.read();
		let guard = self.lock_bucket(&table, id);
		let (prev, head) = find_in_chain(self, &guard, id);
		if head == NULL_HANDLE {
			return;
		}

		let mut survivor = head;
		while survivor != NULL_HANDLE {
			let record = self.record(survivor);
			let version = record.version();
			if is_committed(version) && version <= target {
				break;
			}
			survivor = record.next_version();
		}
		if survivor == head {
			return;
		}

		if survivor != NULL_HANDLE {
			let restored = self.record(survivor);
			restored.reader_info().copy_from(self.record(head).reader_info());
			restored.set_next_collision(self.record(head).next_collision());
			self.link_head(&guard, prev, survivor);
		} else {
			match prev {
				Some(p) => self.record(p).set_next_collision(self.record(head).next_collision()),
				None => guard.set_handle(self.record(head).next_collision()),
			}
			self.count.fetch_sub(1, Ordering::Relaxed);
		}

		let mut cursor = head;
		while cursor != survivor {
			let record = self.record(cursor);
			let next = record.next_version();
			on_free(&record, survivor);
			self.storage.free(cursor);
			cursor = next;
		}
	}

	fn take_read_lock(&self, tx: &mut TxView<'_>, id: i64, head: ObjectRecord) {
		let key = (self.class_index, id);
		let in_overflow = tx.ctx.overflow_object.contains(&key);
		match head.reader_info().take_lock(tx.slot, in_overflow) {
			TakeResult::AlreadyHeld => {}
			TakeResult::Inline => tx.ctx.object_read_locks.push(ObjectReadLock {
				class_index: self.class_index,
				id,
				from_overflow: false,
			}),
			TakeResult::Overflow => {
				tx.ctx.overflow_object.insert(key);
				tx.ctx.object_read_locks.push(ObjectReadLock {
					class_index: self.class_index,
					id,
					from_overflow: true,
				});
			}
		}
	}

	fn check_write_conflict(&self, tx: &TxView<'_>, id: i64, head: ObjectRecord) -> Result<()> {
		let version = head.version();
		if is_tran_id(version) && version != tx.tx_id {
			return Err(Error::Conflict);
		}
		if is_committed(version) && version > tx.read_version {
			return Err(Error::Conflict);
		}
		let in_overflow = tx.ctx.overflow_object.contains(&(self.class_index, id));
		if head.reader_info().is_in_conflict(tx.slot, tx.read_version, in_overflow) {
			return Err(Error::Conflict);
		}
		Ok(())
	}

	fn visible_in_chain(&self, head: Handle, read_version: Version, tx_id: u64) -> Visible {
		let mut cursor = head;
		while cursor != NULL_HANDLE {
			let record = self.record(cursor);
			let version = record.version();
			let visible = if is_tran_id(version) {
				version == tx_id
			} else {
				is_committed(version) && version <= read_version
			};
			if visible {
				return if record.is_tombstone() { Visible::Deleted } else { Visible::Record(cursor) };
			}
			cursor = record.next_version();
		}
		Visible::Missing
	}

	fn prev_committed(&self, head: Handle) -> Version {
		let mut cursor = head;
		while cursor != NULL_HANDLE {
			let record = self.record(cursor);
			let version = record.version();
			if is_committed(version) {
				return version;
			}
			cursor = record.next_version();
		}
		0
	}

	fn link_head(&self, guard: &BucketGuard<'_>, prev: Option<Handle>, new_head: Handle) {
		match prev {
			Some(p) => self.record(p).set_next_collision(new_head),
			None => guard.set_handle(new_head),
		}
	}

	fn lock_bucket<'t>(&self, table: &'t [Bucket], id: i64) -> BucketGuard<'t> {
		table[(id_hash(id) as usize) & (table.len() - 1)].lock()
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
				let record = self.record(cursor);
				let next = record.next_collision();
				let target = new_table[(id_hash(record.id()) as usize) & (new_len - 1)].lock();
				record.set_next_collision(target.handle());
				target.set_handle(cursor);
				cursor = next;
			}
		}
		*table = new_table;
	}
}

/// Bucket-locked view of one object's version chain.
pub(crate) struct ChainCursor<'a> {
	class: &'a Class,
	head: Handle,
}

impl ChainCursor<'_> {
	pub(crate) fn head(&self) -> Option<ObjectRecord> {
		if self.head == NULL_HANDLE { None } else { Some(self.class.record(self.head)) }
	}

	/// Newest committed record, skipping uncommitted heads.
	pub(crate) fn newest_committed(&self) -> Option<ObjectRecord> {
		let mut cursor = self.head;
		while cursor != NULL_HANDLE {
			let record = self.class.record(cursor);
			if is_committed(record.version()) {
				return Some(record);
			}
			cursor = record.next_version();
		}
		None
	}

	/// Newest committed record at or below the snapshot.
	pub(crate) fn newest_committed_at(&self, read_version: Version) -> Option<ObjectRecord> {
		let mut cursor = self.head;
		while cursor != NULL_HANDLE {
			let record = self.class.record(cursor);
			let version = record.version();
			if is_committed(version) && version <= read_version {
				return Some(record);
			}
			cursor = record.next_version();
		}
		None
	}
}

/// Locates the chain node for `id` in the bucket's collision chain. The
/// predecessor is only meaningful when the id was found.
fn find_in_chain(class: &Class, guard: &BucketGuard<'_>, id: i64) -> (Option<Handle>, Handle) {
	let mut prev = None;
	let mut cursor = guard.handle();
	while cursor != NULL_HANDLE {
		let record = class.record(cursor);
		if record.id() == id {
			return (prev, cursor);
		}
		prev = Some(cursor);
		cursor = record.next_collision();
	}
	(None, NULL_HANDLE)
}
