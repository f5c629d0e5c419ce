// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Hash secondary index.
//!
//! Entries are identified by (encoded key, object id); which object
//! *version* currently carries the key is resolved through the class at
//! read time, so entries survive version churn and are only dropped when
//! no version of the object carries the key anymore.

use std::sync::{
	Arc,
	atomic::{AtomicUsize, Ordering},
};

use velox_core::{Handle, MemoryManager, NULL_HANDLE, Result,
	sync::{Bucket, BucketGuard, ResizeGuarded, atomic_u64},
};
use xxhash_rust::xxh3::xxh3_64;

const INITIAL_BUCKETS: usize = 64;

const ITEM_HASH: usize = 0;
const ITEM_ID: usize = 8;
const ITEM_NEXT: usize = 16;
const ITEM_KEY_LEN: usize = 24;
const ITEM_KEY: usize = 32;

pub(crate) fn key_hash(key: &[u8]) -> u64 {
	xxh3_64(key)
}

#[derive(Clone, Copy)]
struct Item {
	ptr: *mut u8,
}

impl Item {
	fn hash(&self) -> u64 {
		unsafe { (self.ptr.add(ITEM_HASH) as *const u64).read() }
	}

	fn id(&self) -> i64 {
		unsafe { (self.ptr.add(ITEM_ID) as *const i64).read() }
	}

	fn next(&self) -> Handle {
		unsafe { atomic_u64(self.ptr.add(ITEM_NEXT)) }.load(Ordering::Acquire)
	}

	fn set_next(&self, next: Handle) {
		unsafe { atomic_u64(self.ptr.add(ITEM_NEXT)) }.store(next, Ordering::Release);
	}

	fn key(&self) -> &[u8] {
		unsafe {
			let len = (self.ptr.add(ITEM_KEY_LEN) as *const u32).read() as usize;
			std::slice::from_raw_parts(self.ptr.add(ITEM_KEY), len)
		}
	}
}

pub(crate) struct HashIndex {
	pub(crate) index_pos: usize,
	memory: Arc<MemoryManager>,
	table: ResizeGuarded<Box<[Bucket]>>,
	count: AtomicUsize,
}

impl HashIndex {
	pub(crate) fn new(memory: Arc<MemoryManager>, index_pos: usize) -> Self {
		Self {
			index_pos,
			memory,
			table: ResizeGuarded::new((0..INITIAL_BUCKETS).map(|_| Bucket::new()).collect()),
			count: AtomicUsize::new(0),
		}
	}

	/// Adds the (key, id) entry unless it is already present. Returns
	/// whether a new entry was created, which the transaction records for
	/// rollback.
	pub(crate) fn insert_entry(&self, key: &[u8], id: i64) -> Result<bool> {
		self.maybe_grow();
		let hash = key_hash(key);
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		if self.find_in_chain(&guard, hash, key, id).1.is_some() {
			return Ok(false);
		}
		let handle = self.memory.allocate(ITEM_KEY + key.len())?;
		let item = self.item(handle);
		unsafe {
			(item.ptr.add(ITEM_HASH) as *mut u64).write(hash);
			(item.ptr.add(ITEM_ID) as *mut i64).write(id);
			(item.ptr.add(ITEM_KEY_LEN) as *mut u32).write(key.len() as u32);
			std::ptr::copy_nonoverlapping(key.as_ptr(), item.ptr.add(ITEM_KEY), key.len());
		}
		item.set_next(guard.handle());
		guard.set_handle(handle);
		self.count.fetch_add(1, Ordering::Relaxed);
		Ok(true)
	}

	pub(crate) fn remove_entry(&self, key: &[u8], id: i64) {
		let hash = key_hash(key);
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		let (prev, found) = self.find_in_chain(&guard, hash, key, id);
		let Some(handle) = found else {
			return;
		};
		let item = self.item(handle);
		match prev {
			Some(p) => self.item(p).set_next(item.next()),
			None => guard.set_handle(item.next()),
		}
		self.memory.free(handle);
		self.count.fetch_sub(1, Ordering::Relaxed);
	}

	/// All object ids with an entry for `key`. The caller filters by
	/// visibility.
	pub(crate) fn lookup(&self, key: &[u8]) -> Vec<i64> {
		let hash = key_hash(key);
		let table = self.table.read();
		let guard = self.lock_bucket(&table, hash);
		let mut ids = Vec::new();
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let item = self.item(cursor);
			if item.hash() == hash && item.key() == key {
				ids.push(item.id());
			}
			cursor = item.next();
		}
		ids
	}

	fn item(&self, handle: Handle) -> Item {
		Item {
			ptr: self.memory.buffer(handle),
		}
	}

	fn find_in_chain(
		&self,
		guard: &BucketGuard<'_>,
		hash: u64,
		key: &[u8],
		id: i64,
	) -> (Option<Handle>, Option<Handle>) {
		let mut prev = None;
		let mut cursor = guard.handle();
		while cursor != NULL_HANDLE {
			let item = self.item(cursor);
			if item.hash() == hash && item.id() == id && item.key() == key {
				return (prev, Some(cursor));
			}
			prev = Some(cursor);
			cursor = item.next();
		}
		(prev, None)
	}

	fn lock_bucket<'t>(&self, table: &'t [Bucket], hash: u64) -> BucketGuard<'t> {
		table[(hash as usize) & (table.len() - 1)].lock()
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
				let item = self.item(cursor);
				let next = item.next();
				let target = new_table[(item.hash() as usize) & (new_len - 1)].lock();
				item.set_next(target.handle());
				target.set_handle(cursor);
				cursor = next;
			}
		}
		*table = new_table;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insert_lookup_remove() {
		let index = HashIndex::new(Arc::new(MemoryManager::new(16)), 0);
		assert!(index.insert_entry(b"alpha", 1).unwrap());
		assert!(index.insert_entry(b"alpha", 2).unwrap());
		assert!(!index.insert_entry(b"alpha", 1).unwrap());
		assert!(index.insert_entry(b"beta", 1).unwrap());

		let mut ids = index.lookup(b"alpha");
		ids.sort_unstable();
		assert_eq!(ids, vec![1, 2]);

		index.remove_entry(b"alpha", 1);
		assert_eq!(index.lookup(b"alpha"), vec![2]);
		assert_eq!(index.lookup(b"beta"), vec![1]);
		assert!(index.lookup(b"gamma").is_empty());
	}

	#[test]
	fn grows_past_initial_capacity() {
		let index = HashIndex::new(Arc::new(MemoryManager::new(64)), 0);
		for i in 0..500i64 {
			let key = i.to_be_bytes();
			assert!(index.insert_entry(&key, i).unwrap());
		}
		for i in 0..500i64 {
			let key = i.to_be_bytes();
			assert_eq!(index.lookup(&key), vec![i]);
		}
	}
}
