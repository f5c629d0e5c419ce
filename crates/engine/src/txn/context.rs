// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Per-transaction mutable state.
//!
//! A context records everything needed to finalize or undo the
//! transaction: written object versions, inverse-reference deltas, the
//! read locks it holds (with their overflow sets), index entries it
//! created and the per-log changeset writers. Contexts are pooled; the
//! pool index is the transaction slot used inline in reader cells.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use velox_core::{Error, Handle, Result, Version};
use velox_wire_format::{ChangesetWriter, OpPos};

/// Window into a transaction for store operations.
pub(crate) struct TxView<'a> {
	pub slot: u16,
	pub tx_id: u64,
	pub read_version: Version,
	pub ctx: &'a mut TransactionContext,
}

#[derive(Debug)]
pub(crate) struct AffectedObject {
	pub class_index: usize,
	pub id: i64,
	pub handle: Handle,
	/// Chain head this write replaced, for rollback.
	pub prev_head: Handle,
	pub prev_version: Version,
	/// Which group-commit member wrote this; 0 until merged. The member
	/// at position i publishes at the group's first version plus i.
	pub chain_pos: u16,
}

#[derive(Debug)]
pub(crate) struct AffectedInvRef {
	pub target_id: i64,
	pub prop_id: i32,
	pub delta: Handle,
	pub chain_pos: u16,
}

#[derive(Debug)]
pub(crate) struct ObjectReadLock {
	pub class_index: usize,
	pub id: i64,
	pub from_overflow: bool,
}

#[derive(Debug)]
pub(crate) struct InvRefReadLock {
	pub target_id: i64,
	pub prop_id: i32,
	pub from_overflow: bool,
}

#[derive(Debug)]
pub(crate) struct KeyReadLock {
	pub index_pos: usize,
	pub key_hash: u64,
}

#[derive(Debug)]
pub(crate) struct RangeReadLock {
	pub index_pos: usize,
	pub range_id: u64,
}

#[derive(Debug)]
pub(crate) struct IndexEntryRef {
	pub index_pos: usize,
	pub key: Vec<u8>,
	pub id: i64,
}

#[derive(Debug)]
pub(crate) struct TransactionContext {
	pub slot: u16,
	pub affected_objects: Vec<AffectedObject>,
	pub affected_inv_refs: Vec<AffectedInvRef>,
	pub object_read_locks: Vec<ObjectReadLock>,
	pub invref_read_locks: Vec<InvRefReadLock>,
	pub key_read_locks: Vec<KeyReadLock>,
	pub range_read_locks: Vec<RangeReadLock>,
	pub overflow_object: HashSet<(usize, i64)>,
	pub overflow_invref: HashSet<(i64, i32)>,
	pub inserted_entries: Vec<IndexEntryRef>,
	pub writers: Vec<ChangesetWriter>,
	/// Last wire operation per object, to set the more-ops flag when a
	/// later operation touches the same object.
	pub last_op_by_object: HashMap<i64, (usize, OpPos, Version)>,
	pub operation_count: usize,
}

impl TransactionContext {
	pub(crate) fn new(slot: u16, log_count: u8) -> Self {
		Self {
			slot,
			affected_objects: Vec::new(),
			affected_inv_refs: Vec::new(),
			object_read_locks: Vec::new(),
			invref_read_locks: Vec::new(),
			key_read_locks: Vec::new(),
			range_read_locks: Vec::new(),
			overflow_object: HashSet::new(),
			overflow_invref: HashSet::new(),
			inserted_entries: Vec::new(),
			writers: (0..log_count).map(ChangesetWriter::new).collect(),
			last_op_by_object: HashMap::new(),
			operation_count: 0,
		}
	}

	/// Routes an object to a persistence log.
	pub(crate) fn log_for(&self, id: i64) -> usize {
		(id as u64 % self.writers.len() as u64) as usize
	}

	pub(crate) fn reset(&mut self, log_count: u8) {
		self.affected_objects.clear();
		self.affected_inv_refs.clear();
		self.object_read_locks.clear();
		self.invref_read_locks.clear();
		self.key_read_locks.clear();
		self.range_read_locks.clear();
		self.overflow_object.clear();
		self.overflow_invref.clear();
		self.inserted_entries.clear();
		self.writers = (0..log_count).map(ChangesetWriter::new).collect();
		self.last_op_by_object.clear();
		self.operation_count = 0;
	}

	/// Splices a merged donor's state into this (head) context, leaving
	/// the donor empty so its pool slot frees up. The donor's entries are
	/// tagged with its position in the merge chain; wire positions inside
	/// the moved buffers are already final.
	pub(crate) fn absorb(&mut self, other: &mut TransactionContext, chain_pos: u16) -> Result<()> {
		for (writer, donor) in self.writers.iter_mut().zip(other.writers.iter_mut()) {
			let log_index = donor.log_index();
			writer.merge_from(std::mem::replace(donor, ChangesetWriter::new(log_index)))?;
		}
		for affected in &mut other.affected_objects {
			affected.chain_pos = chain_pos;
		}
		for inv in &mut other.affected_inv_refs {
			inv.chain_pos = chain_pos;
		}
		self.affected_objects.append(&mut other.affected_objects);
		self.affected_inv_refs.append(&mut other.affected_inv_refs);
		self.object_read_locks.append(&mut other.object_read_locks);
		self.invref_read_locks.append(&mut other.invref_read_locks);
		self.key_read_locks.append(&mut other.key_read_locks);
		self.range_read_locks.append(&mut other.range_read_locks);
		self.overflow_object.extend(other.overflow_object.drain());
		self.overflow_invref.extend(other.overflow_invref.drain());
		self.inserted_entries.append(&mut other.inserted_entries);
		self.operation_count += other.operation_count;
		Ok(())
	}
}

/// Fixed-size pool; the slot space is the pool index space, so slots stay
/// unique among live transactions and fit the 16-bit inline fields.
pub(crate) struct ContextPool {
	available: Mutex<Vec<Box<TransactionContext>>>,
	log_count: u8,
}

impl ContextPool {
	pub(crate) fn new(size: usize, log_count: u8) -> Self {
		debug_assert!(size < u16::MAX as usize);
		Self {
			available: Mutex::new(
				(1..=size as u16).map(|slot| Box::new(TransactionContext::new(slot, log_count))).collect(),
			),
			log_count,
		}
	}

	pub(crate) fn acquire(&self) -> Result<Box<TransactionContext>> {
		self.available.lock().pop().ok_or(Error::ConcurrentTranLimitExceeded)
	}

	pub(crate) fn release(&self, mut context: Box<TransactionContext>) {
		context.reset(self.log_count);
		self.available.lock().push(context);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pool_exhaustion_reports_limit() {
		let pool = ContextPool::new(2, 1);
		let a = pool.acquire().unwrap();
		let b = pool.acquire().unwrap();
		assert_ne!(a.slot, b.slot);
		assert_eq!(pool.acquire().unwrap_err(), Error::ConcurrentTranLimitExceeded);
		pool.release(a);
		assert!(pool.acquire().is_ok());
	}
}
