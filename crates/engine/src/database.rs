// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Database wiring.
//!
//! Owns every store and the transaction machinery, and implements the
//! commit path: validation, version assignment, persister hand-off,
//! ordered publication, finalization, rollback and garbage collection
//! execution.

use std::{
	collections::HashMap,
	sync::{Arc, Weak, atomic::Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, error, trace};
use velox_catalog::{ClassMeta, IndexKind, IndexMeta, Model, PropertyType, class_id_of};
use velox_core::{
	Error, Handle, MemoryManager, NULL_HANDLE, Result, Version,
	blobs::BlobStorage,
	strings::StringStorage,
	sync::EngineLock,
};
use velox_wire_format::ChangeSet;

use crate::{
	config::StorageEngineConfig,
	index::{HashIndex, HashKeyReadLocker, IndexRuntime, KeyWriter, SortedIndex},
	integrity,
	persist::{CommitRequest, Persister},
	store::{Class, ClassEntry, InverseReferenceMap, ObjectRecord},
	txn::{
		context::{ContextPool, TransactionContext},
		gc::{GarbageCollector, GcItem, GcWork},
		orderer::CommitOrderer,
		slots::TranIdGenerator,
		transaction::{TranSource, TranState, TranType, Transaction},
		versions::DatabaseVersions,
	},
};

pub(crate) struct Database {
	pub model: Model,
	pub config: StorageEngineConfig,
	pub memory: Arc<MemoryManager>,
	pub strings: StringStorage,
	pub blobs: BlobStorage,
	pub classes: Vec<ClassEntry>,
	pub inv_refs: InverseReferenceMap,
	pub indexes: Vec<IndexRuntime>,
	pub versions: DatabaseVersions,
	pub orderer: CommitOrderer,
	pub gc: GarbageCollector,
	pub engine_lock: EngineLock,
	pub contexts: ContextPool,
	pub tran_ids: TranIdGenerator,
	pub persister: Arc<dyn Persister>,
	pub commit_subscribers: Mutex<Vec<Box<dyn Fn(Version) + Send + Sync>>>,
	pub active_txs: Mutex<HashMap<u64, Weak<Transaction>>>,
	/// Serializes publication decisions against the read-version cursor.
	publish_lock: Mutex<()>,
}

impl Database {
	pub(crate) fn new(
		model: Model,
		config: StorageEngineConfig,
		persister: Arc<dyn Persister>,
	) -> Result<Database> {
		let memory = Arc::new(MemoryManager::new(config.max_blocks));

		let mut classes = Vec::with_capacity(model.class_count());
		for meta in model.classes() {
			if meta.desc.is_abstract {
				classes.push(ClassEntry::Inherited {
					children: meta.concrete_descendants.clone(),
				});
			} else {
				classes.push(ClassEntry::Leaf(Class::new(
					memory.clone(),
					meta.index,
					meta.property_count(),
				)));
			}
		}

		let mut indexes = Vec::with_capacity(model.index_count());
		for meta in model.indexes() {
			match meta.desc.kind {
				IndexKind::Hash => indexes.push(IndexRuntime::Hash {
					index: HashIndex::new(memory.clone(), meta.index),
					locker: HashKeyReadLocker::new(memory.clone(), meta.index),
				}),
				IndexKind::Sorted => indexes.push(IndexRuntime::Sorted {
					index: SortedIndex::new(meta.index),
				}),
			}
		}

		Ok(Database {
			strings: StringStorage::new(memory.clone()),
			blobs: BlobStorage::new(memory.clone()),
			classes,
			inv_refs: InverseReferenceMap::new(memory.clone()),
			indexes,
			versions: DatabaseVersions::new(0),
			orderer: CommitOrderer::new(),
			gc: GarbageCollector::new(config.gc_workers),
			engine_lock: EngineLock::new(),
			contexts: ContextPool::new(config.context_pool_size, config.log_count),
			tran_ids: TranIdGenerator::new(),
			persister,
			commit_subscribers: Mutex::new(Vec::new()),
			active_txs: Mutex::new(HashMap::new()),
			publish_lock: Mutex::new(()),
			memory,
			model,
			config,
		})
	}

	pub(crate) fn leaf_class(&self, class_index: usize) -> Result<&Class> {
		self.classes
			.get(class_index)
			.and_then(ClassEntry::as_leaf)
			.ok_or(Error::InvalidArgument("class is abstract or unknown"))
	}

	pub(crate) fn class_meta_of_object(&self, id: i64) -> Result<&ClassMeta> {
		let class_index = self
			.model
			.class_index_of(class_id_of(id))
			.ok_or(Error::InvalidArgument("object id names an unknown class"))?;
		Ok(self.model.class(class_index))
	}

	// ------------------------------------------------------------------
	// Transaction lifecycle
	// ------------------------------------------------------------------

	pub(crate) fn begin_transaction(
		self: &Arc<Self>,
		tran_type: TranType,
		source: TranSource,
		allow_other_writes: bool,
		alignment: bool,
		propagated: bool,
		preassigned_commit: Option<(Version, u64)>,
	) -> Result<Arc<Transaction>> {
		if self.engine_lock.is_draining() {
			return Err(Error::TransactionCanceled);
		}
		self.engine_lock.enter_read();

		let context = if tran_type == TranType::ReadWrite {
			match self.contexts.acquire() {
				Ok(context) => Some(context),
				Err(e) => {
					self.engine_lock.exit_read();
					return Err(e);
				}
			}
		} else {
			None
		};
		let slot = context.as_ref().map(|c| c.slot).unwrap_or(0);
		let id = self.tran_ids.next();

		// Snapshot capture and GC registration are one critical section,
		// so the watermark can never pass a snapshot that is about to
		// register.
		let read_version = self.gc.register(id, || self.versions.read_version());

		let tx = Arc::new(Transaction::new(
			tran_type,
			source,
			id,
			slot,
			read_version,
			allow_other_writes,
			alignment,
			propagated,
			preassigned_commit,
			context,
		));
		self.active_txs.lock().insert(id, Arc::downgrade(&tx));
		trace!(tx_id = id, read_version, "transaction started");
		Ok(tx)
	}

	/// Completes a read-only transaction; it holds no locks and owns no
	/// context.
	pub(crate) fn complete_read(&self, tx: &Arc<Transaction>) -> Result<Version> {
		if !tx.begin_commit() {
			return Err(Error::InvalidArgument("transaction already completed"));
		}
		tx.set_state(TranState::Committed);
		self.detach(tx, None);
		Ok(tx.read_version)
	}

	fn detach(&self, tx: &Transaction, item: Option<GcItem>) {
		self.active_txs.lock().remove(&tx.id);
		self.gc.transaction_completed(tx.id, tx.read_version, item, tx.alignment, || {
			self.collect_horizon()
		});
		self.engine_lock.exit_read();
	}

	/// Highest version the garbage collector may free below: the recent
	/// window stays intact so it remains rewindable.
	fn collect_horizon(&self) -> Version {
		self.versions.read_version().saturating_sub(self.config.rewind_retention)
	}

	// ------------------------------------------------------------------
	// Commit path
	// ------------------------------------------------------------------

	/// Merges a small transaction into the head's group commit. The donor
	/// hands its context to the head: its records are restamped under the
	/// head's transaction id, its inline lock slots remapped to the
	/// head's slot, its lists spliced in tagged with the chain position,
	/// and its pool slot freed. Each member still receives its own commit
	/// version at publication.
	pub(crate) fn merge_transactions(&self, head: &Arc<Transaction>, donor: Arc<Transaction>) -> Result<()> {
		// Chain first: any failure below then fails the donor's waiters
		// along with the head's.
		let chain_pos = {
			let mut cursor = head.clone();
			let mut position = 1u16;
			loop {
				let next = {
					let mut link = cursor.next_merged.lock();
					match link.as_ref() {
						Some(next) => next.clone(),
						None => {
							*link = Some(donor.clone());
							break;
						}
					}
				};
				position += 1;
				cursor = next;
			}
			position
		};

		let mut donor_ctx =
			donor.context.lock().take().ok_or(Error::Critical("merged transaction has no context"))?;
		if let Err(e) = self.adopt_context(head, &donor, &mut donor_ctx, chain_pos) {
			// Hand the context back so the group rollback undoes it.
			*donor.context.lock() = Some(donor_ctx);
			return Err(e);
		}
		head.operation_count.fetch_add(donor.operation_count.load(Ordering::Relaxed), Ordering::Relaxed);
		self.contexts.release(donor_ctx);
		Ok(())
	}

	/// Restamps, remaps and splices the donor context into the head's.
	fn adopt_context(
		&self,
		head: &Arc<Transaction>,
		donor: &Arc<Transaction>,
		donor_ctx: &mut TransactionContext,
		chain_pos: u16,
	) -> Result<()> {
		// The head sees the donor's writes as its own during validation
		// and propagation; exact member versions are stamped back at
		// publication from the chain position.
		for affected in &donor_ctx.affected_objects {
			let class = self.leaf_class(affected.class_index)?;
			class.finalize_object(affected.handle, head.id);
		}
		for inv in &donor_ctx.affected_inv_refs {
			self.inv_refs.finalize_delta(inv.delta, head.id);
		}

		// Inline reader slots move to the head's slot; overflowed locks
		// travel with the overflow sets.
		for lock in &donor_ctx.object_read_locks {
			if !lock.from_overflow {
				let class = self.leaf_class(lock.class_index)?;
				class.remap_read_lock(lock.id, donor.slot, head.slot);
			}
		}
		for lock in &donor_ctx.invref_read_locks {
			if !lock.from_overflow {
				self.inv_refs.remap_read_lock(lock.target_id, lock.prop_id, donor.slot, head.slot);
			}
		}
		for lock in &donor_ctx.key_read_locks {
			if let IndexRuntime::Hash { locker, .. } = &self.indexes[lock.index_pos] {
				locker.remap(lock.key_hash, donor.slot, head.slot);
			}
		}
		for lock in &donor_ctx.range_read_locks {
			if let IndexRuntime::Sorted { index } = &self.indexes[lock.index_pos] {
				index.ranges.remap(lock.range_id, donor.slot, head.slot);
			}
		}

		let mut guard = head.context.lock();
		let head_ctx = guard.as_mut().ok_or(Error::Critical("commit head transaction has no context"))?;
		head_ctx.absorb(donor_ctx, chain_pos)
	}

	/// The merge chain in linkage order, head first.
	fn chain_of(&self, head: &Arc<Transaction>) -> Vec<Arc<Transaction>> {
		let mut chain = vec![head.clone()];
		let mut cursor = head.next_merged.lock().clone();
		while let Some(tx) = cursor {
			cursor = tx.next_merged.lock().clone();
			chain.push(tx);
		}
		chain
	}

	/// Validates, assigns versions and hands the group commit to the
	/// persister. Called on a commit worker; the head context carries the
	/// whole group.
	pub(crate) fn commit_transaction_internal(self: &Arc<Self>, head: Arc<Transaction>) {
		if let Err(e) = integrity::validate_and_propagate(self, &head) {
			debug!(tx_id = head.id, error = %e, "commit validation failed");
			self.rollback_chain(&head, e);
			return;
		}

		let changeset = {
			let mut guard = head.context.lock();
			let Some(ctx) = guard.as_mut() else {
				self.rollback_chain(&head, Error::Critical("commit head transaction has no context"));
				return;
			};
			let writers = std::mem::take(&mut ctx.writers);
			let mut logs = Vec::with_capacity(writers.len());
			let mut failure = None;
			for writer in writers {
				match writer.finish() {
					Ok(log) if !log.buffers.is_empty() => logs.push(log),
					Ok(_) => {}
					Err(e) => {
						failure = Some(e);
						break;
					}
				}
			}
			drop(guard);
			if let Some(e) = failure {
				self.rollback_chain(&head, e);
				return;
			}
			ChangeSet {
				logs,
			}
		};

		// Every member receives its own commit version; the group shares
		// one log entry.
		let chain = self.chain_of(&head);
		let (first_version, log_seq) = match head.preassigned_commit {
			Some(preassigned) => {
				debug_assert_eq!(chain.len(), 1);
				self.versions.assign_commit(Some(preassigned))
			}
			None => self.versions.assign_commit_range(chain.len() as u64),
		};
		for (offset, tx) in chain.iter().enumerate() {
			tx.commit_version.store(first_version + offset as u64, Ordering::Release);
			tx.log_seq.store(log_seq, Ordering::Release);
		}

		let request = CommitRequest {
			commit_version: first_version,
			log_seq,
			changeset: changeset.serialize(),
			merged_count: chain.len(),
		};
		let db = self.clone();
		let published = head.clone();
		trace!(tx_id = head.id, first_version, merged = chain.len(), "commit handed to persister");
		self.persister.begin_commit_transaction(
			request,
			Box::new(move |result| match result {
				Ok(()) => db.publish_transaction_commit(published),
				Err(e) => {
					// A version was assigned; skipping it would stall
					// ordered publication forever.
					error!(error = %e, "persister failed to append commit; engine is unrecoverable");
					db.fail_chain(&published, Error::Critical("persistence append failed"));
				}
			}),
		);
	}

	/// Ordered publication: a group publishes when it is an alignment or
	/// its first version is exactly next, otherwise it parks in the
	/// orderer until its predecessor publishes.
	pub(crate) fn publish_transaction_commit(&self, head: Arc<Transaction>) {
		let _publish = self.publish_lock.lock();
		let next = self.versions.read_version() + 1;
		if head.alignment || head.commit_version() == next {
			self.publish_chain(head);
			loop {
				let next = self.versions.read_version() + 1;
				match self.orderer.take_exact(next) {
					Some(pending) => self.publish_chain(pending),
					None => break,
				}
			}
		} else {
			self.orderer.park(head);
		}
	}

	/// Publishes every member of the group in version order. The whole
	/// group finalizes up front: versions stamped above the current read
	/// version stay invisible until the cursor reaches them.
	fn publish_chain(&self, head: Arc<Transaction>) {
		let chain = self.chain_of(&head);
		let first_version = head.commit_version();
		let last_version = first_version + chain.len() as u64 - 1;
		let mut item = Some(self.finalize_group(&head, first_version, last_version));

		for (offset, tx) in chain.iter().enumerate() {
			let commit_version = first_version + offset as u64;
			debug_assert_eq!(tx.commit_version(), commit_version);
			self.versions.publish(commit_version, None);
			trace!(tx_id = tx.id, commit_version, "transaction published");

			tx.next_merged.lock().take();
			tx.set_state(TranState::Committed);
			self.finish(tx, Ok(commit_version));
			// The group's garbage travels with its last member so the
			// uncollected queue stays ordered by commit version.
			let group_item = if offset + 1 == chain.len() { item.take() } else { None };
			self.detach(tx, group_item);

			for subscriber in self.commit_subscribers.lock().iter() {
				subscriber(commit_version);
			}
		}
	}

	/// Stamps each member's commit version over the shared transaction
	/// id (the chain position picks the version within the group's
	/// range), raises read-lock watermarks to the group's last version
	/// and releases the locks, and assembles the group's GC item.
	fn finalize_group(&self, head: &Arc<Transaction>, first_version: Version, last_version: Version) -> GcItem {
		let mut guard = head.context.lock();
		let Some(ctx) = guard.as_mut() else {
			return GcItem {
				commit_version: last_version,
				objects: Vec::new(),
				inv_refs: Vec::new(),
				key_locks: Vec::new(),
				range_indexes: Vec::new(),
			};
		};

		for affected in &ctx.affected_objects {
			if let Ok(class) = self.leaf_class(affected.class_index) {
				class.finalize_object(affected.handle, first_version + affected.chain_pos as u64);
			}
		}
		for inv in &ctx.affected_inv_refs {
			self.inv_refs.finalize_delta(inv.delta, first_version + inv.chain_pos as u64);
		}
		for lock in &ctx.object_read_locks {
			if let Ok(class) = self.leaf_class(lock.class_index) {
				class.finalize_read_lock(lock, ctx.slot, Some(last_version));
			}
		}
		for lock in &ctx.invref_read_locks {
			self.inv_refs.finalize_read_lock(lock, ctx.slot, Some(last_version));
		}
		for lock in &ctx.key_read_locks {
			if let IndexRuntime::Hash { locker, .. } = &self.indexes[lock.index_pos] {
				locker.finalize(lock.key_hash, ctx.slot, Some(last_version));
			}
		}
		for lock in &ctx.range_read_locks {
			if let IndexRuntime::Sorted { index } = &self.indexes[lock.index_pos] {
				index.ranges.finalize(lock.range_id, ctx.slot, Some(last_version));
			}
		}

		let mut objects: Vec<(usize, i64)> =
			ctx.affected_objects.iter().map(|a| (a.class_index, a.id)).collect();
		objects.sort_unstable();
		objects.dedup();
		// Read-locked entries come along so lock-only entries (an empty
		// set read during propagation, say) get reclaimed as well.
		let mut inv_refs: Vec<(i64, i32)> = ctx
			.affected_inv_refs
			.iter()
			.map(|a| (a.target_id, a.prop_id))
			.chain(ctx.invref_read_locks.iter().map(|l| (l.target_id, l.prop_id)))
			.collect();
		inv_refs.sort_unstable();
		inv_refs.dedup();
		let mut key_locks: Vec<(usize, u64)> =
			ctx.key_read_locks.iter().map(|l| (l.index_pos, l.key_hash)).collect();
		key_locks.sort_unstable();
		key_locks.dedup();
		let mut range_indexes: Vec<usize> = ctx.range_read_locks.iter().map(|l| l.index_pos).collect();
		range_indexes.sort_unstable();
		range_indexes.dedup();

		let context = guard.take();
		drop(guard);
		if let Some(context) = context {
			self.contexts.release(context);
		}

		GcItem {
			commit_version: last_version,
			objects,
			inv_refs,
			key_locks,
			range_indexes,
		}
	}

	/// Undoes everything every group member wrote and completes each with
	/// the error.
	pub(crate) fn rollback_chain(&self, head: &Arc<Transaction>, reason: Error) {
		for tx in self.chain_of(head) {
			let context = tx.context.lock().take();
			if let Some(mut ctx) = context {
				self.undo_context(&mut ctx);
				self.contexts.release(ctx);
			}
			tx.next_merged.lock().take();
			tx.set_state(TranState::RolledBack);
			self.finish(&tx, Err(reason.clone()));
			self.detach(&tx, None);
		}
	}

	/// Completion path for commits that can no longer roll back (a
	/// version was assigned but persistence failed). State is left as-is
	/// and the engine is effectively dead.
	fn fail_chain(&self, head: &Arc<Transaction>, reason: Error) {
		for tx in self.chain_of(head) {
			self.finish(&tx, Err(reason.clone()));
		}
	}

	fn undo_context(&self, ctx: &mut TransactionContext) {
		for entry in ctx.inserted_entries.drain(..).rev() {
			match &self.indexes[entry.index_pos] {
				IndexRuntime::Hash { index, .. } => index.remove_entry(&entry.key, entry.id),
				IndexRuntime::Sorted { index } => index.remove_entry(&entry.key, entry.id),
			}
		}
		for affected in ctx.affected_objects.drain(..).rev() {
			if let Ok(class) = self.leaf_class(affected.class_index) {
				class.rollback_write(affected.id, affected.handle, affected.prev_head, &mut |record| {
					self.release_value_storage(affected.class_index, record);
				});
			}
		}
		for inv in ctx.affected_inv_refs.drain(..).rev() {
			self.inv_refs.rollback_delta(inv.target_id, inv.prop_id, inv.delta);
		}
		for lock in ctx.object_read_locks.drain(..) {
			if let Ok(class) = self.leaf_class(lock.class_index) {
				class.finalize_read_lock(&lock, ctx.slot, None);
			}
		}
		for lock in ctx.invref_read_locks.drain(..) {
			self.inv_refs.finalize_read_lock(&lock, ctx.slot, None);
		}
		for lock in ctx.key_read_locks.drain(..) {
			if let IndexRuntime::Hash { locker, .. } = &self.indexes[lock.index_pos] {
				locker.finalize(lock.key_hash, ctx.slot, None);
			}
		}
		for lock in ctx.range_read_locks.drain(..) {
			if let IndexRuntime::Sorted { index } = &self.indexes[lock.index_pos] {
				index.ranges.finalize(lock.range_id, ctx.slot, None);
			}
		}
	}

	fn finish(&self, tx: &Arc<Transaction>, result: Result<Version>) {
		*tx.result.lock() = Some(result.clone());
		if let Some(callback) = tx.callback.lock().take() {
			callback(result);
		}
		tx.completion.set();
	}

	/// Frees the string and blob handles a record owns.
	pub(crate) fn release_value_storage(&self, class_index: usize, record: &ObjectRecord) {
		let meta = self.model.class(class_index);
		for (slot, property) in meta.properties.iter().enumerate() {
			let handle = record.prop(slot);
			if handle == NULL_HANDLE {
				continue;
			}
			match property.ptype {
				PropertyType::String => self.strings.dec_ref(handle),
				PropertyType::ReferenceArray => self.blobs.dec_ref(handle),
				_ => {}
			}
		}
	}

	// ------------------------------------------------------------------
	// Index keys
	// ------------------------------------------------------------------

	/// Encodes the index key carried by a record. Null strings get a
	/// leading 0 marker so they order before every present value.
	pub(crate) fn key_of_record(&self, index: &IndexMeta, meta: &ClassMeta, record: &ObjectRecord) -> Vec<u8> {
		let mut writer = KeyWriter::new();
		for &property_id in &index.desc.properties {
			let Some(slot) = meta.slot_of(property_id) else {
				continue;
			};
			let raw = record.prop(slot);
			match meta.property(slot).ptype {
				PropertyType::Bool => writer.add_bool(raw != 0),
				PropertyType::Int => writer.add_int(raw as i64 as i32),
				PropertyType::Long | PropertyType::DateTime | PropertyType::Reference => {
					writer.add_long(raw as i64)
				}
				PropertyType::Double => writer.add_double(f64::from_bits(raw)),
				PropertyType::String => {
					if raw == NULL_HANDLE {
						writer.add_bool(false);
					} else {
						writer.add_bool(true);
						writer.add_string(unsafe { self.strings.get(raw) });
					}
				}
				PropertyType::ReferenceArray => {}
			}
		}
		writer.into_bytes()
	}

	/// Encodes a query key from host-supplied values, validated against
	/// the index key types.
	pub(crate) fn key_of_values(
		&self,
		index: &IndexMeta,
		values: &[velox_wire_format::PropertyValue],
	) -> Result<Vec<u8>> {
		use velox_wire_format::{PropertyValue, StringValue};
		if values.len() != index.key_types.len() {
			return Err(Error::InvalidArgument("index key value count differs from key shape"));
		}
		let mut writer = KeyWriter::new();
		for (value, &ptype) in values.iter().zip(index.key_types.iter()) {
			match (value, ptype) {
				(PropertyValue::Bool(v), PropertyType::Bool) => writer.add_bool(*v),
				(PropertyValue::Int(v), PropertyType::Int) => writer.add_int(*v),
				(PropertyValue::Long(v), PropertyType::Long) => writer.add_long(*v),
				(PropertyValue::DateTime(v), PropertyType::DateTime) => writer.add_long(*v),
				(PropertyValue::Reference(v), PropertyType::Reference) => writer.add_long(*v),
				(PropertyValue::Double(v), PropertyType::Double) => writer.add_double(*v),
				(PropertyValue::String(StringValue::Null), PropertyType::String) => {
					writer.add_bool(false)
				}
				(PropertyValue::String(StringValue::Value(s)), PropertyType::String) => {
					writer.add_bool(true);
					writer.add_string(s);
				}
				_ => return Err(Error::InvalidArgument("index key value type differs from key shape")),
			}
		}
		Ok(writer.into_bytes())
	}

	/// Current-state uniqueness check for `key` against every other
	/// object with an entry under it.
	pub(crate) fn check_unique(
		&self,
		index_meta: &IndexMeta,
		entry_ids: &[i64],
		key: &[u8],
		tx_id: u64,
		read_version: Version,
		self_id: i64,
	) -> Result<()> {
		for &other in entry_ids {
			if other == self_id {
				continue;
			}
			let Ok(meta) = self.class_meta_of_object(other) else {
				continue;
			};
			let Ok(class) = self.leaf_class(meta.index) else {
				continue;
			};
			let state = class.with_chain(other, |chain| {
				let Some(head) = chain.head() else {
					return UniqueState::Clear;
				};
				let head_version = head.version();
				if velox_core::is_tran_id(head_version) && head_version != tx_id {
					if !head.is_tombstone() && self.key_of_record(index_meta, meta, &head) == key {
						return UniqueState::UncommittedOther;
					}
					// Their pending write moves the key away; the
					// committed state still decides.
				} else if !head.is_tombstone() && self.key_of_record(index_meta, meta, &head) == key {
					return UniqueState::Carried(head_version);
				}
				match chain.newest_committed() {
					Some(committed)
						if !committed.is_tombstone()
							&& self.key_of_record(index_meta, meta, &committed) == key =>
					{
						UniqueState::Carried(committed.version())
					}
					_ => UniqueState::Clear,
				}
			});
			match state {
				UniqueState::Clear => {}
				UniqueState::UncommittedOther => return Err(Error::Conflict),
				UniqueState::Carried(version) => {
					if version > read_version && velox_core::is_committed(version) {
						return Err(Error::Conflict);
					}
					return Err(Error::UniqueViolation(index_meta.desc.id));
				}
			}
		}
		Ok(())
	}

	/// Whether the committed contents of a sorted-index range changed
	/// since the snapshot: an entry whose key-carrying state at the
	/// newest committed version differs from its state at the snapshot
	/// is a phantom for the scanning transaction.
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn range_contents_changed(
		&self,
		index_pos: usize,
		low: Option<&[u8]>,
		low_inclusive: bool,
		high: Option<&[u8]>,
		high_inclusive: bool,
		read_version: Version,
	) -> bool {
		let IndexRuntime::Sorted {
			index,
		} = &self.indexes[index_pos]
		else {
			return false;
		};
		let index_meta = self.model.index(index_pos);
		for (key, id) in index.scan_range(low, low_inclusive, high, high_inclusive) {
			let Ok(meta) = self.class_meta_of_object(id) else {
				continue;
			};
			let Ok(class) = self.leaf_class(meta.index) else {
				continue;
			};
			let changed = class.with_chain(id, |chain| {
				let carried_now = chain
					.newest_committed()
					.map(|r| !r.is_tombstone() && self.key_of_record(index_meta, meta, &r) == key)
					.unwrap_or(false);
				let carried_at_snapshot = chain
					.newest_committed_at(read_version)
					.map(|r| !r.is_tombstone() && self.key_of_record(index_meta, meta, &r) == key)
					.unwrap_or(false);
				carried_now != carried_at_snapshot
			});
			if changed {
				return true;
			}
		}
		false
	}

	// ------------------------------------------------------------------
	// Garbage collection execution
	// ------------------------------------------------------------------

	pub(crate) fn gc_worker_loop(db: Arc<Database>, receiver: crossbeam_channel::Receiver<GcWork>) {
		while let Ok(work) = receiver.recv() {
			match work {
				GcWork::Pause => {
					if db.gc.is_shutdown() {
						break;
					}
					db.gc.worker_paused();
				}
				GcWork::Object {
					class_index,
					id,
				} => db.gc_object(class_index, id),
				GcWork::InvRef {
					target_id,
					prop_id,
				} => db.inv_refs.garbage_collect(target_id, prop_id, db.gc.oldest_read_version()),
				GcWork::KeyLock {
					index_pos,
					key_hash,
				} => {
					if let IndexRuntime::Hash { locker, .. } = &db.indexes[index_pos] {
						locker.garbage_collect(key_hash, db.gc.oldest_read_version());
					}
				}
				GcWork::RangeSweep {
					index_pos,
				} => {
					if let IndexRuntime::Sorted { index } = &db.indexes[index_pos] {
						index.ranges.garbage_collect(db.gc.oldest_read_version());
					}
				}
			}
		}
	}

	fn gc_object(&self, class_index: usize, id: i64) {
		let Ok(class) = self.leaf_class(class_index) else {
			return;
		};
		let meta = self.model.class(class_index);
		let oldest = self.gc.oldest_read_version();
		class.garbage_collect(id, oldest, &mut |record, remaining_head| {
			self.drop_record_remnants(class, meta, record, remaining_head);
		});
	}

	/// Runs under the class bucket lock: removes index entries whose key
	/// no surviving version carries, then drops value storage.
	fn drop_record_remnants(
		&self,
		class: &Class,
		meta: &ClassMeta,
		record: &ObjectRecord,
		remaining_head: Handle,
	) {
		if !record.is_tombstone() {
			for &index_pos in &meta.indexes {
				let index_meta = self.model.index(index_pos);
				let key = self.key_of_record(index_meta, meta, record);
				let mut still_carried = false;
				let mut cursor = remaining_head;
				while cursor != NULL_HANDLE {
					let survivor = class.record(cursor);
					if !survivor.is_tombstone()
						&& self.key_of_record(index_meta, meta, &survivor) == key
					{
						still_carried = true;
						break;
					}
					cursor = survivor.next_version();
				}
				if !still_carried {
					match &self.indexes[index_pos] {
						IndexRuntime::Hash { index, .. } => index.remove_entry(&key, record.id()),
						IndexRuntime::Sorted { index } => index.remove_entry(&key, record.id()),
					}
				}
			}
		}
		self.release_value_storage(class.class_index, record);
	}

	// ------------------------------------------------------------------
	// Rewind
	// ------------------------------------------------------------------

	/// Discards every committed version above the target. Caller holds
	/// the engine write lock with all transactions drained.
	pub(crate) fn rewind(&self, target: Version) -> Result<()> {
		if target > self.versions.read_version() {
			return Err(Error::InvalidArgument("rewind target is in the future"));
		}
		if target < self.gc.oldest_read_version() {
			return Err(Error::InvalidArgument("rewind target was already garbage collected"));
		}
		debug!(target, "rewinding database");

		self.persister.rewind(target)?;

		for entry in &self.classes {
			let Some(class) = entry.as_leaf() else {
				continue;
			};
			let meta = self.model.class(class.class_index);
			// Collect ids with versions above the target, then trim
			// their chains.
			let mut ids = Vec::new();
			for range in class.storage.split_scan_range(usize::MAX, 1) {
				for handle in range.handles() {
					let (used, _) = class.storage.is_buffer_used(handle);
					if !used {
						continue;
					}
					let record = class.record(handle);
					if record.version() > target {
						ids.push(record.id());
					}
				}
			}
			ids.sort_unstable();
			ids.dedup();
			for id in ids {
				class.rewind_discard(id, target, &mut |record, remaining_head| {
					self.drop_record_remnants(class, meta, record, remaining_head);
				});
			}
		}

		self.inv_refs.rewind(target);
		self.versions.rewind(target);
		Ok(())
	}
}

impl Drop for Database {
	fn drop(&mut self) {
		// Hand every class's blocks back through disposable scan ranges,
		// releasing the string and blob handles still owned by live
		// records. The slab allocator reclaims the raw blocks when the
		// manager itself drops.
		for entry in &self.classes {
			let Some(class) = entry.as_leaf() else {
				continue;
			};
			for range in class.storage.split_disposable_scan_range(usize::MAX) {
				for handle in range.handles() {
					let (used, _) = class.storage.is_buffer_used(handle);
					if used {
						let record = class.record(handle);
						self.release_value_storage(class.class_index, &record);
					}
				}
			}
		}
	}
}

enum UniqueState {
	Clear,
	UncommittedOther,
	Carried(Version),
}
