// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Public engine surface.
//!
//! Wires the database, the commit workers and the garbage-collection
//! workers, and exposes the transaction API: begin / commit / rollback /
//! cancel, changeset application, object reads, class scans and index
//! lookups.

use std::{sync::Arc, thread};

use tracing::debug;
use velox_catalog::Model;
use velox_core::{Error, Result, Version};
use velox_wire_format::PropertyValue;

use crate::{
	apply,
	config::StorageEngineConfig,
	database::Database,
	index::{IndexRuntime, key_hash},
	persist::Persister,
	read::{ObjectReader, ObjectScan},
	store::Visible,
	txn::{
		commit::CommitWorkers,
		context::TxView,
		transaction::{TranSource, TranState, TranType, Transaction},
	},
};

pub struct StorageEngine {
	db: Arc<Database>,
	commit_workers: CommitWorkers,
	gc_handles: Vec<thread::JoinHandle<()>>,
}

impl StorageEngine {
	pub fn new(model: Model, config: StorageEngineConfig, persister: Arc<dyn Persister>) -> Result<Self> {
		let commit_worker_count = config.commit_workers;
		let gc_worker_count = config.gc_workers;
		let db = Arc::new(Database::new(model, config, persister)?);

		let gc_handles = (0..gc_worker_count)
			.map(|worker| {
				let db = db.clone();
				let receiver = db.gc.receiver();
				thread::Builder::new()
					.name(format!("velox-gc-{worker}"))
					.spawn(move || Database::gc_worker_loop(db, receiver))
					.expect("failed to spawn gc worker")
			})
			.collect();

		let commit_workers = CommitWorkers::start(db.clone(), commit_worker_count);
		debug!(commit_workers = commit_worker_count, gc_workers = gc_worker_count, "storage engine started");
		Ok(Self {
			db,
			commit_workers,
			gc_handles,
		})
	}

	// ------------------------------------------------------------------
	// Transaction lifecycle
	// ------------------------------------------------------------------

	pub fn begin_transaction(
		&self,
		tran_type: TranType,
		source: TranSource,
		allow_other_writes: bool,
	) -> Result<Arc<Transaction>> {
		self.db.begin_transaction(tran_type, source, allow_other_writes, false, false, None)
	}

	/// Bulk state-transfer transaction for replica catch-up; its commit
	/// version is pre-assigned and publication does not wait for
	/// predecessors.
	pub fn begin_alignment_transaction(
		&self,
		commit_version: Version,
		standby_order: u64,
		propagated: bool,
	) -> Result<Arc<Transaction>> {
		self.db.begin_transaction(
			TranType::ReadWrite,
			TranSource::Replication,
			true,
			true,
			propagated,
			Some((commit_version, standby_order)),
		)
	}

	/// Synchronous commit: enqueues the transaction into the commit
	/// pipeline and waits for ordered publication.
	pub fn commit(&self, tx: &Arc<Transaction>) -> Result<Version> {
		match tx.tran_type {
			TranType::Read => self.db.complete_read(tx),
			TranType::ReadWrite => {
				if !tx.begin_commit() {
					return Err(Error::InvalidArgument("transaction already completed"));
				}
				self.commit_workers.enqueue(tx.clone());
				tx.completion.wait();
				let result = tx.result.lock().clone();
				result.unwrap_or(Err(Error::Critical("commit completed without a result")))
			}
		}
	}

	/// Asynchronous commit: the callback fires on publication. Small
	/// transactions stage per CPU and may be merged into a group commit.
	pub fn commit_async(
		&self,
		tx: &Arc<Transaction>,
		callback: impl FnOnce(Result<Version>) + Send + 'static,
	) -> Result<()> {
		match tx.tran_type {
			TranType::Read => {
				let result = self.db.complete_read(tx);
				callback(result);
				Ok(())
			}
			TranType::ReadWrite => {
				*tx.callback.lock() = Some(Box::new(callback));
				if !tx.begin_commit() {
					*tx.callback.lock() = None;
					return Err(Error::InvalidArgument("transaction already completed"));
				}
				let small = tx.operation_count.load(std::sync::atomic::Ordering::Relaxed)
					< self.db.config.small_tran_operation_limit();
				if small {
					self.commit_workers.stage(tx.clone());
				} else {
					self.commit_workers.enqueue(tx.clone());
				}
				Ok(())
			}
		}
	}

	pub fn rollback(&self, tx: &Arc<Transaction>) -> Result<()> {
		match tx.tran_type {
			TranType::Read => {
				self.db.complete_read(tx)?;
				Ok(())
			}
			TranType::ReadWrite => {
				if !tx.begin_commit() {
					return Err(Error::InvalidArgument("transaction already completed"));
				}
				self.db.rollback_chain(tx, Error::TransactionCanceled);
				Ok(())
			}
		}
	}

	/// Requests cooperative cancellation; the transaction aborts at its
	/// next scan boundary or lock acquisition.
	pub fn cancel(&self, tx: &Arc<Transaction>) {
		tx.cancel();
	}

	// ------------------------------------------------------------------
	// Mutations and reads
	// ------------------------------------------------------------------

	/// Applies a serialized changeset to the transaction. On failure the
	/// transaction is rolled back and unusable.
	pub fn apply_changeset(&self, tx: &Arc<Transaction>, data: &[u8]) -> Result<()> {
		match apply::apply_changeset(&self.db, tx, data) {
			Ok(()) => Ok(()),
			Err(e) => {
				if tx.begin_commit() {
					self.db.rollback_chain(tx, e.clone());
				}
				Err(e)
			}
		}
	}

	/// Reads one object at the transaction snapshot. Read-write
	/// transactions leave a shared object lock behind.
	pub fn get_object<'t>(&'t self, tx: &'t Arc<Transaction>, id: i64) -> Result<Option<ObjectReader<'t>>> {
		self.check_readable(tx)?;
		let meta = self.db.class_meta_of_object(id)?;
		let class = self.db.leaf_class(meta.index)?;

		let visible = match tx.tran_type {
			TranType::ReadWrite => {
				tx.check_thread()?;
				let mut guard = tx.context.lock();
				let ctx = guard
					.as_mut()
					.ok_or(Error::InvalidArgument("transaction has no write context"))?;
				let mut view = TxView {
					slot: ctx.slot,
					tx_id: tx.id,
					read_version: tx.read_version,
					ctx,
				};
				class.get_object(&mut view, id, true)?
			}
			TranType::Read => class.get_visible(id, tx.read_version, tx.id),
		};
		Ok(match visible {
			Visible::Record(handle) => Some(ObjectReader {
				db: self.db.as_ref(),
				tx,
				class: meta,
				record: class.record(handle),
			}),
			Visible::Deleted | Visible::Missing => None,
		})
	}

	/// Ids of the objects referencing `target_id` through the property,
	/// at the transaction snapshot.
	pub fn get_references(&self, tx: &Arc<Transaction>, target_id: i64, property_id: i32) -> Result<Vec<i64>> {
		self.check_readable(tx)?;
		match tx.tran_type {
			TranType::ReadWrite => {
				tx.check_thread()?;
				let mut guard = tx.context.lock();
				let ctx = guard
					.as_mut()
					.ok_or(Error::InvalidArgument("transaction has no write context"))?;
				let mut view = TxView {
					slot: ctx.slot,
					tx_id: tx.id,
					read_version: tx.read_version,
					ctx,
				};
				self.db.inv_refs.get_references(&mut view, true, target_id, property_id)
			}
			TranType::Read => Ok(self.db.inv_refs.get_references_snapshot(
				target_id,
				property_id,
				tx.read_version,
				tx.id,
			)),
		}
	}

	/// Scans all objects of the class (including concrete subclasses)
	/// visible at the transaction snapshot.
	pub fn scan_class<'t>(&'t self, tx: &'t Arc<Transaction>, class_id: u16) -> Result<ObjectScan<'t>> {
		self.check_readable(tx)?;
		let class_index = self
			.db
			.model
			.class_index_of(class_id)
			.ok_or(Error::InvalidArgument("unknown class id"))?;
		let targets = match &self.db.classes[class_index] {
			crate::store::ClassEntry::Inherited { children } => children.clone(),
			crate::store::ClassEntry::Leaf(_) => {
				self.db.model.class(class_index).concrete_descendants.clone()
			}
		};
		Ok(ObjectScan::new(self.db.as_ref(), tx, targets))
	}

	/// Hash index equality lookup; read-write transactions key-lock the
	/// value so matching inserts conflict until completion.
	pub fn find_hash<'t>(
		&'t self,
		tx: &'t Arc<Transaction>,
		index_id: u16,
		key_values: &[PropertyValue],
	) -> Result<Vec<ObjectReader<'t>>> {
		self.check_readable(tx)?;
		let index_pos =
			self.db.model.index_of_id(index_id).ok_or(Error::InvalidIndex(index_id))?;
		let IndexRuntime::Hash {
			index,
			locker,
		} = &self.db.indexes[index_pos]
		else {
			return Err(Error::InvalidIndex(index_id));
		};
		let index_meta = self.db.model.index(index_pos);
		let key = self.db.key_of_values(index_meta, key_values)?;

		if tx.tran_type == TranType::ReadWrite {
			tx.check_thread()?;
			let mut guard = tx.context.lock();
			let ctx =
				guard.as_mut().ok_or(Error::InvalidArgument("transaction has no write context"))?;
			let mut view = TxView {
				slot: ctx.slot,
				tx_id: tx.id,
				read_version: tx.read_version,
				ctx,
			};
			locker.try_take_key_lock(&mut view, key_hash(&key))?;
		}

		let mut readers = Vec::new();
		for id in index.lookup(&key) {
			if let Some(reader) = self.visible_entry(tx, id, &key, index_pos)? {
				readers.push(reader);
			}
		}
		Ok(readers)
	}

	/// Sorted index range scan; read-write transactions range-lock the
	/// traversed interval so phantom insertions conflict.
	#[allow(clippy::too_many_arguments)]
	pub fn scan_sorted<'t>(
		&'t self,
		tx: &'t Arc<Transaction>,
		index_id: u16,
		low: Option<&[PropertyValue]>,
		low_inclusive: bool,
		high: Option<&[PropertyValue]>,
		high_inclusive: bool,
	) -> Result<Vec<ObjectReader<'t>>> {
		self.check_readable(tx)?;
		let index_pos =
			self.db.model.index_of_id(index_id).ok_or(Error::InvalidIndex(index_id))?;
		let IndexRuntime::Sorted {
			index,
		} = &self.db.indexes[index_pos]
		else {
			return Err(Error::InvalidIndex(index_id));
		};
		let index_meta = self.db.model.index(index_pos);
		let low_key = low.map(|values| self.db.key_of_values(index_meta, values)).transpose()?;
		let high_key = high.map(|values| self.db.key_of_values(index_meta, values)).transpose()?;

		if tx.tran_type == TranType::ReadWrite {
			tx.check_thread()?;
			let mut guard = tx.context.lock();
			let ctx =
				guard.as_mut().ok_or(Error::InvalidArgument("transaction has no write context"))?;
			let mut view = TxView {
				slot: ctx.slot,
				tx_id: tx.id,
				read_version: tx.read_version,
				ctx,
			};
			index.lock_range(&mut view, low_key.as_deref(), low_inclusive, high_key.as_deref(), high_inclusive);
		}

		let mut readers = Vec::new();
		for (key, id) in
			index.scan_range(low_key.as_deref(), low_inclusive, high_key.as_deref(), high_inclusive)
		{
			tx.check_cancellation()?;
			if let Some(reader) = self.visible_entry(tx, id, &key, index_pos)? {
				readers.push(reader);
			}
		}
		Ok(readers)
	}

	// ------------------------------------------------------------------
	// Maintenance
	// ------------------------------------------------------------------

	pub fn read_version(&self) -> Version {
		self.db.versions.read_version()
	}

	pub fn oldest_read_version(&self) -> Version {
		self.db.gc.oldest_read_version()
	}

	/// The global term vector: `(global_term, version)` pairs sorted by
	/// version, the last entry naming the current read version.
	pub fn term_vector(&self) -> Vec<(u128, Version)> {
		self.db.versions.snapshot().terms
	}

	/// Merges a replica's term vector into this one; equal terms take
	/// the larger version.
	pub fn merge_term_vector(&self, other: &[(u128, Version)]) {
		self.db.versions.merge_terms(other);
	}

	/// Role change: advances the monotonic local term.
	pub fn bump_local_term(&self) -> u32 {
		self.db.versions.bump_local_term()
	}

	/// Live objects currently indexed under the class, including its
	/// concrete subclasses.
	pub fn object_count(&self, class_id: u16) -> Result<usize> {
		let class_index = self
			.db
			.model
			.class_index_of(class_id)
			.ok_or(Error::InvalidArgument("unknown class id"))?;
		let mut count = 0;
		for &concrete in &self.db.model.class(class_index).concrete_descendants {
			count += self.db.leaf_class(concrete)?.object_count();
		}
		Ok(count)
	}

	/// Runs `f` on every published commit version.
	pub fn subscribe_commit(&self, f: impl Fn(Version) + Send + Sync + 'static) {
		self.db.commit_subscribers.lock().push(Box::new(f));
	}

	/// Cancels outstanding transactions and blocks until none remain,
	/// then quiesces the garbage collector. The engine resumes accepting
	/// transactions on return.
	pub fn drain(&self) {
		self.quiesce(|db| {
			db.gc.drain();
			Ok(())
		})
		.unwrap_or(());
	}

	/// Discards every committed version above the target and truncates
	/// the persistence log. Requires full quiescence.
	pub fn rewind(&self, version: Version) -> Result<()> {
		self.quiesce(|db| {
			db.gc.drain();
			db.rewind(version)
		})
	}

	pub fn create_snapshots(&self, log_indexes: Option<&[u8]>) -> Result<()> {
		self.db.persister.create_snapshots(log_indexes)
	}

	fn quiesce<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
		for weak in self.db.active_txs.lock().values() {
			if let Some(tx) = weak.upgrade() {
				tx.cancel();
			}
		}
		self.db.engine_lock.enter_write(true);
		let result = f(self.db.as_ref());
		self.db.engine_lock.exit_write();
		result
	}

	fn check_readable(&self, tx: &Arc<Transaction>) -> Result<()> {
		if tx.tran_state() != TranState::Active {
			return Err(Error::InvalidArgument("transaction already completed"));
		}
		tx.check_cancellation()
	}

	fn visible_entry<'t>(
		&'t self,
		tx: &'t Arc<Transaction>,
		id: i64,
		key: &[u8],
		index_pos: usize,
	) -> Result<Option<ObjectReader<'t>>> {
		let Ok(meta) = self.db.class_meta_of_object(id) else {
			return Ok(None);
		};
		let Ok(class) = self.db.leaf_class(meta.index) else {
			return Ok(None);
		};
		let Visible::Record(handle) = class.get_visible(id, tx.read_version, tx.id) else {
			return Ok(None);
		};
		let record = class.record(handle);
		let index_meta = self.db.model.index(index_pos);
		// Entries outlive key changes; the visible version decides.
		if self.db.key_of_record(index_meta, meta, &record) != key {
			return Ok(None);
		}
		Ok(Some(ObjectReader {
			db: self.db.as_ref(),
			tx,
			class: meta,
			record,
		}))
	}
}

impl Drop for StorageEngine {
	fn drop(&mut self) {
		self.commit_workers.shutdown();
		self.db.gc.shutdown();
		for handle in self.gc_handles.drain(..) {
			let _ = handle.join();
		}
		debug_assert_eq!(self.db.orderer.pending_count(), 0);
		self.db.persister.dispose_all();
	}
}
