// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Commit workers.
//!
//! Small synchronous transactions with completion callbacks stage in
//! per-CPU groups; worker zero sweeps the groups into the global queue on
//! each cycle. All workers drain the queue, merging runs of small
//! compatible transactions into one group commit before handing the head
//! to the database's commit path.

use std::{
	collections::VecDeque,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	thread,
	time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use velox_core::cpu::{self, CacheAligned};

use crate::{
	database::Database,
	txn::transaction::{TranState, TranType, Transaction},
};

pub(crate) struct CommitShared {
	staging: Box<[CacheAligned<Mutex<Vec<Arc<Transaction>>>>]>,
	queue: Mutex<VecDeque<Arc<Transaction>>>,
	available: Condvar,
	shutdown: AtomicBool,
}

pub(crate) struct CommitWorkers {
	shared: Arc<CommitShared>,
	handles: Vec<thread::JoinHandle<()>>,
}

impl CommitWorkers {
	pub(crate) fn start(db: Arc<Database>, workers: usize) -> Self {
		let shared = Arc::new(CommitShared {
			staging: (0..cpu::core_count()).map(|_| CacheAligned::new(Mutex::new(Vec::new()))).collect(),
			queue: Mutex::new(VecDeque::new()),
			available: Condvar::new(),
			shutdown: AtomicBool::new(false),
		});
		let handles = (0..workers.max(1))
			.map(|worker| {
				let db = db.clone();
				let shared = shared.clone();
				thread::Builder::new()
					.name(format!("velox-commit-{worker}"))
					.spawn(move || worker_loop(db, shared, worker))
					.expect("failed to spawn commit worker")
			})
			.collect();
		Self {
			shared,
			handles,
		}
	}

	/// Per-CPU staging for small transactions with completion callbacks.
	pub(crate) fn stage(&self, tx: Arc<Transaction>) {
		let core = cpu::current_core_of(self.shared.staging.len());
		self.shared.staging[core].lock().push(tx);
		self.shared.available.notify_one();
	}

	pub(crate) fn enqueue(&self, tx: Arc<Transaction>) {
		self.shared.queue.lock().push_back(tx);
		self.shared.available.notify_one();
	}

	pub(crate) fn shutdown(&mut self) {
		self.shared.shutdown.store(true, Ordering::Release);
		self.shared.available.notify_all();
		for handle in self.handles.drain(..) {
			let _ = handle.join();
		}
	}
}

fn worker_loop(db: Arc<Database>, shared: Arc<CommitShared>, worker: usize) {
	let small_limit = db.config.small_tran_operation_limit();
	let max_merged = db.config.max_merged_transaction_count;
	let max_ops = db.config.max_merged_operation_count;

	loop {
		if shared.shutdown.load(Ordering::Acquire) {
			// Drain what is left so waiters complete.
			while let Some(tx) = shared.queue.lock().pop_front() {
				db.commit_transaction_internal(tx);
			}
			return;
		}

		// The main worker collects the per-CPU groups each cycle.
		if worker == 0 {
			for group in shared.staging.iter() {
				let staged: Vec<_> = std::mem::take(&mut *group.lock());
				if !staged.is_empty() {
					let mut queue = shared.queue.lock();
					queue.extend(staged);
					shared.available.notify_all();
				}
			}
		}

		let head = {
			let mut queue = shared.queue.lock();
			match queue.pop_front() {
				Some(tx) => Some(tx),
				None => {
					let wait = if worker == 0 {
						Duration::from_millis(1)
					} else {
						Duration::from_millis(50)
					};
					let _ = shared.available.wait_for(&mut queue, wait);
					queue.pop_front()
				}
			}
		};
		let Some(head) = head else {
			continue;
		};

		// Merge a run of small compatible transactions into the head.
		if is_mergeable(&head, small_limit) {
			let mut merged = 1usize;
			let mut ops = head.operation_count.load(Ordering::Relaxed);
			loop {
				if merged >= max_merged || ops >= max_ops {
					break;
				}
				let donor = {
					let mut queue = shared.queue.lock();
					let candidate_ops = match queue.front() {
						Some(candidate) if is_mergeable(candidate, small_limit) => {
							candidate.operation_count.load(Ordering::Relaxed)
						}
						_ => break,
					};
					if ops + candidate_ops > max_ops {
						break;
					}
					ops += candidate_ops;
					match queue.pop_front() {
						Some(donor) => donor,
						None => break,
					}
				};
				if let Err(e) = db.merge_transactions(&head, donor) {
					// The donor already joined the chain; fail the
					// whole group.
					db.rollback_chain(&head, e);
					break;
				}
				merged += 1;
			}
			if merged > 1 {
				trace!(merged, ops, "merged small transactions into group commit");
			}
			if head.tran_state() == TranState::Committing {
				db.commit_transaction_internal(head);
			}
			continue;
		}

		db.commit_transaction_internal(head);
	}
}

fn is_mergeable(tx: &Arc<Transaction>, small_limit: usize) -> bool {
	tx.tran_type == TranType::ReadWrite
		&& !tx.alignment
		&& tx.preassigned_commit.is_none()
		&& tx.callback.lock().is_some()
		&& tx.operation_count.load(Ordering::Relaxed) < small_limit
}
