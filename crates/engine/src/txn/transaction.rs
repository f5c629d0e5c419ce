// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use velox_core::{Version, sync::ManualResetEvent};

use crate::{Result, txn::context::TransactionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranType {
	Read,
	ReadWrite,
}

/// Where the transaction originates; replication sources may carry
/// pre-assigned commit versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranSource {
	Client,
	Internal,
	Replication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TranState {
	Active = 0,
	Committing = 1,
	Committed = 2,
	RolledBack = 3,
}

pub(crate) type CommitCallback = Box<dyn FnOnce(Result<Version>) + Send>;

/// A transaction handle. Mutation entry points are bound to the thread
/// that began the transaction; completion may happen on a commit worker.
pub struct Transaction {
	pub(crate) tran_type: TranType,
	pub(crate) source: TranSource,
	pub(crate) id: u64,
	pub(crate) slot: u16,
	pub(crate) read_version: Version,
	pub(crate) thread: u64,
	pub(crate) allow_other_writes: bool,
	/// Bulk state-transfer transaction with a pre-assigned commit
	/// version; the garbage collector treats it as a full reset.
	pub(crate) alignment: bool,
	/// Propagated alignments are a strict subset of alignments.
	pub(crate) propagated: bool,
	pub(crate) preassigned_commit: Option<(Version, u64)>,
	pub(crate) commit_version: AtomicU64,
	pub(crate) log_seq: AtomicU64,
	pub(crate) cancel_requested: AtomicBool,
	pub(crate) state: AtomicU8,
	pub(crate) operation_count: AtomicUsize,
	pub(crate) context: Mutex<Option<Box<TransactionContext>>>,
	pub(crate) next_merged: Mutex<Option<std::sync::Arc<Transaction>>>,
	pub(crate) callback: Mutex<Option<CommitCallback>>,
	pub(crate) completion: ManualResetEvent,
	pub(crate) result: Mutex<Option<Result<Version>>>,
}

impl Transaction {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		tran_type: TranType,
		source: TranSource,
		id: u64,
		slot: u16,
		read_version: Version,
		allow_other_writes: bool,
		alignment: bool,
		propagated: bool,
		preassigned_commit: Option<(Version, u64)>,
		context: Option<Box<TransactionContext>>,
	) -> Self {
		debug_assert!(!propagated || alignment);
		Self {
			tran_type,
			source,
			id,
			slot,
			read_version,
			thread: velox_core::cpu::thread_token(),
			allow_other_writes,
			alignment,
			propagated,
			preassigned_commit,
			commit_version: AtomicU64::new(0),
			log_seq: AtomicU64::new(0),
			cancel_requested: AtomicBool::new(false),
			state: AtomicU8::new(TranState::Active as u8),
			operation_count: AtomicUsize::new(0),
			context: Mutex::new(context),
			next_merged: Mutex::new(None),
			callback: Mutex::new(None),
			completion: ManualResetEvent::new(false),
			result: Mutex::new(None),
		}
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn tran_type(&self) -> TranType {
		self.tran_type
	}

	pub fn source(&self) -> TranSource {
		self.source
	}

	pub fn read_version(&self) -> Version {
		self.read_version
	}

	/// Zero until the transaction is committed.
	pub fn commit_version(&self) -> Version {
		self.commit_version.load(Ordering::Acquire)
	}

	/// Log position of the group commit this transaction published in;
	/// zero until committed.
	pub fn log_seq(&self) -> u64 {
		self.log_seq.load(Ordering::Acquire)
	}

	pub fn allows_other_writes(&self) -> bool {
		self.allow_other_writes
	}

	pub fn is_alignment(&self) -> bool {
		self.alignment
	}

	pub fn is_propagated(&self) -> bool {
		self.propagated
	}

	/// Requests cancellation; polled at scan boundaries and lock
	/// acquisitions.
	pub fn cancel(&self) {
		self.cancel_requested.store(true, Ordering::Release);
	}

	pub fn is_cancel_requested(&self) -> bool {
		self.cancel_requested.load(Ordering::Acquire)
	}

	pub(crate) fn check_cancellation(&self) -> Result<()> {
		if self.is_cancel_requested() {
			return Err(velox_core::Error::TransactionCanceled);
		}
		Ok(())
	}

	pub(crate) fn tran_state(&self) -> TranState {
		match self.state.load(Ordering::Acquire) {
			0 => TranState::Active,
			1 => TranState::Committing,
			2 => TranState::Committed,
			_ => TranState::RolledBack,
		}
	}

	pub(crate) fn set_state(&self, state: TranState) {
		self.state.store(state as u8, Ordering::Release);
	}

	/// Atomically moves Active -> Committing; fails if the transaction
	/// already completed or is being committed elsewhere.
	pub(crate) fn begin_commit(&self) -> bool {
		self.state
			.compare_exchange(
				TranState::Active as u8,
				TranState::Committing as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.is_ok()
	}

	pub(crate) fn check_thread(&self) -> Result<()> {
		if velox_core::cpu::thread_token() != self.thread {
			return Err(velox_core::Error::InvalidTransactionThread);
		}
		Ok(())
	}
}
