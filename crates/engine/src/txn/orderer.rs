// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Commit orderer.
//!
//! Durable transactions may acknowledge out of order; publication must
//! happen in strictly increasing commit-version order. A transaction
//! whose version is not yet next parks here, and each publication drains
//! the consecutive run that became eligible.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex;
use velox_core::Version;

use crate::txn::transaction::Transaction;

pub(crate) struct CommitOrderer {
	pending: Mutex<BTreeMap<Version, Arc<Transaction>>>,
}

impl CommitOrderer {
	pub(crate) fn new() -> Self {
		Self {
			pending: Mutex::new(BTreeMap::new()),
		}
	}

	pub(crate) fn park(&self, tx: Arc<Transaction>) {
		let version = tx.commit_version();
		debug_assert_ne!(version, 0);
		let previous = self.pending.lock().insert(version, tx);
		debug_assert!(previous.is_none());
	}

	/// Removes the parked transaction with exactly this version, if any.
	pub(crate) fn take_exact(&self, version: Version) -> Option<Arc<Transaction>> {
		self.pending.lock().remove(&version)
	}

	pub(crate) fn pending_count(&self) -> usize {
		self.pending.lock().len()
	}
}
