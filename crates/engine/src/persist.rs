// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Persistence boundary.
//!
//! The engine is memory-resident; durability is delegated to an
//! append-only changeset log behind this interface. `begin_commit_
//! transaction` must not block: the persister appends the changeset and
//! invokes the completion when it is durable (synchronously is fine),
//! after which the engine publishes the commit in version order.

use velox_core::{LogSeqNum, Version};

/// One group commit handed to the persister.
pub struct CommitRequest {
	pub commit_version: Version,
	pub log_seq: LogSeqNum,
	/// Serialized [`velox_wire_format::ChangeSet`].
	pub changeset: Vec<u8>,
	/// Number of transactions merged into this commit.
	pub merged_count: usize,
}

pub type CommitCompletion = Box<dyn FnOnce(velox_core::Result<()>) + Send>;

pub trait Persister: Send + Sync + 'static {
	fn begin_commit_transaction(&self, request: CommitRequest, completion: CommitCompletion);

	/// Truncates the log back to `version`.
	fn rewind(&self, version: Version) -> velox_core::Result<()>;

	/// Requests snapshots for the given logs, or all of them.
	fn create_snapshots(&self, log_indexes: Option<&[u8]>) -> velox_core::Result<()>;

	fn dispose_all(&self);
}

/// Discards everything; acknowledges immediately.
pub struct NullPersister;

impl Persister for NullPersister {
	fn begin_commit_transaction(&self, _request: CommitRequest, completion: CommitCompletion) {
		completion(Ok(()));
	}

	fn rewind(&self, _version: Version) -> velox_core::Result<()> {
		Ok(())
	}

	fn create_snapshots(&self, _log_indexes: Option<&[u8]>) -> velox_core::Result<()> {
		Ok(())
	}

	fn dispose_all(&self) {}
}
