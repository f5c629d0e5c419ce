// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use parking_lot::Mutex;
use velox_core::Version;
use velox_engine::{CommitRequest, Persister};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
	pub commit_version: Version,
	pub log_seq: u64,
	pub changeset: Vec<u8>,
	pub merged_count: usize,
}

/// Keeps every appended commit in memory and acknowledges immediately.
pub struct RecordingPersister {
	commits: Mutex<Vec<RecordedCommit>>,
	rewinds: Mutex<Vec<Version>>,
}

impl RecordingPersister {
	pub fn new() -> Self {
		Self {
			commits: Mutex::new(Vec::new()),
			rewinds: Mutex::new(Vec::new()),
		}
	}

	/// Number of log entries, equal to the number of merged group
	/// commits the engine produced.
	pub fn commit_count(&self) -> usize {
		self.commits.lock().len()
	}

	pub fn commits(&self) -> Vec<RecordedCommit> {
		self.commits.lock().clone()
	}

	pub fn transactions_persisted(&self) -> usize {
		self.commits.lock().iter().map(|c| c.merged_count).sum()
	}

	pub fn rewinds(&self) -> Vec<Version> {
		self.rewinds.lock().clone()
	}
}

impl Default for RecordingPersister {
	fn default() -> Self {
		Self::new()
	}
}

impl Persister for RecordingPersister {
	fn begin_commit_transaction(
		&self,
		request: CommitRequest,
		completion: Box<dyn FnOnce(velox_core::Result<()>) + Send>,
	) {
		self.commits.lock().push(RecordedCommit {
			commit_version: request.commit_version,
			log_seq: request.log_seq,
			changeset: request.changeset,
			merged_count: request.merged_count,
		});
		completion(Ok(()));
	}

	fn rewind(&self, version: Version) -> velox_core::Result<()> {
		self.rewinds.lock().push(version);
		Ok(())
	}

	fn create_snapshots(&self, _log_indexes: Option<&[u8]>) -> velox_core::Result<()> {
		Ok(())
	}

	fn dispose_all(&self) {}
}
