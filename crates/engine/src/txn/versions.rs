// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Commit/read version cursors and the global-term vector.
//!
//! Two locks split the roles: a write-only assignment lock hands out
//! `commit_version`/`log_seq_num` pairs, and a read-write state lock
//! guards the published `read_version` and the `(global_term, version)`
//! vector. Publication happens strictly in commit-version order (the
//! commit orderer enforces it), so `read_version` is non-decreasing.

use parking_lot::{Mutex, RwLock};
use velox_core::{LogSeqNum, Version};

/// Term vector invariant: sorted by version, the last entry's version
/// equals the current read version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GlobalVersions {
	pub read_version: Version,
	pub terms: Vec<(u128, Version)>,
	pub local_term: u32,
}

impl GlobalVersions {
	pub(crate) fn new(initial: Version) -> Self {
		Self {
			read_version: initial,
			terms: vec![(0, initial)],
			local_term: 0,
		}
	}

	pub(crate) fn current_term(&self) -> u128 {
		self.terms.last().map(|&(term, _)| term).unwrap_or(0)
	}

	pub(crate) fn publish(&mut self, version: Version, term: Option<u128>) {
		debug_assert!(version >= self.read_version);
		self.read_version = version;
		let term = term.unwrap_or_else(|| self.current_term());
		match self.terms.last_mut() {
			Some(last) if last.0 == term => last.1 = version,
			_ => self.terms.push((term, version)),
		}
	}

	/// Drops every entry above the target and resets the cursor to it.
	pub(crate) fn rewind(&mut self, target: Version) {
		self.terms.retain(|&(_, version)| version <= target);
		match self.terms.last_mut() {
			Some(last) => last.1 = target,
			None => self.terms.push((0, target)),
		}
		self.read_version = target;
	}

	pub(crate) fn bump_local_term(&mut self) -> u32 {
		self.local_term += 1;
		self.local_term
	}
}

/// Merges two term vectors sorted by version; equal terms take the max
/// version.
pub(crate) fn merge_term_lists(a: &[(u128, Version)], b: &[(u128, Version)]) -> Vec<(u128, Version)> {
	let mut out: Vec<(u128, Version)> = Vec::with_capacity(a.len() + b.len());
	let (mut i, mut j) = (0, 0);
	while i < a.len() || j < b.len() {
		let take_a = j >= b.len() || (i < a.len() && a[i].1 <= b[j].1);
		let item = if take_a {
			let item = a[i];
			i += 1;
			item
		} else {
			let item = b[j];
			j += 1;
			item
		};
		match out.iter_mut().find(|existing| existing.0 == item.0) {
			Some(existing) => existing.1 = existing.1.max(item.1),
			None => out.push(item),
		}
	}
	out
}

struct AssignCursors {
	commit_version: Version,
	log_seq: LogSeqNum,
}

pub(crate) struct DatabaseVersions {
	state: RwLock<GlobalVersions>,
	assign: Mutex<AssignCursors>,
}

impl DatabaseVersions {
	pub(crate) fn new(initial: Version) -> Self {
		Self {
			state: RwLock::new(GlobalVersions::new(initial)),
			assign: Mutex::new(AssignCursors {
				commit_version: initial,
				log_seq: 0,
			}),
		}
	}

	pub(crate) fn read_version(&self) -> Version {
		self.state.read().read_version
	}

	/// Hands out the next commit version and log sequence number. A
	/// pre-assigned pair (replication) pins the version and derives the
	/// log sequence from the standby order number.
	pub(crate) fn assign_commit(&self, preassigned: Option<(Version, u64)>) -> (Version, LogSeqNum) {
		match preassigned {
			None => self.assign_commit_range(1),
			Some((version, standby_order)) => {
				let mut cursors = self.assign.lock();
				let log_seq = cursors.log_seq + standby_order;
				cursors.commit_version = cursors.commit_version.max(version);
				cursors.log_seq = cursors.log_seq.max(log_seq);
				(version, log_seq)
			}
		}
	}

	/// Consecutive commit versions for a group commit; the group shares
	/// one log entry and therefore one log sequence number. Returns the
	/// first version of the range.
	pub(crate) fn assign_commit_range(&self, count: u64) -> (Version, LogSeqNum) {
		debug_assert!(count >= 1);
		let mut cursors = self.assign.lock();
		let first = cursors.commit_version + 1;
		cursors.commit_version += count;
		cursors.log_seq += 1;
		(first, cursors.log_seq)
	}

	pub(crate) fn publish(&self, version: Version, term: Option<u128>) {
		self.state.write().publish(version, term);
	}

	pub(crate) fn rewind(&self, target: Version) {
		let mut cursors = self.assign.lock();
		let mut state = self.state.write();
		state.rewind(target);
		cursors.commit_version = target;
	}

	pub(crate) fn merge_terms(&self, other: &[(u128, Version)]) {
		let mut state = self.state.write();
		state.terms = merge_term_lists(&state.terms, other);
		if let Some(&(_, version)) = state.terms.last() {
			state.read_version = state.read_version.max(version);
		}
	}

	pub(crate) fn bump_local_term(&self) -> u32 {
		self.state.write().bump_local_term()
	}

	pub(crate) fn snapshot(&self) -> GlobalVersions {
		self.state.read().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn assignment_is_sequential() {
		let versions = DatabaseVersions::new(0);
		assert_eq!(versions.assign_commit(None), (1, 1));
		assert_eq!(versions.assign_commit(None), (2, 2));
		versions.publish(1, None);
		versions.publish(2, None);
		assert_eq!(versions.read_version(), 2);
	}

	#[test]
	fn preassigned_commit_pins_version() {
		let versions = DatabaseVersions::new(5);
		let (version, log_seq) = versions.assign_commit(Some((9, 3)));
		assert_eq!(version, 9);
		assert_eq!(log_seq, 3);
		// The cursor continues past the pinned version.
		assert_eq!(versions.assign_commit(None).0, 10);
	}

	#[test]
	fn rewind_trims_terms_and_resets_cursors() {
		let versions = DatabaseVersions::new(0);
		for _ in 0..12 {
			let (v, _) = versions.assign_commit(None);
			versions.publish(v, None);
		}
		versions.publish(12, Some(7));
		versions.rewind(11);
		let snapshot = versions.snapshot();
		assert_eq!(snapshot.read_version, 11);
		assert_eq!(snapshot.terms, vec![(0, 11)]);
		// Writes continue from the target.
		assert_eq!(versions.assign_commit(None).0, 12);
	}

	#[test]
	fn term_lists_merge_by_version_with_max_per_term() {
		let a = vec![(1u128, 5u64), (2, 10)];
		let b = vec![(1u128, 7u64), (3, 9)];
		let merged = merge_term_lists(&a, &b);
		assert_eq!(merged, vec![(1, 7), (3, 9), (2, 10)]);
	}
}
