// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use thiserror::Error as ThisError;

/// Engine error taxonomy.
///
/// Ordinary errors roll the transaction back locally and surface through the
/// operation or commit result. [`Error::Critical`] is unrecoverable: the
/// engine logs it and panics. Hosts are expected to retry
/// [`Error::Conflict`] and [`Error::LockContentionLimitExceeded`] with
/// backoff.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
	/// Optimistic concurrency violation, retryable by the caller.
	#[error("transaction conflict")]
	Conflict,

	/// Duplicate key on an index marked unique.
	#[error("unique constraint violation on index {0}")]
	UniqueViolation(u16),

	/// Object or index entry missing.
	#[error("object not found")]
	NotFound,

	/// Delete blocked by a prevent-delete reference.
	#[error("object is referenced by a prevent-delete property")]
	ReferencedDelete,

	/// A new or updated reference points at an object that does not exist.
	#[error("reference to unknown object {0}")]
	UnknownReference(i64),

	/// A new or updated reference points at a class the property does not
	/// accept.
	#[error("reference to object {0} of a class not accepted by the property")]
	InvalidReferencedClass(i64),

	/// Cancellation observed during a long operation.
	#[error("transaction canceled")]
	TransactionCanceled,

	/// Malformed changeset wire data.
	#[error("invalid changeset: {0}")]
	InvalidChangeset(&'static str),

	/// More than the supported number of concurrent readers attempted an
	/// index key lock.
	#[error("key lock contention limit exceeded")]
	LockContentionLimitExceeded,

	#[error("invalid argument: {0}")]
	InvalidArgument(&'static str),

	#[error("invalid index id {0}")]
	InvalidIndex(u16),

	/// Mutation attempted from a thread the transaction is not bound to.
	#[error("transaction used from an invalid thread")]
	InvalidTransactionThread,

	/// Transaction context pool exhausted.
	#[error("concurrent transaction limit exceeded")]
	ConcurrentTranLimitExceeded,

	/// Allocator block table exhausted.
	#[error("out of memory")]
	OutOfMemory,

	/// Invariant violation, terminates the engine.
	#[error("critical engine failure: {0}")]
	Critical(&'static str),
}

impl Error {
	/// Whether the host should retry the transaction.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::Conflict | Error::LockContentionLimitExceeded)
	}

	pub fn is_fatal(&self) -> bool {
		matches!(self, Error::Critical(_) | Error::OutOfMemory)
	}
}
