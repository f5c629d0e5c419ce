// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::Arc;

use velox_catalog::make_id;
use velox_core::Error;
use velox_engine::{StorageEngine, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{ITEM_CLASS, ITEM_VALUE, item_model, plain_model},
	test_engine,
};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

fn begin_read(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap()
}

fn seed(engine: &StorageEngine, counter: u64, value: i64) -> i64 {
	let id = make_id(ITEM_CLASS, counter);
	let tx = begin_rw(engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, value)).unwrap();
	engine.commit(&tx).unwrap();
	id
}

/// Two concurrent updates on a single object: exactly one commits, the
/// other fails with a conflict, and the committed value wins.
#[test]
fn concurrent_updates_conflict() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed(&engine, 1, 10);

	let t1 = begin_rw(&engine);
	let t2 = begin_rw(&engine);

	// T1 reads then writes.
	assert_eq!(engine.get_object(&t1, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 10);
	engine.apply_changeset(&t1, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 11)).unwrap();

	// T2 reads concurrently (sees the old value) then writes: the head
	// is uncommitted by T1, so the write conflicts.
	assert_eq!(engine.get_object(&t2, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 10);
	let err = engine.apply_changeset(&t2, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 12)).unwrap_err();
	assert_eq!(err, Error::Conflict);

	let committed = engine.commit(&t1).unwrap();

	let tx = begin_read(&engine);
	let reader = engine.get_object(&tx, id).unwrap().unwrap();
	assert_eq!(reader.get_long(ITEM_VALUE).unwrap(), 11);
	assert_eq!(reader.version(), committed);
	engine.commit(&tx).unwrap();
}

/// A committed read lock leaves a watermark: writers whose snapshot
/// predates it conflict.
#[test]
fn committed_read_lock_watermark_conflicts_older_writer() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed(&engine, 2, 10);

	// The writer snapshots before the reader commits.
	let writer = begin_rw(&engine);

	let reader = begin_rw(&engine);
	assert!(engine.get_object(&reader, id).unwrap().is_some());
	engine.commit(&reader).unwrap();

	let err = engine.apply_changeset(&writer, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 99)).unwrap_err();
	assert_eq!(err, Error::Conflict);
}

/// A writer whose snapshot includes the reader's commit version does not
/// conflict on the watermark.
#[test]
fn watermark_does_not_conflict_newer_writer() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed(&engine, 3, 10);

	let reader = begin_rw(&engine);
	assert!(engine.get_object(&reader, id).unwrap().is_some());
	engine.commit(&reader).unwrap();

	let writer = begin_rw(&engine);
	engine.apply_changeset(&writer, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 99)).unwrap();
	engine.commit(&writer).unwrap();
}

/// Write skew across two objects: the second writer trips over the
/// first's read lock.
#[test]
fn write_skew_is_prevented() {
	let (engine, _persister) = test_engine(item_model());
	let a = seed(&engine, 4, 100);
	let b = seed(&engine, 5, 100);

	let t1 = begin_rw(&engine);
	assert_eq!(engine.get_object(&t1, a).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 100);
	assert_eq!(engine.get_object(&t1, b).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 100);
	engine.apply_changeset(&t1, &cs::update_long(ITEM_CLASS, ITEM_VALUE, a, 0)).unwrap();

	let t2 = begin_rw(&engine);
	assert_eq!(engine.get_object(&t2, a).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 100);
	assert_eq!(engine.get_object(&t2, b).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 100);
	// T1 read-locked b; T2 deducting from b conflicts.
	let err = engine.apply_changeset(&t2, &cs::update_long(ITEM_CLASS, ITEM_VALUE, b, 0)).unwrap_err();
	assert_eq!(err, Error::Conflict);

	engine.commit(&t1).unwrap();
}

/// Snapshot read stability: every read inside one transaction returns
/// the same value regardless of commits around it.
#[test]
fn snapshot_reads_are_stable() {
	let (engine, _persister) = test_engine(plain_model());
	let id = seed(&engine, 6, 1);

	let snapshot = begin_read(&engine);
	for expected_round in 2..6 {
		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, expected_round)).unwrap();
		engine.commit(&tx).unwrap();
		// The old snapshot is unaffected by every new commit.
		assert_eq!(
			engine.get_object(&snapshot, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(),
			1
		);
	}
	engine.commit(&snapshot).unwrap();

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 5);
	engine.commit(&tx).unwrap();
}

/// Commit versions publish strictly monotonically and the read version
/// never decreases.
#[test]
fn commit_versions_are_monotonic() {
	let (engine, _persister) = test_engine(plain_model());
	let mut last_commit = 0;
	let mut last_read = engine.read_version();
	for counter in 1..20 {
		let id = make_id(ITEM_CLASS, 100 + counter);
		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
		let version = engine.commit(&tx).unwrap();
		assert!(version > last_commit);
		last_commit = version;
		let read = engine.read_version();
		assert!(read >= last_read);
		last_read = read;
	}
}

/// Cancellation surfaces as `TransactionCanceled` on the next operation.
#[test]
fn cancellation_aborts_operations() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed(&engine, 7, 1);

	let tx = begin_rw(&engine);
	engine.cancel(&tx);
	let err = engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap_err();
	assert_eq!(err, Error::TransactionCanceled);
}
