// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::Arc;

use velox_catalog::make_id;
use velox_core::Error;
use velox_engine::{PropertyValue, StorageEngine, StringValue, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{ITEM_CLASS, ITEM_LABEL, ITEM_LABEL_INDEX, ITEM_VALUE, ITEM_VALUE_INDEX, item_model},
	test_engine,
};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

fn begin_read(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap()
}

fn seed_item(engine: &StorageEngine, counter: u64, value: i64, label: &str) -> i64 {
	let id = make_id(ITEM_CLASS, counter);
	let tx = begin_rw(engine);
	engine.apply_changeset(&tx, &cs::insert_item(
		ITEM_CLASS,
		ITEM_VALUE,
		ITEM_LABEL,
		id,
		value,
		StringValue::Value(label.to_string()),
	))
	.unwrap();
	engine.commit(&tx).unwrap();
	id
}

fn long_key(value: i64) -> Vec<PropertyValue> {
	vec![PropertyValue::Long(value)]
}

fn label_key(label: &str) -> Vec<PropertyValue> {
	vec![PropertyValue::String(StringValue::Value(label.to_string()))]
}

#[test]
fn hash_lookup_finds_current_versions() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed_item(&engine, 1, 10, "ten");

	let tx = begin_read(&engine);
	let hits = engine.find_hash(&tx, ITEM_LABEL_INDEX, &label_key("ten")).unwrap();
	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].id(), id);
	assert!(engine.find_hash(&tx, ITEM_LABEL_INDEX, &label_key("eleven")).unwrap().is_empty());
	engine.commit(&tx).unwrap();
}

#[test]
fn unique_hash_index_rejects_duplicates() {
	let (engine, _persister) = test_engine(item_model());
	seed_item(&engine, 2, 10, "dup");

	let tx = begin_rw(&engine);
	let err = engine
		.apply_changeset(&tx, &cs::insert_item(
			ITEM_CLASS,
			ITEM_VALUE,
			ITEM_LABEL,
			make_id(ITEM_CLASS, 3),
			11,
			StringValue::Value("dup".to_string()),
		))
		.unwrap_err();
	assert_eq!(err, Error::UniqueViolation(ITEM_LABEL_INDEX));
}

/// An equality lookup key-locks the value: a matching insert conflicts
/// until the reader completes.
#[test]
fn key_lock_blocks_matching_insert() {
	let (engine, _persister) = test_engine(item_model());

	let reader = begin_rw(&engine);
	assert!(engine.find_hash(&reader, ITEM_LABEL_INDEX, &label_key("phantom")).unwrap().is_empty());

	let writer = begin_rw(&engine);
	let err = engine
		.apply_changeset(&writer, &cs::insert_item(
			ITEM_CLASS,
			ITEM_VALUE,
			ITEM_LABEL,
			make_id(ITEM_CLASS, 4),
			1,
			StringValue::Value("phantom".to_string()),
		))
		.unwrap_err();
	assert_eq!(err, Error::Conflict);

	engine.rollback(&reader).unwrap();

	// After the reader is gone the insert goes through.
	let writer = begin_rw(&engine);
	engine.apply_changeset(&writer, &cs::insert_item(
		ITEM_CLASS,
		ITEM_VALUE,
		ITEM_LABEL,
		make_id(ITEM_CLASS, 5),
		1,
		StringValue::Value("phantom".to_string()),
	))
	.unwrap();
	engine.commit(&writer).unwrap();
}

/// Key locks admit up to three concurrent readers; the fourth reports
/// lock contention.
#[test]
fn key_lock_contention_limit() {
	let (engine, _persister) = test_engine(item_model());
	let readers: Vec<_> = (0..3)
		.map(|_| {
			let tx = begin_rw(&engine);
			assert!(engine.find_hash(&tx, ITEM_LABEL_INDEX, &label_key("busy")).unwrap().is_empty());
			tx
		})
		.collect();

	let fourth = begin_rw(&engine);
	let err = engine.find_hash(&fourth, ITEM_LABEL_INDEX, &label_key("busy")).unwrap_err();
	assert_eq!(err, Error::LockContentionLimitExceeded);

	for tx in readers {
		engine.rollback(&tx).unwrap();
	}
}

#[test]
fn sorted_range_scan_returns_key_order() {
	let (engine, _persister) = test_engine(item_model());
	let id10 = seed_item(&engine, 6, 10, "a");
	let id30 = seed_item(&engine, 7, 30, "b");
	let id20 = seed_item(&engine, 8, 20, "c");

	let tx = begin_read(&engine);
	let all = engine.scan_sorted(&tx, ITEM_VALUE_INDEX, None, true, None, true).unwrap();
	assert_eq!(all.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![id10, id20, id30]);

	let bounded = engine
		.scan_sorted(&tx, ITEM_VALUE_INDEX, Some(&long_key(15)), true, Some(&long_key(25)), true)
		.unwrap();
	assert_eq!(bounded.iter().map(|r| r.id()).collect::<Vec<_>>(), vec![id20]);
	engine.commit(&tx).unwrap();
}

/// Range scan phantom prevention: the writer inserting into the scanned
/// range commits, and the scanning transaction fails at its own commit.
#[test]
fn range_scan_detects_phantoms_at_commit() {
	let (engine, _persister) = test_engine(item_model());
	seed_item(&engine, 9, 10, "p10");
	seed_item(&engine, 10, 20, "p20");
	seed_item(&engine, 11, 30, "p30");

	let t1 = begin_rw(&engine);
	let hits = engine
		.scan_sorted(&t1, ITEM_VALUE_INDEX, Some(&long_key(15)), true, Some(&long_key(25)), true)
		.unwrap();
	assert_eq!(hits.len(), 1);
	assert_eq!(hits[0].get_long(ITEM_VALUE).unwrap(), 20);

	// T2 inserts x=22 into the scanned range and commits.
	let t2 = begin_rw(&engine);
	engine.apply_changeset(&t2, &cs::insert_item(
		ITEM_CLASS,
		ITEM_VALUE,
		ITEM_LABEL,
		make_id(ITEM_CLASS, 12),
		22,
		StringValue::Value("p22".to_string()),
	))
	.unwrap();
	engine.commit(&t2).unwrap();

	// T1's range is no longer repeatable.
	assert_eq!(engine.commit(&t1).unwrap_err(), Error::Conflict);
}

/// A finalized range scan leaves a watermark: writers with an older
/// snapshot conflict immediately.
#[test]
fn committed_range_scan_conflicts_older_writer() {
	let (engine, _persister) = test_engine(item_model());
	seed_item(&engine, 13, 10, "w10");

	let writer = begin_rw(&engine);

	let scanner = begin_rw(&engine);
	engine.scan_sorted(&scanner, ITEM_VALUE_INDEX, Some(&long_key(0)), true, Some(&long_key(100)), true)
		.unwrap();
	engine.commit(&scanner).unwrap();

	let err = engine
		.apply_changeset(&writer, &cs::insert_item(
			ITEM_CLASS,
			ITEM_VALUE,
			ITEM_LABEL,
			make_id(ITEM_CLASS, 14),
			50,
			StringValue::Value("w50".to_string()),
		))
		.unwrap_err();
	assert_eq!(err, Error::Conflict);
}

/// Updates that move an object's key stay consistent for old and new
/// snapshots.
#[test]
fn key_updates_respect_snapshots() {
	let (engine, _persister) = test_engine(item_model());
	let id = seed_item(&engine, 15, 10, "move");

	let old_snapshot = begin_read(&engine);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 40)).unwrap();
	engine.commit(&tx).unwrap();

	// Old snapshot still finds it under the old key.
	let hits = engine
		.scan_sorted(&old_snapshot, ITEM_VALUE_INDEX, Some(&long_key(10)), true, Some(&long_key(10)), true)
		.unwrap();
	assert_eq!(hits.len(), 1);
	let gone = engine
		.scan_sorted(&old_snapshot, ITEM_VALUE_INDEX, Some(&long_key(40)), true, Some(&long_key(40)), true)
		.unwrap();
	assert!(gone.is_empty());
	engine.commit(&old_snapshot).unwrap();

	// New snapshot finds it only under the new key.
	let tx = begin_read(&engine);
	let hits = engine
		.scan_sorted(&tx, ITEM_VALUE_INDEX, Some(&long_key(40)), true, Some(&long_key(40)), true)
		.unwrap();
	assert_eq!(hits.len(), 1);
	let gone = engine
		.scan_sorted(&tx, ITEM_VALUE_INDEX, Some(&long_key(10)), true, Some(&long_key(10)), true)
		.unwrap();
	assert!(gone.is_empty());
	engine.commit(&tx).unwrap();
}
