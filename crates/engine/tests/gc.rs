// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::{sync::Arc, thread, time::Duration};

use velox_catalog::make_id;
use velox_engine::{StorageEngine, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{ITEM_CLASS, ITEM_VALUE, plain_model},
	test_engine,
};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

fn begin_read(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap()
}

/// The oldest-read-version watermark follows the oldest active reader
/// and never passes it while the reader lives.
#[test]
fn watermark_respects_active_readers() {
	let (engine, _persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 0)).unwrap();
	engine.commit(&tx).unwrap();

	let pinned = begin_read(&engine);
	let pin_version = pinned.read_version();

	// Push the read version well past the pinned snapshot and the
	// retention window.
	for round in 1..40 {
		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, round)).unwrap();
		engine.commit(&tx).unwrap();
	}
	assert!(engine.oldest_read_version() <= pin_version);

	// The pinned snapshot still reads its version of the object.
	assert_eq!(engine.get_object(&pinned, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 0);
	engine.commit(&pinned).unwrap();

	// With the reader gone the watermark may advance (up to the
	// retention window).
	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 99)).unwrap();
	engine.commit(&tx).unwrap();
	assert!(engine.oldest_read_version() > pin_version);
}

/// Version chains shrink once nobody can observe the old versions: the
/// engine keeps answering correctly after heavy churn on one object.
#[test]
fn heavy_churn_on_one_object_stays_consistent() {
	let (engine, _persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 2);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 0)).unwrap();
	engine.commit(&tx).unwrap();

	for round in 1..200 {
		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, round)).unwrap();
		engine.commit(&tx).unwrap();
	}
	// Give the collector a moment to drain.
	thread::sleep(Duration::from_millis(50));

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 199);
	engine.commit(&tx).unwrap();
}

/// Deleted objects disappear from scans once collected, and the class
/// keeps working through delete/reinsert cycles.
#[test]
fn delete_reinsert_cycles() {
	let (engine, _persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 3);

	for round in 0..50 {
		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, round)).unwrap();
		engine.commit(&tx).unwrap();

		let tx = begin_rw(&engine);
		engine.apply_changeset(&tx, &cs::delete(ITEM_CLASS, id)).unwrap();
		engine.commit(&tx).unwrap();
	}

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, id).unwrap().is_none());
	let count = engine.scan_class(&tx, ITEM_CLASS).unwrap().count();
	assert_eq!(count, 0);
	engine.commit(&tx).unwrap();
}

/// Draining quiesces the collector and the engine accepts transactions
/// afterwards.
#[test]
fn drain_quiesces_and_resumes() {
	let (engine, _persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 4);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	engine.commit(&tx).unwrap();

	engine.drain();

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, id).unwrap().is_some());
	engine.commit(&tx).unwrap();
}
