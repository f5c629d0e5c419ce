// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::Arc;

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

fn read_value(engine: &StorageEngine, id: i64) -> Option<i64> {
	let tx = begin_read(engine);
	let value = engine.get_object(&tx, id).unwrap().map(|r| r.get_long(ITEM_VALUE).unwrap());
	engine.commit(&tx).unwrap();
	value
}

/// Rewind restores the state at the target version and continues
/// assigning versions from there.
#[test]
fn rewind_restores_prior_state() {
	let (engine, persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	let v1 = engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap();
	let v2 = engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 3)).unwrap();
	let v3 = engine.commit(&tx).unwrap();
	assert_eq!((v2, v3), (v1 + 1, v1 + 2));
	assert_eq!(read_value(&engine, id), Some(3));

	engine.rewind(v2).unwrap();
	assert_eq!(engine.read_version(), v2);
	assert_eq!(read_value(&engine, id), Some(2));
	assert_eq!(persister.rewinds(), vec![v2]);

	// New commits continue from the target.
	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 9)).unwrap();
	let next = engine.commit(&tx).unwrap();
	assert_eq!(next, v3);
	assert_eq!(read_value(&engine, id), Some(9));
}

/// Rewinding past an object's creation removes it entirely.
#[test]
fn rewind_removes_later_inserts() {
	let (engine, _persister) = test_engine(plain_model());
	let early = make_id(ITEM_CLASS, 2);
	let late = make_id(ITEM_CLASS, 3);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, early, 1)).unwrap();
	let v1 = engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, late, 2)).unwrap();
	engine.commit(&tx).unwrap();

	engine.rewind(v1).unwrap();
	assert_eq!(read_value(&engine, early), Some(1));
	assert_eq!(read_value(&engine, late), None);
}

/// A rewound delete resurrects the object.
#[test]
fn rewind_undoes_deletes() {
	let (engine, _persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 4);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 5)).unwrap();
	let v1 = engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(ITEM_CLASS, id)).unwrap();
	engine.commit(&tx).unwrap();
	assert_eq!(read_value(&engine, id), None);

	engine.rewind(v1).unwrap();
	assert_eq!(read_value(&engine, id), Some(5));
}

#[test]
fn rewind_into_the_future_is_rejected() {
	let (engine, _persister) = test_engine(plain_model());
	assert!(engine.rewind(engine.read_version() + 10).is_err());
}
