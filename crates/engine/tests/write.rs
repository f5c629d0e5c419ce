// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::Arc;

use velox_catalog::make_id;
use velox_core::Error;
use velox_engine::{StorageEngine, StringValue, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{ITEM_CLASS, ITEM_LABEL, ITEM_VALUE, item_model},
	test_engine,
};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

fn begin_read(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap()
}

#[test]
fn insert_then_read_back() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_item(
		ITEM_CLASS,
		ITEM_VALUE,
		ITEM_LABEL,
		id,
		42,
		StringValue::Value("first".into()),
	))
	.unwrap();

	// Visible to the writer before commit.
	let reader = engine.get_object(&tx, id).unwrap().unwrap();
	assert_eq!(reader.get_long(ITEM_VALUE).unwrap(), 42);
	assert_eq!(reader.get_string(ITEM_LABEL).unwrap().as_deref(), Some("first"));

	let version = engine.commit(&tx).unwrap();
	assert!(version > 0);

	let tx = begin_read(&engine);
	let reader = engine.get_object(&tx, id).unwrap().unwrap();
	assert_eq!(reader.get_long(ITEM_VALUE).unwrap(), 42);
	assert_eq!(reader.version(), version);
	engine.commit(&tx).unwrap();
}

#[test]
fn update_creates_new_version() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 2);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	let v1 = engine.commit(&tx).unwrap();

	let old_snapshot = begin_read(&engine);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap();
	let v2 = engine.commit(&tx).unwrap();
	assert!(v2 > v1);

	// The old snapshot keeps seeing the old value.
	let reader = engine.get_object(&old_snapshot, id).unwrap().unwrap();
	assert_eq!(reader.get_long(ITEM_VALUE).unwrap(), 1);
	engine.commit(&old_snapshot).unwrap();

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 2);
	engine.commit(&tx).unwrap();
}

#[test]
fn delete_hides_the_object() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 3);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 7)).unwrap();
	engine.commit(&tx).unwrap();

	let before_delete = begin_read(&engine);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(ITEM_CLASS, id)).unwrap();
	engine.commit(&tx).unwrap();

	// Snapshot from before the delete still sees it.
	assert!(engine.get_object(&before_delete, id).unwrap().is_some());
	engine.commit(&before_delete).unwrap();

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, id).unwrap().is_none());
	engine.commit(&tx).unwrap();
}

#[test]
fn update_of_missing_object_is_not_found() {
	let (engine, _persister) = test_engine(item_model());
	let tx = begin_rw(&engine);
	let err = engine
		.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, make_id(ITEM_CLASS, 99), 5))
		.unwrap_err();
	assert_eq!(err, Error::NotFound);
	// The failed transaction rolled back.
	assert!(engine.commit(&tx).is_err());
}

#[test]
fn duplicate_insert_is_a_unique_violation() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 4);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	let err = engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap_err();
	assert_eq!(err, Error::UniqueViolation(0));
}

#[test]
fn null_and_empty_strings_stay_distinct() {
	let (engine, _persister) = test_engine(item_model());
	let with_null = make_id(ITEM_CLASS, 5);
	let with_empty = make_id(ITEM_CLASS, 6);

	let tx = begin_rw(&engine);
	engine.apply_changeset(
		&tx,
		&cs::insert_item(ITEM_CLASS, ITEM_VALUE, ITEM_LABEL, with_null, 1, StringValue::Null),
	)
	.unwrap();
	engine.apply_changeset(
		&tx,
		&cs::insert_item(ITEM_CLASS, ITEM_VALUE, ITEM_LABEL, with_empty, 2, StringValue::Value(String::new())),
	)
	.unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, with_null).unwrap().unwrap().get_string(ITEM_LABEL).unwrap(), None);
	assert_eq!(
		engine.get_object(&tx, with_empty).unwrap().unwrap().get_string(ITEM_LABEL).unwrap(),
		Some(String::new())
	);
	engine.commit(&tx).unwrap();
}

#[test]
fn multiple_operations_on_one_object_in_one_transaction() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 7);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap();
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 3)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, id).unwrap().unwrap().get_long(ITEM_VALUE).unwrap(), 3);
	engine.commit(&tx).unwrap();
}

#[test]
fn rollback_discards_writes() {
	let (engine, _persister) = test_engine(item_model());
	let id = make_id(ITEM_CLASS, 8);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	engine.rollback(&tx).unwrap();

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, id).unwrap().is_none());
	engine.commit(&tx).unwrap();
}
