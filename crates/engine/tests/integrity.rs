// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::sync::Arc;

use velox_catalog::make_id;
use velox_core::Error;
use velox_engine::{StorageEngine, TranSource, TranType, Transaction};
use velox_testing::{
	changeset as cs,
	model::{
		CASCADE_CLASS, CASCADE_REF, NULLING_CLASS, NULLING_REFS, PREVENT_CLASS, PREVENT_REF, SCAN_CLASS,
		SCAN_REF, TARGET_CLASS, TARGET_VALUE, refs_model,
	},
	test_engine,
};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

fn begin_read(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::Read, TranSource::Client, false).unwrap()
}

fn seed_target(engine: &StorageEngine, counter: u64) -> i64 {
	let id = make_id(TARGET_CLASS, counter);
	let tx = begin_rw(engine);
	engine.apply_changeset(&tx, &cs::insert_long(TARGET_CLASS, TARGET_VALUE, id, 1)).unwrap();
	engine.commit(&tx).unwrap();
	id
}

/// Cascade delete: deleting the target deletes the referencing object.
#[test]
fn cascade_delete_removes_referencing_object() {
	let (engine, _persister) = test_engine(refs_model());
	let b = seed_target(&engine, 1);
	let a = make_id(CASCADE_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(TARGET_CLASS, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, a).unwrap().is_none());
	assert!(engine.get_object(&tx, b).unwrap().is_none());
	engine.commit(&tx).unwrap();
}

/// Set-to-null with many-cardinality: the deleted id is filtered out of
/// the reference array, the others stay.
#[test]
fn set_to_null_filters_reference_array() {
	let (engine, _persister) = test_engine(refs_model());
	let b1 = seed_target(&engine, 2);
	let b2 = seed_target(&engine, 3);
	let b3 = seed_target(&engine, 4);
	let a = make_id(NULLING_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference_array(NULLING_CLASS, NULLING_REFS, a, &[b1, b2, b3]))
		.unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(TARGET_CLASS, b2)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	let reader = engine.get_object(&tx, a).unwrap().unwrap();
	assert_eq!(reader.get_reference_array(NULLING_REFS).unwrap(), vec![b1, b3]);
	assert!(engine.get_object(&tx, b2).unwrap().is_none());
	engine.commit(&tx).unwrap();
}

/// Prevent-delete blocks the whole transaction.
#[test]
fn prevent_delete_blocks_the_delete() {
	let (engine, _persister) = test_engine(refs_model());
	let b = seed_target(&engine, 5);
	let a = make_id(PREVENT_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference(PREVENT_CLASS, PREVENT_REF, a, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(TARGET_CLASS, b)).unwrap();
	assert_eq!(engine.commit(&tx).unwrap_err(), Error::ReferencedDelete);

	// Both objects survive.
	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, a).unwrap().is_some());
	assert!(engine.get_object(&tx, b).unwrap().is_some());
	engine.commit(&tx).unwrap();
}

/// Untracked references are found by scanning the declaring class.
#[test]
fn untracked_reference_is_cleared_through_scan() {
	let (engine, _persister) = test_engine(refs_model());
	let b = seed_target(&engine, 6);
	let pointer = make_id(SCAN_CLASS, 1);
	let bystander = make_id(SCAN_CLASS, 2);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference(SCAN_CLASS, SCAN_REF, pointer, b)).unwrap();
	engine.apply_changeset(&tx, &cs::insert_reference(SCAN_CLASS, SCAN_REF, bystander, 0)).unwrap();
	engine.commit(&tx).unwrap();

	// No inverse entry exists for untracked properties.
	let tx = begin_read(&engine);
	assert!(engine.get_references(&tx, b, SCAN_REF).unwrap().is_empty());
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(TARGET_CLASS, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	assert_eq!(engine.get_object(&tx, pointer).unwrap().unwrap().get_reference(SCAN_REF).unwrap(), 0);
	assert!(engine.get_object(&tx, b).unwrap().is_none());
	engine.commit(&tx).unwrap();
}

/// Inverse-reference completeness: the map answers who points here.
#[test]
fn tracked_references_are_queriable() {
	let (engine, _persister) = test_engine(refs_model());
	let b = seed_target(&engine, 7);
	let a1 = make_id(CASCADE_CLASS, 10);
	let a2 = make_id(CASCADE_CLASS, 11);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a1, b)).unwrap();
	engine.apply_changeset(&tx, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a2, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	let mut referencing = engine.get_references(&tx, b, CASCADE_REF).unwrap();
	referencing.sort_unstable();
	assert_eq!(referencing, vec![a1, a2]);
	engine.commit(&tx).unwrap();

	// Uncommitted inserts are visible to their own transaction only.
	let a3 = make_id(CASCADE_CLASS, 12);
	let writer = begin_rw(&engine);
	engine.apply_changeset(&writer, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a3, b)).unwrap();
	let mine = engine.get_references(&writer, b, CASCADE_REF).unwrap();
	assert_eq!(mine.len(), 3);

	let other = begin_read(&engine);
	assert_eq!(engine.get_references(&other, b, CASCADE_REF).unwrap().len(), 2);
	engine.commit(&other).unwrap();
	engine.rollback(&writer).unwrap();
}

/// References to missing objects or wrong classes fail validation.
#[test]
fn invalid_references_fail_commit() {
	let (engine, _persister) = test_engine(refs_model());

	// Unknown target object.
	let tx = begin_rw(&engine);
	let missing = make_id(TARGET_CLASS, 999);
	engine.apply_changeset(
		&tx,
		&cs::insert_reference(CASCADE_CLASS, CASCADE_REF, make_id(CASCADE_CLASS, 20), missing),
	)
	.unwrap();
	assert_eq!(engine.commit(&tx).unwrap_err(), Error::UnknownReference(missing));

	// Target of the wrong class.
	let b = seed_target(&engine, 8);
	let wrong_class = make_id(NULLING_CLASS, 30);
	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference_array(NULLING_CLASS, NULLING_REFS, wrong_class, &[b]))
		.unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(
		&tx,
		&cs::insert_reference(CASCADE_CLASS, CASCADE_REF, make_id(CASCADE_CLASS, 21), wrong_class),
	)
	.unwrap();
	assert_eq!(engine.commit(&tx).unwrap_err(), Error::InvalidReferencedClass(wrong_class));
}

/// Cascades iterate to closure: deleting the target cascades through a
/// chain of referencing objects.
#[test]
fn cascade_reaches_closure() {
	let (engine, _persister) = test_engine(refs_model());
	let b = seed_target(&engine, 9);
	// Both cascade objects point at the same target.
	let a1 = make_id(CASCADE_CLASS, 40);
	let a2 = make_id(CASCADE_CLASS, 41);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a1, b)).unwrap();
	engine.apply_changeset(&tx, &cs::insert_reference(CASCADE_CLASS, CASCADE_REF, a2, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::delete(TARGET_CLASS, b)).unwrap();
	engine.commit(&tx).unwrap();

	let tx = begin_read(&engine);
	assert!(engine.get_object(&tx, a1).unwrap().is_none());
	assert!(engine.get_object(&tx, a2).unwrap().is_none());
	engine.commit(&tx).unwrap();
}
