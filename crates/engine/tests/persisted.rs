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
use velox_wire_format::{ChangeSet, ChangesetReader, OpType, PropertyValue, prev_version_of};

fn begin_rw(engine: &StorageEngine) -> Arc<Transaction> {
	engine.begin_transaction(TranType::ReadWrite, TranSource::Client, false).unwrap()
}

/// The engine re-encodes applied operations for persistence and writes
/// the object's previous committed version into every operation header.
#[test]
fn persisted_changesets_carry_previous_versions() {
	let (engine, persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 1);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	let v1 = engine.commit(&tx).unwrap();

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap();
	engine.commit(&tx).unwrap();

	let commits = persister.commits();
	assert_eq!(commits.len(), 2);

	// Insert: the object was new, previous version 0.
	let insert = ChangeSet::deserialize(&commits[0].changeset).unwrap();
	let mut reader = ChangesetReader::new(&insert.logs[0]);
	let block = reader.next_block().unwrap().unwrap();
	assert_eq!(block.op_type, OpType::Insert);
	assert_eq!(block.class_id, ITEM_CLASS as i16);
	let op = reader.next_operation().unwrap().unwrap();
	assert_eq!(op.id, id);
	assert_eq!(prev_version_of(op.header), 0);
	assert_eq!(op.values, vec![PropertyValue::Long(1)]);

	// Update: the header names the version the update replaced.
	let update = ChangeSet::deserialize(&commits[1].changeset).unwrap();
	let mut reader = ChangesetReader::new(&update.logs[0]);
	let block = reader.next_block().unwrap().unwrap();
	assert_eq!(block.op_type, OpType::Update);
	let op = reader.next_operation().unwrap().unwrap();
	assert_eq!(prev_version_of(op.header), v1);
}

/// Two operations on the same object inside one transaction: the first
/// header carries the more-operations flag.
#[test]
fn more_ops_flag_links_same_object_operations() {
	let (engine, persister) = test_engine(plain_model());
	let id = make_id(ITEM_CLASS, 2);

	let tx = begin_rw(&engine);
	engine.apply_changeset(&tx, &cs::insert_long(ITEM_CLASS, ITEM_VALUE, id, 1)).unwrap();
	engine.apply_changeset(&tx, &cs::update_long(ITEM_CLASS, ITEM_VALUE, id, 2)).unwrap();
	engine.commit(&tx).unwrap();

	let commit = &persister.commits()[0];
	let changeset = ChangeSet::deserialize(&commit.changeset).unwrap();
	let mut reader = ChangesetReader::new(&changeset.logs[0]);

	reader.next_block().unwrap().unwrap();
	let first = reader.next_operation().unwrap().unwrap();
	assert_eq!(first.header & velox_wire_format::OP_HEADER_MORE_OPS, 1);
	assert_eq!(prev_version_of(first.header), 0);

	reader.next_block().unwrap().unwrap();
	let second = reader.next_operation().unwrap().unwrap();
	assert_eq!(second.header & velox_wire_format::OP_HEADER_MORE_OPS, 0);
}
