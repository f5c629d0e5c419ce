// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Changeset application.
//!
//! Consumes the wire format block by block and drives the stores: class
//! writes, inverse-reference deltas and index maintenance, while
//! re-recording every operation into the transaction's own per-log
//! changeset writers (with previous-version headers written back) for
//! persistence. The delete-propagation generator reuses the same
//! per-operation helpers with generated blocks.

use std::sync::{Arc, atomic::Ordering};

use smallvec::SmallVec;
use velox_catalog::{ClassMeta, PropertyType, class_id_of};
use velox_core::{Error, Handle, NULL_HANDLE, Result};
use velox_wire_format::{
	ChangeSet, ChangesetReader, OP_HEADER_MORE_OPS, OpType, PropertyValue, StringValue,
};

use crate::{
	database::Database,
	index::{IndexRuntime, key_hash},
	store::ObjectRecord,
	txn::{
		context::{AffectedInvRef, AffectedObject, IndexEntryRef, TransactionContext, TxView},
		transaction::{TranState, TranType, Transaction},
	},
};

/// Applies a serialized changeset to the transaction. On error the caller
/// rolls the whole transaction back.
pub(crate) fn apply_changeset(db: &Arc<Database>, tx: &Arc<Transaction>, data: &[u8]) -> Result<()> {
	if tx.tran_type != TranType::ReadWrite {
		return Err(Error::InvalidArgument("changesets require a read-write transaction"));
	}
	if tx.tran_state() != TranState::Active {
		return Err(Error::InvalidArgument("transaction already completed"));
	}
	tx.check_thread()?;
	tx.check_cancellation()?;

	let changeset = ChangeSet::deserialize(data)?;
	let mut guard = tx.context.lock();
	let ctx = guard.as_mut().ok_or(Error::InvalidArgument("transaction has no write context"))?;

	for log in &changeset.logs {
		if log.log_index as usize >= ctx.writers.len() {
			return Err(Error::InvalidChangeset("log index out of range"));
		}
		let mut reader = ChangesetReader::new(log);
		while let Some(block) = reader.next_block()? {
			if block.op_type == OpType::Rewind {
				return Err(Error::InvalidArgument("rewind is applied through the engine, not a transaction"));
			}
			let class_index = db
				.model
				.class_index_of(block.class_id as u16)
				.ok_or(Error::InvalidChangeset("block names an unknown class"))?;
			let meta = db.model.class(class_index);
			if meta.desc.is_abstract {
				return Err(Error::InvalidChangeset("block targets an abstract class"));
			}

			// Resolve declared wire properties to layout slots once per
			// block.
			let mut slots = Vec::with_capacity(block.properties.len());
			for &(property_id, ptype) in &block.properties {
				let slot = meta
					.slot_of(property_id)
					.ok_or(Error::InvalidChangeset("block property missing on class"))?;
				if meta.property(slot).ptype != ptype {
					return Err(Error::InvalidChangeset("block property type differs from model"));
				}
				slots.push(slot);
			}

			ctx.writers[log.log_index as usize].begin_block(
				block.op_type,
				block.class_id,
				&block.properties,
			)?;
			while let Some(op) = reader.next_operation()? {
				tx.check_cancellation()?;
				match block.op_type {
					OpType::Insert => apply_insert(
						db,
						tx,
						ctx,
						log.log_index as usize,
						class_index,
						&slots,
						op.id,
						&op.values,
					)?,
					OpType::Update => apply_update(
						db,
						tx,
						ctx,
						log.log_index as usize,
						class_index,
						&slots,
						op.id,
						&op.values,
						true,
					)?,
					OpType::DefaultValue => apply_update(
						db,
						tx,
						ctx,
						log.log_index as usize,
						class_index,
						&slots,
						op.id,
						&op.values,
						false,
					)?,
					OpType::Delete => apply_delete(
						db,
						tx,
						ctx,
						log.log_index as usize,
						class_index,
						op.id,
					)?,
					OpType::Rewind => unreachable!(),
				}
			}
		}
	}
	Ok(())
}

/// Generated delete for propagation; writes its own single-op block.
pub(crate) fn apply_generated_delete(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	id: i64,
) -> Result<()> {
	let meta = db.class_meta_of_object(id)?;
	let log = ctx.log_for(id);
	ctx.writers[log].begin_block(OpType::Delete, meta.desc.id as i16, &[])?;
	apply_delete(db, tx, ctx, log, meta.index, id)
}

/// Generated update for propagation (set-to-null); writes its own
/// single-op block.
pub(crate) fn apply_generated_update(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	id: i64,
	changes: &[(i32, PropertyValue)],
) -> Result<()> {
	let meta = db.class_meta_of_object(id)?;
	let log = ctx.log_for(id);
	let mut decl = Vec::with_capacity(changes.len());
	let mut slots = Vec::with_capacity(changes.len());
	let mut values = Vec::with_capacity(changes.len());
	for (property_id, value) in changes {
		let slot = meta.slot_of(*property_id).ok_or(Error::Critical("propagation over unknown property"))?;
		decl.push((*property_id, meta.property(slot).ptype));
		slots.push(slot);
		values.push(value.clone());
	}
	ctx.writers[log].begin_block(OpType::Update, meta.desc.id as i16, &decl)?;
	apply_update(db, tx, ctx, log, meta.index, &slots, id, &values, true)
}

#[allow(clippy::too_many_arguments)]
fn apply_insert(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	log: usize,
	class_index: usize,
	slots: &[usize],
	id: i64,
	values: &[PropertyValue],
) -> Result<()> {
	let meta = db.model.class(class_index);
	let class = db.leaf_class(class_index)?;
	if class_id_of(id) != meta.desc.id {
		return Err(Error::InvalidChangeset("operation id names a different class"));
	}

	let materialized = materialize(db, meta, slots, values)?;
	let outcome = {
		let mut view = TxView {
			slot: ctx.slot,
			tx_id: tx.id,
			read_version: tx.read_version,
			ctx: &mut *ctx,
		};
		let raws = &materialized.raws;
		match class.insert(&mut view, id, |record| {
			for (&slot, &raw) in slots.iter().zip(raws.iter()) {
				record.set_prop(slot, raw);
			}
			Ok(())
		}) {
			Ok(outcome) => outcome,
			Err(e) => {
				materialized.release(db);
				return Err(e);
			}
		}
	};

	ctx.affected_objects.push(AffectedObject {
		class_index,
		id,
		handle: outcome.handle,
		prev_head: outcome.prev_head,
		prev_version: outcome.prev_version,
		chain_pos: 0,
	});
	record_wire_op(ctx, log, id, values, outcome.prev_version)?;
	count_op(tx, ctx);

	let record = class.record(outcome.handle);
	emit_reference_deltas(db, tx, ctx, meta, None, Some(&record), id)?;
	for &index_pos in &meta.indexes {
		add_index_entry(db, tx, ctx, meta, index_pos, &record, id, None)?;
	}
	Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_update(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	log: usize,
	class_index: usize,
	slots: &[usize],
	id: i64,
	values: &[PropertyValue],
	conflict_checked: bool,
) -> Result<()> {
	let meta = db.model.class(class_index);
	let class = db.leaf_class(class_index)?;
	if class_id_of(id) != meta.desc.id {
		return Err(Error::InvalidChangeset("operation id names a different class"));
	}

	let materialized = materialize(db, meta, slots, values)?;
	let outcome = {
		let mut view = TxView {
			slot: ctx.slot,
			tx_id: tx.id,
			read_version: tx.read_version,
			ctx: &mut *ctx,
		};
		let raws = &materialized.raws;
		match class.update(&mut view, id, conflict_checked, |_old, new| {
			// The fresh record copied every slot; own the copied string
			// and blob handles, except where the update overwrites them.
			for (slot, property) in meta.properties.iter().enumerate() {
				let overwritten = slots.iter().position(|&s| s == slot);
				match property.ptype {
					PropertyType::String | PropertyType::ReferenceArray => match overwritten {
						Some(pos) => new.set_prop(slot, raws[pos]),
						None => {
							let copied = new.prop(slot);
							if copied != NULL_HANDLE {
								if property.ptype == PropertyType::String {
									db.strings.inc_ref(copied);
								} else {
									db.blobs.inc_ref(copied);
								}
							}
						}
					},
					_ => {
						if let Some(pos) = overwritten {
							new.set_prop(slot, raws[pos]);
						}
					}
				}
			}
			Ok(())
		}) {
			Ok(outcome) => outcome,
			Err(e) => {
				materialized.release(db);
				return Err(e);
			}
		}
	};

	ctx.affected_objects.push(AffectedObject {
		class_index,
		id,
		handle: outcome.handle,
		prev_head: outcome.prev_head,
		prev_version: outcome.prev_version,
		chain_pos: 0,
	});
	record_wire_op(ctx, log, id, values, outcome.prev_version)?;
	count_op(tx, ctx);

	let old_record = class.record(outcome.prev_head);
	let new_record = class.record(outcome.handle);
	emit_reference_deltas(db, tx, ctx, meta, Some(&old_record), Some(&new_record), id)?;
	for &index_pos in &meta.indexes {
		let old_key = db.key_of_record(db.model.index(index_pos), meta, &old_record);
		add_index_entry(db, tx, ctx, meta, index_pos, &new_record, id, Some(old_key))?;
	}
	Ok(())
}

fn apply_delete(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	log: usize,
	class_index: usize,
	id: i64,
) -> Result<()> {
	let meta = db.model.class(class_index);
	let class = db.leaf_class(class_index)?;
	if class_id_of(id) != meta.desc.id {
		return Err(Error::InvalidChangeset("operation id names a different class"));
	}

	let outcome = {
		let mut view = TxView {
			slot: ctx.slot,
			tx_id: tx.id,
			read_version: tx.read_version,
			ctx: &mut *ctx,
		};
		class.delete(&mut view, id)?
	};

	ctx.affected_objects.push(AffectedObject {
		class_index,
		id,
		handle: outcome.handle,
		prev_head: outcome.prev_head,
		prev_version: outcome.prev_version,
		chain_pos: 0,
	});
	record_wire_op(ctx, log, id, &[], outcome.prev_version)?;
	count_op(tx, ctx);

	let old_record = class.record(outcome.prev_head);
	emit_reference_deltas(db, tx, ctx, meta, Some(&old_record), None, id)?;
	Ok(())
}

/// Streams the operation into the per-log writer, writes the previous
/// version into its header and flags the prior operation on the same
/// object with the more-ops bit.
fn record_wire_op(
	ctx: &mut TransactionContext,
	log: usize,
	id: i64,
	values: &[PropertyValue],
	prev_version: u64,
) -> Result<()> {
	let pos = ctx.writers[log].add_operation(id, values, false)?;
	ctx.writers[log].patch_operation_header(pos, prev_version << 1);
	if let Some((prev_log, prev_pos, prev_prev)) = ctx.last_op_by_object.insert(id, (log, pos, prev_version)) {
		ctx.writers[prev_log].patch_operation_header(prev_pos, (prev_prev << 1) | OP_HEADER_MORE_OPS);
	}
	Ok(())
}

fn count_op(tx: &Arc<Transaction>, ctx: &mut TransactionContext) {
	tx.operation_count.fetch_add(1, Ordering::Relaxed);
	ctx.operation_count += 1;
}

/// Appends inverse-reference deltas for the tracked references that
/// differ between the old and new version of the object.
fn emit_reference_deltas(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	meta: &ClassMeta,
	old: Option<&ObjectRecord>,
	new: Option<&ObjectRecord>,
	id: i64,
) -> Result<()> {
	for &slot in &meta.reference_slots {
		let property = meta.property(slot);
		let Some(reference) = &property.reference else {
			continue;
		};
		if !reference.tracked {
			continue;
		}
		let old_targets = old.map(|r| reference_targets(db, property.ptype, r, slot)).unwrap_or_default();
		let new_targets = new.map(|r| reference_targets(db, property.ptype, r, slot)).unwrap_or_default();

		for target in multiset_difference(&old_targets, &new_targets) {
			let delta = {
				let mut view = TxView {
					slot: ctx.slot,
					tx_id: tx.id,
					read_version: tx.read_version,
					ctx: &mut *ctx,
				};
				db.inv_refs.modify(&mut view, target, property.id, id, true)?
			};
			ctx.affected_inv_refs.push(AffectedInvRef {
				target_id: target,
				prop_id: property.id,
				delta,
				chain_pos: 0,
			});
		}
		for target in multiset_difference(&new_targets, &old_targets) {
			let delta = {
				let mut view = TxView {
					slot: ctx.slot,
					tx_id: tx.id,
					read_version: tx.read_version,
					ctx: &mut *ctx,
				};
				db.inv_refs.modify(&mut view, target, property.id, id, false)?
			};
			ctx.affected_inv_refs.push(AffectedInvRef {
				target_id: target,
				prop_id: property.id,
				delta,
				chain_pos: 0,
			});
		}
	}
	Ok(())
}

/// Non-null targets a record's reference slot points at. Most slots
/// hold zero or one target, so the set stays inline.
pub(crate) fn reference_targets(
	db: &Database,
	ptype: PropertyType,
	record: &ObjectRecord,
	slot: usize,
) -> SmallVec<[i64; 4]> {
	match ptype {
		PropertyType::Reference => {
			let target = record.prop_i64(slot);
			if target != 0 { SmallVec::from_slice(&[target]) } else { SmallVec::new() }
		}
		PropertyType::ReferenceArray => {
			let handle = record.prop(slot);
			if handle == NULL_HANDLE {
				SmallVec::new()
			} else {
				SmallVec::from_vec(decode_ref_array(unsafe { db.blobs.get(handle) }))
			}
		}
		_ => SmallVec::new(),
	}
}

/// Elements of `a` not matched one-for-one by `b`.
fn multiset_difference(a: &[i64], b: &[i64]) -> Vec<i64> {
	let mut remaining = b.to_vec();
	let mut out = Vec::new();
	for &value in a {
		if let Some(pos) = remaining.iter().position(|&r| r == value) {
			remaining.swap_remove(pos);
		} else {
			out.push(value);
		}
	}
	out
}

/// Checks key locks, range locks and uniqueness, then adds the entry if
/// the new key differs from the old one.
#[allow(clippy::too_many_arguments)]
fn add_index_entry(
	db: &Arc<Database>,
	tx: &Arc<Transaction>,
	ctx: &mut TransactionContext,
	meta: &ClassMeta,
	index_pos: usize,
	record: &ObjectRecord,
	id: i64,
	old_key: Option<Vec<u8>>,
) -> Result<()> {
	let index_meta = db.model.index(index_pos);
	let key = db.key_of_record(index_meta, meta, record);
	if old_key.as_deref() == Some(key.as_slice()) {
		return Ok(());
	}
	match &db.indexes[index_pos] {
		IndexRuntime::Hash {
			index,
			locker,
		} => {
			if locker.is_key_in_conflict(ctx.slot, tx.read_version, key_hash(&key)) {
				return Err(Error::Conflict);
			}
			if index_meta.desc.unique {
				db.check_unique(index_meta, &index.lookup(&key), &key, tx.id, tx.read_version, id)?;
			}
			if index.insert_entry(&key, id)? {
				ctx.inserted_entries.push(IndexEntryRef {
					index_pos,
					key,
					id,
				});
			}
		}
		IndexRuntime::Sorted {
			index,
		} => {
			if index.is_key_in_conflict(ctx.slot, tx.read_version, &key) {
				return Err(Error::Conflict);
			}
			if index_meta.desc.unique {
				db.check_unique(index_meta, &index.lookup(&key), &key, tx.id, tx.read_version, id)?;
			}
			if index.insert_entry(&key, id) {
				ctx.inserted_entries.push(IndexEntryRef {
					index_pos,
					key,
					id,
				});
			}
		}
	}
	Ok(())
}

struct Materialized {
	raws: Vec<u64>,
	strings: Vec<Handle>,
	blobs: Vec<Handle>,
}

impl Materialized {
	fn release(&self, db: &Database) {
		for &handle in &self.strings {
			db.strings.dec_ref(handle);
		}
		for &handle in &self.blobs {
			db.blobs.dec_ref(handle);
		}
	}
}

/// Turns wire values into property slot words, allocating string and
/// blob storage. On a later failure the caller releases the allocations.
fn materialize(db: &Database, meta: &ClassMeta, slots: &[usize], values: &[PropertyValue]) -> Result<Materialized> {
	let mut out = Materialized {
		raws: Vec::with_capacity(values.len()),
		strings: Vec::new(),
		blobs: Vec::new(),
	};
	let release_on_err = |out: &Materialized, e: Error| -> Error {
		out.release(db);
		e
	};
	for (&slot, value) in slots.iter().zip(values.iter()) {
		let ptype = meta.property(slot).ptype;
		let raw = match (value, ptype) {
			(PropertyValue::Bool(v), PropertyType::Bool) => *v as u64,
			(PropertyValue::Int(v), PropertyType::Int) => *v as i64 as u64,
			(PropertyValue::Long(v), PropertyType::Long) => *v as u64,
			(PropertyValue::Double(v), PropertyType::Double) => v.to_bits(),
			(PropertyValue::DateTime(v), PropertyType::DateTime) => *v as u64,
			(PropertyValue::Reference(v), PropertyType::Reference) => *v as u64,
			(PropertyValue::String(StringValue::Null), PropertyType::String)
			| (PropertyValue::String(StringValue::Undefined), PropertyType::String) => NULL_HANDLE,
			(PropertyValue::String(StringValue::Value(s)), PropertyType::String) => {
				let handle = db.strings.add(s).map_err(|e| release_on_err(&out, e))?;
				out.strings.push(handle);
				handle
			}
			(PropertyValue::ReferenceArray(ids), PropertyType::ReferenceArray) => {
				if ids.is_empty() {
					NULL_HANDLE
				} else {
					let handle = db
						.blobs
						.add(&encode_ref_array(ids))
						.map_err(|e| release_on_err(&out, e))?;
					out.blobs.push(handle);
					handle
				}
			}
			_ => {
				return Err(release_on_err(
					&out,
					Error::InvalidChangeset("operation value type differs from model"),
				));
			}
		};
		out.raws.push(raw);
	}
	Ok(out)
}

pub(crate) fn encode_ref_array(ids: &[i64]) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + ids.len() * 8);
	out.extend_from_slice(&(ids.len() as i32).to_le_bytes());
	for id in ids {
		out.extend_from_slice(&id.to_le_bytes());
	}
	out
}

pub(crate) fn decode_ref_array(bytes: &[u8]) -> Vec<i64> {
	if bytes.len() < 4 {
		return Vec::new();
	}
	let count = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).max(0) as usize;
	let mut out = Vec::with_capacity(count);
	for i in 0..count {
		let start = 4 + i * 8;
		let Some(chunk) = bytes.get(start..start + 8) else {
			break;
		};
		let mut raw = [0u8; 8];
		raw.copy_from_slice(chunk);
		out.push(i64::from_le_bytes(raw));
	}
	out
}
