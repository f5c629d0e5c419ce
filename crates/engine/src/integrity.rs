// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Reference integrity validation and delete propagation.
//!
//! Runs at commit time on a commit worker. Every reference written by the
//! transaction is checked against the final state: target class exists,
//! is accepted by the descriptor, and the object exists, with one
//! re-check to ride out a racing overwrite. Deletes then propagate
//! through the
//! inverse-reference map and, for untracked references, through scans of
//! the declaring classes, until the cascade closure is reached.

use std::{
	cmp::Ordering as CmpOrdering,
	collections::{BTreeSet, HashSet},
	sync::Arc,
};

use velox_catalog::{DeleteTargetAction, class_id_of};
use velox_core::{Error, Result};
use velox_wire_format::PropertyValue;

use crate::{
	apply,
	database::Database,
	store::Visible,
	txn::{
		context::{TransactionContext, TxView},
		transaction::Transaction,
	},
};

/// Untracked-reference deletes route ids through a bounded fast set;
/// past this size the scan stops pre-filtering and checks every
/// reference against full membership (all references are treated as
/// potentially affected).
const DELETED_SET_LIMIT: usize = 1024;

/// Bounded pre-filter over the deleted ids; membership checks always
/// fall back to the exact set once the bound is exceeded.
struct DeletedSet {
	fast: Vec<i64>,
	overflowed: bool,
}

impl DeletedSet {
	fn new() -> Self {
		Self {
			fast: Vec::new(),
			overflowed: false,
		}
	}

	fn record(&mut self, id: i64) {
		if self.fast.len() < DELETED_SET_LIMIT {
			self.fast.push(id);
		} else {
			self.overflowed = true;
		}
	}

	/// False only when the id is definitely not deleted.
	fn may_contain(&self, id: i64) -> bool {
		self.overflowed || self.fast.contains(&id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PropOp {
	/// The deleted object the reference points at.
	inverse: i64,
	/// The referencing object the propagation rewrites.
	direct: i64,
	prop_id: i32,
	action: DeleteTargetAction,
	many: bool,
}

fn action_rank(action: DeleteTargetAction) -> u8 {
	match action {
		DeleteTargetAction::SetToNull => 0,
		DeleteTargetAction::CascadeDelete => 1,
		DeleteTargetAction::PreventDelete => 2,
	}
}

/// Strict weak order by (inverse, action, property, direct).
fn cmp_propagated(a: &PropOp, b: &PropOp) -> CmpOrdering {
	a.inverse
		.cmp(&b.inverse)
		.then(action_rank(a.action).cmp(&action_rank(b.action)))
		.then(a.prop_id.cmp(&b.prop_id))
		.then(a.direct.cmp(&b.direct))
}

/// Strict weak order by (direct, property + action, inverse); groups
/// operations for the same originating object.
fn cmp_inverse(a: &PropOp, b: &PropOp) -> CmpOrdering {
	a.direct
		.cmp(&b.direct)
		.then(a.prop_id.cmp(&b.prop_id))
		.then(action_rank(a.action).cmp(&action_rank(b.action)))
		.then(a.inverse.cmp(&b.inverse))
}

/// The head context carries the whole group commit: merged members'
/// writes were restamped under the head's transaction id, so one pass
/// validates everything, including references between members.
pub(crate) fn validate_and_propagate(db: &Arc<Database>, head: &Arc<Transaction>) -> Result<()> {
	let mut guard = head.context.lock();
	let ctx = guard.as_mut().ok_or(Error::Critical("commit head transaction has no context"))?;

	validate_references(db, head, ctx)?;
	propagate_deletes(db, head, ctx)?;
	revalidate_ranges(db, head, ctx)
}

/// Commit-time repeatable-read check for range scans: visits every range
/// the transaction registered and fails on committed changes inside it.
fn revalidate_ranges(db: &Arc<Database>, head: &Arc<Transaction>, ctx: &TransactionContext) -> Result<()> {
	for lock in &ctx.range_read_locks {
		let crate::index::IndexRuntime::Sorted {
			index,
		} = &db.indexes[lock.index_pos]
		else {
			continue;
		};
		let Some((low, low_inclusive, high, high_inclusive)) = index.ranges.bounds(lock.range_id) else {
			continue;
		};
		if db.range_contents_changed(
			lock.index_pos,
			low.as_deref(),
			low_inclusive,
			high.as_deref(),
			high_inclusive,
			head.read_version,
		) {
			return Err(Error::Conflict);
		}
	}
	Ok(())
}

/// Checks every reference the transaction wrote.
fn validate_references(db: &Arc<Database>, head: &Arc<Transaction>, ctx: &mut TransactionContext) -> Result<()> {
	for affected_pos in 0..ctx.affected_objects.len() {
		let (class_index, handle) = {
			let affected = &ctx.affected_objects[affected_pos];
			(affected.class_index, affected.handle)
		};
		let meta = db.model.class(class_index);
		let class = db.leaf_class(class_index)?;
		let record = class.record(handle);
		if record.is_tombstone() {
			continue;
		}
		for &slot in &meta.reference_slots {
			let property = meta.property(slot);
			let Some(reference) = &property.reference else {
				continue;
			};
			let accepted_index = db
				.model
				.class_index_of(reference.target_class)
				.ok_or(Error::Critical("reference descriptor targets unknown class"))?;
			let accepted = db.model.class(accepted_index);
			for target in apply::reference_targets(db, property.ptype, &record, slot) {
				let Some(target_index) = db.model.class_index_of(class_id_of(target)) else {
					return Err(Error::InvalidReferencedClass(target));
				};
				let target_meta = db.model.class(target_index);
				if target_meta.desc.is_abstract || !accepted.accepts(target_meta) {
					return Err(Error::InvalidReferencedClass(target));
				}
				let target_class = db.leaf_class(target_index)?;
				let mut state = target_class.get_visible(target, head.read_version, head.id);
				if !matches!(state, Visible::Record(_)) {
					// A racing overwrite can hide the object for one
					// probe; only a confirmed absence is a violation.
					state = target_class.get_visible(target, head.read_version, head.id);
				}
				if !matches!(state, Visible::Record(_)) {
					return Err(Error::UnknownReference(target));
				}
			}
		}
	}
	Ok(())
}

/// Propagates deletes until the cascade closure is reached.
fn propagate_deletes(db: &Arc<Database>, head: &Arc<Transaction>, ctx: &mut TransactionContext) -> Result<()> {
	let mut deleted: HashSet<i64> = HashSet::new();
	let mut pending: Vec<i64> = Vec::new();
	for affected in &ctx.affected_objects {
		let class = db.leaf_class(affected.class_index)?;
		if class.record(affected.handle).is_tombstone() && deleted.insert(affected.id) {
			pending.push(affected.id);
		}
	}

	let mut deleted_set = DeletedSet::new();
	while !pending.is_empty() {
		let batch = std::mem::take(&mut pending);
		let mut ops: Vec<PropOp> = Vec::new();
		let mut scan_classes: BTreeSet<usize> = BTreeSet::new();

		for &id in &batch {
			head.check_cancellation()?;
			let meta = db.class_meta_of_object(id)?;
			for inverse_prop in &meta.tracked_inverse_props {
				let referencing = {
					let mut view = TxView {
						slot: ctx.slot,
						tx_id: head.id,
						read_version: head.read_version,
						ctx: &mut *ctx,
					};
					db.inv_refs.get_references_validated(&mut view, id, inverse_prop.prop_id)?
				};
				for direct in referencing {
					if !deleted.contains(&direct) {
						ops.push(PropOp {
							inverse: id,
							direct,
							prop_id: inverse_prop.prop_id,
							action: inverse_prop.on_delete,
							many: inverse_prop.many,
						});
					}
				}
			}
			if !meta.on_delete_scan_classes.is_empty() {
				scan_classes.extend(meta.on_delete_scan_classes.iter().copied());
				deleted_set.record(id);
			}
		}

		// Untracked references: scan the declaring classes. With an
		// overflowed set every reference is checked against the full
		// membership.
		for scan_class in scan_classes {
			let meta = db.model.class(scan_class);
			let class = db.leaf_class(scan_class)?;
			for range in class.storage.split_scan_range(usize::MAX, 1) {
				for handle in range.handles() {
					head.check_cancellation()?;
					let (used, stamp) = class.storage.is_buffer_used(handle);
					if !used {
						continue;
					}
					let record = class.record(handle);
					let id = record.id();
					let (used_after, stamp_after) = class.storage.is_buffer_used(handle);
					if !used_after || stamp_after != stamp {
						continue;
					}
					if !class.is_current_visible(id, handle, head.read_version, head.id)
						|| deleted.contains(&id)
					{
						continue;
					}
					for &slot in &meta.untracked_reference_slots {
						let property = meta.property(slot);
						let Some(reference) = &property.reference else {
							continue;
						};
						for target in
							apply::reference_targets(db, property.ptype, &record, slot)
						{
							if deleted_set.may_contain(target) && deleted.contains(&target) {
								ops.push(PropOp {
									inverse: target,
									direct: id,
									prop_id: property.id,
									action: reference.on_delete,
									many: property.ptype
										== velox_catalog::PropertyType::ReferenceArray,
								});
							}
						}
					}
				}
			}
		}

		ops.sort_by(cmp_propagated);
		ops.dedup();
		ops.sort_by(cmp_inverse);

		let mut i = 0;
		while i < ops.len() {
			let mut j = i;
			while j < ops.len() && ops[j].direct == ops[i].direct {
				j += 1;
			}
			let group = &ops[i..j];
			let direct = group[0].direct;

			if group.iter().any(|op| op.action == DeleteTargetAction::PreventDelete) {
				return Err(Error::ReferencedDelete);
			}
			if group.iter().any(|op| op.action == DeleteTargetAction::CascadeDelete) {
				if deleted.insert(direct) {
					apply::apply_generated_delete(db, head, ctx, direct)?;
					pending.push(direct);
				}
			} else {
				let changes = set_to_null_changes(db, head, &deleted, direct, group)?;
				if !changes.is_empty() {
					apply::apply_generated_update(db, head, ctx, direct, &changes)?;
				}
			}
			i = j;
		}
	}
	Ok(())
}

/// Builds the update clearing references into the deleted set, from the
/// referencing object's currently visible state.
fn set_to_null_changes(
	db: &Arc<Database>,
	head: &Arc<Transaction>,
	deleted: &HashSet<i64>,
	direct: i64,
	group: &[PropOp],
) -> Result<Vec<(i32, PropertyValue)>> {
	let meta = db.class_meta_of_object(direct)?;
	let class = db.leaf_class(meta.index)?;
	let Visible::Record(handle) = class.get_visible(direct, head.read_version, head.id) else {
		return Ok(Vec::new());
	};
	let record = class.record(handle);

	let mut changes = Vec::new();
	let mut seen_props = HashSet::new();
	for op in group {
		if !seen_props.insert(op.prop_id) {
			continue;
		}
		let Some(slot) = meta.slot_of(op.prop_id) else {
			continue;
		};
		if op.many {
			let current = apply::reference_targets(
				db,
				velox_catalog::PropertyType::ReferenceArray,
				&record,
				slot,
			);
			let filtered: Vec<i64> =
				current.iter().copied().filter(|target| !deleted.contains(target)).collect();
			if filtered.len() != current.len() {
				changes.push((op.prop_id, PropertyValue::ReferenceArray(filtered)));
			}
		} else {
			let current = record.prop_i64(slot);
			// Only clear while it still points at a deleted object.
			if current != 0 && deleted.contains(&current) {
				changes.push((op.prop_id, PropertyValue::Reference(0)));
			}
		}
	}
	Ok(changes)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn op(inverse: i64, direct: i64, prop_id: i32, action: DeleteTargetAction) -> PropOp {
		PropOp {
			inverse,
			direct,
			prop_id,
			action,
			many: false,
		}
	}

	#[test]
	fn propagated_order_groups_by_deleted_object() {
		let mut ops = vec![
			op(2, 9, 1, DeleteTargetAction::SetToNull),
			op(1, 8, 2, DeleteTargetAction::SetToNull),
			op(1, 7, 1, DeleteTargetAction::CascadeDelete),
			op(1, 7, 1, DeleteTargetAction::SetToNull),
		];
		ops.sort_by(cmp_propagated);
		assert_eq!(ops[0], op(1, 7, 1, DeleteTargetAction::SetToNull));
		assert_eq!(ops[1], op(1, 8, 2, DeleteTargetAction::SetToNull));
		assert_eq!(ops[2], op(1, 7, 1, DeleteTargetAction::CascadeDelete));
		assert_eq!(ops[3], op(2, 9, 1, DeleteTargetAction::SetToNull));
	}

	#[test]
	fn inverse_order_groups_by_referencing_object() {
		let mut ops = vec![
			op(5, 2, 1, DeleteTargetAction::SetToNull),
			op(4, 1, 2, DeleteTargetAction::SetToNull),
			op(6, 1, 1, DeleteTargetAction::SetToNull),
			op(3, 1, 1, DeleteTargetAction::SetToNull),
		];
		ops.sort_by(cmp_inverse);
		assert_eq!(ops[0], op(3, 1, 1, DeleteTargetAction::SetToNull));
		assert_eq!(ops[1], op(6, 1, 1, DeleteTargetAction::SetToNull));
		assert_eq!(ops[2], op(4, 1, 2, DeleteTargetAction::SetToNull));
		assert_eq!(ops[3], op(5, 2, 1, DeleteTargetAction::SetToNull));
	}

	#[test]
	fn orders_are_deterministic_on_ties() {
		let a = op(1, 1, 1, DeleteTargetAction::SetToNull);
		let b = op(1, 1, 1, DeleteTargetAction::SetToNull);
		assert_eq!(cmp_propagated(&a, &b), CmpOrdering::Equal);
		assert_eq!(cmp_inverse(&a, &b), CmpOrdering::Equal);
	}
}
