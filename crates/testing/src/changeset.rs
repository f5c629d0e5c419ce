// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Changeset construction helpers.

use velox_catalog::PropertyType;
use velox_wire_format::{ChangeSet, ChangesetWriter, OpType, PropertyValue, StringValue};

/// Builds a single-log serialized changeset.
pub fn build(f: impl FnOnce(&mut ChangesetWriter) -> velox_core::Result<()>) -> Vec<u8> {
	let mut writer = ChangesetWriter::new(0);
	f(&mut writer).expect("changeset construction failed");
	let log = writer.finish().expect("changeset finish failed");
	ChangeSet {
		logs: vec![log],
	}
	.serialize()
}

/// Insert with a single long property.
pub fn insert_long(class_id: u16, property_id: i32, id: i64, value: i64) -> Vec<u8> {
	build(|w| {
		w.begin_block(OpType::Insert, class_id as i16, &[(property_id, PropertyType::Long)])?;
		w.add_operation(id, &[PropertyValue::Long(value)], false)?;
		Ok(())
	})
}

/// Update of a single long property.
pub fn update_long(class_id: u16, property_id: i32, id: i64, value: i64) -> Vec<u8> {
	build(|w| {
		w.begin_block(OpType::Update, class_id as i16, &[(property_id, PropertyType::Long)])?;
		w.add_operation(id, &[PropertyValue::Long(value)], false)?;
		Ok(())
	})
}

/// Insert with a single reference property.
pub fn insert_reference(class_id: u16, property_id: i32, id: i64, target: i64) -> Vec<u8> {
	build(|w| {
		w.begin_block(OpType::Insert, class_id as i16, &[(property_id, PropertyType::Reference)])?;
		w.add_operation(id, &[PropertyValue::Reference(target)], false)?;
		Ok(())
	})
}

/// Insert with a single reference-array property.
pub fn insert_reference_array(class_id: u16, property_id: i32, id: i64, targets: &[i64]) -> Vec<u8> {
	build(|w| {
		w.begin_block(OpType::Insert, class_id as i16, &[(property_id, PropertyType::ReferenceArray)])?;
		w.add_operation(id, &[PropertyValue::ReferenceArray(targets.to_vec())], false)?;
		Ok(())
	})
}

/// Insert with long + string properties.
pub fn insert_item(class_id: u16, value_prop: i32, label_prop: i32, id: i64, value: i64, label: StringValue) -> Vec<u8> {
	build(|w| {
		w.begin_block(
			OpType::Insert,
			class_id as i16,
			&[(value_prop, PropertyType::Long), (label_prop, PropertyType::String)],
		)?;
		w.add_operation(id, &[PropertyValue::Long(value), PropertyValue::String(label)], false)?;
		Ok(())
	})
}

pub fn delete(class_id: u16, id: i64) -> Vec<u8> {
	build(|w| {
		w.begin_block(OpType::Delete, class_id as i16, &[])?;
		w.add_operation(id, &[], false)?;
		Ok(())
	})
}
