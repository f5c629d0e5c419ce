// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Canned data models.
//!
//! Class and property ids are stable so tests can hardcode object ids
//! (`make_id(class, n)`) and wire blocks against them.

use velox_catalog::{ClassBuilder, DeleteTargetAction, IndexBuilder, Model, ModelBuilder, PropertyType};

pub const ITEM_CLASS: u16 = 1;
pub const ITEM_VALUE: i32 = 10;
pub const ITEM_LABEL: i32 = 11;
pub const ITEM_VALUE_INDEX: u16 = 1;
pub const ITEM_LABEL_INDEX: u16 = 2;

/// One class with a long and a string property, a sorted index on the
/// long and a unique hash index on the string.
pub fn item_model() -> Model {
	ModelBuilder::new()
		.class(ClassBuilder::new(ITEM_CLASS, "item")
			.property(ITEM_VALUE, "value", PropertyType::Long)
			.property(ITEM_LABEL, "label", PropertyType::String))
		.index(IndexBuilder::sorted(ITEM_VALUE_INDEX, "item_by_value").on(ITEM_CLASS).key(ITEM_VALUE))
		.index(IndexBuilder::hash(ITEM_LABEL_INDEX, "item_by_label")
			.unique()
			.on(ITEM_CLASS)
			.key(ITEM_LABEL))
		.build()
		.expect("item model must resolve")
}

/// Same shape as [`item_model`] but without secondary indexes; used by
/// pipeline and GC tests that insert many objects with defaulted labels.
pub fn plain_model() -> Model {
	ModelBuilder::new()
		.class(ClassBuilder::new(ITEM_CLASS, "item")
			.property(ITEM_VALUE, "value", PropertyType::Long)
			.property(ITEM_LABEL, "label", PropertyType::String))
		.build()
		.expect("plain model must resolve")
}

pub const TARGET_CLASS: u16 = 3;
pub const TARGET_VALUE: i32 = 31;
pub const CASCADE_CLASS: u16 = 2;
pub const CASCADE_REF: i32 = 20;
pub const NULLING_CLASS: u16 = 4;
pub const NULLING_REFS: i32 = 40;
pub const PREVENT_CLASS: u16 = 5;
pub const PREVENT_REF: i32 = 50;
pub const SCAN_CLASS: u16 = 6;
pub const SCAN_REF: i32 = 60;

/// Reference-integrity model: a target class and referencing classes
/// covering cascade-delete, set-to-null on a many-cardinality array,
/// prevent-delete, and an untracked reference discovered by scan.
pub fn refs_model() -> Model {
	ModelBuilder::new()
		.class(ClassBuilder::new(TARGET_CLASS, "target").property(TARGET_VALUE, "value", PropertyType::Long))
		.class(ClassBuilder::new(CASCADE_CLASS, "cascading").reference(
			CASCADE_REF,
			"target",
			TARGET_CLASS,
			DeleteTargetAction::CascadeDelete,
		))
		.class(ClassBuilder::new(NULLING_CLASS, "nulling").reference_array(
			NULLING_REFS,
			"targets",
			TARGET_CLASS,
			DeleteTargetAction::SetToNull,
		))
		.class(ClassBuilder::new(PREVENT_CLASS, "preventing").reference(
			PREVENT_REF,
			"target",
			TARGET_CLASS,
			DeleteTargetAction::PreventDelete,
		))
		.class(ClassBuilder::new(SCAN_CLASS, "scanning")
			.reference(SCAN_REF, "target", TARGET_CLASS, DeleteTargetAction::SetToNull)
			.untracked())
		.build()
		.expect("refs model must resolve")
}

pub const VEHICLE_CLASS: u16 = 7;
pub const VEHICLE_WHEELS: i32 = 70;
pub const CAR_CLASS: u16 = 8;
pub const CAR_DOORS: i32 = 80;
pub const TRUCK_CLASS: u16 = 9;
pub const TRUCK_PAYLOAD: i32 = 90;

/// Abstract base with two concrete subclasses, indexed on the base
/// property.
pub fn inheritance_model() -> Model {
	ModelBuilder::new()
		.class(ClassBuilder::new(VEHICLE_CLASS, "vehicle")
			.abstract_class()
			.property(VEHICLE_WHEELS, "wheels", PropertyType::Long))
		.class(ClassBuilder::new(CAR_CLASS, "car")
			.base(VEHICLE_CLASS)
			.property(CAR_DOORS, "doors", PropertyType::Long))
		.class(ClassBuilder::new(TRUCK_CLASS, "truck")
			.base(VEHICLE_CLASS)
			.property(TRUCK_PAYLOAD, "payload", PropertyType::Long))
		.build()
		.expect("inheritance model must resolve")
}
