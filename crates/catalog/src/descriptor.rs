// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

/// Property value types as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyType {
	Bool = 1,
	Int = 2,
	Long = 3,
	Double = 4,
	DateTime = 5,
	String = 6,
	Reference = 7,
	ReferenceArray = 8,
}

impl PropertyType {
	pub fn from_wire(value: u8) -> Option<Self> {
		Some(match value {
			1 => Self::Bool,
			2 => Self::Int,
			3 => Self::Long,
			4 => Self::Double,
			5 => Self::DateTime,
			6 => Self::String,
			7 => Self::Reference,
			8 => Self::ReferenceArray,
			_ => return None,
		})
	}

	pub fn is_reference(self) -> bool {
		matches!(self, Self::Reference | Self::ReferenceArray)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
	One,
	Many,
}

/// What happens to a referencing object when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteTargetAction {
	SetToNull,
	CascadeDelete,
	PreventDelete,
}

#[derive(Debug, Clone)]
pub struct ReferenceDescriptor {
	/// Class id the property accepts; subclasses of it are accepted too.
	pub target_class: u16,
	pub on_delete: DeleteTargetAction,
	/// Tracked references maintain an inverse-reference entry; untracked
	/// ones are discovered by class scan during delete propagation.
	pub tracked: bool,
}

#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
	pub id: i32,
	pub name: String,
	pub ptype: PropertyType,
	/// Present exactly when `ptype` is a reference type.
	pub reference: Option<ReferenceDescriptor>,
}

impl PropertyDescriptor {
	pub fn multiplicity(&self) -> Multiplicity {
		match self.ptype {
			PropertyType::ReferenceArray => Multiplicity::Many,
			_ => Multiplicity::One,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ClassDescriptor {
	pub id: u16,
	pub name: String,
	pub is_abstract: bool,
	/// Base class id; inherited properties precede declared ones in the
	/// flattened layout.
	pub base: Option<u16>,
	pub properties: Vec<PropertyDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
	Hash,
	Sorted,
}

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
	pub id: u16,
	pub name: String,
	pub kind: IndexKind,
	pub unique: bool,
	/// Classes the index covers; subclasses of a covered class are
	/// covered as well.
	pub classes: Vec<u16>,
	/// Property ids forming the key, in key order.
	pub properties: Vec<i32>,
}
