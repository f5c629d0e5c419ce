// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use crate::{
	Result,
	descriptor::{
		ClassDescriptor, DeleteTargetAction, IndexDescriptor, IndexKind, PropertyDescriptor, PropertyType,
		ReferenceDescriptor,
	},
	model::Model,
};

/// Fluent construction of a [`Model`].
pub struct ModelBuilder {
	classes: Vec<ClassDescriptor>,
	indexes: Vec<IndexDescriptor>,
}

impl ModelBuilder {
	pub fn new() -> Self {
		Self {
			classes: Vec::new(),
			indexes: Vec::new(),
		}
	}

	pub fn class(mut self, class: ClassBuilder) -> Self {
		self.classes.push(class.desc);
		self
	}

	pub fn index(mut self, index: IndexBuilder) -> Self {
		self.indexes.push(index.desc);
		self
	}

	pub fn build(self) -> Result<Model> {
		Model::resolve(self.classes, self.indexes)
	}
}

impl Default for ModelBuilder {
	fn default() -> Self {
		Self::new()
	}
}

pub struct ClassBuilder {
	desc: ClassDescriptor,
}

impl ClassBuilder {
	pub fn new(id: u16, name: &str) -> Self {
		Self {
			desc: ClassDescriptor {
				id,
				name: name.to_string(),
				is_abstract: false,
				base: None,
				properties: Vec::new(),
			},
		}
	}

	pub fn abstract_class(mut self) -> Self {
		self.desc.is_abstract = true;
		self
	}

	pub fn base(mut self, base_id: u16) -> Self {
		self.desc.base = Some(base_id);
		self
	}

	pub fn property(mut self, id: i32, name: &str, ptype: PropertyType) -> Self {
		debug_assert!(!ptype.is_reference());
		self.desc.properties.push(PropertyDescriptor {
			id,
			name: name.to_string(),
			ptype,
			reference: None,
		});
		self
	}

	pub fn reference(mut self, id: i32, name: &str, target_class: u16, on_delete: DeleteTargetAction) -> Self {
		self.desc.properties.push(PropertyDescriptor {
			id,
			name: name.to_string(),
			ptype: PropertyType::Reference,
			reference: Some(ReferenceDescriptor {
				target_class,
				on_delete,
				tracked: true,
			}),
		});
		self
	}

	pub fn reference_array(
		mut self,
		id: i32,
		name: &str,
		target_class: u16,
		on_delete: DeleteTargetAction,
	) -> Self {
		self.desc.properties.push(PropertyDescriptor {
			id,
			name: name.to_string(),
			ptype: PropertyType::ReferenceArray,
			reference: Some(ReferenceDescriptor {
				target_class,
				on_delete,
				tracked: true,
			}),
		});
		self
	}

	/// Marks the most recently added reference as untracked, so delete
	/// propagation discovers it by scan instead of the inverse map.
	pub fn untracked(mut self) -> Self {
		if let Some(property) = self.desc.properties.last_mut()
			&& let Some(reference) = property.reference.as_mut()
		{
			reference.tracked = false;
		}
		self
	}
}

pub struct IndexBuilder {
	desc: IndexDescriptor,
}

impl IndexBuilder {
	pub fn hash(id: u16, name: &str) -> Self {
		Self::new(id, name, IndexKind::Hash)
	}

	pub fn sorted(id: u16, name: &str) -> Self {
		Self::new(id, name, IndexKind::Sorted)
	}

	fn new(id: u16, name: &str, kind: IndexKind) -> Self {
		Self {
			desc: IndexDescriptor {
				id,
				name: name.to_string(),
				kind,
				unique: false,
				classes: Vec::new(),
				properties: Vec::new(),
			},
		}
	}

	pub fn unique(mut self) -> Self {
		self.desc.unique = true;
		self
	}

	pub fn on(mut self, class_id: u16) -> Self {
		self.desc.classes.push(class_id);
		self
	}

	pub fn key(mut self, property_id: i32) -> Self {
		self.desc.properties.push(property_id);
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inheritance_flattens_base_properties_first() {
		let model = ModelBuilder::new()
			.class(ClassBuilder::new(1, "vehicle")
				.abstract_class()
				.property(10, "wheels", PropertyType::Int))
			.class(ClassBuilder::new(2, "car").base(1).property(11, "doors", PropertyType::Int))
			.build()
			.unwrap();

		let car = model.class(model.class_index_of(2).unwrap());
		assert_eq!(car.property_count(), 2);
		assert_eq!(car.slot_of(10), Some(0));
		assert_eq!(car.slot_of(11), Some(1));
		assert_eq!(car.ancestors, vec![1, 0]);

		let vehicle = model.class(model.class_index_of(1).unwrap());
		assert_eq!(vehicle.descendants, vec![0, 1]);
		assert_eq!(vehicle.concrete_descendants, vec![1]);
	}

	#[test]
	fn untracked_reference_forces_scan_class() {
		let model = ModelBuilder::new()
			.class(ClassBuilder::new(1, "target").property(10, "x", PropertyType::Long))
			.class(ClassBuilder::new(2, "pointer")
				.reference(20, "t", 1, DeleteTargetAction::SetToNull)
				.untracked())
			.build()
			.unwrap();

		let target = model.class(model.class_index_of(1).unwrap());
		assert_eq!(target.on_delete_scan_classes, vec![1]);

		let tracked = ModelBuilder::new()
			.class(ClassBuilder::new(1, "target").property(10, "x", PropertyType::Long))
			.class(ClassBuilder::new(2, "pointer").reference(20, "t", 1, DeleteTargetAction::SetToNull))
			.build()
			.unwrap();
		assert!(tracked.class(0).on_delete_scan_classes.is_empty());
	}

	#[test]
	fn index_coverage_includes_subclasses() {
		let model = ModelBuilder::new()
			.class(ClassBuilder::new(1, "base").property(10, "x", PropertyType::Long))
			.class(ClassBuilder::new(2, "leaf").base(1))
			.index(IndexBuilder::sorted(1, "by_x").on(1).key(10))
			.build()
			.unwrap();

		let index = model.index(0);
		assert_eq!(index.classes.len(), 2);
		assert_eq!(index.key_types, vec![PropertyType::Long]);
	}

	#[test]
	fn invalid_models_are_rejected() {
		assert!(ModelBuilder::new()
			.class(ClassBuilder::new(1, "a"))
			.class(ClassBuilder::new(1, "b"))
			.build()
			.is_err());
		assert!(ModelBuilder::new()
			.class(ClassBuilder::new(1, "a").reference(10, "r", 9, DeleteTargetAction::SetToNull))
			.build()
			.is_err());
		assert!(ModelBuilder::new()
			.class(ClassBuilder::new(1, "a"))
			.index(IndexBuilder::hash(1, "empty").on(1))
			.build()
			.is_err());
	}
}
