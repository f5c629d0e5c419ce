// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Resolved data model.
//!
//! [`Model::resolve`] turns raw descriptors into schema-indexed metadata:
//! flattened inheritance, property slot layouts, ancestor/descendant
//! closures, index coverage and the per-class scan sets used by delete
//! propagation of untracked references.

use std::collections::HashMap;

use velox_core::Error;

use crate::{
	Result,
	descriptor::{ClassDescriptor, DeleteTargetAction, IndexDescriptor, PropertyDescriptor, PropertyType},
};

/// A tracked reference property able to point at a class; deleting an
/// object of that class consults the inverse-reference map under this
/// property.
#[derive(Debug, Clone)]
pub struct InverseProp {
	pub prop_id: i32,
	pub on_delete: DeleteTargetAction,
	pub many: bool,
}

#[derive(Debug)]
pub struct ClassMeta {
	pub desc: ClassDescriptor,
	/// Position in the model's class array.
	pub index: usize,
	pub base: Option<usize>,
	/// Inherited properties first, declared ones after, in declaration
	/// order. Slot i of every object of this class holds property i.
	pub properties: Vec<PropertyDescriptor>,
	prop_slots: HashMap<i32, usize>,
	/// Self plus every base, nearest first.
	pub ancestors: Vec<usize>,
	/// Self plus every subclass, in model order.
	pub descendants: Vec<usize>,
	/// Non-abstract descendants, including self when concrete.
	pub concrete_descendants: Vec<usize>,
	/// Slots holding reference or reference-array properties.
	pub reference_slots: Vec<usize>,
	/// Reference slots whose inverse is not tracked.
	pub untracked_reference_slots: Vec<usize>,
	/// Indexes covering this class.
	pub indexes: Vec<usize>,
	/// Concrete classes that hold an untracked reference property able to
	/// point at objects of this class. Deleting here forces a scan there.
	pub on_delete_scan_classes: Vec<usize>,
	/// Tracked reference properties (from any class) able to point at
	/// objects of this class.
	pub tracked_inverse_props: Vec<InverseProp>,
}

impl ClassMeta {
	pub fn slot_of(&self, property_id: i32) -> Option<usize> {
		self.prop_slots.get(&property_id).copied()
	}

	pub fn property(&self, slot: usize) -> &PropertyDescriptor {
		&self.properties[slot]
	}

	pub fn property_count(&self) -> usize {
		self.properties.len()
	}

	/// Whether an object of class `other` may be stored in a reference
	/// whose target is this class.
	pub fn accepts(&self, other: &ClassMeta) -> bool {
		other.ancestors.contains(&self.index)
	}
}

#[derive(Debug)]
pub struct IndexMeta {
	pub desc: IndexDescriptor,
	pub index: usize,
	/// Concrete class indexes covered by the index.
	pub classes: Vec<usize>,
	pub key_types: Vec<PropertyType>,
}

#[derive(Debug)]
pub struct Model {
	classes: Vec<ClassMeta>,
	class_by_id: HashMap<u16, usize>,
	indexes: Vec<IndexMeta>,
	index_by_id: HashMap<u16, usize>,
}

impl Model {
	pub fn resolve(class_descs: Vec<ClassDescriptor>, index_descs: Vec<IndexDescriptor>) -> Result<Model> {
		let mut class_by_id = HashMap::new();
		for (index, desc) in class_descs.iter().enumerate() {
			if class_by_id.insert(desc.id, index).is_some() {
				return Err(Error::InvalidArgument("duplicate class id"));
			}
			if desc.id >= 0x8000 {
				return Err(Error::InvalidArgument("class id exceeds 15 bits"));
			}
		}

		let mut classes = Vec::with_capacity(class_descs.len());
		for (index, desc) in class_descs.iter().enumerate() {
			let base = match desc.base {
				Some(base_id) => Some(
					*class_by_id
						.get(&base_id)
						.ok_or(Error::InvalidArgument("unknown base class"))?,
				),
				None => None,
			};

			let mut ancestors = vec![index];
			let mut properties = Vec::new();
			let mut cursor = base;
			let mut hops = 0;
			let mut chain = Vec::new();
			while let Some(current) = cursor {
				hops += 1;
				if hops > class_descs.len() {
					return Err(Error::InvalidArgument("inheritance cycle"));
				}
				ancestors.push(current);
				chain.push(current);
				cursor = class_descs[current].base.and_then(|id| class_by_id.get(&id).copied());
			}
			for &ancestor in chain.iter().rev() {
				properties.extend(class_descs[ancestor].properties.iter().cloned());
			}
			properties.extend(desc.properties.iter().cloned());

			let mut prop_slots = HashMap::new();
			let mut reference_slots = Vec::new();
			let mut untracked_reference_slots = Vec::new();
			for (slot, property) in properties.iter().enumerate() {
				if prop_slots.insert(property.id, slot).is_some() {
					return Err(Error::InvalidArgument("duplicate property id in class"));
				}
				if property.ptype.is_reference() != property.reference.is_some() {
					return Err(Error::InvalidArgument(
						"reference descriptor does not match property type",
					));
				}
				if property.ptype.is_reference() {
					reference_slots.push(slot);
					if property.reference.as_ref().map(|r| !r.tracked).unwrap_or(false) {
						untracked_reference_slots.push(slot);
					}
				}
			}

			classes.push(ClassMeta {
				desc: desc.clone(),
				index,
				base,
				properties,
				prop_slots,
				ancestors,
				descendants: Vec::new(),
				concrete_descendants: Vec::new(),
				reference_slots,
				untracked_reference_slots,
				indexes: Vec::new(),
				on_delete_scan_classes: Vec::new(),
				tracked_inverse_props: Vec::new(),
			});
		}

		// Property ids are global: a property is declared exactly once
		// (inherited copies share the declaration).
		{
			let mut declared = HashMap::new();
			for desc in &class_descs {
				for property in &desc.properties {
					if declared.insert(property.id, desc.id).is_some() {
						return Err(Error::InvalidArgument(
							"property id declared by more than one class",
						));
					}
				}
			}
		}

		// Descendant closures from the ancestor lists.
		for index in 0..classes.len() {
			let ancestors = classes[index].ancestors.clone();
			for ancestor in ancestors {
				classes[ancestor].descendants.push(index);
				if !classes[index].desc.is_abstract {
					classes[ancestor].concrete_descendants.push(index);
				}
			}
		}

		// Validate reference targets now that ids are all known.
		for index in 0..classes.len() {
			for slot in classes[index].reference_slots.clone() {
				let property = &classes[index].properties[slot];
				let reference = property
					.reference
					.as_ref()
					.ok_or(Error::InvalidArgument("reference property without descriptor"))?;
				if !class_by_id.contains_key(&reference.target_class) {
					return Err(Error::InvalidArgument("reference targets unknown class"));
				}
			}
		}

		// Delete propagation metadata. Tracked references route through
		// the inverse map of the deleted object; untracked ones force a
		// scan of the declaring class.
		for index in 0..classes.len() {
			if classes[index].desc.is_abstract {
				continue;
			}
			for slot in classes[index].reference_slots.clone() {
				let property = classes[index].properties[slot].clone();
				let Some(reference) = property.reference.clone() else {
					continue;
				};
				let target = class_by_id[&reference.target_class];
				for affected in classes[target].descendants.clone() {
					if reference.tracked {
						let props = &mut classes[affected].tracked_inverse_props;
						if !props.iter().any(|p| p.prop_id == property.id) {
							props.push(InverseProp {
								prop_id: property.id,
								on_delete: reference.on_delete,
								many: property.ptype == PropertyType::ReferenceArray,
							});
						}
					} else {
						let scan = &mut classes[affected].on_delete_scan_classes;
						if !scan.contains(&index) {
							scan.push(index);
						}
					}
				}
			}
		}

		let mut indexes = Vec::with_capacity(index_descs.len());
		let mut index_by_id = HashMap::new();
		for (pos, desc) in index_descs.into_iter().enumerate() {
			if index_by_id.insert(desc.id, pos).is_some() {
				return Err(Error::InvalidArgument("duplicate index id"));
			}
			if desc.properties.is_empty() {
				return Err(Error::InvalidArgument("index without key properties"));
			}

			let mut covered = Vec::new();
			let mut key_types = Vec::new();
			for &class_id in &desc.classes {
				let class_index = *class_by_id
					.get(&class_id)
					.ok_or(Error::InvalidArgument("index covers unknown class"))?;
				for &concrete in &classes[class_index].concrete_descendants {
					if !covered.contains(&concrete) {
						covered.push(concrete);
					}
				}
				for (key_pos, &property_id) in desc.properties.iter().enumerate() {
					let slot = classes[class_index]
						.slot_of(property_id)
						.ok_or(Error::InvalidArgument("index key property missing on class"))?;
					let ptype = classes[class_index].properties[slot].ptype;
					if ptype == PropertyType::ReferenceArray {
						return Err(Error::InvalidArgument(
							"reference arrays cannot be indexed",
						));
					}
					match key_types.get(key_pos) {
						None => key_types.push(ptype),
						Some(&existing) if existing == ptype => {}
						Some(_) => {
							return Err(Error::InvalidArgument(
								"index key type differs between classes",
							));
						}
					}
				}
			}

			for &class_index in &covered {
				classes[class_index].indexes.push(pos);
			}
			indexes.push(IndexMeta {
				desc,
				index: pos,
				classes: covered,
				key_types,
			});
		}

		Ok(Model {
			classes,
			class_by_id,
			indexes,
			index_by_id,
		})
	}

	pub fn class_count(&self) -> usize {
		self.classes.len()
	}

	pub fn class(&self, index: usize) -> &ClassMeta {
		&self.classes[index]
	}

	pub fn classes(&self) -> impl Iterator<Item = &ClassMeta> {
		self.classes.iter()
	}

	pub fn class_index_of(&self, class_id: u16) -> Option<usize> {
		self.class_by_id.get(&class_id).copied()
	}

	pub fn index_count(&self) -> usize {
		self.indexes.len()
	}

	pub fn index(&self, index: usize) -> &IndexMeta {
		&self.indexes[index]
	}

	pub fn indexes(&self) -> impl Iterator<Item = &IndexMeta> {
		self.indexes.iter()
	}

	pub fn index_of_id(&self, index_id: u16) -> Option<usize> {
		self.index_by_id.get(&index_id).copied()
	}
}
