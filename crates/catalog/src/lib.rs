// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub use builder::{ClassBuilder, IndexBuilder, ModelBuilder};
pub use descriptor::{
	ClassDescriptor, DeleteTargetAction, IndexDescriptor, IndexKind, Multiplicity, PropertyDescriptor,
	PropertyType, ReferenceDescriptor,
};
pub use ids::{class_id_of, counter_of, make_id};
pub use model::{ClassMeta, IndexMeta, InverseProp, Model};

mod builder;
mod descriptor;
mod ids;
mod model;

pub type Result<T> = std::result::Result<T, velox_core::Error>;
