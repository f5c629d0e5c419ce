// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Read surface: typed object readers and parallel-friendly class scans.

use velox_catalog::{ClassMeta, PropertyType};
use velox_core::{Error, NULL_HANDLE, Result, Version};

use crate::{
	apply::decode_ref_array,
	database::Database,
	store::{ObjectRecord, ScanRange},
	txn::transaction::Transaction,
};

/// Typed view over one visible object version.
///
/// Valid while the transaction that produced it is alive: the garbage
/// collector never frees a version reachable from an active snapshot.
pub struct ObjectReader<'t> {
	pub(crate) db: &'t Database,
	pub(crate) tx: &'t Transaction,
	pub(crate) class: &'t ClassMeta,
	pub(crate) record: ObjectRecord,
}

impl std::fmt::Debug for ObjectReader<'_> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ObjectReader")
			.field("id", &self.id())
			.field("class_id", &self.class_id())
			.field("version", &self.version())
			.finish()
	}
}

impl ObjectReader<'_> {
	pub fn id(&self) -> i64 {
		self.record.id()
	}

	/// Commit version of this object version; the transaction id while
	/// the writing transaction (this one) is still uncommitted.
	pub fn version(&self) -> Version {
		self.record.version()
	}

	pub fn class_id(&self) -> u16 {
		self.class.desc.id
	}

	/// Snapshot the reader observes.
	pub fn snapshot_version(&self) -> Version {
		self.tx.read_version
	}

	pub fn get_bool(&self, property_id: i32) -> Result<bool> {
		Ok(self.raw(property_id, PropertyType::Bool)? != 0)
	}

	pub fn get_int(&self, property_id: i32) -> Result<i32> {
		Ok(self.raw(property_id, PropertyType::Int)? as i64 as i32)
	}

	pub fn get_long(&self, property_id: i32) -> Result<i64> {
		Ok(self.raw(property_id, PropertyType::Long)? as i64)
	}

	pub fn get_double(&self, property_id: i32) -> Result<f64> {
		Ok(f64::from_bits(self.raw(property_id, PropertyType::Double)?))
	}

	pub fn get_datetime(&self, property_id: i32) -> Result<i64> {
		Ok(self.raw(property_id, PropertyType::DateTime)? as i64)
	}

	pub fn get_string(&self, property_id: i32) -> Result<Option<String>> {
		let handle = self.raw(property_id, PropertyType::String)?;
		if handle == NULL_HANDLE {
			return Ok(None);
		}
		Ok(Some(unsafe { self.db.strings.get(handle) }.to_string()))
	}

	/// Referenced object id; 0 is a null reference.
	pub fn get_reference(&self, property_id: i32) -> Result<i64> {
		Ok(self.raw(property_id, PropertyType::Reference)? as i64)
	}

	pub fn get_reference_array(&self, property_id: i32) -> Result<Vec<i64>> {
		let handle = self.raw(property_id, PropertyType::ReferenceArray)?;
		if handle == NULL_HANDLE {
			return Ok(Vec::new());
		}
		Ok(decode_ref_array(unsafe { self.db.blobs.get(handle) }))
	}

	fn raw(&self, property_id: i32, expected: PropertyType) -> Result<u64> {
		let slot = self
			.class
			.slot_of(property_id)
			.ok_or(Error::InvalidArgument("property does not exist on the class"))?;
		if self.class.property(slot).ptype != expected {
			return Err(Error::InvalidArgument("property read with the wrong type"));
		}
		Ok(self.record.prop(slot))
	}
}

/// Iterates every object of a class (and its concrete descendants)
/// visible at the transaction snapshot.
pub struct ObjectScan<'t> {
	pub(crate) db: &'t Database,
	pub(crate) tx: &'t Transaction,
	/// Concrete class indexes left to visit.
	pub(crate) class_indexes: Vec<usize>,
	pub(crate) class_pos: usize,
	pub(crate) ranges: Vec<ScanRange>,
	pub(crate) range_pos: usize,
	pub(crate) handles: Vec<velox_core::Handle>,
	pub(crate) handle_pos: usize,
	pub(crate) visited: usize,
}

impl<'t> ObjectScan<'t> {
	const CANCEL_POLL_MASK: usize = 0x3FF;

	pub(crate) fn new(db: &'t Database, tx: &'t Transaction, class_indexes: Vec<usize>) -> Self {
		Self {
			db,
			tx,
			class_indexes,
			class_pos: 0,
			ranges: Vec::new(),
			range_pos: 0,
			handles: Vec::new(),
			handle_pos: 0,
			visited: 0,
		}
	}

	fn refill(&mut self) -> bool {
		loop {
			if self.handle_pos < self.handles.len() {
				return true;
			}
			if self.range_pos < self.ranges.len() {
				let range = &self.ranges[self.range_pos];
				let mut handles = Vec::with_capacity(range.len());
				handles.extend(range.handles());
				self.handles = handles;
				self.handle_pos = 0;
				self.range_pos += 1;
				continue;
			}
			if self.class_pos >= self.class_indexes.len() {
				return false;
			}
			let class_index = self.class_indexes[self.class_pos];
			self.class_pos += 1;
			if let Ok(class) = self.db.leaf_class(class_index) {
				self.ranges = class.storage.split_scan_range(usize::MAX, 1);
				self.range_pos = 0;
				self.handles = Vec::new();
				self.handle_pos = 0;
			}
		}
	}

	fn current_class_index(&self) -> usize {
		self.class_indexes[self.class_pos - 1]
	}
}

impl<'t> Iterator for ObjectScan<'t> {
	type Item = Result<ObjectReader<'t>>;

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if !self.refill() {
				return None;
			}
			let handle = self.handles[self.handle_pos];
			self.handle_pos += 1;

			self.visited += 1;
			if self.visited & Self::CANCEL_POLL_MASK == 0 && self.tx.is_cancel_requested() {
				return Some(Err(Error::TransactionCanceled));
			}

			let class_index = self.current_class_index();
			let Ok(class) = self.db.leaf_class(class_index) else {
				continue;
			};
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
			if !class.is_current_visible(id, handle, self.tx.read_version, self.tx.id) {
				continue;
			}
			return Some(Ok(ObjectReader {
				db: self.db,
				tx: self.tx,
				class: self.db.model.class(class_index),
				record,
			}));
		}
	}
}
