// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use velox_catalog::PropertyType;
use velox_core::Error;

use crate::{
	Result,
	changeset::LogChangeset,
	value::{OP_HEADER_MORE_OPS, OpPos, OpType, PropertyValue, StringValue},
};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
struct BlockState {
	op_type: OpType,
	class_id: i16,
	properties: Vec<(i32, PropertyType)>,
	count_pos: OpPos,
	count: usize,
}

/// Streams blocks into the buffer chain of a single persistence log.
///
/// Buffers are bounded; any field, including an operation header, may end
/// up split across two buffers and the reader reassembles it.
#[derive(Debug)]
pub struct ChangesetWriter {
	log_index: u8,
	max_buffer_size: usize,
	buffers: Vec<Vec<u8>>,
	block: Option<BlockState>,
	has_rewind: bool,
	has_blocks: bool,
}

impl ChangesetWriter {
	pub fn new(log_index: u8) -> Self {
		Self::with_buffer_size(log_index, DEFAULT_BUFFER_SIZE)
	}

	pub fn with_buffer_size(log_index: u8, max_buffer_size: usize) -> Self {
		Self {
			log_index,
			max_buffer_size: max_buffer_size.max(16),
			buffers: Vec::new(),
			block: None,
			has_rewind: false,
			has_blocks: false,
		}
	}

	pub fn log_index(&self) -> u8 {
		self.log_index
	}

	pub fn is_empty(&self) -> bool {
		!self.has_blocks && !self.has_rewind
	}

	pub fn begin_block(
		&mut self,
		op_type: OpType,
		class_id: i16,
		properties: &[(i32, PropertyType)],
	) -> Result<()> {
		if op_type == OpType::Rewind {
			return Err(Error::InvalidChangeset("rewind blocks use the rewind entry point"));
		}
		if self.has_rewind {
			return Err(Error::InvalidChangeset("rewind must be the only block in a changeset"));
		}
		self.finish_block()?;
		self.write_block_header(op_type, class_id, properties)
	}

	/// Appends an operation to the current block and returns the position
	/// of its header so the engine can write the previous version back
	/// once the object is versioned.
	pub fn add_operation(&mut self, id: i64, values: &[PropertyValue], more_ops: bool) -> Result<OpPos> {
		let block = self.block.as_ref().ok_or(Error::InvalidChangeset("operation outside of a block"))?;
		if block.count >= block.op_type.max_operations() {
			// Continue in a fresh block of the same shape.
			let (op_type, class_id, properties) =
				(block.op_type, block.class_id, block.properties.clone());
			self.finish_block()?;
			self.write_block_header(op_type, class_id, &properties)?;
		}

		let block = self.block.as_ref().ok_or(Error::Critical("changeset block state lost"))?;
		if block.op_type == OpType::Delete {
			if !values.is_empty() {
				return Err(Error::InvalidChangeset("delete operations carry no values"));
			}
		} else if values.len() != block.properties.len() {
			return Err(Error::InvalidChangeset("operation value count differs from block header"));
		}
		let types: Vec<PropertyType> = block.properties.iter().map(|&(_, t)| t).collect();

		let header_pos = self.position();
		let header = if more_ops { OP_HEADER_MORE_OPS } else { 0 };
		self.write_bytes(&header.to_le_bytes());
		self.write_bytes(&id.to_le_bytes());
		for (value, ptype) in values.iter().zip(types) {
			self.write_value(value, ptype)?;
		}
		if let Some(block) = self.block.as_mut() {
			block.count += 1;
		}
		Ok(header_pos)
	}

	/// A rewind changeset carries a single block with the target version.
	pub fn rewind(&mut self, version: u64) -> Result<()> {
		if self.has_blocks || self.has_rewind {
			return Err(Error::InvalidChangeset("rewind must be the only block in a changeset"));
		}
		self.write_bytes(&[OpType::Rewind as u8]);
		self.write_bytes(&version.to_le_bytes());
		self.has_rewind = true;
		Ok(())
	}

	pub fn finish(mut self) -> Result<LogChangeset> {
		self.finish_block()?;
		Ok(LogChangeset {
			log_index: self.log_index,
			buffers: std::mem::take(&mut self.buffers),
		})
	}

	/// Appends another writer's finished stream after this one's blocks.
	/// Positions handed out by either writer stay valid for the buffers
	/// they were issued against.
	pub fn merge_from(&mut self, mut other: ChangesetWriter) -> Result<()> {
		if other.has_rewind || self.has_rewind {
			return Err(Error::InvalidChangeset("rewind changesets cannot be merged"));
		}
		self.finish_block()?;
		other.finish_block()?;
		self.has_blocks |= other.has_blocks;
		self.buffers.append(&mut other.buffers);
		Ok(())
	}

	/// Writes the previous-version bits and more-ops flag back into an
	/// operation header reserved by [`ChangesetWriter::add_operation`].
	pub fn patch_operation_header(&mut self, pos: OpPos, header: u64) {
		self.patch(pos, &header.to_le_bytes());
	}

	/// Reads an operation header back, spanning buffers if needed.
	pub fn operation_header_at(&self, pos: OpPos) -> u64 {
		let mut bytes = [0u8; 8];
		let mut buffer = pos.buffer;
		let mut offset = pos.offset;
		for byte in bytes.iter_mut() {
			while offset >= self.buffers[buffer].len() {
				buffer += 1;
				offset = 0;
			}
			*byte = self.buffers[buffer][offset];
			offset += 1;
		}
		u64::from_le_bytes(bytes)
	}

	fn write_block_header(
		&mut self,
		op_type: OpType,
		class_id: i16,
		properties: &[(i32, PropertyType)],
	) -> Result<()> {
		self.write_bytes(&[op_type as u8]);
		self.write_bytes(&class_id.to_le_bytes());
		let count_pos = self.position();
		if op_type.narrow_count() {
			self.write_bytes(&[0u8, 0u8]);
		} else {
			self.write_bytes(&0u16.to_le_bytes());
		}
		let property_count = properties.len() as i16 + 1;
		self.write_bytes(&property_count.to_le_bytes());
		for &(property_id, ptype) in properties {
			self.write_bytes(&property_id.to_le_bytes());
			self.write_bytes(&[ptype as u8]);
		}
		self.block = Some(BlockState {
			op_type,
			class_id,
			properties: properties.to_vec(),
			count_pos,
			count: 0,
		});
		self.has_blocks = true;
		Ok(())
	}

	fn finish_block(&mut self) -> Result<()> {
		let Some(block) = self.block.take() else {
			return Ok(());
		};
		if block.count == 0 {
			return Err(Error::InvalidChangeset("block without operations"));
		}
		if block.op_type.narrow_count() {
			self.patch(block.count_pos, &[block.count as u8]);
		} else {
			self.patch(block.count_pos, &(block.count as u16).to_le_bytes());
		}
		Ok(())
	}

	fn write_value(&mut self, value: &PropertyValue, ptype: PropertyType) -> Result<()> {
		match (value, ptype) {
			(PropertyValue::Bool(v), PropertyType::Bool) => self.write_bytes(&[*v as u8]),
			(PropertyValue::Int(v), PropertyType::Int) => self.write_bytes(&v.to_le_bytes()),
			(PropertyValue::Long(v), PropertyType::Long) => self.write_bytes(&v.to_le_bytes()),
			(PropertyValue::Double(v), PropertyType::Double) => self.write_bytes(&v.to_bits().to_le_bytes()),
			(PropertyValue::DateTime(v), PropertyType::DateTime) => self.write_bytes(&v.to_le_bytes()),
			(PropertyValue::Reference(v), PropertyType::Reference) => self.write_bytes(&v.to_le_bytes()),
			(PropertyValue::ReferenceArray(ids), PropertyType::ReferenceArray) => {
				self.write_bytes(&(ids.len() as i32).to_le_bytes());
				for id in ids {
					self.write_bytes(&id.to_le_bytes());
				}
			}
			(PropertyValue::String(value), PropertyType::String) => self.write_string(value),
			_ => return Err(Error::InvalidChangeset("value type differs from block header")),
		}
		Ok(())
	}

	fn write_string(&mut self, value: &StringValue) {
		match value {
			StringValue::Undefined => self.write_bytes(&[0u8, 0u8]),
			StringValue::Null => self.write_bytes(&[0u8, 1u8]),
			StringValue::Value(s) => {
				let units: Vec<u16> = s.encode_utf16().collect();
				if units.len() <= 0x3F {
					self.write_bytes(&[0xC0 | units.len() as u8]);
				} else {
					self.write_bytes(&[0x80]);
					self.write_bytes(&(units.len() as i32).to_le_bytes());
				}
				// Inline string, no table entry.
				self.write_bytes(&(-1i32).to_le_bytes());
				for unit in units {
					self.write_bytes(&unit.to_le_bytes());
				}
			}
		}
	}

	fn write_bytes(&mut self, bytes: &[u8]) {
		for &byte in bytes {
			if self.buffers.last().map(|b| b.len() >= self.max_buffer_size).unwrap_or(true) {
				self.buffers.push(Vec::with_capacity(self.max_buffer_size));
			}
			if let Some(current) = self.buffers.last_mut() {
				current.push(byte);
			}
		}
	}

	/// Position of the next byte written, opening a fresh buffer if the
	/// current one is full.
	fn position(&mut self) -> OpPos {
		if self.buffers.last().map(|b| b.len() >= self.max_buffer_size).unwrap_or(true) {
			self.buffers.push(Vec::with_capacity(self.max_buffer_size));
		}
		OpPos {
			buffer: self.buffers.len() - 1,
			offset: self.buffers.last().map(Vec::len).unwrap_or(0),
		}
	}

	fn patch(&mut self, pos: OpPos, bytes: &[u8]) {
		let mut buffer = pos.buffer;
		let mut offset = pos.offset;
		for &byte in bytes {
			while offset >= self.buffers[buffer].len() {
				buffer += 1;
				offset = 0;
			}
			self.buffers[buffer][offset] = byte;
			offset += 1;
		}
	}
}
