// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use velox_catalog::PropertyType;
use velox_core::Error;

use crate::{
	Result,
	changeset::LogChangeset,
	value::{OpPos, OpType, PropertyValue, StringValue},
};

/// Sequential cursor over a log's buffer chain. Every read may span
/// buffer boundaries, which is what makes split operation headers work.
struct Cursor<'a> {
	buffers: &'a [Vec<u8>],
	buffer: usize,
	offset: usize,
}

impl<'a> Cursor<'a> {
	fn new(buffers: &'a [Vec<u8>]) -> Self {
		Self {
			buffers,
			buffer: 0,
			offset: 0,
		}
	}

	fn at_end(&self) -> bool {
		let mut buffer = self.buffer;
		let mut offset = self.offset;
		while buffer < self.buffers.len() {
			if offset < self.buffers[buffer].len() {
				return false;
			}
			buffer += 1;
			offset = 0;
		}
		true
	}

	fn position(&mut self) -> OpPos {
		while self.buffer < self.buffers.len() && self.offset >= self.buffers[self.buffer].len() {
			self.buffer += 1;
			self.offset = 0;
		}
		OpPos {
			buffer: self.buffer,
			offset: self.offset,
		}
	}

	fn read(&mut self, out: &mut [u8]) -> Result<()> {
		for byte in out.iter_mut() {
			while self.buffer < self.buffers.len() && self.offset >= self.buffers[self.buffer].len() {
				self.buffer += 1;
				self.offset = 0;
			}
			if self.buffer >= self.buffers.len() {
				return Err(Error::InvalidChangeset("changeset truncated"));
			}
			*byte = self.buffers[self.buffer][self.offset];
			self.offset += 1;
		}
		Ok(())
	}

	fn read_u8(&mut self) -> Result<u8> {
		let mut b = [0u8; 1];
		self.read(&mut b)?;
		Ok(b[0])
	}

	fn read_u16(&mut self) -> Result<u16> {
		let mut b = [0u8; 2];
		self.read(&mut b)?;
		Ok(u16::from_le_bytes(b))
	}

	fn read_i16(&mut self) -> Result<i16> {
		let mut b = [0u8; 2];
		self.read(&mut b)?;
		Ok(i16::from_le_bytes(b))
	}

	fn read_i32(&mut self) -> Result<i32> {
		let mut b = [0u8; 4];
		self.read(&mut b)?;
		Ok(i32::from_le_bytes(b))
	}

	fn read_u64(&mut self) -> Result<u64> {
		let mut b = [0u8; 8];
		self.read(&mut b)?;
		Ok(u64::from_le_bytes(b))
	}

	fn read_i64(&mut self) -> Result<i64> {
		let mut b = [0u8; 8];
		self.read(&mut b)?;
		Ok(i64::from_le_bytes(b))
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
	pub op_type: OpType,
	pub class_id: i16,
	pub operation_count: u32,
	/// Declared properties without the implicit id property 0.
	pub properties: Vec<(i32, PropertyType)>,
	pub rewind_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
	pub header: u64,
	/// Where the header lives, for write-back of the previous version.
	pub header_pos: OpPos,
	pub id: i64,
	pub values: Vec<PropertyValue>,
}

pub struct ChangesetReader<'a> {
	cursor: Cursor<'a>,
	string_table: Option<&'a [String]>,
	block: Option<BlockHeader>,
	remaining_ops: u32,
}

impl<'a> ChangesetReader<'a> {
	pub fn new(log: &'a LogChangeset) -> Self {
		Self {
			cursor: Cursor::new(&log.buffers),
			string_table: None,
			block: None,
			remaining_ops: 0,
		}
	}

	pub fn with_string_table(mut self, table: &'a [String]) -> Self {
		self.string_table = Some(table);
		self
	}

	/// Advances to the next block header, or `None` at end of stream.
	pub fn next_block(&mut self) -> Result<Option<BlockHeader>> {
		if self.remaining_ops > 0 {
			return Err(Error::InvalidChangeset("previous block not fully consumed"));
		}
		if self.cursor.at_end() {
			return Ok(None);
		}
		let op_type = OpType::from_wire(self.cursor.read_u8()?)?;
		if op_type == OpType::Rewind {
			let version = self.cursor.read_u64()?;
			if !self.cursor.at_end() {
				return Err(Error::InvalidChangeset("rewind must be the only block in a changeset"));
			}
			let block = BlockHeader {
				op_type,
				class_id: 0,
				operation_count: 0,
				properties: Vec::new(),
				rewind_version: Some(version),
			};
			self.block = Some(block.clone());
			return Ok(Some(block));
		}

		let class_id = self.cursor.read_i16()?;
		let operation_count = if op_type.narrow_count() {
			let count = self.cursor.read_u8()? as u32;
			let _pad = self.cursor.read_u8()?;
			count
		} else {
			self.cursor.read_u16()? as u32
		};
		let property_count = self.cursor.read_i16()?;
		if property_count < 1 {
			return Err(Error::InvalidChangeset("block property count below one"));
		}
		let mut properties = Vec::with_capacity(property_count as usize - 1);
		for _ in 1..property_count {
			let property_id = self.cursor.read_i32()?;
			let ptype = PropertyType::from_wire(self.cursor.read_u8()?)
				.ok_or(Error::InvalidChangeset("unknown property type"))?;
			properties.push((property_id, ptype));
		}
		if operation_count == 0 {
			return Err(Error::InvalidChangeset("block without operations"));
		}
		let block = BlockHeader {
			op_type,
			class_id,
			operation_count,
			properties,
			rewind_version: None,
		};
		self.remaining_ops = operation_count;
		self.block = Some(block.clone());
		Ok(Some(block))
	}

	/// Next operation of the current block, or `None` once the block's
	/// declared count is consumed.
	pub fn next_operation(&mut self) -> Result<Option<Operation>> {
		if self.remaining_ops == 0 {
			return Ok(None);
		}
		let block = self.block.as_ref().ok_or(Error::InvalidChangeset("operation outside of a block"))?;
		let types: Vec<PropertyType> = block.properties.iter().map(|&(_, t)| t).collect();
		let is_delete = block.op_type == OpType::Delete;

		let header_pos = self.cursor.position();
		let header = self.cursor.read_u64()?;
		let id = self.cursor.read_i64()?;
		let mut values = Vec::new();
		if !is_delete {
			values.reserve(types.len());
			for ptype in types {
				values.push(self.read_value(ptype)?);
			}
		}
		self.remaining_ops -= 1;
		Ok(Some(Operation {
			header,
			header_pos,
			id,
			values,
		}))
	}

	fn read_value(&mut self, ptype: PropertyType) -> Result<PropertyValue> {
		Ok(match ptype {
			PropertyType::Bool => PropertyValue::Bool(self.cursor.read_u8()? != 0),
			PropertyType::Int => PropertyValue::Int(self.cursor.read_i32()?),
			PropertyType::Long => PropertyValue::Long(self.cursor.read_i64()?),
			PropertyType::Double => PropertyValue::Double(f64::from_bits(self.cursor.read_u64()?)),
			PropertyType::DateTime => PropertyValue::DateTime(self.cursor.read_i64()?),
			PropertyType::Reference => PropertyValue::Reference(self.cursor.read_i64()?),
			PropertyType::ReferenceArray => {
				let count = self.cursor.read_i32()?;
				if count < 0 {
					return Err(Error::InvalidChangeset("negative reference array length"));
				}
				let mut ids = Vec::with_capacity(count as usize);
				for _ in 0..count {
					ids.push(self.cursor.read_i64()?);
				}
				PropertyValue::ReferenceArray(ids)
			}
			PropertyType::String => PropertyValue::String(self.read_string()?),
		})
	}

	fn read_string(&mut self) -> Result<StringValue> {
		let prefix = self.cursor.read_u8()?;
		let length = if prefix & 0xC0 == 0xC0 {
			(prefix & 0x3F) as i32
		} else if prefix == 0x80 {
			let length = self.cursor.read_i32()?;
			if length < 0 {
				return Err(Error::InvalidChangeset("negative string length"));
			}
			length
		} else if prefix == 0 {
			let defined = self.cursor.read_u8()?;
			return Ok(if defined != 0 { StringValue::Null } else { StringValue::Undefined });
		} else {
			return Err(Error::InvalidChangeset("invalid string length prefix"));
		};

		let table_index = self.cursor.read_i32()?;
		if table_index >= 0 {
			let table =
				self.string_table.ok_or(Error::InvalidChangeset("string table reference without table"))?;
			let value = table
				.get(table_index as usize)
				.ok_or(Error::InvalidChangeset("string table index out of range"))?;
			return Ok(StringValue::Value(value.clone()));
		}

		let mut units = Vec::with_capacity(length as usize);
		for _ in 0..length {
			units.push(self.cursor.read_u16()?);
		}
		let value = String::from_utf16(&units).map_err(|_| Error::InvalidChangeset("invalid utf-16 string"))?;
		Ok(StringValue::Value(value))
	}
}
