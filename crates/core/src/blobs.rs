// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Blob heap addressed by handle.
//!
//! Same layout discipline as the string pool: a four byte reference
//! count, a four byte length, then the raw payload. Reference-array
//! properties store their packed id lists here.

use std::sync::{Arc, atomic::Ordering};

use crate::{Handle, MemoryManager, Result, sync::atomic_u32};

const HEADER_SIZE: usize = 8;

pub struct BlobStorage {
	memory: Arc<MemoryManager>,
}

impl BlobStorage {
	pub fn new(memory: Arc<MemoryManager>) -> Self {
		Self {
			memory,
		}
	}

	pub fn add(&self, payload: &[u8]) -> Result<Handle> {
		let handle = self.memory.allocate(HEADER_SIZE + payload.len())?;
		let buffer = self.memory.buffer(handle);
		unsafe {
			(buffer as *mut u32).write(1);
			(buffer.add(4) as *mut u32).write(payload.len() as u32);
			std::ptr::copy_nonoverlapping(payload.as_ptr(), buffer.add(HEADER_SIZE), payload.len());
		}
		Ok(handle)
	}

	/// # Safety
	///
	/// The handle must name a live blob; the slice stays valid while the
	/// caller holds a count on it.
	pub unsafe fn get(&self, handle: Handle) -> &[u8] {
		let buffer = self.memory.buffer(handle);
		unsafe {
			let len = (buffer.add(4) as *const u32).read() as usize;
			std::slice::from_raw_parts(buffer.add(HEADER_SIZE), len)
		}
	}

	pub fn inc_ref(&self, handle: Handle) {
		let count = unsafe { atomic_u32(self.memory.buffer(handle)) };
		count.fetch_add(1, Ordering::Relaxed);
	}

	pub fn dec_ref(&self, handle: Handle) {
		let count = unsafe { atomic_u32(self.memory.buffer(handle)) };
		if count.fetch_sub(1, Ordering::Release) == 1 {
			std::sync::atomic::fence(Ordering::Acquire);
			self.memory.free(handle);
		}
	}
}
