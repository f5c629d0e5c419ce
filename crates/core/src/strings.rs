// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Reference-counted string pool.
//!
//! Strings are stored in slab buffers addressed by handle. The first four
//! bytes carry the reference count, the next four the byte length,
//! followed by the UTF-8 payload. Multiple object versions that carry the
//! same string property share one buffer through the count.

use std::sync::{Arc, atomic::Ordering};

use crate::{Handle, MemoryManager, Result, sync::atomic_u32};

const HEADER_SIZE: usize = 8;

pub struct StringStorage {
	memory: Arc<MemoryManager>,
}

impl StringStorage {
	pub fn new(memory: Arc<MemoryManager>) -> Self {
		Self {
			memory,
		}
	}

	/// Stores a new string with a reference count of one.
	pub fn add(&self, value: &str) -> Result<Handle> {
		let bytes = value.as_bytes();
		let handle = self.memory.allocate(HEADER_SIZE + bytes.len())?;
		let buffer = self.memory.buffer(handle);
		unsafe {
			(buffer as *mut u32).write(1);
			(buffer.add(4) as *mut u32).write(bytes.len() as u32);
			std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.add(HEADER_SIZE), bytes.len());
		}
		Ok(handle)
	}

	/// # Safety
	///
	/// The handle must name a live string buffer; the reference stays
	/// valid while the caller holds a count on it.
	pub unsafe fn get(&self, handle: Handle) -> &str {
		let buffer = self.memory.buffer(handle);
		unsafe {
			let len = (buffer.add(4) as *const u32).read() as usize;
			std::str::from_utf8_unchecked(std::slice::from_raw_parts(buffer.add(HEADER_SIZE), len))
		}
	}

	pub fn inc_ref(&self, handle: Handle) {
		let count = unsafe { atomic_u32(self.memory.buffer(handle)) };
		count.fetch_add(1, Ordering::Relaxed);
	}

	/// Drops one reference, freeing the buffer when the last one goes.
	pub fn dec_ref(&self, handle: Handle) {
		let count = unsafe { atomic_u32(self.memory.buffer(handle)) };
		if count.fetch_sub(1, Ordering::Release) == 1 {
			std::sync::atomic::fence(Ordering::Acquire);
			self.memory.free(handle);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn storage() -> StringStorage {
		StringStorage::new(Arc::new(MemoryManager::new(16)))
	}

	#[test]
	fn round_trip() {
		let strings = storage();
		let handle = strings.add("hello velox").unwrap();
		assert_eq!(unsafe { strings.get(handle) }, "hello velox");
	}

	#[test]
	fn empty_string_is_distinct_from_null_handle() {
		let strings = storage();
		let handle = strings.add("").unwrap();
		assert_ne!(handle, crate::NULL_HANDLE);
		assert_eq!(unsafe { strings.get(handle) }, "");
	}

	#[test]
	fn last_ref_frees_the_buffer() {
		let strings = storage();
		let a = strings.add("shared").unwrap();
		strings.inc_ref(a);
		strings.dec_ref(a);
		// still alive, one count left
		assert_eq!(unsafe { strings.get(a) }, "shared");
		strings.dec_ref(a);
		let b = strings.add("shared2").unwrap();
		assert_eq!(a, b);
	}
}
