// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Per-class object buffer allocator.
//!
//! 256 KiB blocks from the shared slab allocator are carved into
//! equally-sized record buffers. Every CPU owns a current bump block and a
//! bounded free list; overflow spills to a shared pool. Buffer state is a
//! seqlock-style storage version at offset 0: odd means in use, and a
//! changed value tells a scanner the buffer was recycled under it.

use std::sync::{Arc, atomic::Ordering};

use parking_lot::Mutex;
use velox_core::{
	BLOCK_SIZE, Handle, MemoryManager, NULL_HANDLE, Result,
	cpu::{self, CacheAligned},
	sync::atomic_u64,
};

/// Free buffers cached per CPU before spilling to the shared pool.
const PER_CORE_FREE_CAP: usize = 1024;

struct CpuArea {
	/// Current bump block, `NULL_HANDLE` when none.
	block: Handle,
	bump: u32,
	free: Vec<Handle>,
}

pub(crate) struct ObjectStorage {
	memory: Arc<MemoryManager>,
	buffer_size: u32,
	per_block: u32,
	areas: Box<[CacheAligned<Mutex<CpuArea>>]>,
	shared_free: Mutex<Vec<Handle>>,
	sealed: Mutex<Vec<Handle>>,
}

impl ObjectStorage {
	pub(crate) fn new(memory: Arc<MemoryManager>, buffer_size: usize) -> Self {
		debug_assert!(buffer_size % 8 == 0 && buffer_size <= BLOCK_SIZE);
		Self {
			memory,
			buffer_size: buffer_size as u32,
			per_block: (BLOCK_SIZE / buffer_size) as u32,
			areas: (0..cpu::core_count())
				.map(|_| {
					CacheAligned::new(Mutex::new(CpuArea {
						block: NULL_HANDLE,
						bump: 0,
						free: Vec::new(),
					}))
				})
				.collect(),
			shared_free: Mutex::new(Vec::new()),
			sealed: Mutex::new(Vec::new()),
		}
	}

	pub(crate) fn buffer_size(&self) -> usize {
		self.buffer_size as usize
	}

	/// Returns an unmarked buffer; the caller initializes the record and
	/// then calls [`ObjectStorage::mark_used`].
	pub(crate) fn allocate(&self) -> Result<Handle> {
		let mut area = self.areas[cpu::current_core_of(self.areas.len())].lock();
		if let Some(handle) = area.free.pop() {
			return Ok(handle);
		}
		if let Some(handle) = self.shared_free.lock().pop() {
			return Ok(handle);
		}
		if area.block == NULL_HANDLE || area.bump >= self.per_block {
			if area.block != NULL_HANDLE {
				self.sealed.lock().push(area.block);
			}
			let block = self.memory.allocate(BLOCK_SIZE)?;
			// Storage versions start even (free) for the scanner.
			unsafe { std::ptr::write_bytes(self.memory.buffer(block), 0, BLOCK_SIZE) };
			area.block = block;
			area.bump = 0;
		}
		let handle = area.block | (area.bump * self.buffer_size) as u64;
		area.bump += 1;
		Ok(handle)
	}

	/// Toggles the storage version odd. Payload stores must happen
	/// before; the release ordering publishes them.
	pub(crate) fn mark_used(&self, handle: Handle) {
		let version = unsafe { atomic_u64(self.memory.buffer(handle)) };
		debug_assert_eq!(version.load(Ordering::Relaxed) & 1, 0);
		version.fetch_add(1, Ordering::Release);
	}

	pub(crate) fn is_buffer_used(&self, handle: Handle) -> (bool, u64) {
		let version = unsafe { atomic_u64(self.memory.buffer(handle)) }.load(Ordering::Acquire);
		(version & 1 == 1, version)
	}

	/// Unmarks and recycles the buffer.
	pub(crate) fn free(&self, handle: Handle) {
		let version = unsafe { atomic_u64(self.memory.buffer(handle)) };
		debug_assert_eq!(version.load(Ordering::Relaxed) & 1, 1);
		version.fetch_add(1, Ordering::Release);
		self.recycle(handle);
	}

	/// Recycles a buffer that was never marked used (a failed write).
	pub(crate) fn free_unmarked(&self, handle: Handle) {
		let version = unsafe { atomic_u64(self.memory.buffer(handle)) };
		debug_assert_eq!(version.load(Ordering::Relaxed) & 1, 0);
		self.recycle(handle);
	}

	fn recycle(&self, handle: Handle) {
		let mut area = self.areas[cpu::current_core_of(self.areas.len())].lock();
		if area.free.len() < PER_CORE_FREE_CAP {
			area.free.push(handle);
		} else {
			self.shared_free.lock().push(handle);
		}
	}

	/// Splits the storage into scan ranges of roughly `items_per_range`
	/// buffers. The per-CPU in-progress blocks are collected under their
	/// locks and always form the trailing partial range.
	pub(crate) fn split_scan_range(&self, items_per_range: usize, workers: usize) -> Vec<ScanRange> {
		let items_per_range = items_per_range.max(1);
		let sealed = self.sealed.lock().clone();

		let mut ranges = Vec::with_capacity(workers.max(1) + 1);
		let mut current = Vec::new();
		let mut current_items = 0usize;
		for block in sealed {
			current.push((block, self.per_block));
			current_items += self.per_block as usize;
			if current_items >= items_per_range {
				ranges.push(ScanRange {
					segments: std::mem::take(&mut current),
					buffer_size: self.buffer_size,
				});
				current_items = 0;
			}
		}
		if !current.is_empty() {
			ranges.push(ScanRange {
				segments: current,
				buffer_size: self.buffer_size,
			});
		}

		let mut partial = Vec::new();
		for area in self.areas.iter() {
			let area = area.lock();
			if area.block != NULL_HANDLE && area.bump > 0 {
				partial.push((area.block, area.bump));
			}
		}
		if !partial.is_empty() {
			ranges.push(ScanRange {
				segments: partial,
				buffer_size: self.buffer_size,
			});
		}
		ranges
	}

	/// Like [`ObjectStorage::split_scan_range`] but the ranges own their
	/// blocks and return them to the slab allocator when dropped. Used
	/// while tearing the class down.
	pub(crate) fn split_disposable_scan_range(&self, items_per_range: usize) -> Vec<DisposableScanRange> {
		let items_per_range = items_per_range.max(1);
		let mut blocks: Vec<(Handle, u32)> =
			self.sealed.lock().drain(..).map(|b| (b, self.per_block)).collect();
		for area in self.areas.iter() {
			let mut area = area.lock();
			if area.block != NULL_HANDLE {
				blocks.push((area.block, area.bump));
				area.block = NULL_HANDLE;
				area.bump = 0;
			}
			area.free.clear();
		}
		self.shared_free.lock().clear();

		let mut ranges = Vec::new();
		let mut current = Vec::new();
		let mut current_items = 0usize;
		for (block, used) in blocks {
			current_items += used as usize;
			current.push((block, used));
			if current_items >= items_per_range {
				ranges.push(DisposableScanRange {
					memory: self.memory.clone(),
					segments: std::mem::take(&mut current),
					buffer_size: self.buffer_size,
				});
				current_items = 0;
			}
		}
		if !current.is_empty() {
			ranges.push(DisposableScanRange {
				memory: self.memory.clone(),
				segments: current,
				buffer_size: self.buffer_size,
			});
		}
		ranges
	}
}

/// Buffer handles of a storage slice; iteration yields candidate buffers
/// whose use state the scanner revalidates per buffer.
pub(crate) struct ScanRange {
	segments: Vec<(Handle, u32)>,
	buffer_size: u32,
}

impl ScanRange {
	pub(crate) fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
		let buffer_size = self.buffer_size as u64;
		self.segments
			.iter()
			.flat_map(move |&(block, count)| (0..count as u64).map(move |i| block | (i * buffer_size)))
	}

	pub(crate) fn len(&self) -> usize {
		self.segments.iter().map(|&(_, count)| count as usize).sum()
	}
}

/// Owns its blocks; frees them when dropped.
pub(crate) struct DisposableScanRange {
	memory: Arc<MemoryManager>,
	segments: Vec<(Handle, u32)>,
	buffer_size: u32,
}

impl DisposableScanRange {
	pub(crate) fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
		let buffer_size = self.buffer_size as u64;
		self.segments
			.iter()
			.flat_map(move |&(block, count)| (0..count as u64).map(move |i| block | (i * buffer_size)))
	}
}

impl Drop for DisposableScanRange {
	fn drop(&mut self) {
		for &(block, _) in &self.segments {
			self.memory.free(block);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn storage() -> ObjectStorage {
		ObjectStorage::new(Arc::new(MemoryManager::new(64)), 128)
	}

	#[test]
	fn mark_cycle_flips_use_bit() {
		let storage = storage();
		let handle = storage.allocate().unwrap();
		assert!(!storage.is_buffer_used(handle).0);
		storage.mark_used(handle);
		let (used, v1) = storage.is_buffer_used(handle);
		assert!(used);
		storage.free(handle);
		let (used, v2) = storage.is_buffer_used(handle);
		assert!(!used);
		assert_ne!(v1, v2);
	}

	#[test]
	fn freed_buffers_are_reused() {
		let storage = storage();
		let a = storage.allocate().unwrap();
		storage.mark_used(a);
		storage.free(a);
		let b = storage.allocate().unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn scan_ranges_cover_all_allocated_buffers() {
		let storage = storage();
		let per_block = (BLOCK_SIZE / 128) as usize;
		let total = per_block + 17;
		let mut allocated = Vec::new();
		for _ in 0..total {
			let handle = storage.allocate().unwrap();
			storage.mark_used(handle);
			allocated.push(handle);
		}
		let ranges = storage.split_scan_range(per_block, 4);
		let mut seen: Vec<Handle> = ranges.iter().flat_map(|r| r.handles()).collect();
		seen.sort_unstable();
		let mut expected = allocated.clone();
		expected.sort_unstable();
		assert_eq!(seen, expected);
		// Trailing range holds the in-progress blocks.
		assert!(ranges.last().unwrap().len() <= 17 + per_block - 1);
	}

	#[test]
	fn disposable_ranges_release_blocks() {
		let memory = Arc::new(MemoryManager::new(4));
		let storage = ObjectStorage::new(memory.clone(), BLOCK_SIZE / 2);
		for _ in 0..8 {
			let handle = storage.allocate().unwrap();
			storage.mark_used(handle);
		}
		let ranges = storage.split_disposable_scan_range(2);
		assert_eq!(ranges.iter().map(|r| r.handles().count()).sum::<usize>(), 8);
		drop(ranges);
		// All four blocks are reusable again.
		assert!(memory.allocate(BLOCK_SIZE).is_ok());
	}
}
