// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! 8-byte hash bucket with an embedded lock bit.
//!
//! The top bit is the lock: 1 means unlocked, 0 means taken. Valid
//! handles always have the top bit clear, so the handle can be rewritten
//! while the lock is held without disturbing lock state. Every hash map
//! bucket in the engine shares this layout.

use std::{
	hint,
	sync::atomic::{AtomicU64, Ordering},
	thread,
};

use crate::{Handle, NULL_HANDLE};

const UNLOCKED_BIT: u64 = 1 << 63;

pub struct Bucket(AtomicU64);

impl Bucket {
	pub const fn new() -> Self {
		Self(AtomicU64::new(UNLOCKED_BIT))
	}

	/// Lock-free read of the stored handle. Callers that act on the
	/// result must revalidate under the lock.
	pub fn read_handle(&self) -> Handle {
		self.0.load(Ordering::Acquire) & !UNLOCKED_BIT
	}

	pub fn lock(&self) -> BucketGuard<'_> {
		let mut spins = 0u32;
		loop {
			let current = self.0.load(Ordering::Relaxed);
			if current & UNLOCKED_BIT != 0
				&& self.0
					.compare_exchange_weak(
						current,
						current & !UNLOCKED_BIT,
						Ordering::Acquire,
						Ordering::Relaxed,
					)
					.is_ok()
			{
				return BucketGuard {
					bucket: self,
				};
			}
			spins += 1;
			if spins < 128 {
				hint::spin_loop();
			} else {
				thread::yield_now();
			}
		}
	}
}

impl Default for Bucket {
	fn default() -> Self {
		Self::new()
	}
}

pub struct BucketGuard<'a> {
	bucket: &'a Bucket,
}

impl BucketGuard<'_> {
	pub fn handle(&self) -> Handle {
		// The lock bit is zero while held, no mask needed.
		self.bucket.0.load(Ordering::Relaxed)
	}

	pub fn set_handle(&self, handle: Handle) {
		debug_assert_eq!(handle & UNLOCKED_BIT, 0);
		self.bucket.0.store(handle, Ordering::Release);
	}

	pub fn is_empty(&self) -> bool {
		self.handle() == NULL_HANDLE
	}
}

impl Drop for BucketGuard<'_> {
	fn drop(&mut self) {
		self.bucket.0.fetch_or(UNLOCKED_BIT, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn handle_survives_lock_cycle() {
		let bucket = Bucket::new();
		{
			let guard = bucket.lock();
			assert!(guard.is_empty());
			guard.set_handle(0x42);
		}
		assert_eq!(bucket.read_handle(), 0x42);
		let guard = bucket.lock();
		assert_eq!(guard.handle(), 0x42);
	}

	#[test]
	fn contended_increments_do_not_lose_updates() {
		let bucket = Arc::new(Bucket::new());
		let threads: Vec<_> = (0..4)
			.map(|_| {
				let bucket = bucket.clone();
				std::thread::spawn(move || {
					for _ in 0..1000 {
						let guard = bucket.lock();
						guard.set_handle(guard.handle() + 1);
					}
				})
			})
			.collect();
		for t in threads {
			t.join().unwrap();
		}
		assert_eq!(bucket.read_handle(), 4000);
	}
}
