// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! A value guarded by a [`ParallelResizeCounter`].
//!
//! Point operations hold the cheap sharded read side while they touch the
//! value; a bulk grow takes the exclusive side and may replace the value
//! wholesale. This is the access pattern of every resizable hash table in
//! the engine.

use std::{cell::UnsafeCell, ops::Deref};

use super::resize_counter::{CounterGuard, ExclusiveGuard, ParallelResizeCounter};

pub struct ResizeGuarded<T> {
	counter: ParallelResizeCounter,
	value: UnsafeCell<T>,
}

// Access to the inner value is always mediated by the counter: shared
// references only under a read guard, exclusive ones only under the
// drained exclusive guard.
unsafe impl<T: Send> Send for ResizeGuarded<T> {}
unsafe impl<T: Send + Sync> Sync for ResizeGuarded<T> {}

impl<T> ResizeGuarded<T> {
	pub fn new(value: T) -> Self {
		Self {
			counter: ParallelResizeCounter::new(),
			value: UnsafeCell::new(value),
		}
	}

	pub fn read(&self) -> ReadGuard<'_, T> {
		let guard = self.counter.enter();
		ReadGuard {
			value: unsafe { &*self.value.get() },
			_guard: guard,
		}
	}

	pub fn write(&self) -> WriteGuard<'_, T> {
		let guard = self.counter.exclusive();
		WriteGuard {
			value: self.value.get(),
			_guard: guard,
		}
	}
}

pub struct ReadGuard<'a, T> {
	value: &'a T,
	_guard: CounterGuard<'a>,
}

impl<T> Deref for ReadGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		self.value
	}
}

pub struct WriteGuard<'a, T> {
	value: *mut T,
	_guard: ExclusiveGuard<'a>,
}

impl<T> Deref for WriteGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.value }
	}
}

impl<T> std::ops::DerefMut for WriteGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.value }
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn writers_replace_while_readers_rotate() {
		let guarded = Arc::new(ResizeGuarded::new(vec![0u64; 4]));
		let readers: Vec<_> = (0..3)
			.map(|_| {
				let guarded = guarded.clone();
				std::thread::spawn(move || {
					for _ in 0..200 {
						let table = guarded.read();
						// Tables only ever grow.
						assert!(table.len() >= 4);
					}
				})
			})
			.collect();
		for grow in 1..10 {
			let mut table = guarded.write();
			*table = vec![0u64; 4 << grow];
		}
		for r in readers {
			r.join().unwrap();
		}
	}
}
