// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Engine-wide multi-reader lock.
//!
//! Every transaction holds the read side for its lifetime; schema changes
//! take the write side after draining. Read acquisition is reentrant per
//! thread. Releases are thread-agnostic for top-level acquisitions, which
//! lets a commit worker finish a transaction begun on a client thread;
//! reentrant acquisitions must be released on the acquiring thread.

use std::{
	cell::RefCell,
	collections::HashMap,
	sync::atomic::{AtomicBool, AtomicU64, Ordering},
	time::Duration,
};

use parking_lot::{Condvar, Mutex};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
	static READ_DEPTH: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct LockState {
	readers: usize,
	writer_active: bool,
	writers_waiting: usize,
}

pub struct EngineLock {
	id: u64,
	state: Mutex<LockState>,
	readers_gone: Condvar,
	can_read: Condvar,
	draining: AtomicBool,
}

impl EngineLock {
	pub fn new() -> Self {
		Self {
			id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
			state: Mutex::new(LockState::default()),
			readers_gone: Condvar::new(),
			can_read: Condvar::new(),
			draining: AtomicBool::new(false),
		}
	}

	pub fn enter_read(&self) {
		if self.enter_read_reentrant() {
			return;
		}
		let mut state = self.state.lock();
		while state.writer_active || state.writers_waiting > 0 {
			self.can_read.wait(&mut state);
		}
		state.readers += 1;
		drop(state);
		self.record_read();
	}

	/// Bounded-wait read acquisition; returns false on timeout.
	pub fn try_enter_read(&self, timeout: Duration) -> bool {
		if self.enter_read_reentrant() {
			return true;
		}
		let deadline = std::time::Instant::now() + timeout;
		let mut state = self.state.lock();
		while state.writer_active || state.writers_waiting > 0 {
			if self.can_read.wait_until(&mut state, deadline).timed_out() {
				return false;
			}
		}
		state.readers += 1;
		drop(state);
		self.record_read();
		true
	}

	pub fn exit_read(&self) {
		let top_level = READ_DEPTH.with(|depths| {
			let mut depths = depths.borrow_mut();
			match depths.get_mut(&self.id) {
				Some(depth) if *depth > 1 => {
					*depth -= 1;
					false
				}
				Some(_) => {
					depths.remove(&self.id);
					true
				}
				// Released on a thread other than the one that
				// acquired; always a top-level handle.
				None => true,
			}
		});
		if !top_level {
			return;
		}
		let mut state = self.state.lock();
		debug_assert!(state.readers > 0);
		state.readers -= 1;
		if state.readers == 0 {
			self.readers_gone.notify_all();
		}
	}

	/// Write side. When `drain` is set the lock advertises draining so
	/// that transaction paths can observe it and cancel.
	pub fn enter_write(&self, drain: bool) {
		if drain {
			self.draining.store(true, Ordering::SeqCst);
		}
		let mut state = self.state.lock();
		state.writers_waiting += 1;
		while state.writer_active || state.readers > 0 {
			self.readers_gone.wait(&mut state);
		}
		state.writers_waiting -= 1;
		state.writer_active = true;
	}

	pub fn exit_write(&self) {
		let mut state = self.state.lock();
		state.writer_active = false;
		drop(state);
		self.draining.store(false, Ordering::SeqCst);
		self.can_read.notify_all();
		self.readers_gone.notify_all();
	}

	pub fn is_draining(&self) -> bool {
		self.draining.load(Ordering::SeqCst)
	}

	pub fn active_readers(&self) -> usize {
		self.state.lock().readers
	}

	fn enter_read_reentrant(&self) -> bool {
		READ_DEPTH.with(|depths| {
			let mut depths = depths.borrow_mut();
			if let Some(depth) = depths.get_mut(&self.id) {
				*depth += 1;
				true
			} else {
				false
			}
		})
	}

	fn record_read(&self) {
		READ_DEPTH.with(|depths| {
			depths.borrow_mut().insert(self.id, 1);
		});
	}
}

impl Default for EngineLock {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn reads_are_reentrant() {
		let lock = EngineLock::new();
		lock.enter_read();
		lock.enter_read();
		lock.exit_read();
		assert_eq!(lock.active_readers(), 1);
		lock.exit_read();
		assert_eq!(lock.active_readers(), 0);
	}

	#[test]
	fn writer_excludes_readers() {
		let lock = Arc::new(EngineLock::new());
		lock.enter_write(true);
		assert!(lock.is_draining());
		assert!(!lock.try_enter_read(Duration::from_millis(10)));
		lock.exit_write();
		assert!(lock.try_enter_read(Duration::from_millis(10)));
		lock.exit_read();
	}

	#[test]
	fn read_released_on_another_thread() {
		let lock = Arc::new(EngineLock::new());
		lock.enter_read();
		let remote = lock.clone();
		std::thread::spawn(move || remote.exit_read()).join().unwrap();
		assert_eq!(lock.active_readers(), 0);
	}

	#[test]
	fn writer_waits_for_readers() {
		let lock = Arc::new(EngineLock::new());
		lock.enter_read();
		let writer = {
			let lock = lock.clone();
			std::thread::spawn(move || {
				lock.enter_write(false);
				lock.exit_write();
			})
		};
		std::thread::sleep(Duration::from_millis(20));
		lock.exit_read();
		writer.join().unwrap();
	}
}
