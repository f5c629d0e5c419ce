// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Stays signaled until reset; wakes every waiter.
pub struct ManualResetEvent {
	signaled: Mutex<bool>,
	condvar: Condvar,
}

impl ManualResetEvent {
	pub fn new(signaled: bool) -> Self {
		Self {
			signaled: Mutex::new(signaled),
			condvar: Condvar::new(),
		}
	}

	pub fn set(&self) {
		let mut signaled = self.signaled.lock();
		*signaled = true;
		self.condvar.notify_all();
	}

	pub fn reset(&self) {
		*self.signaled.lock() = false;
	}

	pub fn wait(&self) {
		let mut signaled = self.signaled.lock();
		while !*signaled {
			self.condvar.wait(&mut signaled);
		}
	}

	pub fn wait_for(&self, timeout: Duration) -> bool {
		let mut signaled = self.signaled.lock();
		if !*signaled {
			let _ = self.condvar.wait_for(&mut signaled, timeout);
		}
		*signaled
	}
}

/// Wakes exactly one waiter per signal.
pub struct AutoResetEvent {
	signaled: Mutex<bool>,
	condvar: Condvar,
}

impl AutoResetEvent {
	pub fn new(signaled: bool) -> Self {
		Self {
			signaled: Mutex::new(signaled),
			condvar: Condvar::new(),
		}
	}

	pub fn set(&self) {
		let mut signaled = self.signaled.lock();
		*signaled = true;
		self.condvar.notify_one();
	}

	pub fn wait(&self) {
		let mut signaled = self.signaled.lock();
		while !*signaled {
			self.condvar.wait(&mut signaled);
		}
		*signaled = false;
	}

	pub fn wait_for(&self, timeout: Duration) -> bool {
		let mut signaled = self.signaled.lock();
		if !*signaled {
			let _ = self.condvar.wait_for(&mut signaled, timeout);
		}
		let was = *signaled;
		*signaled = false;
		was
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use super::*;

	#[test]
	fn manual_reset_wakes_all() {
		let event = Arc::new(ManualResetEvent::new(false));
		let waiters: Vec<_> = (0..3)
			.map(|_| {
				let event = event.clone();
				std::thread::spawn(move || event.wait())
			})
			.collect();
		std::thread::sleep(Duration::from_millis(10));
		event.set();
		for w in waiters {
			w.join().unwrap();
		}
	}

	#[test]
	fn auto_reset_consumes_signal() {
		let event = AutoResetEvent::new(true);
		event.wait();
		assert!(!event.wait_for(Duration::from_millis(5)));
	}
}
