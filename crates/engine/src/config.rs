// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

/// Engine tuning knobs. The defaults fit a mid-size host; every setter is
/// a plain builder so tests can shrink the pools.
#[derive(Debug, Clone)]
pub struct StorageEngineConfig {
	/// Upper bound on allocator memory, in 256 KiB blocks.
	pub max_blocks: usize,
	/// Number of commit workers; worker zero additionally sweeps the
	/// per-CPU staging groups.
	pub commit_workers: usize,
	/// Number of garbage-collection workers.
	pub gc_workers: usize,
	/// Number of persistence logs a changeset may be partitioned across.
	pub log_count: u8,
	/// Most transactions merged into a single group commit.
	pub max_merged_transaction_count: usize,
	/// Most operations carried by one merged group commit.
	pub max_merged_operation_count: usize,
	/// Size of the transaction context pool; also bounds concurrent
	/// transactions.
	pub context_pool_size: usize,
	/// Number of recent commit versions the garbage collector retains
	/// beyond the oldest active reader, keeping them rewindable.
	pub rewind_retention: u64,
}

impl StorageEngineConfig {
	/// Operations below this count classify a transaction as small
	/// enough for per-CPU staging.
	pub fn small_tran_operation_limit(&self) -> usize {
		self.max_merged_operation_count / 8
	}

	pub fn max_blocks(mut self, value: usize) -> Self {
		self.max_blocks = value;
		self
	}

	pub fn commit_workers(mut self, value: usize) -> Self {
		self.commit_workers = value.max(1);
		self
	}

	pub fn gc_workers(mut self, value: usize) -> Self {
		self.gc_workers = value.max(1);
		self
	}

	pub fn log_count(mut self, value: u8) -> Self {
		self.log_count = value.max(1);
		self
	}

	pub fn max_merged_transaction_count(mut self, value: usize) -> Self {
		self.max_merged_transaction_count = value.max(1);
		self
	}

	pub fn max_merged_operation_count(mut self, value: usize) -> Self {
		self.max_merged_operation_count = value.max(8);
		self
	}

	pub fn context_pool_size(mut self, value: usize) -> Self {
		self.context_pool_size = value.clamp(1, u16::MAX as usize - 1);
		self
	}

	pub fn rewind_retention(mut self, value: u64) -> Self {
		self.rewind_retention = value;
		self
	}
}

impl Default for StorageEngineConfig {
	fn default() -> Self {
		Self {
			max_blocks: 32 * 1024,
			commit_workers: num_cpus::get().clamp(1, 8),
			gc_workers: num_cpus::get().clamp(1, 4),
			log_count: 1,
			max_merged_transaction_count: 64,
			max_merged_operation_count: 4096,
			context_pool_size: 4096,
			rewind_retention: 1024,
		}
	}
}
