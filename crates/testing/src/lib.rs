// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Test harnesses for the storage engine: canned data models, changeset
//! construction helpers and a recording persister.

pub use persister::RecordingPersister;

pub mod changeset;
pub mod model;
mod persister;

use std::sync::Arc;

use velox_catalog::Model;
use velox_engine::{StorageEngine, StorageEngineConfig};

/// Engine sized for tests, with a recording persister attached.
pub fn test_engine(model: Model) -> (StorageEngine, Arc<RecordingPersister>) {
	test_engine_with(model, test_config())
}

pub fn test_engine_with(model: Model, config: StorageEngineConfig) -> (StorageEngine, Arc<RecordingPersister>) {
	let persister = Arc::new(RecordingPersister::new());
	let engine = StorageEngine::new(model, config, persister.clone()).expect("failed to build test engine");
	(engine, persister)
}

pub fn test_config() -> StorageEngineConfig {
	StorageEngineConfig::default()
		.max_blocks(512)
		.commit_workers(2)
		.gc_workers(1)
		.context_pool_size(256)
		.rewind_retention(8)
}
