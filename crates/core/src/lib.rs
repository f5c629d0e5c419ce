// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

pub use error::Error;
pub use memory::{BLOCK_SIZE, MemoryManager};
pub use version::{
	FIRST_TRAN_ID, Handle, LogSeqNum, MAX_COMMITTED_VERSION, MAX_KEY, NULL_HANDLE, TRAN_ID_END, Version,
	is_committed, is_tran_id,
};

pub mod blobs;
pub mod cpu;
mod error;
pub mod memory;
pub mod strings;
pub mod sync;
mod version;

pub type Result<T> = std::result::Result<T, Error>;
