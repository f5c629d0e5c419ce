// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Changeset wire format.
//!
//! A changeset is a stream of little-endian blocks, partitioned across
//! one or more persistence-log buffer chains. Values may span buffer
//! boundaries; the reader reassembles them, including operation headers
//! split across buffers.

pub use changeset::{ChangeSet, LogChangeset, SERIALIZATION_VERSION};
pub use reader::{BlockHeader, ChangesetReader, Operation};
pub use value::{OP_HEADER_MORE_OPS, OpPos, OpType, PropertyValue, StringValue, prev_version_of};
pub use writer::ChangesetWriter;

mod changeset;
mod reader;
mod value;
mod writer;

pub type Result<T> = std::result::Result<T, velox_core::Error>;
